//! Handshake seams
//!
//! The relay does not implement key exchange or authentication itself. An SSH library
//! implements these two traits; the relay only decides when each runs and cleans up
//! after it.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::ClientParams;
use crate::error::SshError;
use crate::transport::{BoxStream, Transport};

/// Authorization result of the upstream handshake
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Permissions {
    /// Authentication method that succeeded ("publickey", "password", ...)
    pub auth_method: Option<String>,
    /// Options the server must enforce (e.g. `force-command`, `source-address`)
    #[serde(default)]
    pub critical_options: HashMap<String, String>,
    /// Free-form facts attached by the authentication callbacks
    #[serde(default)]
    pub extensions: HashMap<String, String>,
}

impl Permissions {
    pub fn with_method(method: impl Into<String>) -> Self {
        Self {
            auth_method: Some(method.into()),
            ..Default::default()
        }
    }

    pub fn with_extension(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.extensions.insert(key.into(), value.into());
        self
    }

    pub fn extension(&self, key: &str) -> Option<&str> {
        self.extensions.get(key).map(String::as_str)
    }

    pub fn critical_option(&self, key: &str) -> Option<&str> {
        self.critical_options.get(key).map(String::as_str)
    }
}

/// Result of a successful server-side handshake
pub struct Accepted {
    pub transport: Box<dyn Transport>,
    /// Authenticated user name
    pub user: String,
    pub permissions: Permissions,
}

impl std::fmt::Debug for Accepted {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Accepted")
            .field("user", &self.user)
            .field("permissions", &self.permissions)
            .finish_non_exhaustive()
    }
}

/// Server side of the SSH transport, facing the client.
///
/// Carries its own configuration (host keys, accepted auth methods).
#[async_trait]
pub trait ServerHandshake: Send + Sync {
    /// Check the server configuration before any byte is read from the client
    fn validate(&self) -> Result<(), SshError> {
        Ok(())
    }

    /// Key exchange and user authentication on `conn`.
    /// On error the connection must be dropped, not handed back.
    async fn accept(&self, conn: BoxStream) -> Result<Accepted, SshError>;
}

/// Client side of the SSH transport, facing the backend
#[async_trait]
pub trait ClientHandshake: Send + Sync {
    /// Key exchange and authentication against the backend at `addr`.
    ///
    /// Implementations verify the backend host key with `params.host_key.check(..)`.
    async fn connect(
        &self,
        addr: &str,
        conn: BoxStream,
        params: &ClientParams,
    ) -> Result<Box<dyn Transport>, SshError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_permissions_lookup() {
        let mut perms = Permissions::with_method("publickey").with_extension("backend", "db-1");
        perms
            .critical_options
            .insert("source-address".to_string(), "10.0.0.0/8".to_string());

        assert_eq!(perms.auth_method.as_deref(), Some("publickey"));
        assert_eq!(perms.extension("backend"), Some("db-1"));
        assert_eq!(perms.extension("missing"), None);
        assert_eq!(perms.critical_option("source-address"), Some("10.0.0.0/8"));
    }
}
