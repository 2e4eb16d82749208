//! Relay configuration and downstream handshake parameters

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::SshError;
use crate::known_hosts::HostKeyPolicy;

/// Relay tunables.
///
/// Every limit is off by default: handshakes and pumps block until the peer
/// delivers or the connection fails.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Deadline for each of the upstream and downstream handshakes
    #[serde(skip_serializing_if = "Option::is_none")]
    pub handshake_timeout_secs: Option<u64>,

    /// Longest a pump waits for the next packet before giving up
    #[serde(skip_serializing_if = "Option::is_none")]
    pub idle_timeout_secs: Option<u64>,

    /// Backend connect timeout, applied through `FixedRouter::with_config`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connect_timeout_secs: Option<u64>,
}

impl RelayConfig {
    pub fn from_json(json: &str) -> Result<Self, SshError> {
        let config: RelayConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, SshError> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|e| {
            SshError::Config(format!("failed to read {}: {}", path.display(), e))
        })?;
        Self::from_json(&json)
    }

    /// Zero is not a usable deadline; omit the field to disable it.
    pub fn validate(&self) -> Result<(), SshError> {
        for (name, value) in [
            ("handshake_timeout_secs", self.handshake_timeout_secs),
            ("idle_timeout_secs", self.idle_timeout_secs),
            ("connect_timeout_secs", self.connect_timeout_secs),
        ] {
            if value == Some(0) {
                return Err(SshError::Config(format!("{} must be greater than 0", name)));
            }
        }
        Ok(())
    }

    pub fn handshake_timeout(&self) -> Option<Duration> {
        self.handshake_timeout_secs.map(Duration::from_secs)
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        self.idle_timeout_secs.map(Duration::from_secs)
    }

    pub fn connect_timeout(&self) -> Option<Duration> {
        self.connect_timeout_secs.map(Duration::from_secs)
    }
}

/// Authentication material presented to the backend
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuthMethod {
    /// "none" method, for backends that accept it
    None,

    Password { password: String },

    Key {
        /// Path to private key file
        key_path: String,
        passphrase: Option<String>,
    },

    /// SSH agent authentication
    Agent,

    /// OpenSSH certificate authentication
    Certificate {
        key_path: String,
        /// Path to certificate file (*-cert.pub)
        cert_path: String,
        passphrase: Option<String>,
    },
}

impl AuthMethod {
    pub fn password(password: impl Into<String>) -> Self {
        Self::Password {
            password: password.into(),
        }
    }

    pub fn key(key_path: impl Into<String>, passphrase: Option<String>) -> Self {
        Self::Key {
            key_path: key_path.into(),
            passphrase,
        }
    }

    /// Method name as it appears in SSH_MSG_USERAUTH_REQUEST
    pub fn method_name(&self) -> &'static str {
        match self {
            AuthMethod::None => "none",
            AuthMethod::Password { .. } => "password",
            AuthMethod::Key { .. } | AuthMethod::Agent | AuthMethod::Certificate { .. } => {
                "publickey"
            }
        }
    }

    fn validate(&self) -> Result<(), SshError> {
        match self {
            AuthMethod::Password { password } if password.is_empty() => {
                Err(SshError::Config("password must not be empty".to_string()))
            }
            AuthMethod::Key { key_path, .. } if key_path.is_empty() => {
                Err(SshError::Config("key path must not be empty".to_string()))
            }
            AuthMethod::Certificate {
                key_path,
                cert_path,
                ..
            } if key_path.is_empty() || cert_path.is_empty() => Err(SshError::Config(
                "certificate auth needs both key and certificate paths".to_string(),
            )),
            _ => Ok(()),
        }
    }
}

/// Client-side handshake parameters returned by a router
#[derive(Debug, Clone)]
pub struct ClientParams {
    /// User to log in as on the backend
    pub user: String,
    pub auth: AuthMethod,
    pub host_key: HostKeyPolicy,
}

impl ClientParams {
    pub fn new(user: impl Into<String>, auth: AuthMethod, host_key: HostKeyPolicy) -> Self {
        Self {
            user: user.into(),
            auth,
            host_key,
        }
    }

    pub fn validate(&self) -> Result<(), SshError> {
        if self.user.is_empty() {
            return Err(SshError::Config("client user must not be empty".to_string()));
        }
        self.auth.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_relay_config_defaults_disable_deadlines() {
        let config = RelayConfig::from_json("{}").unwrap();
        assert!(config.handshake_timeout().is_none());
        assert!(config.idle_timeout().is_none());
        assert!(config.connect_timeout().is_none());
    }

    #[test]
    fn test_relay_config_rejects_zero() {
        let err = RelayConfig::from_json(r#"{"idle_timeout_secs": 0}"#).unwrap_err();
        assert!(matches!(err, SshError::Config(msg) if msg.contains("idle_timeout_secs")));
    }

    #[test]
    fn test_relay_config_load() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"handshake_timeout_secs": 10, "connect_timeout_secs": 3}}"#
        )
        .unwrap();

        let config = RelayConfig::load(file.path()).unwrap();
        assert_eq!(config.handshake_timeout(), Some(Duration::from_secs(10)));
        assert_eq!(config.connect_timeout(), Some(Duration::from_secs(3)));
        assert!(config.idle_timeout().is_none());
    }

    #[test]
    fn test_relay_config_load_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = RelayConfig::load(dir.path().join("relay.json")).unwrap_err();
        assert!(matches!(err, SshError::Config(_)));
    }

    #[test]
    fn test_auth_method_serde_tag() {
        let auth: AuthMethod =
            serde_json::from_str(r#"{"type": "password", "password": "hunter2"}"#).unwrap();
        assert_eq!(auth.method_name(), "password");

        let auth: AuthMethod = serde_json::from_str(r#"{"type": "agent"}"#).unwrap();
        assert_eq!(auth.method_name(), "publickey");
    }

    #[test]
    fn test_client_params_validate() {
        let params = ClientParams::new("git", AuthMethod::None, HostKeyPolicy::AcceptAny);
        assert!(params.validate().is_ok());

        let params = ClientParams::new("", AuthMethod::None, HostKeyPolicy::AcceptAny);
        assert!(params.validate().is_err());

        let params = ClientParams::new("git", AuthMethod::password(""), HostKeyPolicy::AcceptAny);
        assert!(params.validate().is_err());

        let params = ClientParams::new(
            "git",
            AuthMethod::key("~/.ssh/id_ed25519", None),
            HostKeyPolicy::AcceptAny,
        );
        assert!(params.validate().is_ok());
    }
}
