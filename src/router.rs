//! Backend selection

use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use crate::config::{ClientParams, RelayConfig};
use crate::error::SshError;
use crate::session::Session;
use crate::transport::BoxStream;

/// Where a session goes and how to log in there
pub struct Route {
    /// Backend address, used for host key checks and diagnostics
    pub addr: String,
    /// Connection already opened to `addr`. Owned by the relay from here on.
    pub conn: BoxStream,
    pub params: ClientParams,
}

impl std::fmt::Debug for Route {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Route")
            .field("addr", &self.addr)
            .field("user", &self.params.user)
            .finish_non_exhaustive()
    }
}

/// Routing policy. Called once per session, after the client authenticated and before
/// any backend handshake.
///
/// On error, any connection the router opened is its own to clean up.
#[async_trait]
pub trait Router: Send + Sync {
    async fn route(&self, upstream: &Session) -> Result<Route, SshError>;
}

/// Sends every session to the same backend over TCP
#[derive(Debug, Clone)]
pub struct FixedRouter {
    backend: String,
    params: ClientParams,
    connect_timeout: Option<Duration>,
    /// Log in to the backend as the upstream user instead of `params.user`
    forward_user: bool,
}

impl FixedRouter {
    pub fn new(backend: impl Into<String>, params: ClientParams) -> Self {
        Self {
            backend: backend.into(),
            params,
            connect_timeout: None,
            forward_user: false,
        }
    }

    pub fn connect_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Take the backend connect timeout from `config.connect_timeout_secs`
    pub fn with_config(mut self, config: &RelayConfig) -> Self {
        self.connect_timeout = config.connect_timeout();
        self
    }

    pub fn forward_user(mut self, forward: bool) -> Self {
        self.forward_user = forward;
        self
    }

    async fn connect(&self) -> Result<TcpStream, SshError> {
        let connect = TcpStream::connect(&self.backend);
        let stream = match self.connect_timeout {
            Some(limit) => tokio::time::timeout(limit, connect).await.map_err(|_| {
                SshError::Timeout(format!("connecting to {} took longer than {:?}", self.backend, limit))
            })?,
            None => connect.await,
        }
        .map_err(|e| SshError::ConnectionFailed(format!("{}: {}", self.backend, e)))?;

        // Packets are small and interactive
        if let Err(e) = stream.set_nodelay(true) {
            warn!("Failed to set TCP_NODELAY: {}", e);
        }
        Ok(stream)
    }
}

#[async_trait]
impl Router for FixedRouter {
    async fn route(&self, upstream: &Session) -> Result<Route, SshError> {
        let mut params = self.params.clone();
        if self.forward_user {
            params.user = upstream.user().to_string();
        }

        debug!(session = %upstream.id(), backend = %self.backend, "connecting to backend");
        let conn = self.connect().await?;
        info!(
            session = %upstream.id(),
            "routing {} to {} as {}",
            upstream.user(),
            self.backend,
            params.user
        );

        Ok(Route {
            addr: self.backend.clone(),
            conn: Box::new(conn),
            params,
        })
    }
}

#[cfg(test)]
mod tests {
    use tokio::net::TcpListener;

    use super::*;
    use crate::config::AuthMethod;
    use crate::handshake::Permissions;
    use crate::known_hosts::HostKeyPolicy;
    use crate::transport::framed::FramedTransport;

    fn upstream_session() -> (Session, tokio::io::DuplexStream) {
        let (ours, theirs) = tokio::io::duplex(1024);
        let session = Session::upstream(
            "route-test".to_string(),
            "alice".to_string(),
            Permissions::with_method("publickey"),
            Box::new(FramedTransport::new(ours)),
        );
        (session, theirs)
    }

    #[tokio::test]
    async fn test_fixed_router_connects() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let accept = tokio::spawn(async move { listener.accept().await.map(|_| ()) });

        let router = FixedRouter::new(
            addr.clone(),
            ClientParams::new("svc", AuthMethod::None, HostKeyPolicy::AcceptAny),
        )
        .forward_user(true)
        .connect_timeout(Some(Duration::from_secs(2)));

        let (session, _peer) = upstream_session();
        let route = router.route(&session).await.unwrap();
        assert_eq!(route.addr, addr);
        assert_eq!(route.params.user, "alice");
        accept.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_fixed_router_connect_failure() {
        // Bind then drop to get a port nobody listens on
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let router = FixedRouter::new(
            addr,
            ClientParams::new("svc", AuthMethod::None, HostKeyPolicy::AcceptAny),
        );
        let (session, _peer) = upstream_session();
        let err = router.route(&session).await.unwrap_err();
        assert!(matches!(err, SshError::ConnectionFailed(_)));
    }

    #[test]
    fn test_fixed_router_with_config_sets_connect_timeout() {
        let params = ClientParams::new("svc", AuthMethod::None, HostKeyPolicy::AcceptAny);
        let config = RelayConfig::from_json(r#"{"connect_timeout_secs": 3}"#).unwrap();

        let router = FixedRouter::new("10.0.0.5:22", params.clone()).with_config(&config);
        assert_eq!(router.connect_timeout, Some(Duration::from_secs(3)));

        // Unset in the config clears a timeout set earlier
        let router = FixedRouter::new("10.0.0.5:22", params)
            .connect_timeout(Some(Duration::from_secs(9)))
            .with_config(&RelayConfig::default());
        assert!(router.connect_timeout.is_none());
    }
}
