//! Proxied session lifecycle
//!
//! Order of events for one inbound connection:
//! 1. upstream handshake (client authenticates against the relay)
//! 2. routing decision (needs the authenticated user)
//! 3. downstream handshake (relay authenticates against the backend)
//! 4. duplex relay until either side fails
//!
//! A failure in 1-3 closes whatever is open and ends the session with that phase's error.
//! Once 4 starts the pumps own teardown and the result is both pump errors combined.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::config::RelayConfig;
use crate::error::{RelayError, SshError};
use crate::handshake::{ClientHandshake, ServerHandshake};
use crate::relay::{self, RelayLimits};
use crate::router::Router;
use crate::session::Session;
use crate::transport::AsyncStream;

/// Upper bound on how long `serve` waits for cancelled sessions after shutdown
const SESSION_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Relay statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelayStats {
    /// Inbound connections handed to `proxy`
    pub sessions_total: u64,
    /// Sessions currently between accept and teardown
    pub sessions_active: u64,
    /// Sessions that ended before the relay phase
    pub sessions_rejected: u64,
    /// Packets forwarded client -> backend
    pub packets_upstream: u64,
    /// Packets forwarded backend -> client
    pub packets_downstream: u64,
}

/// SSH relay: handshake implementations, routing policy and tunables
#[derive(Clone)]
pub struct SshRelay {
    server: Arc<dyn ServerHandshake>,
    client: Arc<dyn ClientHandshake>,
    router: Arc<dyn Router>,
    config: RelayConfig,
    stats: Arc<RwLock<RelayStats>>,
}

impl SshRelay {
    pub fn new(
        server: Arc<dyn ServerHandshake>,
        client: Arc<dyn ClientHandshake>,
        router: Arc<dyn Router>,
    ) -> Self {
        Self {
            server,
            client,
            router,
            config: RelayConfig::default(),
            stats: Arc::new(RwLock::new(RelayStats::default())),
        }
    }

    pub fn with_config(mut self, config: RelayConfig) -> Self {
        self.config = config;
        self
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    pub fn stats(&self) -> RelayStats {
        self.stats.read().clone()
    }

    /// Proxy one inbound connection until the session ends
    pub async fn proxy<S>(&self, inbound: S) -> Result<(), RelayError>
    where
        S: AsyncStream + 'static,
    {
        self.proxy_with_shutdown(inbound, CancellationToken::new()).await
    }

    /// Like [`proxy`](Self::proxy), but `shutdown` aborts a running relay
    pub async fn proxy_with_shutdown<S>(
        &self,
        inbound: S,
        shutdown: CancellationToken,
    ) -> Result<(), RelayError>
    where
        S: AsyncStream + 'static,
    {
        let session_id = uuid::Uuid::new_v4().to_string();
        {
            let mut s = self.stats.write();
            s.sessions_total += 1;
            s.sessions_active += 1;
        }

        let result = self
            .run_session(session_id.clone(), inbound, shutdown)
            .instrument(info_span!("ssh_relay", session = %session_id))
            .await;

        let mut s = self.stats.write();
        s.sessions_active = s.sessions_active.saturating_sub(1);
        if matches!(&result, Err(e) if e.pump_errors().is_none()) {
            s.sessions_rejected += 1;
        }
        result
    }

    async fn run_session<S>(
        &self,
        session_id: String,
        mut inbound: S,
        shutdown: CancellationToken,
    ) -> Result<(), RelayError>
    where
        S: AsyncStream + 'static,
    {
        if let Err(e) = self.server.validate() {
            error!("Server handshake configuration rejected: {}", e);
            close_stream(&mut inbound).await;
            return Err(RelayError::Upstream(e));
        }

        // The handshake consumes the connection; on failure it is dropped (closed) there
        let accepted = with_deadline(
            self.config.handshake_timeout(),
            "upstream handshake",
            self.server.accept(Box::new(inbound)),
        )
        .await
        .map_err(|e| {
            warn!("Upstream handshake failed: {}", e);
            RelayError::Upstream(e)
        })?;

        let upstream = Arc::new(Session::upstream(
            session_id.clone(),
            accepted.user,
            accepted.permissions,
            accepted.transport,
        ));
        info!(user = %upstream.user(), "Upstream authenticated");

        let route = match self.router.route(&upstream).await {
            Ok(route) => route,
            Err(e) => {
                warn!("Routing rejected session for {}: {}", upstream.user(), e);
                upstream.close().await;
                return Err(RelayError::Route(e));
            }
        };
        let addr = route.addr;
        let params = route.params;
        let mut conn = route.conn;

        if let Err(e) = params.validate() {
            warn!("Invalid client parameters for {}: {}", addr, e);
            upstream.close().await;
            close_stream(&mut conn).await;
            return Err(RelayError::Downstream { addr, source: e });
        }

        let transport = match with_deadline(
            self.config.handshake_timeout(),
            "downstream handshake",
            self.client.connect(&addr, conn, &params),
        )
        .await
        {
            Ok(transport) => transport,
            Err(e) => {
                warn!("Downstream handshake with {} failed: {}", addr, e);
                upstream.close().await;
                return Err(RelayError::Downstream { addr, source: e });
            }
        };

        let downstream = Arc::new(Session::downstream(session_id, params.user, transport));
        info!(
            backend = %addr,
            "Relaying {} to {} as {}",
            upstream.user(),
            addr,
            downstream.user()
        );

        let outcome = relay::run(
            upstream,
            downstream,
            RelayLimits {
                idle_timeout: self.config.idle_timeout(),
                shutdown: Some(shutdown),
            },
        )
        .await;

        {
            let mut s = self.stats.write();
            s.packets_upstream += outcome.counts.upstream_to_downstream;
            s.packets_downstream += outcome.counts.downstream_to_upstream;
        }
        info!(
            backend = %addr,
            up = outcome.counts.upstream_to_downstream,
            down = outcome.counts.downstream_to_upstream,
            "Relay ended"
        );
        for err in outcome.errors.iter() {
            debug!("{}", err);
        }

        Err(RelayError::Relay(outcome.errors))
    }

    /// Accept connections from `listener` and proxy each on its own task until
    /// `shutdown` fires. Running sessions are cancelled along with the loop, and `serve`
    /// waits up to `SESSION_DRAIN_TIMEOUT` for them to finish tearing down.
    pub async fn serve(
        &self,
        listener: TcpListener,
        shutdown: CancellationToken,
    ) -> Result<(), SshError> {
        let local_addr = listener.local_addr()?;
        info!("SSH relay listening on {}", local_addr);

        let sessions = TaskTracker::new();
        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    info!("SSH relay on {} shutting down", local_addr);
                    break;
                }
                accepted = listener.accept() => {
                    let (stream, peer_addr) = match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            error!("Accept error: {}", e);
                            tokio::time::sleep(Duration::from_millis(100)).await;
                            continue;
                        }
                    };
                    if let Err(e) = stream.set_nodelay(true) {
                        warn!("Failed to set TCP_NODELAY: {}", e);
                    }
                    debug!("Accepted connection from {}", peer_addr);

                    let relay = self.clone();
                    let session_shutdown = shutdown.child_token();
                    sessions.spawn(
                        async move {
                            match relay.proxy_with_shutdown(stream, session_shutdown).await {
                                Err(RelayError::Relay(errors)) => {
                                    debug!("Session ended: {}", errors);
                                }
                                Err(e) => info!("Session failed: {}", e),
                                Ok(()) => {}
                            }
                        }
                        .instrument(info_span!("relay_conn", peer = %peer_addr)),
                    );
                }
            }
        }

        sessions.close();
        if tokio::time::timeout(SESSION_DRAIN_TIMEOUT, sessions.wait())
            .await
            .is_err()
        {
            warn!(
                "Timeout waiting for {} sessions to close on {}",
                sessions.len(),
                local_addr
            );
        }
        Ok(())
    }
}

/// Proxy `inbound` with the given handshakes and routing policy.
///
/// Blocks until the session ends. Every failure returns with both connections closed.
pub async fn proxy<S>(
    inbound: S,
    server: Arc<dyn ServerHandshake>,
    client: Arc<dyn ClientHandshake>,
    router: Arc<dyn Router>,
) -> Result<(), RelayError>
where
    S: AsyncStream + 'static,
{
    SshRelay::new(server, client, router).proxy(inbound).await
}

async fn with_deadline<T>(
    limit: Option<Duration>,
    what: &str,
    fut: impl Future<Output = Result<T, SshError>>,
) -> Result<T, SshError> {
    match limit {
        Some(limit) => tokio::time::timeout(limit, fut)
            .await
            .unwrap_or_else(|_| Err(SshError::Timeout(format!("{} exceeded {:?}", what, limit)))),
        None => fut.await,
    }
}

async fn close_stream<S: AsyncWrite + Unpin + ?Sized>(stream: &mut S) {
    if let Err(e) = stream.shutdown().await {
        debug!("Shutdown of raw connection failed: {}", e);
    }
}
