//! One side of a proxied connection

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::SshError;
use crate::handshake::Permissions;
use crate::packet::Packet;
use crate::transport::Transport;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    /// Facing the client
    Upstream,
    /// Facing the backend
    Downstream,
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Upstream => f.write_str("upstream"),
            Side::Downstream => f.write_str("downstream"),
        }
    }
}

/// A handshaken transport plus who is on the other end.
///
/// Routers get `&Session` for the upstream side; packet I/O stays inside the crate.
pub struct Session {
    id: String,
    side: Side,
    user: String,
    permissions: Option<Arc<Permissions>>,
    transport: Box<dyn Transport>,
    closed: AtomicBool,
    /// Fires on close so a pump blocked on this session returns at once
    close_token: CancellationToken,
}

impl Session {
    pub(crate) fn upstream(
        id: String,
        user: String,
        permissions: Permissions,
        transport: Box<dyn Transport>,
    ) -> Self {
        Self::new(id, Side::Upstream, user, Some(Arc::new(permissions)), transport)
    }

    pub(crate) fn downstream(id: String, user: String, transport: Box<dyn Transport>) -> Self {
        Self::new(id, Side::Downstream, user, None, transport)
    }

    fn new(
        id: String,
        side: Side,
        user: String,
        permissions: Option<Arc<Permissions>>,
        transport: Box<dyn Transport>,
    ) -> Self {
        Self {
            id,
            side,
            user,
            permissions,
            transport,
            closed: AtomicBool::new(false),
            close_token: CancellationToken::new(),
        }
    }

    /// Id shared by the upstream and downstream session of one proxied connection
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn side(&self) -> Side {
        self.side
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    /// Authorization result; only the upstream side has one
    pub fn permissions(&self) -> Option<&Permissions> {
        self.permissions.as_deref()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Close the session. Safe to call any number of times from any task; only the
    /// first call does work, the rest return immediately.
    pub async fn close(&self) {
        if self
            .closed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }

        self.close_token.cancel();
        if let Err(e) = self.transport.close().await {
            // The peer may already be gone; nothing left to release
            warn!(session = %self.id, side = %self.side, "transport close failed: {}", e);
        }
        debug!(session = %self.id, side = %self.side, "session closed");
    }

    pub(crate) async fn read_packet(&self) -> Result<Packet, SshError> {
        if self.is_closed() {
            return Err(SshError::SessionClosed);
        }
        tokio::select! {
            biased;
            _ = self.close_token.cancelled() => Err(SshError::SessionClosed),
            result = self.transport.read_packet() => result,
        }
    }

    pub(crate) async fn write_packet(&self, packet: Packet) -> Result<(), SshError> {
        if self.is_closed() {
            return Err(SshError::SessionClosed);
        }
        tokio::select! {
            biased;
            _ = self.close_token.cancelled() => Err(SshError::SessionClosed),
            result = self.transport.write_packet(packet) => result,
        }
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("side", &self.side)
            .field("user", &self.user)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}
