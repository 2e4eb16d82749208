//! OxideRelay - SSH protocol relay
//!
//! Terminates the client's SSH transport, asks a [`Router`] where the session should go,
//! opens a second SSH transport to that backend, then forwards packets between the two
//! untouched.
//!
//! Key exchange, packet encryption and authentication belong to the SSH library behind
//! [`ServerHandshake`], [`ClientHandshake`] and [`Transport`]. This crate sequences the
//! handshakes, runs the duplex relay and guarantees both connections are closed on every
//! exit path.
//!
//! ```ignore
//! let relay = SshRelay::new(server_handshake, client_handshake, router)
//!     .with_config(RelayConfig::load("relay.json")?);
//! relay.serve(TcpListener::bind("0.0.0.0:2222").await?, shutdown).await?;
//! ```

pub mod config;
pub mod error;
pub mod handshake;
pub mod known_hosts;
pub mod packet;
mod proxy;
pub mod relay;
pub mod router;
mod session;
pub mod transport;

pub use config::{AuthMethod, ClientParams, RelayConfig};
pub use error::{Phase, PumpError, PumpErrors, PumpOp, RelayError, SshError};
pub use handshake::{Accepted, ClientHandshake, Permissions, ServerHandshake};
pub use known_hosts::{HostKeyPolicy, HostKeyVerification, KnownHostsStore};
pub use packet::Packet;
pub use proxy::{proxy, RelayStats, SshRelay};
pub use relay::Direction;
pub use router::{FixedRouter, Route, Router};
pub use session::{Session, Side};
pub use transport::{AsyncStream, BoxStream, Transport};

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Install a fmt subscriber filtered by `RUST_LOG` (default `info`).
///
/// Does nothing if a global subscriber is already set.
pub fn init_tracing() {
    let _ = tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .try_init();
}
