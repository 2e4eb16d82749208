//! Duplex packet relay
//!
//! Two pump tasks, one per direction. Each moves whole packets from its source session to
//! its destination session until a read or write fails, then closes both sessions so the
//! opposite pump fails promptly too. The relay returns once both pumps have exited.
//!
//! ```text
//! client <-> [upstream Session] --pump--> [downstream Session] <-> backend
//!                               <--pump--
//! ```

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::error::{PumpError, PumpErrors, SshError};
use crate::packet::Packet;
use crate::session::Session;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    UpstreamToDownstream,
    DownstreamToUpstream,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::UpstreamToDownstream => f.write_str("upstream->downstream"),
            Direction::DownstreamToUpstream => f.write_str("downstream->upstream"),
        }
    }
}

/// Limits applied to both pumps. The default imposes none.
#[derive(Debug, Clone, Default)]
pub struct RelayLimits {
    pub idle_timeout: Option<Duration>,
    pub shutdown: Option<CancellationToken>,
}

/// Packets moved per direction over the life of a relay
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayCounts {
    pub upstream_to_downstream: u64,
    pub downstream_to_upstream: u64,
}

#[derive(Debug)]
pub struct RelayOutcome {
    pub counts: RelayCounts,
    pub errors: PumpErrors,
}

/// Run both pumps to completion.
///
/// There is no successful exit: end of stream on either side surfaces as an error,
/// so `errors` always holds one entry per direction.
pub async fn run(
    upstream: Arc<Session>,
    downstream: Arc<Session>,
    limits: RelayLimits,
) -> RelayOutcome {
    let mut up_to_down = tokio::spawn(pump(
        upstream.clone(),
        downstream.clone(),
        Direction::UpstreamToDownstream,
        limits.clone(),
    ));
    let mut down_to_up = tokio::spawn(pump(
        downstream.clone(),
        upstream.clone(),
        Direction::DownstreamToUpstream,
        limits,
    ));

    // A pump that panicked skipped its own teardown. Close both sessions as soon as the
    // first pump exits so the other one is never left blocked.
    let (first, rest, rest_direction) = tokio::select! {
        joined = &mut up_to_down => (
            (Direction::UpstreamToDownstream, joined),
            down_to_up,
            Direction::DownstreamToUpstream,
        ),
        joined = &mut down_to_up => (
            (Direction::DownstreamToUpstream, joined),
            up_to_down,
            Direction::UpstreamToDownstream,
        ),
    };
    upstream.close().await;
    downstream.close().await;
    let second = (rest_direction, rest.await);

    let mut joined = [first, second];
    joined.sort_by_key(|(direction, _)| *direction != Direction::UpstreamToDownstream);

    let mut counts = RelayCounts::default();
    let mut errors = PumpErrors::new();
    for (direction, joined) in joined {
        match joined {
            Ok((forwarded, err)) => {
                match direction {
                    Direction::UpstreamToDownstream => counts.upstream_to_downstream = forwarded,
                    Direction::DownstreamToUpstream => counts.downstream_to_upstream = forwarded,
                }
                errors.push(err);
            }
            Err(join_err) => {
                errors.push(PumpError::task(
                    direction,
                    SshError::SessionError(format!("pump task failed: {}", join_err)),
                ));
            }
        }
    }

    RelayOutcome { counts, errors }
}

async fn pump(
    src: Arc<Session>,
    dst: Arc<Session>,
    direction: Direction,
    limits: RelayLimits,
) -> (u64, PumpError) {
    let shutdown = limits.shutdown.unwrap_or_default();
    let mut forwarded = 0u64;

    let err = loop {
        let packet = match read_next(&src, limits.idle_timeout, &shutdown).await {
            Ok(packet) => packet,
            Err(e) => break PumpError::read(direction, e),
        };
        trace!(
            %direction,
            msg_type = packet.msg_type().unwrap_or_default(),
            len = packet.len(),
            "forwarding packet"
        );

        let written = tokio::select! {
            biased;
            _ = shutdown.cancelled() => Err(SshError::Cancelled),
            result = dst.write_packet(packet) => result,
        };
        if let Err(e) = written {
            break PumpError::write(direction, e);
        }
        forwarded += 1;
    };

    debug!(
        session = %src.id(),
        "{} stopped after {} packets: {}", direction, forwarded, err.source
    );

    src.close().await;
    dst.close().await;

    (forwarded, err)
}

async fn read_next(
    src: &Session,
    idle_timeout: Option<Duration>,
    shutdown: &CancellationToken,
) -> Result<Packet, SshError> {
    let read = async {
        match idle_timeout {
            Some(limit) => match tokio::time::timeout(limit, src.read_packet()).await {
                Ok(result) => result,
                Err(_) => Err(SshError::Timeout(format!(
                    "no packet from {} for {:?}",
                    src.side(),
                    limit
                ))),
            },
            None => src.read_packet().await,
        }
    };

    tokio::select! {
        biased;
        _ = shutdown.cancelled() => Err(SshError::Cancelled),
        result = read => result,
    }
}
