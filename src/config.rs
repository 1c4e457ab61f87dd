//! Tunable constants for the download engine.
//!
//! Everything here has a spec-mandated default; the CLI only ever overrides
//! the torrent path and output directory.
use std::time::Duration;

/// Size of a single block request, fixed by the wire protocol.
pub const REQUEST_SIZE: u32 = 16 * 1024;

/// Size of the peer session pool the driver keeps alive for the life of a
/// download.
pub const MAX_PEER_CONNECTIONS: usize = 40;

/// A block re-requested if it has been `Pending` longer than this.
pub const MAX_PENDING_MS: u64 = 300_000;

/// Port advertised to the tracker. Not necessarily bound locally, since
/// this client never accepts inbound connections (no seeding).
pub const ANNOUNCE_PORT: u16 = 6889;

/// Used for the first announce, and as a fallback until the tracker
/// returns its own `interval`, per its own value taking precedence
/// afterwards.
pub const DEFAULT_ANNOUNCE_INTERVAL: Duration = Duration::from_secs(1800);

/// How long the announce loop sleeps between checks when it isn't yet
/// time to re-announce.
pub const TRACKER_POLL_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct Config {
    pub request_size: u32,
    pub max_peer_connections: usize,
    pub max_pending_ms: u64,
    pub announce_port: u16,
    pub default_announce_interval: Duration,
    pub tracker_poll_interval: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            request_size: REQUEST_SIZE,
            max_peer_connections: MAX_PEER_CONNECTIONS,
            max_pending_ms: MAX_PENDING_MS,
            announce_port: ANNOUNCE_PORT,
            default_announce_interval: DEFAULT_ANNOUNCE_INTERVAL,
            tracker_poll_interval: TRACKER_POLL_INTERVAL,
        }
    }
}
