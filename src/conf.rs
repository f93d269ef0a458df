//! Tunables for the engine, centralized here with sensible defaults rather
//! than scattered as magic numbers through the core.

use std::time::Duration;

use crate::{PeerId, BLOCK_LEN};

/// The default bitsling client id tag, per BEP 20. The remaining 12 bytes of
/// a full peer id are random digits generated at startup.
pub const CLIENT_ID_TAG: &[u8; 8] = b"-bs0001-";

/// The global configuration for the engine.
#[derive(Clone, Debug)]
pub struct Conf {
    /// The length, in bytes, of a single block request. All but the last
    /// block of a piece (and the last block of the torrent) are this long.
    pub block_len: u32,

    /// The maximum number of block requests kept in flight across all peers
    /// at any one time.
    pub max_inflight_requests: usize,

    /// How long a dispatched block request is allowed to remain
    /// unanswered before it is reclaimed and made eligible for
    /// re-assignment.
    pub block_timeout: Duration,

    /// How often the peer manager re-evaluates its peers and dispatches new
    /// block requests.
    pub request_pass_interval: Duration,

    /// How often the choke algorithm re-ranks peers and recomputes who is
    /// unchoked.
    pub choke_interval: Duration,

    /// How often a session emits a keep-alive if it has otherwise sent
    /// nothing.
    pub keepalive_interval: Duration,

    /// How long a connection may go without receiving anything before it is
    /// considered dead and torn down.
    pub keepalive_threshold: Duration,

    /// The timeout applied to an outbound TCP connection attempt.
    pub connect_timeout: Duration,

    /// The upper bound placed on a tracker-supplied announce interval, to
    /// guard against a misbehaving or malicious tracker asking for an
    /// unreasonably infrequent re-announce.
    pub announce_interval_cap: Duration,

    /// How long to wait before retrying the tracker after an announce
    /// failure.
    pub tracker_error_backoff: Duration,

    /// The number of regular (rate-based) unchoke slots.
    pub unchoke_slots: usize,

    /// The number of optimistic unchoke slots, rotated independently of
    /// peer rate.
    pub optimistic_unchoke_slots: usize,

    /// The client id advertised in the handshake and to the tracker.
    pub client_id: PeerId,

    /// Whether to request the compact peer list format from the tracker.
    pub compact: bool,
}

impl Conf {
    /// Returns the configuration with the spec's hard-coded defaults.
    /// Callers (tests, the CLI) may override individual fields afterward.
    pub fn new() -> Self {
        Self {
            block_len: BLOCK_LEN,
            max_inflight_requests: 300,
            block_timeout: Duration::from_secs(10),
            request_pass_interval: Duration::from_millis(500),
            choke_interval: Duration::from_secs(10),
            keepalive_interval: Duration::from_secs(30),
            keepalive_threshold: Duration::from_secs(120),
            connect_timeout: Duration::from_secs(5),
            announce_interval_cap: Duration::from_secs(60 * 60),
            tracker_error_backoff: Duration::from_secs(60),
            unchoke_slots: 3,
            optimistic_unchoke_slots: 1,
            client_id: generate_peer_id(),
            compact: true,
        }
    }
}

impl Default for Conf {
    fn default() -> Self {
        Self::new()
    }
}

/// Builds a fresh 20-byte peer id: the fixed client tag followed by 12
/// random ASCII digits, regenerated on every call (and thus on every
/// process start).
pub fn generate_peer_id() -> PeerId {
    use rand::Rng;

    let mut id = [0u8; 20];
    id[..8].copy_from_slice(CLIENT_ID_TAG);
    let mut rng = rand::thread_rng();
    for byte in &mut id[8..] {
        *byte = b'0' + rng.gen_range(0..10);
    }
    id
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn peer_id_has_client_tag_prefix() {
        let id = generate_peer_id();
        assert_eq!(&id[..8], CLIENT_ID_TAG);
        assert!(id[8..].iter().all(|b| b.is_ascii_digit()));
    }

    #[test]
    fn defaults_are_internally_consistent() {
        let conf = Conf::new();
        assert_eq!(conf.block_len, BLOCK_LEN);
        assert!(conf.unchoke_slots > 0);
        assert!(conf.block_timeout < conf.tracker_error_backoff + conf.block_timeout);
    }
}
