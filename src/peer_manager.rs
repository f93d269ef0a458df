//! Tracks per-peer session state and drives the periodic block-request
//! pass. Grounded on the teacher's single coordinating entity pattern, but
//! peers are addressed purely through a command channel (never a shared
//! writer) per this core's design — see [`crate::peer::Command`].

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;

use crate::error::Result;
use crate::peer::Command;
use crate::piece_manager::PieceManager;
use crate::{Bitfield, BlockInfo, PeerId};

/// Consolidates what was two independently-named (and partly dead) rate
/// accumulators in the source implementation into one canonical pair: bytes
/// seen since the last snapshot, and the timestamp that snapshot was taken.
#[derive(Debug)]
struct RateCounter {
    bytes_since_snapshot: u64,
    last_snapshot: Instant,
    rate: f64,
}

impl RateCounter {
    fn new() -> Self {
        Self {
            bytes_since_snapshot: 0,
            last_snapshot: Instant::now(),
            rate: 0.0,
        }
    }

    fn add(&mut self, bytes: u64) {
        self.bytes_since_snapshot += bytes;
    }

    /// Computes bytes/sec since the last snapshot and resets the window.
    fn snapshot(&mut self, now: Instant) -> f64 {
        let elapsed = now.saturating_duration_since(self.last_snapshot).as_secs_f64();
        self.rate = if elapsed > 0.0 {
            self.bytes_since_snapshot as f64 / elapsed
        } else {
            0.0
        };
        self.bytes_since_snapshot = 0;
        self.last_snapshot = now;
        self.rate
    }
}

/// Live state for one connected peer.
pub(crate) struct PeerState {
    cmd_tx: tokio::sync::mpsc::UnboundedSender<Command>,
    remote_bitfield: Bitfield,
    /// True once we've received unchoke from this peer (we may send
    /// requests).
    we_are_unchoked: bool,
    /// True if this peer has told us it is interested in us.
    peer_interested: bool,
    /// Inflight requests we've sent this peer, keyed by `(piece, offset)`.
    pending: HashMap<(usize, u32), Instant>,
    download: RateCounter,
    upload: RateCounter,
    last_sent: Instant,
    /// True once we have unchoked this peer (our side of choking).
    we_unchoked_them: bool,
}

impl PeerState {
    fn new(cmd_tx: tokio::sync::mpsc::UnboundedSender<Command>) -> Self {
        Self {
            cmd_tx,
            remote_bitfield: Bitfield::new(),
            we_are_unchoked: false,
            peer_interested: false,
            pending: HashMap::new(),
            download: RateCounter::new(),
            upload: RateCounter::new(),
            last_sent: Instant::now(),
            we_unchoked_them: false,
        }
    }

    fn send(&mut self, cmd: Command) -> Result<()> {
        self.cmd_tx.send(cmd)?;
        self.last_sent = Instant::now();
        Ok(())
    }
}

/// Holds every connected peer's state behind one mutex, serializing the
/// periodic request pass and choke algorithm against one another and
/// against per-message updates from session tasks.
pub(crate) struct PeerManager {
    peers: Mutex<HashMap<PeerId, PeerState>>,
    piece_manager: PieceManager,
    max_inflight_requests: usize,
    block_timeout: Duration,
}

impl PeerManager {
    pub fn new(piece_manager: PieceManager, max_inflight_requests: usize, block_timeout: Duration) -> Self {
        Self {
            peers: Mutex::new(HashMap::new()),
            piece_manager,
            max_inflight_requests,
            block_timeout,
        }
    }

    pub async fn add_peer(&self, id: PeerId, cmd_tx: tokio::sync::mpsc::UnboundedSender<Command>) {
        let mut peers = self.peers.lock().await;
        peers.insert(id, PeerState::new(cmd_tx));
    }

    /// Removes a peer, returning its pending blocks to the free pool.
    pub async fn remove_peer(&self, id: &PeerId) {
        let pending = {
            let mut peers = self.peers.lock().await;
            peers.remove(id).map(|state| state.pending)
        };
        if let Some(pending) = pending {
            for ((piece_index, offset), _) in pending {
                self.piece_manager
                    .reclaim_block(BlockInfo {
                        piece_index,
                        offset,
                        len: 0,
                    })
                    .await;
            }
        }
    }

    pub async fn update_bitfield(&self, id: &PeerId, bitfield: Bitfield) {
        let mut peers = self.peers.lock().await;
        if let Some(state) = peers.get_mut(id) {
            state.remote_bitfield = bitfield;
        }
    }

    /// Sets have-bit `index` on the peer's advertised bitfield: `byte[i/8]
    /// |= 1 << (7 - (i mod 8))`.
    pub async fn set_have_bit(&self, id: &PeerId, index: usize) {
        let mut peers = self.peers.lock().await;
        if let Some(state) = peers.get_mut(id) {
            crate::set_bit(&mut state.remote_bitfield, index);
        }
    }

    pub async fn set_unchoked(&self, id: &PeerId, unchoked: bool) {
        let mut peers = self.peers.lock().await;
        if let Some(state) = peers.get_mut(id) {
            state.we_are_unchoked = unchoked;
        }
    }

    pub async fn set_peer_interested(&self, id: &PeerId, interested: bool) {
        let mut peers = self.peers.lock().await;
        if let Some(state) = peers.get_mut(id) {
            state.peer_interested = interested;
        }
    }

    /// Whether `id` currently forbids us from requesting blocks of it.
    pub async fn is_choked(&self, id: &PeerId) -> bool {
        let peers = self.peers.lock().await;
        peers.get(id).map(|s| !s.we_are_unchoked).unwrap_or(true)
    }

    /// Whether we are currently choking `id`, i.e. refusing to serve its
    /// requests. This is our own choke decision (`we_unchoked_them`, set by
    /// [`Self::apply_choke_decisions`]), not their choke state toward us.
    pub async fn is_choking_peer(&self, id: &PeerId) -> bool {
        let peers = self.peers.lock().await;
        peers.get(id).map(|s| !s.we_unchoked_them).unwrap_or(true)
    }

    /// Removes a fulfilled request from the peer's pending set.
    pub async fn handle_block_received(&self, id: &PeerId, piece_index: usize, offset: u32, len: u64) {
        let mut peers = self.peers.lock().await;
        if let Some(state) = peers.get_mut(id) {
            state.pending.remove(&(piece_index, offset));
            state.download.add(len);
        }
    }

    pub async fn record_uploaded(&self, id: &PeerId, len: u64) {
        let mut peers = self.peers.lock().await;
        if let Some(state) = peers.get_mut(id) {
            state.upload.add(len);
        }
    }

    /// Broadcasts a HAVE to every registered peer; a single peer's send
    /// failure does not abort the broadcast (§4.F), its cleanup happens via
    /// the ordinary disconnect path when its session task notices the
    /// closed channel.
    pub async fn broadcast_have(&self, index: usize) {
        let mut peers = self.peers.lock().await;
        for state in peers.values_mut() {
            let _ = state.send(Command::Have(index));
        }
    }

    /// Sends a keep-alive to every peer that hasn't been sent anything in
    /// over `threshold`.
    pub async fn send_keepalives(&self, threshold: Duration) {
        let now = Instant::now();
        let mut peers = self.peers.lock().await;
        for state in peers.values_mut() {
            if now.saturating_duration_since(state.last_sent) > threshold {
                let _ = state.send(Command::KeepAlive);
            }
        }
    }

    /// Sends every peer a shutdown command.
    pub async fn shutdown_all(&self) {
        let mut peers = self.peers.lock().await;
        for state in peers.values_mut() {
            let _ = state.send(Command::Shutdown);
        }
    }

    /// Snapshots every peer's upload/download rate, returning `(id, rate,
    /// interested)` tuples for the choke algorithm, where `rate` is the
    /// download rate unless `prefer_upload` (we're a seed and have nothing
    /// left to download).
    pub async fn snapshot_rates(&self, prefer_upload: bool) -> Vec<(PeerId, f64, bool)> {
        let now = Instant::now();
        let mut peers = self.peers.lock().await;
        peers
            .iter_mut()
            .map(|(id, state)| {
                let down = state.download.snapshot(now);
                let up = state.upload.snapshot(now);
                let rate = if prefer_upload { up } else { down };
                (*id, rate, state.peer_interested)
            })
            .collect()
    }

    /// Sends CHOKE/UNCHOKE to the given peers, flipping `we_unchoked_them`
    /// and skipping a send when the flag is already in the desired state.
    pub async fn apply_choke_decisions(&self, unchoke: &[PeerId], choke: &[PeerId]) {
        let mut peers = self.peers.lock().await;
        for id in unchoke {
            if let Some(state) = peers.get_mut(id) {
                if !state.we_unchoked_them {
                    state.we_unchoked_them = true;
                    let _ = state.send(Command::Unchoke);
                }
            }
        }
        for id in choke {
            if let Some(state) = peers.get_mut(id) {
                if state.we_unchoked_them {
                    state.we_unchoked_them = false;
                    let _ = state.send(Command::Choke);
                }
            }
        }
    }

    /// The periodic request-dispatch pass described in §4.C:
    /// 1. Reclaim timed-out requests.
    /// 2. For every unchoked peer with room, ask the piece manager for more
    ///    blocks and dispatch REQUEST commands for them.
    pub async fn request_blocks(&self) {
        let now = Instant::now();
        let mut timed_out = Vec::new();
        let mut to_request: Vec<(PeerId, Bitfield, usize)> = Vec::new();

        {
            let mut peers = self.peers.lock().await;
            for (id, state) in peers.iter_mut() {
                let expired: Vec<(usize, u32)> = state
                    .pending
                    .iter()
                    .filter(|(_, &ts)| now.saturating_duration_since(ts) > self.block_timeout)
                    .map(|(&key, _)| key)
                    .collect();
                for key in expired {
                    state.pending.remove(&key);
                    timed_out.push(key);
                }

                if state.we_are_unchoked && state.pending.len() < self.max_inflight_requests {
                    let room = self.max_inflight_requests - state.pending.len();
                    to_request.push((*id, state.remote_bitfield.clone(), room));
                }
            }
        }

        for (piece_index, offset) in timed_out {
            self.piece_manager
                .reclaim_block(BlockInfo {
                    piece_index,
                    offset,
                    len: 0,
                })
                .await;
        }

        for (id, bitfield, room) in to_request {
            let blocks = self.piece_manager.select_blocks(&bitfield, room).await;
            if blocks.is_empty() {
                continue;
            }
            let mut failed = Vec::new();
            {
                let mut peers = self.peers.lock().await;
                if let Some(state) = peers.get_mut(&id) {
                    for block in blocks {
                        if state.send(Command::Request(block)).is_ok() {
                            state.pending.insert((block.piece_index, block.offset), now);
                        } else {
                            failed.push(block);
                        }
                    }
                } else {
                    failed = blocks;
                }
            }
            for block in failed {
                self.piece_manager.reclaim_block(block).await;
            }
        }
    }

    pub async fn peer_count(&self) -> usize {
        self.peers.lock().await.len()
    }

    pub async fn is_connected(&self, id: &PeerId) -> bool {
        self.peers.lock().await.contains_key(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_counter_computes_bytes_per_second() {
        let mut counter = RateCounter::new();
        counter.add(1000);
        let past = Instant::now() - Duration::from_secs(2);
        counter.last_snapshot = past;
        let rate = counter.snapshot(Instant::now());
        assert!((rate - 500.0).abs() < 50.0);
        assert_eq!(counter.bytes_since_snapshot, 0);
    }
}
