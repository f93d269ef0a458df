//! Piece and block bookkeeping: which bytes we have, which are in flight,
//! and the single place SHA-1 verification and the local bitfield live.
//!
//! Grounded on the teacher's `disk::io::Piece` write-buffer (a `BTreeMap`
//! keyed by in-piece offset, hashed in ascending order once full), but the
//! scheduling cursor is reworked per this core's design: rather than reuse
//! the arrival counter as the "next offset to hand out" pointer — which
//! only ever allows one block in flight per piece at a time — a `next_offset`
//! frontier plus a `free` pool of reclaimed offsets lets several peers work
//! the same piece in parallel while still guaranteeing a given offset is
//! pending with at most one peer.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;

use sha1::{Digest, Sha1};
use tokio::sync::Mutex;

use crate::disk::DiskHandle;
use crate::error::Result;
use crate::storage::StorageInfo;
use crate::{block_count, block_len, set_bit, Bitfield, BlockInfo, PieceIndex, Sha1Hash, BLOCK_LEN};

/// A piece's in-progress write buffer and scheduling state.
struct Piece {
    expected_hash: Sha1Hash,
    len: u32,
    /// Downloaded blocks, keyed by in-piece offset, kept sorted so the
    /// piece can be hashed in ascending order once full.
    blocks: BTreeMap<u32, Vec<u8>>,
    /// Count of blocks that have arrived; advances only on genuine arrival.
    received_blocks: usize,
    /// The next never-yet-assigned offset. Offsets below this have either
    /// arrived, are pending, or were reclaimed into `free`.
    next_offset: u32,
    /// Offsets below `next_offset` that were assigned but reclaimed
    /// (timeout or disconnect) and are eligible for re-assignment before any
    /// new offset is carved off the frontier.
    free: BTreeSet<u32>,
    /// Offsets currently assigned to some peer.
    pending: HashSet<u32>,
    is_complete: bool,
}

impl Piece {
    fn new(expected_hash: Sha1Hash, len: u32) -> Self {
        Self {
            expected_hash,
            len,
            blocks: BTreeMap::new(),
            received_blocks: 0,
            next_offset: 0,
            free: BTreeSet::new(),
            pending: HashSet::new(),
            is_complete: false,
        }
    }

    fn block_count(&self) -> usize {
        block_count(self.len)
    }

    /// Pulls up to `cap` assignable offsets: reclaimed offsets first, then
    /// new ones carved off the frontier.
    fn take_assignable_offsets(&mut self, cap: usize) -> Vec<u32> {
        let mut offsets = Vec::new();
        while offsets.len() < cap {
            if let Some(&offset) = self.free.iter().next() {
                self.free.remove(&offset);
                self.pending.insert(offset);
                offsets.push(offset);
                continue;
            }
            if self.next_offset < self.len {
                let offset = self.next_offset;
                self.next_offset += BLOCK_LEN.min(self.len - self.next_offset);
                self.pending.insert(offset);
                offsets.push(offset);
                continue;
            }
            break;
        }
        offsets
    }

    fn reclaim(&mut self, offset: u32) {
        if self.pending.remove(&offset) {
            self.free.insert(offset);
        }
    }
}

/// Aggregate upload/download/remaining byte counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) struct Metrics {
    pub uploaded: u64,
    pub downloaded: u64,
    pub left: u64,
}

struct Inner {
    storage: StorageInfo,
    pieces: Vec<Piece>,
    completed: Vec<bool>,
    total_uploaded: u64,
    total_downloaded: u64,
}

impl Inner {
    fn piece_complete_bytes(&self) -> u64 {
        self.completed
            .iter()
            .enumerate()
            .filter(|(_, &done)| done)
            .map(|(i, _)| self.storage.piece_len(i) as u64)
            .sum()
    }
}

/// Owns piece state and exposes it behind a `Mutex` because both the
/// coordinator's download-scheduling path and peer sessions' upload path
/// touch it; the lock is only ever held for the duration of one operation.
#[derive(Clone)]
pub(crate) struct PieceManager {
    inner: Arc<Mutex<Inner>>,
    disk: DiskHandle,
}

impl PieceManager {
    pub fn new(storage: StorageInfo, piece_hashes: &[Sha1Hash], disk: DiskHandle) -> Self {
        let pieces = piece_hashes
            .iter()
            .enumerate()
            .map(|(i, &hash)| Piece::new(hash, storage.piece_len(i)))
            .collect();
        let completed = vec![false; piece_hashes.len()];
        Self {
            inner: Arc::new(Mutex::new(Inner {
                storage,
                pieces,
                completed,
                total_uploaded: 0,
                total_downloaded: 0,
            })),
            disk,
        }
    }

    /// Selects up to `cap` blocks the given peer can be asked for, iterating
    /// piece indices left to right (no rarest-first).
    pub async fn select_blocks(&self, peer_bitfield: &Bitfield, cap: usize) -> Vec<BlockInfo> {
        if cap == 0 {
            return Vec::new();
        }
        let mut inner = self.inner.lock().await;
        let mut result = Vec::new();
        for index in 0..inner.pieces.len() {
            if result.len() >= cap {
                break;
            }
            if inner.completed[index] {
                continue;
            }
            if !peer_bitfield.get(index).map(|b| *b).unwrap_or(false) {
                continue;
            }
            let remaining = cap - result.len();
            let piece_len = inner.pieces[index].len;
            let offsets = inner.pieces[index].take_assignable_offsets(remaining);
            for offset in offsets {
                result.push(BlockInfo {
                    piece_index: index,
                    offset,
                    len: block_len(piece_len, (offset / BLOCK_LEN) as usize),
                });
            }
        }
        result
    }

    /// Returns a previously assigned-but-unfulfilled block to the free pool
    /// so another peer may be asked for it.
    pub async fn reclaim_block(&self, block: BlockInfo) {
        let mut inner = self.inner.lock().await;
        if let Some(piece) = inner.pieces.get_mut(block.piece_index) {
            piece.reclaim(block.offset);
        }
    }

    /// Records a received block, verifying and committing the piece to disk
    /// once all of its blocks have arrived. Returns `Ok(Some(index))` if
    /// this arrival completed and verified the piece.
    pub async fn recv_block(
        &self,
        piece_index: PieceIndex,
        offset: u32,
        data: Vec<u8>,
    ) -> Result<Option<PieceIndex>> {
        let (completed_piece, write) = {
            let mut inner = self.inner.lock().await;
            if piece_index >= inner.pieces.len() || inner.completed[piece_index] {
                return Ok(None);
            }

            let data_len = data.len() as u64;
            {
                let piece = &mut inner.pieces[piece_index];
                if piece.is_complete || piece.blocks.contains_key(&offset) {
                    return Ok(None);
                }

                piece.blocks.insert(offset, data);
                piece.received_blocks += 1;
                piece.pending.remove(&offset);
            }
            inner.total_downloaded += data_len;

            let piece = &mut inner.pieces[piece_index];
            if piece.received_blocks < piece.block_count() {
                (None, None)
            } else {
                let expected_hash = piece.expected_hash;
                let piece_len = piece.len;
                let mut body = Vec::with_capacity(piece_len as usize);
                for (_, chunk) in piece.blocks.iter() {
                    body.extend_from_slice(chunk);
                }

                let mut hasher = Sha1::new();
                hasher.update(&body);
                let digest = hasher.finalize();
                let matches = digest.as_slice() == expected_hash;

                if matches {
                    piece.is_complete = true;
                    piece.blocks.clear();
                    inner.completed[piece_index] = true;
                    let piece_offset = inner.storage.piece_offset(piece_index);
                    (Some(piece_index), Some((piece_offset, body)))
                } else {
                    log::warn!("piece {} failed hash verification, re-requesting", piece_index);
                    piece.blocks.clear();
                    piece.received_blocks = 0;
                    piece.next_offset = 0;
                    piece.free.clear();
                    piece.pending.clear();
                    (None, None)
                }
            }
        };

        if let Some((offset, body)) = write {
            self.disk.write(offset, body).await?;
        }

        Ok(completed_piece)
    }

    /// Reads `len` bytes at `begin` within `index`'s completed piece, for
    /// serving an upload request.
    pub async fn get_block(
        &self,
        index: PieceIndex,
        begin: u32,
        len: u32,
    ) -> Result<Option<Vec<u8>>> {
        let (valid, file_offset) = {
            let inner = self.inner.lock().await;
            if index >= inner.pieces.len() || !inner.completed[index] {
                (false, 0)
            } else {
                let piece_len = inner.storage.piece_len(index);
                let valid = len > 0 && begin < piece_len && len <= piece_len - begin;
                (valid, inner.storage.piece_offset(index) + begin as u64)
            }
        };
        if !valid {
            return Ok(None);
        }

        let data = self.disk.read(file_offset, len as usize).await?;
        {
            let mut inner = self.inner.lock().await;
            inner.total_uploaded += data.len() as u64;
        }
        Ok(Some(data))
    }

    /// Builds the local bitfield from completed pieces.
    pub async fn get_bitfield(&self) -> Bitfield {
        let inner = self.inner.lock().await;
        let mut bitfield = Bitfield::new();
        for (i, &done) in inner.completed.iter().enumerate() {
            if done {
                set_bit(&mut bitfield, i);
            }
        }
        bitfield
    }

    /// Returns whether every piece has been verified and written.
    pub async fn is_complete(&self) -> bool {
        let inner = self.inner.lock().await;
        inner.completed.iter().all(|&done| done)
    }

    pub async fn metrics(&self) -> Metrics {
        let inner = self.inner.lock().await;
        let complete_bytes = inner.piece_complete_bytes();
        Metrics {
            uploaded: inner.total_uploaded,
            downloaded: inner.total_downloaded,
            left: inner.storage.total_len.saturating_sub(complete_bytes),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metainfo::{Info, Metainfo};

    fn test_manager(piece_len: u32, total_len: u64, pieces: Vec<(Sha1Hash, Vec<u8>)>) -> (PieceManager, Vec<Vec<u8>>) {
        let hashes: Vec<Sha1Hash> = pieces.iter().map(|(h, _)| *h).collect();
        let bodies: Vec<Vec<u8>> = pieces.into_iter().map(|(_, b)| b).collect();
        let metainfo = Metainfo {
            announce: "http://test".into(),
            info: Info {
                name: "out.bin".into(),
                piece_length: piece_len,
                pieces: hashes.clone(),
                length: total_len,
            },
            info_hash: [0u8; 20],
        };
        let dir = std::env::temp_dir().join(format!("bitsling-pm-test-{:?}", std::thread::current().id()));
        std::fs::create_dir_all(&dir).unwrap();
        let storage = StorageInfo::new(&metainfo, &dir).unwrap();
        let (mut disk, handle) = crate::disk::Disk::new(&storage).unwrap();
        tokio::spawn(async move { disk.run().await });
        (PieceManager::new(storage, &hashes, handle), bodies)
    }

    fn full_bitfield(n: usize) -> Bitfield {
        let mut bf = Bitfield::new();
        for i in 0..n {
            set_bit(&mut bf, i);
        }
        bf
    }

    #[tokio::test]
    async fn select_blocks_is_sequential_and_marks_pending() {
        let body = vec![7u8; BLOCK_LEN as usize * 2];
        let digest = Sha1::digest(&body);
        let mut hash = [0u8; 20];
        hash.copy_from_slice(&digest);
        let (pm, _) = test_manager(BLOCK_LEN * 2, BLOCK_LEN as u64 * 2, vec![(hash, body)]);

        let bf = full_bitfield(1);
        let blocks = pm.select_blocks(&bf, 10).await;
        assert_eq!(blocks.len(), 2);
        assert_eq!(blocks[0].offset, 0);
        assert_eq!(blocks[1].offset, BLOCK_LEN);

        // everything is now pending; a second pass should find nothing left
        let more = pm.select_blocks(&bf, 10).await;
        assert!(more.is_empty());
    }

    #[tokio::test]
    async fn recv_block_completes_and_verifies_piece() {
        let part_a = vec![1u8; BLOCK_LEN as usize];
        let part_b = vec![2u8; BLOCK_LEN as usize];
        let mut whole = part_a.clone();
        whole.extend_from_slice(&part_b);
        let digest = Sha1::digest(&whole);
        let mut hash = [0u8; 20];
        hash.copy_from_slice(&digest);

        let (pm, _) = test_manager(BLOCK_LEN * 2, BLOCK_LEN as u64 * 2, vec![(hash, whole)]);
        let bf = full_bitfield(1);
        let _ = pm.select_blocks(&bf, 10).await;

        assert!(pm.recv_block(0, 0, part_a).await.unwrap().is_none());
        let completed = pm.recv_block(0, BLOCK_LEN, part_b).await.unwrap();
        assert_eq!(completed, Some(0));
        assert!(pm.is_complete().await);
    }

    #[tokio::test]
    async fn recv_block_mismatch_clears_piece_for_retry() {
        let expected_hash = [0xAB; 20]; // deliberately wrong
        let body = vec![5u8; BLOCK_LEN as usize];
        let (pm, _) = test_manager(BLOCK_LEN, BLOCK_LEN as u64, vec![(expected_hash, body.clone())]);
        let bf = full_bitfield(1);
        let _ = pm.select_blocks(&bf, 10).await;

        let completed = pm.recv_block(0, 0, body).await.unwrap();
        assert_eq!(completed, None);
        assert!(!pm.is_complete().await);

        // piece must be re-selectable after the mismatch
        let blocks = pm.select_blocks(&bf, 10).await;
        assert_eq!(blocks.len(), 1);
        assert_eq!(blocks[0].offset, 0);
    }

    #[tokio::test]
    async fn reclaimed_offsets_are_reassigned_before_new_ones() {
        let body = vec![3u8; BLOCK_LEN as usize * 2];
        let digest = Sha1::digest(&body);
        let mut hash = [0u8; 20];
        hash.copy_from_slice(&digest);
        let (pm, _) = test_manager(BLOCK_LEN * 2, BLOCK_LEN as u64 * 2, vec![(hash, body)]);
        let bf = full_bitfield(1);

        let first = pm.select_blocks(&bf, 1).await;
        assert_eq!(first[0].offset, 0);
        pm.reclaim_block(first[0]).await;

        let second = pm.select_blocks(&bf, 1).await;
        assert_eq!(second[0].offset, 0, "reclaimed offset should be reassigned first");
    }
}
