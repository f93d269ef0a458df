//! Storage geometry for the (single) file backing a torrent.
//!
//! The teacher's `storage_info` module carries a multi-file `FsStructure`
//! capable of mapping torrent-wide byte ranges onto several files; since
//! only single-file torrents are in scope here that machinery collapses to
//! a handful of fields and one derived accessor.

use std::path::PathBuf;

use crate::error::{Error, Result};
use crate::metainfo::Metainfo;
use crate::block_len;
#[cfg(test)]
use crate::BLOCK_LEN;

/// Information about a torrent's storage details: the piece count and
/// length, the file's total length, and where on disk it lives.
#[derive(Clone, Debug)]
pub(crate) struct StorageInfo {
    /// The number of pieces in the torrent.
    pub piece_count: usize,
    /// The nominal length of a piece; every piece but the last is this
    /// long.
    pub piece_len: u32,
    /// The length of the last piece, which may be shorter than `piece_len`.
    pub last_piece_len: u32,
    /// The total length, in bytes, of the file.
    pub total_len: u64,
    /// Where the file is (or will be) created on disk.
    pub path: PathBuf,
}

impl StorageInfo {
    /// Derives the storage geometry from a parsed metainfo and the
    /// directory the file should live in.
    pub fn new(metainfo: &Metainfo, download_dir: &std::path::Path) -> Result<Self> {
        let info = &metainfo.info;
        let piece_count = info.piece_count();
        if piece_count == 0 {
            return Err(Error::Bencode("torrent has no pieces".into()));
        }

        let last_piece_len = {
            let remainder = info.length % info.piece_length as u64;
            if remainder == 0 {
                info.piece_length
            } else {
                remainder as u32
            }
        };

        Ok(Self {
            piece_count,
            piece_len: info.piece_length,
            last_piece_len,
            total_len: info.length,
            path: download_dir.join(&info.name),
        })
    }

    /// Returns the length of the piece at `index`.
    ///
    /// # Panics
    ///
    /// Panics if `index` is out of bounds.
    pub fn piece_len(&self, index: usize) -> u32 {
        assert!(index < self.piece_count, "piece index out of bounds");
        if index == self.piece_count - 1 {
            self.last_piece_len
        } else {
            self.piece_len
        }
    }

    /// Returns the byte offset of piece `index` within the file.
    pub fn piece_offset(&self, index: usize) -> u64 {
        index as u64 * self.piece_len as u64
    }

    /// Returns the length of block `block_index` within piece `piece_index`.
    pub fn block_len(&self, piece_index: usize, block_index: usize) -> u32 {
        block_len(self.piece_len(piece_index), block_index)
    }

    /// Returns the number of full-size blocks this torrent's default block
    /// length divides into, purely informational and used for sizing
    /// buffers up front.
    pub fn blocks_per_piece(&self) -> usize {
        crate::block_count(self.piece_len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metainfo::Info;

    fn metainfo_with(total_len: u64, piece_len: u32, piece_count: usize) -> Metainfo {
        Metainfo {
            announce: "http://test".into(),
            info: Info {
                name: "file.bin".into(),
                piece_length: piece_len,
                pieces: vec![[0u8; 20]; piece_count],
                length: total_len,
            },
            info_hash: [0u8; 20],
        }
    }

    #[test]
    fn computes_last_piece_len_when_uneven() {
        let metainfo = metainfo_with(2 * BLOCK_LEN as u64 + 100, BLOCK_LEN, 3);
        let storage = StorageInfo::new(&metainfo, std::path::Path::new("/tmp")).unwrap();
        assert_eq!(storage.piece_len(0), BLOCK_LEN);
        assert_eq!(storage.piece_len(1), BLOCK_LEN);
        assert_eq!(storage.piece_len(2), 100);
    }

    #[test]
    fn last_piece_is_full_when_exact_multiple() {
        let metainfo = metainfo_with(2 * BLOCK_LEN as u64, BLOCK_LEN, 2);
        let storage = StorageInfo::new(&metainfo, std::path::Path::new("/tmp")).unwrap();
        assert_eq!(storage.last_piece_len, BLOCK_LEN);
    }

    #[test]
    fn piece_offset_is_index_times_piece_len() {
        let metainfo = metainfo_with(3 * BLOCK_LEN as u64, BLOCK_LEN, 3);
        let storage = StorageInfo::new(&metainfo, std::path::Path::new("/tmp")).unwrap();
        assert_eq!(storage.piece_offset(2), 2 * BLOCK_LEN as u64);
    }
}
