//! The disk actor: owns the torrent's backing file and performs positioned
//! reads and writes off the reactor, modeled on the teacher's `Disk` /
//! `DiskHandle` split but generalized from a per-torrent map down to the
//! crate's single torrent.

use std::fs::{File, OpenOptions};
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio::task;

use crate::error::{Error, Result};
use crate::storage::StorageInfo;

/// A command sent to the disk actor.
enum Command {
    /// Write `data` at `offset` bytes into the file.
    Write {
        offset: u64,
        data: Vec<u8>,
        result_tx: oneshot::Sender<Result<()>>,
    },
    /// Read `len` bytes starting at `offset` bytes into the file.
    Read {
        offset: u64,
        len: usize,
        result_tx: oneshot::Sender<Result<Vec<u8>>>,
    },
    Shutdown,
}

/// A cheap-to-clone handle to the disk actor's command channel.
#[derive(Clone)]
pub(crate) struct DiskHandle {
    cmd_tx: mpsc::UnboundedSender<Command>,
}

impl DiskHandle {
    /// Queues a positioned write and waits for the actor to report the
    /// outcome. Disk write failures are fatal to the client (§7), so the
    /// caller is expected to propagate an `Err` upward rather than retry.
    pub async fn write(&self, offset: u64, data: Vec<u8>) -> Result<()> {
        let (result_tx, result_rx) = oneshot::channel();
        self.cmd_tx.send(Command::Write {
            offset,
            data,
            result_tx,
        })?;
        result_rx.await.map_err(|_| Error::ChannelClosed)?
    }

    /// Queues a positioned read and waits for the resulting bytes, used by
    /// the upload path to serve piece requests without contending with the
    /// writer's file cursor.
    pub async fn read(&self, offset: u64, len: usize) -> Result<Vec<u8>> {
        let (result_tx, result_rx) = oneshot::channel();
        self.cmd_tx.send(Command::Read {
            offset,
            len,
            result_tx,
        })?;
        result_rx.await.map_err(|_| Error::ChannelClosed)?
    }

    /// Signals the actor to stop its event loop.
    pub fn shutdown(&self) -> Result<()> {
        self.cmd_tx.send(Command::Shutdown)?;
        Ok(())
    }
}

/// The disk actor's event loop state.
pub(crate) struct Disk {
    file: Arc<File>,
    cmd_rx: mpsc::UnboundedReceiver<Command>,
}

impl Disk {
    /// Creates (or truncates) the torrent's target file to `total_len` bytes
    /// and returns the actor paired with a handle to it.
    pub fn new(storage: &StorageInfo) -> Result<(Self, DiskHandle)> {
        if let Some(parent) = storage.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&storage.path)?;
        file.set_len(storage.total_len)?;

        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        Ok((
            Self {
                file: Arc::new(file),
                cmd_rx,
            },
            DiskHandle { cmd_tx },
        ))
    }

    /// Runs the actor's command loop until a [`Command::Shutdown`] is
    /// received or the channel is closed.
    pub async fn run(&mut self) -> Result<()> {
        log::info!("starting disk actor event loop");
        while let Some(cmd) = self.cmd_rx.recv().await {
            match cmd {
                Command::Write {
                    offset,
                    data,
                    result_tx,
                } => {
                    let file = Arc::clone(&self.file);
                    let result = task::spawn_blocking(move || pwrite_all(&file, offset, &data))
                        .await
                        .map_err(|_| Error::ChannelClosed)?;
                    if let Err(e) = &result {
                        log::error!("fatal disk write error at offset {}: {}", offset, e);
                    }
                    let _ = result_tx.send(result);
                }
                Command::Read {
                    offset,
                    len,
                    result_tx,
                } => {
                    let file = Arc::clone(&self.file);
                    let result =
                        task::spawn_blocking(move || pread_exact(&file, offset, len))
                            .await
                            .map_err(|_| Error::ChannelClosed)?;
                    let _ = result_tx.send(result);
                }
                Command::Shutdown => {
                    log::info!("shutting down disk actor event loop");
                    break;
                }
            }
        }
        Ok(())
    }
}

fn pwrite_all(file: &File, offset: u64, data: &[u8]) -> Result<()> {
    let mut written = 0;
    while written < data.len() {
        let n = nix::sys::uio::pwrite(file, &data[written..], offset as i64 + written as i64)
            .map_err(|e| Error::Io(std::io::Error::from(e)))?;
        if n == 0 {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::WriteZero,
                "pwrite returned zero bytes written",
            )));
        }
        written += n;
    }
    Ok(())
}

fn pread_exact(file: &File, offset: u64, len: usize) -> Result<Vec<u8>> {
    let mut buf = vec![0u8; len];
    let mut read = 0;
    while read < len {
        let n = nix::sys::uio::pread(file, &mut buf[read..], offset as i64 + read as i64)
            .map_err(|e| Error::Io(std::io::Error::from(e)))?;
        if n == 0 {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "pread hit end of file before filling buffer",
            )));
        }
        read += n;
    }
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metainfo::{Info, Metainfo};

    fn storage_in(dir: &std::path::Path, total_len: u64) -> StorageInfo {
        let metainfo = Metainfo {
            announce: "http://test".into(),
            info: Info {
                name: "payload.bin".into(),
                piece_length: 16384,
                pieces: vec![[0u8; 20]],
                length: total_len,
            },
            info_hash: [0u8; 20],
        };
        StorageInfo::new(&metainfo, dir).unwrap()
    }

    #[tokio::test]
    async fn writes_then_reads_back_same_bytes() {
        let dir = tempdir();
        let storage = storage_in(dir.path(), 32);
        let (mut disk, handle) = Disk::new(&storage).unwrap();
        let task = tokio::spawn(async move { disk.run().await });

        handle.write(0, vec![1, 2, 3, 4]).await.unwrap();
        handle.write(16, vec![9, 9, 9]).await.unwrap();

        let front = handle.read(0, 4).await.unwrap();
        assert_eq!(front, vec![1, 2, 3, 4]);
        let back = handle.read(16, 3).await.unwrap();
        assert_eq!(back, vec![9, 9, 9]);

        handle.shutdown().unwrap();
        task.await.unwrap().unwrap();
    }

    /// A minimal temp-dir helper so tests don't depend on an external crate
    /// purely for directory cleanup.
    struct TempDir(std::path::PathBuf);

    impl TempDir {
        fn path(&self) -> &std::path::Path {
            &self.0
        }
    }

    impl Drop for TempDir {
        fn drop(&mut self) {
            let _ = std::fs::remove_dir_all(&self.0);
        }
    }

    fn tempdir() -> TempDir {
        let mut path = std::env::temp_dir();
        let unique = format!("bitsling-disk-test-{:?}", std::thread::current().id());
        path.push(unique);
        std::fs::create_dir_all(&path).unwrap();
        TempDir(path)
    }
}
