//! The per-connection peer session: handshake, codec switch, and the
//! steady-state read/command loop.
//!
//! Grounded on the teacher's `PeerSession` (the `Framed`/`FramedParts`
//! codec-switch trick, the `select!`-driven combined read/command loop) but
//! simplified to this core's state machine. Per this core's design, the
//! coordinator never touches a session's writer directly — it only ever
//! sends [`Command`]s over the channel returned by [`PeerSession::outbound`]
//! / [`PeerSession::inbound`], and the owning session performs the actual
//! write.

pub(crate) mod codec;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use futures::{Sink, SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::time::timeout;
use tokio_util::codec::{Framed, FramedParts};

use self::codec::{Handshake, HandshakeCodec, Message, PeerCodec};
use crate::error::{Error, Result};
use crate::peer_manager::PeerManager;
use crate::piece_manager::PieceManager;
use crate::torrent::SharedStatus;
use crate::{BlockInfo, PeerId, PieceIndex};

/// A command the coordinator or peer manager sends to a session task. All
/// coordinator-initiated outbound traffic is modeled this way rather than
/// as a borrowed/shared writer handle.
#[derive(Debug, Clone)]
pub(crate) enum Command {
    Choke,
    Unchoke,
    Have(PieceIndex),
    Request(BlockInfo),
    KeepAlive,
    Shutdown,
}

/// The session's lifecycle, mirroring §4.D.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum State {
    Connecting,
    Handshaking,
    Connected,
    Closed,
}

enum Endpoint {
    Outbound(SocketAddr),
    Inbound(TcpStream, SocketAddr),
}

impl Endpoint {
    fn addr(&self) -> SocketAddr {
        match self {
            Endpoint::Outbound(addr) => *addr,
            Endpoint::Inbound(_, addr) => *addr,
        }
    }
}

pub(crate) struct PeerSession {
    torrent: Arc<SharedStatus>,
    piece_manager: PieceManager,
    peer_manager: Arc<PeerManager>,
    endpoint: Endpoint,
    cmd_tx: UnboundedSender<Command>,
    cmd_rx: UnboundedReceiver<Command>,
    state: State,
    peer_id: Option<PeerId>,
    last_received: Instant,
}

impl PeerSession {
    /// Creates a session that will dial `addr`.
    pub fn outbound(
        torrent: Arc<SharedStatus>,
        piece_manager: PieceManager,
        peer_manager: Arc<PeerManager>,
        addr: SocketAddr,
    ) -> (Self, UnboundedSender<Command>) {
        Self::new(torrent, piece_manager, peer_manager, Endpoint::Outbound(addr))
    }

    /// Creates a session wrapping an already-accepted inbound socket.
    pub fn inbound(
        torrent: Arc<SharedStatus>,
        piece_manager: PieceManager,
        peer_manager: Arc<PeerManager>,
        socket: TcpStream,
        addr: SocketAddr,
    ) -> (Self, UnboundedSender<Command>) {
        Self::new(
            torrent,
            piece_manager,
            peer_manager,
            Endpoint::Inbound(socket, addr),
        )
    }

    fn new(
        torrent: Arc<SharedStatus>,
        piece_manager: PieceManager,
        peer_manager: Arc<PeerManager>,
        endpoint: Endpoint,
    ) -> (Self, UnboundedSender<Command>) {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        (
            Self {
                torrent,
                piece_manager,
                peer_manager,
                endpoint,
                cmd_tx: cmd_tx.clone(),
                cmd_rx,
                state: State::Connecting,
                peer_id: None,
                last_received: Instant::now(),
            },
            cmd_tx,
        )
    }

    /// Runs the session to completion, cleaning up peer-manager
    /// registration however it ends.
    pub async fn start(mut self) {
        let addr = self.endpoint.addr();
        if let Err(e) = self.run().await {
            log::info!("peer {} session ended: {}", addr, e);
        }
        if let Some(id) = self.peer_id {
            self.peer_manager.remove_peer(&id).await;
        }
        self.state = State::Closed;
    }

    async fn run(&mut self) -> Result<()> {
        let addr = self.endpoint.addr();
        log::info!("starting session with {}", addr);

        let is_outbound = matches!(self.endpoint, Endpoint::Outbound(_));
        let endpoint = std::mem::replace(&mut self.endpoint, Endpoint::Outbound(addr));
        let socket = match endpoint {
            Endpoint::Outbound(addr) => {
                self.state = State::Connecting;
                timeout(self.torrent.conf.connect_timeout, TcpStream::connect(addr))
                    .await
                    .map_err(|_| {
                        Error::Io(std::io::Error::new(
                            std::io::ErrorKind::TimedOut,
                            "connect timed out",
                        ))
                    })??
            }
            Endpoint::Inbound(socket, _) => socket,
        };

        self.state = State::Handshaking;
        let mut hs_socket = Framed::new(socket, HandshakeCodec);
        let our_handshake = Handshake::new(self.torrent.info_hash, self.torrent.conf.client_id);

        if is_outbound {
            log::debug!("sending handshake to {}", addr);
            hs_socket.send(our_handshake.clone()).await?;
        }

        let peer_handshake = hs_socket.next().await.ok_or(Error::InvalidHandshake)??;

        if peer_handshake.info_hash != self.torrent.info_hash {
            log::info!("peer {} advertised wrong info hash", addr);
            return Err(Error::InvalidInfoHash);
        }
        if peer_handshake.peer_id == self.torrent.conf.client_id {
            log::info!("refusing self connection from {}", addr);
            return Err(Error::SelfConnection);
        }

        if !is_outbound {
            hs_socket.send(our_handshake).await?;
        }

        self.peer_id = Some(peer_handshake.peer_id);
        self.peer_manager
            .add_peer(peer_handshake.peer_id, self.cmd_tx.clone())
            .await;

        // switch codecs, preserving whatever was already buffered past the
        // handshake
        let old_parts = hs_socket.into_parts();
        let mut new_parts = FramedParts::new(old_parts.io, PeerCodec);
        new_parts.read_buf = old_parts.read_buf;
        new_parts.write_buf = old_parts.write_buf;
        let socket = Framed::from_parts(new_parts);
        let (mut sink, mut stream) = socket.split();

        let bitfield = self.piece_manager.get_bitfield().await;
        if !bitfield.is_empty() {
            sink.send(Message::Bitfield(bitfield)).await?;
        }
        sink.send(Message::Interested).await?;
        self.state = State::Connected;
        log::info!("peer {} session connected", addr);

        loop {
            tokio::select! {
                msg = stream.next() => {
                    match msg {
                        Some(Ok(msg)) => {
                            self.last_received = Instant::now();
                            self.handle_message(&mut sink, msg).await?;
                        }
                        Some(Err(e)) => return Err(e),
                        None => return Ok(()),
                    }
                }
                cmd = self.cmd_rx.recv() => {
                    match cmd {
                        Some(Command::Shutdown) | None => {
                            log::info!("shutting down session with {}", addr);
                            return Ok(());
                        }
                        Some(cmd) => self.handle_command(&mut sink, cmd).await?,
                    }
                }
            }
        }
    }

    async fn handle_message<S>(&mut self, sink: &mut S, msg: Message) -> Result<()>
    where
        S: Sink<Message, Error = Error> + Unpin,
    {
        let peer_id = self.peer_id.expect("message received before handshake");
        log::trace!("received {} from {}", msg.name(), self.endpoint.addr());

        match msg {
            Message::KeepAlive => {}
            Message::Choke => self.peer_manager.set_unchoked(&peer_id, false).await,
            Message::Unchoke => self.peer_manager.set_unchoked(&peer_id, true).await,
            Message::Interested => self.peer_manager.set_peer_interested(&peer_id, true).await,
            Message::NotInterested => self.peer_manager.set_peer_interested(&peer_id, false).await,
            Message::Bitfield(bitfield) => {
                self.peer_manager.update_bitfield(&peer_id, bitfield).await
            }
            Message::Have { piece_index } => {
                self.peer_manager
                    .set_have_bit(&peer_id, piece_index as usize)
                    .await
            }
            Message::Piece { index, begin, block } => {
                let len = block.len() as u64;
                let completed = self
                    .piece_manager
                    .recv_block(index as usize, begin, block)
                    .await?;
                self.peer_manager
                    .handle_block_received(&peer_id, index as usize, begin, len)
                    .await;
                if let Some(index) = completed {
                    log::info!("piece {} verified and written", index);
                }
            }
            Message::Request { index, begin, len } => {
                if self.peer_manager.is_choking_peer(&peer_id).await {
                    log::debug!("ignoring request from peer {} we are choking", self.endpoint.addr());
                } else if let Some(data) =
                    self.piece_manager.get_block(index as usize, begin, len).await?
                {
                    self.peer_manager
                        .record_uploaded(&peer_id, data.len() as u64)
                        .await;
                    sink.send(Message::Piece {
                        index,
                        begin,
                        block: data,
                    })
                    .await?;
                }
            }
            Message::Cancel { .. } | Message::Port(_) => {}
        }
        Ok(())
    }

    async fn handle_command<S>(&mut self, sink: &mut S, cmd: Command) -> Result<()>
    where
        S: Sink<Message, Error = Error> + Unpin,
    {
        match cmd {
            Command::Choke => sink.send(Message::Choke).await?,
            Command::Unchoke => sink.send(Message::Unchoke).await?,
            Command::Have(index) => {
                sink.send(Message::Have {
                    piece_index: index as u32,
                })
                .await?
            }
            Command::Request(block) => {
                sink.send(Message::Request {
                    index: block.piece_index as u32,
                    begin: block.offset,
                    len: block.len,
                })
                .await?
            }
            Command::KeepAlive => sink.send(Message::KeepAlive).await?,
            Command::Shutdown => unreachable!("shutdown is handled in the select loop"),
        }
        Ok(())
    }
}
