//! The crate-wide error type and result alias.
//!
//! Every fallible operation in the core returns [`Result`]. Framing,
//! handshake, and disk errors are terminal to the one session or, for disk
//! errors, to the whole client (see §7 of the design doc); tracker errors are
//! retried by the caller and never panic the engine.

use std::{fmt, io};

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug)]
pub enum Error {
    /// Wraps an I/O failure (socket, file, bencode byte stream).
    Io(io::Error),
    /// The handshake's protocol string or length did not match BEP 3.
    InvalidHandshake,
    /// The remote's handshake advertised a different info hash than ours.
    InvalidInfoHash,
    /// An inbound peer's id equals our own.
    SelfConnection,
    /// A length-prefixed frame used an id this core does not understand.
    UnknownMessageId(u8),
    /// A frame's length prefix is inconsistent with its message id.
    InvalidMessageLength { id: u8, len: u32 },
    /// A piece index fell outside `0..piece_count`.
    InvalidPieceIndex,
    /// A block request's `(begin, length)` fell outside the piece.
    InvalidBlockRequest,
    /// Looked up a peer id that has no live session.
    PeerNotRegistered,
    /// A malformed bencode byte stream.
    Bencode(String),
    /// The torrent's info dictionary has a `files` key; only single-file
    /// torrents are supported by this core.
    MultiFileTorrentUnsupported,
    /// The metainfo dictionary is missing a required key.
    MissingField(&'static str),
    /// The tracker's announce URL could not be parsed.
    InvalidTrackerUrl,
    /// A tracker HTTP request failed (connect, TLS, non-success status).
    TrackerHttp(String),
    /// The tracker's response body could not be decoded as the expected
    /// bencoded dictionary.
    TrackerResponse(String),
    /// `scrape()` was called on an announce URL whose last path segment does
    /// not start with `announce`, per BEP 48.
    ScrapeNotSupported,
    /// An internal channel was closed while a message was still in flight.
    ChannelClosed,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "i/o error: {}", e),
            Self::InvalidHandshake => write!(f, "invalid handshake"),
            Self::InvalidInfoHash => {
                write!(f, "peer advertised a different info hash")
            }
            Self::SelfConnection => write!(f, "refused self connection"),
            Self::UnknownMessageId(id) => {
                write!(f, "unknown message id {}", id)
            }
            Self::InvalidMessageLength { id, len } => write!(
                f,
                "invalid length {} for message id {}",
                len, id
            ),
            Self::InvalidPieceIndex => write!(f, "invalid piece index"),
            Self::InvalidBlockRequest => write!(f, "invalid block request"),
            Self::PeerNotRegistered => write!(f, "peer not registered"),
            Self::Bencode(msg) => write!(f, "bencode decode error: {}", msg),
            Self::MultiFileTorrentUnsupported => {
                write!(f, "multi-file torrents are not supported")
            }
            Self::MissingField(name) => {
                write!(f, "metainfo missing field: {}", name)
            }
            Self::InvalidTrackerUrl => write!(f, "invalid tracker url"),
            Self::TrackerHttp(msg) => write!(f, "tracker http error: {}", msg),
            Self::TrackerResponse(msg) => {
                write!(f, "tracker response error: {}", msg)
            }
            Self::ScrapeNotSupported => {
                write!(f, "tracker url does not support scrape")
            }
            Self::ChannelClosed => write!(f, "internal channel closed"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for Error {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        Self::ChannelClosed
    }
}
