//! The wire codecs for the peer protocol: the fixed 68-byte handshake, and
//! the length-prefixed message framing used for everything after it.

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::Error;
use crate::{Bitfield, PeerId, Sha1Hash};

const PROTOCOL_STRING: &[u8] = b"BitTorrent protocol";
const HANDSHAKE_LEN: usize = 1 + PROTOCOL_STRING.len() + 8 + 20 + 20;

/// The 68-byte BEP 3 handshake.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct Handshake {
    pub info_hash: Sha1Hash,
    pub peer_id: PeerId,
}

impl Handshake {
    pub fn new(info_hash: Sha1Hash, peer_id: PeerId) -> Self {
        Self { info_hash, peer_id }
    }
}

/// A `Decoder`/`Encoder` for exactly one [`Handshake`]; a session switches to
/// [`PeerCodec`] immediately after using it once, via `Framed::into_parts`/
/// `FramedParts::from_parts` so no bytes already buffered past the
/// handshake are lost.
pub(crate) struct HandshakeCodec;

impl Encoder<Handshake> for HandshakeCodec {
    type Error = Error;

    fn encode(&mut self, handshake: Handshake, buf: &mut BytesMut) -> Result<(), Error> {
        buf.reserve(HANDSHAKE_LEN);
        buf.put_u8(PROTOCOL_STRING.len() as u8);
        buf.put_slice(PROTOCOL_STRING);
        buf.put_slice(&[0u8; 8]);
        buf.put_slice(&handshake.info_hash);
        buf.put_slice(&handshake.peer_id);
        Ok(())
    }
}

impl Decoder for HandshakeCodec {
    type Item = Handshake;
    type Error = Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Handshake>, Error> {
        if buf.len() < HANDSHAKE_LEN {
            return Ok(None);
        }
        let prot_len = buf[0] as usize;
        if prot_len != PROTOCOL_STRING.len() || &buf[1..1 + prot_len] != PROTOCOL_STRING {
            return Err(Error::InvalidHandshake);
        }

        let mut info_hash = [0u8; 20];
        info_hash.copy_from_slice(&buf[1 + prot_len + 8..1 + prot_len + 8 + 20]);
        let mut peer_id = [0u8; 20];
        peer_id.copy_from_slice(&buf[1 + prot_len + 28..1 + prot_len + 48]);

        buf.advance(HANDSHAKE_LEN);
        Ok(Some(Handshake { info_hash, peer_id }))
    }
}

/// A post-handshake message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum Message {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have { piece_index: u32 },
    Bitfield(Bitfield),
    Request { index: u32, begin: u32, len: u32 },
    Piece { index: u32, begin: u32, block: Vec<u8> },
    Cancel { index: u32, begin: u32, len: u32 },
    Port(u16),
}

impl Message {
    /// A short name for log lines; mirrors the `msg.id()` calls the teacher
    /// sprinkles through its session loop.
    pub fn name(&self) -> &'static str {
        match self {
            Message::KeepAlive => "keep-alive",
            Message::Choke => "choke",
            Message::Unchoke => "unchoke",
            Message::Interested => "interested",
            Message::NotInterested => "not-interested",
            Message::Have { .. } => "have",
            Message::Bitfield(_) => "bitfield",
            Message::Request { .. } => "request",
            Message::Piece { .. } => "piece",
            Message::Cancel { .. } => "cancel",
            Message::Port(_) => "port",
        }
    }
}

/// Frames length-prefixed peer messages after the handshake.
pub(crate) struct PeerCodec;

impl Encoder<Message> for PeerCodec {
    type Error = Error;

    fn encode(&mut self, msg: Message, buf: &mut BytesMut) -> Result<(), Error> {
        match msg {
            Message::KeepAlive => {
                buf.put_u32(0);
            }
            Message::Choke => {
                buf.put_u32(1);
                buf.put_u8(0);
            }
            Message::Unchoke => {
                buf.put_u32(1);
                buf.put_u8(1);
            }
            Message::Interested => {
                buf.put_u32(1);
                buf.put_u8(2);
            }
            Message::NotInterested => {
                buf.put_u32(1);
                buf.put_u8(3);
            }
            Message::Have { piece_index } => {
                buf.put_u32(5);
                buf.put_u8(4);
                buf.put_u32(piece_index);
            }
            Message::Bitfield(bitfield) => {
                let raw = bitfield.into_vec();
                buf.put_u32(1 + raw.len() as u32);
                buf.put_u8(5);
                buf.put_slice(&raw);
            }
            Message::Request { index, begin, len } => {
                buf.put_u32(13);
                buf.put_u8(6);
                buf.put_u32(index);
                buf.put_u32(begin);
                buf.put_u32(len);
            }
            Message::Piece { index, begin, block } => {
                buf.put_u32(9 + block.len() as u32);
                buf.put_u8(7);
                buf.put_u32(index);
                buf.put_u32(begin);
                buf.put_slice(&block);
            }
            Message::Cancel { index, begin, len } => {
                buf.put_u32(13);
                buf.put_u8(8);
                buf.put_u32(index);
                buf.put_u32(begin);
                buf.put_u32(len);
            }
            Message::Port(port) => {
                buf.put_u32(3);
                buf.put_u8(9);
                buf.put_u16(port);
            }
        }
        Ok(())
    }
}

impl Decoder for PeerCodec {
    type Item = Message;
    type Error = Error;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Message>, Error> {
        if buf.len() < 4 {
            return Ok(None);
        }
        let len = u32::from_be_bytes(buf[0..4].try_into().unwrap());
        if len == 0 {
            buf.advance(4);
            return Ok(Some(Message::KeepAlive));
        }

        let frame_len = 4 + len as usize;
        if buf.len() < frame_len {
            buf.reserve(frame_len - buf.len());
            return Ok(None);
        }

        let id = buf[4];
        let payload = &buf[5..frame_len];

        let msg = match id {
            0 if len == 1 => Message::Choke,
            1 if len == 1 => Message::Unchoke,
            2 if len == 1 => Message::Interested,
            3 if len == 1 => Message::NotInterested,
            4 if len == 5 => Message::Have {
                piece_index: u32::from_be_bytes(payload[0..4].try_into().unwrap()),
            },
            5 => Message::Bitfield(Bitfield::from_vec(payload.to_vec())),
            6 if len == 13 => Message::Request {
                index: u32::from_be_bytes(payload[0..4].try_into().unwrap()),
                begin: u32::from_be_bytes(payload[4..8].try_into().unwrap()),
                len: u32::from_be_bytes(payload[8..12].try_into().unwrap()),
            },
            7 if len >= 9 => Message::Piece {
                index: u32::from_be_bytes(payload[0..4].try_into().unwrap()),
                begin: u32::from_be_bytes(payload[4..8].try_into().unwrap()),
                block: payload[8..].to_vec(),
            },
            8 if len == 13 => Message::Cancel {
                index: u32::from_be_bytes(payload[0..4].try_into().unwrap()),
                begin: u32::from_be_bytes(payload[4..8].try_into().unwrap()),
                len: u32::from_be_bytes(payload[8..12].try_into().unwrap()),
            },
            9 if len == 3 => Message::Port(u16::from_be_bytes(payload[0..2].try_into().unwrap())),
            0..=9 => {
                return Err(Error::InvalidMessageLength { id, len });
            }
            _ => return Err(Error::UnknownMessageId(id)),
        };

        buf.advance(frame_len);
        Ok(Some(msg))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handshake_round_trips() {
        let mut codec = HandshakeCodec;
        let handshake = Handshake::new([7u8; 20], [9u8; 20]);
        let mut buf = BytesMut::new();
        codec.encode(handshake.clone(), &mut buf).unwrap();
        assert_eq!(buf.len(), HANDSHAKE_LEN);

        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, handshake);
        assert!(buf.is_empty());
    }

    #[test]
    fn handshake_rejects_wrong_protocol_string() {
        let mut buf = BytesMut::new();
        buf.put_u8(4);
        buf.put_slice(b"xxxx");
        buf.put_slice(&[0u8; 8 + 20 + 20]);
        let mut codec = HandshakeCodec;
        assert!(matches!(codec.decode(&mut buf), Err(Error::InvalidHandshake)));
    }

    #[test]
    fn fixed_length_messages_round_trip() {
        let mut codec = PeerCodec;
        for msg in [
            Message::Choke,
            Message::Unchoke,
            Message::Interested,
            Message::NotInterested,
            Message::Have { piece_index: 42 },
            Message::Request {
                index: 1,
                begin: 2,
                len: 3,
            },
            Message::Cancel {
                index: 1,
                begin: 2,
                len: 3,
            },
            Message::Port(6881),
        ] {
            let mut buf = BytesMut::new();
            codec.encode(msg.clone(), &mut buf).unwrap();
            let decoded = codec.decode(&mut buf).unwrap().unwrap();
            assert_eq!(decoded, msg);
        }
    }

    #[test]
    fn keep_alive_is_a_zero_length_frame() {
        let mut codec = PeerCodec;
        let mut buf = BytesMut::new();
        codec.encode(Message::KeepAlive, &mut buf).unwrap();
        assert_eq!(&buf[..], &0u32.to_be_bytes());
        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, Message::KeepAlive);
    }

    #[test]
    fn piece_message_round_trips_with_block_payload() {
        let mut codec = PeerCodec;
        let msg = Message::Piece {
            index: 3,
            begin: 16384,
            block: vec![0xAB; 1024],
        };
        let mut buf = BytesMut::new();
        codec.encode(msg.clone(), &mut buf).unwrap();
        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn decode_waits_for_full_frame() {
        let mut codec = PeerCodec;
        let mut buf = BytesMut::new();
        codec.encode(Message::Have { piece_index: 1 }, &mut buf).unwrap();
        let mut partial = buf.split_to(buf.len() - 1);
        assert!(codec.decode(&mut partial).unwrap().is_none());
    }

    #[test]
    fn rejects_inconsistent_length_for_known_id() {
        let mut buf = BytesMut::new();
        buf.put_u32(2); // choke (id 0) must be length 1
        buf.put_u8(0);
        buf.put_u8(0);
        let mut codec = PeerCodec;
        assert!(matches!(
            codec.decode(&mut buf),
            Err(Error::InvalidMessageLength { id: 0, len: 2 })
        ));
    }
}
