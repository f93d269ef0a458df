//! Parsing of `.torrent` files: a small recursive-descent bencode decoder
//! and the `Metainfo`/`Info` types it produces.
//!
//! The info hash is computed over the *raw bytes* of the `info` dictionary
//! as they appear in the source file, rather than by re-encoding a parsed
//! structure. Bencode is a canonical encoding, so the two approaches yield
//! identical digests, but working from the original span sidesteps the need
//! for a general-purpose encoder and is immune to any decoder/encoder
//! round-trip mismatch.

use std::collections::BTreeMap;

use sha1::{Digest, Sha1};

use crate::error::{Error, Result};
use crate::Sha1Hash;

/// A decoded bencode value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    Int(i64),
    Bytes(Vec<u8>),
    List(Vec<Value>),
    Dict(BTreeMap<Vec<u8>, Value>),
}

impl Value {
    pub fn as_bytes(&self) -> Result<&[u8]> {
        match self {
            Value::Bytes(b) => Ok(b),
            _ => Err(Error::Bencode("expected byte string".into())),
        }
    }

    pub fn as_int(&self) -> Result<i64> {
        match self {
            Value::Int(i) => Ok(*i),
            _ => Err(Error::Bencode("expected integer".into())),
        }
    }

    pub fn as_dict(&self) -> Result<&BTreeMap<Vec<u8>, Value>> {
        match self {
            Value::Dict(d) => Ok(d),
            _ => Err(Error::Bencode("expected dictionary".into())),
        }
    }

    pub fn as_list(&self) -> Result<&[Value]> {
        match self {
            Value::List(l) => Ok(l),
            _ => Err(Error::Bencode("expected list".into())),
        }
    }
}

/// Decodes a single bencode value starting at `pos`, returning the value
/// and the offset of the first byte after it.
pub fn decode(data: &[u8], pos: usize) -> Result<(Value, usize)> {
    match data.get(pos) {
        Some(b'i') => decode_int(data, pos),
        Some(b'l') => decode_list(data, pos),
        Some(b'd') => decode_dict(data, pos),
        Some(c) if c.is_ascii_digit() => decode_bytes(data, pos),
        _ => Err(Error::Bencode(format!("unexpected byte at offset {}", pos))),
    }
}

fn decode_int(data: &[u8], pos: usize) -> Result<(Value, usize)> {
    debug_assert_eq!(data[pos], b'i');
    let end = find(data, pos + 1, b'e')?;
    let s = std::str::from_utf8(&data[pos + 1..end])
        .map_err(|_| Error::Bencode("non-utf8 integer".into()))?;
    let n = s
        .parse::<i64>()
        .map_err(|_| Error::Bencode(format!("invalid integer literal: {}", s)))?;
    Ok((Value::Int(n), end + 1))
}

fn decode_bytes(data: &[u8], pos: usize) -> Result<(Value, usize)> {
    let colon = find(data, pos, b':')?;
    let len_str = std::str::from_utf8(&data[pos..colon])
        .map_err(|_| Error::Bencode("non-utf8 byte string length".into()))?;
    let len = len_str
        .parse::<usize>()
        .map_err(|_| Error::Bencode(format!("invalid byte string length: {}", len_str)))?;
    let start = colon + 1;
    let end = start
        .checked_add(len)
        .ok_or_else(|| Error::Bencode("byte string length overflow".into()))?;
    if end > data.len() {
        return Err(Error::Bencode("byte string runs past end of input".into()));
    }
    Ok((Value::Bytes(data[start..end].to_vec()), end))
}

fn decode_list(data: &[u8], pos: usize) -> Result<(Value, usize)> {
    debug_assert_eq!(data[pos], b'l');
    let mut items = Vec::new();
    let mut pos = pos + 1;
    loop {
        match data.get(pos) {
            Some(b'e') => return Ok((Value::List(items), pos + 1)),
            Some(_) => {
                let (value, next) = decode(data, pos)?;
                items.push(value);
                pos = next;
            }
            None => return Err(Error::Bencode("unterminated list".into())),
        }
    }
}

fn decode_dict(data: &[u8], pos: usize) -> Result<(Value, usize)> {
    debug_assert_eq!(data[pos], b'd');
    let mut map = BTreeMap::new();
    let mut pos = pos + 1;
    loop {
        match data.get(pos) {
            Some(b'e') => return Ok((Value::Dict(map), pos + 1)),
            Some(_) => {
                let (key, next) = decode_bytes(data, pos)?;
                let key = match key {
                    Value::Bytes(b) => b,
                    _ => unreachable!(),
                };
                let (value, next) = decode(data, next)?;
                map.insert(key, value);
                pos = next;
            }
            None => return Err(Error::Bencode("unterminated dictionary".into())),
        }
    }
}

fn find(data: &[u8], from: usize, needle: u8) -> Result<usize> {
    data[from..]
        .iter()
        .position(|&b| b == needle)
        .map(|i| from + i)
        .ok_or_else(|| Error::Bencode("malformed length prefix".into()))
}

/// Parses the top-level dictionary of a `.torrent` file, additionally
/// recording the raw byte span of its `info` value (needed to compute the
/// info hash without re-encoding).
fn decode_top_level(data: &[u8]) -> Result<(BTreeMap<Vec<u8>, Value>, Option<(usize, usize)>)> {
    if data.first() != Some(&b'd') {
        return Err(Error::Bencode("metainfo is not a bencoded dictionary".into()));
    }
    let mut map = BTreeMap::new();
    let mut info_span = None;
    let mut pos = 1;
    loop {
        match data.get(pos) {
            Some(b'e') => break,
            Some(_) => {
                let (key, next) = decode_bytes(data, pos)?;
                let key = match key {
                    Value::Bytes(b) => b,
                    _ => unreachable!(),
                };
                let value_start = next;
                let (value, value_end) = decode(data, value_start)?;
                if key == b"info" {
                    info_span = Some((value_start, value_end));
                }
                map.insert(key, value);
                pos = value_end;
            }
            None => return Err(Error::Bencode("unterminated dictionary".into())),
        }
    }
    Ok((map, info_span))
}

/// The `info` dictionary of a single-file torrent.
#[derive(Debug, Clone)]
pub struct Info {
    /// The suggested name of the downloaded file.
    pub name: String,
    /// The length, in bytes, of each piece except possibly the last.
    pub piece_length: u32,
    /// The concatenation of each piece's 20-byte SHA-1 hash.
    pub pieces: Vec<Sha1Hash>,
    /// The total length, in bytes, of the file.
    pub length: u64,
}

impl Info {
    /// Returns the number of pieces the torrent is split into.
    pub fn piece_count(&self) -> usize {
        self.pieces.len()
    }

    fn from_value(value: &Value) -> Result<Self> {
        let dict = value.as_dict()?;

        if dict.contains_key(b"files".as_slice()) {
            return Err(Error::MultiFileTorrentUnsupported);
        }

        let name = dict
            .get(b"name".as_slice())
            .ok_or(Error::MissingField("info.name"))?
            .as_bytes()?;
        let name = String::from_utf8_lossy(name).into_owned();

        let piece_length = dict
            .get(b"piece length".as_slice())
            .ok_or(Error::MissingField("info.piece length"))?
            .as_int()?;
        let piece_length = u32::try_from(piece_length)
            .map_err(|_| Error::Bencode("piece length out of range".into()))?;

        let length = dict
            .get(b"length".as_slice())
            .ok_or(Error::MissingField("info.length"))?
            .as_int()?;
        let length = u64::try_from(length)
            .map_err(|_| Error::Bencode("length out of range".into()))?;

        let raw_pieces = dict
            .get(b"pieces".as_slice())
            .ok_or(Error::MissingField("info.pieces"))?
            .as_bytes()?;
        if raw_pieces.len() % 20 != 0 {
            return Err(Error::Bencode(
                "pieces field is not a multiple of 20 bytes".into(),
            ));
        }
        let pieces = raw_pieces
            .chunks_exact(20)
            .map(|chunk| {
                let mut hash = [0u8; 20];
                hash.copy_from_slice(chunk);
                hash
            })
            .collect();

        Ok(Self {
            name,
            piece_length,
            pieces,
            length,
        })
    }
}

/// The parsed contents of a `.torrent` file.
#[derive(Debug, Clone)]
pub struct Metainfo {
    /// The tracker's announce URL.
    pub announce: String,
    /// The single-file info dictionary.
    pub info: Info,
    /// The SHA-1 digest of the raw `info` dictionary bytes.
    pub info_hash: Sha1Hash,
}

impl Metainfo {
    /// Parses a `.torrent` file's contents.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let (dict, info_span) = decode_top_level(data)?;

        let announce = dict
            .get(b"announce".as_slice())
            .ok_or(Error::MissingField("announce"))?
            .as_bytes()?;
        let announce = String::from_utf8_lossy(announce).into_owned();

        let info_value = dict
            .get(b"info".as_slice())
            .ok_or(Error::MissingField("info"))?;
        let info = Info::from_value(info_value)?;

        let (start, end) = info_span.expect("info key was present in the dictionary");
        let info_hash = {
            let mut hasher = Sha1::new();
            hasher.update(&data[start..end]);
            let digest = hasher.finalize();
            let mut hash = [0u8; 20];
            hash.copy_from_slice(&digest);
            hash
        };

        Ok(Self {
            announce,
            info,
            info_hash,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_torrent_bytes() -> Vec<u8> {
        // A tiny single-piece, single-file torrent: "hello" (5 bytes).
        let piece_hash = Sha1::digest(b"hello");
        let mut data = Vec::new();
        data.extend_from_slice(b"d8:announce19:http://tracker.test4:info");
        data.extend_from_slice(b"d6:lengthi5e4:name5:hello12:piece lengthi16384e6:pieces20:");
        data.extend_from_slice(&piece_hash);
        data.extend_from_slice(b"ee");
        data
    }

    #[test]
    fn decodes_integers() {
        let (v, end) = decode(b"i42e", 0).unwrap();
        assert_eq!(v, Value::Int(42));
        assert_eq!(end, 4);

        let (v, _) = decode(b"i-7e", 0).unwrap();
        assert_eq!(v, Value::Int(-7));
    }

    #[test]
    fn decodes_byte_strings() {
        let (v, end) = decode(b"4:spam", 0).unwrap();
        assert_eq!(v, Value::Bytes(b"spam".to_vec()));
        assert_eq!(end, 6);
    }

    #[test]
    fn decodes_lists_and_dicts() {
        let (v, _) = decode(b"l4:spam4:eggse", 0).unwrap();
        assert_eq!(
            v,
            Value::List(vec![
                Value::Bytes(b"spam".to_vec()),
                Value::Bytes(b"eggs".to_vec())
            ])
        );

        let (v, _) = decode(b"d3:cow3:moo4:spam4:eggse", 0).unwrap();
        let dict = v.as_dict().unwrap();
        assert_eq!(dict.get(b"cow".as_slice()).unwrap().as_bytes().unwrap(), b"moo");
    }

    #[test]
    fn parses_single_file_metainfo_and_computes_info_hash() {
        let bytes = sample_torrent_bytes();
        let metainfo = Metainfo::from_bytes(&bytes).unwrap();
        assert_eq!(metainfo.announce, "http://tracker.test");
        assert_eq!(metainfo.info.name, "hello");
        assert_eq!(metainfo.info.length, 5);
        assert_eq!(metainfo.info.piece_count(), 1);

        // recompute independently over the known raw span to confirm the
        // hash really is over `info`'s bytes, not the whole file
        let info_start = bytes.windows(6).position(|w| w == b"4:info").unwrap() + 6;
        let mut hasher = Sha1::new();
        hasher.update(&bytes[info_start..bytes.len() - 1]);
        let expected = hasher.finalize();
        assert_eq!(&metainfo.info_hash[..], &expected[..]);
    }

    #[test]
    fn rejects_multi_file_torrents() {
        let mut data = Vec::new();
        data.extend_from_slice(b"d8:announce4:test4:info");
        data.extend_from_slice(b"d4:name1:x12:piece lengthi16384e5:files");
        data.extend_from_slice(b"ld6:lengthi1e4:pathl1:aeee");
        data.extend_from_slice(b"6:pieces0:ee");
        let err = Metainfo::from_bytes(&data).unwrap_err();
        assert!(matches!(err, Error::MultiFileTorrentUnsupported));
    }
}
