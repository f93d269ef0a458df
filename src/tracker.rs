//! The HTTP tracker client: `announce` and BEP 48 `scrape`.
//!
//! Grounded on the original implementation's `Tracker` class (URL assembly,
//! the `d8:interval` prefix-scan tolerance for stray bytes before the
//! bencoded body) but built on `reqwest` rather than raw sockets, matching
//! the teacher's dependency stack.

use percent_encoding::{percent_encode, AsciiSet, CONTROLS};
use url::Url;

use crate::error::{Error, Result};
use crate::metainfo::{decode, Value};
use crate::{PeerId, Sha1Hash};

/// Everything not in the unreserved-character set gets percent-encoded,
/// matching the lowercase hex escaping BEP 3 expects for `info_hash`.
const ENCODE_SET: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'<')
    .add(b'>')
    .add(b'?')
    .add(b'`')
    .add(b'{')
    .add(b'}')
    .add(b'%')
    .add(b'/')
    .add(b':')
    .add(b'+')
    .add(b'&')
    .add(b'=');

/// One entry of a tracker's peer list.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct TrackerPeer {
    pub ip: String,
    pub port: u16,
    /// Absent (empty) when the tracker used the compact peer format, which
    /// carries no peer id.
    pub peer_id: Option<PeerId>,
}

/// A successful `announce` response.
#[derive(Clone, Debug)]
pub(crate) struct AnnounceResponse {
    pub peers: Vec<TrackerPeer>,
    pub interval_secs: u64,
}

/// Per-torrent scrape statistics for one info hash.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) struct ScrapeStats {
    pub complete: i64,
    pub downloaded: i64,
    pub incomplete: i64,
}

pub(crate) struct Tracker {
    client: reqwest::Client,
    announce_url: String,
    info_hash: Sha1Hash,
    peer_id: PeerId,
    client_port: u16,
}

impl Tracker {
    pub fn new(announce_url: String, info_hash: Sha1Hash, peer_id: PeerId, client_port: u16) -> Self {
        Self {
            client: reqwest::Client::new(),
            announce_url,
            info_hash,
            peer_id,
            client_port,
        }
    }

    fn encoded_info_hash(&self) -> String {
        percent_encode(&self.info_hash, ENCODE_SET).to_string()
    }

    /// Issues a single announce request; the caller (the periodic-announce
    /// loop) is responsible for retrying on failure.
    pub async fn announce(&self, uploaded: u64, downloaded: u64, left: u64, compact: bool) -> Result<AnnounceResponse> {
        let mut url = Url::parse(&self.announce_url).map_err(|_| Error::InvalidTrackerUrl)?;
        url.query_pairs_mut()
            .append_pair("peer_id", &String::from_utf8_lossy(&self.peer_id))
            .append_pair("port", &self.client_port.to_string())
            .append_pair("uploaded", &uploaded.to_string())
            .append_pair("downloaded", &downloaded.to_string())
            .append_pair("left", &left.to_string())
            .append_pair("compact", if compact { "1" } else { "0" });
        // info_hash is appended manually so its percent-encoding is exact
        // raw-byte escaping rather than `url`'s form-encoding.
        let mut url_str = url.to_string();
        url_str.push_str(&format!("&info_hash={}", self.encoded_info_hash()));

        let response = self
            .client
            .get(&url_str)
            .send()
            .await
            .map_err(|e| Error::TrackerHttp(e.to_string()))?;
        if !response.status().is_success() {
            return Err(Error::TrackerHttp(format!("http status {}", response.status())));
        }
        let body = response.bytes().await.map_err(|e| Error::TrackerHttp(e.to_string()))?;

        let body = find_bencode_dict_start(&body);
        let (value, _) = decode(body, 0).map_err(|_| Error::TrackerResponse("malformed bencode".into()))?;
        let dict = value
            .as_dict()
            .map_err(|_| Error::TrackerResponse("response is not a dictionary".into()))?;

        let interval = dict
            .get(b"interval".as_slice())
            .ok_or_else(|| Error::TrackerResponse("missing interval".into()))?
            .as_int()
            .map_err(|_| Error::TrackerResponse("interval is not an integer".into()))?;

        let peers_value = dict
            .get(b"peers".as_slice())
            .ok_or_else(|| Error::TrackerResponse("missing peers".into()))?;
        let peers = parse_peers(peers_value)?;

        Ok(AnnounceResponse {
            peers,
            interval_secs: interval.max(0) as u64,
        })
    }

    /// Scrapes per BEP 48: substitutes the `announce` token of the announce
    /// URL's last path segment with `scrape`, leaving the rest of the path,
    /// query, host, port, and scheme untouched.
    pub async fn scrape(&self) -> Result<ScrapeStats> {
        let scrape_url = self.scrape_url()?;

        let url = Url::parse(&scrape_url).map_err(|_| Error::InvalidTrackerUrl)?;
        let mut url_str = url.to_string();
        let separator = if url_str.contains('?') { "&" } else { "?" };
        url_str.push_str(&format!("{}info_hash={}", separator, self.encoded_info_hash()));

        let response = self
            .client
            .get(&url_str)
            .send()
            .await
            .map_err(|e| Error::TrackerHttp(e.to_string()))?;
        if !response.status().is_success() {
            return Err(Error::TrackerHttp(format!("http status {}", response.status())));
        }
        let body = response.bytes().await.map_err(|e| Error::TrackerHttp(e.to_string()))?;

        let body = find_bencode_dict_start(&body);
        let (value, _) = decode(body, 0).map_err(|_| Error::TrackerResponse("malformed bencode".into()))?;
        let dict = value
            .as_dict()
            .map_err(|_| Error::TrackerResponse("response is not a dictionary".into()))?;
        let files = dict
            .get(b"files".as_slice())
            .ok_or_else(|| Error::TrackerResponse("missing files".into()))?
            .as_dict()
            .map_err(|_| Error::TrackerResponse("files is not a dictionary".into()))?;

        let stats = files
            .get(self.info_hash.as_slice())
            .ok_or_else(|| Error::TrackerResponse("info hash not present in scrape response".into()))?
            .as_dict()
            .map_err(|_| Error::TrackerResponse("scrape entry is not a dictionary".into()))?;

        let get_i64 = |key: &[u8]| -> i64 {
            stats
                .get(key)
                .and_then(|v| v.as_int().ok())
                .unwrap_or(0)
        };

        Ok(ScrapeStats {
            complete: get_i64(b"complete"),
            downloaded: get_i64(b"downloaded"),
            incomplete: get_i64(b"incomplete"),
        })
    }

    fn scrape_url(&self) -> Result<String> {
        let url = Url::parse(&self.announce_url).map_err(|_| Error::InvalidTrackerUrl)?;
        let mut segments: Vec<String> = url
            .path_segments()
            .ok_or(Error::ScrapeNotSupported)?
            .map(String::from)
            .collect();
        let last = segments.last_mut().ok_or(Error::ScrapeNotSupported)?;
        if !last.starts_with("announce") {
            return Err(Error::ScrapeNotSupported);
        }
        *last = format!("scrape{}", &last["announce".len()..]);

        let mut scrape_url = url.clone();
        scrape_url.set_path(&segments.join("/"));
        Ok(scrape_url.to_string())
    }
}

/// Tolerates chunked/trailer noise ahead of the bencoded body by scanning
/// forward to the first `d8:interval` (announce) the way the source does;
/// falls back to the start of the buffer if no such marker is found (e.g.
/// scrape responses, which start with `d5:files`).
fn find_bencode_dict_start(body: &[u8]) -> &[u8] {
    const MARKER: &[u8] = b"d8:interval";
    if let Some(pos) = body.windows(MARKER.len()).position(|w| w == MARKER) {
        &body[pos..]
    } else {
        body
    }
}

fn parse_peers(value: &Value) -> Result<Vec<TrackerPeer>> {
    match value {
        Value::List(entries) => entries
            .iter()
            .map(|entry| {
                let dict = entry
                    .as_dict()
                    .map_err(|_| Error::TrackerResponse("peer entry is not a dictionary".into()))?;
                let ip = dict
                    .get(b"ip".as_slice())
                    .ok_or_else(|| Error::TrackerResponse("peer missing ip".into()))?
                    .as_bytes()?;
                let ip = String::from_utf8_lossy(ip).into_owned();
                let port = dict
                    .get(b"port".as_slice())
                    .ok_or_else(|| Error::TrackerResponse("peer missing port".into()))?
                    .as_int()? as u16;
                let peer_id = dict
                    .get(b"peer id".as_slice())
                    .and_then(|v| v.as_bytes().ok())
                    .and_then(|b| <[u8; 20]>::try_from(b).ok());
                Ok(TrackerPeer { ip, port, peer_id })
            })
            .collect(),
        Value::Bytes(raw) => {
            if raw.len() % 6 != 0 {
                return Err(Error::TrackerResponse(
                    "compact peers field is not a multiple of 6 bytes".into(),
                ));
            }
            Ok(raw
                .chunks_exact(6)
                .map(|chunk| {
                    let ip = format!("{}.{}.{}.{}", chunk[0], chunk[1], chunk[2], chunk[3]);
                    let port = u16::from_be_bytes([chunk[4], chunk[5]]);
                    TrackerPeer {
                        ip,
                        port,
                        peer_id: None,
                    }
                })
                .collect())
        }
        _ => Err(Error::TrackerResponse("peers field has unexpected type".into())),
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn tracker_for(url: &str) -> Tracker {
        Tracker::new(url.to_string(), [1u8; 20], [2u8; 20], 6881)
    }

    #[test]
    fn scrape_url_substitutes_announce_token_only() {
        let tracker = tracker_for("http://example.com/x/announce.php");
        assert_eq!(tracker.scrape_url().unwrap(), "http://example.com/x/scrape.php");
    }

    #[test]
    fn scrape_url_rejected_when_last_segment_has_no_announce_token() {
        let tracker = tracker_for("http://example.com/x/track");
        assert!(tracker.scrape_url().is_err());
    }

    #[test]
    fn parses_compact_peer_list() {
        let raw = vec![127, 0, 0, 1, 0x1A, 0xE1, 10, 0, 0, 2, 0x1A, 0xE1];
        let value = Value::Bytes(raw);
        let peers = parse_peers(&value).unwrap();
        assert_eq!(peers.len(), 2);
        assert_eq!(peers[0].ip, "127.0.0.1");
        assert_eq!(peers[0].port, 6881);
        assert_eq!(peers[1].ip, "10.0.0.2");
    }

    #[test]
    fn tolerates_leading_noise_before_announce_body() {
        let mut buf = b"\r\nHTTP/1.1 200 OK\r\n\r\n".to_vec();
        buf.extend_from_slice(b"d8:intervali1800e5:peers0:e");
        let body = find_bencode_dict_start(&buf);
        assert!(body.starts_with(b"d8:interval"));
    }

    #[tokio::test]
    async fn announce_performs_the_http_round_trip() {
        let mut server = mockito::Server::new_async().await;
        let body = b"d8:intervali1800e5:peers12:\x7f\0\0\x01\x1a\xe1\n\0\0\x02\x1a\xe2e";
        let _mock = server
            .mock("GET", mockito::Matcher::Regex("^/announce".into()))
            .with_status(200)
            .with_body(&body[..])
            .create_async()
            .await;

        let tracker = tracker_for(&format!("{}/announce", server.url()));
        let response = tracker.announce(0, 0, 100, true).await.unwrap();

        assert_eq!(response.interval_secs, 1800);
        assert_eq!(response.peers.len(), 2);
        assert_eq!(response.peers[0].ip, "127.0.0.1");
        assert_eq!(response.peers[0].port, 6881);
    }

    #[tokio::test]
    async fn announce_surfaces_tracker_http_errors() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", mockito::Matcher::Regex("^/announce".into()))
            .with_status(500)
            .create_async()
            .await;

        let tracker = tracker_for(&format!("{}/announce", server.url()));
        let err = tracker.announce(0, 0, 100, true).await.unwrap_err();
        assert!(matches!(err, Error::TrackerHttp(_)));
    }

    #[tokio::test]
    async fn scrape_performs_the_http_round_trip() {
        let mut server = mockito::Server::new_async().await;
        let info_hash = [1u8; 20];
        let mut body = b"d5:filesd20:".to_vec();
        body.extend_from_slice(&info_hash);
        body.extend_from_slice(b"d8:completei3e10:downloadedi9e10:incompletei1eeee");
        let _mock = server
            .mock("GET", mockito::Matcher::Regex("^/scrape".into()))
            .with_status(200)
            .with_body(body)
            .create_async()
            .await;

        let tracker = Tracker::new(format!("{}/announce", server.url()), info_hash, [2u8; 20], 6881);
        let stats = tracker.scrape().await.unwrap();

        assert_eq!(
            stats,
            ScrapeStats {
                complete: 3,
                downloaded: 9,
                incomplete: 1,
            }
        );
    }
}
