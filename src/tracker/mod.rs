//! Tracker client: periodic HTTP announces that feed peer addresses into
//! the download driver's peer queue.
use crate::bencode::{self, BencodeValue};
use crate::config::Config;
use crate::torrent::Torrent;
use rand::Rng;
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};

#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("invalid announce url: {0}")]
    UrlParse(#[from] url::ParseError),

    #[error("invalid bencode in tracker response: {0}")]
    Bencode(#[from] bencode::BencodeError),

    #[error("malformed tracker response: {0}")]
    InvalidResponse(String),

    #[error("tracker reported failure: {0}")]
    TrackerFailure(String),

    #[error("tracker unreachable: http status {0}")]
    TrackerUnreachable(u16),

    #[error("tracker returned a dictionary-model peer list, which is unsupported")]
    UnsupportedPeerFormat,
}

pub type TrackerResult<T> = std::result::Result<T, TrackerError>;

/// The `event` announce parameter. Only `started` is ever sent, on the
/// first announce of a download (no seeding, so `completed`/`stopped`
/// carry no useful information to the tracker).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    Started,
}

impl Event {
    fn as_str(self) -> &'static str {
        match self {
            Event::Started => "started",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackerResponse {
    pub interval: Duration,
    pub complete: u32,
    pub incomplete: u32,
    pub peers: Vec<SocketAddr>,
}

/// A tracker client bound to a single torrent's swarm.
pub struct Tracker {
    http: reqwest::Client,
    announce_url: String,
    info_hash: [u8; 20],
    peer_id: [u8; 20],
    port: u16,
}

impl Tracker {
    pub fn new(torrent: &Torrent, config: &Config) -> Self {
        Self {
            http: reqwest::Client::new(),
            announce_url: torrent.announce_url.clone(),
            info_hash: torrent.info_hash,
            peer_id: generate_peer_id(),
            port: config.announce_port,
        }
    }

    pub fn peer_id(&self) -> [u8; 20] {
        self.peer_id
    }

    /// Issues one announce request.
    ///
    /// `left` is the number of bytes still to be downloaded, supplied by
    /// the caller rather than recomputed here so that the scheduler
    /// remains the sole owner of download progress.
    #[instrument(skip(self), level = "debug")]
    pub async fn announce(
        &self,
        event: Option<Event>,
        uploaded: u64,
        downloaded: u64,
        left: u64,
    ) -> TrackerResult<TrackerResponse> {
        // Built by hand rather than through `query_pairs_mut`: that encoder
        // applies `application/x-www-form-urlencoded` escaping on top of
        // whatever string it's given, which would re-escape every `%` in
        // our already-percent-encoded info_hash/peer_id (`%AB` becoming
        // `%25AB`) and send the tracker a corrupted 40-byte value.
        let mut query = format!(
            "info_hash={}&peer_id={}&port={}&uploaded={}&downloaded={}&left={}&compact=1",
            percent_encode_bytes(&self.info_hash),
            percent_encode_bytes(&self.peer_id),
            self.port,
            uploaded,
            downloaded,
            left,
        );
        if let Some(event) = event {
            query.push_str("&event=");
            query.push_str(event.as_str());
        }
        let mut url = url::Url::parse(&self.announce_url)?;
        url.set_query(Some(&query));

        debug!(%url, "sending tracker announce");
        let response = self.http.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(TrackerError::TrackerUnreachable(status.as_u16()));
        }
        let body = response.bytes().await?;
        parse_announce_response(&body)
    }
}

/// Percent-encodes raw bytes for use in a tracker announce query string.
/// `url::Url`'s query-pair encoder escapes based on UTF-8 text, which
/// mangles arbitrary binary info hashes/peer ids — this does the
/// byte-exact RFC 3986 encoding the protocol actually requires.
fn percent_encode_bytes(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 3);
    for &b in bytes {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' => {
                out.push(b as char);
            }
            _ => out.push_str(&format!("%{b:02X}")),
        }
    }
    out
}

fn parse_announce_response(body: &[u8]) -> TrackerResult<TrackerResponse> {
    let value = bencode::decode(body)?;
    let BencodeValue::Dict(dict) = value else {
        return Err(TrackerError::InvalidResponse("response is not a dictionary".into()));
    };

    if let Some(BencodeValue::String(reason)) = dict.get(b"failure reason") {
        let reason = String::from_utf8_lossy(reason).into_owned();
        return Err(TrackerError::TrackerFailure(reason));
    }

    let interval = match dict.get(b"interval") {
        Some(BencodeValue::Integer(secs)) if *secs >= 0 => Duration::from_secs(*secs as u64),
        _ => return Err(TrackerError::InvalidResponse("missing or invalid 'interval'".into())),
    };

    let complete = match dict.get(b"complete") {
        Some(BencodeValue::Integer(n)) => (*n).max(0) as u32,
        _ => 0,
    };
    let incomplete = match dict.get(b"incomplete") {
        Some(BencodeValue::Integer(n)) => (*n).max(0) as u32,
        _ => 0,
    };

    let peers = match dict.get(b"peers") {
        Some(BencodeValue::String(compact)) => parse_compact_peers(compact)?,
        Some(BencodeValue::List(_)) => return Err(TrackerError::UnsupportedPeerFormat),
        _ => return Err(TrackerError::InvalidResponse("missing 'peers'".into())),
    };

    Ok(TrackerResponse {
        interval,
        complete,
        incomplete,
        peers,
    })
}

/// Compact peer records: concatenated 6-byte entries (4-byte IPv4 address,
/// 2-byte big-endian port).
fn parse_compact_peers(bytes: &[u8]) -> TrackerResult<Vec<SocketAddr>> {
    if bytes.len() % 6 != 0 {
        return Err(TrackerError::InvalidResponse(
            "compact peer list length is not a multiple of 6".into(),
        ));
    }
    Ok(bytes
        .chunks_exact(6)
        .map(|chunk| {
            let ip = Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3]);
            let port = u16::from_be_bytes([chunk[4], chunk[5]]);
            SocketAddr::from((ip, port))
        })
        .collect())
}

/// Generates a peer id unique to this tracker instance: the azureus-style
/// prefix `-PC0001-` followed by 12 random decimal digits.
fn generate_peer_id() -> [u8; 20] {
    let mut id = [0u8; 20];
    id[..8].copy_from_slice(b"-PC0001-");
    let mut rng = rand::rng();
    for slot in &mut id[8..] {
        *slot = b'0' + rng.random_range(0..10);
    }
    id
}

/// Drives periodic announces for the life of a download, feeding newly
/// discovered peer addresses into `peer_tx`.
///
/// Mirrors the reference client's announce loop: the first call always
/// fires immediately with `event=started`; subsequent calls fire once
/// `interval` (initially `default_announce_interval`, then whatever the
/// tracker last returned) has elapsed since the previous announce,
/// otherwise the loop sleeps `poll_interval` and re-checks the elapsed
/// time rather than blocking for the whole `interval` in one sleep, so a
/// completed download is noticed promptly. `bytes_downloaded` is polled
/// fresh on every check so the reported `downloaded`/`left` stay current.
pub async fn run_announce_loop(
    tracker: Tracker,
    total_size: u64,
    peer_tx: mpsc::UnboundedSender<SocketAddr>,
    bytes_downloaded: impl Fn() -> u64 + 'static,
    default_announce_interval: Duration,
    poll_interval: Duration,
) {
    let mut interval = default_announce_interval;
    let mut previous: Option<tokio::time::Instant> = None;

    loop {
        let downloaded = bytes_downloaded();
        if downloaded >= total_size {
            info!("download complete, stopping announce loop");
            return;
        }

        let due = previous.is_none_or(|previous| previous.elapsed() >= interval);
        if !due {
            tokio::time::sleep(poll_interval).await;
            continue;
        }

        let event = if previous.is_none() { Some(Event::Started) } else { None };
        match tracker
            .announce(event, 0, downloaded, total_size.saturating_sub(downloaded))
            .await
        {
            Ok(response) => {
                interval = response.interval;
                info!(
                    peers = response.peers.len(),
                    complete = response.complete,
                    incomplete = response.incomplete,
                    "tracker announce succeeded"
                );
                for peer in response.peers {
                    if peer_tx.send(peer).is_err() {
                        return;
                    }
                }
            }
            Err(err) => {
                warn!(error = %err, "tracker announce failed, will retry at the next interval");
            }
        }
        previous = Some(tokio::time::Instant::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response_body(interval: i64, peers: &[u8]) -> Vec<u8> {
        let mut dict = bencode::BencodeDict::new();
        dict.insert(b"interval".to_vec(), BencodeValue::Integer(interval));
        dict.insert(b"peers".to_vec(), BencodeValue::String(peers.to_vec()));
        bencode::encode(&BencodeValue::Dict(dict)).unwrap()
    }

    #[test]
    fn parses_compact_peer_list() {
        let peers = [127, 0, 0, 1, 0x1A, 0xE1]; // 127.0.0.1:6881
        let body = response_body(1800, &peers);
        let response = parse_announce_response(&body).unwrap();
        assert_eq!(response.interval, Duration::from_secs(1800));
        assert_eq!(response.peers, vec![SocketAddr::from(([127, 0, 0, 1], 6881))]);
    }

    #[test]
    fn rejects_dictionary_model_peer_list() {
        let mut dict = bencode::BencodeDict::new();
        dict.insert(b"interval".to_vec(), BencodeValue::Integer(1800));
        dict.insert(b"peers".to_vec(), BencodeValue::List(vec![]));
        let body = bencode::encode(&BencodeValue::Dict(dict)).unwrap();
        let err = parse_announce_response(&body).unwrap_err();
        assert!(matches!(err, TrackerError::UnsupportedPeerFormat));
    }

    #[test]
    fn surfaces_failure_reason() {
        let mut dict = bencode::BencodeDict::new();
        dict.insert(
            b"failure reason".to_vec(),
            BencodeValue::String(b"unregistered torrent".to_vec()),
        );
        let body = bencode::encode(&BencodeValue::Dict(dict)).unwrap();
        let err = parse_announce_response(&body).unwrap_err();
        assert!(matches!(err, TrackerError::TrackerFailure(msg) if msg == "unregistered torrent"));
    }

    #[test]
    fn peer_id_has_expected_prefix() {
        let id = generate_peer_id();
        assert_eq!(&id[..8], b"-PC0001-");
        assert!(id[8..].iter().all(|b| b.is_ascii_digit()));
    }
}
