//! Announce request and response encoding.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use crate::{
    bencode::{self, Value},
    error::Error,
    peer::PeerId,
    torrent::InfoHash,
    tracker::event::Event,
    utils::percent_encode,
};

/// Everything an announce reports to the tracker.
#[derive(Debug, Clone)]
pub struct AnnounceParams {
    pub info_hash: InfoHash,
    pub peer_id: PeerId,
    pub port: u16,
    pub uploaded: u64,
    pub downloaded: u64,
    pub left: u64,
    pub event: Event,
}

impl AnnounceParams {
    /// Append the query parameters to an announce URL, with `?` or `&` as
    /// needed. `info_hash` and `peer_id` are raw bytes and go through
    /// byte-wise percent-encoding; the event is omitted when empty.
    pub fn build_url(&self, announce_url: &str) -> String {
        let separator = if announce_url.contains('?') { '&' } else { '?' };

        let mut url = format!(
            "{announce_url}{separator}info_hash={}&peer_id={}&port={}\
             &uploaded={}&downloaded={}&left={}&compact=1",
            percent_encode(&self.info_hash.0),
            percent_encode(&self.peer_id.0),
            self.port,
            self.uploaded,
            self.downloaded,
            self.left,
        );

        if self.event != Event::None {
            url.push_str("&event=");
            url.push_str(self.event.as_str());
        }
        url
    }
}

/// A successful announce: the refresh interval and the peer list.
#[derive(Debug, Clone, PartialEq)]
pub struct AnnounceResponse {
    pub interval: u32,
    pub complete: Option<u32>,
    pub incomplete: Option<u32>,
    pub peers: Vec<SocketAddr>,
}

impl AnnounceResponse {
    pub fn from_bencode(buf: &[u8]) -> Result<Self, Error> {
        let root = bencode::decode(buf)
            .map_err(|e| Error::Tracker(e.to_string()))?;
        if root.as_dict().is_none() {
            return Err(Error::Tracker(
                "response is not a dictionary".to_owned(),
            ));
        }

        if let Some(reason) = root.get(b"failure reason") {
            let reason = reason
                .as_utf8()
                .unwrap_or("tracker sent a non-UTF-8 failure reason");
            return Err(Error::Tracker(reason.to_owned()));
        }

        let interval = root
            .get(b"interval")
            .and_then(Value::as_int)
            .and_then(|v| u32::try_from(v).ok())
            .ok_or_else(|| {
                Error::Tracker("response is missing interval".to_owned())
            })?;

        let complete = root
            .get(b"complete")
            .and_then(Value::as_int)
            .and_then(|v| u32::try_from(v).ok());
        let incomplete = root
            .get(b"incomplete")
            .and_then(Value::as_int)
            .and_then(|v| u32::try_from(v).ok());

        let peers = match root.get(b"peers") {
            Some(Value::Str(compact)) => parse_compact_peers(compact)?,
            Some(Value::List(dicts)) => parse_peer_dicts(dicts),
            Some(_) => {
                return Err(Error::Tracker(
                    "peers is neither compact nor a list".to_owned(),
                ))
            }
            None => vec![],
        };

        Ok(Self { interval, complete, incomplete, peers })
    }
}

/// Support for BEP 23: 6 bytes per peer, `ipv4(4) || port_be(2)`.
fn parse_compact_peers(buf: &[u8]) -> Result<Vec<SocketAddr>, Error> {
    let chunks = buf.chunks_exact(6);
    if !chunks.remainder().is_empty() {
        return Err(Error::Tracker(
            "compact peer list is not a multiple of 6 bytes".to_owned(),
        ));
    }

    Ok(chunks
        .map(|chunk| {
            let ip = IpAddr::from(Ipv4Addr::new(
                chunk[0], chunk[1], chunk[2], chunk[3],
            ));
            let port = u16::from_be_bytes([chunk[4], chunk[5]]);
            (ip, port).into()
        })
        .collect())
}

/// The dictionary model: `{ip, port, peer id?}` entries, invalid ones
/// skipped.
fn parse_peer_dicts(dicts: &[Value]) -> Vec<SocketAddr> {
    dicts
        .iter()
        .filter_map(|entry| {
            let ip: IpAddr =
                entry.get(b"ip")?.as_utf8()?.parse().ok()?;
            let port = entry
                .get(b"port")?
                .as_int()
                .and_then(|v| u16::try_from(v).ok())?;
            Some((ip, port).into())
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(event: Event) -> AnnounceParams {
        AnnounceParams {
            info_hash: InfoHash([0xab; 20]),
            peer_id: PeerId([0x01; 20]),
            port: 6881,
            uploaded: 1,
            downloaded: 2,
            left: 3,
            event,
        }
    }

    #[test]
    fn url_appends_query_with_question_mark() {
        let url = params(Event::Started).build_url("http://tr.example/ann");
        assert_eq!(
            url,
            format!(
                "http://tr.example/ann?info_hash={}&peer_id={}&port=6881\
                 &uploaded=1&downloaded=2&left=3&compact=1&event=started",
                "%AB".repeat(20),
                "%01".repeat(20),
            )
        );
    }

    #[test]
    fn url_appends_with_ampersand_and_omits_empty_event() {
        let url = params(Event::None).build_url("http://tr.example/ann?key=1");
        assert!(url.starts_with("http://tr.example/ann?key=1&info_hash="));
        assert!(!url.contains("event="));
    }

    #[test]
    fn parses_compact_peer_list() {
        let body = b"d8:intervali900e5:peers12:\
            \x01\x02\x03\x04\x1a\xe1\x05\x06\x07\x08\x1a\xe1e";
        let response = AnnounceResponse::from_bencode(body).unwrap();

        assert_eq!(response.interval, 900);
        assert_eq!(
            response.peers,
            vec![
                "1.2.3.4:6881".parse().unwrap(),
                "5.6.7.8:6881".parse().unwrap(),
            ]
        );
    }

    #[test]
    fn rejects_ragged_compact_list() {
        let body = b"d8:intervali900e5:peers5:\x01\x02\x03\x04\x1ae";
        assert!(AnnounceResponse::from_bencode(body).is_err());
    }

    #[test]
    fn parses_dictionary_peer_list_skipping_invalid() {
        let body = b"d8:completei5e10:incompletei2e8:intervali60e5:peersl\
            d2:ip7:1.2.3.44:porti6881ee\
            d2:ip9:not-an-ip4:porti1ee\
            d2:ip7:5.6.7.8e\
            d2:ip7:9.9.9.94:porti42eeee";
        let response = AnnounceResponse::from_bencode(body).unwrap();

        assert_eq!(response.interval, 60);
        assert_eq!(response.complete, Some(5));
        assert_eq!(response.incomplete, Some(2));
        assert_eq!(
            response.peers,
            vec![
                "1.2.3.4:6881".parse().unwrap(),
                "9.9.9.9:42".parse().unwrap(),
            ]
        );
    }

    #[test]
    fn failure_reason_wins() {
        let body = b"d14:failure reason9:not found8:intervali900ee";
        match AnnounceResponse::from_bencode(body) {
            Err(Error::Tracker(reason)) => assert_eq!(reason, "not found"),
            other => panic!("expected tracker error, got {other:?}"),
        }
    }

    #[test]
    fn missing_interval_is_an_error() {
        let body = b"d5:peers0:e";
        assert!(AnnounceResponse::from_bencode(body).is_err());
    }
}
