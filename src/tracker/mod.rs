//! The tracker announce client.
//!
//! A tracker is an HTTP server that manages the peers and stats of a
//! torrent. The client builds announce URLs over the flattened tier list
//! and falls back to the next URL when one fails; only after the whole
//! list fails does an announce error surface to the engine.

pub mod announce;
pub mod event;
mod http;

pub use announce::{AnnounceParams, AnnounceResponse};
pub use http::{HttpResponse, HttpTransport, ReqwestTransport};

use std::time::Duration;

use tracing::{debug, warn};

use crate::{
    error::Error, peer::PeerId, torrent::InfoHash, tracker::event::Event,
};

pub struct Tracker<T: HttpTransport> {
    transport: T,
    /// Only HTTP announce URLs, tier order preserved.
    announce_urls: Vec<String>,
    info_hash: InfoHash,
    peer_id: PeerId,
    port: u16,
    timeout: Duration,
    /// Index of the last URL that answered; announces start there.
    current: usize,
}

impl<T: HttpTransport> Tracker<T> {
    /// Keeps the `http://` entries of `announce_urls`. HTTPS and UDP
    /// trackers are out of scope for this client.
    pub fn new(
        transport: T,
        announce_urls: Vec<String>,
        info_hash: InfoHash,
        peer_id: PeerId,
        port: u16,
        timeout: Duration,
    ) -> Result<Self, Error> {
        let announce_urls: Vec<String> = announce_urls
            .into_iter()
            .filter(|url| url.starts_with("http://"))
            .collect();

        if announce_urls.is_empty() {
            return Err(Error::TrackerNoHosts);
        }

        Ok(Self {
            transport,
            announce_urls,
            info_hash,
            peer_id,
            port,
            timeout,
            current: 0,
        })
    }

    /// Announce to the first tracker that answers with a valid response,
    /// starting from the last one that did.
    pub async fn announce(
        &mut self,
        event: Event,
        downloaded: u64,
        uploaded: u64,
        left: u64,
    ) -> Result<AnnounceResponse, Error> {
        let params = AnnounceParams {
            info_hash: self.info_hash.clone(),
            peer_id: self.peer_id.clone(),
            port: self.port,
            uploaded,
            downloaded,
            left,
            event,
        };

        let total = self.announce_urls.len();
        let mut last_err = Error::TrackerNoHosts;

        for attempt in 0..total {
            let index = (self.current + attempt) % total;
            let url = params.build_url(&self.announce_urls[index]);
            debug!("announcing {:?} to {}", event, self.announce_urls[index]);

            let result = self.transport.get(&url, self.timeout).await;
            match result {
                Ok(response) if (200..300).contains(&response.status) => {
                    match AnnounceResponse::from_bencode(&response.body) {
                        Ok(response) => {
                            self.current = index;
                            debug!(
                                "tracker answered: interval={} peers={}",
                                response.interval,
                                response.peers.len()
                            );
                            return Ok(response);
                        }
                        Err(e) => {
                            warn!(
                                "tracker {} sent a bad response: {e}",
                                self.announce_urls[index]
                            );
                            last_err = e;
                        }
                    }
                }
                Ok(response) => {
                    warn!(
                        "tracker {} returned HTTP {}",
                        self.announce_urls[index], response.status
                    );
                    last_err = Error::TrackerStatus(response.status);
                }
                Err(e) => {
                    warn!(
                        "could not reach tracker {}: {e}",
                        self.announce_urls[index]
                    );
                    last_err = e;
                }
            }
        }

        Err(last_err)
    }
}
