//! A remote peer in the network that downloads and uploads data.
//!
//! Each peer runs as its own task. It owns the socket, keeps the remote's
//! bitfield and the request queue, and forwards every event that touches
//! shared state to the engine; the engine answers over [`PeerMsg`].
mod types;

// re-exports
pub use types::*;

use std::{sync::atomic::Ordering, sync::Arc, time::Duration};

use futures::{SinkExt, StreamExt};
use hashbrown::{HashMap, HashSet};
use tokio::{
    net::TcpStream,
    select,
    sync::{broadcast, mpsc, oneshot},
    time::{interval, interval_at, timeout, Instant},
};
use tokio_util::codec::{Framed, FramedParts};
use tracing::{debug, warn};

use crate::{
    bitfield::{Bitfield, PieceBitfield, Reserved},
    config::Config,
    error::Error,
    extensions::{metadata::MetadataMsg, ExtensionHandshake, UT_METADATA_ID},
    torrent::{PeerBrMsg, TorrentCtx, TorrentMsg},
    wire::{Handshake, HandshakeCodec, Message, MessageCodec},
};

/// How many metadata piece requests are kept in flight.
const MAX_INFLIGHT_INFO_REQUESTS: usize = 8;

/// Silent metadata requests are re-sent after this long.
const INFO_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// After this many metadata rejects the peer clearly won't serve us.
const MAX_METADATA_REJECTS: u32 = 3;

/// A remote peer in one of its connection states.
#[derive(Default)]
pub struct Peer<S: PeerState> {
    pub state: S,
}

impl Peer<Idle> {
    /// Do the handshake (and maybe the extended handshake), turning this
    /// into a connected peer.
    pub async fn handshake(
        self,
        socket: TcpStream,
        torrent_ctx: Arc<TorrentCtx>,
        config: Arc<Config>,
        have_info: bool,
        piece_count: usize,
        metadata_size: Option<u32>,
    ) -> Result<Peer<Connected>, Error> {
        let remote = socket.peer_addr()?;
        let mut socket = Framed::new(socket, HandshakeCodec);

        debug!("{remote} sending the first handshake");
        let our_handshake = Handshake::new(
            torrent_ctx.info_hash.clone(),
            torrent_ctx.local_peer_id.clone(),
        );
        socket.send(our_handshake).await?;

        let their_handshake =
            match timeout(config.read_timeout(), socket.next()).await {
                Ok(Some(Ok(handshake))) => handshake,
                Ok(Some(Err(e))) => return Err(e.into()),
                Ok(None) => return Err(Error::PeerClosedSocket),
                Err(_) => return Err(Error::HandshakeTimeout),
            };

        if !their_handshake.is_valid(&torrent_ctx.info_hash) {
            warn!("{remote} sent an invalid handshake, dropping");
            return Err(Error::HandshakeInvalid);
        }

        let supports_extension = their_handshake.supports_extension();
        let reserved = Reserved::from(their_handshake.reserved);

        // switch codecs without discarding what is already buffered
        let old_parts = socket.into_parts();
        let mut new_parts = FramedParts::new(old_parts.io, MessageCodec);
        new_parts.read_buf = old_parts.read_buf;
        new_parts.write_buf = old_parts.write_buf;
        let mut socket = Framed::from_parts(new_parts);

        // our extended handshake goes out first (BEP 10)
        if supports_extension {
            let ours = ExtensionHandshake::ours(
                metadata_size,
                config.local_peer_port,
            );
            debug!("{remote} sending extended handshake");
            socket.send(Message::Extended(0, ours.to_bencode())).await?;
        }

        // the optional bitfield, only when we have something
        {
            let (otx, orx) = oneshot::channel();
            torrent_ctx.tx.send(TorrentMsg::ReadBitfield(otx)).await?;
            let bitfield = orx.await?;
            if bitfield.any() {
                debug!("{remote} sending bitfield");
                socket.send(Message::Bitfield(bitfield)).await?;
            }
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let brx = torrent_ctx.btx.subscribe();
        let ctx =
            Arc::new(PeerCtx::new(tx, their_handshake.peer_id, remote));
        let (sink, stream) = socket.split();

        Ok(Peer {
            state: Connected {
                stream,
                sink,
                reserved,
                torrent_ctx,
                ctx,
                config,
                rx,
                brx,
                pieces: Bitfield::default(),
                extension: None,
                pending_requests: Default::default(),
                have_info,
                piece_count,
                inflight_info_requests: HashMap::new(),
                received_info_pieces: HashSet::new(),
                metadata_rejects: 0,
                last_frame: Instant::now(),
            },
        })
    }
}

impl Peer<Connected> {
    /// The event loop: wire frames in arrival order, engine messages, and
    /// the periodic ticks.
    pub async fn run(&mut self) -> Result<(), Error> {
        let remote = self.state.ctx.remote_addr;

        let mut keep_alive_interval = interval_at(
            Instant::now() + Duration::from_secs(120),
            Duration::from_secs(120),
        );
        // metadata requests, only while the info is unknown
        let mut info_interval = interval(Duration::from_secs(1));
        let mut idle_interval = interval(Duration::from_secs(5));

        loop {
            select! {
                _ = keep_alive_interval.tick() => {
                    self.state.sink.send(Message::KeepAlive).await?;
                }
                _ = info_interval.tick(), if !self.state.have_info => {
                    self.try_request_info().await?;
                }
                _ = idle_interval.tick() => {
                    let idle = self.state.last_frame.elapsed();
                    if idle > self.state.config.read_timeout() {
                        warn!("{remote} went silent for {idle:?}, dropping");
                        return Err(Error::PeerIdle);
                    }
                }
                msg = self.state.brx.recv() => {
                    match msg {
                        Ok(msg) => {
                            if self.handle_broadcast(msg).await? {
                                return Ok(());
                            }
                        }
                        // the engine is gone, nothing left to do
                        Err(broadcast::error::RecvError::Closed) => {
                            return Ok(());
                        }
                        Err(broadcast::error::RecvError::Lagged(_)) => {}
                    }
                }
                Some(msg) = self.state.rx.recv() => {
                    if self.handle_peer_msg(msg).await? {
                        return Ok(());
                    }
                }
                msg = self.state.stream.next() => {
                    match msg {
                        Some(Ok(msg)) => {
                            self.state.last_frame = Instant::now();
                            self.handle_wire_msg(msg).await?;
                        }
                        Some(Err(e)) => return Err(e),
                        None => return Err(Error::PeerClosedSocket),
                    }
                }
            }
        }
    }

    /// State updates happen in frame order, before the next frame is
    /// touched.
    async fn handle_wire_msg(&mut self, msg: Message) -> Result<(), Error> {
        let remote = self.state.ctx.remote_addr;
        let torrent_tx = self.state.torrent_ctx.tx.clone();

        match msg {
            Message::KeepAlive => {
                debug!("{remote} keepalive");
            }
            Message::Choke => {
                debug!("{remote} choke");
                self.state.ctx.peer_choking.store(true, Ordering::Relaxed);
                torrent_tx.send(TorrentMsg::PeerChoked(remote)).await?;
            }
            Message::Unchoke => {
                debug!("{remote} unchoke");
                self.state.ctx.peer_choking.store(false, Ordering::Relaxed);
                torrent_tx.send(TorrentMsg::PeerUnchoked(remote)).await?;
            }
            Message::Interested => {
                debug!("{remote} interested");
                self.state
                    .ctx
                    .peer_interested
                    .store(true, Ordering::Relaxed);
            }
            Message::NotInterested => {
                debug!("{remote} not interested");
                self.state
                    .ctx
                    .peer_interested
                    .store(false, Ordering::Relaxed);
            }
            Message::Have(piece) => {
                self.state.pieces.grow_and_set(piece);
                torrent_tx.send(TorrentMsg::PeerHave(remote, piece)).await?;
            }
            Message::Bitfield(bitfield) => {
                debug!("{remote} bitfield of len {}", bitfield.len());
                self.state.pieces = bitfield.clone();
                torrent_tx
                    .send(TorrentMsg::PeerBitfield(remote, bitfield))
                    .await?;
            }
            Message::Request(block_info) => {
                if !block_info.is_valid_request() {
                    return Err(Error::Protocol(
                        "peer requested an empty or oversize block",
                    ));
                }
                self.state.pending_requests.push_back(block_info);
                if !self.state.ctx.am_choking.load(Ordering::Relaxed) {
                    self.drain_pending_requests().await?;
                }
            }
            Message::Piece(block) => {
                if !block.is_valid() {
                    return Err(Error::Protocol(
                        "peer pushed an empty or oversize block",
                    ));
                }
                torrent_tx
                    .send(TorrentMsg::DownloadedBlock(remote, block))
                    .await?;
            }
            Message::Cancel(block_info) => {
                debug!("{remote} cancel {block_info:?}");
                self.state.pending_requests.retain(|r| *r != block_info);
            }
            Message::Extended(ext_id, payload) => {
                self.handle_extended(ext_id, payload).await?;
            }
        }
        Ok(())
    }

    async fn handle_extended(
        &mut self,
        ext_id: u8,
        payload: Vec<u8>,
    ) -> Result<(), Error> {
        let remote = self.state.ctx.remote_addr;

        match ext_id {
            // the reciprocal extended handshake
            0 => {
                let handshake = ExtensionHandshake::from_bencode(&payload)?;
                debug!("{remote} extended handshake {handshake:?}");

                if let Some(size) = handshake.metadata_size {
                    self.state
                        .torrent_ctx
                        .tx
                        .send(TorrentMsg::MetadataSize(size))
                        .await?;
                }
                self.state.extension = Some(handshake);
            }
            UT_METADATA_ID => match MetadataMsg::from_bytes(&payload)? {
                MetadataMsg::Request(piece) => {
                    debug!("{remote} requested metadata piece {piece}");
                    self.serve_info_piece(piece).await?;
                }
                MetadataMsg::Data { piece, total_size, payload } => {
                    debug!("{remote} sent metadata piece {piece}");
                    self.state.inflight_info_requests.remove(&piece);
                    self.state.received_info_pieces.insert(piece);
                    self.state
                        .torrent_ctx
                        .tx
                        .send(TorrentMsg::DownloadedInfoPiece(
                            total_size, piece, payload,
                        ))
                        .await?;
                }
                MetadataMsg::Reject(piece) => {
                    debug!("{remote} rejected metadata piece {piece}");
                    self.state.inflight_info_requests.remove(&piece);
                    self.state.metadata_rejects += 1;
                }
            },
            other => {
                debug!("{remote} message for unknown extension {other}");
            }
        }
        Ok(())
    }

    async fn handle_peer_msg(&mut self, msg: PeerMsg) -> Result<bool, Error> {
        let remote = self.state.ctx.remote_addr;

        match msg {
            PeerMsg::RequestBlocks(blocks) => {
                debug!("{remote} requesting {} blocks", blocks.len());
                for block in blocks {
                    self.state.sink.feed(Message::Request(block)).await?;
                }
                self.state.sink.flush().await?;
            }
            PeerMsg::SendBlock(block) => {
                let len = block.block.len() as u64;
                self.state.sink.send(Message::Piece(block)).await?;
                self.state.ctx.counter.record_upload(len);
            }
            PeerMsg::Interested => {
                self.state.ctx.am_interested.store(true, Ordering::Relaxed);
                self.state.sink.send(Message::Interested).await?;
            }
            PeerMsg::NotInterested => {
                self.state.ctx.am_interested.store(false, Ordering::Relaxed);
                self.state.sink.send(Message::NotInterested).await?;
            }
            PeerMsg::Choke => {
                self.state.ctx.am_choking.store(true, Ordering::Relaxed);
                self.state.sink.send(Message::Choke).await?;
            }
            PeerMsg::Unchoke => {
                self.state.ctx.am_choking.store(false, Ordering::Relaxed);
                self.state.sink.send(Message::Unchoke).await?;
                self.drain_pending_requests().await?;
            }
            PeerMsg::Quit => {
                debug!("{remote} quit");
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn handle_broadcast(
        &mut self,
        msg: PeerBrMsg,
    ) -> Result<bool, Error> {
        match msg {
            PeerBrMsg::HavePiece(piece) => {
                // only tell peers that don't have it
                if !self.state.pieces.has(piece) {
                    self.state.sink.send(Message::Have(piece)).await?;
                }
            }
            PeerBrMsg::HaveInfo(piece_count) => {
                self.state.have_info = true;
                self.state.piece_count = piece_count;
                self.state.inflight_info_requests.clear();
                self.state.pieces.resize(piece_count, false);
            }
            PeerBrMsg::Quit => return Ok(true),
        }
        Ok(false)
    }

    /// Forward queued REQUESTs to the engine, oldest first. Only called
    /// while we are not choking the peer.
    async fn drain_pending_requests(&mut self) -> Result<(), Error> {
        let remote = self.state.ctx.remote_addr;
        while let Some(request) = self.state.pending_requests.pop_front() {
            self.state
                .torrent_ctx
                .tx
                .send(TorrentMsg::BlockRequest(remote, request))
                .await?;
        }
        Ok(())
    }

    /// Answer a metadata request with the piece, or a reject when we don't
    /// have the info (yet).
    async fn serve_info_piece(&mut self, piece: u32) -> Result<(), Error> {
        let Some(remote_id) =
            self.state.extension.as_ref().and_then(|e| e.m.ut_metadata)
        else {
            // the peer asked without ever telling us its own id
            return Ok(());
        };

        let (otx, orx) = oneshot::channel();
        self.state
            .torrent_ctx
            .tx
            .send(TorrentMsg::RequestInfoPiece(piece, otx))
            .await?;

        let msg = match orx.await? {
            Some((total_size, payload)) => {
                MetadataMsg::Data { piece, total_size, payload }
            }
            None => MetadataMsg::Reject(piece),
        };

        self.state
            .sink
            .send(Message::Extended(remote_id, msg.to_bytes()))
            .await?;
        Ok(())
    }

    /// Request metadata pieces from this peer if it supports the metadata
    /// extension and we still lack the info. Re-requests silent pieces.
    async fn try_request_info(&mut self) -> Result<(), Error> {
        if self.state.have_info
            || self.state.metadata_rejects >= MAX_METADATA_REJECTS
        {
            return Ok(());
        }

        let Some(extension) = &self.state.extension else {
            return Ok(());
        };
        let (Some(ut_metadata), Some(metadata_size)) =
            (extension.m.ut_metadata, extension.metadata_size)
        else {
            return Ok(());
        };

        let remote = self.state.ctx.remote_addr;
        let total = MetadataMsg::piece_count(metadata_size);
        let now = Instant::now();

        // re-request what timed out
        let stale: Vec<u32> = self
            .state
            .inflight_info_requests
            .iter()
            .filter(|(_, at)| now.duration_since(**at) > INFO_REQUEST_TIMEOUT)
            .map(|(piece, _)| *piece)
            .collect();

        for piece in stale {
            debug!("{remote} re-requesting silent metadata piece {piece}");
            self.state
                .sink
                .send(Message::Extended(
                    ut_metadata,
                    MetadataMsg::Request(piece).to_bytes(),
                ))
                .await?;
            self.state.inflight_info_requests.insert(piece, now);
        }

        let slots = MAX_INFLIGHT_INFO_REQUESTS
            .saturating_sub(self.state.inflight_info_requests.len());

        let wanted: Vec<u32> = (0..total)
            .filter(|piece| {
                !self.state.received_info_pieces.contains(piece)
                    && !self.state.inflight_info_requests.contains_key(piece)
            })
            .take(slots)
            .collect();

        for piece in wanted {
            debug!("{remote} requesting metadata piece {piece}");
            self.state
                .sink
                .send(Message::Extended(
                    ut_metadata,
                    MetadataMsg::Request(piece).to_bytes(),
                ))
                .await?;
            self.state.inflight_info_requests.insert(piece, now);
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::torrent::{InfoHash, TorrentMsg};
    use crate::disk::DiskMsg;
    use tokio::{net::TcpListener, spawn, sync::broadcast};

    fn test_ctx(
        info_hash: InfoHash,
    ) -> (Arc<TorrentCtx>, mpsc::Receiver<TorrentMsg>) {
        let (tx, rx) = mpsc::channel(64);
        let (btx, _) = broadcast::channel(64);
        let (disk_tx, _disk_rx) = mpsc::channel::<DiskMsg>(1);
        std::mem::forget(_disk_rx);

        let ctx = Arc::new(TorrentCtx {
            tx,
            btx,
            disk_tx,
            info_hash,
            local_peer_id: PeerId::gen(),
        });
        (ctx, rx)
    }

    /// Answer the ReadBitfield the handshake asks for.
    fn serve_bitfield(mut rx: mpsc::Receiver<TorrentMsg>) {
        spawn(async move {
            while let Some(msg) = rx.recv().await {
                if let TorrentMsg::ReadBitfield(otx) = msg {
                    let _ = otx.send(Bitfield::default());
                }
            }
        });
    }

    #[tokio::test]
    async fn outbound_handshake_succeeds() {
        let info_hash = InfoHash([3u8; 20]);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let their_hash = info_hash.clone();
        let remote = spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let mut framed = Framed::new(socket, HandshakeCodec);

            let theirs = framed.next().await.unwrap().unwrap();
            assert!(theirs.is_valid(&their_hash));

            framed
                .send(Handshake::new(their_hash, PeerId([9u8; 20])))
                .await
                .unwrap();
            // hold the socket open until the test is done
            tokio::time::sleep(Duration::from_secs(1)).await;
        });

        let (ctx, rx) = test_ctx(info_hash);
        serve_bitfield(rx);

        let socket = TcpStream::connect(addr).await.unwrap();
        let peer = Peer::<Idle>::new()
            .handshake(
                socket,
                ctx,
                Arc::new(Config::test_default()),
                true,
                4,
                None,
            )
            .await
            .unwrap();

        assert_eq!(peer.state.ctx.id, PeerId([9u8; 20]));
        assert!(peer.state.ctx.am_choking.load(Ordering::Relaxed));
        assert!(peer.state.ctx.peer_choking.load(Ordering::Relaxed));
        assert!(!peer.state.ctx.am_interested.load(Ordering::Relaxed));
        assert!(!peer.state.ctx.peer_interested.load(Ordering::Relaxed));

        remote.abort();
    }

    #[tokio::test]
    async fn handshake_with_wrong_info_hash_aborts() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let remote = spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let mut framed = Framed::new(socket, HandshakeCodec);
            let _ = framed.next().await;
            // answer for a different torrent
            framed
                .send(Handshake::new(
                    InfoHash([0xee; 20]),
                    PeerId([9u8; 20]),
                ))
                .await
                .unwrap();
            tokio::time::sleep(Duration::from_secs(1)).await;
        });

        let (ctx, rx) = test_ctx(InfoHash([3u8; 20]));
        serve_bitfield(rx);

        let socket = TcpStream::connect(addr).await.unwrap();
        let result = Peer::<Idle>::new()
            .handshake(
                socket,
                ctx,
                Arc::new(Config::test_default()),
                true,
                4,
                None,
            )
            .await;

        assert!(matches!(result, Err(Error::HandshakeInvalid)));
        remote.abort();
    }
}
