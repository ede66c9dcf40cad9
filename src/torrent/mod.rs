//! The piece-exchange engine.
//!
//! A [`Torrent`] coordinates the whole download: it selects pieces,
//! dispatches block requests across peers, receives and verifies the
//! blocks, commits verified pieces to disk, services incoming requests,
//! and persists progress for the next run.
//!
//! Peers send [`TorrentMsg`]s into the engine's event loop and the engine
//! answers over [`PeerMsg`] channels, so every piece of shared state —
//! piece table, availability, assignments, counters — is only ever touched
//! from one place.

mod piece;
mod types;

// re-exports
pub use piece::*;
pub use types::*;

use std::{collections::BTreeMap, net::SocketAddr, sync::Arc, time::Duration};

use hashbrown::{HashMap, HashSet};
use rand::Rng;
use sha1::{Digest, Sha1};
use tokio::{
    net::TcpStream,
    select, spawn,
    sync::{broadcast, mpsc, oneshot},
    time::{interval_at, timeout, Instant},
};
use tracing::{debug, info, warn};

use crate::{
    bitfield::{Bitfield, PieceBitfield},
    config::Config,
    counter::Counter,
    disk::DiskMsg,
    error::Error,
    extensions::metadata::MetadataMsg,
    metainfo::Info,
    peer::{self, Peer, PeerCtx, PeerId, PeerMsg},
    tracker::{event::Event, HttpTransport, Tracker},
    utils::to_human_readable,
};

use std::sync::atomic::Ordering;

/// Regular unchoke slots; one more peer may be optimistically unchoked.
const MAX_UNCHOKED_PEERS: usize = 3;

/// Floor for the tracker-provided announce interval.
const MIN_ANNOUNCE_INTERVAL: u32 = 30;

/// Metadata watchdog: ticks without progress before a magnet start is
/// abandoned.
const MAX_METADATA_STALLS: u32 = 6;

/// The engine. One per torrent, driven by [`Torrent::run`] until the
/// download completes or a fatal error surfaces.
pub struct Torrent<T: HttpTransport> {
    pub ctx: Arc<TorrentCtx>,
    pub status: TorrentStatus,

    rx: mpsc::Receiver<TorrentMsg>,
    config: Arc<Config>,
    source: Source,
    /// The CLI input this torrent came from, recorded in the resume file.
    origin: String,
    name: String,
    tracker: Tracker<T>,
    stats: Stats,
    counter: Counter,

    info: Option<Info>,
    pieces: Vec<Piece>,
    /// Pieces we have verified, one bit per piece.
    bitfield: Bitfield,
    /// How many connected peers have each piece.
    availability: Vec<u32>,
    /// At most one in-flight piece per peer, one peer per piece.
    assignments: HashMap<SocketAddr, usize>,

    peers: Vec<Arc<PeerCtx>>,
    peer_pieces: HashMap<SocketAddr, Bitfield>,
    unchoked_peers: Vec<SocketAddr>,
    opt_unchoked_peer: Option<SocketAddr>,

    resume: Option<crate::resume::ResumeState>,

    /// Tracker peers not yet connected to.
    idle_peers: Vec<SocketAddr>,
    pending_connects: usize,
    ever_connected: bool,

    /// Metadata pieces while reconstructing the info from a magnet.
    info_pieces: BTreeMap<u32, Vec<u8>>,
    metadata_size: Option<u32>,
    metadata_stalls: u32,
    last_info_bytes: usize,
}

impl<T: HttpTransport> Torrent<T> {
    pub fn new(
        config: Arc<Config>,
        disk_tx: mpsc::Sender<DiskMsg>,
        source: Source,
        transport: T,
        origin: String,
    ) -> Result<Self, Error> {
        let info_hash = source.info_hash()?;
        let local_peer_id = PeerId::gen();

        let (tx, rx) = mpsc::channel(512);
        let (btx, _) = broadcast::channel(512);

        let tracker = Tracker::new(
            transport,
            source.announce_urls(),
            info_hash.clone(),
            local_peer_id.clone(),
            config.local_peer_port,
            config.tracker_timeout(),
        )
        .map_err(|e| match (&source, e) {
            (Source::Magnet(_), Error::TrackerNoHosts) => {
                Error::MagnetNoTracker
            }
            (_, e) => e,
        })?;

        let ctx = Arc::new(TorrentCtx {
            tx,
            btx,
            disk_tx,
            info_hash,
            local_peer_id,
        });

        Ok(Self {
            name: source.name(),
            ctx,
            status: TorrentStatus::default(),
            rx,
            config,
            source,
            origin,
            tracker,
            stats: Stats::default(),
            counter: Counter::new(),
            info: None,
            pieces: vec![],
            bitfield: Bitfield::default(),
            availability: vec![],
            assignments: HashMap::new(),
            peers: vec![],
            peer_pieces: HashMap::new(),
            unchoked_peers: vec![],
            opt_unchoked_peer: None,
            resume: None,
            idle_peers: vec![],
            pending_connects: 0,
            ever_connected: false,
            info_pieces: BTreeMap::new(),
            metadata_size: None,
            metadata_stalls: 0,
            last_info_bytes: 0,
        })
    }

    /// Drive the download until every piece is verified.
    ///
    /// Only two errors are fatal: no peer reachable at startup, and a
    /// magnet start whose metadata cannot be retrieved. Everything else is
    /// absorbed, the offending peer dropped and the work rescheduled.
    pub async fn run(&mut self) -> Result<(), Error> {
        info!("starting torrent {:?} ({:?})", self.name, self.ctx.info_hash);

        let static_info = match &self.source {
            Source::MetaInfo(meta) => Some(meta.info.clone()),
            Source::Magnet(_) => None,
        };
        match static_info {
            Some(torrent_info) => self.register_info(torrent_info).await?,
            None => self.status = TorrentStatus::DownloadingMetainfo,
        }

        let response = self
            .tracker
            .announce(
                Event::Started,
                self.counter.total_download(),
                self.counter.total_upload(),
                self.left(),
            )
            .await?;
        self.stats = Stats {
            interval: response.interval,
            seeders: response.complete.unwrap_or(0),
            leechers: response.incomplete.unwrap_or(0),
        };

        // a resume file may already cover the whole torrent
        if self.is_done() {
            return self.finish().await;
        }

        if response.peers.is_empty() {
            return Err(Error::NoPeers);
        }
        info!("tracker sent {} peers", response.peers.len());
        self.idle_peers = response.peers;
        self.connect_idle_peers();

        let announce_secs =
            self.stats.interval.max(MIN_ANNOUNCE_INTERVAL) as u64;
        let mut announce_interval = interval_at(
            Instant::now() + Duration::from_secs(announce_secs),
            Duration::from_secs(announce_secs),
        );

        let now = Instant::now();
        let mut unchoke_interval = interval_at(
            now + Duration::from_secs(10),
            Duration::from_secs(10),
        );
        let mut optimistic_interval = interval_at(
            now + Duration::from_secs(30),
            Duration::from_secs(30),
        );
        let mut metadata_interval = interval_at(
            now + Duration::from_secs(20),
            Duration::from_secs(20),
        );
        let mut log_interval = interval_at(
            now + Duration::from_secs(5),
            Duration::from_secs(5),
        );

        loop {
            select! {
                Some(msg) = self.rx.recv() => {
                    if self.handle_msg(msg).await? {
                        return self.finish().await;
                    }
                }
                _ = announce_interval.tick() => {
                    if let Some(secs) = self.periodic_announce().await {
                        let secs = secs.max(MIN_ANNOUNCE_INTERVAL as u64);
                        announce_interval = interval_at(
                            Instant::now() + Duration::from_secs(secs),
                            Duration::from_secs(secs),
                        );
                    }
                }
                _ = unchoke_interval.tick() => self.unchoke_best_peers(),
                _ = optimistic_interval.tick() => self.optimistic_unchoke(),
                _ = log_interval.tick() => self.log_rates(),
                _ = metadata_interval.tick(), if self.info.is_none() => {
                    if self.metadata_stalled() {
                        return Err(Error::MetadataUnavailable);
                    }
                }
            }
        }
    }

    async fn handle_msg(&mut self, msg: TorrentMsg) -> Result<bool, Error> {
        match msg {
            TorrentMsg::PeerConnected(ctx) => self.peer_connected(ctx),
            TorrentMsg::PeerError(addr) => self.peer_error(addr)?,
            TorrentMsg::PeerBitfield(addr, bitfield) => {
                self.peer_bitfield(addr, bitfield)
            }
            TorrentMsg::PeerHave(addr, piece) => self.peer_have(addr, piece),
            TorrentMsg::PeerChoked(addr) => self.peer_choked(addr),
            TorrentMsg::PeerUnchoked(addr) => self.try_schedule(addr),
            TorrentMsg::DownloadedBlock(addr, block) => {
                return self.downloaded_block(addr, block).await;
            }
            TorrentMsg::BlockRequest(addr, request) => {
                self.block_request(addr, request).await?;
            }
            TorrentMsg::DownloadedInfoPiece(total_size, index, bytes) => {
                return self
                    .downloaded_info_piece(total_size, index, bytes)
                    .await;
            }
            TorrentMsg::RequestInfoPiece(index, recipient) => {
                self.request_info_piece(index, recipient);
            }
            TorrentMsg::MetadataSize(size) => {
                if self.metadata_size.is_none() {
                    self.metadata_size = Some(size);
                }
            }
            TorrentMsg::ReadBitfield(recipient) => {
                let _ = recipient.send(self.bitfield.clone());
            }
        }
        Ok(false)
    }

    /// The info just became known, from the .torrent file or reassembled
    /// over BEP 9: build the piece table, the disk layout, and load any
    /// resume state.
    async fn register_info(&mut self, torrent_info: Info) -> Result<(), Error> {
        let piece_count = torrent_info.pieces();

        let (otx, orx) = oneshot::channel();
        self.ctx
            .disk_tx
            .send(DiskMsg::NewTorrent {
                info: torrent_info.clone(),
                recipient: otx,
            })
            .await?;
        orx.await??;

        self.pieces = (0..piece_count)
            .map(|index| Piece::new(index, torrent_info.piece_size(index)))
            .collect();
        self.bitfield = Bitfield::from_piece_count(piece_count);

        // bitfields that arrived before the info was known kept their pad
        // bits; the piece count is authoritative now
        for bitfield in self.peer_pieces.values_mut() {
            if bitfield.len() > piece_count {
                bitfield.truncate(piece_count);
            }
        }
        self.recompute_availability(piece_count);

        let mut resume = crate::resume::ResumeState::new(
            &self.ctx.info_hash,
            &self.origin,
            piece_count,
        );
        match crate::resume::ResumeState::load(
            &self.config.resume_path(),
            &self.ctx.info_hash,
            piece_count,
        )
        .await
        {
            Ok(Some(loaded)) => {
                for index in loaded.completed_pieces() {
                    self.pieces[index] = Piece::verified(index);
                    self.bitfield.set(index, true);
                }
                self.counter.restore(
                    loaded.downloaded_bytes,
                    loaded.uploaded_bytes,
                );
                resume = loaded;
                resume.set_torrent_path(&self.origin);
            }
            Ok(None) => {}
            Err(e) => warn!("ignoring resume file: {e}"),
        }
        self.resume = Some(resume);

        self.metadata_size = Some(torrent_info.raw.len() as u32);
        self.info = Some(torrent_info);
        self.status = TorrentStatus::Downloading;

        let _ = self.ctx.btx.send(PeerBrMsg::HaveInfo(piece_count));

        let addrs: Vec<SocketAddr> =
            self.peers.iter().map(|p| p.remote_addr).collect();
        for addr in addrs {
            self.update_interest(addr);
            self.try_schedule(addr);
        }

        Ok(())
    }

    fn peer_connected(&mut self, ctx: Arc<PeerCtx>) {
        debug!("{} connected as {:?}", ctx.remote_addr, ctx.id);
        self.pending_connects = self.pending_connects.saturating_sub(1);
        self.ever_connected = true;

        let addr = ctx.remote_addr;
        self.peers.push(ctx);
        self.peer_pieces.entry(addr).or_default();
    }

    /// A peer task ended: release everything it held. Fatal only when no
    /// peer was ever reachable.
    fn peer_error(&mut self, addr: SocketAddr) -> Result<(), Error> {
        let was_connected =
            self.peers.iter().any(|p| p.remote_addr == addr);

        if was_connected {
            debug!("{addr} disconnected");
            self.peers.retain(|p| p.remote_addr != addr);
            if let Some(bitfield) = self.peer_pieces.remove(&addr) {
                self.availability_remove(&bitfield);
            }
            self.unchoked_peers.retain(|a| *a != addr);
            if self.opt_unchoked_peer == Some(addr) {
                self.opt_unchoked_peer = None;
            }
            if let Some(index) = self.assignments.remove(&addr) {
                self.pieces[index].clear_requested();
                self.schedule_all();
            }
        } else {
            self.pending_connects = self.pending_connects.saturating_sub(1);
        }

        if !self.ever_connected
            && self.peers.is_empty()
            && self.pending_connects == 0
            && self.idle_peers.is_empty()
        {
            return Err(Error::NoPeers);
        }
        Ok(())
    }

    fn peer_bitfield(&mut self, addr: SocketAddr, bitfield: Bitfield) {
        let mut bitfield = bitfield;

        if let Some(torrent_info) = &self.info {
            let piece_count = torrent_info.pieces();
            // pad bits beyond the last piece must be zero
            if bitfield.len() < piece_count
                || bitfield[piece_count..].any()
            {
                self.drop_peer(addr);
                return;
            }
            bitfield.truncate(piece_count);
        }

        if let Some(old) = self.peer_pieces.get(&addr) {
            let old = old.clone();
            self.availability_remove(&old);
        }
        self.availability_add(&bitfield);
        self.peer_pieces.insert(addr, bitfield);

        self.update_interest(addr);
        self.try_schedule(addr);
    }

    fn peer_have(&mut self, addr: SocketAddr, piece: usize) {
        if let Some(torrent_info) = &self.info {
            if piece >= torrent_info.pieces() {
                self.drop_peer(addr);
                return;
            }
        }

        let entry = self.peer_pieces.entry(addr).or_default();
        if !entry.has(piece) {
            entry.grow_and_set(piece);
            if let Some(count) = self.availability.get_mut(piece) {
                *count += 1;
            }
        }

        self.update_interest(addr);
        self.try_schedule(addr);
    }

    /// A choke mid-download fails the active task; the piece keeps its
    /// received blocks and goes back into the pool.
    fn peer_choked(&mut self, addr: SocketAddr) {
        if let Some(index) = self.assignments.remove(&addr) {
            debug!("{addr} choked us while piece {index} was in flight");
            self.pieces[index].clear_requested();
            self.schedule_all();
        }
    }

    /// The receive path: copy the block into the piece buffer and finalize
    /// the piece once every block arrived. Returns true when this was the
    /// last piece of the torrent.
    async fn downloaded_block(
        &mut self,
        addr: SocketAddr,
        block: crate::wire::Block,
    ) -> Result<bool, Error> {
        let Some(&index) = self.assignments.get(&addr) else {
            debug!("{addr} sent a block without an assignment, ignoring");
            return Ok(false);
        };
        if block.index != index {
            debug!("{addr} sent a block for a piece not assigned to it");
            return Ok(false);
        }

        let len = block.block.len();
        let begin = block.begin as usize;
        let piece = &mut self.pieces[index];

        {
            let Some(slot) = piece.block_mut(block.begin) else {
                debug!("{addr} sent a block at an unknown offset, ignoring");
                return Ok(false);
            };
            if slot.received || slot.len as usize != len {
                return Ok(false);
            }
            slot.received = true;
        }
        piece.buf[begin..begin + len].copy_from_slice(&block.block);

        self.counter.record_download(len as u64);
        if let Some(ctx) = self.peer_ctx(&addr) {
            ctx.counter.record_download(len as u64);
        }

        if self.pieces[index].is_complete() {
            self.pieces[index].state = PieceState::Complete;
            return self.finalize_piece(addr, index).await;
        }
        Ok(false)
    }

    /// Hash-check a completed piece, commit it to disk, then advance the
    /// resume store. A mismatch resets the piece for another attempt.
    async fn finalize_piece(
        &mut self,
        addr: SocketAddr,
        index: usize,
    ) -> Result<bool, Error> {
        let (expected, piece_size) = {
            let Some(torrent_info) = &self.info else {
                return Ok(false);
            };
            let mut expected = [0u8; 20];
            expected.copy_from_slice(torrent_info.piece_hash(index));
            (expected, torrent_info.piece_size(index))
        };

        self.assignments.remove(&addr);

        let digest: [u8; 20] = {
            let mut hasher = Sha1::new();
            hasher.update(&self.pieces[index].buf);
            hasher.finalize().into()
        };

        if digest != expected {
            warn!("piece {index} failed hash verification, resetting");
            self.pieces[index].reset();
            self.schedule_all();
            return Ok(false);
        }

        self.pieces[index].state = PieceState::Verified;
        let data = self.pieces[index].release_buf();

        // the only durable state change; everything below waits for it
        let (otx, orx) = oneshot::channel();
        self.ctx
            .disk_tx
            .send(DiskMsg::WritePiece { index, data, recipient: otx })
            .await?;
        if let Err(e) = orx.await? {
            warn!("could not write piece {index} to disk: {e}");
            self.pieces[index] = Piece::new(index, piece_size);
            self.schedule_all();
            return Ok(false);
        }

        self.bitfield.set(index, true);

        // the resume store only ever advances past written pieces
        if let Some(resume) = &mut self.resume {
            resume.mark_complete(index);
            resume.downloaded_bytes = self.counter.total_download();
            resume.uploaded_bytes = self.counter.total_upload();
            if let Err(e) = resume.save(&self.config.resume_path()).await {
                warn!("could not save resume state: {e}");
            }
        }

        let _ = self.ctx.btx.send(PeerBrMsg::HavePiece(index));
        info!(
            "piece {index} verified ({}/{})",
            self.bitfield.count_ones(),
            self.pieces.len()
        );

        self.try_schedule(addr);
        Ok(self.is_done())
    }

    /// The upload path: validate a REQUEST, read the range from disk and
    /// hand the PIECE back to the peer task.
    async fn block_request(
        &mut self,
        addr: SocketAddr,
        request: crate::wire::BlockInfo,
    ) -> Result<(), Error> {
        let Some(torrent_info) = &self.info else {
            return Ok(());
        };
        let index = request.index as usize;

        let in_bounds = index < torrent_info.pieces()
            && request.is_valid_request()
            && request.begin as u64 + request.len as u64
                <= torrent_info.piece_size(index) as u64;
        if !in_bounds {
            self.drop_peer(addr);
            return Ok(());
        }

        // only verified pieces are served
        if !self.bitfield.has(index) {
            return Ok(());
        }
        let Some(ctx) = self.peer_ctx(&addr) else {
            return Ok(());
        };
        if ctx.am_choking.load(Ordering::Relaxed) {
            return Ok(());
        }

        let (otx, orx) = oneshot::channel();
        self.ctx
            .disk_tx
            .send(DiskMsg::ReadBlock { block_info: request, recipient: otx })
            .await?;

        match orx.await? {
            Ok(bytes) => {
                self.counter.record_upload(bytes.len() as u64);
                let _ = ctx.tx.send(PeerMsg::SendBlock(crate::wire::Block {
                    index,
                    begin: request.begin,
                    block: bytes,
                }));
            }
            Err(e) => warn!("could not read a block for {addr}: {e}"),
        }
        Ok(())
    }

    /// A metadata piece arrived. Once the dict is whole it must hash to
    /// the magnet's info_hash; a mismatch is fatal for a magnet start.
    async fn downloaded_info_piece(
        &mut self,
        total_size: u32,
        index: u32,
        bytes: Vec<u8>,
    ) -> Result<bool, Error> {
        if self.info.is_some() {
            return Ok(false);
        }
        if self.status == TorrentStatus::ConnectingTrackers {
            self.status = TorrentStatus::DownloadingMetainfo;
        }

        let total = *self.metadata_size.get_or_insert(total_size);
        if index >= MetadataMsg::piece_count(total) {
            return Ok(false);
        }
        self.info_pieces.insert(index, bytes);

        let have: usize = self.info_pieces.values().map(|b| b.len()).sum();
        if (have as u64) < total as u64 {
            return Ok(false);
        }

        let info_bytes: Vec<u8> =
            self.info_pieces.values().flatten().copied().collect();

        if InfoHash::from_buf(&info_bytes) != self.ctx.info_hash {
            warn!("reassembled metadata does not match the magnet");
            return Err(Error::MetadataInvalid);
        }

        let torrent_info = Info::from_bencode(&info_bytes)?;
        info!(
            "metadata complete: {:?}, {} pieces, {}",
            torrent_info.name,
            torrent_info.pieces(),
            to_human_readable(torrent_info.total_size() as f64),
        );

        self.register_info(torrent_info).await?;
        Ok(self.is_done())
    }

    /// Serve a metadata piece to a peer, from the exact source bytes of
    /// our info dict. Out-of-range pieces (and a missing info) answer as
    /// None, which the peer task turns into a reject.
    fn request_info_piece(
        &self,
        index: u32,
        recipient: oneshot::Sender<Option<(u32, Vec<u8>)>>,
    ) {
        let reply = self.info.as_ref().and_then(|torrent_info| {
            match MetadataMsg::data_from(&torrent_info.raw, index) {
                MetadataMsg::Data { total_size, payload, .. } => {
                    Some((total_size, payload))
                }
                _ => None,
            }
        });
        let _ = recipient.send(reply);
    }

    /// Try to hand the peer a piece, per the selection policy. No-op when
    /// the peer already has an in-flight piece or is choking us.
    fn try_schedule(&mut self, addr: SocketAddr) {
        if self.info.is_none()
            || self.is_done()
            || self.assignments.contains_key(&addr)
        {
            return;
        }
        let Some(ctx) = self.peer_ctx(&addr) else {
            return;
        };
        if ctx.peer_choking.load(Ordering::Relaxed) {
            return;
        }
        let Some(peer_has) = self.peer_pieces.get(&addr) else {
            return;
        };

        let assigned: HashSet<usize> =
            self.assignments.values().copied().collect();
        let verified = self.bitfield.count_ones();

        let Some(index) = select_piece(
            &self.pieces,
            &self.availability,
            peer_has,
            &assigned,
            verified,
            &mut rand::rng(),
        ) else {
            return;
        };

        self.assignments.insert(addr, index);
        let piece = &mut self.pieces[index];
        piece.state = PieceState::InProgress;
        let blocks = piece.take_missing_blocks();

        debug!("assigning piece {index} to {addr} ({} blocks)", blocks.len());
        if !blocks.is_empty() {
            let _ = ctx.tx.send(PeerMsg::RequestBlocks(blocks));
        }
    }

    fn schedule_all(&mut self) {
        let addrs: Vec<SocketAddr> =
            self.peers.iter().map(|p| p.remote_addr).collect();
        for addr in addrs {
            self.try_schedule(addr);
        }
    }

    /// Tell the peer whether we want anything it has.
    fn update_interest(&self, addr: SocketAddr) {
        let Some(ctx) = self.peer_ctx(&addr) else {
            return;
        };
        let Some(peer_has) = self.peer_pieces.get(&addr) else {
            return;
        };

        let interesting = match &self.info {
            Some(_) => {
                peer_has.iter_ones().any(|i| !self.bitfield.has(i))
            }
            // before the info is known any peer is worth talking to
            None => peer_has.any(),
        };

        let am_interested = ctx.am_interested.load(Ordering::Relaxed);
        if interesting && !am_interested {
            let _ = ctx.tx.send(PeerMsg::Interested);
        }
        if !interesting && am_interested {
            let _ = ctx.tx.send(PeerMsg::NotInterested);
        }
    }

    /// Tit-for-tat: unchoke the interested peers that gave us the most
    /// bytes over the last window.
    fn unchoke_best_peers(&mut self) {
        let mut ranked: Vec<(u64, SocketAddr)> = self
            .peers
            .iter()
            .filter(|p| p.peer_interested.load(Ordering::Relaxed))
            .map(|p| (p.counter.take_window_download(), p.remote_addr))
            .collect();
        ranked.sort_by(|a, b| b.0.cmp(&a.0));

        let best: Vec<SocketAddr> = ranked
            .iter()
            .take(MAX_UNCHOKED_PEERS)
            .map(|(_, addr)| *addr)
            .collect();

        for addr in self.unchoked_peers.clone() {
            if !best.contains(&addr) && self.opt_unchoked_peer != Some(addr)
            {
                if let Some(ctx) = self.peer_ctx(&addr) {
                    let _ = ctx.tx.send(PeerMsg::Choke);
                }
            }
        }
        for addr in &best {
            if !self.unchoked_peers.contains(addr) {
                if let Some(ctx) = self.peer_ctx(addr) {
                    let _ = ctx.tx.send(PeerMsg::Unchoke);
                }
            }
        }
        self.unchoked_peers = best;
    }

    /// Rotate one random interested-but-choked peer into an extra unchoke
    /// slot, so newcomers get a chance to prove themselves.
    fn optimistic_unchoke(&mut self) {
        if let Some(old) = self.opt_unchoked_peer.take() {
            if !self.unchoked_peers.contains(&old) {
                if let Some(ctx) = self.peer_ctx(&old) {
                    let _ = ctx.tx.send(PeerMsg::Choke);
                }
            }
        }

        let candidates: Vec<SocketAddr> = self
            .peers
            .iter()
            .filter(|p| {
                p.peer_interested.load(Ordering::Relaxed)
                    && p.am_choking.load(Ordering::Relaxed)
            })
            .map(|p| p.remote_addr)
            .collect();
        if candidates.is_empty() {
            return;
        }

        let pick =
            candidates[rand::rng().random_range(0..candidates.len())];
        debug!("optimistically unchoking {pick}");
        if let Some(ctx) = self.peer_ctx(&pick) {
            let _ = ctx.tx.send(PeerMsg::Unchoke);
        }
        self.opt_unchoked_peer = Some(pick);
    }

    async fn periodic_announce(&mut self) -> Option<u64> {
        let result = self
            .tracker
            .announce(
                Event::None,
                self.counter.total_download(),
                self.counter.total_upload(),
                self.left(),
            )
            .await;

        match result {
            Ok(response) => {
                self.stats = Stats {
                    interval: response.interval,
                    seeders: response.complete.unwrap_or(0),
                    leechers: response.incomplete.unwrap_or(0),
                };

                let known: HashSet<SocketAddr> = self
                    .peers
                    .iter()
                    .map(|p| p.remote_addr)
                    .chain(self.idle_peers.iter().copied())
                    .collect();
                self.idle_peers.extend(
                    response
                        .peers
                        .into_iter()
                        .filter(|addr| !known.contains(addr)),
                );
                self.connect_idle_peers();

                Some(response.interval as u64)
            }
            Err(e) => {
                warn!("periodic announce failed: {e}");
                None
            }
        }
    }

    fn connect_idle_peers(&mut self) {
        let active = self.peers.len() + self.pending_connects;
        let slots = (self.config.max_torrent_peers as usize)
            .saturating_sub(active)
            .min(self.idle_peers.len());

        let batch: Vec<SocketAddr> =
            self.idle_peers.drain(..slots).collect();
        for addr in batch {
            self.spawn_peer(addr);
        }
    }

    /// One tokio task per peer: connect, handshake, run, report back.
    fn spawn_peer(&mut self, addr: SocketAddr) {
        if self.peers.iter().any(|p| p.remote_addr == addr) {
            return;
        }
        self.pending_connects += 1;

        let ctx = self.ctx.clone();
        let config = self.config.clone();
        let have_info = self.info.is_some();
        let piece_count = self.pieces.len();
        let metadata_size = self.metadata_size;

        spawn(async move {
            match timeout(config.connect_timeout(), TcpStream::connect(addr))
                .await
            {
                Ok(Ok(socket)) => {
                    let idle = Peer::<peer::Idle>::new();
                    match idle
                        .handshake(
                            socket,
                            ctx.clone(),
                            config,
                            have_info,
                            piece_count,
                            metadata_size,
                        )
                        .await
                    {
                        Ok(mut connected) => {
                            let _ = ctx
                                .tx
                                .send(TorrentMsg::PeerConnected(
                                    connected.state.ctx.clone(),
                                ))
                                .await;
                            if let Err(e) = connected.run().await {
                                debug!("{addr} peer loop ended: {e}");
                            }
                        }
                        Err(e) => {
                            debug!("{addr} handshake failed: {e}");
                        }
                    }
                }
                Ok(Err(e)) => {
                    debug!("{addr} connect failed: {e}");
                }
                Err(_) => {
                    debug!("{addr} connect timed out");
                }
            }
            let _ = ctx.tx.send(TorrentMsg::PeerError(addr)).await;
        });
    }

    /// Final announce and resume save, then tell everyone to wind down.
    async fn finish(&mut self) -> Result<(), Error> {
        self.status = TorrentStatus::Seeding;
        info!("downloaded entire torrent {:?}", self.name);

        let downloaded = self.counter.total_download();
        let uploaded = self.counter.total_upload();
        if let Err(e) = self
            .tracker
            .announce(Event::Completed, downloaded, uploaded, 0)
            .await
        {
            warn!("completed announce failed: {e}");
        }

        if let Some(resume) = &mut self.resume {
            resume.downloaded_bytes = downloaded;
            resume.uploaded_bytes = uploaded;
            if let Err(e) = resume.save(&self.config.resume_path()).await {
                warn!("could not save resume state: {e}");
            }
        }

        let _ = self.ctx.btx.send(PeerBrMsg::Quit);
        let _ = self.ctx.disk_tx.send(DiskMsg::Quit).await;
        Ok(())
    }

    fn is_done(&self) -> bool {
        self.info.is_some()
            && self.bitfield.count_ones() == self.pieces.len()
    }

    fn left(&self) -> u64 {
        match &self.info {
            Some(torrent_info) => {
                let verified: u64 = self
                    .bitfield
                    .iter_ones()
                    .map(|i| torrent_info.piece_size(i) as u64)
                    .sum();
                torrent_info.total_size().saturating_sub(verified)
            }
            None => self.source.size_hint(),
        }
    }

    fn log_rates(&self) {
        debug!(
            "d: {} u: {} peers: {} seeders: {} leechers: {} pieces: {}/{}",
            to_human_readable(self.counter.total_download() as f64),
            to_human_readable(self.counter.total_upload() as f64),
            self.peers.len(),
            self.stats.seeders,
            self.stats.leechers,
            self.bitfield.count_ones(),
            self.pieces.len(),
        );
    }

    fn metadata_stalled(&mut self) -> bool {
        let have: usize = self.info_pieces.values().map(|b| b.len()).sum();
        if have == self.last_info_bytes {
            self.metadata_stalls += 1;
        } else {
            self.metadata_stalls = 0;
            self.last_info_bytes = have;
        }
        self.metadata_stalls >= MAX_METADATA_STALLS
    }

    fn peer_ctx(&self, addr: &SocketAddr) -> Option<Arc<PeerCtx>> {
        self.peers.iter().find(|p| p.remote_addr == *addr).cloned()
    }

    fn drop_peer(&self, addr: SocketAddr) {
        warn!("{addr} violated the protocol, dropping");
        if let Some(ctx) = self.peer_ctx(&addr) {
            let _ = ctx.tx.send(PeerMsg::Quit);
        }
    }

    fn availability_add(&mut self, bitfield: &Bitfield) {
        for index in bitfield.iter_ones() {
            if let Some(count) = self.availability.get_mut(index) {
                *count += 1;
            }
        }
    }

    fn availability_remove(&mut self, bitfield: &Bitfield) {
        for index in bitfield.iter_ones() {
            if let Some(count) = self.availability.get_mut(index) {
                *count = count.saturating_sub(1);
            }
        }
    }

    /// Rebuilt when the piece count becomes known: peers may have sent
    /// bitfields before the info arrived.
    fn recompute_availability(&mut self, piece_count: usize) {
        let mut availability = vec![0u32; piece_count];
        for bitfield in self.peer_pieces.values() {
            for index in bitfield.iter_ones() {
                if index < piece_count {
                    availability[index] += 1;
                }
            }
        }
        self.availability = availability;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        disk::Disk,
        metainfo::MetaInfo,
        resume::ResumeState,
        tracker::HttpResponse,
        wire::Block,
    };
    use rand::{distr::Alphanumeric, Rng as _};
    use std::path::PathBuf;

    struct NullTransport;

    impl HttpTransport for NullTransport {
        async fn get(
            &self,
            _url: &str,
            _timeout: Duration,
        ) -> Result<HttpResponse, Error> {
            Err(Error::TrackerNoHosts)
        }
    }

    fn scratch_dir() -> PathBuf {
        let name: String = (0..20)
            .map(|_| rand::rng().sample(Alphanumeric) as char)
            .collect();
        std::env::temp_dir().join(name)
    }

    fn sha1_of(data: &[u8]) -> [u8; 20] {
        let mut hasher = Sha1::new();
        hasher.update(data);
        hasher.finalize().into()
    }

    /// 2 pieces of 4 bytes in a single file.
    fn test_info(content: &[u8]) -> Info {
        let mut pieces = Vec::new();
        for chunk in content.chunks(4) {
            pieces.extend_from_slice(&sha1_of(chunk));
        }
        let info = Info {
            name: "engine_test".to_owned(),
            piece_length: 4,
            pieces,
            file_length: Some(content.len() as u64),
            ..Default::default()
        };
        let raw = info.to_bencode();
        Info {
            info_hash: InfoHash::from_buf(&raw),
            raw,
            ..info
        }
    }

    async fn engine_with(
        torrent_info: Info,
        dir: &PathBuf,
    ) -> Torrent<NullTransport> {
        let config = Arc::new(Config::test_in(dir));
        let (disk_tx, disk_rx) = mpsc::channel(64);

        let mut disk = Disk::new(disk_rx, dir.clone());
        spawn(async move { disk.run().await });

        let meta = MetaInfo {
            announce: "http://localhost/ann".to_owned(),
            info: torrent_info.clone(),
            ..Default::default()
        };

        let mut torrent = Torrent::new(
            config,
            disk_tx,
            Source::MetaInfo(Box::new(meta)),
            NullTransport,
            "engine_test.torrent".to_owned(),
        )
        .unwrap();
        torrent.register_info(torrent_info).await.unwrap();
        torrent
    }

    /// A fake connected peer the engine talks to over its channel.
    fn fake_peer(
        n: u8,
    ) -> (Arc<PeerCtx>, mpsc::UnboundedReceiver<PeerMsg>, SocketAddr) {
        let addr: SocketAddr = format!("10.0.0.{n}:6881").parse().unwrap();
        let (tx, rx) = mpsc::unbounded_channel();
        let ctx = Arc::new(PeerCtx::new(tx, PeerId::gen(), addr));
        (ctx, rx, addr)
    }

    async fn next_request_blocks(
        rx: &mut mpsc::UnboundedReceiver<PeerMsg>,
    ) -> Vec<crate::wire::BlockInfo> {
        loop {
            match rx.recv().await.expect("peer channel closed") {
                PeerMsg::RequestBlocks(blocks) => return blocks,
                _ => {}
            }
        }
    }

    #[tokio::test]
    async fn downloads_verify_write_and_resume() {
        let dir = scratch_dir();
        let content = b"abcdwxyz";
        let torrent_info = test_info(content);
        let mut torrent = engine_with(torrent_info, &dir).await;

        let (ctx, mut prx, addr) = fake_peer(1);
        ctx.peer_choking.store(false, Ordering::Relaxed);

        torrent
            .handle_msg(TorrentMsg::PeerConnected(ctx.clone()))
            .await
            .unwrap();
        torrent
            .handle_msg(TorrentMsg::PeerBitfield(
                addr,
                Bitfield::from_vec(vec![0b1100_0000]),
            ))
            .await
            .unwrap();

        let mut done = false;
        for _ in 0..2 {
            let blocks = next_request_blocks(&mut prx).await;
            assert_eq!(blocks.len(), 1);
            let request = blocks[0];
            assert_eq!(request.len, 4);

            let start = request.index as usize * 4;
            done = torrent
                .handle_msg(TorrentMsg::DownloadedBlock(
                    addr,
                    Block {
                        index: request.index as usize,
                        begin: 0,
                        block: content[start..start + 4].to_vec(),
                    },
                ))
                .await
                .unwrap();
        }

        assert!(done);
        assert_eq!(torrent.bitfield.count_ones(), 2);
        assert!(torrent.assignments.is_empty());

        // durable write landed
        let written =
            tokio::fs::read(dir.join("engine_test")).await.unwrap();
        assert_eq!(written, content);

        // the resume store advanced only after the writes
        let resume = ResumeState::load(
            &dir.join(".resume"),
            &torrent.ctx.info_hash,
            2,
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(resume.completed_count(), 2);
        assert_eq!(resume.downloaded_bytes, 8);

        tokio::fs::remove_dir_all(&dir).await.unwrap();
    }

    #[tokio::test]
    async fn hash_mismatch_resets_and_reschedules() {
        let dir = scratch_dir();
        let torrent_info = test_info(b"abcd");
        let mut torrent = engine_with(torrent_info, &dir).await;

        let (ctx, mut prx, addr) = fake_peer(2);
        ctx.peer_choking.store(false, Ordering::Relaxed);

        torrent
            .handle_msg(TorrentMsg::PeerConnected(ctx.clone()))
            .await
            .unwrap();
        torrent
            .handle_msg(TorrentMsg::PeerBitfield(
                addr,
                Bitfield::from_vec(vec![0b1000_0000]),
            ))
            .await
            .unwrap();

        let blocks = next_request_blocks(&mut prx).await;
        assert_eq!(blocks[0].index, 0);

        let done = torrent
            .handle_msg(TorrentMsg::DownloadedBlock(
                addr,
                Block { index: 0, begin: 0, block: b"XXXX".to_vec() },
            ))
            .await
            .unwrap();

        assert!(!done);
        assert_eq!(torrent.bitfield.count_ones(), 0);
        assert_eq!(torrent.pieces[0].state, PieceState::NotStarted);
        assert!(!torrent.pieces[0].blocks[0].received);

        // the piece went straight back to the same idle peer
        let retry = next_request_blocks(&mut prx).await;
        assert_eq!(retry[0].index, 0);
        assert_eq!(torrent.assignments.get(&addr), Some(&0));

        tokio::fs::remove_dir_all(&dir).await.unwrap();
    }

    #[tokio::test]
    async fn resume_state_marks_pieces_verified() {
        let dir = scratch_dir();
        let content = b"abcdwxyz";
        let torrent_info = test_info(content);

        // a previous run already had piece 1
        let mut previous =
            ResumeState::new(&torrent_info.info_hash, "orig", 2);
        previous.mark_complete(1);
        previous.downloaded_bytes = 4;
        previous.save(&dir.join(".resume")).await.unwrap();

        let torrent = engine_with(torrent_info, &dir).await;

        assert_eq!(torrent.pieces[1].state, PieceState::Verified);
        assert_eq!(torrent.pieces[0].state, PieceState::NotStarted);
        assert!(torrent.bitfield.has(1));
        assert!(!torrent.is_done());
        assert_eq!(torrent.counter.total_download(), 4);
        assert_eq!(torrent.left(), 4);

        tokio::fs::remove_dir_all(&dir).await.unwrap();
    }

    #[tokio::test]
    async fn oversize_request_drops_the_peer() {
        let dir = scratch_dir();
        let torrent_info = test_info(b"abcd");
        let mut torrent = engine_with(torrent_info, &dir).await;

        let (ctx, mut prx, addr) = fake_peer(3);
        torrent
            .handle_msg(TorrentMsg::PeerConnected(ctx.clone()))
            .await
            .unwrap();

        torrent
            .handle_msg(TorrentMsg::BlockRequest(
                addr,
                crate::wire::BlockInfo {
                    index: 0,
                    begin: 0,
                    len: 200_000,
                },
            ))
            .await
            .unwrap();

        match prx.recv().await {
            Some(PeerMsg::Quit) => {}
            other => panic!("expected quit, got {other:?}"),
        }

        tokio::fs::remove_dir_all(&dir).await.unwrap();
    }
}
