use std::{
    collections::VecDeque,
    fmt::Display,
    net::SocketAddr,
    sync::{atomic::AtomicBool, Arc},
};

use futures::stream::{SplitSink, SplitStream};
use hashbrown::{HashMap, HashSet};
use rand::{distr::Alphanumeric, Rng};
use tokio::{
    net::TcpStream,
    sync::{broadcast, mpsc},
    time::Instant,
};
use tokio_util::codec::Framed;

use crate::{
    bitfield::{Bitfield, Reserved},
    config::Config,
    counter::Counter,
    extensions::ExtensionHandshake,
    peer,
    torrent::{PeerBrMsg, TorrentCtx},
    wire::{Block, BlockInfo, Message, MessageCodec},
};

/// Our peer id, sent on every handshake: a client tag plus random
/// alphanumerics, 20 bytes total.
#[derive(Clone, PartialEq, Eq, Hash, Default)]
pub struct PeerId(pub [u8; 20]);

impl PeerId {
    pub fn gen() -> Self {
        let mut peer_id = [0u8; 20];
        peer_id[..8].copy_from_slice(b"-RM0010-");
        for byte in peer_id.iter_mut().skip(8) {
            *byte = rand::rng().sample(Alphanumeric);
        }
        PeerId(peer_id)
    }
}

impl Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(&self.0))
    }
}

impl std::fmt::Debug for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_string())
    }
}

impl From<[u8; 20]> for PeerId {
    fn from(value: [u8; 20]) -> Self {
        Self(value)
    }
}

/// Context shared between a peer task and the engine.
///
/// The four state flags start at their protocol-mandated values: both
/// sides choked, neither interested.
#[derive(Debug)]
pub struct PeerCtx {
    pub tx: mpsc::UnboundedSender<PeerMsg>,

    /// Id the remote sent on its handshake; display only.
    pub id: PeerId,

    pub remote_addr: SocketAddr,

    /// We are choking the peer.
    pub am_choking: AtomicBool,
    /// We want pieces the peer has.
    pub am_interested: AtomicBool,
    /// The peer is choking us.
    pub peer_choking: AtomicBool,
    /// The peer wants pieces we have.
    pub peer_interested: AtomicBool,

    /// Per-peer transfer accounting, feeds the choking policy.
    pub counter: Counter,
}

impl PeerCtx {
    pub fn new(
        tx: mpsc::UnboundedSender<PeerMsg>,
        id: PeerId,
        remote_addr: SocketAddr,
    ) -> Self {
        Self {
            tx,
            id,
            remote_addr,
            am_choking: AtomicBool::new(true),
            am_interested: AtomicBool::new(false),
            peer_choking: AtomicBool::new(true),
            peer_interested: AtomicBool::new(false),
            counter: Counter::new(),
        }
    }
}

/// Messages the engine sends to one peer task.
#[derive(Debug)]
pub enum PeerMsg {
    /// Send REQUESTs for these blocks, in the given order.
    RequestBlocks(Vec<BlockInfo>),

    /// Answer to a REQUEST the peer made: send this block as a PIECE.
    SendBlock(Block),

    /// Tell the peer we are interested.
    Interested,
    NotInterested,

    /// Choke or unchoke the peer; unchoking drains its request queue.
    Choke,
    Unchoke,

    Quit,
}

/// A peer is either [`Idle`] or [`Connected`].
pub trait PeerState {}

/// A peer address returned by the tracker, ready to be handshaked.
#[derive(Clone)]
pub struct Idle {}

/// A peer that completed the handshake and is exchanging messages.
pub struct Connected {
    pub stream: SplitStream<Framed<TcpStream, MessageCodec>>,
    pub sink: SplitSink<Framed<TcpStream, MessageCodec>, Message>,
    pub reserved: Reserved,
    pub torrent_ctx: Arc<TorrentCtx>,
    pub ctx: Arc<PeerCtx>,
    pub config: Arc<Config>,

    pub rx: mpsc::UnboundedReceiver<PeerMsg>,
    pub brx: broadcast::Receiver<PeerBrMsg>,

    /// Pieces the remote peer has.
    pub pieces: Bitfield,

    /// The extended handshake the peer sent, when it supports BEP 10.
    pub extension: Option<ExtensionHandshake>,

    /// REQUESTs received from the peer, serviced in FIFO order while we
    /// are not choking it.
    pub pending_requests: VecDeque<BlockInfo>,

    /// Whether the torrent knows its `info` yet.
    pub have_info: bool,
    pub piece_count: usize,

    /// Metadata piece requests in flight, with their request time.
    pub inflight_info_requests: HashMap<u32, Instant>,
    /// Metadata pieces already received, so they are not re-requested.
    pub received_info_pieces: HashSet<u32>,
    /// The peer rejected metadata requests; stop asking after a few.
    pub metadata_rejects: u32,

    /// Last time any frame arrived, for the idle drop.
    pub last_frame: Instant,
}

impl PeerState for Idle {}
impl PeerState for Connected {}

impl Default for peer::Peer<Idle> {
    fn default() -> Self {
        Self::new()
    }
}

impl peer::Peer<Idle> {
    pub fn new() -> Self {
        Self { state: Idle {} }
    }
}
