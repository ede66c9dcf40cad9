use std::{fmt::Display, net::SocketAddr, ops::Deref, sync::Arc};

use sha1::{Digest, Sha1};
use tokio::sync::{broadcast, mpsc, oneshot};

use crate::{
    bitfield::Bitfield,
    disk::DiskMsg,
    error::Error,
    magnet::Magnet,
    metainfo::MetaInfo,
    peer::{PeerCtx, PeerId},
    utils::percent_encode,
    wire::{Block, BlockInfo},
};

/// 20-byte identity of a torrent: SHA-1 of the bencoded `info` dictionary.
#[derive(Clone, PartialEq, Eq, Hash, Default)]
pub struct InfoHash(pub [u8; 20]);

impl InfoHash {
    pub fn from_buf(buf: &[u8]) -> Self {
        let mut hasher = Sha1::new();
        hasher.update(buf);
        InfoHash(hasher.finalize().into())
    }

    /// The 60-char `%XX` form used in tracker query strings.
    pub fn percent_encoded(&self) -> String {
        percent_encode(&self.0)
    }
}

impl Display for InfoHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl std::fmt::Debug for InfoHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.to_string().get(..10).unwrap_or_default())
    }
}

impl Deref for InfoHash {
    type Target = [u8; 20];

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl From<[u8; 20]> for InfoHash {
    fn from(value: [u8; 20]) -> Self {
        Self(value)
    }
}

impl TryFrom<Vec<u8>> for InfoHash {
    type Error = &'static str;

    fn try_from(value: Vec<u8>) -> Result<Self, Self::Error> {
        if value.len() != 20 {
            return Err("the info_hash must have exactly 20 bytes");
        }
        let mut buf = [0u8; 20];
        buf.copy_from_slice(&value[..20]);
        Ok(InfoHash(buf))
    }
}

/// Where a torrent came from. Both converge once the `info` is known; a
/// magnet start first has to pull it from peers over BEP 9.
pub enum Source {
    MetaInfo(Box<MetaInfo>),
    Magnet(Magnet),
}

impl Source {
    pub fn info_hash(&self) -> Result<InfoHash, Error> {
        match self {
            Source::MetaInfo(meta) => Ok(meta.info.info_hash.clone()),
            Source::Magnet(magnet) => magnet.parse_xt(),
        }
    }

    pub fn name(&self) -> String {
        match self {
            Source::MetaInfo(meta) => meta.info.name.clone(),
            Source::Magnet(magnet) => magnet.parse_dn(),
        }
    }

    pub fn announce_urls(&self) -> Vec<String> {
        match self {
            Source::MetaInfo(meta) => meta.announce_urls(),
            Source::Magnet(magnet) => magnet.parse_trackers(),
        }
    }

    /// The size in bytes, as far as the source knows it. A magnet only
    /// knows it when the optional `xl` field was present.
    pub fn size_hint(&self) -> u64 {
        match self {
            Source::MetaInfo(meta) => meta.info.total_size(),
            Source::Magnet(magnet) => magnet.length().unwrap_or(0),
        }
    }
}

/// Context of a [`Torrent`](super::Torrent) shared with peers and disk.
#[derive(Debug)]
pub struct TorrentCtx {
    pub tx: mpsc::Sender<TorrentMsg>,
    pub btx: broadcast::Sender<PeerBrMsg>,
    pub disk_tx: mpsc::Sender<DiskMsg>,
    pub info_hash: InfoHash,
    pub local_peer_id: PeerId,
}

/// Messages peers send to the engine. Everything mutating shared state
/// funnels through these.
#[derive(Debug)]
pub enum TorrentMsg {
    /// The handshake completed and the peer task is running.
    PeerConnected(Arc<PeerCtx>),

    /// The peer task ended, on error or EOF. Releases its assignment.
    PeerError(SocketAddr),

    /// The peer replaced its bitfield.
    PeerBitfield(SocketAddr, Bitfield),

    /// The peer announced one new piece.
    PeerHave(SocketAddr, usize),

    PeerChoked(SocketAddr),
    PeerUnchoked(SocketAddr),

    /// A block of an assigned piece arrived.
    DownloadedBlock(SocketAddr, Block),

    /// The peer asked for a block; the engine validates, reads from disk
    /// and answers with a PIECE.
    BlockRequest(SocketAddr, BlockInfo),

    /// `(total_size, piece, bytes)` of a metadata piece (BEP 9).
    DownloadedInfoPiece(u32, u32, Vec<u8>),

    /// A peer asked for a metadata piece: answer with the slice and the
    /// total size, or None when we don't have the info yet.
    RequestInfoPiece(u32, oneshot::Sender<Option<(u32, Vec<u8>)>>),

    /// A peer learned the metadata size from an extended handshake.
    MetadataSize(u32),

    /// Snapshot of our bitfield, sent right after the handshake.
    ReadBitfield(oneshot::Sender<Bitfield>),
}

/// Broadcast messages for all peers of the torrent.
#[derive(Debug, Clone)]
pub enum PeerBrMsg {
    /// We verified a new piece; peers that lack it get a HAVE.
    HavePiece(usize),
    /// The info is now known, with its piece count.
    HaveInfo(usize),
    Quit,
}

#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub enum TorrentStatus {
    #[default]
    ConnectingTrackers,
    DownloadingMetainfo,
    Downloading,
    Seeding,
}

/// Swarm stats from the last announce.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Stats {
    pub interval: u32,
    pub seeders: u32,
    pub leechers: u32,
}
