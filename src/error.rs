use std::io;

use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

use crate::{
    bencode::ParseError, disk::DiskMsg, peer::PeerMsg, torrent::TorrentMsg,
};

#[derive(Error, Debug)]
pub enum Error {
    #[error("{0}")]
    Bencode(#[from] ParseError),

    #[error("malformed metainfo: {0}")]
    Metainfo(&'static str),

    #[error("could not parse the magnet link")]
    MagnetInvalid(#[from] magnet_url::MagnetError),

    #[error(
        "the magnet does not have an info_hash, are you sure you copied the \
         entire link?"
    )]
    MagnetNoInfoHash,

    #[error(
        "the magnet does not have an HTTP tracker. This client does not \
         support DHT, you need a magnet that has one."
    )]
    MagnetNoTracker,

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("string is not UTF-8")]
    Utf8(#[from] std::string::FromUtf8Error),

    #[error("the handshake received is not valid")]
    HandshakeInvalid,

    #[error("the peer took too long to send the handshake")]
    HandshakeTimeout,

    #[error("protocol violation: {0}")]
    Protocol(&'static str),

    #[error("the peer closed the socket")]
    PeerClosedSocket,

    #[error("the peer went silent for too long")]
    PeerIdle,

    #[error("piece {0} failed hash verification")]
    PieceInvalid(usize),

    #[error("the reassembled metadata does not match the magnet's info_hash")]
    MetadataInvalid,

    #[error("could not retrieve the metadata from any peer")]
    MetadataUnavailable,

    #[error("tracker error: {0}")]
    Tracker(String),

    #[error("tracker returned HTTP status {0}")]
    TrackerStatus(u16),

    #[error("no tracker in the announce list could be reached")]
    TrackerNoHosts,

    #[error("no peers could be reached")]
    NoPeers,

    #[error("resume file mismatch: {0}")]
    ResumeMismatch(&'static str),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("error while loading configuration: {0}")]
    ConfigFile(#[from] config::ConfigError),

    #[error(
        "could not open `{0}`. Please make sure the program has permission \
         to access it"
    )]
    FileOpen(String),

    #[error("could not send message to Disk")]
    SendErrorDisk(#[from] mpsc::error::SendError<DiskMsg>),

    #[error("could not send message to Peer")]
    SendErrorPeer(#[from] mpsc::error::SendError<PeerMsg>),

    #[error("could not send message to Torrent")]
    SendErrorTorrent(#[from] mpsc::error::SendError<TorrentMsg>),

    #[error("could not receive message from oneshot")]
    ReceiveErrorOneshot(#[from] oneshot::error::RecvError),
}
