//! A library for working with the BitTorrent protocol V1.
//!
//! This is the library behind Remora, a BitTorrent client. It contains the
//! building blocks of the client: a bencode codec, the metainfo and magnet
//! link models, an HTTP tracker client, the peer wire protocol with the
//! extension protocol (BEP 10) and metadata exchange (BEP 9), and the
//! piece-exchange engine that coordinates all of them.
//!
//! The engine is the [`torrent::Torrent`] actor. It drives one tokio task per
//! peer session ([`peer::Peer`]) and one [`disk::Disk`] actor for file I/O,
//! all joined by channels. The engine owns every piece of shared state:
//! piece states, availability, assignments and counters only ever mutate
//! inside its event loop.

pub mod args;
pub mod bencode;
pub mod bitfield;
pub mod config;
pub mod counter;
pub mod disk;
pub mod error;
pub mod extensions;
pub mod magnet;
pub mod metainfo;
pub mod peer;
pub mod resume;
pub mod torrent;
pub mod tracker;
pub mod utils;
pub mod wire;
