//! The peer wire protocol: TCP framing, handshake and message codec.
mod codec;
mod handshake;

pub use codec::{Message, MessageCodec, MessageId};
pub use handshake::{Handshake, HandshakeCodec};

use bytes::{BufMut, BytesMut};

/// The block length most clients support, some drop the connection on
/// blocks larger than this value. The last block of a piece may be smaller.
pub const BLOCK_LEN: u32 = 16384;

/// The largest block a REQUEST may ask of us. Requests above this are a
/// protocol violation.
pub const MAX_REQUEST_LEN: u32 = 131_072;

/// String identifier of the protocol, "BitTorrent protocol".
pub const PSTR: [u8; 19] = *b"BitTorrent protocol";

/// A Block is a subset of a Piece. Peers exchange data block by block, on
/// the PIECE message of the wire protocol.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Block {
    /// The index of the piece this block belongs to.
    pub index: usize,
    /// The zero-based byte offset into the piece.
    pub begin: u32,
    /// The block's data, at most [`BLOCK_LEN`] bytes.
    pub block: Vec<u8>,
}

impl Block {
    /// Like most clients, we drop peers that push blocks above 16 KiB.
    pub fn is_valid(&self) -> bool {
        !self.block.is_empty() && self.block.len() <= BLOCK_LEN as usize
    }
}

/// The coordinates of a [`Block`]: what we put on a REQUEST or CANCEL.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BlockInfo {
    /// The index of the piece of which this is a block.
    pub index: u32,
    /// The zero-based byte offset into the piece.
    pub begin: u32,
    /// The block's length in bytes.
    pub len: u32,
}

impl BlockInfo {
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32(self.index);
        buf.put_u32(self.begin);
        buf.put_u32(self.len);
    }

    /// Validates an incoming request. The piece-level bound check happens
    /// in the engine, which knows the piece size.
    pub fn is_valid_request(&self) -> bool {
        self.len > 0 && self.len <= MAX_REQUEST_LEN
    }
}
