//! Codec for encoding and decoding handshakes.
//!
//! The handshake has a different structure than every other message and is
//! only exchanged once, at the very beginning of a connection. After sending
//! and receiving it the codec is switched to [`MessageCodec`], taking care
//! not to discard the underlying receive and send buffers.
//!
//! [`MessageCodec`]: crate::wire::MessageCodec

use bytes::{Buf, BufMut, BytesMut};
use std::io;
use tokio_util::codec::{Decoder, Encoder};

use crate::{peer::PeerId, torrent::InfoHash, wire::PSTR};

/// The 68 bytes that open every connection:
/// `pstrlen || pstr || reserved || info_hash || peer_id`.
///
/// Reserved byte 5, bit 0x10, advertises support for the extension
/// protocol (BEP 10). The remote peer_id is kept for display only.
#[derive(Clone, Debug, PartialEq)]
pub struct Handshake {
    pub pstr_len: u8,
    pub pstr: [u8; 19],
    pub reserved: [u8; 8],
    pub info_hash: InfoHash,
    pub peer_id: PeerId,
}

pub const HANDSHAKE_LEN: usize = 68;

impl Handshake {
    pub fn new(info_hash: InfoHash, peer_id: PeerId) -> Self {
        let mut reserved = [0u8; 8];
        // we support the extension protocol
        reserved[5] |= 0x10;

        Self { pstr_len: 19, pstr: PSTR, reserved, info_hash, peer_id }
    }

    pub fn supports_extension(&self) -> bool {
        self.reserved[5] & 0x10 != 0
    }

    /// A handshake is acceptable when the protocol string checks out and the
    /// info_hash matches the torrent we are serving. Anything else severs
    /// the connection.
    pub fn is_valid(&self, info_hash: &InfoHash) -> bool {
        self.pstr_len == 19
            && self.pstr == PSTR
            && self.info_hash == *info_hash
    }
}

#[derive(Debug)]
pub struct HandshakeCodec;

impl Encoder<Handshake> for HandshakeCodec {
    type Error = io::Error;

    fn encode(
        &mut self,
        handshake: Handshake,
        buf: &mut BytesMut,
    ) -> io::Result<()> {
        buf.reserve(HANDSHAKE_LEN);
        buf.put_u8(handshake.pstr_len);
        buf.extend_from_slice(&handshake.pstr);
        buf.extend_from_slice(&handshake.reserved);
        buf.extend_from_slice(&handshake.info_hash.0);
        buf.extend_from_slice(&handshake.peer_id.0);
        Ok(())
    }
}

impl Decoder for HandshakeCodec {
    type Item = Handshake;
    type Error = io::Error;

    fn decode(&mut self, buf: &mut BytesMut) -> io::Result<Option<Handshake>> {
        if buf.is_empty() {
            return Ok(None);
        }

        // peek: the prefix tells us immediately whether this can ever
        // become a valid handshake
        let pstr_len = buf[0] as usize;
        if pstr_len != PSTR.len() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "handshake must start with the 19-byte protocol string",
            ));
        }

        if buf.len() < HANDSHAKE_LEN {
            return Ok(None);
        }
        buf.advance(1);

        let mut pstr = [0; 19];
        buf.copy_to_slice(&mut pstr);
        let mut reserved = [0; 8];
        buf.copy_to_slice(&mut reserved);
        let mut info_hash = [0; 20];
        buf.copy_to_slice(&mut info_hash);
        let mut peer_id = [0; 20];
        buf.copy_to_slice(&mut peer_id);

        Ok(Some(Handshake {
            pstr_len: pstr_len as u8,
            pstr,
            reserved,
            info_hash: InfoHash(info_hash),
            peer_id: PeerId(peer_id),
        }))
    }
}
