//! The metadata exchange extension (BEP 9).
//!
//! Magnet-only peers have the info_hash but not the `info` dictionary; this
//! extension lets them pull it from peers in 16 KiB pieces. A message is a
//! bencoded header, and for `msg_type=1` the raw piece bytes follow
//! immediately after the header's closing `e`.
//!
//! <http://www.bittorrent.org/beps/bep_0009.html>

use crate::{
    bencode::{self, Dict, Parser, Value},
    error::Error,
};

/// Metadata pieces are always 16 KiB except for the last one.
pub const METADATA_PIECE_LEN: u32 = 16384;

/// A message of the metadata extension.
#[derive(Debug, Clone, PartialEq)]
pub enum MetadataMsg {
    /// `msg_type=0`: ask for one metadata piece.
    Request(u32),
    /// `msg_type=1`: a piece of the info dictionary, with its bytes.
    Data { piece: u32, total_size: u32, payload: Vec<u8> },
    /// `msg_type=2`: the peer will not serve that piece.
    Reject(u32),
}

#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq)]
enum MsgType {
    Request = 0,
    Data = 1,
    Reject = 2,
}

impl MetadataMsg {
    /// How many metadata pieces a dictionary of `total_size` bytes has.
    pub fn piece_count(total_size: u32) -> u32 {
        total_size.div_ceil(METADATA_PIECE_LEN)
    }

    /// A data message for `piece`, slicing the raw info bytes.
    /// Returns `Reject` when the piece is out of range.
    pub fn data_from(info_raw: &[u8], piece: u32) -> MetadataMsg {
        let start = piece as u64 * METADATA_PIECE_LEN as u64;
        if start >= info_raw.len() as u64 {
            return MetadataMsg::Reject(piece);
        }
        let end =
            (start + METADATA_PIECE_LEN as u64).min(info_raw.len() as u64);
        MetadataMsg::Data {
            piece,
            total_size: info_raw.len() as u32,
            payload: info_raw[start as usize..end as usize].to_vec(),
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let (msg_type, piece, total_size, payload) = match self {
            MetadataMsg::Request(piece) => {
                (MsgType::Request, *piece, None, None)
            }
            MetadataMsg::Data { piece, total_size, payload } => {
                (MsgType::Data, *piece, Some(*total_size), Some(payload))
            }
            MetadataMsg::Reject(piece) => (MsgType::Reject, *piece, None, None),
        };

        let mut dict = Dict::new();
        dict.insert(b"msg_type".to_vec(), Value::Int(msg_type as i64));
        dict.insert(b"piece".to_vec(), Value::Int(piece as i64));
        if let Some(total_size) = total_size {
            dict.insert(b"total_size".to_vec(), Value::Int(total_size as i64));
        }

        let mut bytes = bencode::encode(&Value::Dict(dict));
        if let Some(payload) = payload {
            bytes.extend_from_slice(payload);
        }
        bytes
    }

    /// Parse the bencoded header; for a data message everything after the
    /// header is the raw piece payload.
    pub fn from_bytes(buf: &[u8]) -> Result<Self, Error> {
        let mut parser = Parser::new(buf);
        let header = parser.parse_value()?;
        let payload = &buf[parser.pos()..];

        let msg_type = header
            .get(b"msg_type")
            .and_then(Value::as_int)
            .ok_or(Error::Protocol("metadata message missing msg_type"))?;
        let piece = header
            .get(b"piece")
            .and_then(Value::as_int)
            .and_then(|v| u32::try_from(v).ok())
            .ok_or(Error::Protocol("metadata message missing piece"))?;

        match msg_type {
            t if t == MsgType::Request as i64 => {
                Ok(MetadataMsg::Request(piece))
            }
            t if t == MsgType::Data as i64 => {
                let total_size = header
                    .get(b"total_size")
                    .and_then(Value::as_int)
                    .and_then(|v| u32::try_from(v).ok())
                    .ok_or(Error::Protocol(
                        "metadata data message missing total_size",
                    ))?;
                Ok(MetadataMsg::Data {
                    piece,
                    total_size,
                    payload: payload.to_vec(),
                })
            }
            t if t == MsgType::Reject as i64 => Ok(MetadataMsg::Reject(piece)),
            _ => Err(Error::Protocol("unknown metadata msg_type")),
        }
    }
}
