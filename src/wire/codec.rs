//! The message codec used after a successful handshake.
//!
//! Every frame is `length: u32_be || id: u8 || payload`, except KEEP-ALIVE
//! which is a bare zero length. Message id 20 carries the extension
//! protocol: one extra byte selects the extension, the rest is its payload.

use std::io::Cursor;

use bytes::{Buf, BufMut, BytesMut};
use tokio::io;
use tokio_util::codec::{Decoder, Encoder};
use tracing::trace;

use crate::{
    bitfield::Bitfield,
    error::Error,
    wire::{Block, BlockInfo},
};

/// Frames larger than this are not something the protocol can produce and
/// mean the length prefix itself is garbage.
const MAX_FRAME_LEN: usize = 1 << 21;

/// The messages of the core protocol, plus the extension envelope.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have(usize),
    Bitfield(Bitfield),
    Request(BlockInfo),
    Piece(Block),
    Cancel(BlockInfo),
    /// `(extension id, raw payload)`. Id 0 is the extended handshake;
    /// other ids are whatever the two sides negotiated on it.
    Extended(u8, Vec<u8>),
}

/// The wire ids of the [`Message`]s.
#[repr(u8)]
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum MessageId {
    Choke = 0,
    Unchoke = 1,
    Interested = 2,
    NotInterested = 3,
    Have = 4,
    Bitfield = 5,
    Request = 6,
    Piece = 7,
    Cancel = 8,
    Extended = 20,
}

impl TryFrom<u8> for MessageId {
    type Error = io::Error;

    fn try_from(id: u8) -> Result<Self, Self::Error> {
        use MessageId::*;
        match id {
            id if id == Choke as u8 => Ok(Choke),
            id if id == Unchoke as u8 => Ok(Unchoke),
            id if id == Interested as u8 => Ok(Interested),
            id if id == NotInterested as u8 => Ok(NotInterested),
            id if id == Have as u8 => Ok(Have),
            id if id == Bitfield as u8 => Ok(Bitfield),
            id if id == Request as u8 => Ok(Request),
            id if id == Piece as u8 => Ok(Piece),
            id if id == Cancel as u8 => Ok(Cancel),
            id if id == Extended as u8 => Ok(Extended),
            _ => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "unknown message id",
            )),
        }
    }
}

#[derive(Debug, Clone)]
pub struct MessageCodec;

impl Encoder<Message> for MessageCodec {
    type Error = Error;

    fn encode(
        &mut self,
        item: Message,
        buf: &mut BytesMut,
    ) -> Result<(), Self::Error> {
        match item {
            Message::KeepAlive => {
                buf.put_u32(0);
            }
            Message::Choke => {
                buf.put_u32(1);
                buf.put_u8(MessageId::Choke as u8);
            }
            Message::Unchoke => {
                buf.put_u32(1);
                buf.put_u8(MessageId::Unchoke as u8);
            }
            Message::Interested => {
                buf.put_u32(1);
                buf.put_u8(MessageId::Interested as u8);
            }
            Message::NotInterested => {
                buf.put_u32(1);
                buf.put_u8(MessageId::NotInterested as u8);
            }
            // <len=0005><id=4><piece index>
            Message::Have(piece_index) => {
                buf.put_u32(1 + 4);
                buf.put_u8(MessageId::Have as u8);
                let piece_index = piece_index.try_into().map_err(|e| {
                    io::Error::new(io::ErrorKind::InvalidInput, e)
                })?;
                buf.put_u32(piece_index);
            }
            // <len=0001+X><id=5><bitfield>
            Message::Bitfield(bitfield) => {
                let bytes = bitfield.into_vec();
                buf.put_u32(1 + bytes.len() as u32);
                buf.put_u8(MessageId::Bitfield as u8);
                buf.extend_from_slice(&bytes);
            }
            // <len=0013><id=6><index><begin><length>
            Message::Request(block_info) => {
                buf.put_u32(1 + 4 + 4 + 4);
                buf.put_u8(MessageId::Request as u8);
                block_info.encode(buf);
            }
            // <len=0009+X><id=7><index><begin><block>
            Message::Piece(block) => {
                let Block { index, begin, block } = block;

                buf.put_u32(1 + 4 + 4 + block.len() as u32);
                buf.put_u8(MessageId::Piece as u8);

                let index = index.try_into().map_err(|e| {
                    io::Error::new(io::ErrorKind::InvalidInput, e)
                })?;
                buf.put_u32(index);
                buf.put_u32(begin);
                buf.put(&block[..]);
            }
            // <len=0013><id=8><index><begin><length>
            Message::Cancel(block_info) => {
                buf.put_u32(1 + 4 + 4 + 4);
                buf.put_u8(MessageId::Cancel as u8);
                block_info.encode(buf);
            }
            // <len=0002+X><id=20><ext_id><payload>
            Message::Extended(ext_id, payload) => {
                buf.put_u32(2 + payload.len() as u32);
                buf.put_u8(MessageId::Extended as u8);
                buf.put_u8(ext_id);
                if !payload.is_empty() {
                    buf.extend_from_slice(&payload);
                }
            }
        }
        Ok(())
    }
}

impl Decoder for MessageCodec {
    type Item = Message;
    type Error = Error;

    fn decode(
        &mut self,
        buf: &mut BytesMut,
    ) -> Result<Option<Self::Item>, Self::Error> {
        // the length header must be present at the minimum, otherwise we
        // can't determine the message type
        if buf.remaining() < 4 {
            return Ok(None);
        }

        // peek at the length without advancing the buffer: the rest of the
        // frame might not have arrived yet
        let mut peek = Cursor::new(&buf);
        let msg_len = peek.get_u32() as usize;

        if msg_len > MAX_FRAME_LEN {
            return Err(Error::Protocol("frame length overflow"));
        }

        if buf.remaining() < 4 + msg_len {
            trace!(
                "read buffer is {} bytes but the frame is {} bytes",
                buf.remaining(),
                msg_len
            );
            return Ok(None);
        }
        buf.advance(4);

        // a zero length means keep-alive, there is no id byte
        if msg_len == 0 {
            return Ok(Some(Message::KeepAlive));
        }

        let msg_id = MessageId::try_from(buf.get_u8())?;

        let msg = match msg_id {
            MessageId::Choke => Message::Choke,
            MessageId::Unchoke => Message::Unchoke,
            MessageId::Interested => Message::Interested,
            MessageId::NotInterested => Message::NotInterested,
            MessageId::Have => Message::Have(buf.get_u32() as usize),
            MessageId::Bitfield => {
                let mut bitfield = vec![0; msg_len - 1];
                buf.copy_to_slice(&mut bitfield);
                Message::Bitfield(Bitfield::from_vec(bitfield))
            }
            MessageId::Request => {
                if msg_len != 13 {
                    return Err(Error::Protocol("malformed request frame"));
                }
                let index = buf.get_u32();
                let begin = buf.get_u32();
                let len = buf.get_u32();
                Message::Request(BlockInfo { index, begin, len })
            }
            MessageId::Piece => {
                if msg_len < 9 {
                    return Err(Error::Protocol("malformed piece frame"));
                }
                let index = buf.get_u32() as usize;
                let begin = buf.get_u32();
                let mut block = vec![0; msg_len - 9];
                buf.copy_to_slice(&mut block);
                Message::Piece(Block { index, begin, block })
            }
            MessageId::Cancel => {
                if msg_len != 13 {
                    return Err(Error::Protocol("malformed cancel frame"));
                }
                let index = buf.get_u32();
                let begin = buf.get_u32();
                let len = buf.get_u32();
                Message::Cancel(BlockInfo { index, begin, len })
            }
            MessageId::Extended => {
                if msg_len < 2 {
                    return Err(Error::Protocol("malformed extended frame"));
                }
                let ext_id = buf.get_u8();
                let mut payload = vec![0u8; msg_len - 2];
                buf.copy_to_slice(&mut payload);
                Message::Extended(ext_id, payload)
            }
        };

        Ok(Some(msg))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::BLOCK_LEN;
    use bitvec::{bitvec, prelude::Msb0};

    fn roundtrip(msg: Message) -> Message {
        let mut buf = BytesMut::new();
        MessageCodec.encode(msg, &mut buf).unwrap();
        MessageCodec.decode(&mut buf).unwrap().unwrap()
    }

    #[test]
    fn keep_alive_is_a_bare_zero_length() {
        let mut buf = BytesMut::new();
        MessageCodec.encode(Message::KeepAlive, &mut buf).unwrap();
        assert_eq!(&buf[..], [0, 0, 0, 0]);
        assert_eq!(roundtrip(Message::KeepAlive), Message::KeepAlive);
    }

    #[test]
    fn request_frame() {
        let msg = Message::Request(BlockInfo {
            index: 1,
            begin: BLOCK_LEN,
            len: BLOCK_LEN,
        });

        let mut buf = BytesMut::new();
        MessageCodec.encode(msg.clone(), &mut buf).unwrap();

        assert_eq!(buf.len(), 17);
        assert_eq!(buf.get_u32(), 13);
        assert_eq!(buf.get_u8(), MessageId::Request as u8);
        assert_eq!(buf.get_u32(), 1);
        assert_eq!(buf.get_u32(), BLOCK_LEN);
        assert_eq!(buf.get_u32(), BLOCK_LEN);

        assert_eq!(roundtrip(msg.clone()), msg);
    }

    #[test]
    fn piece_frame() {
        let msg = Message::Piece(Block {
            index: 3,
            begin: 9,
            block: vec![1, 2, 3],
        });

        let mut buf = BytesMut::new();
        MessageCodec.encode(msg.clone(), &mut buf).unwrap();
        assert_eq!(buf.get_u32(), 9 + 3);
        assert_eq!(buf.get_u8(), MessageId::Piece as u8);

        assert_eq!(roundtrip(msg.clone()), msg);
    }

    #[test]
    fn bitfield_frame_is_msb_first() {
        let mut original = bitvec![u8, Msb0; 0; 16];
        original.set(0, true);
        original.set(9, true);

        let mut buf = BytesMut::new();
        MessageCodec
            .encode(Message::Bitfield(original.clone()), &mut buf)
            .unwrap();
        assert_eq!(buf.get_u32(), 3);
        assert_eq!(buf.get_u8(), MessageId::Bitfield as u8);
        assert_eq!(buf.get_u8(), 0b1000_0000);
        assert_eq!(buf.get_u8(), 0b0100_0000);

        match roundtrip(Message::Bitfield(original.clone())) {
            Message::Bitfield(bitfield) => {
                assert_eq!(bitfield, original);
            }
            other => panic!("expected bitfield, got {other:?}"),
        }
    }

    #[test]
    fn extended_frame() {
        let msg = Message::Extended(0, vec![]);
        let mut buf = BytesMut::new();
        MessageCodec.encode(msg.clone(), &mut buf).unwrap();

        assert_eq!(buf.len(), 6);
        assert_eq!(buf.get_u32(), 2);
        assert_eq!(buf.get_u8(), MessageId::Extended as u8);
        assert_eq!(buf.get_u8(), 0);

        let msg = Message::Extended(3, b"d5:piecei0ee".to_vec());
        assert_eq!(roundtrip(msg.clone()), msg);
    }

    #[test]
    fn simple_state_frames() {
        for msg in [
            Message::Choke,
            Message::Unchoke,
            Message::Interested,
            Message::NotInterested,
            Message::Have(42),
            Message::Cancel(BlockInfo { index: 0, begin: 0, len: 1 }),
        ] {
            assert_eq!(roundtrip(msg.clone()), msg);
        }
    }

    #[test]
    fn partial_frame_waits_for_more() {
        let mut buf = BytesMut::new();
        MessageCodec
            .encode(
                Message::Piece(Block {
                    index: 0,
                    begin: 0,
                    block: vec![0; 100],
                }),
                &mut buf,
            )
            .unwrap();
        buf.truncate(50);

        assert!(MessageCodec.decode(&mut buf).unwrap().is_none());
        // nothing was consumed
        assert_eq!(buf.len(), 50);
    }

    #[test]
    fn oversize_length_prefix_is_a_protocol_error() {
        let mut buf = BytesMut::new();
        buf.put_u32(u32::MAX);
        assert!(MessageCodec.decode(&mut buf).is_err());
    }

    #[test]
    fn two_frames_in_one_buffer() {
        let mut buf = BytesMut::new();
        MessageCodec.encode(Message::Unchoke, &mut buf).unwrap();
        MessageCodec.encode(Message::Have(7), &mut buf).unwrap();

        assert_eq!(
            MessageCodec.decode(&mut buf).unwrap().unwrap(),
            Message::Unchoke
        );
        assert_eq!(
            MessageCodec.decode(&mut buf).unwrap().unwrap(),
            Message::Have(7)
        );
        assert!(MessageCodec.decode(&mut buf).unwrap().is_none());
    }
}
