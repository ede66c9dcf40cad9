//! Extensions of the peer protocol.
//!
//! The extension protocol (BEP 10) rides on message id 20: extension id 0
//! is the extended handshake below, every other id is whatever the two
//! sides agreed on through their `m` dictionaries.

pub mod metadata;

use crate::{
    bencode::{self, Dict, Value},
    error::Error,
};

/// The extension id we advertise for the metadata extension. Peers address
/// metadata messages to us with this id; we address them with the id found
/// in the peer's own handshake.
pub const UT_METADATA_ID: u8 = 1;

/// The payload of the extended handshake, extension id 0.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ExtensionHandshake {
    /// Supported extensions, name to extension id.
    pub m: M,
    /// Local listen port.
    pub p: Option<u16>,
    /// A string identifying the client and version.
    pub v: Option<String>,
    /// Number of outstanding request messages this client supports.
    pub reqq: Option<u16>,
    /// Added by BEP 9: the size of the bencoded `info` dictionary.
    pub metadata_size: Option<u32>,
}

/// The `m` dictionary of the extended handshake: which extensions the peer
/// supports, and under which ids. We only care about `ut_metadata`.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct M {
    pub ut_metadata: Option<u8>,
}

impl ExtensionHandshake {
    /// The handshake we send: metadata supported, plus the size of our
    /// `info` dict when we already have it.
    pub fn ours(metadata_size: Option<u32>, port: u16) -> Self {
        Self {
            m: M { ut_metadata: Some(UT_METADATA_ID) },
            p: Some(port),
            v: Some(format!("Remora {}", env!("CARGO_PKG_VERSION"))),
            reqq: None,
            metadata_size,
        }
    }

    pub fn to_bencode(&self) -> Vec<u8> {
        let mut m = Dict::new();
        if let Some(ut_metadata) = self.m.ut_metadata {
            m.insert(b"ut_metadata".to_vec(), Value::Int(ut_metadata as i64));
        }

        let mut dict = Dict::new();
        dict.insert(b"m".to_vec(), Value::Dict(m));
        if let Some(metadata_size) = self.metadata_size {
            dict.insert(
                b"metadata_size".to_vec(),
                Value::Int(metadata_size as i64),
            );
        }
        if let Some(p) = self.p {
            dict.insert(b"p".to_vec(), Value::Int(p as i64));
        }
        if let Some(reqq) = self.reqq {
            dict.insert(b"reqq".to_vec(), Value::Int(reqq as i64));
        }
        if let Some(v) = &self.v {
            dict.insert(b"v".to_vec(), v.as_str().into());
        }

        bencode::encode(&Value::Dict(dict))
    }

    pub fn from_bencode(buf: &[u8]) -> Result<Self, Error> {
        let root = bencode::decode(buf)?;
        if root.as_dict().is_none() {
            return Err(Error::Protocol(
                "extended handshake is not a dictionary",
            ));
        }

        let ut_metadata = root
            .get(b"m")
            .and_then(|m| m.get(b"ut_metadata"))
            .and_then(Value::as_int)
            .and_then(|v| u8::try_from(v).ok());

        Ok(Self {
            m: M { ut_metadata },
            p: root
                .get(b"p")
                .and_then(Value::as_int)
                .and_then(|v| u16::try_from(v).ok()),
            v: root.get(b"v").and_then(Value::as_utf8).map(str::to_owned),
            reqq: root
                .get(b"reqq")
                .and_then(Value::as_int)
                .and_then(|v| u16::try_from(v).ok()),
            metadata_size: root
                .get(b"metadata_size")
                .and_then(Value::as_int)
                .and_then(|v| u32::try_from(v).ok()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_a_real_client_handshake() {
        // d1:ei1e1:md11:ut_metadatai3e6:ut_pexi1ee13:metadata_sizei5205e
        // 1:pi51413e4:reqqi512e11:upload_onlyi1e1:v17:Transmission 2.94e
        let bytes = [
            100, 49, 58, 101, 105, 49, 101, 49, 58, 109, 100, 49, 49, 58,
            117, 116, 95, 109, 101, 116, 97, 100, 97, 116, 97, 105, 51, 101,
            54, 58, 117, 116, 95, 112, 101, 120, 105, 49, 101, 101, 49, 51,
            58, 109, 101, 116, 97, 100, 97, 116, 97, 95, 115, 105, 122, 101,
            105, 53, 50, 48, 53, 101, 49, 58, 112, 105, 53, 49, 52, 49, 51,
            101, 52, 58, 114, 101, 113, 113, 105, 53, 49, 50, 101, 49, 49,
            58, 117, 112, 108, 111, 97, 100, 95, 111, 110, 108, 121, 105, 49,
            101, 49, 58, 118, 49, 55, 58, 84, 114, 97, 110, 115, 109, 105,
            115, 115, 105, 111, 110, 32, 50, 46, 57, 52, 101,
        ];

        let handshake = ExtensionHandshake::from_bencode(&bytes).unwrap();

        assert_eq!(
            handshake,
            ExtensionHandshake {
                m: M { ut_metadata: Some(3) },
                p: Some(51413),
                v: Some("Transmission 2.94".to_owned()),
                reqq: Some(512),
                metadata_size: Some(5205),
            }
        );
    }

    #[test]
    fn ours_roundtrips() {
        let ours = ExtensionHandshake::ours(Some(5205), 6881);
        let bytes = ours.to_bencode();
        let back = ExtensionHandshake::from_bencode(&bytes).unwrap();
        assert_eq!(back, ours);
        assert_eq!(back.m.ut_metadata, Some(UT_METADATA_ID));
    }

    #[test]
    fn minimal_handshake_decodes() {
        let handshake =
            ExtensionHandshake::from_bencode(b"d1:md11:ut_metadatai1eee")
                .unwrap();
        assert_eq!(handshake.m.ut_metadata, Some(1));
        assert_eq!(handshake.metadata_size, None);
    }
}
