//! Handle magnet links.
use std::ops::Deref;

use magnet_url::Magnet as Magnet_;

use crate::{error::Error, torrent::InfoHash};

/// A parsed magnet URI: `xt` carries the info_hash, `dn` a display name,
/// `tr` the bootstrap trackers and `xl` an optional exact length.
#[derive(Debug, Clone)]
pub struct Magnet(Magnet_);

impl Deref for Magnet {
    type Target = Magnet_;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl Magnet {
    pub fn new(magnet_url: &str) -> Result<Self, Error> {
        let magnet = Self(Magnet_::new(magnet_url)?);
        // an unusable xt is fatal for the whole input
        magnet.parse_xt()?;
        Ok(magnet)
    }

    /// The display name comes URL encoded, and it is also optional.
    pub fn parse_dn(&self) -> String {
        if let Some(dn) = self.0.display_name() {
            if let Ok(dn) = urlencoding::decode(dn) {
                return dn.to_string();
            }
        }
        "Unknown".to_owned()
    }

    /// The info_hash from the `xt` field, accepted as 40 hex chars or as
    /// 32 base32 chars.
    pub fn parse_xt(&self) -> Result<InfoHash, Error> {
        let xt = self.0.hash().clone().ok_or(Error::MagnetNoInfoHash)?;

        let bytes = match xt.len() {
            40 => hex::decode(xt.as_bytes())
                .map_err(|_| Error::MagnetNoInfoHash)?,
            32 => base32_decode(xt.as_bytes())
                .ok_or(Error::MagnetNoInfoHash)?,
            _ => return Err(Error::MagnetNoInfoHash),
        };

        InfoHash::try_from(bytes).map_err(|_| Error::MagnetNoInfoHash)
    }

    /// All `tr` entries, URL decoded.
    pub fn parse_trackers(&self) -> Vec<String> {
        self.0
            .trackers()
            .iter()
            .filter_map(|tr| urlencoding::decode(tr).ok())
            .map(|tr| tr.to_string())
            .collect()
    }

    /// The exact length from `xl`, when present.
    pub fn length(&self) -> Option<u64> {
        self.0.length()
    }
}

/// RFC 4648 base32, no padding: exactly what a 32-char `btih` encodes.
fn base32_decode(input: &[u8]) -> Option<Vec<u8>> {
    let mut out = Vec::with_capacity(input.len() * 5 / 8);
    let mut acc: u64 = 0;
    let mut bits = 0;

    for &c in input {
        let value = match c {
            b'A'..=b'Z' => c - b'A',
            b'a'..=b'z' => c - b'a',
            b'2'..=b'7' => c - b'2' + 26,
            _ => return None,
        } as u64;

        acc = (acc << 5) | value;
        bits += 5;
        if bits >= 8 {
            bits -= 8;
            out.push((acc >> bits) as u8);
        }
    }
    Some(out)
}
