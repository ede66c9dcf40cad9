//! Metainfo is a .torrent file with information about the Torrent.
//! From a magnet link, we get the same structure from other peers (BEP 9).

use crate::{
    bencode::{self, Value},
    error::Error,
    torrent::InfoHash,
    wire::{BlockInfo, BLOCK_LEN},
};

/// The top-level dictionary of a .torrent file.
#[derive(Debug, PartialEq, Clone, Default)]
pub struct MetaInfo {
    pub announce: String,
    pub announce_list: Option<Vec<Vec<String>>>,
    pub comment: Option<String>,
    pub created_by: Option<String>,
    pub creation_date: Option<i64>,
    pub info: Info,
}

impl MetaInfo {
    pub fn from_bencode(buf: &[u8]) -> Result<Self, Error> {
        let root = bencode::decode(buf)?;
        if root.as_dict().is_none() {
            return Err(Error::Metainfo("top-level value is not a dictionary"));
        }

        let announce = root
            .get(b"announce")
            .and_then(Value::as_utf8)
            .map(str::to_owned)
            .ok_or(Error::Metainfo("missing announce"))?;

        let announce_list = root.get(b"announce-list").and_then(|tiers| {
            let tiers = tiers.as_list()?;
            Some(
                tiers
                    .iter()
                    .filter_map(|tier| {
                        let urls: Vec<String> = tier
                            .as_list()?
                            .iter()
                            .filter_map(Value::as_utf8)
                            .map(str::to_owned)
                            .collect();
                        Some(urls)
                    })
                    .collect::<Vec<Vec<String>>>(),
            )
        });

        let comment = root
            .get(b"comment")
            .and_then(Value::as_utf8)
            .map(str::to_owned);
        let created_by = root
            .get(b"created by")
            .and_then(Value::as_utf8)
            .map(str::to_owned);
        let creation_date = root.get(b"creation date").and_then(Value::as_int);

        // the info_hash must be computed over the exact byte slice of the
        // source, so the raw sub-slice is taken before any re-encoding
        let info_buf = bencode::dict_raw_entry(buf, b"info")?
            .ok_or(Error::Metainfo("missing info"))?;
        let info = Info::from_bencode(info_buf)?;

        Ok(Self {
            announce,
            announce_list,
            comment,
            created_by,
            creation_date,
            info,
        })
    }

    /// The announce list flattened in tier order, de-duplicated. When the
    /// torrent has an `announce-list`, it takes the place of `announce`.
    pub fn announce_urls(&self) -> Vec<String> {
        let mut urls = vec![self.announce.clone()];

        if let Some(tiers) = &self.announce_list {
            urls.pop();
            urls.extend(tiers.iter().flatten().cloned());
        }

        let mut seen = Vec::with_capacity(urls.len());
        for url in urls {
            if !seen.contains(&url) {
                seen.push(url);
            }
        }
        seen
    }
}

/// The `info` dictionary: name, piece table, and file layout.
#[derive(Debug, PartialEq, Clone, Default)]
pub struct Info {
    /// Name of the file (single-file) or of the root directory (multi-file).
    pub name: String,

    /// Length in bytes of each piece, the last piece may be smaller.
    pub piece_length: u32,

    /// Concatenation of all 20-byte SHA-1 piece hashes.
    pub pieces: Vec<u8>,

    /// Set in the single-file format, mutually exclusive with `files`.
    pub file_length: Option<u64>,

    /// Set in the multi-file format, mutually exclusive with `file_length`.
    pub files: Option<Vec<File>>,

    /// SHA-1 of the bencoded `info` value as it appeared in the source.
    pub info_hash: InfoHash,

    /// The source bencoding of this dictionary. Peers requesting metadata
    /// over BEP 9 receive slices of these exact bytes.
    pub raw: Vec<u8>,
}

/// Files are relative to the torrent name, which is not part of `path`.
#[derive(Debug, PartialEq, Eq, Clone, Default, Hash)]
pub struct File {
    pub length: u64,
    pub path: Vec<String>,
}

impl Info {
    pub fn from_bencode(buf: &[u8]) -> Result<Self, Error> {
        let root = bencode::decode(buf)?;
        if root.as_dict().is_none() {
            return Err(Error::Metainfo("info is not a dictionary"));
        }

        let name = root
            .get(b"name")
            .and_then(Value::as_utf8)
            .map(str::to_owned)
            .ok_or(Error::Metainfo("missing name"))?;

        let piece_length = root
            .get(b"piece length")
            .and_then(Value::as_int)
            .and_then(|v| u32::try_from(v).ok())
            .filter(|v| *v > 0)
            .ok_or(Error::Metainfo("missing or invalid piece length"))?;

        let pieces = root
            .get(b"pieces")
            .and_then(Value::as_str)
            .ok_or(Error::Metainfo("missing pieces"))?
            .to_vec();
        if pieces.len() % 20 != 0 {
            return Err(Error::Metainfo(
                "pieces is not a multiple of 20 bytes",
            ));
        }

        let file_length = root
            .get(b"length")
            .map(|v| {
                v.as_int()
                    .and_then(|v| u64::try_from(v).ok())
                    .ok_or(Error::Metainfo("invalid length"))
            })
            .transpose()?;

        let files = root
            .get(b"files")
            .map(|v| {
                v.as_list()
                    .ok_or(Error::Metainfo("files is not a list"))?
                    .iter()
                    .map(File::from_value)
                    .collect::<Result<Vec<File>, Error>>()
            })
            .transpose()?;

        match (&file_length, &files) {
            (Some(_), Some(_)) => {
                return Err(Error::Metainfo("both length and files present"))
            }
            (None, None) => {
                return Err(Error::Metainfo("neither length nor files present"))
            }
            _ => {}
        }

        let info = Self {
            name,
            piece_length,
            pieces,
            file_length,
            files,
            info_hash: InfoHash::from_buf(buf),
            raw: buf.to_vec(),
        };

        let expected =
            info.total_size().div_ceil(info.piece_length as u64) as usize;
        if info.pieces() != expected {
            return Err(Error::Metainfo(
                "piece hash count does not match total size",
            ));
        }

        Ok(info)
    }

    /// Canonical re-encoding of the dictionary. Matches `raw` byte for byte
    /// when the source was canonically ordered.
    pub fn to_bencode(&self) -> Vec<u8> {
        let mut dict = bencode::Dict::new();
        if let Some(files) = &self.files {
            let files = files
                .iter()
                .map(|f| {
                    let mut entry = bencode::Dict::new();
                    entry.insert(
                        b"length".to_vec(),
                        Value::Int(f.length as i64),
                    );
                    entry.insert(
                        b"path".to_vec(),
                        Value::List(
                            f.path.iter().map(|s| s.as_str().into()).collect(),
                        ),
                    );
                    Value::Dict(entry)
                })
                .collect();
            dict.insert(b"files".to_vec(), Value::List(files));
        }
        if let Some(length) = self.file_length {
            dict.insert(b"length".to_vec(), Value::Int(length as i64));
        }
        dict.insert(b"name".to_vec(), self.name.as_str().into());
        dict.insert(
            b"piece length".to_vec(),
            Value::Int(self.piece_length as i64),
        );
        dict.insert(b"pieces".to_vec(), Value::Str(self.pieces.clone()));
        bencode::encode(&Value::Dict(dict))
    }

    /// How many pieces there are.
    #[inline]
    pub fn pieces(&self) -> usize {
        self.pieces.len() / 20
    }

    /// The SHA-1 expected of the given piece.
    pub fn piece_hash(&self, index: usize) -> &[u8] {
        &self.pieces[index * 20..index * 20 + 20]
    }

    /// Size in bytes of all files of the torrent.
    pub fn total_size(&self) -> u64 {
        match &self.files {
            Some(files) => files.iter().map(|f| f.length).sum(),
            None => self.file_length.unwrap_or(0),
        }
    }

    /// Size in bytes of the given piece. Only the last one may be short.
    pub fn piece_size(&self, index: usize) -> u32 {
        if index == self.pieces().saturating_sub(1) {
            let remainder = self.total_size() % self.piece_length as u64;
            if remainder == 0 {
                self.piece_length
            } else {
                remainder as u32
            }
        } else {
            self.piece_length
        }
    }

    pub fn last_piece_size(&self) -> u32 {
        self.piece_size(self.pieces().saturating_sub(1))
    }

    pub fn single_file(&self) -> bool {
        self.file_length.is_some()
    }

    /// The file layout normalized to a list. A single-file torrent becomes
    /// one entry with an empty path, which resolves to the torrent name.
    pub fn file_entries(&self) -> Vec<File> {
        match &self.files {
            Some(files) => files.clone(),
            None => vec![File {
                length: self.file_length.unwrap_or(0),
                path: vec![],
            }],
        }
    }

    /// The blocks of a piece in ascending offset order. All blocks are
    /// [`BLOCK_LEN`] long except possibly the last one.
    pub fn block_infos_of_piece(&self, index: usize) -> Vec<BlockInfo> {
        let piece_size = self.piece_size(index);
        let count = piece_size.div_ceil(BLOCK_LEN) as usize;
        let mut blocks = Vec::with_capacity(count);

        for i in 0..count {
            let begin = i as u32 * BLOCK_LEN;
            blocks.push(BlockInfo {
                index: index as u32,
                begin,
                len: BLOCK_LEN.min(piece_size - begin),
            });
        }
        blocks
    }
}

impl File {
    fn from_value(value: &Value) -> Result<Self, Error> {
        let length = value
            .get(b"length")
            .and_then(Value::as_int)
            .and_then(|v| u64::try_from(v).ok())
            .ok_or(Error::Metainfo("file entry missing length"))?;

        let path: Vec<String> = value
            .get(b"path")
            .and_then(Value::as_list)
            .ok_or(Error::Metainfo("file entry missing path"))?
            .iter()
            .filter_map(Value::as_utf8)
            .map(str::to_owned)
            .collect();

        if path.is_empty() {
            return Err(Error::Metainfo("file entry has an empty path"));
        }

        Ok(Self { length, path })
    }
}

/// A slice of a file on disk, in bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub file_index: usize,
    pub file_offset: u64,
    pub length: u64,
}

/// Maps every piece to the ordered file segments that reconstitute it.
///
/// A piece at the boundary of two files maps to one segment per overlapped
/// file; concatenated in order, the segments are exactly the piece.
#[derive(Debug, Clone, Default)]
pub struct PieceMap {
    segments: Vec<Vec<Segment>>,
}

impl PieceMap {
    /// Build the mapping in one pass over pieces and files.
    pub fn build(info: &Info) -> Self {
        let files = info.file_entries();
        let piece_length = info.piece_length as u64;
        let mut segments = Vec::with_capacity(info.pieces());

        let mut first = 0;
        let mut first_start = 0u64;

        for index in 0..info.pieces() {
            let piece_start = index as u64 * piece_length;
            let piece_end = piece_start + info.piece_size(index) as u64;

            while first < files.len()
                && first_start + files[first].length <= piece_start
            {
                first_start += files[first].length;
                first += 1;
            }

            let mut piece_segments = Vec::new();
            let mut file_index = first;
            let mut file_start = first_start;

            while file_index < files.len() && file_start < piece_end {
                let overlap_start = piece_start.max(file_start);
                let overlap_end =
                    piece_end.min(file_start + files[file_index].length);

                if overlap_end > overlap_start {
                    piece_segments.push(Segment {
                        file_index,
                        file_offset: overlap_start - file_start,
                        length: overlap_end - overlap_start,
                    });
                }

                file_start += files[file_index].length;
                file_index += 1;
            }

            segments.push(piece_segments);
        }

        Self { segments }
    }

    pub fn pieces(&self) -> usize {
        self.segments.len()
    }

    pub fn piece(&self, index: usize) -> &[Segment] {
        &self.segments[index]
    }

    /// Map a sub-range of a piece to file slices, the inverse of a piece
    /// write. Used to service block requests from peers.
    pub fn slices(&self, index: usize, begin: u32, len: u32) -> Vec<Segment> {
        let want_start = begin as u64;
        let want_end = want_start + len as u64;

        let mut out = Vec::new();
        let mut in_piece = 0u64;

        for segment in &self.segments[index] {
            let seg_start = in_piece;
            let seg_end = in_piece + segment.length;

            let start = want_start.max(seg_start);
            let end = want_end.min(seg_end);
            if end > start {
                out.push(Segment {
                    file_index: segment.file_index,
                    file_offset: segment.file_offset + (start - seg_start),
                    length: end - start,
                });
            }

            in_piece = seg_end;
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sha1::{Digest, Sha1};

    fn single_file_info(total_size: u64, piece_length: u32) -> Info {
        let pieces = total_size.div_ceil(piece_length as u64) as usize;
        Info {
            name: "test".to_owned(),
            piece_length,
            pieces: vec![0u8; pieces * 20],
            file_length: Some(total_size),
            ..Default::default()
        }
    }

    #[test]
    fn parse_single_file_torrent() {
        let buf = b"d8:announce19:http://tr.example/a4:infod6:lengthi30e4:\
            name1:a12:piece lengthi16e6:pieces40:0123456789012345678901234567\
            890123456789ee";
        let meta = MetaInfo::from_bencode(buf).unwrap();

        assert_eq!(meta.announce, "http://tr.example/a");
        assert_eq!(meta.info.name, "a");
        assert_eq!(meta.info.piece_length, 16);
        assert_eq!(meta.info.total_size(), 30);
        assert_eq!(meta.info.pieces(), 2);
        assert_eq!(meta.info.piece_size(0), 16);
        assert_eq!(meta.info.piece_size(1), 14);
        assert!(meta.info.single_file());
    }

    #[test]
    fn info_hash_is_sha1_of_source_slice() {
        let info_buf: &[u8] = b"d6:lengthi30e4:name1:a12:piece lengthi16e6:\
            pieces40:0123456789012345678901234567890123456789e";
        let mut buf = b"d8:announce3:urn4:info".to_vec();
        buf.extend_from_slice(info_buf);
        buf.push(b'e');

        let meta = MetaInfo::from_bencode(&buf).unwrap();

        let mut hasher = Sha1::new();
        hasher.update(info_buf);
        let digest: [u8; 20] = hasher.finalize().into();

        assert_eq!(meta.info.info_hash, InfoHash(digest));
        assert_eq!(meta.info.raw, info_buf);
        // a canonical source re-encodes bit-exactly
        assert_eq!(meta.info.to_bencode(), info_buf);
    }

    #[test]
    fn rejects_pieces_not_multiple_of_20() {
        let buf = b"d8:announce1:u4:infod6:lengthi30e4:name1:a12:piece \
            lengthi16e6:pieces3:abcee";
        assert!(matches!(
            MetaInfo::from_bencode(buf),
            Err(Error::Metainfo(_))
        ));
    }

    #[test]
    fn rejects_missing_length_and_files() {
        let buf = b"d8:announce1:u4:infod4:name1:a12:piece lengthi16e6:\
            pieces0:ee";
        assert!(matches!(
            MetaInfo::from_bencode(buf),
            Err(Error::Metainfo(_))
        ));
    }

    #[test]
    fn announce_list_replaces_announce_and_dedups() {
        let meta = MetaInfo {
            announce: "http://a/ann".to_owned(),
            announce_list: Some(vec![
                vec!["http://b/ann".to_owned(), "http://c/ann".to_owned()],
                vec!["http://b/ann".to_owned(), "http://d/ann".to_owned()],
            ]),
            ..Default::default()
        };
        assert_eq!(
            meta.announce_urls(),
            vec!["http://b/ann", "http://c/ann", "http://d/ann"]
        );

        let meta = MetaInfo {
            announce: "http://a/ann".to_owned(),
            ..Default::default()
        };
        assert_eq!(meta.announce_urls(), vec!["http://a/ann"]);
    }

    /// total_size = 3 * piece_length + 42 with 32 KiB pieces: four hashes,
    /// and the 42-byte final piece is requested as a single 42-byte block.
    #[test]
    fn last_piece_boundary() {
        let piece_length = 32 * 1024;
        let info =
            single_file_info(3 * piece_length as u64 + 42, piece_length);

        assert_eq!(info.pieces(), 4);
        assert_eq!(info.last_piece_size(), 42);
        assert_eq!(info.piece_size(2), piece_length);

        let blocks = info.block_infos_of_piece(3);
        assert_eq!(
            blocks,
            vec![BlockInfo { index: 3, begin: 0, len: 42 }]
        );

        // a full piece splits into two ascending 16 KiB blocks
        let blocks = info.block_infos_of_piece(0);
        assert_eq!(
            blocks,
            vec![
                BlockInfo { index: 0, begin: 0, len: BLOCK_LEN },
                BlockInfo { index: 0, begin: BLOCK_LEN, len: BLOCK_LEN },
            ]
        );
    }

    /// Files of 100 and 500 bytes with 128-byte pieces: piece 0 lives in
    /// file 0 entirely, piece 1 straddles both files.
    #[test]
    fn straddling_piece_maps_to_both_files() {
        let info = Info {
            name: "straddle".to_owned(),
            piece_length: 128,
            pieces: vec![0u8; 5 * 20],
            files: Some(vec![
                File { length: 100, path: vec!["first".to_owned()] },
                File { length: 500, path: vec!["second".to_owned()] },
            ]),
            ..Default::default()
        };
        let map = PieceMap::build(&info);

        assert_eq!(
            map.piece(0),
            &[Segment { file_index: 0, file_offset: 0, length: 100 }]
        );
        assert_eq!(
            map.piece(1),
            &[
                Segment { file_index: 0, file_offset: 100, length: 28 },
                Segment { file_index: 1, file_offset: 0, length: 100 },
            ]
        );
    }

    #[test]
    fn piece_map_covers_every_byte_exactly_once() {
        let info = Info {
            name: "coverage".to_owned(),
            piece_length: 1000,
            pieces: vec![0u8; 27 * 20],
            files: Some(vec![
                File { length: 12_345, path: vec!["a".to_owned()] },
                File { length: 1, path: vec!["b".to_owned()] },
                File { length: 14_000, path: vec!["c".to_owned()] },
            ]),
            ..Default::default()
        };
        let map = PieceMap::build(&info);
        let files = info.file_entries();

        let mut mapped = 0u64;
        for piece in 0..info.pieces() {
            let piece_total: u64 =
                map.piece(piece).iter().map(|s| s.length).sum();
            assert_eq!(piece_total, info.piece_size(piece) as u64);

            for segment in map.piece(piece) {
                assert!(
                    segment.file_offset + segment.length
                        <= files[segment.file_index].length
                );
            }
            mapped += piece_total;
        }
        assert_eq!(mapped, info.total_size());
    }

    #[test]
    fn slices_are_the_inverse_of_the_write() {
        let info = Info {
            name: "inv".to_owned(),
            piece_length: 128,
            pieces: vec![0u8; 5 * 20],
            files: Some(vec![
                File { length: 100, path: vec!["first".to_owned()] },
                File { length: 500, path: vec!["second".to_owned()] },
            ]),
            ..Default::default()
        };
        let map = PieceMap::build(&info);

        // a read crossing the file boundary inside piece 1
        assert_eq!(
            map.slices(1, 20, 30),
            vec![
                Segment { file_index: 0, file_offset: 120, length: 8 },
                Segment { file_index: 1, file_offset: 0, length: 22 },
            ]
        );
        // a read inside a single segment
        assert_eq!(
            map.slices(0, 10, 5),
            vec![Segment { file_index: 0, file_offset: 10, length: 5 }]
        );
    }
}
