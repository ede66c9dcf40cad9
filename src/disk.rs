//! Disk is responsible for all file I/O of a torrent.
//!
//! It runs as one actor over a single queue, so piece writes from the
//! engine and block reads for uploads serialize: a read can never observe
//! a half-written piece.

use std::{
    io::SeekFrom,
    path::{Path, PathBuf},
};

use tokio::{
    fs::{create_dir_all, File, OpenOptions},
    io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt},
    sync::{mpsc::Receiver, oneshot::Sender},
};
use tracing::debug;

use crate::{
    error::Error,
    metainfo::{Info, PieceMap},
    wire::BlockInfo,
};

#[derive(Debug)]
pub enum DiskMsg {
    /// Sent once the `info` is known: builds the piece map and creates the
    /// skeleton of the torrent on disk, empty files and directories.
    NewTorrent { info: Info, recipient: Sender<Result<(), Error>> },

    /// Write a verified piece. The recipient is acked only after every
    /// segment write returned, which is what lets the engine advance the
    /// resume store safely.
    WritePiece {
        index: usize,
        data: Vec<u8>,
        recipient: Sender<Result<(), Error>>,
    },

    /// Read a block range back from the files, for an upload.
    ReadBlock {
        block_info: BlockInfo,
        recipient: Sender<Result<Vec<u8>, Error>>,
    },

    Quit,
}

struct TorrentFiles {
    /// `<download_dir>/<name>`: the single file, or the root directory.
    base: PathBuf,
    /// Resolved path and length per file, indexed like the piece map.
    files: Vec<(PathBuf, u64)>,
    piece_map: PieceMap,
}

/// The disk actor. Opens and creates files and directories, writes piece
/// segments, and reads blocks back on demand; it holds no piece cache.
pub struct Disk {
    rx: Receiver<DiskMsg>,
    download_dir: PathBuf,
    torrent: Option<TorrentFiles>,
}

impl Disk {
    pub fn new(rx: Receiver<DiskMsg>, download_dir: PathBuf) -> Self {
        Self { rx, download_dir, torrent: None }
    }

    pub async fn run(&mut self) -> Result<(), Error> {
        debug!("disk started event loop");
        while let Some(msg) = self.rx.recv().await {
            match msg {
                DiskMsg::NewTorrent { info, recipient } => {
                    let _ = recipient.send(self.new_torrent(&info).await);
                }
                DiskMsg::WritePiece { index, data, recipient } => {
                    let _ =
                        recipient.send(self.write_piece(index, &data).await);
                }
                DiskMsg::ReadBlock { block_info, recipient } => {
                    let _ = recipient.send(self.read_block(block_info).await);
                }
                DiskMsg::Quit => {
                    debug!("disk quitting");
                    return Ok(());
                }
            }
        }
        Ok(())
    }

    /// Create the skeleton of the torrent: empty files and directories.
    async fn new_torrent(&mut self, info: &Info) -> Result<(), Error> {
        let base = self.download_dir.join(&info.name);

        let mut files = Vec::new();
        for file in info.file_entries() {
            let mut path = base.clone();
            for part in &file.path {
                path.push(part);
            }

            if let Some(parent) = path.parent() {
                create_dir_all(parent).await?;
            }
            self.open_file(&path).await?;

            files.push((path, file.length));
        }

        self.torrent = Some(TorrentFiles {
            base,
            files,
            piece_map: PieceMap::build(info),
        });

        Ok(())
    }

    async fn write_piece(
        &mut self,
        index: usize,
        data: &[u8],
    ) -> Result<(), Error> {
        let torrent = self.torrent()?;

        let mut in_piece = 0usize;
        for segment in torrent.piece_map.piece(index) {
            let (path, _) = &torrent.files[segment.file_index];
            let mut file = open_rw(path).await?;

            file.seek(SeekFrom::Start(segment.file_offset)).await?;
            file.write_all(
                &data[in_piece..in_piece + segment.length as usize],
            )
            .await?;
            file.flush().await?;

            in_piece += segment.length as usize;
        }

        debug!("wrote piece {index}, {} bytes", data.len());
        Ok(())
    }

    async fn read_block(
        &mut self,
        block_info: BlockInfo,
    ) -> Result<Vec<u8>, Error> {
        let torrent = self.torrent()?;

        let slices = torrent.piece_map.slices(
            block_info.index as usize,
            block_info.begin,
            block_info.len,
        );

        let mapped: u64 = slices.iter().map(|s| s.length).sum();
        if mapped != block_info.len as u64 {
            return Err(Error::Protocol("requested range is out of bounds"));
        }

        let mut buf = Vec::with_capacity(block_info.len as usize);
        for segment in slices {
            let (path, _) = &torrent.files[segment.file_index];
            let mut file = open_rw(path).await?;

            file.seek(SeekFrom::Start(segment.file_offset)).await?;
            let mut chunk = vec![0u8; segment.length as usize];
            file.read_exact(&mut chunk).await?;
            buf.extend_from_slice(&chunk);
        }

        Ok(buf)
    }

    async fn open_file(&self, path: &Path) -> Result<File, Error> {
        open_rw(path).await
    }

    fn torrent(&self) -> Result<&TorrentFiles, Error> {
        self.torrent
            .as_ref()
            .ok_or(Error::Protocol("disk has no torrent yet"))
    }

    /// The directory (or single file) everything lives under.
    pub fn base_path(&self) -> Option<&Path> {
        self.torrent.as_ref().map(|t| t.base.as_path())
    }
}

async fn open_rw(path: &Path) -> Result<File, Error> {
    OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .open(path)
        .await
        .map_err(|_| {
            Error::FileOpen(path.to_string_lossy().into_owned())
        })
}
