//! End-to-end download over a loopback swarm: a stub tracker hands out one
//! seeder, the engine handshakes it, exchanges bitfield/interested/unchoke,
//! pulls every block, verifies, writes, and announces completion.

use std::{path::PathBuf, sync::Arc, time::Duration};

use futures::{SinkExt, StreamExt};
use rand::{distr::Alphanumeric, Rng};
use sha1::{Digest, Sha1};
use tokio::{net::TcpListener, spawn, sync::mpsc, time::timeout};
use tokio_util::codec::{Framed, FramedParts};

use remora::{
    bitfield::{Bitfield, PieceBitfield},
    config::Config,
    disk::Disk,
    error::Error,
    metainfo::{Info, MetaInfo},
    peer::PeerId,
    torrent::{InfoHash, Source, Torrent},
    tracker::{HttpResponse, HttpTransport},
    wire::{Block, Handshake, HandshakeCodec, Message, MessageCodec},
};

const PIECE_LEN: u32 = 4;

struct StubTracker {
    body: Vec<u8>,
}

impl HttpTransport for StubTracker {
    async fn get(
        &self,
        _url: &str,
        _timeout: Duration,
    ) -> Result<HttpResponse, Error> {
        Ok(HttpResponse { status: 200, body: self.body.clone() })
    }
}

fn scratch_dir() -> PathBuf {
    let name: String = (0..20)
        .map(|_| rand::rng().sample(Alphanumeric) as char)
        .collect();
    std::env::temp_dir().join(name)
}

fn test_info(content: &[u8]) -> Info {
    let mut pieces = Vec::new();
    for chunk in content.chunks(PIECE_LEN as usize) {
        let mut hasher = Sha1::new();
        hasher.update(chunk);
        let digest: [u8; 20] = hasher.finalize().into();
        pieces.extend_from_slice(&digest);
    }

    let info = Info {
        name: "loopback".to_owned(),
        piece_length: PIECE_LEN,
        pieces,
        file_length: Some(content.len() as u64),
        ..Default::default()
    };
    let raw = info.to_bencode();
    Info { info_hash: InfoHash::from_buf(&raw), raw, ..info }
}

/// A minimal remote peer that seeds `content` over one connection.
async fn run_seeder(
    listener: TcpListener,
    info_hash: InfoHash,
    content: Vec<u8>,
) {
    let (socket, _) = listener.accept().await.unwrap();

    let mut socket = Framed::new(socket, HandshakeCodec);
    let theirs = socket.next().await.unwrap().unwrap();
    assert!(theirs.is_valid(&info_hash));
    socket
        .send(Handshake::new(info_hash, PeerId::gen()))
        .await
        .unwrap();

    let old_parts = socket.into_parts();
    let mut new_parts = FramedParts::new(old_parts.io, MessageCodec);
    new_parts.read_buf = old_parts.read_buf;
    new_parts.write_buf = old_parts.write_buf;
    let mut socket = Framed::from_parts(new_parts);

    let piece_count = content.len().div_ceil(PIECE_LEN as usize);
    let mut bitfield = Bitfield::from_piece_count(piece_count);
    for piece in 0..piece_count {
        bitfield.set(piece, true);
    }
    socket.send(Message::Bitfield(bitfield)).await.unwrap();

    while let Some(Ok(msg)) = socket.next().await {
        match msg {
            Message::Interested => {
                socket.send(Message::Unchoke).await.unwrap();
            }
            Message::Request(request) => {
                let start = request.index as usize * PIECE_LEN as usize
                    + request.begin as usize;
                let block =
                    content[start..start + request.len as usize].to_vec();
                socket
                    .send(Message::Piece(Block {
                        index: request.index as usize,
                        begin: request.begin,
                        block,
                    }))
                    .await
                    .unwrap();
            }
            _ => {}
        }
    }
}

#[tokio::test]
async fn downloads_from_a_loopback_seeder() {
    let dir = scratch_dir();
    let content = b"abcdwxyz1234".to_vec();
    let info = test_info(&content);
    let info_hash = info.info_hash.clone();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    spawn(run_seeder(listener, info_hash.clone(), content.clone()));

    // compact announce response pointing at the seeder
    let mut body = b"d8:intervali900e5:peers6:".to_vec();
    body.extend_from_slice(&[127, 0, 0, 1]);
    body.extend_from_slice(&port.to_be_bytes());
    body.push(b'e');

    let config = Arc::new(Config::test_in(&dir));
    let (disk_tx, disk_rx) = mpsc::channel(64);
    let mut disk = Disk::new(disk_rx, config.download_path());
    spawn(async move { disk.run().await });

    let meta = MetaInfo {
        announce: "http://tracker.test/announce".to_owned(),
        info,
        ..Default::default()
    };

    let mut torrent = Torrent::new(
        config,
        disk_tx,
        Source::MetaInfo(Box::new(meta)),
        StubTracker { body },
        "loopback.torrent".to_owned(),
    )
    .unwrap();

    timeout(Duration::from_secs(30), torrent.run())
        .await
        .expect("download timed out")
        .expect("download failed");

    let written = tokio::fs::read(dir.join("loopback")).await.unwrap();
    assert_eq!(written, content);

    // the next run would resume fully complete
    let resume = tokio::fs::read_to_string(
        dir.join(".resume").join(format!("{info_hash}.resume")),
    )
    .await
    .unwrap();
    assert!(resume.contains("completed_pieces=0,1,2"));

    tokio::fs::remove_dir_all(&dir).await.unwrap();
}
