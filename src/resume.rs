//! Persist the completed-piece bitmap across runs.
//!
//! One plaintext record per torrent lives in the resume directory, named
//! `<hex_info_hash>.resume`, as newline-delimited `key=value` fields with
//! `#` comments. The record is only advanced after a piece's disk write
//! returned, and a record that disagrees on info_hash or piece count is
//! refused so a stale file can never mark foreign pieces complete.

use std::path::{Path, PathBuf};

use tokio::fs;
use tracing::info;

use crate::{error::Error, torrent::InfoHash};

#[derive(Debug, Clone, PartialEq)]
pub struct ResumeState {
    info_hash_hex: String,
    torrent_path: String,
    pub downloaded_bytes: u64,
    pub uploaded_bytes: u64,
    completed: Vec<bool>,
}

impl ResumeState {
    pub fn new(
        info_hash: &InfoHash,
        torrent_path: &str,
        total_pieces: usize,
    ) -> Self {
        Self {
            info_hash_hex: info_hash.to_string(),
            torrent_path: torrent_path.to_owned(),
            downloaded_bytes: 0,
            uploaded_bytes: 0,
            completed: vec![false; total_pieces],
        }
    }

    pub fn file_path(dir: &Path, info_hash: &InfoHash) -> PathBuf {
        dir.join(format!("{info_hash}.resume"))
    }

    /// Load the record for `info_hash`, if one exists.
    ///
    /// `Ok(None)` means a fresh download. A record that does not match the
    /// torrent returns [`Error::ResumeMismatch`]; callers log it and start
    /// fresh.
    pub async fn load(
        dir: &Path,
        info_hash: &InfoHash,
        total_pieces: usize,
    ) -> Result<Option<Self>, Error> {
        let path = Self::file_path(dir, info_hash);
        let Ok(content) = fs::read_to_string(&path).await else {
            return Ok(None);
        };

        let mut state =
            Self::new(info_hash, "", total_pieces);
        let mut loaded_hash = String::new();
        let mut loaded_pieces = 0usize;
        let mut completed_list: Vec<usize> = vec![];

        for line in content.lines() {
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };

            match key {
                "info_hash" => loaded_hash = value.to_owned(),
                "torrent_path" => state.torrent_path = value.to_owned(),
                "total_pieces" => {
                    loaded_pieces = value.parse().unwrap_or(0);
                }
                "downloaded_bytes" => {
                    state.downloaded_bytes = value.parse().unwrap_or(0);
                }
                "uploaded_bytes" => {
                    state.uploaded_bytes = value.parse().unwrap_or(0);
                }
                "completed_pieces" => {
                    completed_list = value
                        .split(',')
                        .filter(|v| !v.is_empty())
                        .filter_map(|v| v.parse().ok())
                        .collect();
                }
                _ => {}
            }
        }

        if loaded_hash != state.info_hash_hex {
            return Err(Error::ResumeMismatch("info_hash differs"));
        }
        if loaded_pieces != total_pieces {
            return Err(Error::ResumeMismatch("piece count differs"));
        }

        for index in completed_list {
            if index < state.completed.len() {
                state.completed[index] = true;
            }
        }

        info!(
            "resume state loaded: {}/{} pieces complete",
            state.completed_count(),
            total_pieces
        );

        Ok(Some(state))
    }

    /// Write the record, atomically where the OS permits: the content goes
    /// to a temporary file first and is renamed over the old record.
    pub async fn save(&self, dir: &Path) -> Result<(), Error> {
        fs::create_dir_all(dir).await?;

        let mut out = String::from("# remora resume state\n");
        out.push_str(&format!("info_hash={}\n", self.info_hash_hex));
        out.push_str(&format!("torrent_path={}\n", self.torrent_path));
        out.push_str(&format!("total_pieces={}\n", self.completed.len()));
        out.push_str(&format!(
            "downloaded_bytes={}\n",
            self.downloaded_bytes
        ));
        out.push_str(&format!("uploaded_bytes={}\n", self.uploaded_bytes));

        let completed: Vec<String> = self
            .completed
            .iter()
            .enumerate()
            .filter(|(_, done)| **done)
            .map(|(index, _)| index.to_string())
            .collect();
        out.push_str(&format!(
            "completed_pieces={}\n",
            completed.join(",")
        ));

        let path = dir.join(format!("{}.resume", self.info_hash_hex));
        let tmp = path.with_extension("resume.tmp");
        fs::write(&tmp, out).await?;
        fs::rename(&tmp, &path).await?;
        Ok(())
    }

    pub fn set_torrent_path(&mut self, path: &str) {
        self.torrent_path = path.to_owned();
    }

    pub fn mark_complete(&mut self, index: usize) {
        if index < self.completed.len() {
            self.completed[index] = true;
        }
    }

    pub fn is_complete(&self, index: usize) -> bool {
        self.completed.get(index).copied().unwrap_or(false)
    }

    pub fn completed_count(&self) -> usize {
        self.completed.iter().filter(|done| **done).count()
    }

    pub fn completed_pieces(&self) -> impl Iterator<Item = usize> + '_ {
        self.completed
            .iter()
            .enumerate()
            .filter(|(_, done)| **done)
            .map(|(index, _)| index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{distr::Alphanumeric, Rng};

    fn scratch_dir() -> PathBuf {
        let name: String = (0..20)
            .map(|_| rand::rng().sample(Alphanumeric) as char)
            .collect();
        std::env::temp_dir().join(name)
    }

    #[tokio::test]
    async fn roundtrip() {
        let dir = scratch_dir();
        let info_hash = InfoHash([0xaa; 20]);

        let mut state = ResumeState::new(&info_hash, "a.torrent", 8);
        state.mark_complete(0);
        state.mark_complete(5);
        state.downloaded_bytes = 1234;
        state.uploaded_bytes = 77;
        state.save(&dir).await.unwrap();

        let loaded = ResumeState::load(&dir, &info_hash, 8)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(loaded, state);
        assert!(loaded.is_complete(0));
        assert!(!loaded.is_complete(1));
        assert_eq!(loaded.completed_count(), 2);
        assert_eq!(
            loaded.completed_pieces().collect::<Vec<usize>>(),
            vec![0, 5]
        );

        tokio::fs::remove_dir_all(&dir).await.unwrap();
    }

    #[tokio::test]
    async fn missing_file_is_a_fresh_start() {
        let dir = scratch_dir();
        let loaded = ResumeState::load(&dir, &InfoHash([1; 20]), 4)
            .await
            .unwrap();
        assert!(loaded.is_none());
    }

    #[tokio::test]
    async fn refuses_wrong_piece_count() {
        let dir = scratch_dir();
        let info_hash = InfoHash([0xbb; 20]);

        let state = ResumeState::new(&info_hash, "b.torrent", 8);
        state.save(&dir).await.unwrap();

        assert!(matches!(
            ResumeState::load(&dir, &info_hash, 9).await,
            Err(Error::ResumeMismatch(_))
        ));

        tokio::fs::remove_dir_all(&dir).await.unwrap();
    }

    #[tokio::test]
    async fn ignores_comments_and_unknown_keys() {
        let dir = scratch_dir();
        let info_hash = InfoHash([0xcc; 20]);
        tokio::fs::create_dir_all(&dir).await.unwrap();

        let content = format!(
            "# a comment\ninfo_hash={info_hash}\nfuture_key=1\n\
             total_pieces=4\ncompleted_pieces=1,3\n"
        );
        tokio::fs::write(ResumeState::file_path(&dir, &info_hash), content)
            .await
            .unwrap();

        let loaded = ResumeState::load(&dir, &info_hash, 4)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            loaded.completed_pieces().collect::<Vec<usize>>(),
            vec![1, 3]
        );

        tokio::fs::remove_dir_all(&dir).await.unwrap();
    }
}
