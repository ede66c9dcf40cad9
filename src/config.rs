//! Configuration, layered from a file, the environment and defaults.
use std::{path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};

use crate::error::Error;

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct Config {
    /// Root folder to place the torrent files.
    pub download_dir: String,

    /// Where resume records live.
    pub resume_dir: String,

    /// Port advertised to trackers.
    pub local_peer_port: u16,

    /// Maximum number of peers per torrent.
    pub max_torrent_peers: u32,

    /// TCP connect timeout, in seconds.
    pub connect_timeout_secs: u64,

    /// A peer silent for longer than this is dropped, in seconds.
    pub read_timeout_secs: u64,

    /// Timeout of one tracker HTTP exchange, in seconds.
    pub tracker_timeout_secs: u64,
}

impl Config {
    /// Load the configuration. Environment variables take precedence over
    /// the configuration file, which is optional.
    pub fn load() -> Result<Self, Error> {
        let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_owned());

        let download_dir = std::env::var("XDG_DOWNLOAD_DIR")
            .unwrap_or(format!("{home}/Downloads"));

        // config.toml, the .toml part is omitted
        let config_file = std::env::var("XDG_CONFIG_HOME")
            .map(|v| format!("{v}/remora/config"))
            .unwrap_or(format!("{home}/.config/remora/config"));

        config::Config::builder()
            .add_source(config::File::with_name(&config_file).required(false))
            .add_source(config::Environment::default())
            .set_default("download_dir", download_dir)
            .unwrap()
            .set_default("resume_dir", "./.resume")
            .unwrap()
            .set_default("local_peer_port", 6881)
            .unwrap()
            .set_default("max_torrent_peers", 50)
            .unwrap()
            .set_default("connect_timeout_secs", 10)
            .unwrap()
            .set_default("read_timeout_secs", 30)
            .unwrap()
            .set_default("tracker_timeout_secs", 30)
            .unwrap()
            .build()?
            .try_deserialize::<Config>()
            .map_err(Error::ConfigFile)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }

    pub fn tracker_timeout(&self) -> Duration {
        Duration::from_secs(self.tracker_timeout_secs)
    }

    pub fn download_path(&self) -> PathBuf {
        PathBuf::from(&self.download_dir)
    }

    pub fn resume_path(&self) -> PathBuf {
        PathBuf::from(&self.resume_dir)
    }

    /// Defaults without touching the environment, for tests.
    pub fn test_default() -> Self {
        Self {
            download_dir: ".".to_owned(),
            resume_dir: "./.resume".to_owned(),
            local_peer_port: 6881,
            max_torrent_peers: 50,
            connect_timeout_secs: 10,
            read_timeout_secs: 30,
            tracker_timeout_secs: 30,
        }
    }

    /// Test defaults rooted in a scratch directory.
    pub fn test_in(dir: &std::path::Path) -> Self {
        Self {
            download_dir: dir.to_string_lossy().into_owned(),
            resume_dir: dir.join(".resume").to_string_lossy().into_owned(),
            ..Self::test_default()
        }
    }

    pub fn validate(&self) -> Result<(), Error> {
        if self.max_torrent_peers == 0 {
            return Err(Error::Config(
                "max_torrent_peers cannot be zero".to_owned(),
            ));
        }
        if self.read_timeout_secs == 0 || self.connect_timeout_secs == 0 {
            return Err(Error::Config(
                "timeouts cannot be zero".to_owned(),
            ));
        }
        Ok(())
    }
}
