//!
//! 配置模块
//!

use std::fs;
use std::num::NonZeroU64;
use std::path::{Path, PathBuf};
use std::time::Duration;
use serde::{Deserialize, Serialize};
use anyhow::{Context, Result};

const MAX_RETRY_BACKOFF: Duration = Duration::from_secs(30);
const DEFAULT_CHUNK_SIZE: NonZeroU64 = match NonZeroU64::new(1024 * 1024 * 4) {
    Some(size) => size,
    None => unreachable!(),
};

#[derive(Deserialize, Serialize, Debug, Clone)]
#[serde(default)]
pub struct Config {
    /// Worker pool size, shared by every job kind
    pub max_concurrent_jobs: usize,
    pub chunk_size: NonZeroU64,
    /// Chunk failures tolerated per transfer before it is marked failed
    pub max_retries: u32,
    pub retry_backoff_ms: u64,
    pub request_timeout_secs: u64,
    pub user_agent: String,
    /// Root of the `local` storage backend: part files and previews
    pub work_dir: PathBuf,
    /// Root of the `library` storage backend: assembled media
    pub library_dir: PathBuf,
    pub state_file: Option<PathBuf>,
    pub listen_addr: String,
    pub ffmpeg_bin: PathBuf,
    pub preview_max_width: u32,
    pub log_file: Option<PathBuf>,
}

impl Config {
    pub fn load_from_file(file_path: &Path) -> Result<Self> {
        let config_data = fs::read_to_string(file_path)
            .with_context(|| format!("Read config failed: {}", file_path.display()))?;
        let config: Config = serde_json::from_str(&config_data)
            .with_context(|| format!("Parse config failed: {}", file_path.display()))?;

        Ok(config)
    }

    /// Load the file if it exists, otherwise fall back to defaults
    pub fn load_or_default(file_path: &Path) -> Result<Self> {
        if file_path.exists() {
            Self::load_from_file(file_path)
        } else {
            Ok(Self::default())
        }
    }

    /// Delay before the `attempt`-th retry of a chunk, doubling each time
    pub fn retry_backoff(&self, attempt: u32) -> Duration {
        let factor = 2u64.saturating_pow(attempt.saturating_sub(1));
        Duration::from_millis(self.retry_backoff_ms.saturating_mul(factor)).min(MAX_RETRY_BACKOFF)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = dirs::data_local_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("atlas");
        let library_dir = dirs::download_dir().unwrap_or_else(|| data_dir.join("library"));

        Self {
            max_concurrent_jobs: 6,
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_retries: 3,
            retry_backoff_ms: 1000,
            request_timeout_secs: 60,
            user_agent: concat!("atlas-transfer/", env!("CARGO_PKG_VERSION")).to_string(),
            work_dir: data_dir.join("work"),
            library_dir,
            state_file: Some(data_dir.join("transfers.json")),
            listen_addr: "127.0.0.1:6060".to_string(),
            ffmpeg_bin: PathBuf::from("ffmpeg"),
            preview_max_width: 480,
            log_file: None,
        }
    }
}
