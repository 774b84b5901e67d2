//!
//! # 持久化模块
//! 用于将下载信息持久化到硬盘，用于断点恢复
//!

use std::fs;
use std::path::Path;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::download::record::Transfer;
use crate::media::MediaFile;

#[derive(Serialize, Deserialize, Default)]
pub struct PersistenceState {
    pub transfers: Vec<Transfer>,
    #[serde(default)]
    pub files: Vec<MediaFile>,
}

impl PersistenceState {
    pub fn load_from_file(file_path: &Path) -> Result<Self> {
        if file_path.exists() {
            let data = fs::read_to_string(file_path)
                .with_context(|| format!("Read state failed: {}", file_path.display()))?;
            let state: PersistenceState = serde_json::from_str(&data)
                .with_context(|| format!("Parse state failed: {}", file_path.display()))?;

            Ok(state)
        } else {
            Ok(PersistenceState::default())
        }
    }

    /// Write through a sibling temp file so a crash never leaves half a state file
    pub fn save_to_file(&self, file_path: &Path) -> Result<()> {
        if let Some(parent) = file_path.parent() {
            fs::create_dir_all(parent)?;
        }

        let data = serde_json::to_string_pretty(self)?;
        let temp_path = file_path.with_extension("json.tmp");
        fs::write(&temp_path, data)?;
        fs::rename(&temp_path, file_path)?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use url::Url;

    use super::*;
    use crate::download::status::TransferStatus;
    use crate::media::MediaKind;

    #[test]
    fn should_restore_saved_state() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state/transfers.json");
        let mut transfer = Transfer::new(Url::parse("http://localhost/a.mp4").unwrap(), "a.mp4".into());
        transfer.status = TransferStatus::Paused;
        transfer.paused_from = Some(TransferStatus::Downloading);
        let file = MediaFile::new("b.png".into(), MediaKind::Image, 3);

        PersistenceState { transfers: vec![transfer.clone()], files: vec![file.clone()] }
            .save_to_file(&path)
            .unwrap();
        let state = PersistenceState::load_from_file(&path).unwrap();

        assert_eq!(state.transfers[0].id, transfer.id);
        assert_eq!(state.transfers[0].paused_from, Some(TransferStatus::Downloading));
        assert_eq!(state.files[0].id, file.id);
    }

    #[test]
    fn missing_state_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let state = PersistenceState::load_from_file(&dir.path().join("none.json")).unwrap();

        assert!(state.transfers.is_empty());
    }
}
