//!
//! # 媒体文件模块
//! The library's file records, as far as the transfer pipeline touches them
//!

use std::path::Path;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Debug)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Image,
    Video,
    Audio,
    Other,
}

const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "gif", "webp", "bmp", "avif", "tiff"];
const VIDEO_EXTENSIONS: &[&str] = &["mp4", "m4v", "mkv", "webm", "mov", "avi", "wmv", "flv"];
const AUDIO_EXTENSIONS: &[&str] = &["mp3", "flac", "wav", "ogg", "opus", "m4a", "aac"];

impl MediaKind {
    /// Classify by content type, falling back to the file extension
    pub fn detect(content_type: Option<&str>, path: &Path) -> Self {
        let by_type = content_type.and_then(|value| match value.split('/').next() {
            Some("image") => Some(MediaKind::Image),
            Some("video") => Some(MediaKind::Video),
            Some("audio") => Some(MediaKind::Audio),
            _ => None,
        });
        if let Some(kind) = by_type {
            return kind;
        }

        let extension = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| ext.to_ascii_lowercase())
            .unwrap_or_default();

        if IMAGE_EXTENSIONS.contains(&extension.as_str()) {
            MediaKind::Image
        } else if VIDEO_EXTENSIONS.contains(&extension.as_str()) {
            MediaKind::Video
        } else if AUDIO_EXTENSIONS.contains(&extension.as_str()) {
            MediaKind::Audio
        } else {
            MediaKind::Other
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct MediaFile {
    pub id: Uuid,
    /// Library-relative path
    pub path: String,
    pub kind: MediaKind,
    pub size: u64,
    /// Work-dir relative paths of generated assets
    pub preview_path: Option<String>,
    pub poster_path: Option<String>,
}

impl MediaFile {
    pub fn new(path: String, kind: MediaKind, size: u64) -> Self {
        Self {
            path,
            kind,
            size,
            id: Uuid::new_v4(),
            preview_path: None,
            poster_path: None,
        }
    }

    /// Whether every asset this kind of media gets has been generated
    pub fn has_preview_assets(&self) -> bool {
        match self.kind {
            MediaKind::Video => self.preview_path.is_some() && self.poster_path.is_some(),
            MediaKind::Image | MediaKind::Audio => self.preview_path.is_some(),
            MediaKind::Other => false,
        }
    }
}

pub trait FileRepository: Send + Sync + 'static {
    fn insert(&self, file: MediaFile);

    fn get(&self, id: Uuid) -> Option<MediaFile>;

    fn set_preview_assets(&self, id: Uuid, preview_path: Option<String>, poster_path: Option<String>) -> bool;

    fn remove(&self, id: Uuid) -> Option<MediaFile>;

    fn all(&self) -> Vec<MediaFile>;
}

#[derive(Default)]
pub struct MemoryFileRepository {
    files: DashMap<Uuid, MediaFile>,
}

impl MemoryFileRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_files(files: Vec<MediaFile>) -> Self {
        let repository = Self::new();
        for file in files {
            repository.insert(file);
        }

        repository
    }
}

impl FileRepository for MemoryFileRepository {
    fn insert(&self, file: MediaFile) {
        self.files.insert(file.id, file);
    }

    fn get(&self, id: Uuid) -> Option<MediaFile> {
        self.files.get(&id).map(|file| file.value().clone())
    }

    fn set_preview_assets(
        &self,
        id: Uuid,
        preview_path: Option<String>,
        poster_path: Option<String>,
    ) -> bool {
        match self.files.get_mut(&id) {
            Some(mut file) => {
                file.preview_path = preview_path;
                file.poster_path = poster_path;
                true
            }
            None => false,
        }
    }

    fn remove(&self, id: Uuid) -> Option<MediaFile> {
        self.files.remove(&id).map(|(_, file)| file)
    }

    fn all(&self) -> Vec<MediaFile> {
        self.files.iter().map(|file| file.value().clone()).collect()
    }
}
