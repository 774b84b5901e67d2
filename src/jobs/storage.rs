//!
//! # 存储后端模块
//! Named storage roots that artifacts can be deleted from
//!

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use thiserror::Error;
use tokio::fs;
use tokio::io;

pub const LOCAL_BACKEND: &str = "local";
pub const LIBRARY_BACKEND: &str = "library";

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Path escapes the backend root: {0}")]
    PathEscapesRoot(String),

    #[error("Unknown storage backend: {0}")]
    UnknownBackend(String),

    #[error("IOError: {:?}", .0)]
    IOError(#[from] io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    Deleted,
    Missing,
}

pub trait StorageBackend: Send + Sync + 'static {
    fn name(&self) -> &str;

    /// Delete a file or directory tree at a backend-relative path
    fn delete<'a>(&'a self, path: &'a str) -> BoxFuture<'a, Result<DeleteOutcome, StorageError>>;
}

pub struct LocalDiskBackend {
    name: String,
    root: PathBuf,
}

impl LocalDiskBackend {
    pub fn new(name: &str, root: PathBuf) -> Self {
        Self {
            name: name.to_string(),
            root,
        }
    }

    pub fn resolve(&self, path: &str) -> Result<PathBuf, StorageError> {
        let relative = Path::new(path);
        let escapes = relative
            .components()
            .any(|component| !matches!(component, Component::Normal(_) | Component::CurDir));
        if escapes || path.is_empty() {
            return Err(StorageError::PathEscapesRoot(path.to_string()));
        }

        Ok(self.root.join(relative))
    }

    async fn remove(&self, path: &str) -> Result<DeleteOutcome, StorageError> {
        let target = self.resolve(path)?;
        let metadata = match fs::symlink_metadata(&target).await {
            Ok(metadata) => metadata,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(DeleteOutcome::Missing),
            Err(err) => return Err(err.into()),
        };

        let result = if metadata.is_dir() {
            fs::remove_dir_all(&target).await
        } else {
            fs::remove_file(&target).await
        };

        match result {
            Ok(()) => Ok(DeleteOutcome::Deleted),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(DeleteOutcome::Missing),
            Err(err) => Err(err.into()),
        }
    }
}

impl StorageBackend for LocalDiskBackend {
    fn name(&self) -> &str {
        &self.name
    }

    fn delete<'a>(&'a self, path: &'a str) -> BoxFuture<'a, Result<DeleteOutcome, StorageError>> {
        self.remove(path).boxed()
    }
}

/// Backends by name plus the order used when a caller names none
#[derive(Default)]
pub struct StorageRegistry {
    backends: HashMap<String, Arc<dyn StorageBackend>>,
    defaults: Vec<String>,
}

impl StorageRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// `local` for the work directory, then `library` for assembled media
    pub fn with_local_dirs(work_dir: PathBuf, library_dir: PathBuf) -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(LocalDiskBackend::new(LOCAL_BACKEND, work_dir)), true);
        registry.register(Arc::new(LocalDiskBackend::new(LIBRARY_BACKEND, library_dir)), true);

        registry
    }

    pub fn register(&mut self, backend: Arc<dyn StorageBackend>, default: bool) {
        let name = backend.name().to_string();
        if default && !self.defaults.contains(&name) {
            self.defaults.push(name.clone());
        }
        self.backends.insert(name, backend);
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn StorageBackend>, StorageError> {
        self.backends
            .get(name)
            .cloned()
            .ok_or_else(|| StorageError::UnknownBackend(name.to_string()))
    }

    pub fn defaults(&self) -> &[String] {
        &self.defaults
    }
}
