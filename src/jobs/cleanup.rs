//!
//! # 清理模块
//! Best-effort removal of an artifact from every configured storage backend.
//! Nothing here returns an error: outcomes are logged and reported.
//!

use std::sync::Arc;

use log::{debug, trace};
use serde::Serialize;

use crate::jobs::storage::{DeleteOutcome, StorageRegistry};

#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "snake_case", tag = "status", content = "detail")]
pub enum CleanupResult {
    Deleted,
    Missing,
    Failed(String),
}

#[derive(Serialize, Debug, Clone)]
pub struct BackendOutcome {
    pub backend: String,
    pub result: CleanupResult,
}

#[derive(Serialize, Debug, Clone)]
pub struct CleanupReport {
    pub path: String,
    pub outcomes: Vec<BackendOutcome>,
}

impl CleanupReport {
    pub fn failures(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|outcome| matches!(outcome.result, CleanupResult::Failed(_)))
            .count()
    }

    pub fn deleted(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|outcome| outcome.result == CleanupResult::Deleted)
            .count()
    }
}

pub struct CleanupJob {
    registry: Arc<StorageRegistry>,
}

impl CleanupJob {
    pub fn new(registry: Arc<StorageRegistry>) -> Self {
        Self { registry }
    }

    /// Delete `path` from each backend in turn, the registry defaults when `backends` is `None`
    pub async fn run(&self, path: &str, backends: Option<&[String]>) -> CleanupReport {
        let names = backends.unwrap_or_else(|| self.registry.defaults());
        let mut outcomes = Vec::with_capacity(names.len());

        for name in names {
            let result = match self.registry.get(name) {
                Ok(backend) => match backend.delete(path).await {
                    Ok(DeleteOutcome::Deleted) => {
                        debug!("Deleted {} from {}", path, name);
                        CleanupResult::Deleted
                    }
                    Ok(DeleteOutcome::Missing) => {
                        trace!("{} not present on {}", path, name);
                        CleanupResult::Missing
                    }
                    Err(err) => {
                        debug!("Failed to delete {} from {}: {}", path, name, err);
                        CleanupResult::Failed(err.to_string())
                    }
                },
                Err(err) => {
                    debug!("Skipping {} on {}: {}", path, name, err);
                    CleanupResult::Failed(err.to_string())
                }
            };

            outcomes.push(BackendOutcome {
                result,
                backend: name.clone(),
            });
        }

        CleanupReport {
            path: path.to_string(),
            outcomes,
        }
    }
}

#[cfg(test)]
mod tests {
    use futures_util::future::BoxFuture;
    use futures_util::FutureExt;

    use super::*;
    use crate::jobs::storage::{StorageBackend, StorageError, LIBRARY_BACKEND, LOCAL_BACKEND};

    struct BrokenBackend;

    impl StorageBackend for BrokenBackend {
        fn name(&self) -> &str {
            "broken"
        }

        fn delete<'a>(&'a self, _path: &'a str) -> BoxFuture<'a, Result<DeleteOutcome, StorageError>> {
            async { Err(StorageError::IOError(std::io::Error::other("permission denied"))) }.boxed()
        }
    }

    #[tokio::test]
    async fn absent_path_succeeds_without_errors() {
        let work = tempfile::tempdir().unwrap();
        let library = tempfile::tempdir().unwrap();
        let registry = StorageRegistry::with_local_dirs(
            work.path().to_path_buf(),
            library.path().to_path_buf(),
        );
        let job = CleanupJob::new(Arc::new(registry));

        let report = job.run("nothing/here.mp4", None).await;

        assert_eq!(report.outcomes.len(), 2);
        assert_eq!(report.failures(), 0);
        assert!(report.outcomes.iter().all(|outcome| outcome.result == CleanupResult::Missing));
    }

    #[tokio::test]
    async fn failing_backend_does_not_stop_the_next() {
        let work = tempfile::tempdir().unwrap();
        let library = tempfile::tempdir().unwrap();
        std::fs::write(library.path().join("a.mp4"), b"abc").unwrap();

        let mut registry = StorageRegistry::with_local_dirs(
            work.path().to_path_buf(),
            library.path().to_path_buf(),
        );
        registry.register(Arc::new(BrokenBackend), false);
        let job = CleanupJob::new(Arc::new(registry));
        let order = vec!["broken".to_string(), "missing".to_string(), LIBRARY_BACKEND.to_string()];

        let report = job.run("a.mp4", Some(order.as_slice())).await;

        assert_eq!(report.failures(), 2);
        assert_eq!(report.deleted(), 1);
        assert_eq!(report.outcomes[2].backend, LIBRARY_BACKEND);
        assert!(!library.path().join("a.mp4").exists());
    }

    #[tokio::test]
    async fn deletes_from_every_default_backend() {
        let work = tempfile::tempdir().unwrap();
        let library = tempfile::tempdir().unwrap();
        std::fs::write(work.path().join("a.mp4"), b"abc").unwrap();
        std::fs::write(library.path().join("a.mp4"), b"abc").unwrap();
        let registry = StorageRegistry::with_local_dirs(
            work.path().to_path_buf(),
            library.path().to_path_buf(),
        );
        let job = CleanupJob::new(Arc::new(registry));

        let report = job.run("a.mp4", None).await;

        assert_eq!(report.deleted(), 2);
        assert_eq!(report.outcomes[0].backend, LOCAL_BACKEND);
    }
}
