//!
//! # 传输管理模块
//! The control surface over the transfer table: enqueue, query, pause, resume, cancel
//!

use std::path::{Component, Path};
use std::sync::Arc;
use std::time::Duration;

use futures_util::Stream;
use log::info;
use url::Url;
use uuid::Uuid;

use crate::download::chunk_manager::settle_chunks;
use crate::download::error::TransferError;
use crate::download::pipeline::Pipeline;
use crate::download::record::Transfer;
use crate::download::scheduler::Job;
use crate::download::status::TransferStatus;
use crate::jobs::cleanup::CleanupReport;
use crate::jobs::preview::{PreviewError, PreviewOutcome};
use crate::media::MediaFile;

const WATCH_INTERVAL: Duration = Duration::from_millis(200);

#[derive(Clone)]
pub struct TransferManager {
    pipeline: Arc<Pipeline>,
}

impl TransferManager {
    pub fn new(pipeline: Arc<Pipeline>) -> Self {
        Self { pipeline }
    }

    /// Register a transfer of `url` into the library at `destination` and queue it
    pub fn enqueue(&self, url: &str, destination: &str) -> Result<Uuid, TransferError> {
        let url = Url::parse(url).map_err(|err| TransferError::InvalidUrl(format!("{url}: {err}")))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(TransferError::InvalidUrl(format!("unsupported scheme: {}", url.scheme())));
        }

        let destination = normalize_destination(destination)?;
        let taken = self.pipeline.store.list().into_iter().any(|transfer| {
            transfer.destination == destination
                && !matches!(transfer.status, TransferStatus::Failed | TransferStatus::Canceled)
        });
        if taken || self.pipeline.config.library_dir.join(&destination).exists() {
            return Err(TransferError::DestinationExists(destination));
        }

        let mut transfer = Transfer::new(url, destination);
        transfer.transition(TransferStatus::Queued)?;
        let id = transfer.id;
        info!("Queued transfer {} of {} to {}", id, transfer.url, transfer.destination);

        self.pipeline.store.insert(transfer);
        self.pipeline.dispatch(Job::Prepare(id));
        self.pipeline.persist();

        Ok(id)
    }

    pub fn status(&self, id: Uuid) -> Result<Transfer, TransferError> {
        self.pipeline.store.snapshot(id)
    }

    pub fn list(&self) -> Vec<Transfer> {
        self.pipeline.store.list()
    }

    pub fn pause(&self, id: Uuid) -> Result<Transfer, TransferError> {
        let transfer = self.pipeline.store.with(id, |entry| {
            entry.transfer.transition(TransferStatus::Paused)?;
            entry.stop_workers();

            Ok(entry.transfer.clone())
        })?;
        info!("Paused transfer {} in {:?}", id, transfer.paused_from);
        self.pipeline.persist();

        Ok(transfer)
    }

    /// Back into the state the transfer was paused from, then re-dispatch its work
    pub fn resume(&self, id: Uuid) -> Result<Transfer, TransferError> {
        let transfer = self.pipeline.store.with(id, |entry| {
            let transfer = &mut entry.transfer;
            let target = match (transfer.status, transfer.paused_from) {
                (TransferStatus::Paused, Some(target)) => target,
                (from, _) => {
                    return Err(TransferError::InvalidTransition { from, to: TransferStatus::Downloading });
                }
            };
            transfer.transition(target)?;

            Ok(transfer.clone())
        })?;

        let jobs = self.pipeline.jobs_for(id)?;
        info!("Resumed transfer {} into {} with {} job(s)", id, transfer.status, jobs.len());
        for job in jobs {
            self.pipeline.dispatch(job);
        }
        self.pipeline.persist();

        Ok(transfer)
    }

    pub async fn cancel(&self, id: Uuid) -> Result<Transfer, TransferError> {
        let transfer = self.pipeline.store.with(id, |entry| {
            entry.transfer.transition(TransferStatus::Canceled)?;
            settle_chunks(&mut entry.transfer);
            entry.stop_workers();

            Ok(entry.transfer.clone())
        })?;
        info!("Canceled transfer {}", id);

        self.pipeline.cleanup_transfer(id).await;
        self.pipeline.persist();

        Ok(transfer)
    }

    /// Drop finished transfers from the table, returning how many went
    pub fn prune_finished(&self) -> usize {
        let finished: Vec<Uuid> = self
            .list()
            .into_iter()
            .filter(|transfer| transfer.status.is_terminal())
            .map(|transfer| transfer.id)
            .collect();
        for id in &finished {
            self.pipeline.store.remove(*id);
        }
        if !finished.is_empty() {
            self.pipeline.persist();
        }

        finished.len()
    }

    pub async fn generate_preview(&self, file_id: Uuid) -> Result<PreviewOutcome, PreviewError> {
        let outcome = self.pipeline.preview.run(file_id).await;
        self.pipeline.persist();

        outcome
    }

    pub fn file(&self, file_id: Uuid) -> Option<MediaFile> {
        self.pipeline.files.get(file_id)
    }

    pub async fn cleanup(&self, path: &str, backends: Option<&[String]>) -> CleanupReport {
        self.pipeline.cleanup.run(path, backends).await
    }

    /// Snapshots of one transfer whenever its progress or status moves, ending at a terminal state
    pub fn watch(&self, id: Uuid) -> impl Stream<Item = Transfer> + 'static {
        let store = self.pipeline.store.clone();

        async_stream::stream! {
            let mut last: Option<(TransferStatus, u64)> = None;
            let mut interval = tokio::time::interval(WATCH_INTERVAL);

            loop {
                interval.tick().await;
                let Ok(transfer) = store.snapshot(id) else {
                    break;
                };

                let current = (transfer.status, transfer.bytes_transferred);
                let terminal = transfer.status.is_terminal();
                if last != Some(current) {
                    last = Some(current);
                    yield transfer;
                }
                if terminal {
                    break;
                }
            }
        }
    }
}

/// Library-relative, normal components only
fn normalize_destination(destination: &str) -> Result<String, TransferError> {
    let path = Path::new(destination.trim());
    let mut parts = Vec::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => parts.push(part.to_string_lossy().into_owned()),
            Component::CurDir => {}
            _ => return Err(TransferError::InvalidDestination(destination.to_string())),
        }
    }
    if parts.is_empty() {
        return Err(TransferError::InvalidDestination(destination.to_string()));
    }

    Ok(parts.join("/"))
}
