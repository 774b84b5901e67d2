//!
//! # 流水线模块
//! What each queued job does to its transfer. Every stage re-checks the transfer status
//! under the lock before acting, so a job made stale by pause or cancel is a no-op.
//!

use std::sync::Arc;

use async_channel::Sender;
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use tokio::select;
use uuid::Uuid;

use crate::download::assembler::Assembler;
use crate::download::chunk_item::{ChunkEnd, ChunkItem};
use crate::download::chunk_manager::{fail_transfer, ChunkManager, FailureOutcome};
use crate::download::config::Config;
use crate::download::error::TransferError;
use crate::download::persistence::PersistenceState;
use crate::download::record::Transfer;
use crate::download::scheduler::Job;
use crate::download::source::{RemoteMetadata, RemoteSource};
use crate::download::status::{ChunkStatus, TransferStatus};
use crate::download::store::TransferStore;
use crate::jobs::cleanup::CleanupJob;
use crate::jobs::preview::PreviewAssetJob;
use crate::jobs::storage::{LIBRARY_BACKEND, LOCAL_BACKEND};
use crate::media::FileRepository;

pub struct Pipeline {
    pub(crate) config: Arc<Config>,
    pub(crate) store: TransferStore,
    pub(crate) chunk_manager: Arc<ChunkManager>,
    pub(crate) source: Arc<dyn RemoteSource>,
    pub(crate) chunk_item: ChunkItem,
    pub(crate) assembler: Assembler,
    pub(crate) preview: PreviewAssetJob,
    pub(crate) cleanup: CleanupJob,
    pub(crate) files: Arc<dyn FileRepository>,
    pub(crate) job_sender: Sender<Job>,
    save_lock: Mutex<()>,
}

impl Pipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Arc<Config>,
        store: TransferStore,
        chunk_manager: Arc<ChunkManager>,
        source: Arc<dyn RemoteSource>,
        preview: PreviewAssetJob,
        cleanup: CleanupJob,
        files: Arc<dyn FileRepository>,
        job_sender: Sender<Job>,
    ) -> Self {
        let chunk_item = ChunkItem::new(source.clone(), chunk_manager.clone(), config.work_dir.clone());
        let assembler = Assembler::new(config.work_dir.clone(), config.library_dir.clone());

        Self {
            config,
            store,
            chunk_manager,
            source,
            chunk_item,
            assembler,
            preview,
            cleanup,
            files,
            job_sender,
            save_lock: Mutex::new(()),
        }
    }

    pub async fn handle(&self, job: Job) {
        let result = match job {
            Job::Prepare(id) => self.prepare(id).await,
            Job::Chunk { transfer, index } => self.download_chunk(transfer, index).await,
            Job::Assemble(id) => self.assemble(id).await,
            Job::Preview(id) => self.preview(id).await,
        };

        match result {
            Ok(()) => {}
            // pause or cancel got there first
            Err(TransferError::InvalidTransition { from, to }) => {
                debug!("{:?} superseded: {} -> {}", job, from, to);
            }
            Err(TransferError::NotFound(id)) => debug!("{:?} dropped, transfer {} is gone", job, id),
            Err(err) => error!("{:?} failed: {}", job, err),
        }

        self.persist();
    }

    pub fn dispatch(&self, job: Job) {
        if self.job_sender.try_send(job).is_err() {
            warn!("Job queue closed, dropping {:?}", job);
        }
    }

    /// Jobs that carry a transfer forward from its current state
    pub fn jobs_for(&self, id: Uuid) -> Result<Vec<Job>, TransferError> {
        let transfer = self.store.snapshot(id)?;

        let jobs = match transfer.status {
            TransferStatus::Queued | TransferStatus::Preparing => vec![Job::Prepare(id)],
            TransferStatus::Downloading if self.chunk_manager.try_begin_assembly(id)? => {
                vec![Job::Assemble(id)]
            }
            TransferStatus::Downloading => transfer
                .chunks
                .iter()
                .filter(|chunk| chunk.status == ChunkStatus::Pending)
                .map(|chunk| Job::Chunk { transfer: id, index: chunk.index })
                .collect(),
            TransferStatus::Assembling => vec![Job::Assemble(id)],
            TransferStatus::Previewing => vec![Job::Preview(id)],
            _ => Vec::new(),
        };

        Ok(jobs)
    }

    async fn prepare(&self, id: Uuid) -> Result<(), TransferError> {
        let claimed = self.store.with(id, |entry| {
            match entry.transfer.status {
                TransferStatus::Queued => entry.transfer.transition(TransferStatus::Preparing)?,
                // resumed while preparing, or restored after a restart
                TransferStatus::Preparing => {}
                _ => return Ok(None),
            }

            Ok(Some((entry.transfer.url.clone(), entry.stop_token.clone())))
        })?;
        let Some((url, stop_token)) = claimed else {
            return Ok(());
        };

        let metadata = match self.probe(id, &url, &stop_token).await? {
            Some(metadata) => metadata,
            None => return Ok(()),
        };

        let chunks = self.chunk_manager.start(id, &metadata)?;
        if chunks.is_empty() {
            if self.chunk_manager.try_begin_assembly(id)? {
                self.dispatch(Job::Assemble(id));
            }
            return Ok(());
        }

        for chunk in chunks {
            self.dispatch(Job::Chunk { transfer: id, index: chunk.index });
        }

        Ok(())
    }

    /// Probe with retries. `None` when the transfer was stopped or failed meanwhile.
    async fn probe(
        &self,
        id: Uuid,
        url: &url::Url,
        stop_token: &tokio_util::sync::CancellationToken,
    ) -> Result<Option<RemoteMetadata>, TransferError> {
        loop {
            let probe = select! {
                probe = self.source.probe(url) => probe,
                _ = stop_token.cancelled() => {
                    debug!("Probe of {} interrupted", id);
                    return Ok(None);
                }
            };

            let err = match probe {
                Ok(metadata) => return Ok(Some(metadata)),
                Err(err) => err,
            };

            if !err.is_retryable() {
                self.fail(id, &err).await;
                return Ok(None);
            }

            let max_retries = self.config.max_retries;
            let attempt = self.store.with(id, |entry| {
                let transfer = &mut entry.transfer;
                transfer.retry_count += 1;
                if transfer.retry_count > max_retries {
                    return Ok(None);
                }
                Ok(Some(transfer.retry_count))
            })?;

            let Some(attempt) = attempt else {
                self.fail(id, &err).await;
                return Ok(None);
            };

            warn!("Probe of {} failed, retry {}/{}: {}", id, attempt, max_retries, err);
            select! {
                _ = tokio::time::sleep(self.config.retry_backoff(attempt)) => {}
                _ = stop_token.cancelled() => return Ok(None),
            }
        }
    }

    async fn download_chunk(&self, id: Uuid, index: usize) -> Result<(), TransferError> {
        let Some(claim) = self.chunk_manager.claim(id, index)? else {
            debug!("Chunk {} of {} is not claimable", index, id);
            return Ok(());
        };
        let stop_token = claim.stop_token.clone();

        let err = match self.chunk_item.download(claim).await {
            Ok(ChunkEnd::Completed { ready_to_assemble }) => {
                if ready_to_assemble {
                    self.dispatch(Job::Assemble(id));
                }
                return Ok(());
            }
            Ok(ChunkEnd::Stopped(cause)) => {
                debug!("Chunk {} of {} stopped: {:?}", index, id, cause);
                return Ok(());
            }
            Ok(ChunkEnd::Requeue) => {
                self.dispatch(Job::Chunk { transfer: id, index });
                return Ok(());
            }
            Err(err) => err,
        };

        match self.chunk_manager.fail(id, index, &err)? {
            FailureOutcome::Retry { attempt } => {
                select! {
                    _ = tokio::time::sleep(self.config.retry_backoff(attempt)) => {}
                    _ = stop_token.cancelled() => {}
                }
                if self.chunk_manager.requeue(id, index)? {
                    self.dispatch(Job::Chunk { transfer: id, index });
                }
            }
            FailureOutcome::TransferFailed => {
                error!("Transfer {} failed on chunk {}: {}", id, index, err);
                self.cleanup_transfer(id).await;
            }
            FailureOutcome::Interrupted(cause) => {
                debug!("Chunk {} of {} error ignored, transfer {:?}: {}", index, id, cause, err);
                // this worker may have created its part file after the transfer was cleaned up
                self.cleanup_transfer(id).await;
            }
        }

        Ok(())
    }

    async fn assemble(&self, id: Uuid) -> Result<(), TransferError> {
        let transfer = self.store.snapshot(id)?;
        if transfer.status != TransferStatus::Assembling {
            return Ok(());
        }

        let file_id = match self.assembled_file(&transfer) {
            Some(file_id) => {
                debug!("Transfer {} was assembled before, reusing file {}", id, file_id);
                file_id
            }
            None => match self.assembler.assemble(&transfer).await {
                Ok(_) => {
                    let size = transfer.total_size.unwrap_or(transfer.bytes_transferred);
                    self.preview
                        .register(transfer.destination.clone(), transfer.content_type.as_deref(), size)
                        .id
                }
                Err(err) => {
                    error!("Assembly of {} failed: {}", id, err);
                    self.fail(id, &err).await;
                    return Ok(());
                }
            },
        };

        let next = self.store.with(id, |entry| {
            let transfer = &mut entry.transfer;
            transfer.file_id = Some(file_id);
            if transfer.status != TransferStatus::Assembling {
                return Ok(transfer.status);
            }
            transfer.transition(TransferStatus::Previewing)?;

            Ok(transfer.status)
        })?;

        match next {
            TransferStatus::Previewing => self.dispatch(Job::Preview(id)),
            // canceled while the merge ran, the output it left behind is not wanted
            TransferStatus::Canceled | TransferStatus::Failed => self.cleanup_transfer(id).await,
            _ => {}
        }

        Ok(())
    }

    /// The library file of a transfer whose merge already finished
    fn assembled_file(&self, transfer: &Transfer) -> Option<Uuid> {
        let file_id = transfer.file_id?;
        self.files.get(file_id)?;

        self.assembler.destination_path(transfer).exists().then_some(file_id)
    }

    async fn preview(&self, id: Uuid) -> Result<(), TransferError> {
        let transfer = self.store.snapshot(id)?;
        if transfer.status != TransferStatus::Previewing {
            return Ok(());
        }

        match transfer.file_id {
            Some(file_id) => match self.preview.run(file_id).await {
                Ok(outcome) => debug!("Preview of {} for {}: {:?}", file_id, id, outcome),
                Err(err) => warn!("Preview generation for {} failed: {}", id, err),
            },
            None => warn!("Transfer {} reached preview without a file", id),
        }

        let completed = self.store.with(id, |entry| {
            if entry.transfer.status != TransferStatus::Previewing {
                return Ok(false);
            }
            entry.transfer.transition(TransferStatus::Completed)?;

            Ok(true)
        })?;
        if completed {
            info!("Transfer {} completed: {}", id, transfer.destination);
        }

        Ok(())
    }

    /// Record a terminal error on the transfer and remove what it left on disk
    async fn fail(&self, id: Uuid, err: &TransferError) {
        let failed = self
            .store
            .with(id, |entry| fail_transfer(entry, err.to_string()));

        match failed {
            Ok(()) => {
                error!("Transfer {} failed: {}", id, err);
                self.cleanup_transfer(id).await;
            }
            Err(other) => debug!("Transfer {} not failed ({}): {}", id, other, err),
        }
    }

    /// Remove part files, staged and assembled output, and the file record if any
    pub async fn cleanup_transfer(&self, id: Uuid) {
        let transfer = match self.store.snapshot(id) {
            Ok(transfer) => transfer,
            Err(err) => {
                debug!("Nothing to clean up for {}: {}", id, err);
                return;
            }
        };

        // work-dir artifacts never touch the library and vice versa
        let mut work_paths = vec![transfer.parts_dir()];
        let library_paths = [
            Assembler::staging_name(&transfer.destination),
            transfer.destination.clone(),
        ];
        if let Some(file) = transfer.file_id.and_then(|file_id| self.files.remove(file_id)) {
            work_paths.extend(file.preview_path);
            work_paths.extend(file.poster_path);
        }

        let local = [LOCAL_BACKEND.to_string()];
        let library = [LIBRARY_BACKEND.to_string()];
        let scoped = work_paths
            .iter()
            .map(|path| (path, &local))
            .chain(library_paths.iter().map(|path| (path, &library)));
        for (path, backends) in scoped {
            let report = self.cleanup.run(path, Some(&backends[..])).await;
            debug!(
                "Cleanup of {} for {}: {} deleted, {} failed",
                report.path,
                id,
                report.deleted(),
                report.failures()
            );
        }
    }

    /// Snapshot every transfer and file to the state file, if one is configured
    pub fn persist(&self) {
        let Some(state_file) = self.config.state_file.as_deref() else {
            return;
        };

        let _guard = self.save_lock.lock();
        let state = PersistenceState {
            transfers: self.store.list(),
            files: self.files.all(),
        };
        if let Err(err) = state.save_to_file(state_file) {
            warn!("Failed to save state to {}: {:#}", state_file.display(), err);
        }
    }
}
