use std::sync::Arc;
use anyhow::Result;
use async_channel::unbounded;
use log::info;
use tokio::sync::Semaphore;

use crate::download::chunk_manager::ChunkManager;
use crate::download::config::Config;
use crate::download::manager::TransferManager;
use crate::download::persistence::PersistenceState;
use crate::download::pipeline::Pipeline;
use crate::download::record::Transfer;
use crate::download::scheduler::Scheduler;
use crate::download::source::RemoteSource;
use crate::download::status::{ChunkStatus, TransferStatus};
use crate::download::store::TransferStore;
use crate::jobs::cleanup::CleanupJob;
use crate::jobs::preview::{PreviewAssetJob, PreviewRenderer};
use crate::jobs::storage::StorageRegistry;
use crate::media::MemoryFileRepository;

pub mod assembler;
pub mod chunk_item;
pub mod chunk_manager;
pub mod chunk_range;
pub mod config;
pub mod error;
pub mod logger;
pub mod manager;
pub mod persistence;
pub mod pipeline;
pub mod record;
pub mod scheduler;
pub mod source;
pub mod status;
pub mod store;
pub mod util;

/// Wire the manager and its scheduler together, restoring saved transfers if the
/// config names a state file. Interrupted work is queued again before this returns.
pub fn build_manager(
    config: Config,
    source: Arc<dyn RemoteSource>,
    renderer: Arc<dyn PreviewRenderer>,
) -> Result<(TransferManager, Scheduler)> {
    let state = match &config.state_file {
        Some(state_file) => PersistenceState::load_from_file(state_file)?,
        None => PersistenceState::default(),
    };

    let config = Arc::new(config);
    let store = TransferStore::new();
    let files = Arc::new(MemoryFileRepository::with_files(state.files));
    let (job_sender, job_receiver) = unbounded();
    let semaphore = Arc::new(Semaphore::new(config.max_concurrent_jobs.max(1)));

    let chunk_manager = Arc::new(ChunkManager::new(store.clone(), config.chunk_size, config.max_retries));
    let preview = PreviewAssetJob::new(
        files.clone(),
        renderer,
        config.library_dir.clone(),
        config.work_dir.clone(),
        config.preview_max_width,
    );
    let registry = StorageRegistry::with_local_dirs(config.work_dir.clone(), config.library_dir.clone());
    let cleanup = CleanupJob::new(Arc::new(registry));

    let pipeline = Arc::new(Pipeline::new(
        config,
        store.clone(),
        chunk_manager,
        source,
        preview,
        cleanup,
        files,
        job_sender,
    ));

    let mut restored = Vec::with_capacity(state.transfers.len());
    for mut transfer in state.transfers {
        restore(&mut transfer)?;
        restored.push((transfer.id, transfer.status));
        store.insert(transfer);
    }
    for (id, status) in &restored {
        if status.is_terminal() || *status == TransferStatus::Paused {
            continue;
        }
        for job in pipeline.jobs_for(*id)? {
            pipeline.dispatch(job);
        }
    }
    if !restored.is_empty() {
        info!("Restored {} transfer(s)", restored.len());
    }

    let scheduler = Scheduler::new(pipeline.clone(), semaphore, job_receiver);

    Ok((TransferManager::new(pipeline), scheduler))
}

/// Nothing was running when the state was loaded: in-flight chunks go back in line
fn restore(transfer: &mut Transfer) -> Result<()> {
    for chunk in transfer.chunks.iter_mut() {
        if chunk.status == ChunkStatus::Downloading {
            chunk.transition(ChunkStatus::Pending)?;
        }
    }
    if transfer.status == TransferStatus::Pending {
        transfer.transition(TransferStatus::Queued)?;
    }
    transfer.refresh_bytes_transferred();

    Ok(())
}

#[cfg(test)]
mod tests {
    use url::Url;

    use super::*;
    use crate::download::chunk_range::ChunkRange;
    use crate::download::record::Chunk;

    #[test]
    fn restore_returns_in_flight_chunks() {
        let mut transfer = Transfer::new(Url::parse("http://localhost/a.bin").unwrap(), "a.bin".into());
        let mut chunk = Chunk::new(transfer.id, 0, Some(ChunkRange::new(0, 99)));
        chunk.status = ChunkStatus::Downloading;
        chunk.bytes_downloaded = 40;
        transfer.chunks.push(chunk);

        restore(&mut transfer).unwrap();

        assert_eq!(transfer.status, TransferStatus::Queued);
        assert_eq!(transfer.chunks[0].status, ChunkStatus::Pending);
        assert_eq!(transfer.bytes_transferred, 40);
    }
}
