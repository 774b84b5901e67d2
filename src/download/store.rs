//!
//! # 任务表模块
//! Every transfer lives behind its own mutex; a closure run under that lock is the
//! unit of atomicity for claims, progress and status changes
//!

use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::download::error::TransferError;
use crate::download::record::Transfer;

pub struct TransferEntry {
    pub transfer: Transfer,
    /// Wakes workers blocked on network reads when the transfer is paused or canceled
    pub stop_token: CancellationToken,
}

impl TransferEntry {
    /// Fire the current token and arm a fresh one for whatever runs next
    pub fn stop_workers(&mut self) {
        self.stop_token.cancel();
        self.stop_token = CancellationToken::new();
    }
}

pub type TransferHandle = Arc<Mutex<TransferEntry>>;

#[derive(Clone, Default)]
pub struct TransferStore {
    entries: Arc<DashMap<Uuid, TransferHandle>>,
}

impl TransferStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, transfer: Transfer) -> TransferHandle {
        let id = transfer.id;
        let handle = Arc::new(Mutex::new(TransferEntry {
            transfer,
            stop_token: CancellationToken::new(),
        }));
        self.entries.insert(id, handle.clone());

        handle
    }

    pub fn get(&self, id: Uuid) -> Result<TransferHandle, TransferError> {
        self.entries
            .get(&id)
            .map(|entry| entry.value().clone())
            .ok_or(TransferError::NotFound(id))
    }

    /// Run `f` as one read-modify-write step on the transfer
    pub fn with<R>(
        &self,
        id: Uuid,
        f: impl FnOnce(&mut TransferEntry) -> Result<R, TransferError>,
    ) -> Result<R, TransferError> {
        let handle = self.get(id)?;
        let mut entry = handle.lock();

        f(&mut entry)
    }

    pub fn snapshot(&self, id: Uuid) -> Result<Transfer, TransferError> {
        self.with(id, |entry| Ok(entry.transfer.clone()))
    }

    /// All transfers, oldest first
    pub fn list(&self) -> Vec<Transfer> {
        // collect handles first so no shard lock is held while locking an entry
        let handles: Vec<TransferHandle> = self.entries.iter().map(|entry| entry.value().clone()).collect();
        let mut transfers: Vec<Transfer> = handles
            .iter()
            .map(|handle| handle.lock().transfer.clone())
            .collect();
        transfers.sort_by_key(|transfer| transfer.created_at);

        transfers
    }

    pub fn remove(&self, id: Uuid) -> Option<Transfer> {
        self.entries
            .remove(&id)
            .map(|(_, handle)| handle.lock().transfer.clone())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use url::Url;

    use super::*;
    use crate::download::status::TransferStatus;

    fn transfer() -> Transfer {
        Transfer::new(Url::parse("http://localhost/cool.mp4").unwrap(), "cool.mp4".into())
    }

    #[test]
    fn should_mutate_under_lock() {
        let store = TransferStore::new();
        let id = store.insert(transfer()).lock().transfer.id;

        store.with(id, |entry| entry.transfer.transition(TransferStatus::Queued)).unwrap();

        assert_eq!(store.snapshot(id).unwrap().status, TransferStatus::Queued);
    }

    #[test]
    fn unknown_transfer_is_not_found() {
        let store = TransferStore::new();
        let id = Uuid::new_v4();

        assert!(matches!(store.snapshot(id), Err(TransferError::NotFound(missing)) if missing == id));
    }

    #[test]
    fn stop_workers_rearms_token() {
        let store = TransferStore::new();
        let handle = store.insert(transfer());
        let old = handle.lock().stop_token.clone();

        handle.lock().stop_workers();

        assert!(old.is_cancelled());
        assert!(!handle.lock().stop_token.is_cancelled());
    }

    #[test]
    fn list_is_ordered_by_creation() {
        let store = TransferStore::new();
        let first = store.insert(transfer()).lock().transfer.id;
        std::thread::sleep(std::time::Duration::from_millis(2));
        let second = store.insert(transfer()).lock().transfer.id;

        let ids: Vec<Uuid> = store.list().iter().map(|transfer| transfer.id).collect();
        assert_eq!(ids, vec![first, second]);
        assert_eq!(store.remove(first).map(|t| t.id), Some(first));
        assert_eq!(store.len(), 1);
    }
}
