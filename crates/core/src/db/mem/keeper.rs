use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::db::backend::WorkerKeeper;
use crate::error::DbError;
use crate::snowflake::{MAX_WORKER_ID, now_ms};

/// Worker-id lease TTL; a crashed worker's id frees up after this.
const LEASE_TTL_MS: i64 = 60_000;

#[derive(Clone)]
struct Lease {
    node_id: String,
    expires_ms: i64,
}

#[derive(Default)]
pub(super) struct KeeperShared {
    leases: Mutex<HashMap<u32, Lease>>,
    /// node id → last persisted generator timestamp.
    last_ts: Mutex<HashMap<String, i64>>,
}

/// Lease keeper of the embedded engine.
///
/// The node id combines the process id with the worker's start ordinal, so a
/// restarted worker with the same ordinal re-acquires its previous id before
/// the old lease even expires.
pub struct MemWorkerKeeper {
    shared: std::sync::Arc<KeeperShared>,
    node_id: String,
    worker_id: Mutex<Option<u32>>,
}

impl MemWorkerKeeper {
    pub(super) fn new(shared: std::sync::Arc<KeeperShared>, process_ordinal: u32) -> Self {
        MemWorkerKeeper {
            shared,
            node_id: format!("{}:{}", std::process::id(), process_ordinal),
            worker_id: Mutex::new(None),
        }
    }
}

#[async_trait]
impl WorkerKeeper for MemWorkerKeeper {
    fn acquire(&self) -> Result<u32, DbError> {
        let now = now_ms();
        let mut leases = self.shared.leases.lock();

        // Reclaim our own previous id first (fast container restart).
        let own = leases
            .iter()
            .find(|(_, l)| l.node_id == self.node_id)
            .map(|(id, _)| *id);
        let id = own.or_else(|| {
            (0..=MAX_WORKER_ID).find(|id| match leases.get(id) {
                None => true,
                Some(l) => l.expires_ms < now,
            })
        });
        let Some(id) = id else {
            return Err(DbError::WorkerIdsExhausted(MAX_WORKER_ID + 1));
        };
        if own.is_some() {
            log::info!("[snowflake] reusing worker id {id} for node {}", self.node_id);
        } else {
            log::info!("[snowflake] acquired worker id {id} for node {}", self.node_id);
        }
        leases.insert(
            id,
            Lease {
                node_id: self.node_id.clone(),
                expires_ms: now + LEASE_TTL_MS,
            },
        );
        *self.worker_id.lock() = Some(id);
        Ok(id)
    }

    fn release(&self) {
        let Some(id) = self.worker_id.lock().take() else {
            return;
        };
        let mut leases = self.shared.leases.lock();
        if leases.get(&id).map(|l| l.node_id == self.node_id) == Some(true) {
            leases.remove(&id);
            log::info!("[snowflake] released worker id {id}");
        }
    }

    fn initial_timestamp(&self) -> i64 {
        let persisted = self
            .shared
            .last_ts
            .lock()
            .get(&self.node_id)
            .copied()
            .unwrap_or(0);
        persisted.max(now_ms())
    }

    async fn keep_alive(&self, last_timestamp: i64) -> Result<(), DbError> {
        let id = (*self.worker_id.lock()).ok_or(DbError::WorkerLeaseLost)?;
        {
            let mut leases = self.shared.leases.lock();
            match leases.get_mut(&id) {
                Some(l) if l.node_id == self.node_id => {
                    l.expires_ms = now_ms() + LEASE_TTL_MS;
                }
                // Lease expired and was claimed elsewhere; fatal.
                _ => return Err(DbError::WorkerLeaseLost),
            }
        }
        self.shared
            .last_ts
            .lock()
            .insert(self.node_id.clone(), last_timestamp);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn lease_lifecycle() {
        let shared = Arc::new(KeeperShared::default());
        let a = MemWorkerKeeper::new(shared.clone(), 0);
        let b = MemWorkerKeeper::new(shared.clone(), 1);
        let id_a = a.acquire().unwrap();
        let id_b = b.acquire().unwrap();
        assert_ne!(id_a, id_b);

        a.keep_alive(123).await.unwrap();
        assert_eq!(a.initial_timestamp().max(123), a.initial_timestamp());

        a.release();
        // Freed id becomes claimable by a new node.
        let c = MemWorkerKeeper::new(shared, 2);
        assert_eq!(c.acquire().unwrap(), id_a);
    }

    #[tokio::test]
    async fn same_node_reuses_its_id() {
        let shared = Arc::new(KeeperShared::default());
        let a = MemWorkerKeeper::new(shared.clone(), 7);
        let id = a.acquire().unwrap();
        drop(a);
        // No release: simulate a crash + fast restart of the same ordinal.
        let again = MemWorkerKeeper::new(shared, 7);
        assert_eq!(again.acquire().unwrap(), id);
    }
}
