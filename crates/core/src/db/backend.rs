//! The storage-engine abstraction.
//!
//! A [`BackendClient`] speaks to one storage engine: point gets, range scans
//! on secondary indexes, the atomic commit of a session's dirty set, and the
//! keyspace-notification stream the subscription broker consumes. The default
//! engine is the embedded [`super::mem::MemBackend`]; the trait is the seam
//! where a networked engine would plug in.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use hetu_lib::{Row, TableRef, Value};
use rand::prelude::IndexedRandom;

use crate::error::DbError;
use crate::db::idmap::DirtySet;
use crate::snowflake::SnowflakeId;

#[async_trait]
pub trait BackendClient: Send + Sync {
    /// Latest committed row, or `None`.
    async fn get(&self, table: &TableRef, row_id: i64) -> Result<Option<Row>, DbError>;

    /// Ids of rows whose `index` value lies in `[left, right]` (closed by
    /// default; string bounds may carry `(`/`[` prefixes, numeric bounds may
    /// be `±inf` sentinels). Ties order by ascending id; `desc` reverses the
    /// interval; `limit < 0` means unbounded.
    async fn range_ids(
        &self,
        table: &TableRef,
        index: &str,
        left: &Value,
        right: &Value,
        limit: i64,
        desc: bool,
    ) -> Result<Vec<i64>, DbError>;

    /// Range scan resolving the rows as well.
    async fn range_rows(
        &self,
        table: &TableRef,
        index: &str,
        left: &Value,
        right: &Value,
        limit: i64,
        desc: bool,
    ) -> Result<Vec<Row>, DbError>;

    /// Atomically apply a session's dirty set.
    ///
    /// The engine verifies, before applying any write, that every UPDATE and
    /// DELETE still sees the `_version` the session read (else [`DbError::Race`])
    /// and that no unique index is broken (else surfaced as race, because the
    /// session's indexes may have been stale). Writes apply deletes, then
    /// updates, then inserts; every applied row bumps `_version` by one
    /// (inserts start at 1). After the write the engine publishes to the
    /// row channel of each touched row and the index channel of each index
    /// whose key set changed.
    async fn commit(&self, dirty: DirtySet) -> Result<(), DbError>;

    /// Bypass the transaction layer for volatile components; indexed fields
    /// are forbidden. Used for bookkeeping like `last_active`.
    async fn direct_set(
        &self,
        table: &TableRef,
        row_id: i64,
        fields: &[(String, Value)],
    ) -> Result<(), DbError>;

    /// Whether replicas have caught up with the master; test reproducibility
    /// hook for replicated engines.
    async fn is_synced(&self) -> Result<bool, DbError>;

    /// A fresh notification consumer. One per client connection.
    fn mq_client(&self) -> Box<dyn MqClient>;

    /// The worker-id lease keeper for this engine.
    fn worker_keeper(&self, process_ordinal: u32) -> Box<dyn WorkerKeeper>;

    /// The schema-maintenance facet. Operations may take a global lock; they
    /// only run at head-node startup or via operator command.
    fn maintenance(&self) -> Box<dyn TableMaint>;
}

/// Consumer side of the engine's keyspace notifications.
///
/// `pull` must be driven continuously by a dedicated task so the engine-side
/// buffer never backs up; `get_message` drains the deduplicated batch.
#[async_trait]
pub trait MqClient: Send + Sync {
    async fn subscribe(&self, channel: &str) -> Result<(), DbError>;
    async fn unsubscribe(&self, channel: &str) -> Result<(), DbError>;

    /// Receive one notification into the local dedup queue. Entries older
    /// than two minutes are dropped to bound the backlog.
    async fn pull(&self) -> Result<(), DbError>;

    /// Wait for and take the next batch of changed channels.
    async fn get_message(&self) -> Result<HashSet<String>, DbError>;
}

/// Worker-id leases for the snowflake generator.
///
/// Ids live in `[0, 1023]`, leased with a TTL; renewal is due every 5 s. A
/// crashed worker's lease expires and the id is reclaimed. The keeper also
/// persists the worker's last-seen wall clock so a restart cannot hand the
/// generator a regressed clock.
#[async_trait]
pub trait WorkerKeeper: Send + Sync {
    fn acquire(&self) -> Result<u32, DbError>;
    fn release(&self);
    /// `max(now, persisted last timestamp)` in ms.
    fn initial_timestamp(&self) -> i64;
    async fn keep_alive(&self, last_timestamp: i64) -> Result<(), DbError>;
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TableStatus {
    NotExists,
    Ok,
    ClusterMismatch { stored: u32 },
    SchemaMismatch { stored_digest: String },
}

/// Schema maintenance: existence/meta checks, creation, additive migration,
/// cluster relocation, index rebuild and volatile flush.
#[async_trait]
pub trait TableMaint: Send + Sync {
    async fn check_table(&self, table: &TableRef) -> Result<TableStatus, DbError>;
    async fn create_table(&self, table: &TableRef) -> Result<(), DbError>;
    /// Move a table's keys to the cluster id in `table`. Run before any
    /// schema migration when both changed.
    async fn migrate_cluster(&self, table: &TableRef) -> Result<(), DbError>;
    /// Additive schema migration: new columns fill with defaults, indexes are
    /// rebuilt. Removed or retyped columns are refused.
    async fn migrate_schema(&self, table: &TableRef) -> Result<(), DbError>;
    async fn rebuild_index(&self, table: &TableRef, index: &str) -> Result<(), DbError>;
    /// Discard a volatile table's contents (head-node startup).
    async fn flush_table(&self, table: &TableRef) -> Result<(), DbError>;
}

/// One storage engine as seen by a worker: the writable master, optional
/// read replicas, and the worker's id generator.
pub struct Backend {
    master: Arc<dyn BackendClient>,
    servants: Vec<Arc<dyn BackendClient>>,
    ids: Arc<SnowflakeId>,
}

impl Backend {
    pub fn new(master: Arc<dyn BackendClient>, ids: Arc<SnowflakeId>) -> Self {
        Backend {
            master,
            servants: Vec::new(),
            ids,
        }
    }

    pub fn with_servants(mut self, servants: Vec<Arc<dyn BackendClient>>) -> Self {
        self.servants = servants;
        self
    }

    pub fn master(&self) -> &Arc<dyn BackendClient> {
        &self.master
    }

    /// A read connection; reads may be served from replicas.
    pub fn master_or_servant(&self) -> Arc<dyn BackendClient> {
        if self.servants.is_empty() {
            return self.master.clone();
        }
        self.servants
            .choose(&mut rand::rng())
            .cloned()
            .unwrap_or_else(|| self.master.clone())
    }

    pub fn ids(&self) -> &Arc<SnowflakeId> {
        &self.ids
    }

    /// Open a transactional session pinned to one `(instance, cluster)`.
    pub fn session(self: &Arc<Self>, instance: impl Into<String>, cluster_id: u32) -> crate::db::session::Session {
        crate::db::session::Session::new(self.clone(), instance.into(), cluster_id)
    }
}
