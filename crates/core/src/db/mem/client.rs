use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use hetu_lib::{IndexBound, IndexKey, Row, TableRef, Value};
use parking_lot::Mutex;
use rustc_hash::{FxHashMap, FxHashSet};
use tokio::sync::broadcast;

use crate::db::backend::{BackendClient, MqClient, TableMaint, WorkerKeeper};
use crate::db::idmap::DirtySet;
use crate::error::DbError;

use super::keeper::{KeeperShared, MemWorkerKeeper};
use super::maint::MemTableMaint;
use super::mq::MemMqClient;

/// Capacity of the notification fan-out; a consumer that lags this far
/// behind starts dropping (and logs it).
const MQ_CAPACITY: usize = 4096;

#[derive(Clone, Debug)]
pub(super) struct TableMeta {
    pub json: String,
    pub version: String,
    pub cluster_id: u32,
}

#[derive(Default)]
pub(super) struct TableStore {
    pub rows: FxHashMap<i64, Row>,
    /// index name → ordered `(key, id)` set; ties break by ascending id.
    pub indexes: FxHashMap<String, BTreeSet<(IndexKey, i64)>>,
}

impl TableStore {
    /// Any row holding `key` in `field`'s index, ignoring `skip` ids.
    pub fn index_holder(&self, field: &str, key: &IndexKey, skip: &FxHashSet<i64>) -> Option<i64> {
        let idx = self.indexes.get(field)?;
        idx.range((key.clone(), i64::MIN)..=(key.clone(), i64::MAX))
            .map(|(_, id)| *id)
            .find(|id| !skip.contains(id))
    }

    pub fn index_insert(&mut self, row: &Row) {
        let def = row.def().clone();
        for p in def.indexes() {
            if let Some(v) = row.get(&p.name) {
                self.indexes
                    .entry(p.name.clone())
                    .or_default()
                    .insert((v.index_key(), row.id()));
            }
        }
    }

    pub fn index_remove(&mut self, row: &Row) {
        let def = row.def().clone();
        for p in def.indexes() {
            if let Some(v) = row.get(&p.name) {
                if let Some(idx) = self.indexes.get_mut(&p.name) {
                    idx.remove(&(v.index_key(), row.id()));
                }
            }
        }
    }

    pub fn rebuild_index(&mut self, field: &str) {
        let mut set = BTreeSet::new();
        for (id, row) in &self.rows {
            if let Some(v) = row.get(field) {
                set.insert((v.index_key(), *id));
            }
        }
        self.indexes.insert(field.to_owned(), set);
    }
}

#[derive(Default)]
pub(super) struct EngineState {
    /// cluster-prefix → table store.
    pub tables: FxHashMap<String, TableStore>,
    /// meta-key → table meta.
    pub meta: FxHashMap<String, TableMeta>,
}

/// The embedded engine. Cloning shares the same store.
#[derive(Clone)]
pub struct MemBackend {
    pub(super) state: Arc<Mutex<EngineState>>,
    pub(super) tx: broadcast::Sender<String>,
    keeper: Arc<KeeperShared>,
}

impl Default for MemBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemBackend {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(MQ_CAPACITY);
        MemBackend {
            state: Arc::new(Mutex::new(EngineState::default())),
            tx,
            keeper: Arc::new(KeeperShared::default()),
        }
    }

    fn publish(&self, channels: impl IntoIterator<Item = String>) {
        for chan in channels {
            // No subscribers is fine; send only fails then.
            let _ = self.tx.send(chan);
        }
    }

    fn resolve_bounds(
        table: &TableRef,
        index: &str,
        left: &Value,
        right: &Value,
    ) -> Result<(IndexBound, IndexBound), DbError> {
        let prop = table.component.prop(index).ok_or_else(|| {
            DbError::Validation(format!(
                "component {} has no property `{index}`",
                table.comp_name()
            ))
        })?;
        if !prop.index {
            return Err(DbError::Validation(format!(
                "{}.{index} is not indexed",
                table.comp_name()
            )));
        }
        let lo = IndexBound::from_query(&prop.ty, left).ok_or_else(|| {
            DbError::Validation(format!("bad left bound for {}.{index}", table.comp_name()))
        })?;
        let hi = IndexBound::from_query(&prop.ty, right).ok_or_else(|| {
            DbError::Validation(format!("bad right bound for {}.{index}", table.comp_name()))
        })?;
        if lo.key > hi.key {
            return Err(DbError::Validation(format!(
                "range left bound exceeds right bound on {}.{index}",
                table.comp_name()
            )));
        }
        Ok((lo, hi))
    }

    fn scan_ids(
        store: &TableStore,
        index: &str,
        lo: &IndexBound,
        hi: &IndexBound,
        limit: i64,
        desc: bool,
    ) -> Vec<i64> {
        let Some(idx) = store.indexes.get(index) else {
            return Vec::new();
        };
        use std::ops::Bound;
        let start = if lo.open {
            Bound::Excluded((lo.key.clone(), i64::MAX))
        } else {
            Bound::Included((lo.key.clone(), i64::MIN))
        };
        let end = if hi.open {
            Bound::Excluded((hi.key.clone(), i64::MIN))
        } else {
            Bound::Included((hi.key.clone(), i64::MAX))
        };
        let take = if limit < 0 { usize::MAX } else { limit as usize };
        let range = idx.range((start, end));
        if desc {
            range.rev().map(|(_, id)| *id).take(take).collect()
        } else {
            range.map(|(_, id)| *id).take(take).collect()
        }
    }

    /// Commit-time unique verification across the whole dirty set.
    ///
    /// Deletes are applied (logically) first, so an insert reusing a unique
    /// value of a row deleted in the same commit does not conflict. Returns
    /// the offending `(component, field)` on violation.
    fn verify_uniques(
        state: &EngineState,
        dirty: &DirtySet,
        deleting: &FxHashMap<String, FxHashSet<i64>>,
    ) -> Result<(), DbError> {
        // Values claimed within this commit, to catch intra-commit clashes.
        let mut claimed: FxHashSet<(String, String, IndexKey)> = FxHashSet::default();
        let mut check = |table: &TableRef,
                         row_id: i64,
                         field: &str,
                         value: &Value|
         -> Result<(), DbError> {
            let prefix = table.cluster_prefix();
            let key = value.index_key();
            if !claimed.insert((prefix.clone(), field.to_owned(), key.clone())) {
                return Err(DbError::Unique {
                    comp: table.comp_name().to_owned(),
                    field: field.to_owned(),
                });
            }
            let empty = FxHashSet::default();
            let skip = deleting.get(&prefix).unwrap_or(&empty);
            if let Some(store) = state.tables.get(&prefix) {
                if let Some(holder) = store.index_holder(field, &key, skip) {
                    if holder != row_id {
                        return Err(DbError::Unique {
                            comp: table.comp_name().to_owned(),
                            field: field.to_owned(),
                        });
                    }
                }
            }
            Ok(())
        };

        for (table, row) in &dirty.inserts {
            for p in table.component.uniques() {
                if let Some(v) = row.get(&p.name) {
                    check(table, row.id(), &p.name, v)?;
                }
            }
        }
        for (table, patch) in &dirty.updates {
            for (field, value) in &patch.fields {
                let is_unique = table
                    .component
                    .prop(field)
                    .map(|p| p.unique)
                    .unwrap_or(false);
                if is_unique {
                    check(table, patch.id, field, value)?;
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl BackendClient for MemBackend {
    async fn get(&self, table: &TableRef, row_id: i64) -> Result<Option<Row>, DbError> {
        let state = self.state.lock();
        Ok(state
            .tables
            .get(&table.cluster_prefix())
            .and_then(|s| s.rows.get(&row_id))
            .cloned())
    }

    async fn range_ids(
        &self,
        table: &TableRef,
        index: &str,
        left: &Value,
        right: &Value,
        limit: i64,
        desc: bool,
    ) -> Result<Vec<i64>, DbError> {
        let (lo, hi) = Self::resolve_bounds(table, index, left, right)?;
        let state = self.state.lock();
        Ok(state
            .tables
            .get(&table.cluster_prefix())
            .map(|s| Self::scan_ids(s, index, &lo, &hi, limit, desc))
            .unwrap_or_default())
    }

    async fn range_rows(
        &self,
        table: &TableRef,
        index: &str,
        left: &Value,
        right: &Value,
        limit: i64,
        desc: bool,
    ) -> Result<Vec<Row>, DbError> {
        let (lo, hi) = Self::resolve_bounds(table, index, left, right)?;
        let state = self.state.lock();
        let Some(store) = state.tables.get(&table.cluster_prefix()) else {
            return Ok(Vec::new());
        };
        Ok(Self::scan_ids(store, index, &lo, &hi, limit, desc)
            .into_iter()
            .filter_map(|id| store.rows.get(&id).cloned())
            .collect())
    }

    async fn commit(&self, dirty: DirtySet) -> Result<(), DbError> {
        if dirty.is_empty() {
            return Ok(());
        }
        let mut row_channels: HashSet<String> = HashSet::new();
        let mut index_channels: HashSet<String> = HashSet::new();
        {
            let mut state = self.state.lock();

            // Version checks before any write: the stored `_version` must be
            // exactly what the session's clean copy recorded.
            let stored_version = |state: &EngineState, table: &TableRef, id: i64| {
                state
                    .tables
                    .get(&table.cluster_prefix())
                    .and_then(|s| s.rows.get(&id))
                    .map(|r| r.version())
            };
            for (table, id, version) in &dirty.deletes {
                match stored_version(&state, table, *id) {
                    Some(v) if v == *version => {}
                    _ => {
                        return Err(DbError::Race(format!(
                            "delete of {}:{id} lost the version race",
                            table.comp_name()
                        )));
                    }
                }
            }
            for (table, patch) in &dirty.updates {
                match stored_version(&state, table, patch.id) {
                    Some(v) if v == patch.version => {}
                    _ => {
                        return Err(DbError::Race(format!(
                            "update of {}:{} lost the version race",
                            table.comp_name(),
                            patch.id
                        )));
                    }
                }
            }

            // Patch values must fit their dtypes before anything applies, so
            // a bad patch cannot leave a half-applied commit behind.
            for (table, patch) in &dirty.updates {
                for (field, value) in &patch.fields {
                    let fits = table
                        .component
                        .prop(field)
                        .map(|p| value.matches(&p.ty))
                        .unwrap_or(false);
                    if !fits {
                        return Err(DbError::Validation(format!(
                            "bad value for {}.{field}",
                            table.comp_name()
                        )));
                    }
                }
            }

            let mut deleting: FxHashMap<String, FxHashSet<i64>> = FxHashMap::default();
            for (table, id, _) in &dirty.deletes {
                deleting
                    .entry(table.cluster_prefix())
                    .or_default()
                    .insert(*id);
            }

            // Unique verification surfaces as race at the session layer;
            // indexes may have been stale when the session snapshotted.
            if let Err(e) = Self::verify_uniques(&state, &dirty, &deleting) {
                let DbError::Unique { comp, field } = e else {
                    return Err(e);
                };
                return Err(DbError::Race(format!(
                    "unique index {comp}.{field} taken concurrently"
                )));
            }

            // Apply phase: deletes, then updates, then inserts.
            for (table, id, _) in &dirty.deletes {
                let store = state.tables.entry(table.cluster_prefix()).or_default();
                if let Some(row) = store.rows.remove(id) {
                    store.index_remove(&row);
                    row_channels.insert(table.row_channel(*id));
                    for p in table.component.indexes() {
                        index_channels.insert(table.index_channel(&p.name));
                    }
                }
            }
            for (table, patch) in &dirty.updates {
                let store = state.tables.entry(table.cluster_prefix()).or_default();
                let Some(row) = store.rows.get(&patch.id).cloned() else {
                    continue;
                };
                store.index_remove(&row);
                let mut row = row;
                for (field, value) in &patch.fields {
                    if !row.set(field, value.clone()) {
                        return Err(DbError::Validation(format!(
                            "bad value for {}.{field}",
                            table.comp_name()
                        )));
                    }
                    if table
                        .component
                        .prop(field)
                        .map(|p| p.index)
                        .unwrap_or(false)
                    {
                        index_channels.insert(table.index_channel(field));
                    }
                }
                row.set_version(patch.version + 1);
                store.index_insert(&row);
                store.rows.insert(patch.id, row);
                row_channels.insert(table.row_channel(patch.id));
            }
            for (table, row) in dirty.inserts {
                let store = state.tables.entry(table.cluster_prefix()).or_default();
                let mut row = row;
                row.set_version(1);
                let id = row.id();
                store.index_insert(&row);
                store.rows.insert(id, row);
                row_channels.insert(table.row_channel(id));
                for p in table.component.indexes() {
                    index_channels.insert(table.index_channel(&p.name));
                }
            }
        }
        self.publish(row_channels.into_iter().chain(index_channels));
        Ok(())
    }

    async fn direct_set(
        &self,
        table: &TableRef,
        row_id: i64,
        fields: &[(String, Value)],
    ) -> Result<(), DbError> {
        if !table.component.volatile() {
            return Err(DbError::Validation(format!(
                "direct_set is only allowed on volatile components, {} is persistent",
                table.comp_name()
            )));
        }
        for (field, _) in fields {
            let indexed = table
                .component
                .prop(field)
                .map(|p| p.index)
                .unwrap_or(true);
            if indexed {
                return Err(DbError::Validation(format!(
                    "direct_set cannot touch indexed field {}.{field}",
                    table.comp_name()
                )));
            }
        }
        {
            let mut state = self.state.lock();
            let store = state.tables.entry(table.cluster_prefix()).or_default();
            let Some(row) = store.rows.get_mut(&row_id) else {
                return Err(DbError::Lookup { id: row_id });
            };
            for (field, value) in fields {
                if !row.set(field, value.clone()) {
                    return Err(DbError::Validation(format!(
                        "bad value for {}.{field}",
                        table.comp_name()
                    )));
                }
            }
        }
        self.publish([table.row_channel(row_id)]);
        Ok(())
    }

    async fn is_synced(&self) -> Result<bool, DbError> {
        Ok(true)
    }

    fn mq_client(&self) -> Box<dyn MqClient> {
        Box::new(MemMqClient::new(self.tx.subscribe()))
    }

    fn worker_keeper(&self, process_ordinal: u32) -> Box<dyn WorkerKeeper> {
        Box::new(MemWorkerKeeper::new(self.keeper.clone(), process_ordinal))
    }

    fn maintenance(&self) -> Box<dyn TableMaint> {
        Box::new(MemTableMaint::new(self.clone()))
    }
}
