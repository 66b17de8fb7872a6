//! Schema maintenance for the embedded engine.
//!
//! These operations run at head-node startup or from an operator command and
//! hold the engine lock for their whole duration; that is the global lock the
//! migration contract allows. When both the cluster id and the schema of a
//! table changed, relocation runs first and the additive migration second.

use async_trait::async_trait;
use hetu_lib::{Row, TableRef};

use crate::db::backend::{TableMaint, TableStatus};
use crate::error::DbError;

use super::client::{MemBackend, TableMeta};

pub struct MemTableMaint {
    backend: MemBackend,
}

impl MemTableMaint {
    pub(super) fn new(backend: MemBackend) -> Self {
        MemTableMaint { backend }
    }

    /// Property name → dtype tag of a stored schema JSON.
    fn stored_props(json: &str) -> Result<Vec<(String, String)>, DbError> {
        let parsed: serde_json::Value = serde_json::from_str(json)
            .map_err(|e| DbError::Validation(format!("stored table meta is corrupt: {e}")))?;
        let props = parsed
            .get("properties")
            .and_then(|p| p.as_object())
            .ok_or_else(|| DbError::Validation("stored table meta has no properties".into()))?;
        Ok(props
            .iter()
            .map(|(name, p)| {
                (
                    name.clone(),
                    p.get("dtype")
                        .and_then(|d| d.as_str())
                        .unwrap_or_default()
                        .to_owned(),
                )
            })
            .collect())
    }
}

#[async_trait]
impl TableMaint for MemTableMaint {
    async fn check_table(&self, table: &TableRef) -> Result<TableStatus, DbError> {
        let state = self.backend.state.lock();
        let Some(meta) = state.meta.get(&table.meta_key()) else {
            return Ok(TableStatus::NotExists);
        };
        // Cluster relocation is checked before schema: a moved table keeps
        // its old keys until migrated, so the digest comparison would read
        // the wrong keyspace.
        if meta.cluster_id != table.cluster_id {
            return Ok(TableStatus::ClusterMismatch {
                stored: meta.cluster_id,
            });
        }
        if meta.version != table.component.digest() {
            return Ok(TableStatus::SchemaMismatch {
                stored_digest: meta.version.clone(),
            });
        }
        Ok(TableStatus::Ok)
    }

    async fn create_table(&self, table: &TableRef) -> Result<(), DbError> {
        let mut state = self.backend.state.lock();
        let key = table.meta_key();
        if state.meta.contains_key(&key) {
            return Err(DbError::Validation(format!(
                "table {} already exists",
                table.comp_name()
            )));
        }
        log::info!("[maint] creating table {}", table.comp_name());
        state.meta.insert(
            key,
            TableMeta {
                json: table.component.json().to_owned(),
                version: table.component.digest().to_owned(),
                cluster_id: table.cluster_id,
            },
        );
        Ok(())
    }

    async fn migrate_cluster(&self, table: &TableRef) -> Result<(), DbError> {
        let mut state = self.backend.state.lock();
        let key = table.meta_key();
        let Some(meta) = state.meta.get(&key).cloned() else {
            return Err(DbError::SchemaDrift {
                table: table.comp_name().to_owned(),
                detail: "cannot relocate a table that does not exist".into(),
            });
        };
        if meta.cluster_id == table.cluster_id {
            return Ok(());
        }
        log::warn!(
            "[maint] {}: cluster id {} -> {}, relocating keys",
            table.comp_name(),
            meta.cluster_id,
            table.cluster_id
        );
        let old_ref = TableRef::new(table.component.clone(), table.instance.clone(), meta.cluster_id);
        let old_prefix = old_ref.cluster_prefix();
        if let Some(store) = state.tables.remove(&old_prefix) {
            state.tables.insert(table.cluster_prefix(), store);
        }
        if let Some(meta) = state.meta.get_mut(&key) {
            meta.cluster_id = table.cluster_id;
        }
        Ok(())
    }

    async fn migrate_schema(&self, table: &TableRef) -> Result<(), DbError> {
        let mut state = self.backend.state.lock();
        let key = table.meta_key();
        let Some(meta) = state.meta.get(&key).cloned() else {
            return Err(DbError::SchemaDrift {
                table: table.comp_name().to_owned(),
                detail: "cannot migrate a table that does not exist".into(),
            });
        };
        if meta.version == table.component.digest() {
            return Ok(());
        }

        // Only the safe additive case: every stored column must survive with
        // the same dtype; anything else needs an operator decision.
        let new = &table.component;
        for (name, dtype) in Self::stored_props(&meta.json)? {
            match new.prop(&name) {
                Some(p) if p.ty.tag() == dtype => {}
                Some(p) => {
                    return Err(DbError::SchemaDrift {
                        table: new.name().to_owned(),
                        detail: format!(
                            "column `{name}` changed dtype {dtype} -> {}; not an additive change",
                            p.ty.tag()
                        ),
                    });
                }
                None => {
                    return Err(DbError::SchemaDrift {
                        table: new.name().to_owned(),
                        detail: format!("column `{name}` was removed; not an additive change"),
                    });
                }
            }
        }

        log::warn!("[maint] {}: migrating schema additively", new.name());
        let store = state.tables.entry(table.cluster_prefix()).or_default();
        // Re-decode every row against the new schema: missing columns take
        // their defaults, then all indexes rebuild from scratch.
        let rows: Vec<Row> = store
            .rows
            .values()
            .filter_map(|row| Row::from_raw(new, &row.to_raw()))
            .collect();
        store.rows.clear();
        store.indexes.clear();
        for row in rows {
            let id = row.id();
            store.index_insert(&row);
            store.rows.insert(id, row);
        }
        state.meta.insert(
            key,
            TableMeta {
                json: new.json().to_owned(),
                version: new.digest().to_owned(),
                cluster_id: table.cluster_id,
            },
        );
        Ok(())
    }

    async fn rebuild_index(&self, table: &TableRef, index: &str) -> Result<(), DbError> {
        if !table.component.has_index(index) {
            return Err(DbError::Validation(format!(
                "{}.{index} is not indexed",
                table.comp_name()
            )));
        }
        let mut state = self.backend.state.lock();
        let store = state.tables.entry(table.cluster_prefix()).or_default();
        store.rebuild_index(index);
        Ok(())
    }

    async fn flush_table(&self, table: &TableRef) -> Result<(), DbError> {
        if !table.component.volatile() {
            return Err(DbError::Validation(format!(
                "refusing to flush persistent table {}",
                table.comp_name()
            )));
        }
        let mut state = self.backend.state.lock();
        if let Some(store) = state.tables.get_mut(&table.cluster_prefix()) {
            let dropped = store.rows.len();
            store.rows.clear();
            store.indexes.clear();
            if dropped > 0 {
                log::info!("[maint] flushed {dropped} volatile rows from {}", table.comp_name());
            }
        }
        Ok(())
    }
}
