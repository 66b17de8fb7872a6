//! Component → physical table management.
//!
//! Built once at startup, after cluster assignment: every component used by
//! the app gets a [`Table`] carrying its reference and the backend that hosts
//! it. The manager is also where head-node maintenance iterates (create or
//! migrate every table, flush volatile ones).
//!
//! Components never point back at their table; the manager is the service
//! locator consulted after registration.

use std::collections::HashMap;
use std::sync::Arc;

use hetu_lib::{ComponentDef, Row, TableRef, Value};

use crate::db::backend::{Backend, TableStatus};
use crate::db::session::Session;
use crate::error::DbError;

/// A component's table address plus the backend hosting it.
#[derive(Clone)]
pub struct Table {
    pub table_ref: TableRef,
    pub backend: Arc<Backend>,
}

impl Table {
    pub fn component(&self) -> &Arc<ComponentDef> {
        &self.table_ref.component
    }

    /// A session pinned to this table's transaction group.
    pub fn session(&self) -> Session {
        self.backend
            .session(self.table_ref.instance.clone(), self.table_ref.cluster_id)
    }

    /// Read one row outside any transaction; may be served by a replica.
    pub async fn direct_get(&self, row_id: i64) -> Result<Option<Row>, DbError> {
        self.backend
            .master_or_servant()
            .get(&self.table_ref, row_id)
            .await
    }

    /// Range-query ids outside any transaction.
    pub async fn direct_query_ids(
        &self,
        index: &str,
        left: &Value,
        right: &Value,
        limit: i64,
        desc: bool,
    ) -> Result<Vec<i64>, DbError> {
        self.backend
            .master_or_servant()
            .range_ids(&self.table_ref, index, left, right, limit, desc)
            .await
    }

    /// Range-query rows outside any transaction.
    pub async fn direct_query(
        &self,
        index: &str,
        left: &Value,
        right: &Value,
        limit: i64,
        desc: bool,
    ) -> Result<Vec<Row>, DbError> {
        self.backend
            .master_or_servant()
            .range_rows(&self.table_ref, index, left, right, limit, desc)
            .await
    }

    /// Transaction-bypassing field write; volatile components only.
    pub async fn direct_set(&self, row_id: i64, fields: &[(String, Value)]) -> Result<(), DbError> {
        self.backend
            .master()
            .direct_set(&self.table_ref, row_id, fields)
            .await
    }
}

pub struct ComponentTableManager {
    namespace: String,
    instance: String,
    backends: HashMap<String, Arc<Backend>>,
    tables: HashMap<String, Table>,
}

impl ComponentTableManager {
    /// `assignments` pairs every used component with its cluster id, as
    /// computed by the system registry's cluster build.
    pub fn new(
        namespace: impl Into<String>,
        instance: impl Into<String>,
        backends: HashMap<String, Arc<Backend>>,
        assignments: &[(Arc<ComponentDef>, u32)],
    ) -> Result<Self, DbError> {
        let instance = instance.into();
        let mut tables = HashMap::new();
        for (comp, cluster_id) in assignments {
            let backend = backends.get(comp.backend()).cloned().ok_or_else(|| {
                DbError::Validation(format!(
                    "component {} names unknown backend `{}`",
                    comp.name(),
                    comp.backend()
                ))
            })?;
            tables.insert(
                comp.name().to_owned(),
                Table {
                    table_ref: TableRef::new(comp.clone(), instance.clone(), *cluster_id),
                    backend,
                },
            );
        }
        Ok(ComponentTableManager {
            namespace: namespace.into(),
            instance,
            backends,
            tables,
        })
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn instance(&self) -> &str {
        &self.instance
    }

    pub fn backends(&self) -> &HashMap<String, Arc<Backend>> {
        &self.backends
    }

    pub fn get_table(&self, component_name: &str) -> Option<&Table> {
        self.tables.get(component_name)
    }

    pub fn tables(&self) -> impl Iterator<Item = &Table> {
        self.tables.values()
    }

    /// Head-node startup: create missing tables; on drift either migrate
    /// (when `migrate` is set, cluster move first, then additive schema) or
    /// refuse with a clear operator message.
    pub async fn create_or_migrate_all(&self, migrate: bool) -> Result<(), DbError> {
        for table in self.tables.values() {
            let maint = table.backend.master().maintenance();
            let tref = &table.table_ref;
            loop {
                match maint.check_table(tref).await? {
                    TableStatus::NotExists => {
                        maint.create_table(tref).await?;
                        break;
                    }
                    TableStatus::Ok => break,
                    TableStatus::ClusterMismatch { stored } if migrate => {
                        log::warn!(
                            "[maint] {}: stored cluster {stored}, expected {}",
                            tref.comp_name(),
                            tref.cluster_id
                        );
                        maint.migrate_cluster(tref).await?;
                    }
                    TableStatus::SchemaMismatch { .. } if migrate => {
                        maint.migrate_schema(tref).await?;
                    }
                    TableStatus::ClusterMismatch { stored } => {
                        return Err(DbError::SchemaDrift {
                            table: tref.comp_name().to_owned(),
                            detail: format!(
                                "cluster id changed {stored} -> {}; run the migrate command",
                                tref.cluster_id
                            ),
                        });
                    }
                    TableStatus::SchemaMismatch { stored_digest } => {
                        return Err(DbError::SchemaDrift {
                            table: tref.comp_name().to_owned(),
                            detail: format!(
                                "schema digest changed {stored_digest} -> {}; run the migrate command",
                                tref.component.digest()
                            ),
                        });
                    }
                }
            }
        }
        Ok(())
    }

    /// Discard contents of every volatile table (head-node startup).
    pub async fn flush_volatile(&self) -> Result<(), DbError> {
        for table in self.tables.values() {
            if table.component().volatile() {
                let maint = table.backend.master().maintenance();
                maint.flush_table(&table.table_ref).await?;
            }
        }
        Ok(())
    }
}
