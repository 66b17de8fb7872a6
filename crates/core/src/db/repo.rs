//! Repository operations over one component within a session.
//!
//! Reads populate the session's identity map; writes buffer there until the
//! session commits. Unique pre-checks here are best-effort — the
//! authoritative check happens inside the backend's commit — but they catch
//! most conflicts before a wasted round-trip.

use std::sync::Arc;

use hetu_lib::{ComponentDef, Row, TableRef, Value};

use crate::db::idmap::RowState;
use crate::db::session::Session;
use crate::error::DbError;

pub struct Repository<'s> {
    session: &'s Session,
    table: TableRef,
}

impl<'s> Repository<'s> {
    pub(crate) fn new(session: &'s Session, component: Arc<ComponentDef>) -> Self {
        let table = TableRef::new(component, session.instance(), session.cluster_id());
        Repository { session, table }
    }

    pub fn table(&self) -> &TableRef {
        &self.table
    }

    pub fn component(&self) -> &Arc<ComponentDef> {
        &self.table.component
    }

    /// A fresh default row (`id` preassigned from the worker's id generator,
    /// `_version == 0`) ready to fill and [`insert`](Self::insert).
    pub async fn new_row(&self) -> Row {
        let mut row = self.table.component.new_row();
        row.set_id(self.session.backend().ids().next_id().await);
        row
    }

    /// Point lookup by primary key. Consults the identity map first; a
    /// DELETE-tagged row reads as absent.
    pub async fn get_by_id(&self, row_id: i64) -> Result<Option<Row>, DbError> {
        let cached = self
            .session
            .with_idmap(|m| m.get(&self.table, row_id).map(|(r, s)| (r.clone(), s)));
        if let Some((row, state)) = cached {
            return Ok(match state {
                RowState::Delete => None,
                _ => Some(row),
            });
        }
        let row = self.session.reader().get(&self.table, row_id).await?;
        if let Some(row) = &row {
            self.session
                .with_idmap(|m| m.add_clean(&self.table, row.clone()))?;
        }
        Ok(row)
    }

    /// Single-row lookup by any indexed field. `id` goes through the cache;
    /// other indexes consult the local buffer first, then the backend with
    /// `limit = 1`.
    pub async fn get(&self, index: &str, value: &Value) -> Result<Option<Row>, DbError> {
        let comp = &self.table.component;
        if !comp.has_index(index) {
            return Err(DbError::Validation(format!(
                "component {} has no index named `{index}`",
                comp.name()
            )));
        }
        if index == "id" {
            let Some(id) = value.as_i64() else {
                return Err(DbError::Validation("id must be an integer".into()));
            };
            return self.get_by_id(id).await;
        }
        let local = self
            .session
            .with_idmap(|m| m.filter(&self.table, index, value));
        if let Some(row) = local.into_iter().next() {
            return Ok(Some(row));
        }
        let rows = self.range(index, value, value, 1, false).await?;
        Ok(rows.into_iter().next())
    }

    /// Range query over an index. The id list always comes from the backend —
    /// a cached id-set would be unsound under concurrent writers — and each
    /// id then resolves through [`get_by_id`](Self::get_by_id), hitting the
    /// cache.
    pub async fn range(
        &self,
        index: &str,
        left: &Value,
        right: &Value,
        limit: i64,
        desc: bool,
    ) -> Result<Vec<Row>, DbError> {
        let comp = &self.table.component;
        if !comp.has_index(index) {
            return Err(DbError::Validation(format!(
                "component {} has no index named `{index}`",
                comp.name()
            )));
        }
        let ids = self
            .session
            .reader()
            .range_ids(&self.table, index, left, right, limit, desc)
            .await?;
        let mut rows = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(row) = self.get_by_id(id).await? {
                rows.push(row);
            }
        }
        Ok(rows)
    }

    /// Buffer a new row. `_version` must be 0. Unique fields are pre-checked
    /// locally and remotely; a conflict raises [`DbError::Unique`], which is
    /// caller-visible (not a race).
    pub async fn insert(&self, row: Row) -> Result<(), DbError> {
        if row.version() != 0 {
            return Err(DbError::Validation(
                "insert row must have _version == 0".into(),
            ));
        }
        if row.id() == 0 {
            return Err(DbError::Validation(
                "insert row has no id; obtain rows from Repository::new_row".into(),
            ));
        }
        let uniques: Vec<String> = self
            .table
            .component
            .uniques()
            .filter(|p| p.name != "id")
            .map(|p| p.name.clone())
            .collect();
        if let Some(field) = self.unique_conflict(&row, &uniques).await? {
            return Err(DbError::Unique {
                comp: self.table.comp_name().to_owned(),
                field,
            });
        }
        self.session.with_idmap(|m| m.add_insert(&self.table, row))
    }

    /// Buffer an update of a previously read row. Only changed unique fields
    /// are pre-checked.
    pub async fn update(&self, row: Row) -> Result<(), DbError> {
        let id = row.id();
        let clean = self
            .session
            .with_idmap(|m| m.get(&self.table, id).map(|(r, s)| (r.clone(), s)));
        let Some((old, state)) = clean else {
            return Err(DbError::Lookup { id });
        };
        if state == RowState::Delete {
            return Err(DbError::Validation(format!(
                "row {id} is marked for deletion and cannot be updated"
            )));
        }
        let changed = row.diff(&old);
        if changed.is_empty() {
            return Err(DbError::Validation("no fields changed".into()));
        }
        let props = self.table.component.props();
        let changed_uniques: Vec<String> = changed
            .iter()
            .map(|&i| &props[i])
            .filter(|p| p.unique && p.name != "id")
            .map(|p| p.name.clone())
            .collect();
        if let Some(field) = self.unique_conflict(&row, &changed_uniques).await? {
            return Err(DbError::Unique {
                comp: self.table.comp_name().to_owned(),
                field,
            });
        }
        self.session.with_idmap(|m| m.update(&self.table, row))
    }

    /// Mark a previously read row for deletion.
    pub fn delete(&self, row_id: i64) -> Result<(), DbError> {
        self.session.with_idmap(|m| m.mark_deleted(&self.table, row_id))
    }

    /// Fetch-or-create scoped on a unique index.
    ///
    /// Yields a guard holding either the existing row or a fresh one with the
    /// anchor field preset. Mutate it, then call
    /// [`UpsertGuard::finish`] — unchanged rows are a no-op, existing rows
    /// update, new rows insert. An anchor-field unique conflict at finish time
    /// is reclassified as [`DbError::Race`], because another transaction
    /// inserted first and the retry loop should resolve it.
    pub async fn upsert(&self, index: &str, value: &Value) -> Result<UpsertGuard<'_, 's>, DbError> {
        let comp = &self.table.component;
        let is_unique = comp.prop(index).map(|p| p.unique).unwrap_or(false);
        if !is_unique {
            return Err(DbError::Validation(format!(
                "upsert requires a unique index; {}.{index} is not one",
                comp.name()
            )));
        }
        match self.get(index, value).await? {
            Some(existing) => Ok(UpsertGuard {
                repo: self,
                anchor: index.to_owned(),
                clean: Some(existing.clone()),
                row: existing,
            }),
            None => {
                let mut row = self.new_row().await;
                row.set(index, value.clone());
                Ok(UpsertGuard {
                    repo: self,
                    anchor: index.to_owned(),
                    clean: None,
                    row,
                })
            }
        }
    }

    /// Best-effort unique check against the local buffer, then the backend.
    /// Rows pending deletion in this session do not count as conflicts.
    async fn unique_conflict(
        &self,
        row: &Row,
        fields: &[String],
    ) -> Result<Option<String>, DbError> {
        for field in fields {
            let value = row
                .get(field)
                .ok_or_else(|| DbError::Validation(format!("unknown field `{field}`")))?
                .clone();
            let local = self
                .session
                .with_idmap(|m| m.filter(&self.table, field, &value));
            if local.iter().any(|r| r.id() != row.id()) {
                return Ok(Some(field.clone()));
            }
            if self.remote_unique_conflict(row, field, &value).await? {
                return Ok(Some(field.clone()));
            }
        }
        Ok(None)
    }

    pub(crate) async fn remote_unique_conflict(
        &self,
        row: &Row,
        field: &str,
        value: &Value,
    ) -> Result<bool, DbError> {
        let ids = self
            .session
            .reader()
            .range_ids(&self.table, field, value, value, 1, false)
            .await?;
        match ids.first() {
            None => Ok(false),
            Some(&id) if id == row.id() => Ok(false),
            Some(&id) => Ok(!self.session.with_idmap(|m| m.is_deleted(&self.table, id))),
        }
    }
}

/// Scoped upsert; see [`Repository::upsert`].
pub struct UpsertGuard<'r, 's> {
    repo: &'r Repository<'s>,
    anchor: String,
    clean: Option<Row>,
    row: Row,
}

impl UpsertGuard<'_, '_> {
    pub fn row(&self) -> &Row {
        &self.row
    }

    pub fn row_mut(&mut self) -> &mut Row {
        &mut self.row
    }

    pub async fn finish(self) -> Result<(), DbError> {
        match self.clean {
            Some(clean) => {
                if self.row == clean {
                    return Ok(());
                }
                self.repo.update(self.row).await
            }
            None => {
                let value = self
                    .row
                    .get(&self.anchor)
                    .cloned()
                    .ok_or_else(|| DbError::Validation("anchor field vanished".into()))?;
                if self
                    .repo
                    .remote_unique_conflict(&self.row, &self.anchor, &value)
                    .await?
                {
                    // Another transaction inserted the anchor value after we
                    // looked; this is the index race the retry loop resolves.
                    return Err(DbError::Race(format!(
                        "upsert anchor {}.{} taken concurrently",
                        self.repo.table.comp_name(),
                        self.anchor
                    )));
                }
                self.repo.insert(self.row).await
            }
        }
    }
}
