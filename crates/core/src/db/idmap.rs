//! The session's write buffer.
//!
//! `IdentityMap` tracks, per table, the clean copy of every row the session
//! read, the current in-memory mutation of each row, and a per-row state.
//! Commit extracts the dirty set from it; discard simply drops it.
//!
//! Because a session may touch the same row several times, states record the
//! *cumulative* effect: updating a freshly inserted row keeps it an insert,
//! and deleting a freshly inserted row removes it from the buffer entirely.
//!
//! Invariants:
//! - a row id appears at most once per table;
//! - an `Insert` row has `_version == 0`;
//! - `Update`/`Delete` require a clean copy to be present;
//! - updating a `Delete`-tagged row is an error.

use std::collections::HashMap;

use hetu_lib::{Row, TableRef, Value};

use crate::error::DbError;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RowState {
    Clean,
    Insert,
    Update,
    Delete,
}

#[derive(Default)]
struct TableBuf {
    /// Row as last read from storage; absent for inserts.
    clean: HashMap<i64, Row>,
    /// Current working copy.
    rows: HashMap<i64, Row>,
    states: HashMap<i64, RowState>,
}

/// Changed fields of one updated row, plus the version the session read.
#[derive(Clone, Debug)]
pub struct RowPatch {
    pub id: i64,
    pub version: i64,
    pub fields: Vec<(String, Value)>,
}

/// Per-table write lists extracted from the identity map, in the order the
/// backend applies them: deletes, then updates, then inserts.
#[derive(Default, Debug)]
pub struct DirtySet {
    pub inserts: Vec<(TableRef, Row)>,
    pub updates: Vec<(TableRef, RowPatch)>,
    /// `(table, id, version-the-session-read)`.
    pub deletes: Vec<(TableRef, i64, i64)>,
}

impl DirtySet {
    pub fn is_empty(&self) -> bool {
        self.inserts.is_empty() && self.updates.is_empty() && self.deletes.is_empty()
    }
}

#[derive(Default)]
pub struct IdentityMap {
    tables: HashMap<TableRef, TableBuf>,
}

impl IdentityMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_dirty(&self) -> bool {
        self.tables.values().any(|t| {
            t.states
                .values()
                .any(|s| !matches!(s, RowState::Clean))
        })
    }

    pub fn first_reference(&self) -> Option<&TableRef> {
        self.tables.keys().next()
    }

    fn same_txn_group(&self, table: &TableRef) -> bool {
        match self.first_reference() {
            None => true,
            Some(first) => first.same_txn_group(table),
        }
    }

    /// Cache a row read from storage as CLEAN.
    pub fn add_clean(&mut self, table: &TableRef, row: Row) -> Result<(), DbError> {
        if !self.same_txn_group(table) {
            return Err(DbError::Validation(format!(
                "{table} belongs to a different transaction group than this session"
            )));
        }
        let buf = self.tables.entry(table.clone()).or_default();
        let id = row.id();
        if buf.rows.contains_key(&id) {
            return Err(DbError::Validation(format!(
                "row {id} already cached in {table}"
            )));
        }
        buf.clean.insert(id, row.clone());
        buf.rows.insert(id, row);
        buf.states.insert(id, RowState::Clean);
        Ok(())
    }

    pub fn get(&self, table: &TableRef, row_id: i64) -> Option<(&Row, RowState)> {
        let buf = self.tables.get(table)?;
        let row = buf.rows.get(&row_id)?;
        Some((row, buf.states.get(&row_id).copied().unwrap_or(RowState::Clean)))
    }

    pub fn is_deleted(&self, table: &TableRef, row_id: i64) -> bool {
        self.get(table, row_id)
            .map(|(_, s)| s == RowState::Delete)
            .unwrap_or(false)
    }

    /// Buffer a new row as INSERT. The row must carry `_version == 0` and an
    /// already-assigned id.
    pub fn add_insert(&mut self, table: &TableRef, row: Row) -> Result<(), DbError> {
        if !self.same_txn_group(table) {
            return Err(DbError::Validation(format!(
                "{table} belongs to a different transaction group than this session"
            )));
        }
        if row.version() != 0 {
            return Err(DbError::Validation(
                "insert row must have _version == 0".into(),
            ));
        }
        let id = row.id();
        let buf = self.tables.entry(table.clone()).or_default();
        if buf.rows.contains_key(&id) {
            return Err(DbError::Validation(format!(
                "row {id} already cached in {table}"
            )));
        }
        buf.rows.insert(id, row);
        buf.states.insert(id, RowState::Insert);
        Ok(())
    }

    /// Replace the working copy of a cached row and mark it UPDATE (or keep
    /// INSERT). The incoming `_version` must equal the buffered one.
    pub fn update(&mut self, table: &TableRef, row: Row) -> Result<(), DbError> {
        let id = row.id();
        let buf = self
            .tables
            .get_mut(table)
            .ok_or(DbError::Lookup { id })?;
        let state = *buf.states.get(&id).ok_or(DbError::Lookup { id })?;
        let current = buf.rows.get(&id).ok_or(DbError::Lookup { id })?;
        if row.version() != current.version() {
            return Err(DbError::Validation(
                "_version changed since the row was read; the field is engine-owned".into(),
            ));
        }
        match state {
            RowState::Delete => Err(DbError::Validation(format!(
                "row {id} is marked for deletion and cannot be updated"
            ))),
            RowState::Insert => {
                buf.rows.insert(id, row);
                Ok(())
            }
            RowState::Clean | RowState::Update => {
                buf.rows.insert(id, row);
                buf.states.insert(id, RowState::Update);
                Ok(())
            }
        }
    }

    /// Mark a cached row DELETE. Deleting a pending insert cancels it.
    pub fn mark_deleted(&mut self, table: &TableRef, row_id: i64) -> Result<(), DbError> {
        let buf = self
            .tables
            .get_mut(table)
            .ok_or(DbError::Lookup { id: row_id })?;
        match buf.states.get(&row_id) {
            None => Err(DbError::Lookup { id: row_id }),
            Some(RowState::Insert) => {
                // Cumulative effect of insert-then-delete is nothing.
                buf.rows.remove(&row_id);
                buf.states.remove(&row_id);
                Ok(())
            }
            Some(_) => {
                buf.states.insert(row_id, RowState::Delete);
                Ok(())
            }
        }
    }

    /// Working rows of `table` matching `field == value`, excluding deletes.
    pub fn filter(&self, table: &TableRef, field: &str, value: &Value) -> Vec<Row> {
        let Some(buf) = self.tables.get(table) else {
            return Vec::new();
        };
        buf.rows
            .iter()
            .filter(|(id, row)| {
                !matches!(buf.states.get(id), Some(RowState::Delete))
                    && row.get(field) == Some(value)
            })
            .map(|(_, row)| row.clone())
            .collect()
    }

    /// Extract the per-table write lists for commit.
    pub fn dirty_set(&self) -> DirtySet {
        let mut out = DirtySet::default();
        for (table, buf) in &self.tables {
            for (id, state) in &buf.states {
                match state {
                    RowState::Clean => {}
                    RowState::Insert => {
                        out.inserts.push((table.clone(), buf.rows[id].clone()));
                    }
                    RowState::Update => {
                        let row = &buf.rows[id];
                        let clean = &buf.clean[id];
                        let fields = row
                            .diff(clean)
                            .into_iter()
                            .map(|i| {
                                (
                                    table.component.props()[i].name.clone(),
                                    row.get_at(i).clone(),
                                )
                            })
                            .collect::<Vec<_>>();
                        if !fields.is_empty() {
                            out.updates.push((
                                table.clone(),
                                RowPatch {
                                    id: *id,
                                    version: clean.version(),
                                    fields,
                                },
                            ));
                        }
                    }
                    RowState::Delete => {
                        out.deletes.push((table.clone(), *id, buf.clean[id].version()));
                    }
                }
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hetu_lib::{ComponentDef, PropType, TableRef, Value};
    use std::sync::Arc;

    fn table() -> TableRef {
        let def = ComponentDef::builder("test", "Item")
            .prop_unique("name", PropType::Str(16), Value::Str("".into()))
            .prop("qty", PropType::I32, Value::I32(0))
            .build()
            .unwrap();
        TableRef::new(def, "unit", 0)
    }

    fn clean_row(t: &TableRef, id: i64, name: &str) -> Row {
        let mut row = t.component.new_row();
        row.set_id(id);
        row.set_version(1);
        row.set("name", Value::Str(name.into()));
        row
    }

    #[test]
    fn clean_rows_are_not_dirty() {
        let t = table();
        let mut map = IdentityMap::new();
        map.add_clean(&t, clean_row(&t, 1, "a")).unwrap();
        assert!(!map.is_dirty());
        let (row, state) = map.get(&t, 1).unwrap();
        assert_eq!(row.id(), 1);
        assert_eq!(state, RowState::Clean);
    }

    #[test]
    fn duplicate_id_rejected() {
        let t = table();
        let mut map = IdentityMap::new();
        map.add_clean(&t, clean_row(&t, 1, "a")).unwrap();
        assert!(map.add_clean(&t, clean_row(&t, 1, "b")).is_err());
    }

    #[test]
    fn insert_requires_zero_version() {
        let t = table();
        let mut map = IdentityMap::new();
        assert!(map.add_insert(&t, clean_row(&t, 2, "x")).is_err());
        let mut row = t.component.new_row();
        row.set_id(2);
        map.add_insert(&t, row).unwrap();
        assert!(map.is_dirty());
    }

    #[test]
    fn update_of_deleted_row_is_an_error() {
        let t = table();
        let mut map = IdentityMap::new();
        let row = clean_row(&t, 3, "a");
        map.add_clean(&t, row.clone()).unwrap();
        map.mark_deleted(&t, 3).unwrap();
        assert!(map.update(&t, row).is_err());
    }

    #[test]
    fn delete_of_pending_insert_cancels_it() {
        let t = table();
        let mut map = IdentityMap::new();
        let mut row = t.component.new_row();
        row.set_id(5);
        map.add_insert(&t, row).unwrap();
        map.mark_deleted(&t, 5).unwrap();
        assert!(!map.is_dirty());
        assert!(map.get(&t, 5).is_none());
    }

    #[test]
    fn update_then_dirty_set_has_only_changed_fields() {
        let t = table();
        let mut map = IdentityMap::new();
        map.add_clean(&t, clean_row(&t, 4, "a")).unwrap();
        let mut row = map.get(&t, 4).unwrap().0.clone();
        row.set("qty", Value::I32(9));
        map.update(&t, row).unwrap();

        let dirty = map.dirty_set();
        assert_eq!(dirty.updates.len(), 1);
        let patch = &dirty.updates[0].1;
        assert_eq!(patch.id, 4);
        assert_eq!(patch.version, 1);
        assert_eq!(patch.fields, vec![("qty".to_owned(), Value::I32(9))]);
    }

    #[test]
    fn version_tamper_rejected() {
        let t = table();
        let mut map = IdentityMap::new();
        map.add_clean(&t, clean_row(&t, 6, "a")).unwrap();
        let mut row = map.get(&t, 6).unwrap().0.clone();
        row.set_version(9);
        assert!(map.update(&t, row).is_err());
    }
}
