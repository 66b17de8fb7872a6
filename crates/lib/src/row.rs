//! Self-describing rows and the row codec.
//!
//! A row is a fixed layout of values matching its component's property order.
//! The codec converts between this struct form, the raw string-dict form used
//! by storage payloads, and the typed JSON dict form used by subscription
//! pushes.

use std::collections::BTreeMap;
use std::sync::Arc;

use smallvec::SmallVec;

use crate::component::ComponentDef;
use crate::value::Value;

#[derive(Clone, Debug)]
pub struct Row {
    def: Arc<ComponentDef>,
    vals: SmallVec<[Value; 8]>,
}

impl PartialEq for Row {
    fn eq(&self, other: &Self) -> bool {
        self.def == other.def && self.vals == other.vals
    }
}

impl Row {
    pub fn new_default(def: Arc<ComponentDef>) -> Row {
        let vals = def.props().iter().map(|p| p.default.clone()).collect();
        Row { def, vals }
    }

    pub fn def(&self) -> &Arc<ComponentDef> {
        &self.def
    }

    pub fn id(&self) -> i64 {
        match self.get("id") {
            Some(Value::I64(v)) => *v,
            _ => 0,
        }
    }

    pub fn version(&self) -> i64 {
        match self.get("_version") {
            Some(Value::I64(v)) => *v,
            _ => 0,
        }
    }

    pub fn set_id(&mut self, id: i64) {
        self.set_unchecked("id", Value::I64(id));
    }

    pub fn set_version(&mut self, version: i64) {
        self.set_unchecked("_version", Value::I64(version));
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.def.prop_index(name).map(|i| &self.vals[i])
    }

    pub fn get_at(&self, idx: usize) -> &Value {
        &self.vals[idx]
    }

    /// Set a property, checking the value against the declared dtype.
    /// Returns false for unknown names or dtype mismatches.
    pub fn set(&mut self, name: &str, value: Value) -> bool {
        let Some(i) = self.def.prop_index(name) else {
            return false;
        };
        if !value.matches(&self.def.props()[i].ty) {
            return false;
        }
        self.vals[i] = value;
        true
    }

    fn set_unchecked(&mut self, name: &str, value: Value) {
        if let Some(i) = self.def.prop_index(name) {
            self.vals[i] = value;
        }
    }

    pub fn values(&self) -> &[Value] {
        &self.vals
    }

    /// Property indexes whose values differ from `other` (same component).
    pub fn diff(&self, other: &Row) -> Vec<usize> {
        debug_assert_eq!(self.def, other.def);
        (0..self.vals.len())
            .filter(|&i| self.vals[i] != other.vals[i])
            .collect()
    }

    /// Raw string-dict form: every field as its wire string.
    pub fn to_raw(&self) -> BTreeMap<String, String> {
        self.def
            .props()
            .iter()
            .zip(&self.vals)
            .map(|(p, v)| (p.name.clone(), v.to_raw()))
            .collect()
    }

    /// Decode a raw string dict. Missing fields take their defaults;
    /// undecodable fields return `None`.
    pub fn from_raw(def: &Arc<ComponentDef>, raw: &BTreeMap<String, String>) -> Option<Row> {
        let mut row = Row::new_default(def.clone());
        for (i, p) in def.props().iter().enumerate() {
            if let Some(s) = raw.get(&p.name) {
                row.vals[i] = Value::from_raw(&p.ty, s)?;
            }
        }
        Some(row)
    }

    /// Typed JSON dict form with every field, `_version` included. This is
    /// the storage-facing codec shape; it round-trips through
    /// [`from_dict`](Self::from_dict).
    pub fn to_dict(&self) -> serde_json::Map<String, serde_json::Value> {
        self.def
            .props()
            .iter()
            .zip(&self.vals)
            .map(|(p, v)| (p.name.clone(), v.to_json()))
            .collect()
    }

    /// Typed JSON dict form shipped to clients: `id` stays (subscribers key
    /// deltas by it), the `_version` commit-protocol tag is stripped.
    pub fn to_client_dict(&self) -> serde_json::Map<String, serde_json::Value> {
        self.def
            .props()
            .iter()
            .zip(&self.vals)
            .filter(|(p, _)| p.name != "_version")
            .map(|(p, v)| (p.name.clone(), v.to_json()))
            .collect()
    }

    pub fn from_dict(
        def: &Arc<ComponentDef>,
        dict: &serde_json::Map<String, serde_json::Value>,
    ) -> Option<Row> {
        let mut row = Row::new_default(def.clone());
        for (i, p) in def.props().iter().enumerate() {
            if let Some(v) = dict.get(&p.name) {
                row.vals[i] = Value::from_json(&p.ty, v)?;
            }
        }
        Some(row)
    }
}
