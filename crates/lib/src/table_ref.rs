//! Table addressing and channel naming.

use std::fmt;
use std::sync::Arc;

use crate::component::ComponentDef;

/// Addresses one physical table: `(component, instance, cluster_id)`.
///
/// `instance` separates deployments sharing one backend; `cluster_id` selects
/// the shard group. Two references belong to the same transaction group iff
/// both match.
#[derive(Clone, Debug)]
pub struct TableRef {
    pub component: Arc<ComponentDef>,
    pub instance: String,
    pub cluster_id: u32,
}

impl PartialEq for TableRef {
    fn eq(&self, other: &Self) -> bool {
        self.component == other.component
            && self.instance == other.instance
            && self.cluster_id == other.cluster_id
    }
}
impl Eq for TableRef {}

impl std::hash::Hash for TableRef {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.component.hash(state);
        self.instance.hash(state);
        self.cluster_id.hash(state);
    }
}

impl TableRef {
    pub fn new(component: Arc<ComponentDef>, instance: impl Into<String>, cluster_id: u32) -> Self {
        TableRef {
            component,
            instance: instance.into(),
            cluster_id,
        }
    }

    pub fn comp_name(&self) -> &str {
        self.component.name()
    }

    pub fn same_txn_group(&self, other: &TableRef) -> bool {
        self.instance == other.instance && self.cluster_id == other.cluster_id
    }

    /// Key prefix without the cluster tag; the meta key hangs off this.
    pub fn table_prefix(&self) -> String {
        format!("{}:{}", self.instance, self.component.name())
    }

    /// Key prefix including the cluster hash tag, shared by every key of this
    /// table so a clustering backend co-locates them.
    pub fn cluster_prefix(&self) -> String {
        format!(
            "{}:{}:{{CLU{}}}",
            self.instance,
            self.component.name(),
            self.cluster_id
        )
    }

    /// Change-notification channel for one row.
    pub fn row_channel(&self, row_id: i64) -> String {
        format!("{}:id:{}", self.cluster_prefix(), row_id)
    }

    /// Change-notification channel for one secondary index.
    pub fn index_channel(&self, index_name: &str) -> String {
        format!("{}:index:{}", self.cluster_prefix(), index_name)
    }

    pub fn meta_key(&self) -> String {
        format!("{}:meta", self.table_prefix())
    }
}

impl fmt::Display for TableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.cluster_prefix())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::ComponentDef;
    use crate::value::{PropType, Value};

    #[test]
    fn key_naming() {
        let def = ComponentDef::builder("test", "Item")
            .prop("qty", PropType::I32, Value::I32(0))
            .build()
            .unwrap();
        let t = TableRef::new(def, "main", 2);
        assert_eq!(t.cluster_prefix(), "main:Item:{CLU2}");
        assert_eq!(t.row_channel(7), "main:Item:{CLU2}:id:7");
        assert_eq!(t.index_channel("qty"), "main:Item:{CLU2}:index:qty");
        assert_eq!(t.meta_key(), "main:Item:meta");
    }

    #[test]
    fn txn_group() {
        let def = ComponentDef::builder("test", "Item")
            .prop("qty", PropType::I32, Value::I32(0))
            .build()
            .unwrap();
        let a = TableRef::new(def.clone(), "main", 1);
        let b = TableRef::new(def.clone(), "main", 1);
        let c = TableRef::new(def, "main", 2);
        assert!(a.same_txn_group(&b));
        assert!(!a.same_txn_group(&c));
    }
}
