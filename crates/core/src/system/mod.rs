//! System definitions and cluster assignment.
//!
//! A *system* is an async procedure declared with the components it transacts
//! over. At startup the registry computes the transitive closure over
//! `(system, components ∪ base-system components)`; each closure becomes a
//! *cluster* and every component cited by one system therefore lives in one
//! transaction group, which is what makes multi-component commits atomic.

pub mod executor;
pub mod future;
pub mod lock;

use std::sync::Arc;

use futures::future::BoxFuture;
use hetu_lib::{ComponentDef, Permission, Value};
use itertools::Itertools;
use rustc_hash::{FxHashMap, FxHashSet};

use crate::error::DbError;

pub use executor::{CallerInfo, SystemContext, SystemExecutor};

/// What a system body hands back to the dispatch layer.
#[derive(Clone, Debug, PartialEq)]
pub enum SystemResult {
    /// Side effects only; the client gets the "ok" sentinel.
    Ok,
    /// Payload delivered back to the calling client.
    Response(serde_json::Value),
}

/// One invocation: target system, arguments, and the optional idempotency
/// key enforced through the system's call-lock table.
#[derive(Clone, Debug)]
pub struct SystemCall {
    pub system: String,
    pub args: Vec<Value>,
    pub uuid: Option<String>,
}

impl SystemCall {
    pub fn new(system: impl Into<String>, args: Vec<Value>) -> Self {
        SystemCall {
            system: system.into(),
            args,
            uuid: None,
        }
    }

    pub fn with_uuid(mut self, uuid: impl Into<String>) -> Self {
        self.uuid = Some(uuid.into());
        self
    }
}

pub type SystemHandler = Arc<
    dyn for<'a> Fn(&'a mut SystemContext, &'a [Value]) -> BoxFuture<'a, Result<SystemResult, DbError>>
        + Send
        + Sync,
>;

#[derive(Clone)]
pub struct SystemDef {
    pub name: String,
    pub namespace: String,
    pub components: Vec<Arc<ComponentDef>>,
    /// Direct-access components, written only through `direct_set`.
    pub non_transactions: Vec<Arc<ComponentDef>>,
    pub bases: Vec<String>,
    pub permission: Permission,
    pub max_retry: u32,
    /// Total parameter count, defaults included.
    pub arg_count: usize,
    pub defaults_count: usize,
    pub handler: SystemHandler,
    // Filled by `build_clusters`:
    pub full_components: Vec<Arc<ComponentDef>>,
    pub full_non_trx: Vec<Arc<ComponentDef>>,
    pub full_bases: Vec<String>,
    pub cluster_id: u32,
}

impl SystemDef {
    pub fn builder(name: impl Into<String>) -> SystemDefBuilder {
        SystemDefBuilder {
            def: SystemDef {
                name: name.into(),
                namespace: "default".into(),
                components: Vec::new(),
                non_transactions: Vec::new(),
                bases: Vec::new(),
                permission: Permission::User,
                max_retry: crate::db::session::DEFAULT_RETRY,
                arg_count: 0,
                defaults_count: 0,
                handler: Arc::new(|_, _| Box::pin(async { Ok(SystemResult::Ok) })),
                full_components: Vec::new(),
                full_non_trx: Vec::new(),
                full_bases: Vec::new(),
                cluster_id: 0,
            },
        }
    }

    /// The system's call-lock table, if it declared one.
    pub fn lock_component(&self) -> Option<&Arc<ComponentDef>> {
        self.full_components
            .iter()
            .find(|c| c.base_name() == lock::SYSTEM_LOCK_NAME)
    }

    pub fn check_permission(&self, caller: i64, group: Option<&str>) -> bool {
        let admin = group.map(|g| g.starts_with("admin")).unwrap_or(false);
        match self.permission {
            Permission::Everybody => true,
            _ if admin => true,
            Permission::User => caller > 0,
            Permission::Admin => false,
            // OWNER is a row-level concept; `define` refuses it on systems.
            Permission::Owner | Permission::Rls => false,
        }
    }
}

pub struct SystemDefBuilder {
    def: SystemDef,
}

impl SystemDefBuilder {
    pub fn namespace(mut self, ns: impl Into<String>) -> Self {
        self.def.namespace = ns.into();
        self
    }

    pub fn component(mut self, comp: &Arc<ComponentDef>) -> Self {
        self.def.components.push(comp.clone());
        self
    }

    pub fn non_transaction(mut self, comp: &Arc<ComponentDef>) -> Self {
        self.def.non_transactions.push(comp.clone());
        self
    }

    pub fn base(mut self, system: impl Into<String>) -> Self {
        self.def.bases.push(system.into());
        self
    }

    pub fn permission(mut self, p: Permission) -> Self {
        self.def.permission = p;
        self
    }

    pub fn max_retry(mut self, n: u32) -> Self {
        self.def.max_retry = n;
        self
    }

    pub fn args(mut self, arg_count: usize, defaults_count: usize) -> Self {
        self.def.arg_count = arg_count;
        self.def.defaults_count = defaults_count;
        self
    }

    pub fn handler<F>(mut self, f: F) -> Self
    where
        F: for<'a> Fn(&'a mut SystemContext, &'a [Value]) -> BoxFuture<'a, Result<SystemResult, DbError>>
            + Send
            + Sync
            + 'static,
    {
        self.def.handler = Arc::new(f);
        self
    }

    pub fn build(self) -> SystemDef {
        self.def
    }
}

/// A transaction group: systems whose component sets transitively overlap,
/// all assigned one shard id.
#[derive(Clone)]
pub struct Cluster {
    pub id: u32,
    pub namespace: String,
    pub components: Vec<Arc<ComponentDef>>,
    pub systems: Vec<String>,
}

/// All defined systems and, after [`build_clusters`](Self::build_clusters),
/// their cluster assignment. Registration happens at app load; the registry
/// is immutable afterwards.
#[derive(Default)]
pub struct SystemRegistry {
    systems: FxHashMap<(String, String), SystemDef>,
    clusters: FxHashMap<String, Vec<Cluster>>,
    built: bool,
}

impl SystemRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn define(&mut self, def: SystemDef) -> Result<(), DbError> {
        if self.built {
            return Err(DbError::Validation(
                "system registration after cluster build".into(),
            ));
        }
        if def.permission == Permission::Owner || def.permission == Permission::Rls {
            return Err(DbError::Validation(format!(
                "system {} cannot use a row-level permission; OWNER/RLS belong on components",
                def.name
            )));
        }
        if def.components.is_empty() {
            return Err(DbError::Validation(format!(
                "system {} must transact over at least one component",
                def.name
            )));
        }
        if def.components.iter().map(|c| c.backend()).unique().count() > 1 {
            return Err(DbError::Validation(format!(
                "system {} references components on more than one backend",
                def.name
            )));
        }
        let key = (def.namespace.clone(), def.name.clone());
        if self.systems.contains_key(&key) {
            return Err(DbError::Validation(format!(
                "system {}.{} defined twice",
                key.0, key.1
            )));
        }
        self.systems.insert(key, def);
        Ok(())
    }

    /// All systems registered under one namespace.
    pub fn systems_in(&self, namespace: &str) -> impl Iterator<Item = &SystemDef> {
        self.systems
            .iter()
            .filter(move |((ns, _), _)| ns == namespace)
            .map(|(_, def)| def)
    }

    pub fn get_system(&self, namespace: &str, name: &str) -> Option<&SystemDef> {
        self.systems
            .get(&(namespace.to_owned(), name.to_owned()))
            .or_else(|| self.systems.get(&("global".to_owned(), name.to_owned())))
    }

    pub fn clusters(&self, namespace: &str) -> &[Cluster] {
        self.clusters.get(namespace).map(|c| c.as_slice()).unwrap_or(&[])
    }

    /// `(component, cluster id)` pairs for the table manager.
    pub fn table_assignments(&self, namespace: &str) -> Vec<(Arc<ComponentDef>, u32)> {
        let mut seen = FxHashSet::default();
        let mut out = Vec::new();
        for cluster in self.clusters(namespace) {
            for comp in &cluster.components {
                if seen.insert(comp.name().to_owned()) {
                    out.push((comp.clone(), cluster.id));
                }
            }
        }
        out
    }

    /// Resolve inherited component sets, validate the definitions, and merge
    /// overlapping systems into clusters with stable ids.
    pub fn build_clusters(&mut self, main_namespace: &str) -> Result<(), DbError> {
        if self.built {
            return Err(DbError::Validation("clusters already built".into()));
        }
        // Systems in the "global" namespace replicate into every concrete
        // namespace so their clusters stay per-project.
        let globals: Vec<SystemDef> = self
            .systems
            .iter()
            .filter(|((ns, _), _)| ns == "global")
            .map(|(_, def)| def.clone())
            .collect();
        let namespaces: FxHashSet<String> = self
            .systems
            .keys()
            .map(|(ns, _)| ns.clone())
            .filter(|ns| ns != "global")
            .chain(std::iter::once(main_namespace.to_owned()))
            .collect();
        for ns in &namespaces {
            for def in &globals {
                let key = (ns.clone(), def.name.clone());
                self.systems.entry(key).or_insert_with(|| {
                    let mut copy = def.clone();
                    copy.namespace = ns.clone();
                    copy
                });
            }
        }
        self.systems.retain(|(ns, _), _| ns != "global");

        for ns in &namespaces {
            self.build_namespace(ns)?;
        }
        if !self.clusters.contains_key(main_namespace) {
            return Err(DbError::Validation(format!(
                "no systems defined under namespace `{main_namespace}`"
            )));
        }
        self.built = true;
        Ok(())
    }

    fn build_namespace(&mut self, namespace: &str) -> Result<(), DbError> {
        let names: Vec<String> = self
            .systems
            .keys()
            .filter(|(ns, _)| ns == namespace)
            .map(|(_, name)| name.clone())
            .collect();
        if names.is_empty() {
            return Ok(());
        }

        // Resolve the inherited closure of every system.
        for name in &names {
            let (comps, non_trx, bases) = self.resolve_inherited(namespace, name)?;
            let backends: FxHashSet<&str> = comps.iter().map(|c| c.backend()).collect();
            if backends.len() > 1 {
                return Err(DbError::Validation(format!(
                    "system {name} spans multiple backends through its inheritance: {:?}",
                    comps.iter().map(|c| c.name()).collect::<Vec<_>>()
                )));
            }
            let def = self
                .systems
                .get_mut(&(namespace.to_owned(), name.clone()))
                .ok_or_else(|| DbError::UnknownSystem(name.clone()))?;
            def.full_components = comps;
            def.full_non_trx = non_trx;
            def.full_bases = bases;
        }

        // Each system starts as its own cluster; merge until fixpoint.
        struct Group {
            components: FxHashSet<String>,
            systems: FxHashSet<String>,
        }
        let mut groups: Vec<Group> = names
            .iter()
            .map(|name| {
                let def = &self.systems[&(namespace.to_owned(), name.clone())];
                Group {
                    components: def
                        .full_components
                        .iter()
                        .map(|c| c.name().to_owned())
                        .collect(),
                    systems: FxHashSet::from_iter([name.clone()]),
                }
            })
            .collect();
        loop {
            let mut merged = false;
            'outer: for x in 0..groups.len() {
                for y in (x + 1)..groups.len() {
                    if !groups[x].components.is_disjoint(&groups[y].components) {
                        let Group {
                            components,
                            systems,
                        } = groups.swap_remove(y);
                        groups[x].components.extend(components);
                        groups[x].systems.extend(systems);
                        merged = true;
                        break 'outer;
                    }
                }
            }
            if !merged {
                break;
            }
        }

        // Stable ids: sort by (member count, leading member name).
        groups.sort_by_key(|g| {
            let first = g.systems.iter().min().cloned().unwrap_or_default();
            (g.systems.len(), first)
        });

        let mut clusters = Vec::with_capacity(groups.len());
        for (i, group) in groups.iter().enumerate() {
            let id = i as u32;
            let mut components: Vec<Arc<ComponentDef>> = Vec::new();
            for sys_name in &group.systems {
                let def = self
                    .systems
                    .get_mut(&(namespace.to_owned(), sys_name.clone()))
                    .ok_or_else(|| DbError::UnknownSystem(sys_name.clone()))?;
                def.cluster_id = id;
                for comp in &def.full_components {
                    if !components.iter().any(|c| c.name() == comp.name()) {
                        components.push(comp.clone());
                    }
                }
            }
            let mut systems: Vec<String> = group.systems.iter().cloned().collect();
            systems.sort();
            clusters.push(Cluster {
                id,
                namespace: namespace.to_owned(),
                components,
                systems,
            });
        }

        // A component reached only through `non_transactions` must also be
        // referenced transactionally somewhere, or it never gets a table.
        let assigned: FxHashSet<String> = clusters
            .iter()
            .flat_map(|c| c.components.iter().map(|c| c.name().to_owned()))
            .collect();
        for name in &names {
            let def = &self.systems[&(namespace.to_owned(), name.clone())];
            for comp in &def.full_non_trx {
                if !assigned.contains(comp.name()) {
                    return Err(DbError::Validation(format!(
                        "component {} is only referenced via non_transactions; \
                         at least one system must reference it transactionally",
                        comp.name()
                    )));
                }
            }
        }

        self.clusters.insert(namespace.to_owned(), clusters);
        Ok(())
    }

    fn resolve_inherited(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<(Vec<Arc<ComponentDef>>, Vec<Arc<ComponentDef>>, Vec<String>), DbError> {
        let mut comps: Vec<Arc<ComponentDef>> = Vec::new();
        let mut non_trx: Vec<Arc<ComponentDef>> = Vec::new();
        let mut bases: Vec<String> = Vec::new();
        let mut stack = vec![name.to_owned()];
        let mut visited = FxHashSet::default();
        while let Some(current) = stack.pop() {
            if !visited.insert(current.clone()) {
                continue;
            }
            let def = self
                .systems
                .get(&(namespace.to_owned(), current.clone()))
                .ok_or_else(|| {
                    DbError::Validation(format!(
                        "system {name} inherits unknown base system `{current}`"
                    ))
                })?;
            for c in &def.components {
                if !comps.iter().any(|x| x.name() == c.name()) {
                    comps.push(c.clone());
                }
            }
            for c in &def.non_transactions {
                if !non_trx.iter().any(|x| x.name() == c.name()) {
                    non_trx.push(c.clone());
                }
            }
            for base in &def.bases {
                if base != name {
                    bases.push(base.clone());
                }
                stack.push(base.clone());
            }
        }
        bases.sort();
        bases.dedup();
        Ok((comps, non_trx, bases))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hetu_lib::{PropType, Value};

    fn comp(name: &str) -> Arc<ComponentDef> {
        ComponentDef::builder("test", name)
            .prop("x", PropType::I64, Value::I64(0))
            .build()
            .unwrap()
    }

    #[test]
    fn overlapping_systems_share_a_cluster() {
        let a = comp("A");
        let b = comp("B");
        let c = comp("C");
        let mut reg = SystemRegistry::new();
        reg.define(
            SystemDef::builder("s1")
                .namespace("test")
                .component(&a)
                .component(&b)
                .build(),
        )
        .unwrap();
        reg.define(
            SystemDef::builder("s2")
                .namespace("test")
                .component(&b)
                .component(&c)
                .build(),
        )
        .unwrap();
        reg.define(SystemDef::builder("s3").namespace("test").component(&comp("D")).build())
            .unwrap();
        reg.build_clusters("test").unwrap();

        let s1 = reg.get_system("test", "s1").unwrap();
        let s2 = reg.get_system("test", "s2").unwrap();
        let s3 = reg.get_system("test", "s3").unwrap();
        assert_eq!(s1.cluster_id, s2.cluster_id);
        assert_ne!(s1.cluster_id, s3.cluster_id);
    }

    #[test]
    fn bases_pull_components_into_the_closure() {
        let a = comp("A");
        let b = comp("B");
        let mut reg = SystemRegistry::new();
        reg.define(
            SystemDef::builder("base_sys")
                .namespace("test")
                .component(&a)
                .build(),
        )
        .unwrap();
        reg.define(
            SystemDef::builder("child")
                .namespace("test")
                .component(&b)
                .base("base_sys")
                .build(),
        )
        .unwrap();
        reg.build_clusters("test").unwrap();

        let child = reg.get_system("test", "child").unwrap();
        let names: Vec<&str> = child.full_components.iter().map(|c| c.name()).collect();
        assert!(names.contains(&"A"));
        assert!(names.contains(&"B"));
        assert_eq!(
            child.cluster_id,
            reg.get_system("test", "base_sys").unwrap().cluster_id
        );
    }

    #[test]
    fn unknown_base_is_refused() {
        let mut reg = SystemRegistry::new();
        reg.define(
            SystemDef::builder("child")
                .namespace("test")
                .component(&comp("A"))
                .base("missing")
                .build(),
        )
        .unwrap();
        assert!(reg.build_clusters("test").is_err());
    }

    #[test]
    fn row_level_permissions_forbidden_on_systems() {
        let mut reg = SystemRegistry::new();
        let def = SystemDef::builder("s")
            .namespace("test")
            .component(&comp("A"))
            .permission(Permission::Owner)
            .build();
        assert!(reg.define(def).is_err());
    }

    #[test]
    fn cluster_ids_are_stable() {
        let build = || {
            let mut reg = SystemRegistry::new();
            for name in ["alpha", "beta", "gamma"] {
                let c = comp(&format!("C_{name}"));
                reg.define(
                    SystemDef::builder(name)
                        .namespace("test")
                        .component(&c)
                        .build(),
                )
                .unwrap();
            }
            reg.build_clusters("test").unwrap();
            ["alpha", "beta", "gamma"]
                .iter()
                .map(|n| reg.get_system("test", n).unwrap().cluster_id)
                .collect::<Vec<_>>()
        };
        assert_eq!(build(), build());
    }
}
