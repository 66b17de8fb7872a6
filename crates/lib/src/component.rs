//! Component schema definitions and the process-wide registry.
//!
//! A component is defined once at app load, canonicalized (properties sorted
//! alphabetically, hidden `id` / `_version` added), serialized to a canonical
//! JSON string and digested. The digest is what schema maintenance compares
//! against the stored table meta to detect drift.

use std::collections::HashMap;
use std::sync::Arc;

use indexmap::IndexMap;
use md5::{Digest, Md5};
use serde_json::json;

use crate::error::SchemaError;
use crate::keywords;
use crate::row::Row;
use crate::value::{PropType, Value};

/// Table-level read permission. `Owner`/`Rls` add a per-row predicate.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Permission {
    Everybody,
    User,
    Owner,
    Rls,
    Admin,
}

impl Permission {
    pub fn name(&self) -> &'static str {
        match self {
            Permission::Everybody => "EVERYBODY",
            Permission::User => "USER",
            Permission::Owner => "OWNER",
            Permission::Rls => "RLS",
            Permission::Admin => "ADMIN",
        }
    }

    pub fn is_rls(&self) -> bool {
        matches!(self, Permission::Owner | Permission::Rls)
    }
}

/// Comparator of an RLS predicate: `op(row.field, ctx.field)`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RlsOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl RlsOp {
    pub fn name(&self) -> &'static str {
        match self {
            RlsOp::Eq => "eq",
            RlsOp::Ne => "ne",
            RlsOp::Lt => "lt",
            RlsOp::Le => "le",
            RlsOp::Gt => "gt",
            RlsOp::Ge => "ge",
        }
    }

    pub fn eval(&self, a: f64, b: f64) -> bool {
        match self {
            RlsOp::Eq => a == b,
            RlsOp::Ne => a != b,
            RlsOp::Lt => a < b,
            RlsOp::Le => a <= b,
            RlsOp::Gt => a > b,
            RlsOp::Ge => a >= b,
        }
    }
}

/// Row-visibility predicate: `op(row[row_field], ctx[ctx_field])`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RlsCompare {
    pub op: RlsOp,
    pub row_field: String,
    pub ctx_field: String,
}

#[derive(Clone, Debug, PartialEq)]
pub struct PropertyDef {
    pub name: String,
    pub ty: PropType,
    pub default: Value,
    pub unique: bool,
    pub index: bool,
}

/// A typed row schema identified by `(namespace, name)`.
///
/// Immutable once built; shared as `Arc<ComponentDef>` across the engine.
#[derive(Debug)]
pub struct ComponentDef {
    namespace: String,
    name: String,
    /// Base name without a duplicate suffix; equals `name` for the master.
    base_name: String,
    /// Alphabetically ordered, `id` and `_version` included.
    props: Vec<PropertyDef>,
    prop_idx: HashMap<String, usize>,
    permission: Permission,
    rls: Option<RlsCompare>,
    volatile: bool,
    backend: String,
    json: String,
    digest: String,
}

impl PartialEq for ComponentDef {
    fn eq(&self, other: &Self) -> bool {
        self.namespace == other.namespace && self.name == other.name
    }
}
impl Eq for ComponentDef {}

impl std::hash::Hash for ComponentDef {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.namespace.hash(state);
        self.name.hash(state);
    }
}

impl ComponentDef {
    pub fn builder(namespace: impl Into<String>, name: impl Into<String>) -> ComponentBuilder {
        ComponentBuilder {
            namespace: namespace.into(),
            name: name.into(),
            base_name: None,
            props: IndexMap::new(),
            permission: Permission::User,
            rls: None,
            volatile: false,
            backend: "default".into(),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn base_name(&self) -> &str {
        &self.base_name
    }

    pub fn is_duplicate(&self) -> bool {
        self.base_name != self.name
    }

    pub fn permission(&self) -> Permission {
        self.permission
    }

    pub fn rls(&self) -> Option<&RlsCompare> {
        self.rls.as_ref()
    }

    pub fn is_rls(&self) -> bool {
        self.permission.is_rls()
    }

    pub fn volatile(&self) -> bool {
        self.volatile
    }

    pub fn backend(&self) -> &str {
        &self.backend
    }

    /// Canonical JSON of the definition.
    pub fn json(&self) -> &str {
        &self.json
    }

    /// MD5 hex digest of [`Self::json`]; the schema version stored in table meta.
    pub fn digest(&self) -> &str {
        &self.digest
    }

    pub fn props(&self) -> &[PropertyDef] {
        &self.props
    }

    pub fn prop_index(&self, name: &str) -> Option<usize> {
        self.prop_idx.get(name).copied()
    }

    pub fn prop(&self, name: &str) -> Option<&PropertyDef> {
        self.prop_index(name).map(|i| &self.props[i])
    }

    /// `unique`-flagged properties (always includes `id`).
    pub fn uniques(&self) -> impl Iterator<Item = &PropertyDef> {
        self.props.iter().filter(|p| p.unique)
    }

    /// All indexed properties (uniques included).
    pub fn indexes(&self) -> impl Iterator<Item = &PropertyDef> {
        self.props.iter().filter(|p| p.index)
    }

    pub fn has_index(&self, name: &str) -> bool {
        self.prop(name).map(|p| p.index).unwrap_or(false)
    }

    /// A fresh default row: every property at its default, `id == 0`,
    /// `_version == 0`.
    pub fn new_row(self: &Arc<Self>) -> Row {
        Row::new_default(self.clone())
    }

    /// A distinct physical table sharing this schema, named `Base:suffix`.
    ///
    /// Used by system copies to split clusters; the duplicate re-canonicalizes
    /// its own JSON so its digest differs from the master's.
    pub fn duplicate(self: &Arc<Self>, suffix: &str) -> Result<Arc<ComponentDef>, SchemaError> {
        if suffix.is_empty() && !self.is_duplicate() {
            return Ok(self.clone());
        }
        let mut b = ComponentDef::builder(
            self.namespace.clone(),
            format!("{}:{}", self.base_name, suffix),
        );
        b.base_name = Some(self.base_name.clone());
        for p in &self.props {
            if keywords::is_internal(&p.name) {
                continue;
            }
            b = b.prop_full(p.clone());
        }
        b = b
            .with_volatile(self.volatile)
            .with_backend(self.backend.clone());
        b = match self.permission {
            // OWNER re-derives its preset predicate in build().
            Permission::Rls => {
                let rls = self.rls.as_ref().ok_or(SchemaError::RlsMissing {
                    comp: self.name.clone(),
                })?;
                b.with_permission(Permission::Rls)
                    .rls(rls.op, &rls.row_field, &rls.ctx_field)
            }
            p => b.with_permission(p),
        };
        b.build()
    }
}

pub struct ComponentBuilder {
    namespace: String,
    name: String,
    base_name: Option<String>,
    props: IndexMap<String, PropertyDef>,
    permission: Permission,
    rls: Option<RlsCompare>,
    volatile: bool,
    backend: String,
}

impl ComponentBuilder {
    pub fn prop(self, name: &str, ty: PropType, default: Value) -> Self {
        self.prop_full(PropertyDef {
            name: name.to_owned(),
            ty,
            default,
            unique: false,
            index: false,
        })
    }

    pub fn prop_indexed(self, name: &str, ty: PropType, default: Value) -> Self {
        self.prop_full(PropertyDef {
            name: name.to_owned(),
            ty,
            default,
            unique: false,
            index: true,
        })
    }

    pub fn prop_unique(self, name: &str, ty: PropType, default: Value) -> Self {
        self.prop_full(PropertyDef {
            name: name.to_owned(),
            ty,
            default,
            unique: true,
            index: true,
        })
    }

    pub fn prop_full(mut self, prop: PropertyDef) -> Self {
        self.props.insert(prop.name.clone(), prop);
        self
    }

    pub fn with_permission(mut self, p: Permission) -> Self {
        self.permission = p;
        self
    }

    pub fn rls(mut self, op: RlsOp, row_field: &str, ctx_field: &str) -> Self {
        self.rls = Some(RlsCompare {
            op,
            row_field: row_field.to_owned(),
            ctx_field: ctx_field.to_owned(),
        });
        self
    }

    pub fn with_volatile(mut self, v: bool) -> Self {
        self.volatile = v;
        self
    }

    pub fn with_backend(mut self, b: impl Into<String>) -> Self {
        self.backend = b.into();
        self
    }

    pub fn build(self) -> Result<Arc<ComponentDef>, SchemaError> {
        let comp = self.name.clone();
        // Duplicates skip the keyword check on the suffixed name; the base
        // name was validated when the master was defined.
        let base = self.base_name.clone().unwrap_or_else(|| comp.clone());
        if self.base_name.is_none() && keywords::is_reserved(&base) {
            return Err(SchemaError::ReservedComponentName(base));
        }
        if self.props.is_empty() {
            return Err(SchemaError::NoProperties(comp));
        }

        let mut props: Vec<PropertyDef> = Vec::with_capacity(self.props.len() + 2);
        for (name, mut prop) in self.props {
            if keywords::is_reserved(&name) || keywords::is_internal(&name) {
                return Err(SchemaError::ReservedPropertyName {
                    comp: comp.clone(),
                    prop: name,
                });
            }
            match prop.ty {
                PropType::Str(0) | PropType::Bytes(0) => {
                    return Err(SchemaError::ZeroCapacity {
                        comp: comp.clone(),
                        prop: name,
                    });
                }
                _ => {}
            }
            if !prop.default.matches(&prop.ty) {
                return Err(SchemaError::DefaultMismatch {
                    comp: comp.clone(),
                    prop: name,
                    dtype: prop.ty.tag(),
                    found: prop.default.to_raw(),
                });
            }
            // unique implies index
            if prop.unique {
                prop.index = true;
            }
            props.push(prop);
        }

        // Hidden primary key and commit-protocol tag.
        props.push(PropertyDef {
            name: "id".into(),
            ty: PropType::I64,
            default: Value::I64(0),
            unique: true,
            index: true,
        });
        props.push(PropertyDef {
            name: "_version".into(),
            ty: PropType::I64,
            default: Value::I64(0),
            unique: false,
            index: false,
        });

        props.sort_by(|a, b| a.name.cmp(&b.name));
        let prop_idx: HashMap<String, usize> = props
            .iter()
            .enumerate()
            .map(|(i, p)| (p.name.clone(), i))
            .collect();

        let mut rls = self.rls;
        match self.permission {
            Permission::Owner => {
                if rls.is_some() {
                    return Err(SchemaError::RlsOnOwner { comp });
                }
                let owner = props
                    .iter()
                    .find(|p| p.name == "owner")
                    .ok_or_else(|| SchemaError::OwnerWithoutOwner(comp.clone()))?;
                if !owner.ty.is_numeric() {
                    return Err(SchemaError::OwnerWithoutOwner(comp));
                }
                rls = Some(RlsCompare {
                    op: RlsOp::Eq,
                    row_field: "owner".into(),
                    ctx_field: "caller".into(),
                });
            }
            Permission::Rls => {
                let rls_ref = rls.as_ref().ok_or(SchemaError::RlsMissing {
                    comp: comp.clone(),
                })?;
                if !prop_idx.contains_key(&rls_ref.row_field) {
                    return Err(SchemaError::RlsUnknownField {
                        comp,
                        field: rls_ref.row_field.clone(),
                    });
                }
            }
            _ => rls = None,
        }

        let json = canonical_json(
            &self.namespace,
            &self.name,
            self.permission,
            rls.as_ref(),
            self.volatile,
            &self.backend,
            &props,
        );
        let digest = hex::encode(Md5::digest(json.as_bytes()));

        Ok(Arc::new(ComponentDef {
            namespace: self.namespace,
            name: self.name,
            base_name: base,
            props,
            prop_idx,
            permission: self.permission,
            rls,
            volatile: self.volatile,
            backend: self.backend,
            json,
            digest,
        }))
    }
}

fn canonical_json(
    namespace: &str,
    name: &str,
    permission: Permission,
    rls: Option<&RlsCompare>,
    volatile: bool,
    backend: &str,
    props: &[PropertyDef],
) -> String {
    // serde_json's default map is key-sorted, which is exactly the canonical
    // form we want for a stable digest.
    let props_json: serde_json::Map<String, serde_json::Value> = props
        .iter()
        .map(|p| {
            (
                p.name.clone(),
                json!({
                    "default": p.default.to_json(),
                    "unique": p.unique,
                    "index": p.index,
                    "dtype": p.ty.tag(),
                }),
            )
        })
        .collect();
    json!({
        "namespace": namespace,
        "component_name": name,
        "permission": permission.name(),
        "rls_compare": rls.map(|r| vec![r.op.name().to_owned(), r.row_field.clone(), r.ctx_field.clone()]),
        "volatile": volatile,
        "backend": backend,
        "properties": props_json,
    })
    .to_string()
}

/// Process-wide collection of defined components.
///
/// Populated during app load and immutable afterwards; the engine receives it
/// as `Arc<ComponentRegistry>`.
#[derive(Default)]
pub struct ComponentRegistry {
    components: HashMap<(String, String), Arc<ComponentDef>>,
}

impl ComponentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, def: Arc<ComponentDef>) -> Result<(), SchemaError> {
        let key = (def.namespace().to_owned(), def.name().to_owned());
        if self.components.contains_key(&key) {
            return Err(SchemaError::Redefined {
                ns: key.0,
                name: key.1,
            });
        }
        self.components.insert(key, def);
        Ok(())
    }

    /// Re-registration allowed; test fixtures use this.
    pub fn add_force(&mut self, def: Arc<ComponentDef>) {
        let key = (def.namespace().to_owned(), def.name().to_owned());
        self.components.insert(key, def);
    }

    pub fn get(&self, namespace: &str, name: &str) -> Option<&Arc<ComponentDef>> {
        self.components
            .get(&(namespace.to_owned(), name.to_owned()))
    }

    pub fn all(&self) -> impl Iterator<Item = &Arc<ComponentDef>> {
        self.components.values()
    }

    /// All duplicates (and the master) of `base` within `namespace`.
    pub fn family(&self, namespace: &str, base: &str) -> Vec<Arc<ComponentDef>> {
        let mut v: Vec<_> = self
            .components
            .values()
            .filter(|c| c.namespace() == namespace && c.base_name() == base)
            .cloned()
            .collect();
        v.sort_by(|a, b| a.name().cmp(b.name()));
        v
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn item() -> Arc<ComponentDef> {
        ComponentDef::builder("test", "Item")
            .prop_unique("name", PropType::Str(16), Value::Str("".into()))
            .prop_indexed("owner", PropType::I64, Value::I64(0))
            .prop("qty", PropType::I32, Value::I32(0))
            .build()
            .unwrap()
    }

    #[test]
    fn props_are_canonicalized() {
        let def = item();
        let names: Vec<_> = def.props().iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["_version", "id", "name", "owner", "qty"]);
        assert!(def.prop("id").unwrap().unique);
        assert_eq!(def.prop("name").unwrap().ty, PropType::Str(16));
    }

    #[test]
    fn digest_is_stable_and_sensitive() {
        let a = item();
        let b = item();
        assert_eq!(a.digest(), b.digest());
        let c = ComponentDef::builder("test", "Item")
            .prop_unique("name", PropType::Str(16), Value::Str("".into()))
            .prop_indexed("owner", PropType::I64, Value::I64(0))
            .prop("qty", PropType::I64, Value::I64(0))
            .build()
            .unwrap();
        assert_ne!(a.digest(), c.digest());
    }

    #[test]
    fn reserved_names_rejected() {
        let err = ComponentDef::builder("test", "Item")
            .prop("class", PropType::I32, Value::I32(0))
            .build()
            .unwrap_err();
        assert!(matches!(err, SchemaError::ReservedPropertyName { .. }));

        let err = ComponentDef::builder("test", "Item")
            .prop("id", PropType::I64, Value::I64(0))
            .build()
            .unwrap_err();
        assert!(matches!(err, SchemaError::ReservedPropertyName { .. }));
    }

    #[test]
    fn owner_permission_presets_rls() {
        let def = ComponentDef::builder("test", "Bag")
            .prop_indexed("owner", PropType::I64, Value::I64(0))
            .with_permission(Permission::Owner)
            .build()
            .unwrap();
        let rls = def.rls().unwrap();
        assert_eq!(rls.op, RlsOp::Eq);
        assert_eq!(rls.row_field, "owner");
        assert_eq!(rls.ctx_field, "caller");

        let err = ComponentDef::builder("test", "Bag")
            .prop("x", PropType::I32, Value::I32(0))
            .with_permission(Permission::Owner)
            .build()
            .unwrap_err();
        assert!(matches!(err, SchemaError::OwnerWithoutOwner(_)));
    }

    #[test]
    fn duplicate_shares_schema_under_new_name() {
        let def = item();
        let dup = def.duplicate("gift").unwrap();
        assert_eq!(dup.name(), "Item:gift");
        assert_eq!(dup.base_name(), "Item");
        assert!(dup.is_duplicate());
        assert_eq!(dup.props().len(), def.props().len());
        assert_ne!(dup.digest(), def.digest());
    }

    #[test]
    fn registry_rejects_redefinition() {
        let mut reg = ComponentRegistry::new();
        reg.add(item()).unwrap();
        assert!(reg.add(item()).is_err());
        reg.add_force(item());
        assert!(reg.get("test", "Item").is_some());
    }
}
