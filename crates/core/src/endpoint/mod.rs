//! Client-facing RPC endpoints.
//!
//! An endpoint is what a client SDK can invoke by name. Most endpoints are
//! auto-generated from systems (any system with a client-reachable
//! permission); hand-written ones exist for logic that calls several systems
//! or none at all. Non-existent endpoints, bad argument counts and permission
//! failures are protocol-level offenses: the caller is disconnected.

pub mod connection;
pub mod context;
pub mod executor;

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::BoxFuture;
use hetu_lib::Value;

use crate::error::DbError;
use crate::system::SystemRegistry;

pub use connection::{ConnectionAliveChecker, ConnectionFloodChecker, connection_def, elevate};
pub use context::Context;
pub use executor::EndpointExecutor;

pub const ENDPOINT_NAME_MAX_LEN: usize = 32;

/// Payload sent back to the calling client; any other return value is
/// swallowed and paired with the "ok" sentinel.
#[derive(Clone, Debug, PartialEq)]
pub struct ResponseToClient(pub serde_json::Value);

/// Hand-written endpoint bodies are plain async fns over the connection
/// context and the decoded JSON arguments.
pub type EndpointHandler = for<'a> fn(
    &'a mut Context,
    &'a [serde_json::Value],
) -> BoxFuture<'a, Result<Option<ResponseToClient>, DbError>>;

pub(crate) enum EndpointKind {
    /// Dispatches to a system through the system executor.
    System(String),
    Custom(EndpointHandler),
}

pub struct EndpointDefine {
    pub name: String,
    kind: EndpointKind,
    pub arg_count: usize,
    pub defaults_count: usize,
}

impl EndpointDefine {
    pub(crate) fn kind(&self) -> &EndpointKind {
        &self.kind
    }

    pub fn args_ok(&self, supplied: usize) -> bool {
        let min = self.arg_count.saturating_sub(self.defaults_count);
        supplied >= min && supplied <= self.arg_count.max(min)
    }
}

/// All endpoint definitions, keyed `(namespace, name)`. Populated at app
/// load, immutable afterwards.
#[derive(Default)]
pub struct EndpointDefines {
    endpoints: HashMap<(String, String), EndpointDefine>,
}

impl EndpointDefines {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(
        &mut self,
        namespace: &str,
        name: &str,
        handler: EndpointHandler,
        arg_count: usize,
        defaults_count: usize,
    ) -> Result<(), DbError> {
        if name.len() > ENDPOINT_NAME_MAX_LEN {
            return Err(DbError::Validation(format!(
                "endpoint name `{name}` exceeds {ENDPOINT_NAME_MAX_LEN} chars"
            )));
        }
        self.insert(
            namespace,
            EndpointDefine {
                name: name.to_owned(),
                kind: EndpointKind::Custom(handler),
                arg_count,
                defaults_count,
            },
        )
    }

    fn insert(&mut self, namespace: &str, def: EndpointDefine) -> Result<(), DbError> {
        let key = (namespace.to_owned(), def.name.clone());
        if self.endpoints.contains_key(&key) {
            return Err(DbError::Validation(format!(
                "endpoint {}.{} defined twice",
                key.0, key.1
            )));
        }
        self.endpoints.insert(key, def);
        Ok(())
    }

    pub fn get(&self, namespace: &str, name: &str) -> Option<&EndpointDefine> {
        self.endpoints
            .get(&(namespace.to_owned(), name.to_owned()))
    }

    /// Auto-expose every client-reachable system of `namespace` as an
    /// endpoint of the same name. Admin-only systems stay reachable too; the
    /// permission gate runs at dispatch.
    pub fn expose_systems(
        &mut self,
        namespace: &str,
        registry: &SystemRegistry,
    ) -> Result<(), DbError> {
        let defs: Vec<(String, usize, usize)> = registry
            .systems_in(namespace)
            .map(|d| (d.name.clone(), d.arg_count, d.defaults_count))
            .collect();
        for (name, arg_count, defaults_count) in defs {
            self.insert(
                namespace,
                EndpointDefine {
                    name: name.clone(),
                    kind: EndpointKind::System(name),
                    arg_count,
                    defaults_count,
                },
            )?;
        }
        Ok(())
    }
}

/// Decode a wire JSON argument into the engine's value representation.
/// Integers become `i64`, other numbers `f64`.
pub fn json_to_value(v: &serde_json::Value) -> Result<Value, DbError> {
    match v {
        serde_json::Value::Bool(b) => Ok(Value::Bool(*b)),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Ok(Value::I64(i))
            } else if let Some(u) = n.as_u64() {
                Ok(Value::U64(u))
            } else if let Some(f) = n.as_f64() {
                Ok(Value::F64(f))
            } else {
                Err(DbError::Validation("unrepresentable number".into()))
            }
        }
        serde_json::Value::String(s) => Ok(Value::Str(s.clone())),
        other => Err(DbError::Validation(format!(
            "argument {other} is not a scalar"
        ))),
    }
}

/// Build the system executor's caller identity from a connection context.
pub fn caller_info(ctx: &Context) -> crate::system::CallerInfo {
    crate::system::CallerInfo {
        caller: ctx.caller,
        connection_id: ctx.connection_id,
        group: ctx.group.clone(),
    }
}
