//! Endpoint dispatch: the layer between decoded client frames and systems.

use std::sync::Arc;

use crate::error::DbError;
use crate::manager::Table;
use crate::system::{SystemCall, SystemExecutor, SystemResult};

use super::connection::{ConnectionAliveChecker, del_connection, new_connection};
use super::context::Context;
use super::{EndpointDefines, EndpointKind, ResponseToClient, caller_info, json_to_value};

/// One per client connection.
///
/// Errors returned from [`execute`](Self::execute) are protocol-level
/// offenses (unknown endpoint, bad arguments, dead connection); the server
/// responds by disconnecting.
pub struct EndpointExecutor {
    namespace: String,
    defines: Arc<EndpointDefines>,
    systems: Arc<SystemExecutor>,
    connection_table: Table,
    alive: ConnectionAliveChecker,
    max_anonymous_per_ip: usize,
    pub context: Context,
}

impl EndpointExecutor {
    pub fn new(
        namespace: impl Into<String>,
        defines: Arc<EndpointDefines>,
        systems: Arc<SystemExecutor>,
        connection_table: Table,
        idle_timeout: f64,
        max_anonymous_per_ip: usize,
    ) -> Self {
        EndpointExecutor {
            namespace: namespace.into(),
            defines,
            systems,
            alive: ConnectionAliveChecker::new(connection_table.clone(), idle_timeout),
            connection_table,
            max_anonymous_per_ip,
            context: Context::new(),
        }
    }

    pub fn connection_table(&self) -> &Table {
        &self.connection_table
    }

    pub fn systems(&self) -> &Arc<SystemExecutor> {
        &self.systems
    }

    /// Allocate this connection's row. Idempotent.
    pub async fn initialize(&mut self, address: &str) -> Result<(), DbError> {
        if self.context.connection_id != 0 {
            return Ok(());
        }
        let id = new_connection(&self.connection_table, address, self.max_anonymous_per_ip).await?;
        self.context.connection_id = id;
        self.context.address = Some(address.to_owned());
        Ok(())
    }

    /// Release this connection's row. Failures are logged, not raised; the
    /// socket is going away either way.
    pub async fn terminate(&mut self) {
        if self.context.connection_id == 0 {
            return;
        }
        if let Err(e) = del_connection(&self.connection_table, self.context.connection_id).await {
            log::warn!("[endpoint] {} failed to release connection: {e}", self.context);
        }
        self.context.connection_id = 0;
    }

    /// Dispatch one RPC call.
    pub async fn execute(
        &mut self,
        endpoint: &str,
        args: &[serde_json::Value],
    ) -> Result<Option<ResponseToClient>, DbError> {
        let defines = self.defines.clone();
        let def = defines
            .get(&self.namespace, endpoint)
            .ok_or_else(|| {
                log::warn!(
                    "[endpoint] {} called nonexistent endpoint `{endpoint}`, disconnecting",
                    self.context
                );
                DbError::UnknownEndpoint(endpoint.to_owned())
            })?;
        if !def.args_ok(args.len()) {
            return Err(DbError::Validation(format!(
                "{endpoint} called with {} arguments",
                args.len()
            )));
        }

        // The connection may have been kicked since the last call.
        if self.alive.is_illegal(&self.context, endpoint).await? {
            return Err(DbError::PermissionDenied);
        }

        self.context.timestamp = crate::snowflake::now_ms() as f64 / 1000.0;
        match def.kind() {
            EndpointKind::System(system) => {
                let values = args
                    .iter()
                    .map(json_to_value)
                    .collect::<Result<Vec<_>, _>>()?;
                let caller = caller_info(&self.context);
                match self
                    .systems
                    .execute(&caller, &SystemCall::new(system.clone(), values))
                    .await?
                {
                    SystemResult::Response(v) => Ok(Some(ResponseToClient(v))),
                    SystemResult::Ok => Ok(None),
                }
            }
            EndpointKind::Custom(handler) => handler(&mut self.context, args).await,
        }
    }
}
