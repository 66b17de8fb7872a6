//! The `Connection` component and its lifecycle: accept, elevate, kick.

use std::sync::Arc;

use hetu_lib::{ComponentDef, Permission, PropType, Value};

use crate::db::session::run_with_retry;
use crate::error::DbError;
use crate::manager::Table;
use crate::snowflake::now_ms;

use super::context::Context;

/// Idle window for the alive check and the relogin gate.
pub const DEFAULT_IDLE_TIMEOUT_SECS: f64 = 120.0;

/// Anonymous connections allowed per source address; loopback bypasses.
pub const DEFAULT_MAX_ANONYMOUS_PER_IP: usize = 8;

const LOOPBACK: &[&str] = &["localhost", "127.0.0.1", "::1"];

/// One row per live client connection. Volatile: stale rows from a crashed
/// head are discarded at startup.
pub fn connection_def() -> Arc<ComponentDef> {
    ComponentDef::builder("core", "Connection")
        .prop_indexed("owner", PropType::I64, Value::I64(0))
        .prop_indexed("address", PropType::Str(32), Value::Str("".into()))
        .prop("device", PropType::Str(32), Value::Str("".into()))
        .prop("device_id", PropType::Str(128), Value::Str("".into()))
        .prop("admin", PropType::Str(16), Value::Str("".into()))
        .prop("created", PropType::F64, Value::F64(0.0))
        .prop("last_active", PropType::F64, Value::F64(0.0))
        .with_permission(Permission::Admin)
        .with_volatile(true)
        .build()
        .expect("builtin Connection schema is valid")
}

fn now_secs() -> f64 {
    now_ms() as f64 / 1000.0
}

/// Allocate a `Connection` row for a fresh client. Enforces the per-IP
/// anonymous cap (internal loopback callers bypass it, e.g. the future-call
/// poller's executor).
pub async fn new_connection(
    table: &Table,
    address: &str,
    max_anonymous_per_ip: usize,
) -> Result<i64, DbError> {
    let comp = table.component().clone();
    let session = table.session();
    let address = address.to_owned();
    run_with_retry(&session, 5, |session| {
        let comp = comp.clone();
        let address = address.clone();
        Box::pin(async move {
        let repo = session.using(&comp);
        if max_anonymous_per_ip > 0 && !LOOPBACK.contains(&address.as_str()) {
            let same_ip = repo
                .range(
                    "address",
                    &Value::Str(address.clone()),
                    &Value::Str(address.clone()),
                    1000,
                    false,
                )
                .await?;
            let anonymous = same_ip
                .iter()
                .filter(|r| matches!(r.get("owner"), Some(Value::I64(0))))
                .count();
            if anonymous >= max_anonymous_per_ip {
                log::warn!(
                    "[endpoint] too many anonymous connections from {address} ({anonymous}), \
                     possible flood"
                );
                return Err(DbError::PermissionDenied);
            }
        }
        let mut row = repo.new_row().await;
        let now = now_secs();
        row.set("owner", Value::I64(0));
        row.set("address", Value::Str(address.clone()));
        row.set("created", Value::F64(now));
        row.set("last_active", Value::F64(now));
        let id = row.id();
        repo.insert(row).await?;
        Ok(id)
        })
    })
    .await
}

/// Remove the `Connection` row on disconnect. Missing rows are fine (the
/// connection may have been kicked already).
pub async fn del_connection(table: &Table, connection_id: i64) -> Result<(), DbError> {
    let comp = table.component().clone();
    let session = table.session();
    run_with_retry(&session, 5, |session| {
        let comp = comp.clone();
        Box::pin(async move {
        let repo = session.using(&comp);
        if repo.get_by_id(connection_id).await?.is_some() {
            repo.delete(connection_id)?;
        }
        Ok(())
        })
    })
    .await
}

/// Atomic login promotion.
///
/// Refuses when this connection already has a caller. When the user is
/// logged in elsewhere and still active within the idle timeout, refuses
/// unless `kick_logged_in`; kicking clears the other connection's owner in
/// the same transaction, which its next alive-check turns into a disconnect.
/// On success the caller id lands in `ctx` and the flood/subscription
/// budgets widen.
pub async fn elevate(
    table: &Table,
    ctx: &mut Context,
    user_id: i64,
    kick_logged_in: bool,
    idle_timeout: f64,
) -> Result<(bool, &'static str), DbError> {
    if ctx.connection_id == 0 {
        return Err(DbError::Validation(
            "connection not initialized before elevate".into(),
        ));
    }
    if user_id <= 0 {
        return Err(DbError::Validation("user id must be positive".into()));
    }
    if ctx.caller > 0 {
        return Ok((false, "CURRENT_CONNECTION_ALREADY_ELEVATED"));
    }

    let comp = table.component().clone();
    let session = table.session();
    let connection_id = ctx.connection_id;
    let status = run_with_retry(&session, 5, |session| {
        let comp = comp.clone();
        Box::pin(async move {
        let repo = session.using(&comp);
        if let Some(mut logged) = repo.get("owner", &Value::I64(user_id)).await? {
            let last_active = logged.get("last_active").and_then(|v| v.as_f64()).unwrap_or(0.0);
            let stale = now_secs() - last_active > idle_timeout;
            if kick_logged_in || stale {
                // Clear the other connection's owner; it gets closed on its
                // next call when the alive check sees the mismatch.
                logged.set("owner", Value::I64(0));
                repo.update(logged).await?;
            } else {
                return Ok("USER_ALREADY_LOGGED_IN");
            }
        }
        let Some(mut conn) = repo.get_by_id(connection_id).await? else {
            return Ok("CONNECTION_NOT_FOUND");
        };
        conn.set("owner", Value::I64(user_id));
        repo.update(conn).await?;
        Ok("SUCCESS")
        })
    })
    .await?;

    if status != "SUCCESS" {
        return Ok((false, status));
    }
    ctx.caller = user_id;
    ctx.widen_limits_after_login();
    Ok((true, "SUCCESS"))
}

/// Checks that the connection row still belongs to this caller; a cleared or
/// reassigned owner means the connection was kicked.
pub struct ConnectionAliveChecker {
    table: Table,
    idle_timeout: f64,
    last_active_written: f64,
}

impl ConnectionAliveChecker {
    pub fn new(table: Table, idle_timeout: f64) -> Self {
        ConnectionAliveChecker {
            table,
            idle_timeout,
            last_active_written: 0.0,
        }
    }

    /// True when the connection must be disconnected. Also refreshes
    /// `last_active`, at most once per fifth of the idle window to keep the
    /// write amplification down.
    pub async fn is_illegal(&mut self, ctx: &Context, call_info: &str) -> Result<bool, DbError> {
        if ctx.caller > 0 {
            // Not transactional on purpose: a kick racing this check just
            // means one more call executes, and commits still conflict-check.
            let conn = self.table.direct_get(ctx.connection_id).await?;
            let owner = conn
                .as_ref()
                .and_then(|c| c.get("owner"))
                .and_then(|v| v.as_i64());
            if owner != Some(ctx.caller) {
                log::warn!(
                    "[endpoint] {ctx} connection row gone or reassigned, kicked; call: {call_info}"
                );
                return Ok(true);
            }
        }
        let now = now_secs();
        if now - self.last_active_written > self.idle_timeout / 5.0 {
            self.table
                .direct_set(
                    ctx.connection_id,
                    &[("last_active".to_owned(), Value::F64(now))],
                )
                .await?;
            self.last_active_written = now;
        }
        Ok(false)
    }
}

/// Message-rate accounting against the context's envelopes. Exceeding any
/// envelope is grounds for disconnect.
#[derive(Default)]
pub struct ConnectionFloodChecker {
    received_msgs: u64,
    received_start: f64,
    sent_msgs: u64,
    sent_start: f64,
}

impl ConnectionFloodChecker {
    pub fn new() -> Self {
        let now = now_secs();
        ConnectionFloodChecker {
            received_msgs: 0,
            received_start: now,
            sent_msgs: 0,
            sent_start: now,
        }
    }

    pub fn received(&mut self, count: u64) {
        self.received_msgs += count;
    }

    pub fn sent(&mut self, count: u64) {
        self.sent_msgs += count;
    }

    pub fn recv_limit_reached(&mut self, ctx: &Context, info: &str) -> bool {
        let Some(last) = ctx.client_limits.last() else {
            return false;
        };
        let elapsed = now_secs() - self.received_start;
        for (budget, window) in &ctx.client_limits {
            if self.received_msgs > *budget && elapsed < *window {
                log::warn!(
                    "[endpoint] {ctx} received {} msgs in {elapsed:.2}s, flood suspected; {info}",
                    self.received_msgs
                );
                return true;
            }
        }
        if elapsed > last.1 {
            self.received_msgs = 0;
            self.received_start = now_secs();
        }
        false
    }

    pub fn send_limit_reached(&mut self, ctx: &Context, info: &str) -> bool {
        let Some(last) = ctx.server_limits.last() else {
            return false;
        };
        let elapsed = now_secs() - self.sent_start;
        for (budget, window) in &ctx.server_limits {
            if self.sent_msgs > *budget && elapsed < *window {
                log::warn!(
                    "[endpoint] {ctx} sent {} msgs in {elapsed:.2}s, subscription flood \
                     suspected; {info}",
                    self.sent_msgs
                );
                return true;
            }
        }
        if elapsed > last.1 {
            self.sent_msgs = 0;
            self.sent_start = now_secs();
        }
        false
    }
}
