//! Durable delayed and recurring system invocation.
//!
//! A future call is a row in the `FutureCalls` component: target system,
//! typed-encoded arguments, the due time and a redelivery timeout. Each
//! worker runs one poller task that range-pops due rows, pushes the due time
//! forward *before* executing (so a crash mid-execution re-triggers after
//! `timeout` seconds), and invokes the system with the stored uuid so the
//! call-lock makes the effects exactly-once. Recurring calls repeat forever
//! and deliberately pass no uuid: recurring ⇒ no dedup.

use std::sync::Arc;
use std::time::Duration;

use hetu_lib::{ComponentDef, Permission, PropType, Value};
use rand::Rng;
use rand::prelude::IndexedRandom;
use tokio_util::sync::CancellationToken;

use crate::db::session::run_with_retry;
use crate::error::DbError;
use crate::manager::{ComponentTableManager, Table};
use crate::snowflake::now_ms;
use crate::system::executor::{CallerInfo, SystemContext, SystemExecutor};
use crate::system::lock::{SYSTEM_LOCK_NAME, clean_expired_call_locks};
use crate::system::SystemCall;

pub const FUTURE_CALLS_NAME: &str = "FutureCalls";

/// Trigger precision is bounded below by the poller's sleep.
const POLL_INTERVAL: Duration = Duration::from_secs(1);
const MAX_ARGS_LEN: usize = 1024;

/// The master `FutureCalls` schema; systems creating future calls declare a
/// duplicate of it (like `SystemLock`) so the rows join their cluster.
pub fn future_calls_def() -> Arc<ComponentDef> {
    ComponentDef::builder("core", FUTURE_CALLS_NAME)
        .prop_indexed("owner", PropType::I64, Value::I64(0))
        .prop_unique("uuid", PropType::Str(32), Value::Str("".into()))
        .prop("system", PropType::Str(64), Value::Str("".into()))
        .prop("args", PropType::Str(MAX_ARGS_LEN as u32), Value::Str("".into()))
        .prop("recurring", PropType::Bool, Value::Bool(false))
        .prop("created", PropType::F64, Value::F64(0.0))
        .prop("last_run", PropType::F64, Value::F64(0.0))
        .prop_indexed("scheduled", PropType::F64, Value::F64(0.0))
        .prop("timeout", PropType::I32, Value::I32(60))
        .with_permission(Permission::Admin)
        .build()
        .expect("builtin FutureCalls schema is valid")
}

/// Explicit typed encoding of call arguments: a JSON array of
/// `{"t": dtype-tag, "v": wire-string}` pairs. Replaces the source-language
/// habit of `eval(repr(args))` with something validated at creation time.
pub fn encode_args(args: &[Value]) -> Result<String, DbError> {
    let items: Vec<serde_json::Value> = args
        .iter()
        .map(|v| {
            let tag = match v {
                Value::I8(_) => "i8",
                Value::I16(_) => "i16",
                Value::I32(_) => "i32",
                Value::I64(_) => "i64",
                Value::U8(_) => "u8",
                Value::U16(_) => "u16",
                Value::U32(_) => "u32",
                Value::U64(_) => "u64",
                Value::F32(_) => "f32",
                Value::F64(_) => "f64",
                Value::Bool(_) => "bool",
                Value::Str(_) => "str",
                Value::Bytes(_) => "bytes",
            };
            serde_json::json!({"t": tag, "v": v.to_raw()})
        })
        .collect();
    serde_json::to_string(&items)
        .map_err(|e| DbError::Validation(format!("arguments not encodable: {e}")))
}

pub fn decode_args(encoded: &str) -> Result<Vec<Value>, DbError> {
    let items: Vec<serde_json::Value> = serde_json::from_str(encoded)
        .map_err(|e| DbError::Validation(format!("stored arguments corrupt: {e}")))?;
    items
        .iter()
        .map(|item| {
            let tag = item.get("t").and_then(|t| t.as_str()).unwrap_or_default();
            let raw = item.get("v").and_then(|v| v.as_str()).unwrap_or_default();
            let ty = match tag {
                // str/bytes capacity is irrelevant for decoding.
                "str" => PropType::Str(u32::MAX),
                "bytes" => PropType::Bytes(u32::MAX),
                other => PropType::parse_tag(other)
                    .map_err(|_| DbError::Validation(format!("bad argument tag `{other}`")))?,
            };
            Value::from_raw(&ty, raw)
                .ok_or_else(|| DbError::Validation(format!("bad argument value `{raw}`")))
        })
        .collect()
}

/// Create a durable delayed invocation.
///
/// `at > 0` is an absolute POSIX timestamp; `at <= 0` means "in `|at|`
/// seconds". `timeout` is clamped to at least 5 s unless exactly 0 (fire at
/// most once, lost on crash); recurring calls require a nonzero timeout. The
/// target system must declare a `SystemLock` duplicate, or exactly-once
/// cannot be enforced. Returns the call's uuid.
pub async fn create_future_call(
    ctx: &mut SystemContext,
    at: f64,
    system: &str,
    args: &[Value],
    timeout: i32,
    recurring: bool,
) -> Result<String, DbError> {
    let timeout = if timeout == 0 { 0 } else { timeout.max(5) };
    if recurring && timeout == 0 {
        return Err(DbError::Validation(
            "recurring future calls need a nonzero timeout".into(),
        ));
    }
    let now = now_ms() as f64 / 1000.0;
    let scheduled = if at > 0.0 { at } else { now + at.abs() };

    let encoded = encode_args(args)?;
    if encoded.len() > MAX_ARGS_LEN {
        return Err(DbError::Validation(format!(
            "encoded arguments exceed {MAX_ARGS_LEN} chars"
        )));
    }
    // The encoding must round-trip to the exact original tuple.
    if decode_args(&encoded)? != args {
        return Err(DbError::Validation(
            "arguments do not survive the round trip".into(),
        ));
    }

    let future_comp = ctx
        .component_by_base(FUTURE_CALLS_NAME)
        .cloned()
        .ok_or_else(|| {
            DbError::Validation(
                "the calling system declares no FutureCalls duplicate".into(),
            )
        })?;

    let uuid = uuid::Uuid::new_v4().simple().to_string();
    let repo = ctx.repo(&future_comp)?;
    let mut guard = repo.upsert("uuid", &Value::Str(uuid.clone())).await?;
    {
        let row = guard.row_mut();
        row.set("owner", Value::I64(ctx.caller));
        row.set("system", Value::Str(system.to_owned()));
        row.set("args", Value::Str(encoded));
        row.set("recurring", Value::Bool(recurring));
        row.set("created", Value::F64(now));
        row.set("last_run", Value::F64(0.0));
        row.set("scheduled", Value::F64(scheduled));
        row.set("timeout", Value::I32(timeout));
    }
    guard.finish().await?;
    Ok(uuid)
}

/// Validate the target at creation time: the system must exist and carry a
/// call-lock so the poller's redelivery stays exactly-once.
pub fn check_future_target(
    executor: &SystemExecutor,
    namespace: &str,
    system: &str,
) -> Result<(), DbError> {
    let def = executor
        .registry()
        .get_system(namespace, system)
        .ok_or_else(|| DbError::UnknownSystem(system.to_owned()))?;
    if def
        .full_components
        .iter()
        .all(|c| c.base_name() != SYSTEM_LOCK_NAME)
    {
        return Err(DbError::Validation(format!(
            "future-call target {system} declares no SystemLock duplicate"
        )));
    }
    Ok(())
}

struct DueCall {
    row_id: i64,
    uuid: String,
    system: String,
    args: String,
    recurring: bool,
    timeout: i32,
}

/// Transactionally pop (or push forward) the head of one future-call table.
///
/// The double read handles a racing worker: the first query found a due row,
/// but by the time our transaction runs another worker may have consumed it.
async fn claim_due_call(table: &Table) -> Result<Option<DueCall>, DbError> {
    let comp = table.component().clone();
    let session = table.session();
    run_with_retry(&session, 5, |session| {
        let comp = comp.clone();
        Box::pin(async move {
        let repo = session.using(&comp);
        let now = now_ms() as f64 / 1000.0;
        let rows = repo
            .range("scheduled", &Value::F64(0.0), &Value::F64(now + 0.1), 1, false)
            .await?;
        let Some(row) = rows.into_iter().next() else {
            return Ok(None);
        };
        let due = DueCall {
            row_id: row.id(),
            uuid: row.get("uuid").and_then(|v| v.as_str().map(str::to_owned)).unwrap_or_default(),
            system: row.get("system").and_then(|v| v.as_str().map(str::to_owned)).unwrap_or_default(),
            args: row.get("args").and_then(|v| v.as_str().map(str::to_owned)).unwrap_or_default(),
            recurring: matches!(row.get("recurring"), Some(Value::Bool(true))),
            timeout: match row.get("timeout") {
                Some(Value::I32(t)) => *t,
                _ => 0,
            },
        };
        if due.timeout == 0 {
            // Fire at most once: consume the row now; a crash before the
            // execution finishes loses the call, as configured.
            repo.delete(due.row_id)?;
        } else {
            // Push the due time forward so a crash during execution
            // re-triggers the call after `timeout` seconds.
            let mut updated = row.clone();
            updated.set("scheduled", Value::F64(now + due.timeout as f64));
            updated.set("last_run", Value::F64(now));
            repo.update(updated).await?;
        }
        Ok(Some(due))
        })
    })
    .await
}

async fn delete_call_row(table: &Table, row_id: i64) -> Result<(), DbError> {
    let comp = table.component().clone();
    let session = table.session();
    run_with_retry(&session, 5, |session| {
        let comp = comp.clone();
        Box::pin(async move {
        let repo = session.using(&comp);
        if repo.get_by_id(row_id).await?.is_some() {
            repo.delete(row_id)?;
        }
        Ok(())
        })
    })
    .await
}

/// The per-worker poller. Runs until cancelled.
///
/// Each iteration picks one `FutureCalls` duplicate at random (load balancing
/// across workers and copies), peeks the earliest due row, sleeps to its due
/// time, claims it transactionally and invokes the target system through the
/// executor.
pub async fn future_call_task(
    executor: Arc<SystemExecutor>,
    cancel: CancellationToken,
) -> Result<(), DbError> {
    let manager = executor.manager().clone();
    clean_expired_call_locks(&manager).await?;

    let tables: Vec<Table> = manager
        .tables()
        .filter(|t| t.component().base_name() == FUTURE_CALLS_NAME)
        .cloned()
        .collect();
    if tables.is_empty() {
        log::info!("[future] no FutureCalls tables in this app, poller idle");
        cancel.cancelled().await;
        return Ok(());
    }

    // Stagger workers so they do not hammer the same second.
    let jitter = rand::rng().random_range(0.0..1.0);
    tokio::time::sleep(Duration::from_secs_f64(jitter)).await;
    log::info!("[future] poller running over {} table(s)", tables.len());

    let internal = CallerInfo::internal();
    loop {
        if cancel.is_cancelled() {
            return Ok(());
        }
        let table = tables
            .choose(&mut rand::rng())
            .cloned()
            .unwrap_or_else(|| tables[0].clone());

        // Subscription messages are lossy, so the poller never relies on
        // them: plain periodic range queries only.
        let now = now_ms() as f64 / 1000.0;
        let upcoming = table
            .direct_query("scheduled", &Value::F64(0.0), &Value::F64(now + 1.0), 1, false)
            .await?;
        let Some(head) = upcoming.first() else {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = tokio::time::sleep(POLL_INTERVAL) => continue,
            }
        };
        let due_at = match head.get("scheduled") {
            Some(Value::F64(s)) => *s,
            _ => now,
        };
        if due_at > now {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                _ = tokio::time::sleep(Duration::from_secs_f64(due_at - now)) => {}
            }
        }

        let due = match claim_due_call(&table).await {
            Ok(Some(due)) => due,
            // A racing worker consumed it first.
            Ok(None) => continue,
            Err(e) => {
                log::warn!("[future] claiming a due call failed: {e}");
                continue;
            }
        };

        let args = match decode_args(&due.args) {
            Ok(args) => args,
            Err(e) => {
                log::error!("[future] dropping call {}: {e}", due.uuid);
                continue;
            }
        };
        let call = if due.recurring {
            // Recurring runs reuse the row forever; dedup by uuid would
            // suppress every run after the first.
            SystemCall::new(due.system.clone(), args)
        } else {
            SystemCall::new(due.system.clone(), args).with_uuid(due.uuid.clone())
        };
        match executor.execute(&internal, &call).await {
            Ok(_) => {
                if !due.recurring {
                    delete_call_row(&table, due.row_id).await?;
                    executor.remove_call_lock(&due.system, &due.uuid).await?;
                }
            }
            Err(e) => {
                // Leave the row; the pushed-forward due time redelivers.
                log::error!("[future] invoking {} failed: {e}", due.system);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn args_round_trip() {
        let args = vec![
            Value::I64(42),
            Value::F64(-0.5),
            Value::Str("gift".into()),
            Value::Bool(true),
            Value::U64(u64::MAX),
        ];
        let encoded = encode_args(&args).unwrap();
        assert_eq!(decode_args(&encoded).unwrap(), args);
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(decode_args("not json").is_err());
        assert!(decode_args(r#"[{"t":"i64","v":"abc"}]"#).is_err());
    }
}
