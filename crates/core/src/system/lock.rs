//! The call-lock table backing exactly-once system execution.
//!
//! A system invoked with a uuid probes its `SystemLock` duplicate before
//! running and upserts a lock row *in the same commit* as its side effects,
//! which is what makes the dedup transactional: either the effects and the
//! lock land together, or neither does.

use std::sync::Arc;

use hetu_lib::{ComponentDef, Permission, PropType, Value};

use crate::db::session::run_with_retry;
use crate::error::DbError;
use crate::manager::ComponentTableManager;
use crate::snowflake::now_ms;

pub const SYSTEM_LOCK_NAME: &str = "SystemLock";

/// Seven days; lock rows older than this are leftovers from ungraceful
/// shutdowns and get deleted at startup.
const LOCK_EXPIRE_SECS: f64 = 7.0 * 86_400.0;

/// The master `SystemLock` schema. Systems wanting call-lock dedup declare a
/// [`duplicate`](ComponentDef::duplicate) of this so the lock rows join the
/// system's own cluster.
pub fn system_lock_def() -> Arc<ComponentDef> {
    ComponentDef::builder("core", SYSTEM_LOCK_NAME)
        .prop_unique("uuid", PropType::Str(32), Value::Str("".into()))
        .prop("name", PropType::Str(64), Value::Str("".into()))
        .prop("caller", PropType::I64, Value::I64(0))
        .prop_indexed("called", PropType::F64, Value::F64(0.0))
        .with_permission(Permission::Admin)
        .build()
        .expect("builtin SystemLock schema is valid")
}

/// Startup cleanup: delete lock rows older than seven days across every
/// `SystemLock` duplicate the app uses.
pub async fn clean_expired_call_locks(manager: &ComponentTableManager) -> Result<(), DbError> {
    let cutoff = now_ms() as f64 / 1000.0 - LOCK_EXPIRE_SECS;
    for table in manager.tables() {
        if table.component().base_name() != SYSTEM_LOCK_NAME {
            continue;
        }
        let comp = table.component().clone();
        let mut deleted = 0usize;
        loop {
            let session = table.session();
            let batch = run_with_retry(&session, 5, |session| {
                let comp = comp.clone();
                Box::pin(async move {
                let repo = session.using(&comp);
                let rows = repo
                    .range("called", &Value::F64(0.0), &Value::F64(cutoff), 1000, false)
                    .await?;
                for row in &rows {
                    repo.delete(row.id())?;
                }
                Ok(rows.len())
                })
            })
            .await?;
            deleted += batch;
            if batch == 0 {
                break;
            }
        }
        if deleted > 0 {
            log::info!(
                "[future] released {deleted} expired call locks from {}",
                comp.name()
            );
        }
    }
    Ok(())
}
