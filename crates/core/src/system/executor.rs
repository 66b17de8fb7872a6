//! System execution under retry, with transactional call-lock dedup.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use hetu_lib::{ComponentDef, Value};
use rand::Rng;

use crate::db::repo::Repository;
use crate::db::session::Session;
use crate::error::DbError;
use crate::manager::ComponentTableManager;
use crate::snowflake::now_ms;
use crate::util::slow::SlowLog;

use super::{SystemCall, SystemDef, SystemHandler, SystemRegistry, SystemResult};

/// Who is calling: filled from the connection for client calls, synthesized
/// for internal work (future calls, startup tasks).
#[derive(Clone, Debug)]
pub struct CallerInfo {
    pub caller: i64,
    pub connection_id: i64,
    pub group: Option<String>,
}

impl CallerInfo {
    /// Internal service identity; passes every permission gate.
    pub fn internal() -> Self {
        CallerInfo {
            caller: 0,
            connection_id: 0,
            group: Some("admin:internal".into()),
        }
    }
}

/// Execution context handed to a system body: caller identity, timestamps,
/// and a repository per declared component, all bound to one session.
pub struct SystemContext {
    pub caller: i64,
    pub connection_id: i64,
    pub group: Option<String>,
    /// Wall-clock seconds at the start of this attempt.
    pub timestamp: f64,
    /// 0 on the first attempt, incremented per race retry.
    pub retry_count: u32,
    session: Arc<Session>,
    components: HashMap<String, Arc<ComponentDef>>,
    inherited: HashMap<String, SystemHandler>,
}

impl SystemContext {
    /// Repository over a declared component, by name.
    pub fn table(&self, component_name: &str) -> Result<Repository<'_>, DbError> {
        let comp = self.components.get(component_name).ok_or_else(|| {
            DbError::Validation(format!(
                "component `{component_name}` was not declared by this system"
            ))
        })?;
        Ok(self.session.using(comp))
    }

    /// Repository over a declared component.
    pub fn repo(&self, comp: &Arc<ComponentDef>) -> Result<Repository<'_>, DbError> {
        self.table(comp.name())
    }

    /// The declared component whose base schema is `base`; how bodies find
    /// their `SystemLock`/`FutureCalls` duplicates without knowing suffixes.
    pub fn component_by_base(&self, base: &str) -> Option<&Arc<ComponentDef>> {
        self.components.values().find(|c| c.base_name() == base)
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Invoke an inherited base system within the same transaction.
    pub async fn call_inherited(
        &mut self,
        name: &str,
        args: &[Value],
    ) -> Result<SystemResult, DbError> {
        let handler = self
            .inherited
            .get(name)
            .cloned()
            .ok_or_else(|| DbError::UnknownSystem(name.to_owned()))?;
        (*handler)(self, args).await
    }
}

/// Dispatches system calls. One per worker; cheap to share.
pub struct SystemExecutor {
    namespace: String,
    registry: Arc<SystemRegistry>,
    manager: Arc<ComponentTableManager>,
    slowlog: SlowLog,
}

impl SystemExecutor {
    pub fn new(
        namespace: impl Into<String>,
        registry: Arc<SystemRegistry>,
        manager: Arc<ComponentTableManager>,
    ) -> Self {
        SystemExecutor {
            namespace: namespace.into(),
            registry,
            manager,
            slowlog: SlowLog::new(),
        }
    }

    pub fn registry(&self) -> &Arc<SystemRegistry> {
        &self.registry
    }

    pub fn manager(&self) -> &Arc<ComponentTableManager> {
        &self.manager
    }

    /// Lookup + permission + argument-count validation.
    pub fn call_check(&self, caller: &CallerInfo, call: &SystemCall) -> Result<&SystemDef, DbError> {
        let def = self
            .registry
            .get_system(&self.namespace, &call.system)
            .ok_or_else(|| DbError::UnknownSystem(call.system.clone()))?;
        if !def.check_permission(caller.caller, caller.group.as_deref()) {
            log::warn!(
                "[system] {} called without permission by caller {}, possible protocol abuse",
                call.system,
                caller.caller
            );
            return Err(DbError::PermissionDenied);
        }
        let min = def.arg_count.saturating_sub(def.defaults_count);
        if call.args.len() < min || call.args.len() > def.arg_count.max(min) {
            return Err(DbError::Validation(format!(
                "{} expects between {min} and {} arguments, got {}",
                call.system,
                def.arg_count,
                call.args.len()
            )));
        }
        Ok(def)
    }

    /// Execute a system call to completion under its retry budget.
    pub async fn execute(
        &self,
        caller: &CallerInfo,
        call: &SystemCall,
    ) -> Result<SystemResult, DbError> {
        let def = self.call_check(caller, call)?.clone();
        let started = Instant::now();
        let result = self.execute_def(caller, &def, call).await;
        if let Ok((_, retries)) = &result {
            self.slowlog
                .record(&def.name, started.elapsed().as_secs_f64(), *retries);
        }
        result.map(|(r, _)| r)
    }

    async fn execute_def(
        &self,
        caller: &CallerInfo,
        def: &SystemDef,
        call: &SystemCall,
    ) -> Result<(SystemResult, u32), DbError> {
        let first = def
            .full_components
            .first()
            .ok_or_else(|| DbError::Validation(format!("system {} has no components", def.name)))?;
        let table = self
            .manager
            .get_table(first.name())
            .ok_or_else(|| DbError::Validation(format!("no table for {}", first.name())))?;
        let lock_comp = match &call.uuid {
            None => None,
            Some(_) => Some(def.lock_component().cloned().ok_or_else(|| {
                DbError::Validation(format!(
                    "system {} was invoked with a uuid but declares no SystemLock duplicate",
                    def.name
                ))
            })?),
        };

        let session = Arc::new(table.session());
        let components: HashMap<String, Arc<ComponentDef>> = def
            .full_components
            .iter()
            .map(|c| (c.name().to_owned(), c.clone()))
            .collect();
        let inherited: HashMap<String, SystemHandler> = def
            .full_bases
            .iter()
            .filter_map(|base| {
                self.registry
                    .get_system(&self.namespace, base)
                    .map(|d| (base.clone(), d.handler.clone()))
            })
            .collect();

        let attempts = def.max_retry.max(1);
        for attempt in 0..attempts {
            session.discard();
            let mut ctx = SystemContext {
                caller: caller.caller,
                connection_id: caller.connection_id,
                group: caller.group.clone(),
                timestamp: now_ms() as f64 / 1000.0,
                retry_count: attempt,
                session: session.clone(),
                components: components.clone(),
                inherited: inherited.clone(),
            };

            let outcome = self.attempt(&mut ctx, def, call, lock_comp.as_ref()).await;
            match outcome {
                Ok(Replayed::Yes) => {
                    session.discard();
                    log::debug!("[system] {} uuid replay, skipping execution", def.name);
                    return Ok((SystemResult::Ok, attempt));
                }
                Ok(Replayed::No(result)) => match session.commit().await {
                    Ok(()) => {
                        log::debug!("[system] {} committed", def.name);
                        return Ok((result, attempt));
                    }
                    Err(DbError::Race(reason)) => {
                        self.race_backoff(&def.name, &reason).await;
                    }
                    Err(e) => {
                        session.discard();
                        return Err(e);
                    }
                },
                Err(DbError::Race(reason)) => {
                    session.discard();
                    self.race_backoff(&def.name, &reason).await;
                }
                Err(e) => {
                    session.discard();
                    log::error!("[system] {} failed: {e}", def.name);
                    return Err(e);
                }
            }
        }
        log::warn!(
            "[system] {} exceeded its retry budget of {attempts}",
            def.name
        );
        Err(DbError::RetriesExceeded(attempts))
    }

    async fn attempt(
        &self,
        ctx: &mut SystemContext,
        def: &SystemDef,
        call: &SystemCall,
        lock_comp: Option<&Arc<ComponentDef>>,
    ) -> Result<Replayed, DbError> {
        // A uuid that already holds a lock row means this call is a replay:
        // exit successfully with no effect.
        if let (Some(uuid), Some(lock)) = (&call.uuid, lock_comp) {
            let repo = ctx.repo(lock)?;
            if repo
                .get("uuid", &Value::Str(uuid.clone()))
                .await?
                .is_some()
            {
                return Ok(Replayed::Yes);
            }
        }

        let handler = def.handler.clone();
        let result = (*handler)(ctx, &call.args).await?;

        // The lock row joins the same commit as the body's writes, making
        // exactly-once transactional.
        if let (Some(uuid), Some(lock)) = (&call.uuid, lock_comp) {
            let repo = ctx.repo(lock)?;
            let mut guard = repo.upsert("uuid", &Value::Str(uuid.clone())).await?;
            let row = guard.row_mut();
            row.set("name", Value::Str(truncated(&def.name, 64)));
            row.set("caller", Value::I64(ctx.caller));
            row.set("called", Value::F64(ctx.timestamp));
            guard.finish().await?;
        }
        Ok(Replayed::No(result))
    }

    async fn race_backoff(&self, name: &str, reason: &str) {
        let delay = rand::rng().random_range(0.0..0.2);
        log::debug!("[system] {name} hit a race ({reason}), retrying in {delay:.3}s");
        tokio::time::sleep(std::time::Duration::from_secs_f64(delay)).await;
    }

    /// Drop the call-lock row of a completed non-recurring future call.
    pub async fn remove_call_lock(&self, system: &str, uuid: &str) -> Result<(), DbError> {
        let Some(def) = self.registry.get_system(&self.namespace, system) else {
            return Err(DbError::UnknownSystem(system.to_owned()));
        };
        let Some(lock) = def.lock_component().cloned() else {
            return Ok(());
        };
        let Some(table) = self.manager.get_table(lock.name()) else {
            return Ok(());
        };
        let session = table.session();
        crate::db::session::run_with_retry(&session, 5, |session| {
            let lock = lock.clone();
            Box::pin(async move {
            let repo = session.using(&lock);
            if let Some(row) = repo.get("uuid", &Value::Str(uuid.to_owned())).await? {
                repo.delete(row.id())?;
            }
            Ok(())
            })
        })
        .await
    }
}

enum Replayed {
    Yes,
    No(SystemResult),
}

fn truncated(s: &str, cap: usize) -> String {
    s.chars().take(cap).collect()
}
