//! The transactional session and the race-retry driver.

use std::sync::Arc;

use hetu_lib::ComponentDef;
use parking_lot::Mutex;
use rand::Rng;

use crate::db::backend::{Backend, BackendClient};
use crate::db::idmap::IdentityMap;
use crate::db::repo::Repository;
use crate::error::DbError;

pub const DEFAULT_RETRY: u32 = 5;

/// A scoped unit of work pinned to one `(instance, cluster)`.
///
/// Repository operations buffer reads and writes in the session's
/// [`IdentityMap`]; the session ends with either [`commit`](Session::commit)
/// (persist atomically) or [`discard`](Session::discard) (drop). Sessions
/// must not be nested within one logical task.
pub struct Session {
    backend: Arc<Backend>,
    instance: String,
    cluster_id: u32,
    idmap: Mutex<IdentityMap>,
}

impl Session {
    pub(crate) fn new(backend: Arc<Backend>, instance: String, cluster_id: u32) -> Self {
        Session {
            backend,
            instance,
            cluster_id,
            idmap: Mutex::new(IdentityMap::new()),
        }
    }

    pub fn instance(&self) -> &str {
        &self.instance
    }

    pub fn cluster_id(&self) -> u32 {
        self.cluster_id
    }

    pub fn backend(&self) -> &Arc<Backend> {
        &self.backend
    }

    pub(crate) fn master(&self) -> &Arc<dyn BackendClient> {
        self.backend.master()
    }

    pub(crate) fn reader(&self) -> Arc<dyn BackendClient> {
        self.backend.master_or_servant()
    }

    pub(crate) fn with_idmap<R>(&self, f: impl FnOnce(&mut IdentityMap) -> R) -> R {
        f(&mut self.idmap.lock())
    }

    /// A repository over one component within this session.
    pub fn using(&self, component: &Arc<ComponentDef>) -> Repository<'_> {
        Repository::new(self, component.clone())
    }

    pub fn is_dirty(&self) -> bool {
        self.idmap.lock().is_dirty()
    }

    /// Commit all buffered mutations atomically.
    ///
    /// On [`DbError::Race`] the caller (normally [`run_with_retry`]) discards
    /// and re-runs; on success the identity map is reset so the session can
    /// be reused for another attempt-free unit of work.
    pub async fn commit(&self) -> Result<(), DbError> {
        let dirty = {
            let map = self.idmap.lock();
            if !map.is_dirty() {
                return Ok(());
            }
            map.dirty_set()
        };
        let result = self.backend.master().commit(dirty).await;
        *self.idmap.lock() = IdentityMap::new();
        result
    }

    /// Drop all buffered state.
    pub fn discard(&self) {
        *self.idmap.lock() = IdentityMap::new();
    }
}

/// Run `body` against a fresh session state, committing on clean exit.
///
/// A race condition — raised by the commit protocol, or reclassified from an
/// upsert anchor conflict — discards the session, sleeps a small randomized
/// backoff and re-runs the body from scratch, up to `max_retry` attempts. The
/// body must be side-effect-free with respect to anything but the session.
/// Any other error short-circuits with a discard.
pub async fn run_with_retry<R>(
    session: &Session,
    max_retry: u32,
    body: impl for<'a> Fn(&'a Session) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<R, DbError>> + 'a>>,
) -> Result<R, DbError> {
    let attempts = max_retry.max(1);
    for attempt in 0..attempts {
        session.discard();
        let out: Result<R, DbError> = match body(session).await {
            Ok(value) => match session.commit().await {
                Ok(()) => return Ok(value),
                Err(e) => Err(e),
            },
            Err(e) => Err(e),
        };
        match out {
            Err(DbError::Race(reason)) => {
                session.discard();
                if attempt + 1 == attempts {
                    log::warn!("transaction lost the race {attempts} times: {reason}");
                    return Err(DbError::RetriesExceeded(attempts));
                }
                let delay = rand::rng().random_range(0.0..0.2);
                tokio::time::sleep(std::time::Duration::from_secs_f64(delay)).await;
            }
            Err(e) => {
                session.discard();
                return Err(e);
            }
            Ok(_) => unreachable!(),
        }
    }
    Err(DbError::RetriesExceeded(attempts))
}
