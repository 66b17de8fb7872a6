//! Per-connection call context.

use std::collections::HashMap;

use crate::db::sub::RlsContext;

/// State of one client connection as seen by endpoints and the subscription
/// broker. Created on accept, enriched by `elevate`, dropped on disconnect.
#[derive(Clone, Debug, Default)]
pub struct Context {
    /// User id set by `elevate`; 0 means anonymous.
    pub caller: i64,
    pub connection_id: i64,
    pub address: Option<String>,
    /// Group name; only its "admin" prefix carries meaning today.
    pub group: Option<String>,
    /// Free-form per-connection data shared across systems.
    pub user_data: HashMap<String, serde_json::Value>,
    /// Wall-clock seconds of the current call.
    pub timestamp: f64,
    /// Receive-rate envelopes: `(budget, window seconds)` pairs.
    pub client_limits: Vec<(u64, f64)>,
    /// Send-rate envelopes.
    pub server_limits: Vec<(u64, f64)>,
    pub max_row_sub: usize,
    pub max_index_sub: usize,
}

impl Context {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_admin(&self) -> bool {
        self.group
            .as_deref()
            .map(|g| g.starts_with("admin"))
            .unwrap_or(false)
    }

    pub fn configure(
        &mut self,
        client_limits: Vec<(u64, f64)>,
        server_limits: Vec<(u64, f64)>,
        max_row_sub: usize,
        max_index_sub: usize,
    ) {
        self.client_limits = client_limits;
        self.server_limits = server_limits;
        self.max_row_sub = max_row_sub;
        self.max_index_sub = max_index_sub;
    }

    /// Widen every budget after a successful login: bandwidth ×10,
    /// subscription counts ×50.
    pub fn widen_limits_after_login(&mut self) {
        for (budget, _) in self.client_limits.iter_mut().chain(self.server_limits.iter_mut()) {
            *budget = budget.saturating_mul(10);
        }
        self.max_row_sub = self.max_row_sub.saturating_mul(50);
        self.max_index_sub = self.max_index_sub.saturating_mul(50);
    }

    /// Snapshot the attributes RLS predicates compare against.
    pub fn rls_context(&self) -> RlsContext {
        let extra = self
            .user_data
            .iter()
            .filter_map(|(k, v)| v.as_f64().map(|f| (k.clone(), f)))
            .collect();
        RlsContext {
            caller: self.caller,
            admin: self.is_admin(),
            extra,
        }
    }
}

impl std::fmt::Display for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "[{}|{}|{}]",
            self.connection_id,
            self.address.as_deref().unwrap_or("-"),
            self.caller
        )
    }
}
