//! The per-connection subscription broker.
//!
//! A client subscribes to a single row or an index range; the broker listens
//! on the matching notification channels, re-queries on change, applies the
//! subscriber's row-level security, and yields per-client deltas keyed by
//! subscription id.
//!
//! Known limitation: an RLS *gain* caused by a change of the RLS-compared
//! field (rather than the queried index) is not observed — the row was never
//! admitted to the tracked set, so no insert event is emitted for it.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use hetu_lib::{ComponentDef, Permission, Value};

use crate::db::backend::MqClient;
use crate::error::DbError;
use crate::manager::Table;

/// Delta payload: row id (stringified for the wire) → typed row dict, or
/// `null` for a deletion / RLS loss. Row dicts keep `id` but never carry the
/// internal `_version` commit-protocol tag.
pub type Delta = serde_json::Map<String, serde_json::Value>;

/// Per-iteration row cache keyed by channel, so overlapping subscriptions do
/// not re-read the same row. Owned by one `get_updates` call and dropped with
/// it; nothing leaks across iterations or tasks.
type RowCache = HashMap<String, Option<Delta>>;

/// The caller attributes the RLS predicate compares against.
#[derive(Clone, Debug, Default)]
pub struct RlsContext {
    pub caller: i64,
    pub admin: bool,
    /// Extra context attributes (from the connection's user data).
    pub extra: HashMap<String, f64>,
}

impl RlsContext {
    fn ctx_value(&self, field: &str) -> f64 {
        match field {
            "caller" => self.caller as f64,
            _ => self.extra.get(field).copied().unwrap_or(f64::NAN),
        }
    }

    /// Row-visibility predicate. Missing fields compare as NaN, which fails
    /// every comparison except `ne`.
    pub fn rls_check(&self, comp: &ComponentDef, row: &Delta) -> bool {
        if !comp.is_rls() || self.admin {
            return true;
        }
        let Some(rls) = comp.rls() else {
            return true;
        };
        let a = row
            .get(&rls.row_field)
            .and_then(|v| v.as_f64())
            .unwrap_or(f64::NAN);
        rls.op.eval(a, self.ctx_value(&rls.ctx_field))
    }

    /// Whether the caller may read the table at all.
    pub fn table_permission(&self, comp: &ComponentDef) -> bool {
        match comp.permission() {
            Permission::Everybody => true,
            _ if self.admin => true,
            Permission::Admin => false,
            _ => self.caller > 0,
        }
    }
}

struct RowSub {
    table: Table,
    rls: Option<RlsContext>,
    channel: String,
    row_id: i64,
}

impl RowSub {
    fn new(table: Table, ctx: &RlsContext, channel: String, row_id: i64) -> Self {
        let rls = (table.component().is_rls() && !ctx.admin).then(|| ctx.clone());
        RowSub {
            table,
            rls,
            channel,
            row_id,
        }
    }

    async fn read_through(&self, cache: &mut RowCache) -> Result<Option<Delta>, DbError> {
        if let Some(cached) = cache.get(&self.channel) {
            return Ok(cached.clone());
        }
        let dict = self
            .table
            .direct_get(self.row_id)
            .await?
            .map(|r| r.to_client_dict());
        cache.insert(self.channel.clone(), dict.clone());
        Ok(dict)
    }

    /// Re-read the row; absent or RLS-filtered rows emit `{id: null}`.
    async fn get_updated(&self, cache: &mut RowCache) -> Result<Delta, DbError> {
        let dict = self.read_through(cache).await?;
        let visible = match dict {
            None => None,
            Some(d) => match &self.rls {
                Some(ctx) if !ctx.rls_check(self.table.component(), &d) => None,
                _ => Some(d),
            },
        };
        let mut delta = Delta::new();
        delta.insert(
            self.row_id.to_string(),
            visible.map(serde_json::Value::Object).unwrap_or(serde_json::Value::Null),
        );
        Ok(delta)
    }
}

struct QueryParam {
    index: String,
    left: Value,
    right: Value,
    limit: i64,
    desc: bool,
}

struct IndexSub {
    table: Table,
    rls: Option<RlsContext>,
    index_channel: String,
    query: QueryParam,
    /// Ids the subscriber currently observes.
    last_ids: HashSet<i64>,
    row_subs: HashMap<String, RowSub>,
}

impl IndexSub {
    async fn get_updated(
        &mut self,
        channel: &str,
        cache: &mut RowCache,
    ) -> Result<(HashSet<String>, HashSet<String>, Delta), DbError> {
        if channel == self.index_channel {
            return self.index_changed(cache).await;
        }
        if let Some(row_sub) = self.row_subs.get(channel) {
            let delta = row_sub.get_updated(cache).await?;
            return Ok((HashSet::new(), HashSet::new(), delta));
        }
        // A channel we already unsubscribed from this batch; nothing to do.
        Ok((HashSet::new(), HashSet::new(), Delta::new()))
    }

    async fn index_changed(
        &mut self,
        cache: &mut RowCache,
    ) -> Result<(HashSet<String>, HashSet<String>, Delta), DbError> {
        let q = &self.query;
        let new_ids: HashSet<i64> = self
            .table
            .direct_query_ids(&q.index, &q.left, &q.right, q.limit, q.desc)
            .await?
            .into_iter()
            .collect();
        let inserts: Vec<i64> = new_ids.difference(&self.last_ids).copied().collect();
        let deletes: Vec<i64> = self.last_ids.difference(&new_ids).copied().collect();
        self.last_ids = new_ids;

        let mut new_chans = HashSet::new();
        let mut rem_chans = HashSet::new();
        let mut delta = Delta::new();

        for row_id in inserts {
            let Some(dict) = self.table.direct_get(row_id).await?.map(|r| r.to_client_dict()) else {
                // Inserted and deleted before we looked; drop silently.
                self.last_ids.remove(&row_id);
                continue;
            };
            let visible = match &self.rls {
                Some(ctx) => ctx.rls_check(self.table.component(), &dict),
                None => true,
            };
            if visible {
                delta.insert(row_id.to_string(), serde_json::Value::Object(dict));
            }
            // Track the row channel either way so a later change or deletion
            // is observed.
            let chan = self.table.table_ref.row_channel(row_id);
            new_chans.insert(chan.clone());
            let row_sub = RowSub {
                table: self.table.clone(),
                rls: self.rls.clone(),
                channel: chan.clone(),
                row_id,
            };
            self.row_subs.insert(chan, row_sub);
        }
        for row_id in deletes {
            delta.insert(row_id.to_string(), serde_json::Value::Null);
            let chan = self.table.table_ref.row_channel(row_id);
            rem_chans.insert(chan.clone());
            self.row_subs.remove(&chan);
        }
        Ok((new_chans, rem_chans, delta))
    }

    fn channels(&self) -> impl Iterator<Item = &String> {
        std::iter::once(&self.index_channel).chain(self.row_subs.keys())
    }
}

enum SubEntry {
    Row(RowSub),
    Index(IndexSub),
}

impl SubEntry {
    async fn get_updated(
        &mut self,
        channel: &str,
        cache: &mut RowCache,
    ) -> Result<(HashSet<String>, HashSet<String>, Delta), DbError> {
        match self {
            SubEntry::Row(sub) => {
                let delta = sub.get_updated(cache).await?;
                Ok((HashSet::new(), HashSet::new(), delta))
            }
            SubEntry::Index(sub) => sub.get_updated(channel, cache).await,
        }
    }

    fn channels(&self) -> Vec<String> {
        match self {
            SubEntry::Row(sub) => vec![sub.channel.clone()],
            SubEntry::Index(sub) => sub.channels().cloned().collect(),
        }
    }
}

/// All subscriptions of one client connection.
pub struct Subscriptions {
    mq: Box<dyn MqClient>,
    subs: HashMap<String, SubEntry>,
    channel_subs: HashMap<String, HashSet<String>>,
    index_sub_count: usize,
    max_row_subs: usize,
    max_index_subs: usize,
}

impl Subscriptions {
    pub fn new(mq: Box<dyn MqClient>) -> Self {
        Subscriptions {
            mq,
            subs: HashMap::new(),
            channel_subs: HashMap::new(),
            index_sub_count: 0,
            max_row_subs: usize::MAX,
            max_index_subs: usize::MAX,
        }
    }

    /// Per-connection subscription budget; elevation widens it.
    pub fn set_limits(&mut self, max_row_subs: usize, max_index_subs: usize) {
        self.max_row_subs = max_row_subs;
        self.max_index_subs = max_index_subs;
    }

    /// `(row subscriptions, index subscriptions)`.
    pub fn count(&self) -> (usize, usize) {
        (self.subs.len() - self.index_sub_count, self.index_sub_count)
    }

    /// Drive the engine's notification stream into the local queue. Must run
    /// continuously on its own task so nothing backs up engine-side.
    pub async fn pull(&self) -> Result<(), DbError> {
        self.mq.pull().await
    }

    fn fingerprint(
        comp: &ComponentDef,
        index: &str,
        left: &Value,
        right: Option<&Value>,
        limit: i64,
        desc: bool,
    ) -> String {
        let dir = if desc { -1 } else { 1 };
        let right = right.map(|v| v.to_raw()).unwrap_or_else(|| "None".into());
        format!(
            "{}.{index}[{}:{right}:{dir}][:{limit}]",
            comp.name(),
            left.to_raw()
        )
    }

    async fn register_channel(&mut self, channel: &str, sub_id: &str) -> Result<(), DbError> {
        if !self.channel_subs.contains_key(channel) {
            self.mq.subscribe(channel).await?;
        }
        self.channel_subs
            .entry(channel.to_owned())
            .or_default()
            .insert(sub_id.to_owned());
        Ok(())
    }

    async fn drop_channel(&mut self, channel: &str, sub_id: &str) -> Result<(), DbError> {
        if let Some(ids) = self.channel_subs.get_mut(channel) {
            ids.remove(sub_id);
            if ids.is_empty() {
                self.channel_subs.remove(channel);
                self.mq.unsubscribe(channel).await?;
            }
        }
        Ok(())
    }

    /// Fetch and subscribe a single row resolved through `index == value`.
    ///
    /// Returns `None` when the row does not exist, the caller lacks table
    /// permission, or RLS hides the row. Repeated registration of the same
    /// query warns and returns the existing subscription.
    pub async fn subscribe_get(
        &mut self,
        table: &Table,
        ctx: &RlsContext,
        index: &str,
        value: &Value,
    ) -> Result<Option<(String, Delta)>, DbError> {
        let comp = table.component().clone();
        if !ctx.table_permission(&comp) {
            log::warn!(
                "[sub] caller {} has no permission on {}, possible protocol abuse",
                ctx.caller,
                comp.name()
            );
            return Ok(None);
        }

        let row = if index == "id" {
            let Some(id) = value.as_i64() else {
                return Err(DbError::Validation("id must be an integer".into()));
            };
            table.direct_get(id).await?
        } else {
            table
                .direct_query(index, value, value, 1, false)
                .await?
                .into_iter()
                .next()
        };
        let Some(row) = row else {
            return Ok(None);
        };
        let dict = row.to_client_dict();
        if !ctx.rls_check(&comp, &dict) {
            return Ok(None);
        }

        let row_id = row.id();
        let sub_id = Self::fingerprint(&comp, "id", &Value::I64(row_id), None, 1, false);
        if self.subs.contains_key(&sub_id) {
            log::warn!("[sub] duplicate subscription {sub_id}, check the client code");
            return Ok(Some((sub_id, dict)));
        }
        if self.count().0 >= self.max_row_subs {
            return Err(DbError::SubscriptionLimit);
        }

        let channel = table.table_ref.row_channel(row_id);
        self.register_channel(&channel, &sub_id).await?;
        self.subs.insert(
            sub_id.clone(),
            SubEntry::Row(RowSub::new(table.clone(), ctx, channel, row_id)),
        );
        Ok(Some((sub_id, dict)))
    }

    /// Fetch and subscribe an index range.
    ///
    /// With `force` false an empty (post-RLS) result does not register a
    /// subscription. The returned rows are the initial data.
    #[allow(clippy::too_many_arguments)]
    pub async fn subscribe_range(
        &mut self,
        table: &Table,
        ctx: &RlsContext,
        index: &str,
        left: &Value,
        right: &Value,
        limit: i64,
        desc: bool,
        force: bool,
    ) -> Result<(Option<String>, Vec<Delta>), DbError> {
        let comp = table.component().clone();
        if !ctx.table_permission(&comp) {
            log::warn!(
                "[sub] caller {} has no permission on {}, possible protocol abuse",
                ctx.caller,
                comp.name()
            );
            return Ok((None, Vec::new()));
        }

        let rows: Vec<Delta> = table
            .direct_query(index, left, right, limit, desc)
            .await?
            .iter()
            .map(|r| r.to_client_dict())
            .filter(|d| ctx.rls_check(&comp, d))
            .collect();
        if !force && rows.is_empty() {
            return Ok((None, rows));
        }

        let sub_id = Self::fingerprint(&comp, index, left, Some(right), limit, desc);
        if self.subs.contains_key(&sub_id) {
            log::warn!("[sub] duplicate subscription {sub_id}, check the client code");
            return Ok((Some(sub_id), rows));
        }
        if self.count().1 >= self.max_index_subs {
            return Err(DbError::SubscriptionLimit);
        }

        let index_channel = table.table_ref.index_channel(index);
        self.register_channel(&index_channel, &sub_id).await?;

        let row_ids: HashSet<i64> = rows
            .iter()
            .filter_map(|d| d.get("id").and_then(|v| v.as_i64()))
            .collect();
        let mut idx_sub = IndexSub {
            table: table.clone(),
            rls: (comp.is_rls() && !ctx.admin).then(|| ctx.clone()),
            index_channel,
            query: QueryParam {
                index: index.to_owned(),
                left: left.clone(),
                right: right.clone(),
                limit,
                desc,
            },
            last_ids: row_ids.clone(),
            row_subs: HashMap::new(),
        };
        // Every matched row's channel is watched too, so field changes and
        // deletions are observed, not just index membership changes.
        for row_id in &row_ids {
            let chan = table.table_ref.row_channel(*row_id);
            idx_sub
                .row_subs
                .insert(chan.clone(), RowSub::new(table.clone(), ctx, chan, *row_id));
        }
        let chans: Vec<String> = idx_sub.row_subs.keys().cloned().collect();
        self.subs.insert(sub_id.clone(), SubEntry::Index(idx_sub));
        self.index_sub_count += 1;
        for chan in chans {
            self.register_channel(&chan, &sub_id).await?;
        }
        Ok((Some(sub_id), rows))
    }

    /// Cancel a subscription. Redundant unsubscribe is a no-op.
    pub async fn unsubscribe(&mut self, sub_id: &str) -> Result<(), DbError> {
        let Some(entry) = self.subs.remove(sub_id) else {
            return Ok(());
        };
        if matches!(entry, SubEntry::Index(_)) {
            self.index_sub_count -= 1;
        }
        for channel in entry.channels() {
            self.drop_channel(&channel, sub_id).await?;
        }
        Ok(())
    }

    pub async fn close(&mut self) -> Result<(), DbError> {
        let sub_ids: Vec<String> = self.subs.keys().cloned().collect();
        for sub_id in sub_ids {
            self.unsubscribe(&sub_id).await?;
        }
        Ok(())
    }

    /// Wait for the next batch of change notifications and convert them into
    /// per-subscription deltas. `timeout` of `None` blocks until a batch
    /// arrives.
    pub async fn get_updates(
        &mut self,
        timeout: Option<Duration>,
    ) -> Result<HashMap<String, Delta>, DbError> {
        let channels = match timeout {
            None => self.mq.get_message().await?,
            Some(t) => match tokio::time::timeout(t, self.mq.get_message()).await {
                Ok(batch) => batch?,
                Err(_) => return Ok(HashMap::new()),
            },
        };

        let mut cache = RowCache::new();
        let mut rtn: HashMap<String, Delta> = HashMap::new();
        for channel in channels {
            let sub_ids: Vec<String> = match self.channel_subs.get(&channel) {
                Some(ids) => ids.iter().cloned().collect(),
                None => continue,
            };
            for sub_id in sub_ids {
                let Some(entry) = self.subs.get_mut(&sub_id) else {
                    continue;
                };
                let (new_chans, rem_chans, delta) = entry.get_updated(&channel, &mut cache).await?;
                for chan in new_chans {
                    self.register_channel(&chan, &sub_id).await?;
                }
                for chan in rem_chans {
                    self.drop_channel(&chan, &sub_id).await?;
                }
                if !delta.is_empty() {
                    rtn.entry(sub_id).or_default().extend(delta);
                }
            }
        }
        Ok(rtn)
    }
}
