//! Shared fixtures: an embedded backend plus a small game-flavored app
//! (an `Item` component and a few systems) the suites exercise.
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::BoxFuture;
use hetu::db::backend::{Backend, BackendClient};
use hetu::endpoint::connection::connection_def;
use hetu::error::DbError;
use hetu::manager::ComponentTableManager;
use hetu::snowflake::SnowflakeId;
use hetu::system::executor::SystemContext;
use hetu::system::future::future_calls_def;
use hetu::system::lock::system_lock_def;
use hetu::system::{SystemDef, SystemRegistry, SystemResult};
use hetu::MemBackend;
use hetu_lib::{ComponentDef, Permission, PropType, Value};

pub const NS: &str = "test";
pub const INSTANCE: &str = "unit";

pub fn item_def() -> Arc<ComponentDef> {
    ComponentDef::builder(NS, "Item")
        .prop_unique("name", PropType::Str(16), Value::Str("".into()))
        .prop_indexed("owner", PropType::I64, Value::I64(0))
        .prop("qty", PropType::I32, Value::I32(0))
        .with_permission(Permission::Everybody)
        .build()
        .unwrap()
}

pub fn mem_backend() -> (Arc<MemBackend>, Arc<Backend>) {
    let client = Arc::new(MemBackend::new());
    let keeper = client.worker_keeper(0);
    let ids = Arc::new(SnowflakeId::from_keeper(keeper.as_ref()).unwrap());
    let backend = Arc::new(Backend::new(client.clone(), ids));
    (client, backend)
}

pub struct TestApp {
    pub client: Arc<MemBackend>,
    pub backend: Arc<Backend>,
    pub registry: Arc<SystemRegistry>,
    pub manager: Arc<ComponentTableManager>,
    pub item: Arc<ComponentDef>,
}

fn give_gift<'a>(
    ctx: &'a mut SystemContext,
    args: &'a [Value],
) -> BoxFuture<'a, Result<SystemResult, DbError>> {
    Box::pin(async move {
        let user = args
            .first()
            .and_then(|v| v.as_i64())
            .ok_or_else(|| DbError::Validation("give_gift needs a user id".into()))?;
        let repo = ctx.table("Item")?;
        let mut row = repo.new_row().await;
        row.set("name", Value::Str(format!("g{}", row.id() % 1_000_000_000_000)));
        row.set("owner", Value::I64(user));
        row.set("qty", Value::I32(1));
        repo.insert(row).await?;
        Ok(SystemResult::Ok)
    })
}

fn add_qty<'a>(
    ctx: &'a mut SystemContext,
    args: &'a [Value],
) -> BoxFuture<'a, Result<SystemResult, DbError>> {
    Box::pin(async move {
        let id = args
            .first()
            .and_then(|v| v.as_i64())
            .ok_or_else(|| DbError::Validation("add_qty needs a row id".into()))?;
        let repo = ctx.table("Item")?;
        let mut row = repo
            .get_by_id(id)
            .await?
            .ok_or(DbError::Lookup { id })?;
        let qty = match row.get("qty") {
            Some(Value::I32(q)) => *q,
            _ => 0,
        };
        row.set("qty", Value::I32(qty + 1));
        repo.update(row).await?;
        Ok(SystemResult::Response(serde_json::json!({"qty": qty + 1})))
    })
}

fn schedule_gift<'a>(
    ctx: &'a mut SystemContext,
    args: &'a [Value],
) -> BoxFuture<'a, Result<SystemResult, DbError>> {
    Box::pin(async move {
        let at = args
            .first()
            .and_then(|v| v.as_f64())
            .ok_or_else(|| DbError::Validation("schedule_gift needs a due time".into()))?;
        let user = args
            .get(1)
            .and_then(|v| v.as_i64())
            .ok_or_else(|| DbError::Validation("schedule_gift needs a user id".into()))?;
        let uuid = hetu::system::future::create_future_call(
            ctx,
            at,
            "give_gift",
            &[Value::I64(user)],
            5,
            false,
        )
        .await?;
        Ok(SystemResult::Response(serde_json::json!({ "uuid": uuid })))
    })
}

/// Build the whole app: components, clusters, tables, maintenance.
pub async fn test_app() -> TestApp {
    let (client, backend) = mem_backend();
    let item = item_def();
    let lock = system_lock_def().duplicate("give_gift").unwrap();
    let future = future_calls_def().duplicate("main").unwrap();
    let connection = connection_def();

    let mut registry = SystemRegistry::new();
    registry
        .define(
            SystemDef::builder("give_gift")
                .namespace(NS)
                .component(&item)
                .component(&lock)
                .component(&future)
                .permission(Permission::User)
                .args(1, 0)
                .max_retry(5)
                .handler(give_gift)
                .build(),
        )
        .unwrap();
    registry
        .define(
            SystemDef::builder("add_qty")
                .namespace(NS)
                .component(&item)
                .permission(Permission::User)
                .args(1, 0)
                .max_retry(8)
                .handler(add_qty)
                .build(),
        )
        .unwrap();
    registry
        .define(
            SystemDef::builder("schedule_gift")
                .namespace(NS)
                .component(&future)
                .permission(Permission::Admin)
                .args(2, 0)
                .handler(schedule_gift)
                .build(),
        )
        .unwrap();
    registry
        .define(
            SystemDef::builder("keep_connection")
                .namespace(NS)
                .component(&connection)
                .permission(Permission::Everybody)
                .args(0, 0)
                .build(),
        )
        .unwrap();
    registry.build_clusters(NS).unwrap();
    let registry = Arc::new(registry);

    let mut backends = HashMap::new();
    backends.insert("default".to_owned(), backend.clone());
    let manager = Arc::new(
        ComponentTableManager::new(NS, INSTANCE, backends, &registry.table_assignments(NS))
            .unwrap(),
    );
    manager.create_or_migrate_all(false).await.unwrap();
    manager.flush_volatile().await.unwrap();

    TestApp {
        client,
        backend,
        registry,
        manager,
        item,
    }
}
