//! System dispatch: permissions, argument bounds, retries, call-lock dedup.

mod common;

use common::{INSTANCE, test_app};
use hetu::error::DbError;
use hetu::system::executor::CallerInfo;
use hetu::system::{SystemCall, SystemExecutor};
use hetu_lib::Value;
use std::sync::Arc;

fn user(caller: i64) -> CallerInfo {
    CallerInfo {
        caller,
        connection_id: 1,
        group: None,
    }
}

#[tokio::test]
async fn permission_gates_apply() {
    let app = test_app().await;
    let exec = SystemExecutor::new(common::NS, app.registry.clone(), app.manager.clone());

    // USER systems refuse anonymous callers.
    let call = SystemCall::new("give_gift", vec![Value::I64(42)]);
    let err = exec.execute(&user(0), &call).await.unwrap_err();
    assert!(matches!(err, DbError::PermissionDenied));

    exec.execute(&user(7), &call).await.unwrap();

    // Unknown systems are a protocol offense.
    let err = exec
        .execute(&user(7), &SystemCall::new("nope", vec![]))
        .await
        .unwrap_err();
    assert!(matches!(err, DbError::UnknownSystem(_)));

    // Argument counts are enforced.
    let err = exec
        .execute(&user(7), &SystemCall::new("give_gift", vec![]))
        .await
        .unwrap_err();
    assert!(matches!(err, DbError::Validation(_)));
}

#[tokio::test]
async fn system_side_effects_commit() {
    let app = test_app().await;
    let exec = SystemExecutor::new(common::NS, app.registry.clone(), app.manager.clone());

    exec.execute(&user(42), &SystemCall::new("give_gift", vec![Value::I64(42)]))
        .await
        .unwrap();

    let session = app.backend.session(INSTANCE, exec_cluster(&app));
    let rows = session
        .using(&app.item)
        .range("owner", &Value::I64(42), &Value::I64(42), 10, false)
        .await
        .unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].get("qty"), Some(&Value::I32(1)));
}

/// Call-lock exactly-once: any number of invocations with one uuid commits
/// the side effects at most once.
#[tokio::test]
async fn call_lock_deduplicates_by_uuid() {
    let app = test_app().await;
    let exec = SystemExecutor::new(common::NS, app.registry.clone(), app.manager.clone());

    let uuid = "a3f09c2b41d54e2f8c7d6b1a09e8d7c6";
    let call = SystemCall::new("give_gift", vec![Value::I64(99)]).with_uuid(uuid);
    for _ in 0..3 {
        exec.execute(&user(99), &call).await.unwrap();
    }

    let session = app.backend.session(INSTANCE, exec_cluster(&app));
    let rows = session
        .using(&app.item)
        .range("owner", &Value::I64(99), &Value::I64(99), 10, false)
        .await
        .unwrap();
    assert_eq!(rows.len(), 1, "the body ran exactly once");

    // Dropping the lock re-arms the uuid.
    exec.remove_call_lock("give_gift", uuid).await.unwrap();
    exec.execute(&user(99), &call).await.unwrap();
    let session = app.backend.session(INSTANCE, exec_cluster(&app));
    let rows = session
        .using(&app.item)
        .range("owner", &Value::I64(99), &Value::I64(99), 10, false)
        .await
        .unwrap();
    assert_eq!(rows.len(), 2);
}

/// A uuid on a system without a SystemLock duplicate is refused.
#[tokio::test]
async fn uuid_requires_lock_table() {
    let app = test_app().await;
    let exec = SystemExecutor::new(common::NS, app.registry.clone(), app.manager.clone());

    let setup = SystemCall::new("give_gift", vec![Value::I64(1)]);
    exec.execute(&user(1), &setup).await.unwrap();
    let row_id = {
        let session = app.backend.session(INSTANCE, exec_cluster(&app));
        let rows = session
            .using(&app.item)
            .range("owner", &Value::I64(1), &Value::I64(1), 1, false)
            .await
            .unwrap();
        rows[0].id()
    };

    let call = SystemCall::new("add_qty", vec![Value::I64(row_id)]).with_uuid("ffff");
    let err = exec.execute(&user(1), &call).await.unwrap_err();
    assert!(matches!(err, DbError::Validation(_)));
}

/// Contended increments through the executor all land (race retry works
/// under real interleaving).
#[tokio::test]
async fn contended_updates_all_land() {
    let app = test_app().await;
    let exec = Arc::new(SystemExecutor::new(
        common::NS,
        app.registry.clone(),
        app.manager.clone(),
    ));

    exec.execute(&user(5), &SystemCall::new("give_gift", vec![Value::I64(5)]))
        .await
        .unwrap();
    let row_id = {
        let session = app.backend.session(INSTANCE, exec_cluster(&app));
        session
            .using(&app.item)
            .range("owner", &Value::I64(5), &Value::I64(5), 1, false)
            .await
            .unwrap()[0]
            .id()
    };

    let mut handles = Vec::new();
    for _ in 0..4 {
        let exec = exec.clone();
        handles.push(tokio::spawn(async move {
            exec.execute(&user(5), &SystemCall::new("add_qty", vec![Value::I64(row_id)]))
                .await
        }));
    }
    for h in handles {
        h.await.unwrap().unwrap();
    }

    let session = app.backend.session(INSTANCE, exec_cluster(&app));
    let row = session
        .using(&app.item)
        .get_by_id(row_id)
        .await
        .unwrap()
        .unwrap();
    // give_gift started qty at 1; four increments follow.
    assert_eq!(row.get("qty"), Some(&Value::I32(5)));
    assert_eq!(row.version(), 5);
}

fn exec_cluster(app: &common::TestApp) -> u32 {
    app.registry
        .get_system(common::NS, "give_gift")
        .unwrap()
        .cluster_id
}
