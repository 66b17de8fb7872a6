//! Connection lifecycle: accept, elevate, kick on relogin.

mod common;

use common::test_app;
use hetu::endpoint::connection::{
    ConnectionAliveChecker, DEFAULT_IDLE_TIMEOUT_SECS, del_connection, elevate, new_connection,
};
use hetu::endpoint::context::Context;
use hetu::error::DbError;

#[tokio::test]
async fn connection_rows_are_created_and_released() {
    let app = test_app().await;
    let table = app.manager.get_table("Connection").unwrap().clone();

    let id = new_connection(&table, "10.0.0.1", 8).await.unwrap();
    assert!(table.direct_get(id).await.unwrap().is_some());

    del_connection(&table, id).await.unwrap();
    assert!(table.direct_get(id).await.unwrap().is_none());
    // Releasing twice is harmless.
    del_connection(&table, id).await.unwrap();
}

#[tokio::test]
async fn anonymous_per_ip_cap_applies_but_not_to_loopback() {
    let app = test_app().await;
    let table = app.manager.get_table("Connection").unwrap().clone();

    for _ in 0..2 {
        new_connection(&table, "10.0.0.9", 2).await.unwrap();
    }
    let err = new_connection(&table, "10.0.0.9", 2).await.unwrap_err();
    assert!(matches!(err, DbError::PermissionDenied));

    // The future-call poller and other internal callers come from loopback.
    for _ in 0..5 {
        new_connection(&table, "127.0.0.1", 2).await.unwrap();
    }
}

/// Kick on relogin: connection B elevates the same user with
/// `kick_logged_in`, connection A's next alive check fails.
#[tokio::test]
async fn relogin_kicks_the_older_connection() {
    let app = test_app().await;
    let table = app.manager.get_table("Connection").unwrap().clone();

    let mut ctx_a = Context::new();
    ctx_a.connection_id = new_connection(&table, "10.0.0.1", 8).await.unwrap();
    let (ok, status) = elevate(&table, &mut ctx_a, 1, false, DEFAULT_IDLE_TIMEOUT_SECS)
        .await
        .unwrap();
    assert!(ok, "{status}");
    assert_eq!(ctx_a.caller, 1);

    // Without kicking, the second login is refused while A is active.
    let mut ctx_b = Context::new();
    ctx_b.connection_id = new_connection(&table, "10.0.0.2", 8).await.unwrap();
    let (ok, status) = elevate(&table, &mut ctx_b, 1, false, DEFAULT_IDLE_TIMEOUT_SECS)
        .await
        .unwrap();
    assert!(!ok);
    assert_eq!(status, "USER_ALREADY_LOGGED_IN");

    // With kick_logged_in the login succeeds and A's row loses its owner.
    let (ok, _) = elevate(&table, &mut ctx_b, 1, true, DEFAULT_IDLE_TIMEOUT_SECS)
        .await
        .unwrap();
    assert!(ok);
    assert_eq!(ctx_b.caller, 1);

    let mut checker = ConnectionAliveChecker::new(table.clone(), DEFAULT_IDLE_TIMEOUT_SECS);
    assert!(checker.is_illegal(&ctx_a, "rpc").await.unwrap());
    let mut checker_b = ConnectionAliveChecker::new(table.clone(), DEFAULT_IDLE_TIMEOUT_SECS);
    assert!(!checker_b.is_illegal(&ctx_b, "rpc").await.unwrap());
}

#[tokio::test]
async fn double_elevate_is_refused() {
    let app = test_app().await;
    let table = app.manager.get_table("Connection").unwrap().clone();

    let mut ctx = Context::new();
    ctx.connection_id = new_connection(&table, "10.0.0.3", 8).await.unwrap();
    elevate(&table, &mut ctx, 2, false, DEFAULT_IDLE_TIMEOUT_SECS)
        .await
        .unwrap();
    let (ok, status) = elevate(&table, &mut ctx, 3, false, DEFAULT_IDLE_TIMEOUT_SECS)
        .await
        .unwrap();
    assert!(!ok);
    assert_eq!(status, "CURRENT_CONNECTION_ALREADY_ELEVATED");
    assert_eq!(ctx.caller, 2);
}

#[tokio::test]
async fn elevation_widens_budgets() {
    let app = test_app().await;
    let table = app.manager.get_table("Connection").unwrap().clone();

    let mut ctx = Context::new();
    ctx.configure(vec![(100, 60.0)], vec![(1000, 60.0)], 10, 2);
    ctx.connection_id = new_connection(&table, "10.0.0.4", 8).await.unwrap();
    elevate(&table, &mut ctx, 5, false, DEFAULT_IDLE_TIMEOUT_SECS)
        .await
        .unwrap();
    assert_eq!(ctx.client_limits[0].0, 1000);
    assert_eq!(ctx.server_limits[0].0, 10_000);
    assert_eq!(ctx.max_row_sub, 500);
    assert_eq!(ctx.max_index_sub, 100);
}
