//! Optimistic-concurrency behavior: version races and index races.

mod common;

use common::{INSTANCE, item_def, mem_backend};
use hetu::db::session::run_with_retry;
use hetu::error::DbError;
use hetu_lib::Value;

/// Two sessions read the same row, both increment `qty`, both commit. The
/// slower one loses the version race; after the retry driver re-runs it the
/// row holds both increments and two version bumps.
#[tokio::test]
async fn lost_update_is_retried() {
    let (_, backend) = mem_backend();
    let item = item_def();

    let setup = backend.session(INSTANCE, 0);
    let repo = setup.using(&item);
    let mut row = repo.new_row().await;
    let id = row.id();
    row.set("name", Value::Str("hp".into()));
    row.set("qty", Value::I32(0));
    repo.insert(row).await.unwrap();
    setup.commit().await.unwrap();

    // Both sessions read version 1.
    let s1 = backend.session(INSTANCE, 0);
    let s2 = backend.session(INSTANCE, 0);
    let r1 = s1.using(&item).get_by_id(id).await.unwrap().unwrap();
    let r2 = s2.using(&item).get_by_id(id).await.unwrap().unwrap();
    assert_eq!(r1.version(), 1);
    assert_eq!(r2.version(), 1);

    let mut w1 = r1.clone();
    w1.set("qty", Value::I32(1));
    s1.using(&item).update(w1).await.unwrap();
    s1.commit().await.unwrap();

    let mut w2 = r2.clone();
    w2.set("qty", Value::I32(1));
    s2.using(&item).update(w2).await.unwrap();
    let err = s2.commit().await.unwrap_err();
    assert!(err.is_race());

    // The loser re-runs its body from scratch through the retry driver.
    run_with_retry(&s2, 5, |session| async move {
        let repo = session.using(&item);
        let mut row = repo.get_by_id(id).await?.ok_or(DbError::Lookup { id })?;
        let qty = match row.get("qty") {
            Some(Value::I32(q)) => *q,
            _ => 0,
        };
        row.set("qty", Value::I32(qty + 1));
        repo.update(row).await
    })
    .await
    .unwrap();

    let check = backend.session(INSTANCE, 0);
    let stored = check.using(&item).get_by_id(id).await.unwrap().unwrap();
    assert_eq!(stored.get("qty"), Some(&Value::I32(2)));
    assert_eq!(stored.version(), 3);
}

/// Concurrent sessions inserting the same unique value: exactly one commit
/// succeeds, the other surfaces as race (the pre-check saw a stale index).
#[tokio::test]
async fn concurrent_unique_insert_loses_as_race() {
    let (_, backend) = mem_backend();
    let item = item_def();

    let s1 = backend.session(INSTANCE, 0);
    let s2 = backend.session(INSTANCE, 0);

    // Both pre-checks pass: nothing is committed yet.
    let mut a = s1.using(&item).new_row().await;
    a.set("name", Value::Str("collide".into()));
    s1.using(&item).insert(a).await.unwrap();
    let mut b = s2.using(&item).new_row().await;
    b.set("name", Value::Str("collide".into()));
    s2.using(&item).insert(b).await.unwrap();

    s1.commit().await.unwrap();
    let err = s2.commit().await.unwrap_err();
    assert!(err.is_race());

    let check = backend.session(INSTANCE, 0);
    let rows = check
        .using(&item)
        .range(
            "name",
            &Value::Str("collide".into()),
            &Value::Str("collide".into()),
            10,
            false,
        )
        .await
        .unwrap();
    assert_eq!(rows.len(), 1);
}

/// The upsert anchor reclassifies a concurrent insert as a race, so the
/// retry loop converges on an update of the winner's row.
#[tokio::test]
async fn upsert_anchor_race_converges() {
    let (_, backend) = mem_backend();
    let item = item_def();

    let winner = backend.session(INSTANCE, 0);
    let loser = backend.session(INSTANCE, 0);

    // The loser opens its upsert first and finds nothing.
    let loser_repo = loser.using(&item);
    let mut guard = loser_repo
        .upsert("name", &Value::Str("crown".into()))
        .await
        .unwrap();
    guard.row_mut().set("qty", Value::I32(7));

    // Meanwhile the winner inserts the anchor value and commits.
    let repo = winner.using(&item);
    let mut row = repo.new_row().await;
    row.set("name", Value::Str("crown".into()));
    row.set("qty", Value::I32(1));
    repo.insert(row).await.unwrap();
    winner.commit().await.unwrap();

    // Finishing the loser's guard now sees the taken anchor: a race, not a
    // caller-visible unique violation.
    let err = guard.finish().await.unwrap_err();
    assert!(err.is_race());
    loser.discard();

    // The retry driver resolves it into an update of the existing row.
    run_with_retry(&loser, 5, |session| async move {
        let repo = session.using(&item);
        let mut guard = repo.upsert("name", &Value::Str("crown".into())).await?;
        guard.row_mut().set("qty", Value::I32(7));
        guard.finish().await
    })
    .await
    .unwrap();

    let check = backend.session(INSTANCE, 0);
    let rows = check
        .using(&item)
        .range(
            "name",
            &Value::Str("crown".into()),
            &Value::Str("crown".into()),
            10,
            false,
        )
        .await
        .unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].get("qty"), Some(&Value::I32(7)));
    assert_eq!(rows[0].version(), 2);
}

/// A stale delete (row updated since it was read) also loses the race.
#[tokio::test]
async fn stale_delete_is_a_race() {
    let (_, backend) = mem_backend();
    let item = item_def();

    let setup = backend.session(INSTANCE, 0);
    let repo = setup.using(&item);
    let mut row = repo.new_row().await;
    let id = row.id();
    row.set("name", Value::Str("victim".into()));
    repo.insert(row).await.unwrap();
    setup.commit().await.unwrap();

    let reader = backend.session(INSTANCE, 0);
    reader.using(&item).get_by_id(id).await.unwrap().unwrap();

    // Concurrent update bumps the version.
    let writer = backend.session(INSTANCE, 0);
    let mut w = writer.using(&item).get_by_id(id).await.unwrap().unwrap();
    w.set("qty", Value::I32(9));
    writer.using(&item).update(w).await.unwrap();
    writer.commit().await.unwrap();

    reader.using(&item).delete(id).unwrap();
    assert!(reader.commit().await.unwrap_err().is_race());
}
