//! End-to-end lifecycle tests for the subscription store.

use std::sync::Arc;
use subscription_store::{
    Database, DatabaseConfig, Query, State, StoreError, SubscriptionStore, EMPTY_VERSION,
};
use tempfile::TempDir;

fn test_store(dir: &TempDir) -> (Arc<Database>, Arc<SubscriptionStore>) {
    let db = Database::open(DatabaseConfig {
        path: dir.path().join("db"),
        create_if_missing: true,
    })
    .unwrap();
    let store = SubscriptionStore::new(Arc::clone(&db));
    (db, store)
}

#[test]
fn test_fresh_commit() {
    let dir = TempDir::new().unwrap();
    let (_db, store) = test_store(&dir);

    let latest = store.get_latest().unwrap();
    assert_eq!(latest.version(), 0);
    assert_eq!(latest.state(), State::Pending);
    assert_eq!(latest.snapshot_version(), 0);
    assert!(latest.is_empty());

    let mut mutable = latest.make_mutable_copy().unwrap();
    assert_eq!(mutable.state(), State::Uncommitted);
    assert_eq!(mutable.snapshot_version(), EMPTY_VERSION);

    let (sub, inserted) = mutable
        .insert_or_assign("dogs", &Query::new("Dog", "age > 2"))
        .unwrap();
    assert!(inserted);
    assert_eq!(sub.name.as_deref(), Some("dogs"));

    let committed = mutable.commit().unwrap();
    assert_eq!(committed.version(), 1);
    assert_eq!(committed.state(), State::Pending);
    assert_eq!(committed.len(), 1);
    assert!(committed.snapshot_version() >= 0);

    let latest = store.get_latest().unwrap();
    assert_eq!(latest.version(), 1);
    assert_eq!(latest.find("dogs").unwrap().query_string, "age > 2");
}

#[test]
fn test_bootstrap_happy_path() {
    let dir = TempDir::new().unwrap();
    let (db, store) = test_store(&dir);

    let mut mutable = store.get_latest().unwrap().make_mutable_copy().unwrap();
    mutable
        .insert_or_assign("dogs", &Query::new("Dog", "age > 2"))
        .unwrap();
    let set = mutable.commit().unwrap();

    let handle = set.get_state_change_notification(State::Complete);

    let mut wt = db.begin_write();
    store.begin_bootstrap(&mut wt, 1).unwrap();
    wt.commit().unwrap();
    store.report_progress();
    assert_eq!(
        store.get_by_version(1).unwrap().state(),
        State::Bootstrapping
    );
    assert!(handle.try_recv().is_none());

    let mut wt = db.begin_write();
    store.complete_bootstrap(&mut wt, 1).unwrap();
    wt.commit().unwrap();
    store.report_progress();
    assert_eq!(store.get_by_version(1).unwrap().state(), State::AwaitingMark);
    assert!(handle.try_recv().is_none());

    store.download_complete().unwrap();
    assert_eq!(store.get_by_version(1).unwrap().state(), State::Complete);
    assert_eq!(handle.try_recv().unwrap().unwrap(), State::Complete);

    // Latest and active now agree.
    assert_eq!(store.get_active().unwrap().version(), 1);
    assert_eq!(store.get_latest().unwrap().version(), 1);
}

#[test]
fn test_supersession() {
    let dir = TempDir::new().unwrap();
    let (db, store) = test_store(&dir);

    let mut mutable = store.get_latest().unwrap().make_mutable_copy().unwrap();
    mutable
        .insert_or_assign("dogs", &Query::new("Dog", "age > 2"))
        .unwrap();
    let v1 = mutable.commit().unwrap();

    let handle = v1.get_state_change_notification(State::Complete);

    let mut mutable = store.get_latest().unwrap().make_mutable_copy().unwrap();
    mutable
        .insert_or_assign("dogs", &Query::new("Dog", "age > 10"))
        .unwrap();
    let v2 = mutable.commit().unwrap();
    assert_eq!(v2.version(), 2);

    let mut wt = db.begin_write();
    store.begin_bootstrap(&mut wt, 2).unwrap();
    store.complete_bootstrap(&mut wt, 2).unwrap();
    wt.commit().unwrap();
    store.download_complete().unwrap();

    // v1 was overtaken: reading it reports Superseded and the notifier
    // that asked for Complete resolves with Superseded instead.
    assert_eq!(store.get_by_version(1).unwrap().state(), State::Superseded);
    assert_eq!(handle.try_recv().unwrap().unwrap(), State::Superseded);
    assert_eq!(store.get_active().unwrap().version(), 2);
}

#[test]
fn test_error_path() {
    let dir = TempDir::new().unwrap();
    let (db, store) = test_store(&dir);

    let mut mutable = store.get_latest().unwrap().make_mutable_copy().unwrap();
    mutable
        .insert_or_assign("dogs", &Query::new("Dog", "age > 2"))
        .unwrap();
    let set = mutable.commit().unwrap();

    let handle = set.get_state_change_notification(State::Complete);

    store.set_error(1, "schema mismatch").unwrap();

    let errored = store.get_by_version(1).unwrap();
    assert_eq!(errored.state(), State::Error);
    assert_eq!(errored.error_message(), Some("schema mismatch"));

    match handle.try_recv().unwrap() {
        Err(StoreError::SetError(msg)) => assert_eq!(msg, "schema mismatch"),
        other => panic!("expected SetError, got {:?}", other),
    }

    // The errored version can no longer be bootstrapped.
    let mut wt = db.begin_write();
    let result = store.begin_bootstrap(&mut wt, 1);
    assert!(matches!(
        result,
        Err(StoreError::IllegalTransition {
            version: 1,
            from: State::Error,
            ..
        })
    ));
}

#[test]
fn test_cancel_bootstrap() {
    let dir = TempDir::new().unwrap();
    let (db, store) = test_store(&dir);

    let mut mutable = store.get_latest().unwrap().make_mutable_copy().unwrap();
    mutable
        .insert_or_assign("dogs", &Query::new("Dog", "age > 2"))
        .unwrap();
    mutable.commit().unwrap();

    let mut wt = db.begin_write();
    store.begin_bootstrap(&mut wt, 1).unwrap();
    store.cancel_bootstrap(&mut wt, 1).unwrap();
    wt.commit().unwrap();
    assert_eq!(store.get_by_version(1).unwrap().state(), State::Pending);

    // Not the first attempt anymore: cancel has no effect.
    let mut wt = db.begin_write();
    store.begin_bootstrap(&mut wt, 1).unwrap();
    store.cancel_bootstrap(&mut wt, 1).unwrap();
    wt.commit().unwrap();
    assert_eq!(
        store.get_by_version(1).unwrap().state(),
        State::Bootstrapping
    );
}

#[test]
fn test_reset() {
    let dir = TempDir::new().unwrap();
    let (db, store) = test_store(&dir);

    // Several commits in a mix of states.
    for (name, class) in [("dogs", "Dog"), ("cats", "Cat"), ("birds", "Bird")] {
        let mut mutable = store.get_latest().unwrap().make_mutable_copy().unwrap();
        mutable.insert_or_assign(name, &Query::new(class, "")).unwrap();
        mutable.commit().unwrap();
    }
    let mut wt = db.begin_write();
    store.begin_bootstrap(&mut wt, 2).unwrap();
    wt.commit().unwrap();

    let handle = store
        .get_by_version(3)
        .unwrap()
        .get_state_change_notification(State::Complete);

    let mut wt = db.begin_write();
    store.reset(&mut wt);
    wt.commit().unwrap();

    assert_eq!(handle.try_recv().unwrap().unwrap(), State::Superseded);

    let latest = store.get_latest().unwrap();
    assert_eq!(latest.version(), 0);
    assert!(latest.is_empty());
    assert!(store.get_pending_subscriptions().unwrap().is_empty());
}

#[test]
fn test_insert_or_assign_is_idempotent() {
    let dir = TempDir::new().unwrap();
    let (_db, store) = test_store(&dir);

    let mut mutable = store.get_latest().unwrap().make_mutable_copy().unwrap();
    let query = Query::new("Dog", "age > 2");

    let (first, inserted) = mutable.insert_or_assign("dogs", &query).unwrap();
    assert!(inserted);
    let id = first.id;
    let created_at = first.created_at;
    let updated_at = first.updated_at;

    let (second, inserted) = mutable.insert_or_assign("dogs", &query).unwrap();
    assert!(!inserted);
    assert_eq!(second.id, id);
    assert_eq!(second.created_at, created_at);
    assert!(second.updated_at >= updated_at);
    assert_eq!(mutable.len(), 1);
}

#[test]
fn test_insert_or_assign_rebinds_query() {
    let dir = TempDir::new().unwrap();
    let (_db, store) = test_store(&dir);

    let mut mutable = store.get_latest().unwrap().make_mutable_copy().unwrap();
    mutable
        .insert_or_assign("dogs", &Query::new("Dog", "age > 2"))
        .unwrap();
    let (sub, inserted) = mutable
        .insert_or_assign("dogs", &Query::new("Dog", "age > 10"))
        .unwrap();

    assert!(!inserted);
    assert_eq!(sub.query_string, "age > 10");
    assert_eq!(mutable.len(), 1);
}

#[test]
fn test_unnamed_subscriptions_dedup_by_query() {
    let dir = TempDir::new().unwrap();
    let (_db, store) = test_store(&dir);

    let mut mutable = store.get_latest().unwrap().make_mutable_copy().unwrap();
    let query = Query::new("Dog", "age > 2");

    let (_, inserted) = mutable.insert_or_assign_query(&query).unwrap();
    assert!(inserted);
    let (_, inserted) = mutable.insert_or_assign_query(&query).unwrap();
    assert!(!inserted);

    // A different query over the same class is a separate subscription.
    let (_, inserted) = mutable
        .insert_or_assign_query(&Query::new("Dog", "age > 10"))
        .unwrap();
    assert!(inserted);
    assert_eq!(mutable.len(), 2);
}

#[test]
fn test_mutable_copy_without_edits_preserves_membership() {
    let dir = TempDir::new().unwrap();
    let (_db, store) = test_store(&dir);

    let mut mutable = store.get_latest().unwrap().make_mutable_copy().unwrap();
    mutable
        .insert_or_assign("dogs", &Query::new("Dog", "age > 2"))
        .unwrap();
    mutable
        .insert_or_assign("cats", &Query::new("Cat", ""))
        .unwrap();
    let v1 = mutable.commit().unwrap();

    let v2 = v1.make_mutable_copy().unwrap().commit().unwrap();
    assert_eq!(v2.version(), 2);
    assert_eq!(v2.len(), v1.len());
    for (a, b) in v1.iter().zip(v2.iter()) {
        assert_eq!(a.id, b.id);
        assert_eq!(a.name, b.name);
        assert_eq!(a.query_string, b.query_string);
    }
}

#[test]
fn test_erase_variants() {
    let dir = TempDir::new().unwrap();
    let (_db, store) = test_store(&dir);

    let mut mutable = store.get_latest().unwrap().make_mutable_copy().unwrap();
    mutable
        .insert_or_assign("dogs", &Query::new("Dog", "age > 2"))
        .unwrap();
    mutable
        .insert_or_assign("pups", &Query::new("Dog", "age < 1"))
        .unwrap();
    mutable
        .insert_or_assign("cats", &Query::new("Cat", ""))
        .unwrap();
    let unnamed_id = mutable
        .insert_or_assign_query(&Query::new("Bird", ""))
        .unwrap()
        .0
        .id;

    assert!(mutable.erase("cats").unwrap());
    assert!(!mutable.erase("cats").unwrap());

    assert!(mutable.erase_by_id(unnamed_id).unwrap());
    assert!(!mutable.erase_by_id(unnamed_id).unwrap());

    // Removes every subscription over the class.
    assert!(mutable.erase_by_class_name("Dog").unwrap());
    assert!(mutable.is_empty());

    mutable
        .insert_or_assign("fish", &Query::new("Fish", "depth > 10"))
        .unwrap();
    assert!(mutable.erase_query(&Query::new("Fish", "depth > 10")).unwrap());
    assert!(mutable.is_empty());

    mutable.insert_or_assign("fish", &Query::new("Fish", "")).unwrap();
    mutable.clear().unwrap();
    assert!(mutable.is_empty());
}

#[test]
fn test_ext_json_roundtrip_is_stable() {
    let dir = TempDir::new().unwrap();
    let (_db, store) = test_store(&dir);

    let mut mutable = store.get_latest().unwrap().make_mutable_copy().unwrap();
    mutable
        .insert_or_assign("old-dogs", &Query::new("Dog", "age > 10"))
        .unwrap();
    mutable
        .insert_or_assign("pups", &Query::new("Dog", "age < 1"))
        .unwrap();
    mutable
        .insert_or_assign_query(&Query::new("Cat", "name != ''"))
        .unwrap();
    let set = mutable.commit().unwrap();

    let json = set.to_ext_json();
    let parsed: serde_json::Value = serde_json::from_str(&json).unwrap();
    assert_eq!(serde_json::to_string(&parsed).unwrap(), json);
}

#[test]
fn test_refresh_tracks_transitions() {
    let dir = TempDir::new().unwrap();
    let (db, store) = test_store(&dir);

    let mut mutable = store.get_latest().unwrap().make_mutable_copy().unwrap();
    mutable
        .insert_or_assign("dogs", &Query::new("Dog", "age > 2"))
        .unwrap();
    let mut set = mutable.commit().unwrap();
    assert_eq!(set.state(), State::Pending);

    let mut wt = db.begin_write();
    store.begin_bootstrap(&mut wt, 1).unwrap();
    wt.commit().unwrap();

    set.refresh().unwrap();
    assert_eq!(set.state(), State::Bootstrapping);
}
