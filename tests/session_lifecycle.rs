use shadowstore::schema::constants::*;
use shadowstore::{AuditEvent, DbError, MemoryLog, ReturnVal, Session, Store, StoreConfig, Value};
use std::sync::Arc;
use std::time::Duration;

fn ok(rv: ReturnVal) -> ReturnVal {
    assert!(rv.success, "unexpected failure: {rv:?}");
    rv
}

fn supergash(store: &Store) -> Session {
    let mut session = store.login(ROOT_USERNAME, "root").expect("root login");
    ok(session
        .select_persona(SUPERGASH_PERSONA_NAME, "root")
        .expect("persona"));
    session
}

#[test]
fn bad_credentials_are_refused() {
    let store = Store::open(StoreConfig::development()).expect("open");
    assert!(matches!(
        store.login(ROOT_USERNAME, "not-root"),
        Err(DbError::Authentication(_))
    ));
    assert!(matches!(
        store.login("nobody", "root"),
        Err(DbError::Authentication(_))
    ));
    assert!(store.session_ids().is_empty());
}

#[test]
fn killed_session_releases_its_checkouts() {
    let log = Arc::new(MemoryLog::default());
    let store = Store::open_with_log(StoreConfig::development(), log.clone()).expect("open");
    let mut victim = supergash(&store);
    ok(victim.open_transaction("doomed").expect("open"));
    ok(victim.edit_object(ROOT_USER).expect("edit"));
    let group = ok(victim.create_object(OWNER_BASE, None).expect("create"))
        .invid
        .expect("invid");
    ok(victim
        .set_field(group, OWNER_NAME, Some(Value::from("ops")))
        .expect("claim"));
    assert_eq!(
        store.db().shadow_holder(ROOT_USER).map(|h| h.session),
        Some(victim.id())
    );

    store.kill_session(victim.id(), "maintenance").expect("kill");
    assert!(store.db().shadow_holder(ROOT_USER).is_none());
    assert!(store.db().shadow_holder(group).is_none());
    assert!(!store.session_ids().contains(&victim.id()));

    let mut next = supergash(&store);
    ok(next.open_transaction("takeover").expect("open"));
    ok(next.edit_object(ROOT_USER).expect("edit"));
    let other = ok(next.create_object(OWNER_BASE, None).expect("create"))
        .invid
        .expect("invid");
    ok(next
        .set_field(other, OWNER_NAME, Some(Value::from("ops")))
        .expect("name is free again"));

    assert!(matches!(
        victim.open_transaction("again"),
        Err(DbError::NotLoggedIn)
    ));
    assert!(victim.is_logged_out());
    assert_eq!(
        store.db().shadow_holder(ROOT_USER).map(|h| h.session),
        Some(next.id())
    );
    let aborted = log
        .records()
        .iter()
        .filter(|r| matches!(&r.event, AuditEvent::TransactionAborted { description, .. } if description == "doomed"))
        .count();
    assert_eq!(aborted, 1);
}

#[test]
fn idle_reaping_releases_checkouts_without_the_client() {
    let store = Store::open(StoreConfig::development().with_idle_timeout_secs(1)).expect("open");
    let mut idle = supergash(&store);
    ok(idle.open_transaction("forgotten").expect("open"));
    ok(idle.edit_object(ROOT_PERSONA).expect("edit"));

    let reaped = store.db().reap_idle_sessions(i64::MAX);
    assert_eq!(reaped, vec![idle.id()]);
    assert!(store.db().shadow_holder(ROOT_PERSONA).is_none());
    assert!(matches!(idle.commit_transaction(true), Err(DbError::NotLoggedIn)));
}

#[test]
fn shutdown_aborts_open_transactions() {
    let store = Store::open(StoreConfig::development()).expect("open");
    let mut session = supergash(&store);
    ok(session.open_transaction("in flight").expect("open"));
    ok(session.edit_object(ROOT_PERSONA).expect("edit"));
    store.shutdown();
    assert!(store.db().shadow_holder(ROOT_PERSONA).is_none());
    assert!(session.transaction().is_some(), "client has not noticed yet");
    assert!(matches!(session.abort_transaction(), Err(DbError::NotLoggedIn)));
    assert!(session.transaction().is_none());
}

#[test]
fn killing_an_unknown_session_is_an_error() {
    let store = Store::open(StoreConfig::development()).expect("open");
    let mut session = supergash(&store);
    let id = session.id();
    session.logout();
    assert!(matches!(
        store.kill_session(id, "gone"),
        Err(DbError::NotFound { .. })
    ));
}

#[test]
fn logout_is_idempotent_and_aborts_open_work() {
    let store = Store::open(StoreConfig::development()).expect("open");
    let mut session = supergash(&store);
    ok(session.open_transaction("abandoned").expect("open"));
    ok(session.edit_object(ROOT_PERSONA).expect("edit"));
    session.logout();
    session.logout();
    assert!(store.db().shadow_holder(ROOT_PERSONA).is_none());
    assert!(matches!(session.abort_transaction(), Err(DbError::NotLoggedIn)));
}

#[test]
fn shutdown_disconnects_everyone_and_refuses_logins() {
    let store = Store::open(StoreConfig::development()).expect("open");
    let mut session = supergash(&store);
    store.shutdown();
    assert!(store.login(ROOT_USERNAME, "root").is_err());
    assert!(matches!(
        session.open_transaction("late"),
        Err(DbError::NotLoggedIn)
    ));
    assert!(store.session_ids().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn reaper_flags_idle_sessions_only() {
    let store = Store::open(StoreConfig::development().with_idle_timeout_secs(1)).expect("open");
    let reaper = store.start_reaper();

    let mut idle = supergash(&store);
    let mut busy = supergash(&store);
    for _ in 0..10 {
        tokio::time::sleep(Duration::from_millis(200)).await;
        busy.query(USER_BASE, |_| true).expect("busy session stays alive");
    }

    assert!(matches!(idle.query(USER_BASE, |_| true), Err(DbError::NotLoggedIn)));
    assert_eq!(store.session_ids(), vec![busy.id()]);

    store.shutdown();
    tokio::time::timeout(Duration::from_secs(5), reaper)
        .await
        .expect("reaper exits after shutdown")
        .expect("reaper task");
}
