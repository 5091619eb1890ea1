use super::Store;
use crate::config::StoreConfig;
use crate::field::{FieldOp, Value};
use crate::invid::Invid;
use crate::log::{AuditEvent, MemoryLog};
use crate::object::{EditObject, HookContext, ObjectStatus, ObjectTypeBehavior, ObjectView, WizardOutcome};
use crate::returnval::{FailureKind, ReturnVal};
use crate::schema::constants::*;
use crate::schema::{FieldDef, FieldKind, ObjectTypeDef};
use crate::session::Session;
use crate::store::now_millis;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;

const HOST: u16 = FIRST_USER_TYPE;
const HOST_NAME: u16 = 100;
const HOST_ALIASES: u16 = 101;
const HOST_INTERFACES: u16 = 102;

const INTERFACE: u16 = FIRST_USER_TYPE + 1;
const IFACE_ADDRESS: u16 = 100;

const LEASE: u16 = FIRST_USER_TYPE + 2;
const LEASE_NAME: u16 = 100;

/// Asks before any lease is renamed to "production", requires a name and may
/// be inactivated.
struct LeaseBehavior;

impl ObjectTypeBehavior for LeaseBehavior {
    fn can_inactivate(&self, _ctx: &HookContext<'_>, _obj: &dyn ObjectView) -> bool {
        true
    }

    fn field_required(&self, _ctx: &HookContext<'_>, _obj: &dyn ObjectView, field: &FieldDef) -> bool {
        field.id == LEASE_NAME
    }

    fn wizard_hook(&self, _ctx: &HookContext<'_>, _obj: &EditObject, op: &FieldOp) -> WizardOutcome {
        match op {
            FieldOp::Set {
                field: LEASE_NAME,
                value: Some(value),
            } if value.as_text() == Some("production") => WizardOutcome::Confirm {
                title: "Rename lease".into(),
                text: "production leases are billed".into(),
            },
            _ => WizardOutcome::Continue(Default::default()),
        }
    }
}

fn open_with_log() -> (Store, Arc<MemoryLog>) {
    let log = Arc::new(MemoryLog::default());
    let store = Store::open_with_log(StoreConfig::development(), log.clone()).expect("open store");
    store.declare_namespace("hostname", true).expect("namespace");
    store
        .register_type(
            ObjectTypeDef::new(HOST, "host")
                .with_field(FieldDef::text(HOST_NAME, "name").namespace("hostname"))
                .with_field(FieldDef::text(HOST_ALIASES, "aliases").vector())
                .with_field(
                    FieldDef::invid(HOST_INTERFACES, "interfaces")
                        .vector()
                        .symmetric(INTERFACE, CONTAINER_FIELD),
                )
                .with_label(HOST_NAME),
        )
        .expect("host type");
    store
        .register_type(
            ObjectTypeDef::embedded(INTERFACE, "interface")
                .contained_by(HOST, HOST_INTERFACES)
                .with_field(FieldDef::new(IFACE_ADDRESS, "address", FieldKind::Ip)),
        )
        .expect("interface type");
    store
        .register_type(
            ObjectTypeDef::new(LEASE, "lease")
                .with_field(FieldDef::text(LEASE_NAME, "name"))
                .with_label(LEASE_NAME)
                .with_behavior(Arc::new(LeaseBehavior)),
        )
        .expect("lease type");
    (store, log)
}

fn open() -> Store {
    open_with_log().0
}

fn supergash(store: &Store) -> Session {
    let mut session = store.login(ROOT_USERNAME, "root").expect("login");
    let rv = session
        .select_persona(SUPERGASH_PERSONA_NAME, "root")
        .expect("persona");
    assert!(rv.success, "{rv:?}");
    assert!(session.permissions().is_supergash());
    session
}

fn ok(rv: ReturnVal) -> ReturnVal {
    assert!(rv.success, "unexpected failure: {rv:?}");
    rv
}

fn create(session: &mut Session, type_id: u16) -> Invid {
    ok(session.create_object(type_id, None).expect("create"))
        .invid
        .expect("new invid")
}

fn host(session: &mut Session, name: &str) -> Invid {
    let invid = create(session, HOST);
    ok(session
        .set_field(invid, HOST_NAME, Some(Value::from(name)))
        .expect("set name"));
    invid
}

fn committed_host(store: &Store, name: &str) -> Invid {
    let mut session = supergash(store);
    ok(session.open_transaction("seed").expect("open"));
    let invid = host(&mut session, name);
    ok(session.commit_transaction(true).expect("commit"));
    invid
}

#[test]
fn checkout_is_exclusive_until_commit() {
    let store = open();
    let invid = committed_host(&store, "alpha");
    let mut a = supergash(&store);
    let mut b = supergash(&store);

    ok(a.open_transaction("a").expect("open"));
    ok(a.edit_object(invid).expect("edit"));
    assert_eq!(
        store.db().shadow_holder(invid).map(|h| h.session),
        Some(a.id())
    );

    ok(b.open_transaction("b").expect("open"));
    let busy = b.edit_object(invid).expect("edit");
    assert!(busy.is_failure_kind(FailureKind::AlreadyEditing));
    assert!(busy.dialog_text().is_some_and(|t| t.contains(ROOT_USERNAME)));

    ok(a.commit_transaction(true).expect("commit"));
    assert!(store.db().shadow_holder(invid).is_none());
    ok(b.edit_object(invid).expect("edit after commit"));
}

#[test]
fn rollback_restores_fields_and_namespace_claims() {
    let store = open();
    let mut a = supergash(&store);
    ok(a.open_transaction("a").expect("open"));
    let invid = host(&mut a, "alpha");
    ok(a.checkpoint("before-rename").expect("checkpoint"));
    ok(a.set_field(invid, HOST_NAME, Some(Value::from("beta"))).expect("rename"));
    ok(a.add_element(invid, HOST_ALIASES, Value::from("b")).expect("alias"));
    let txn = a.transaction().expect("txn").txn();

    ok(a.rollback("before-rename").expect("rollback"));
    let shadow = a.shadow(invid).expect("shadow");
    assert_eq!(shadow.scalar(HOST_NAME), Some(&Value::from("alpha")));
    assert!(shadow.elements(HOST_ALIASES).is_empty());

    let ns = store.db().namespaces().get("hostname").expect("namespace");
    assert!(ns.lookup_in(txn, &Value::from("beta")).is_none());
    assert_eq!(
        ns.lookup_in(txn, &Value::from("alpha")).map(|h| h.invid),
        Some(invid)
    );

    let mut b = supergash(&store);
    ok(b.open_transaction("b").expect("open"));
    host(&mut b, "beta");
    assert!(a.rollback("before-rename").is_err());
}

#[test]
fn removal_keeps_values_reserved_until_commit() {
    let (store, log) = open_with_log();
    let invid = committed_host(&store, "alpha");
    let mut a = supergash(&store);
    let mut b = supergash(&store);

    ok(a.open_transaction("remove").expect("open"));
    let rv = ok(a.remove_object(invid).expect("remove"));
    assert_eq!(rv.invid, Some(invid));
    assert_eq!(a.shadow(invid).map(EditObject::status), Some(ObjectStatus::Deleting));

    ok(b.open_transaction("claim").expect("open"));
    let other = create(&mut b, HOST);
    let taken = b
        .set_field(other, HOST_NAME, Some(Value::from("alpha")))
        .expect("set");
    assert!(taken.is_failure_kind(FailureKind::NamespaceConflict));

    ok(a.commit_transaction(true).expect("commit"));
    assert!(store.db().get(invid).is_none());
    ok(b.set_field(other, HOST_NAME, Some(Value::from("alpha"))).expect("set"));
    ok(b.commit_transaction(true).expect("commit"));

    let events = log.events_for(invid);
    assert!(events.contains(&AuditEvent::ObjectRemoved {
        invid,
        label: "alpha".into()
    }));
}

#[test]
fn commit_stamps_history_and_drops_uncommitted_removals() {
    let (store, log) = open_with_log();
    let mut session = supergash(&store);
    ok(session.open_transaction("history").expect("open"));
    let kept = host(&mut session, "one");
    let dropped = host(&mut session, "two");
    ok(session.remove_object(dropped).expect("remove"));
    assert_eq!(
        session.shadow(dropped).map(EditObject::status),
        Some(ObjectStatus::Dropping)
    );
    ok(session.commit_transaction(true).expect("commit"));

    let stored = store.db().get(kept).expect("committed");
    assert_eq!(stored.scalar(CREATOR_FIELD), Some(&Value::from(ROOT_USERNAME)));
    assert_eq!(stored.scalar(MODIFIER_FIELD), Some(&Value::from(ROOT_USERNAME)));
    assert!(stored.scalar(CREATION_DATE_FIELD).is_some());
    assert_eq!(stored.owners(), vec![SUPERGASH_OWNER]);

    assert!(store.db().get(dropped).is_none());
    assert!(store
        .db()
        .lookup_unique("hostname", &Value::from("two"))
        .expect("lookup")
        .is_none());
    assert!(log.events_for(dropped).is_empty());
    assert!(matches!(
        log.events_for(kept).first(),
        Some(AuditEvent::ObjectCreated { label, .. }) if label == "one"
    ));
}

#[test]
fn embedded_objects_link_to_their_container() {
    let store = open();
    let mut session = supergash(&store);
    ok(session.open_transaction("iface").expect("open"));
    let parent = host(&mut session, "router");
    let iface = ok(session.create_object(INTERFACE, Some(parent)).expect("create"))
        .invid
        .expect("invid");
    ok(session
        .set_field(iface, IFACE_ADDRESS, Some(Value::Ip(IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)))))
        .expect("address"));

    assert_eq!(
        session.shadow(iface).expect("iface").scalar(CONTAINER_FIELD),
        Some(&Value::Invid(parent))
    );
    assert_eq!(
        session.shadow(parent).expect("host").invids(HOST_INTERFACES),
        vec![iface]
    );
    assert!(session.create_object(INTERFACE, None).is_err());

    ok(session.remove_object(iface).expect("remove"));
    assert!(session
        .shadow(parent)
        .expect("host")
        .invids(HOST_INTERFACES)
        .is_empty());
}

#[test]
fn wizard_confirmation_gates_the_change() {
    let store = open();
    let mut session = supergash(&store);
    ok(session.open_transaction("lease").expect("open"));
    let lease = create(&mut session, LEASE);
    ok(session.set_field(lease, LEASE_NAME, Some(Value::from("staging"))).expect("name"));

    let pending = session
        .set_field(lease, LEASE_NAME, Some(Value::from("production")))
        .expect("rename");
    assert!(pending.is_pending());
    let token = pending.wizard.expect("prompt").token;
    let declined = session.respond_wizard(token, false).expect("decline");
    assert!(declined.is_failure_kind(FailureKind::WizardDeclined));
    assert_eq!(
        session.shadow(lease).expect("lease").scalar(LEASE_NAME),
        Some(&Value::from("staging"))
    );
    assert!(session
        .respond_wizard(token, true)
        .expect("stale token")
        .is_failure_kind(FailureKind::NotFound));

    let token = session
        .set_field(lease, LEASE_NAME, Some(Value::from("production")))
        .expect("rename")
        .wizard
        .expect("prompt")
        .token;
    ok(session.respond_wizard(token, true).expect("accept"));
    assert_eq!(
        session.shadow(lease).expect("lease").scalar(LEASE_NAME),
        Some(&Value::from("production"))
    );

    session.enable_wizards(false).expect("wizards off");
    ok(session.set_field(lease, LEASE_NAME, Some(Value::from("staging"))).expect("name"));
    session.enable_wizards(true).expect("wizards on");
    assert!(session
        .set_field(lease, LEASE_NAME, Some(Value::from("production")))
        .expect("rename")
        .is_pending());
}

#[test]
fn inactivation_schedules_removal_and_reactivation_clears_it() {
    let (store, log) = open_with_log();
    let mut session = supergash(&store);
    ok(session.open_transaction("seed").expect("open"));
    let lease = create(&mut session, LEASE);
    ok(session.set_field(lease, LEASE_NAME, Some(Value::from("l1"))).expect("name"));
    let plain = host(&mut session, "plain");
    ok(session.commit_transaction(true).expect("commit"));

    ok(session.open_transaction("inactivate").expect("open"));
    let before = now_millis();
    ok(session.inactivate(lease).expect("inactivate"));
    let scheduled = session
        .shadow(lease)
        .and_then(|s| s.removal_date())
        .expect("removal date");
    assert!(scheduled >= before + 29 * 24 * 60 * 60 * 1000);
    assert!(session
        .inactivate(plain)
        .expect("inactivate host")
        .is_failure_kind(FailureKind::NotInactivatable));
    ok(session.commit_transaction(true).expect("commit"));
    assert_eq!(
        store.db().get(lease).and_then(|o| o.removal_date()),
        Some(scheduled)
    );

    ok(session.open_transaction("reactivate").expect("open"));
    ok(session.reactivate(lease).expect("reactivate"));
    assert!(session.shadow(lease).and_then(|s| s.removal_date()).is_none());
    ok(session.commit_transaction(true).expect("commit"));

    let kinds: Vec<&str> = log.events_for(lease).iter().map(AuditEvent::kind).collect();
    assert!(kinds.contains(&"object_inactivated"));
    assert!(kinds.contains(&"object_reactivated"));
}

#[test]
fn clone_copies_plain_fields_but_not_unique_ones() {
    let store = open();
    let mut session = supergash(&store);
    ok(session.open_transaction("clone").expect("open"));
    let source = host(&mut session, "alpha");
    ok(session
        .add_elements(source, HOST_ALIASES, vec![Value::from("a"), Value::from("b")])
        .expect("aliases"));

    let copy = ok(session.clone_object(source).expect("clone"))
        .invid
        .expect("copy");
    assert_ne!(copy, source);
    let shadow = session.shadow(copy).expect("copy shadow");
    assert_eq!(
        shadow.elements(HOST_ALIASES),
        &[Value::from("a"), Value::from("b")]
    );
    assert!(!shadow.is_defined(HOST_NAME));
}

#[test]
fn required_fields_gate_commit_while_oversight_is_on() {
    let store = open();
    let mut session = supergash(&store);
    ok(session.open_transaction("required").expect("open"));
    let lease = create(&mut session, LEASE);

    let refused = session.commit_transaction(false).expect("commit");
    assert!(refused.is_failure_kind(FailureKind::MissingRequiredFields));
    assert!(refused.dialog_text().is_some_and(|t| t.contains("name")));
    assert!(session.transaction().is_some());

    ok(session.set_field(lease, LEASE_NAME, Some(Value::from("l1"))).expect("name"));
    assert!(session
        .set_field(lease, LEASE_NAME, None)
        .expect("clear")
        .is_failure_kind(FailureKind::RejectedValue));
    ok(session.commit_transaction(false).expect("commit"));

    let mut plain = store.login(ROOT_USERNAME, "root").expect("login");
    assert!(plain
        .enable_oversight(false)
        .expect("oversight")
        .is_failure_kind(FailureKind::PermissionDenied));

    ok(session.enable_oversight(false).expect("oversight"));
    ok(session.open_transaction("bulk").expect("open"));
    let unnamed = create(&mut session, LEASE);
    ok(session.commit_transaction(true).expect("commit"));
    assert!(store.db().get(unnamed).is_some());
}

#[test]
fn default_owners_apply_to_new_objects() {
    let store = open();
    let mut session = supergash(&store);
    ok(session.open_transaction("group").expect("open"));
    let group = create(&mut session, OWNER_BASE);
    ok(session.set_field(group, OWNER_NAME, Some(Value::from("ops"))).expect("name"));
    ok(session.commit_transaction(true).expect("commit"));

    ok(session.set_default_owner(vec![group]).expect("default owner"));
    ok(session.open_transaction("host").expect("open"));
    let owned = host(&mut session, "ops-box");
    assert_eq!(session.shadow(owned).expect("shadow").owners(), vec![group]);
    assert!(session
        .set_default_owner(vec![owned])
        .expect("not a group")
        .is_failure_kind(FailureKind::NotFound));
}

#[test]
fn queries_see_the_sessions_own_transaction() {
    let store = open();
    let a_host = committed_host(&store, "a");
    let b_host = committed_host(&store, "b");
    let mut session = supergash(&store);
    ok(session.open_transaction("overlay").expect("open"));
    ok(session.remove_object(a_host).expect("remove"));
    let c_host = host(&mut session, "c");

    assert_eq!(session.query(HOST, |_| true).expect("query"), vec![b_host, c_host]);
    assert_eq!(session.find_label(HOST, "c").expect("find"), Some(c_host));
    assert_eq!(session.find_label(HOST, "a").expect("find"), None);

    let mut other = supergash(&store);
    assert_eq!(other.find_label(HOST, "c").expect("find"), None);
    assert_eq!(other.find_label(HOST, "A").expect("find"), Some(a_host));
    assert_eq!(
        other
            .query(HOST, |obj| obj.scalar(HOST_NAME) == Some(&Value::from("b")))
            .expect("query"),
        vec![b_host]
    );
}
