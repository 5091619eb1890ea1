use shadowstore::schema::constants::*;
use shadowstore::{
    EditObject, FailureKind, FieldDef, FieldOp, HookContext, Invid, ObjectTypeBehavior, ObjectTypeDef, ObjectView,
    PermEntry, PermKey, ReturnVal, Session, Store, StoreConfig, Value, WizardOutcome,
};
use std::sync::Arc;

const TICKET: u16 = FIRST_USER_TYPE;
const TICKET_TITLE: u16 = 100;
const TICKET_NOTES: u16 = 101;

fn ok(rv: ReturnVal) -> ReturnVal {
    assert!(rv.success, "unexpected failure: {rv:?}");
    rv
}

fn create(session: &mut Session, type_id: u16) -> Invid {
    ok(session.create_object(type_id, None).expect("create"))
        .invid
        .expect("new invid")
}

fn named(session: &mut Session, type_id: u16, name_field: u16, name: &str) -> Invid {
    let invid = create(session, type_id);
    ok(session
        .set_field(invid, name_field, Some(Value::from(name)))
        .expect("name"));
    invid
}

fn supergash(store: &Store) -> Session {
    let mut session = store.login(ROOT_USERNAME, "root").expect("root login");
    ok(session
        .select_persona(SUPERGASH_PERSONA_NAME, "root")
        .expect("persona"));
    session
}

struct Fixture {
    store: Store,
    group: Invid,
    helpdesk: Invid,
    other_role: Invid,
    ticket: Invid,
}

/// A helpdesk persona for user "alice" in owner group "admins". The helpdesk
/// role grants create/view/edit on users and view/edit on roles for owned
/// objects, plus create/view on users everywhere, and is delegatable.
fn fixture() -> Fixture {
    let store = Store::open(StoreConfig::development()).expect("open");
    store
        .register_type(
            ObjectTypeDef::new(TICKET, "ticket")
                .with_field(FieldDef::text(TICKET_TITLE, "title"))
                .with_field(FieldDef::text(TICKET_NOTES, "internal notes"))
                .with_label(TICKET_TITLE),
        )
        .expect("ticket type");

    let mut root = supergash(&store);
    ok(root.open_transaction("fixture").expect("open"));
    let group = named(&mut root, OWNER_BASE, OWNER_NAME, "admins");

    let helpdesk = named(&mut root, ROLE_BASE, ROLE_NAME, "helpdesk");
    ok(root
        .set_perm(helpdesk, ROLE_MATRIX, PermKey::object(USER_BASE), PermEntry::new(true, true, true, false))
        .expect("user bits"));
    ok(root
        .set_perm(helpdesk, ROLE_MATRIX, PermKey::object(ROLE_BASE), PermEntry::new(true, true, false, false))
        .expect("role bits"));
    ok(root
        .set_perm(helpdesk, ROLE_MATRIX, PermKey::object(TICKET), PermEntry::new(true, true, true, true))
        .expect("ticket bits"));
    ok(root
        .set_perm(helpdesk, ROLE_MATRIX, PermKey::field(TICKET, TICKET_NOTES), PermEntry::view_only())
        .expect("notes bits"));
    ok(root
        .set_perm(
            helpdesk,
            ROLE_DEFAULT_MATRIX,
            PermKey::object(USER_BASE),
            PermEntry::new(true, false, true, false),
        )
        .expect("default bits"));
    ok(root
        .set_field(helpdesk, ROLE_DELEGATABLE, Some(Value::Bool(true)))
        .expect("delegatable"));

    let alice = named(&mut root, USER_BASE, USER_NAME, "alice");
    ok(root.set_secret(alice, USER_SECRET, "alice-pw").expect("user secret"));
    let persona = named(&mut root, PERSONA_BASE, PERSONA_NAME, "alice:admin");
    ok(root.set_secret(persona, PERSONA_SECRET, "admin-pw").expect("persona secret"));
    ok(root
        .set_field(persona, PERSONA_USER, Some(Value::Invid(alice)))
        .expect("persona user"));
    ok(root
        .add_element(persona, PERSONA_GROUPS, Value::Invid(group))
        .expect("persona group"));
    ok(root
        .add_element(persona, PERSONA_PRIVS, Value::Invid(helpdesk))
        .expect("persona role"));
    ok(root.commit_transaction(true).expect("commit fixture"));

    ok(root.set_default_owner(vec![group]).expect("default owner"));
    ok(root.open_transaction("owned").expect("open"));
    let other_role = named(&mut root, ROLE_BASE, ROLE_NAME, "auditors");
    let ticket = named(&mut root, TICKET, TICKET_TITLE, "printer on fire");
    ok(root
        .set_field(ticket, TICKET_NOTES, Some(Value::from("again")))
        .expect("notes"));
    ok(root.commit_transaction(true).expect("commit owned"));

    Fixture {
        store,
        group,
        helpdesk,
        other_role,
        ticket,
    }
}

fn helpdesk(store: &Store) -> Session {
    let mut session = store.login("alice", "alice-pw").expect("alice login");
    ok(session.select_persona("alice:admin", "admin-pw").expect("persona"));
    session
}

#[test]
fn symmetric_links_are_committed_on_both_sides() {
    let fx = fixture();
    let db = fx.store.db();
    let persona = db
        .lookup_unique(PERSONA_NAMESPACE, &Value::from("alice:admin"))
        .expect("lookup")
        .expect("persona")
        .invid;
    let group = db.get(fx.group).expect("group");
    let role = db.get(fx.helpdesk).expect("role");
    assert_eq!(group.invids(OWNER_MEMBERS), vec![persona]);
    assert_eq!(role.invids(ROLE_PERSONAE), vec![persona]);

    let alice = db
        .lookup_unique(USER_NAMESPACE, &Value::from("alice"))
        .expect("lookup")
        .expect("user")
        .invid;
    assert_eq!(db.get(alice).expect("user").invids(USER_PERSONAE), vec![persona]);
}

#[test]
fn delegation_is_bounded_by_the_granting_persona() {
    let fx = fixture();
    let mut alice = helpdesk(&fx.store);
    assert!(!alice.permissions().is_supergash());

    ok(alice.open_transaction("delegate").expect("open"));
    ok(alice.edit_object(fx.other_role).expect("edit owned role"));

    let refused = alice
        .set_perm(fx.other_role, ROLE_MATRIX, PermKey::object(USER_BASE), PermEntry::full())
        .expect("set perm");
    assert!(refused.is_failure_kind(FailureKind::PermissionDenied));

    ok(alice
        .set_perm(
            fx.other_role,
            ROLE_MATRIX,
            PermKey::object(USER_BASE),
            PermEntry::new(true, true, true, false),
        )
        .expect("set perm"));
    ok(alice.commit_transaction(true).expect("commit"));

    let stored = fx.store.db().get(fx.other_role).expect("role");
    let matrix = stored
        .field_value(ROLE_MATRIX)
        .and_then(|v| v.as_matrix())
        .expect("matrix");
    assert_eq!(
        matrix.get_perm(USER_BASE),
        Some(PermEntry::new(true, true, true, false))
    );
}

#[test]
fn field_entries_narrow_owned_objects() {
    let fx = fixture();
    let mut alice = helpdesk(&fx.store);
    let ticket = fx.store.db().get(fx.ticket).expect("ticket");

    let object = alice.object_perm(&*ticket).expect("object perm");
    assert!(object.is_deletable());
    let notes = alice.field_perm(&*ticket, TICKET_NOTES).expect("notes perm");
    assert!(notes.is_visible() && !notes.is_editable());
    let history = alice.field_perm(&*ticket, MODIFIER_FIELD).expect("history perm");
    assert_eq!(history, PermEntry::view_only());

    ok(alice.open_transaction("edit ticket").expect("open"));
    ok(alice.edit_object(fx.ticket).expect("edit"));
    ok(alice
        .set_field(fx.ticket, TICKET_TITLE, Some(Value::from("printer fixed")))
        .expect("title"));
    assert!(alice
        .set_field(fx.ticket, TICKET_NOTES, Some(Value::from("never mind")))
        .expect("notes")
        .is_failure_kind(FailureKind::PermissionDenied));
    ok(alice.commit_transaction(true).expect("commit"));
}

#[test]
fn objects_outside_the_owner_groups_get_default_bits_only() {
    let fx = fixture();
    let mut alice = helpdesk(&fx.store);
    let root_user = fx.store.db().get(ROOT_USER).expect("root user");
    let perm = alice.object_perm(&*root_user).expect("perm");
    assert_eq!(perm, PermEntry::new(true, false, true, false));

    ok(alice.open_transaction("poke root").expect("open"));
    assert!(alice
        .edit_object(ROOT_USER)
        .expect("edit")
        .is_failure_kind(FailureKind::PermissionDenied));
    assert!(alice.view_object(ROOT_USER).is_ok());
    assert!(alice.view_object(SUPERGASH_OWNER).is_err());
}

#[test]
fn role_edits_reach_live_sessions() {
    let fx = fixture();
    let mut alice = helpdesk(&fx.store);
    let ticket = fx.store.db().get(fx.ticket).expect("ticket");
    assert!(alice.object_perm(&*ticket).expect("perm").is_editable());

    let mut root = supergash(&fx.store);
    ok(root.open_transaction("revoke").expect("open"));
    ok(root.edit_object(fx.helpdesk).expect("edit role"));
    ok(root
        .set_perm(fx.helpdesk, ROLE_MATRIX, PermKey::object(TICKET), PermEntry::view_only())
        .expect("revoke"));
    ok(root.commit_transaction(true).expect("commit"));

    // The next call notices the changed role table and recomputes.
    ok(alice.open_transaction("after revoke").expect("open"));
    assert!(alice
        .edit_object(fx.ticket)
        .expect("edit")
        .is_failure_kind(FailureKind::PermissionDenied));
}

#[test]
fn persona_selection_requires_the_persona_secret() {
    let fx = fixture();
    let mut alice = fx.store.login("alice", "alice-pw").expect("login");
    let refused = alice.select_persona("alice:admin", "wrong").expect("persona");
    assert!(refused.is_failure_kind(FailureKind::Authentication));
    assert_eq!(alice.persona(), None);

    let stolen = alice
        .select_persona(SUPERGASH_PERSONA_NAME, "root")
        .expect("persona");
    assert!(stolen.is_failure_kind(FailureKind::Authentication));

    ok(alice.select_persona("alice:admin", "admin-pw").expect("persona"));
    assert!(alice.persona().is_some());
    ok(alice.open_transaction("busy").expect("open"));
    assert!(alice
        .select_persona("", "")
        .expect("drop persona")
        .is_failure_kind(FailureKind::TransactionOpen));
    ok(alice.abort_transaction().expect("abort"));
    ok(alice.select_persona("", "").expect("drop persona"));
    assert_eq!(alice.persona(), None);
}

const FROZEN: u16 = FIRST_USER_TYPE + 1;
const RELAY: u16 = FIRST_USER_TYPE + 2;
const NOTE: u16 = 100;

/// Objects of this type can be seen but never checked out.
struct FrozenBehavior;

impl ObjectTypeBehavior for FrozenBehavior {
    fn can_write(&self, _ctx: &HookContext<'_>, _obj: &dyn ObjectView) -> bool {
        false
    }
}

/// Forwards any note change to the note of `target`.
struct RelayBehavior {
    target: Invid,
}

impl ObjectTypeBehavior for RelayBehavior {
    fn wizard_hook(&self, _ctx: &HookContext<'_>, _obj: &EditObject, op: &FieldOp) -> WizardOutcome {
        match op {
            FieldOp::Set { field: NOTE, value } => WizardOutcome::Substitute(vec![(
                self.target,
                FieldOp::Set {
                    field: NOTE,
                    value: value.clone(),
                },
            )]),
            _ => WizardOutcome::Continue(Default::default()),
        }
    }
}

#[test]
fn wizard_substitution_cannot_check_out_write_protected_objects() {
    let fx = fixture();
    fx.store
        .register_type(
            ObjectTypeDef::new(FROZEN, "frozen")
                .with_field(FieldDef::text(NOTE, "note"))
                .with_behavior(Arc::new(FrozenBehavior)),
        )
        .expect("frozen type");

    let mut root = supergash(&fx.store);
    ok(root.set_default_owner(vec![fx.group]).expect("default owner"));
    ok(root.open_transaction("frozen").expect("open"));
    let frozen = named(&mut root, FROZEN, NOTE, "original");
    ok(root.edit_object(fx.helpdesk).expect("edit role"));
    for type_id in [FROZEN, RELAY] {
        ok(root
            .set_perm(fx.helpdesk, ROLE_MATRIX, PermKey::object(type_id), PermEntry::new(true, true, true, true))
            .expect("bits"));
    }
    ok(root.commit_transaction(true).expect("commit"));
    fx.store
        .register_type(
            ObjectTypeDef::new(RELAY, "relay")
                .with_field(FieldDef::text(NOTE, "note"))
                .with_behavior(Arc::new(RelayBehavior { target: frozen })),
        )
        .expect("relay type");

    let mut alice = helpdesk(&fx.store);
    ok(alice.open_transaction("relay").expect("open"));
    assert!(alice
        .edit_object(frozen)
        .expect("edit")
        .is_failure_kind(FailureKind::PermissionDenied));
    let relay = create(&mut alice, RELAY);
    let rv = alice
        .set_field(relay, NOTE, Some(Value::from("changed")))
        .expect("relay");
    assert!(rv.is_failure_kind(FailureKind::PermissionDenied));
    assert!(alice.shadow(frozen).is_none());
    assert!(fx.store.db().shadow_holder(frozen).is_none());
    assert_eq!(
        fx.store.db().get(frozen).expect("frozen").scalar(NOTE),
        Some(&Value::from("original"))
    );
}
