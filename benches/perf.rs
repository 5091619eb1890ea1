use criterion::{Criterion, black_box, criterion_group, criterion_main};
use shadowstore::schema::constants::*;
use shadowstore::{FieldDef, Invid, ObjectTypeDef, ObjectView, Session, Store, StoreConfig, Value};

const DEVICE: u16 = FIRST_USER_TYPE;
const DEVICE_NAME: u16 = 100;
const DEVICE_NOTE: u16 = 101;
const SEEDED_DEVICES: usize = 2_000;

fn setup_store(seed: usize) -> (Store, Vec<Invid>) {
    let store = Store::open(StoreConfig::development()).expect("open");
    store.declare_namespace("device", true).expect("namespace");
    store
        .register_type(
            ObjectTypeDef::new(DEVICE, "device")
                .with_field(FieldDef::text(DEVICE_NAME, "name").namespace("device"))
                .with_field(FieldDef::text(DEVICE_NOTE, "note"))
                .with_label(DEVICE_NAME),
        )
        .expect("device type");

    let mut session = supergash(&store);
    session.open_transaction("seed").expect("open");
    let mut devices = Vec::with_capacity(seed);
    for i in 0..seed {
        let invid = session
            .create_object(DEVICE, None)
            .expect("create")
            .invid
            .expect("invid");
        session
            .set_field(invid, DEVICE_NAME, Some(Value::from(format!("device-{i}").as_str())))
            .expect("name");
        devices.push(invid);
    }
    assert!(session.commit_transaction(true).expect("commit").success);
    (store, devices)
}

fn supergash(store: &Store) -> Session {
    let mut session = store.login(ROOT_USERNAME, "root").expect("login");
    session
        .select_persona(SUPERGASH_PERSONA_NAME, "root")
        .expect("persona");
    session
}

fn bench_session_hot_paths(c: &mut Criterion) {
    let (store, devices) = setup_store(SEEDED_DEVICES);
    let mut session = supergash(&store);

    let mut next = 0_usize;
    c.bench_function("edit_one_field_and_commit", |b| {
        b.iter(|| {
            let invid = devices[next % devices.len()];
            next += 1;
            session.open_transaction("bench").expect("open");
            session.edit_object(invid).expect("edit");
            session
                .set_field(invid, DEVICE_NOTE, Some(Value::from(black_box("rebooted"))))
                .expect("note");
            session.commit_transaction(true).expect("commit");
        })
    });

    c.bench_function("namespace_claim_and_rollback", |b| {
        session.open_transaction("claims").expect("open");
        let invid = session
            .create_object(DEVICE, None)
            .expect("create")
            .invid
            .expect("invid");
        b.iter(|| {
            session.checkpoint("claim").expect("checkpoint");
            session
                .set_field(invid, DEVICE_NAME, Some(Value::from(black_box("spare"))))
                .expect("claim");
            session.rollback("claim").expect("rollback");
        });
        session.abort_transaction().expect("abort");
    });

    c.bench_function("find_label_through_namespace", |b| {
        b.iter(|| {
            session
                .find_label(DEVICE, black_box("DEVICE-1234"))
                .expect("find")
        })
    });

    c.bench_function("full_table_query", |b| {
        let wanted = Value::from("rebooted");
        b.iter(|| {
            session
                .query(DEVICE, |obj| obj.scalar(DEVICE_NOTE) == Some(&wanted))
                .expect("query")
        })
    });
}

fn bench_store_bootstrap(c: &mut Criterion) {
    c.bench_function("open_and_seed_100_devices", |b| {
        b.iter(|| setup_store(black_box(100)))
    });
}

criterion_group!(benches, bench_session_hot_paths, bench_store_bootstrap);
criterion_main!(benches);
