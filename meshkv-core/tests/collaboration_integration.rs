//! Device-collaboration stores: logical keys on the wire, per-device
//! reads, enumeration and change notifications with resolved origins.

mod common;

use std::sync::{Arc, Mutex};

use common::{store_data_dir, test_service};
use meshkv_core::codec;
use meshkv_core::observer::{StoreChange, StoreObserver};
use meshkv_core::{KvStoreType, Options, StoreError, SubscribeType};
use meshkv_engine::Entry;

const BUNDLE: &str = "com.example.board";

fn collaboration_options() -> Options {
    Options {
        kv_store_type: KvStoreType::DeviceCollaboration,
        ..Options::default()
    }
}

struct Recorder {
    changes: Mutex<Vec<StoreChange>>,
}

impl Recorder {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            changes: Mutex::new(Vec::new()),
        })
    }
}

impl StoreObserver for Recorder {
    fn on_change(&self, change: &StoreChange) {
        self.changes.lock().expect("lock").push(change.clone());
    }
}

#[test]
fn test_local_writes_round_trip_on_logical_keys() {
    let fixture = test_service();
    let handle = fixture
        .service
        .get_kv_store(BUNDLE, "board", &collaboration_options())
        .expect("open");

    handle.put(b"note", b"mine").expect("put");
    assert_eq!(handle.get(b"note").expect("get"), b"mine".to_vec());

    // Enumeration surfaces logical keys, not the namespaced physical
    // form.
    let entries = handle.get_entries(b"").expect("entries");
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].key, b"note".to_vec());
}

#[test]
fn test_peer_keyspace_is_isolated_and_reachable_by_node() {
    let fixture = test_service();
    fixture.providers.add_peer("node-a", "device-a");
    let options = collaboration_options();
    let handle = fixture
        .service
        .get_kv_store(BUNDLE, "board", &options)
        .expect("open");
    handle.put(b"note", b"mine").expect("put");

    // A peer's write lands under its own device namespace.
    let data_dir = store_data_dir(&fixture, BUNDLE, &options);
    fixture.engine.inject_remote_entries(
        &data_dir,
        "board",
        "device-a",
        vec![Entry::new(codec::encode("device-a", b"note"), b"theirs".as_slice())],
    );

    assert_eq!(handle.get(b"note").expect("local read"), b"mine".to_vec());
    assert_eq!(
        handle.get_by_device("node-a", b"note").expect("peer read"),
        b"theirs".to_vec()
    );
    assert_eq!(
        handle.get_by_device("node-unknown", b"note"),
        Err(StoreError::NotFound)
    );
}

#[test]
fn test_entries_by_device_resolve_origin() {
    let fixture = test_service();
    fixture.providers.add_peer("node-a", "device-a");
    let options = collaboration_options();
    let handle = fixture
        .service
        .get_kv_store(BUNDLE, "board", &options)
        .expect("open");

    let data_dir = store_data_dir(&fixture, BUNDLE, &options);
    fixture.engine.inject_remote_entries(
        &data_dir,
        "board",
        "device-a",
        vec![
            Entry::new(codec::encode("device-a", b"list/a"), b"1".as_slice()),
            Entry::new(codec::encode("device-a", b"list/b"), b"2".as_slice()),
        ],
    );

    let batch = handle
        .get_entries_by_device("node-a", b"list/")
        .expect("peer entries");
    assert_eq!(batch.device_id, "device-a");
    let keys: Vec<Vec<u8>> = batch.entries.iter().map(|entry| entry.key.clone()).collect();
    assert_eq!(keys, vec![b"list/a".to_vec(), b"list/b".to_vec()]);
}

#[test]
fn test_observers_see_logical_keys_and_origin_device() {
    let fixture = test_service();
    fixture.providers.add_peer("node-a", "device-a");
    let options = collaboration_options();
    let handle = fixture
        .service
        .get_kv_store(BUNDLE, "board", &options)
        .expect("open");

    let recorder = Recorder::new();
    handle
        .subscribe(SubscribeType::Remote, Arc::clone(&recorder) as _)
        .expect("subscribe");

    let data_dir = store_data_dir(&fixture, BUNDLE, &options);
    fixture.engine.inject_remote_entries(
        &data_dir,
        "board",
        "device-a",
        vec![Entry::new(codec::encode("device-a", b"note"), b"1".as_slice())],
    );

    let seen = recorder.changes.lock().expect("lock");
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].device_id, "device-a");
    assert_eq!(seen[0].inserted[0].key, b"note".to_vec());
}

#[test]
fn test_remove_device_data_clears_one_origin_only() {
    let fixture = test_service();
    fixture.providers.add_peer("node-a", "device-a");
    let options = collaboration_options();
    let handle = fixture
        .service
        .get_kv_store(BUNDLE, "board", &options)
        .expect("open");
    handle.put(b"note", b"mine").expect("put");

    let data_dir = store_data_dir(&fixture, BUNDLE, &options);
    fixture.engine.inject_remote_entries(
        &data_dir,
        "board",
        "device-a",
        vec![Entry::new(codec::encode("device-a", b"note"), b"theirs".as_slice())],
    );

    handle.remove_device_data("device-a").expect("remove");
    assert_eq!(
        handle.get_by_device("node-a", b"note"),
        Err(StoreError::NotFound)
    );
    assert_eq!(handle.get(b"note").expect("get"), b"mine".to_vec());
}

#[test]
fn test_per_device_reads_rejected_on_plain_stores() {
    let fixture = test_service();
    fixture.providers.add_peer("node-a", "device-a");
    let handle = fixture
        .service
        .get_kv_store(BUNDLE, "plain", &Options::default())
        .expect("open");

    assert_eq!(
        handle.get_by_device("node-a", b"note"),
        Err(StoreError::NotSupported)
    );
}
