//! Corruption self-healing: backup import on a live handle, rebuild of a
//! corrupted store on the open path, and secret-key file fallback.

mod common;

use common::{encrypted_options, store_data_dir, test_service};
use meshkv_core::meta::{secret_record_key, SINGLE_KEY_PURPOSE};
use meshkv_core::{Options, StoreError, StoreIdentity};
use meshkv_engine::KvStoreDelegate;

const BUNDLE: &str = "com.example.notes";

fn identity(store_id: &str) -> StoreIdentity {
    StoreIdentity {
        device_account_id: "0".to_string(),
        account_id: "default".to_string(),
        bundle_name: BUNDLE.to_string(),
        store_id: store_id.to_string(),
    }
}

#[test]
fn test_corruption_on_read_recovers_from_backup() {
    let fixture = test_service();
    let options = encrypted_options();
    let handle = fixture
        .service
        .get_kv_store(BUNDLE, "vault", &options)
        .expect("open");
    handle.put(b"a", b"1").expect("put");
    handle.backup_now().expect("backup");

    let data_dir = store_data_dir(&fixture, BUNDLE, &options);
    fixture.engine.corrupt_store(&data_dir, "vault");

    // Only the recovery outcome is surfaced; the read is not retried.
    assert_eq!(handle.get(b"a"), Err(StoreError::RecoverSucceeded));
    assert_eq!(handle.get(b"a").expect("get after recovery"), b"1".to_vec());
}

#[test]
fn test_corruption_without_backup_reports_recover_failed() {
    let fixture = test_service();
    let options = Options::default();
    let handle = fixture
        .service
        .get_kv_store(BUNDLE, "scratch", &options)
        .expect("open");
    handle.put(b"a", b"1").expect("put");

    let data_dir = store_data_dir(&fixture, BUNDLE, &options);
    fixture.engine.corrupt_store(&data_dir, "scratch");

    assert_eq!(handle.get(b"a"), Err(StoreError::RecoverFailed));
}

#[test]
fn test_corrupted_closed_store_is_rebuilt_on_open() {
    let fixture = test_service();
    let options = Options::default();
    let handle = fixture
        .service
        .get_kv_store(BUNDLE, "notes", &options)
        .expect("open");
    handle.put(b"saved", b"payload").expect("put");
    handle.backup_now().expect("backup");
    fixture
        .service
        .close_kv_store(BUNDLE, "notes")
        .expect("close");

    let data_dir = store_data_dir(&fixture, BUNDLE, &options);
    fixture.engine.corrupt_store(&data_dir, "notes");

    // The damaged database is replaced from its backup; the caller
    // re-opens to use it.
    assert_eq!(
        fixture.service.get_kv_store(BUNDLE, "notes", &options).err(),
        Some(StoreError::RecoverSucceeded)
    );
    let recovered = fixture
        .service
        .get_kv_store(BUNDLE, "notes", &options)
        .expect("open after recovery");
    assert_eq!(
        recovered.get(b"saved").expect("get"),
        b"payload".to_vec()
    );
}

#[test]
fn test_corrupted_closed_store_without_backup_stays_failed() {
    let fixture = test_service();
    let options = Options::default();
    let handle = fixture
        .service
        .get_kv_store(BUNDLE, "notes", &options)
        .expect("open");
    handle.put(b"lost", b"forever").expect("put");
    fixture
        .service
        .close_kv_store(BUNDLE, "notes")
        .expect("close");

    let data_dir = store_data_dir(&fixture, BUNDLE, &options);
    fixture.engine.corrupt_store(&data_dir, "notes");

    assert_eq!(
        fixture.service.get_kv_store(BUNDLE, "notes", &options).err(),
        Some(StoreError::CryptError)
    );
}

#[test]
fn test_unreadable_secret_record_is_recovered_from_key_file() {
    let fixture = test_service();
    let options = encrypted_options();
    let handle = fixture
        .service
        .get_kv_store(BUNDLE, "vault", &options)
        .expect("open");
    handle.put(b"k", b"v").expect("put");
    fixture
        .service
        .close_kv_store(BUNDLE, "vault")
        .expect("close");

    // Mangle the device-local secret record; the redundant key file is
    // the only readable copy left.
    let record_key = secret_record_key(&identity("vault"), SINGLE_KEY_PURPOSE);
    fixture
        .service
        .meta()
        .delegate()
        .expect("meta delegate")
        .put_local(&record_key, b"garbage")
        .expect("mangle secret record");

    let reopened = fixture
        .service
        .get_kv_store(BUNDLE, "vault", &options)
        .expect("reopen from file key");
    assert_eq!(reopened.get(b"k").expect("get"), b"v".to_vec());
}

#[test]
fn test_dirty_meta_records_notify_watchers() {
    let fixture = test_service();
    fixture
        .service
        .get_kv_store(BUNDLE, "notes", &Options::default())
        .expect("open");

    let (sender, receiver) = std::sync::mpsc::channel();
    let sender = std::sync::Mutex::new(sender);
    fixture
        .service
        .meta()
        .watch_dirty(Box::new(move |record| {
            let _ = sender.lock().expect("lock").send(record.store_id.clone());
        }))
        .expect("watch");

    let mut record = fixture
        .service
        .meta()
        .get_meta(&identity("notes"))
        .expect("meta record");
    record.is_dirty = true;
    fixture.service.meta().put_meta(&record).expect("mark dirty");

    assert_eq!(
        receiver.recv_timeout(std::time::Duration::from_secs(2)),
        Ok("notes".to_string())
    );
}

#[test]
fn test_backup_rotation_never_drops_the_last_snapshot() {
    let fixture = test_service();
    let options = Options::default();
    let handle = fixture
        .service
        .get_kv_store(BUNDLE, "notes", &options)
        .expect("open");
    handle.put(b"k", b"v1").expect("put");
    handle.backup_now().expect("first export");

    let backup_file = fixture
        .paths
        .backup_file(meshkv_core::PathType::Ce, "0", "default", BUNDLE, "notes");
    let first = std::fs::read(&backup_file).expect("read backup");

    // A failing export leaves the previous snapshot in place, unchanged.
    let data_dir = store_data_dir(&fixture, BUNDLE, &options);
    fixture.engine.fail_next_export(&data_dir, "notes");
    handle.put(b"k", b"v2").expect("put");
    assert!(handle.backup_now().is_err());
    assert_eq!(std::fs::read(&backup_file).expect("read backup"), first);
    assert!(!meshkv_core::paths::rotation_path(&backup_file).exists());

    // The next successful export replaces it and clears the rotation.
    handle.backup_now().expect("second export");
    assert_ne!(std::fs::read(&backup_file).expect("read backup"), first);
    assert!(!meshkv_core::paths::rotation_path(&backup_file).exists());
}
