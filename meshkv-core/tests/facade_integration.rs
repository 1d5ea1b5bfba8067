//! Facade operations beyond plain put/get: transactions, queries,
//! result sets, security metadata, capability switches and key
//! rotation.

mod common;

use common::{encrypted_options, test_service};
use meshkv_core::keystore::{DeviceKeystore, SECRET_KEY_AD};
use meshkv_core::meta::{secret_record_key, SINGLE_KEY_PURPOSE};
use meshkv_core::{Options, SecurityLevel, StoreError, StoreIdentity};
use meshkv_engine::{Entry, KvStoreDelegate, Query};

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
fn test_transaction_rollback_and_commit() {
    let fixture = test_service();
    let handle = fixture
        .service
        .get_kv_store(BUNDLE, "notes", &Options::default())
        .expect("open");

    handle.put(b"balance", b"100").expect("put");
    handle.start_transaction().expect("begin");
    handle.put(b"balance", b"0").expect("put in txn");
    handle.rollback().expect("rollback");
    assert_eq!(handle.get(b"balance").expect("get"), b"100".to_vec());

    handle.start_transaction().expect("begin");
    handle.put(b"balance", b"50").expect("put in txn");
    handle.commit().expect("commit");
    assert_eq!(handle.get(b"balance").expect("get"), b"50".to_vec());
}

#[test]
fn test_batched_writes_and_prefix_queries() {
    let fixture = test_service();
    let handle = fixture
        .service
        .get_kv_store(BUNDLE, "notes", &Options::default())
        .expect("open");

    handle
        .put_batch(&[
            Entry::new(b"list/a".as_slice(), b"1".as_slice()),
            Entry::new(b"list/b".as_slice(), b"2".as_slice()),
            Entry::new(b"other".as_slice(), b"3".as_slice()),
        ])
        .expect("put batch");

    let query = Query::with_prefix(b"list/".as_slice());
    assert_eq!(handle.get_count(&query).expect("count"), 2);
    let entries = handle.get_entries_by_query(&query).expect("query");
    assert_eq!(entries.len(), 2);

    handle
        .delete_batch(&[b"list/a".to_vec(), b"list/b".to_vec()])
        .expect("delete batch");
    assert_eq!(handle.get_count(&query).expect("count"), 0);
}

#[test]
fn test_result_set_cursors_are_tracked_until_closed() {
    let fixture = test_service();
    let handle = fixture
        .service
        .get_kv_store(BUNDLE, "notes", &Options::default())
        .expect("open");
    handle.put(b"list/a", b"1").expect("put");
    handle.put(b"list/b", b"2").expect("put");

    let cursor = handle.open_result_set(b"list/").expect("open cursor");
    assert_eq!(cursor.count(), 2);
    assert_eq!(
        cursor.entry_at(0).expect("entry").key,
        b"list/a".to_vec()
    );
    assert!(cursor.entry_at(2).is_none());

    handle.close_result_set(&cursor).expect("close cursor");
    assert_eq!(
        handle.close_result_set(&cursor),
        Err(StoreError::NotFound)
    );
}

#[test]
fn test_security_level_round_trips_through_the_engine() {
    let fixture = test_service();
    let options = Options {
        security_level: SecurityLevel::S2,
        ..Options::default()
    };
    let handle = fixture
        .service
        .get_kv_store(BUNDLE, "labeled", &options)
        .expect("open");

    assert_eq!(
        handle.get_security_level().expect("level"),
        SecurityLevel::S2
    );
}

#[test]
fn test_capability_switch_is_persisted() {
    let fixture = test_service();
    let handle = fixture
        .service
        .get_kv_store(BUNDLE, "notes", &Options::default())
        .expect("open");

    handle.set_capability_enabled(true).expect("enable");
    let strategy = fixture
        .service
        .meta()
        .get_strategy("local-device", &handle.identity())
        .expect("strategy");
    assert_eq!(strategy.capability_enabled, Some(true));
}

#[test]
fn test_rekey_keeps_data_and_survives_reopen() {
    let fixture = test_service();
    let handle = fixture
        .service
        .get_kv_store(BUNDLE, "vault", &encrypted_options())
        .expect("open");
    handle.put(b"k", b"v").expect("put");

    handle.rekey().expect("rekey");
    assert_eq!(handle.get(b"k").expect("get"), b"v".to_vec());

    fixture
        .service
        .close_kv_store(BUNDLE, "vault")
        .expect("close");
    let reopened = fixture
        .service
        .get_kv_store(BUNDLE, "vault", &encrypted_options())
        .expect("reopen with rotated key");
    assert_eq!(reopened.get(b"k").expect("get"), b"v".to_vec());
}

#[test]
fn test_rekey_rejected_on_unencrypted_stores() {
    let fixture = test_service();
    let handle = fixture
        .service
        .get_kv_store(BUNDLE, "notes", &Options::default())
        .expect("open");
    assert_eq!(handle.rekey(), Err(StoreError::NotSupported));
}

#[test]
fn test_outdated_key_is_rotated_on_open() {
    let fixture = test_service();
    let handle = fixture
        .service
        .get_kv_store(BUNDLE, "vault", &encrypted_options())
        .expect("open");
    handle.put(b"k", b"v").expect("put");
    fixture
        .service
        .close_kv_store(BUNDLE, "vault")
        .expect("close");

    // Forge a key file whose creation stamp is two years in the past,
    // then mangle the meta record so the file becomes the authority.
    let identity = identity("vault");
    let (current_key, outdated) = fixture
        .service
        .meta()
        .secret_key_from_meta(&identity)
        .expect("current key");
    assert!(!outdated);
    let sealed = fixture
        .keystore
        .seal(SECRET_KEY_AD, &current_key)
        .expect("seal");
    let two_years_ago = meshkv_core::meta::unix_now() - 2 * 365 * 24 * 60 * 60;
    let mut file_bytes = two_years_ago.to_le_bytes().to_vec();
    file_bytes.extend_from_slice(&sealed);
    let key_file = fixture.paths.secret_key_file("0", BUNDLE, "vault");
    std::fs::write(&key_file, file_bytes).expect("write key file");
    let record_key = secret_record_key(&identity, SINGLE_KEY_PURPOSE);
    fixture
        .service
        .meta()
        .delegate()
        .expect("meta delegate")
        .put_local(&record_key, b"garbage")
        .expect("mangle secret record");

    // The reopen recovers the outdated key from the file and rotates it.
    let reopened = fixture
        .service
        .get_kv_store(BUNDLE, "vault", &encrypted_options())
        .expect("reopen");
    assert_eq!(reopened.get(b"k").expect("get"), b"v".to_vec());
    let (_, still_outdated) = fixture
        .service
        .meta()
        .secret_key_from_meta(&identity)
        .expect("rotated key");
    assert!(!still_outdated);
}
