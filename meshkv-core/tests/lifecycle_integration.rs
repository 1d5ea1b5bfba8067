//! Store lifecycle: shared handles, the open cap, close/delete
//! bookkeeping and option checks across reopens.

mod common;

use common::{encrypted_options, test_service, test_service_with};
use meshkv_core::{KvStoreType, Options, StoreError, StoreIdentity};

const BUNDLE: &str = "com.example.notes";

#[test]
fn test_repeated_open_shares_one_handle() {
    let fixture = test_service();
    let first = fixture
        .service
        .get_kv_store(BUNDLE, "notes", &Options::default())
        .expect("open");
    let second = fixture
        .service
        .get_kv_store(BUNDLE, "notes", &Options::default())
        .expect("open again");

    assert!(std::sync::Arc::ptr_eq(&first, &second));
    assert_eq!(first.open_count(), 2);

    // Writes through one handle are visible through the other.
    first.put(b"k", b"v").expect("put");
    assert_eq!(second.get(b"k").expect("get"), b"v".to_vec());
}

#[test]
fn test_close_fewer_times_than_open_leaves_store_open() {
    let fixture = test_service();
    let handle = fixture
        .service
        .get_kv_store(BUNDLE, "notes", &Options::default())
        .expect("open");
    fixture
        .service
        .get_kv_store(BUNDLE, "notes", &Options::default())
        .expect("open again");

    fixture
        .service
        .close_kv_store(BUNDLE, "notes")
        .expect("close once");
    assert!(handle.is_open());
    handle.put(b"still", b"here").expect("put");

    fixture
        .service
        .close_kv_store(BUNDLE, "notes")
        .expect("close last");
    assert!(!handle.is_open());
    assert_eq!(handle.get(b"still"), Err(StoreError::NotOpen));
}

#[test]
fn test_close_without_open_reports_not_open() {
    let fixture = test_service();
    assert_eq!(
        fixture.service.close_kv_store(BUNDLE, "never_opened"),
        Err(StoreError::NotOpen)
    );
}

#[test]
fn test_open_store_cap_is_enforced_per_bundle() {
    let fixture = test_service();
    for index in 0..16 {
        fixture
            .service
            .get_kv_store(BUNDLE, &format!("store_{index}"), &Options::default())
            .expect("open under the cap");
    }
    assert_eq!(
        fixture
            .service
            .get_kv_store(BUNDLE, "store_16", &Options::default())
            .err(),
        Some(StoreError::ResourceExhausted)
    );

    // Closing one of the sixteen frees a slot for the seventeenth.
    fixture
        .service
        .close_kv_store(BUNDLE, "store_0")
        .expect("close");
    fixture
        .service
        .get_kv_store(BUNDLE, "store_16", &Options::default())
        .expect("open after a close");
}

#[test]
fn test_delete_removes_store_and_bookkeeping() {
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

    fixture
        .service
        .delete_kv_store(BUNDLE, "vault")
        .expect("delete");

    let identity = StoreIdentity {
        device_account_id: "0".to_string(),
        account_id: "default".to_string(),
        bundle_name: BUNDLE.to_string(),
        store_id: "vault".to_string(),
    };
    assert_eq!(
        fixture.service.meta().get_meta(&identity),
        Err(StoreError::NotFound)
    );
    assert!(!fixture
        .paths
        .secret_key_file("0", BUNDLE, "vault")
        .exists());

    // The physical store is gone; without creation the open fails.
    let no_create = Options {
        create_if_missing: false,
        encrypt: true,
        ..Options::default()
    };
    assert_eq!(
        fixture.service.get_kv_store(BUNDLE, "vault", &no_create).err(),
        Some(StoreError::StoreNotFound)
    );
}

#[test]
fn test_deleted_encrypted_store_reopens_unencrypted() {
    let fixture = test_service();
    fixture
        .service
        .get_kv_store(BUNDLE, "vault", &encrypted_options())
        .expect("open encrypted");
    fixture
        .service
        .delete_kv_store(BUNDLE, "vault")
        .expect("delete");

    // All key bookkeeping is gone, so the name is free for a plain store.
    fixture
        .service
        .get_kv_store(BUNDLE, "vault", &Options::default())
        .expect("reopen unencrypted");
}

#[test]
fn test_encrypt_option_must_match_existing_store() {
    let fixture = test_service();
    fixture
        .service
        .get_kv_store(BUNDLE, "vault", &encrypted_options())
        .expect("open encrypted");
    fixture
        .service
        .close_kv_store(BUNDLE, "vault")
        .expect("close");

    assert!(matches!(
        fixture
            .service
            .get_kv_store(BUNDLE, "vault", &Options::default()),
        Err(StoreError::InvalidArgument(_))
    ));
}

#[test]
fn test_store_type_must_match_existing_store() {
    let fixture = test_service();
    fixture
        .service
        .get_kv_store(BUNDLE, "notes", &Options::default())
        .expect("open");
    fixture
        .service
        .close_kv_store(BUNDLE, "notes")
        .expect("close");

    let collaboration = Options {
        kv_store_type: KvStoreType::DeviceCollaboration,
        ..Options::default()
    };
    assert!(matches!(
        fixture.service.get_kv_store(BUNDLE, "notes", &collaboration),
        Err(StoreError::InvalidArgument(_))
    ));
}

#[test]
fn test_invalid_naming_is_rejected_before_any_engine_work() {
    let fixture = test_service();
    assert!(matches!(
        fixture
            .service
            .get_kv_store("", "notes", &Options::default()),
        Err(StoreError::InvalidArgument(_))
    ));
    assert!(matches!(
        fixture
            .service
            .get_kv_store(BUNDLE, "has space", &Options::default()),
        Err(StoreError::InvalidArgument(_))
    ));
    assert!(matches!(
        fixture
            .service
            .get_kv_store("bundle###name", "notes", &Options::default()),
        Err(StoreError::InvalidArgument(_))
    ));
}

#[test]
fn test_exhausted_flow_control_surfaces_rate_limited() {
    let fixture = test_service_with(|config| {
        config.burst_capacity = 2;
        config.sustained_capacity = 2;
    });
    let handle = fixture
        .service
        .get_kv_store(BUNDLE, "notes", &Options::default())
        .expect("open");

    handle.put(b"a", b"1").expect("put");
    handle.put(b"b", b"2").expect("put");
    assert_eq!(handle.put(b"c", b"3"), Err(StoreError::RateLimited));
    // Nothing reached the engine for the rejected write.
    assert_eq!(handle.get(b"c"), Err(StoreError::RateLimited));
}

#[test]
fn test_delete_all_clears_the_bundle_and_its_records() {
    let fixture = test_service();
    let alpha = fixture
        .service
        .get_kv_store(BUNDLE, "alpha", &Options::default())
        .expect("open");
    fixture
        .service
        .get_kv_store(BUNDLE, "beta", &Options::default())
        .expect("open");

    fixture
        .service
        .delete_all_kv_store(BUNDLE)
        .expect("delete all");
    assert!(!alpha.is_open());
    assert_eq!(
        fixture
            .service
            .meta()
            .store_ids_for_bundle("0", BUNDLE)
            .expect("store ids"),
        Vec::<String>::new()
    );
}

#[test]
fn test_close_all_tears_down_every_bundle_store() {
    let fixture = test_service();
    let first = fixture
        .service
        .get_kv_store(BUNDLE, "alpha", &Options::default())
        .expect("open");
    let second = fixture
        .service
        .get_kv_store(BUNDLE, "beta", &Options::default())
        .expect("open");

    fixture
        .service
        .close_all_kv_store(BUNDLE)
        .expect("close all");
    assert!(!first.is_open());
    assert!(!second.is_open());
}
