//! Common test utilities shared across integration tests.

use std::path::PathBuf;
use std::sync::Arc;

use meshkv_core::app::convert_path_type;
use meshkv_core::config::ServiceConfig;
use meshkv_core::keystore::SoftwareKeystore;
use meshkv_core::paths::ServicePaths;
use meshkv_core::provider::FixedProviders;
use meshkv_core::{KvStoreService, Options};
use meshkv_engine::MemoryEngine;

pub struct TestService {
    pub service: KvStoreService,
    pub engine: MemoryEngine,
    pub providers: Arc<FixedProviders>,
    pub keystore: Arc<SoftwareKeystore>,
    pub paths: ServicePaths,
    pub _dir: tempfile::TempDir,
}

/// Builds a full service over the in-memory engine, rooted in a fresh
/// temp directory.
pub fn test_service() -> TestService {
    test_service_with(|_| {})
}

/// Same, with a hook to adjust the configuration before construction.
#[allow(dead_code, reason = "used by most but not all test binaries")]
pub fn test_service_with(adjust: impl FnOnce(&mut ServiceConfig)) -> TestService {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
    let dir = tempfile::tempdir().expect("tempdir");
    let mut config = ServiceConfig::new(dir.path().join("de"), dir.path().join("ce"));
    adjust(&mut config);
    let paths = ServicePaths::new(&config);
    let engine = MemoryEngine::new();
    let providers = Arc::new(FixedProviders::new("local-device"));
    let keystore = Arc::new(SoftwareKeystore::ephemeral());
    let service = KvStoreService::new(
        &config,
        Arc::new(engine.clone()),
        Arc::clone(&providers) as _,
        Arc::clone(&providers) as _,
        Arc::clone(&providers) as _,
        Arc::clone(&keystore) as _,
    );
    TestService {
        service,
        engine,
        providers,
        keystore,
        paths,
        _dir: dir,
    }
}

/// The physical data directory the service opens `bundle_name`'s stores
/// under, for fault injection into the engine.
#[allow(dead_code, reason = "used by most but not all test binaries")]
pub fn store_data_dir(fixture: &TestService, bundle_name: &str, options: &Options) -> PathBuf {
    let path_type = convert_path_type(options.security_level, false);
    fixture.paths.store_dir(path_type, "0", bundle_name)
}

#[allow(dead_code, reason = "used by most but not all test binaries")]
pub fn encrypted_options() -> Options {
    Options {
        encrypt: true,
        ..Options::default()
    }
}
