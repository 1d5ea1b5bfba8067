//! Platform collaborator interfaces.
//!
//! The daemon's OS integrations (account state, device topology, the
//! bundle manager) stay outside this crate and are injected through
//! these traits. [`FixedProviders`] is a static implementation for
//! embedders and tests.

use std::collections::HashMap;
use std::sync::Mutex;

/// Supplier of account state.
pub trait AccountProvider: Send + Sync {
    /// Returns the signed-in account id, or the default account id when
    /// nobody is signed in.
    fn current_account_id(&self) -> String;

    /// Returns the device account id owning the calling process.
    fn device_account_id(&self) -> String;
}

/// Supplier of device identity and topology.
pub trait DeviceProvider: Send + Sync {
    /// Returns the stable identifier of the local device.
    fn local_device_id(&self) -> String;

    /// Returns the stable identifiers of currently reachable devices.
    fn device_list(&self) -> Vec<String>;

    /// Resolves a transport-layer node id to a stable device identifier.
    ///
    /// Returns `None` when the node is unknown.
    fn device_id_by_node(&self, node_id: &str) -> Option<String>;

    /// Returns true when the calling process is backgrounded, which makes
    /// unspecified sync delays fall back to the deferred default.
    fn caller_is_background(&self) -> bool {
        false
    }
}

/// Supplier of application identity.
pub trait AppIdResolver: Send + Sync {
    /// Resolves a bundle name to the installed application id, or `None`
    /// when the bundle is unknown to the package manager.
    fn app_id_for_bundle(&self, bundle_name: &str) -> Option<String>;

    /// Returns true when the bundle is a trusted system service, which
    /// lets unlabeled stores use the device-scoped path.
    fn is_system_service(&self, bundle_name: &str) -> bool;
}

/// Static providers backed by in-memory tables.
pub struct FixedProviders {
    state: Mutex<FixedState>,
}

struct FixedState {
    account_id: String,
    device_account_id: String,
    local_device_id: String,
    devices: Vec<String>,
    nodes: HashMap<String, String>,
    system_bundles: Vec<String>,
    background: bool,
}

impl FixedProviders {
    /// Builds providers for one local device with no peers.
    #[must_use]
    pub fn new(local_device_id: impl Into<String>) -> Self {
        Self {
            state: Mutex::new(FixedState {
                account_id: crate::types::DEFAULT_ACCOUNT_ID.to_string(),
                device_account_id: "0".to_string(),
                local_device_id: local_device_id.into(),
                devices: Vec::new(),
                nodes: HashMap::new(),
                system_bundles: Vec::new(),
                background: false,
            }),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, FixedState> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Replaces the signed-in account id.
    pub fn set_account_id(&self, account_id: impl Into<String>) {
        self.state().account_id = account_id.into();
    }

    /// Registers a reachable peer device and its transport node id.
    pub fn add_peer(&self, node_id: impl Into<String>, device_id: impl Into<String>) {
        let device_id = device_id.into();
        let mut state = self.state();
        state.devices.push(device_id.clone());
        state.nodes.insert(node_id.into(), device_id);
    }

    /// Marks a bundle as a trusted system service.
    pub fn add_system_bundle(&self, bundle_name: impl Into<String>) {
        self.state().system_bundles.push(bundle_name.into());
    }

    /// Sets the background hint returned for sync-delay selection.
    pub fn set_background(&self, background: bool) {
        self.state().background = background;
    }
}

impl AccountProvider for FixedProviders {
    fn current_account_id(&self) -> String {
        self.state().account_id.clone()
    }

    fn device_account_id(&self) -> String {
        self.state().device_account_id.clone()
    }
}

impl DeviceProvider for FixedProviders {
    fn local_device_id(&self) -> String {
        self.state().local_device_id.clone()
    }

    fn device_list(&self) -> Vec<String> {
        self.state().devices.clone()
    }

    fn device_id_by_node(&self, node_id: &str) -> Option<String> {
        let state = self.state();
        // Node ids may arrive with routing suffixes appended by the
        // transport; match on the registered prefix.
        state
            .nodes
            .iter()
            .find(|(node, _)| node_id.starts_with(node.as_str()))
            .map(|(_, device)| device.clone())
    }

    fn caller_is_background(&self) -> bool {
        self.state().background
    }
}

impl AppIdResolver for FixedProviders {
    fn app_id_for_bundle(&self, bundle_name: &str) -> Option<String> {
        // Without a package manager every installed bundle resolves to
        // itself.
        Some(bundle_name.to_string())
    }

    fn is_system_service(&self, bundle_name: &str) -> bool {
        self.state()
            .system_bundles
            .iter()
            .any(|bundle| bundle == bundle_name)
    }
}
