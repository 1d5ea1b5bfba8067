//! Subscription wrappers around engine observers.
//!
//! A caller never registers its observer with the engine directly: the
//! handle wraps it first. The plain wrapper forwards notifications as-is;
//! the device-collaboration wrapper decodes every physical key back into
//! `(origin device, logical key)` so callers only ever see logical keys
//! and a resolved origin device id.

use std::sync::Arc;

use meshkv_engine::{ChangeNotification, Entry, KvObserver};
use tracing::warn;

use crate::codec;

/// A batch of store changes as seen by a subscriber.
#[derive(Debug, Clone, Default)]
pub struct StoreChange {
    /// Entries created by the batch.
    pub inserted: Vec<Entry>,
    /// Entries overwritten by the batch.
    pub updated: Vec<Entry>,
    /// Entries removed by the batch.
    pub deleted: Vec<Entry>,
    /// Device the batch originated from; the local device id for local
    /// writes on device-collaboration stores, empty otherwise.
    pub device_id: String,
}

/// Receiver for change notifications registered through a store handle.
pub trait StoreObserver: Send + Sync {
    /// Called after a batch of changes has been applied to the store.
    fn on_change(&self, change: &StoreChange);
}

/// Wrapper forwarding engine notifications unchanged.
pub(crate) struct PlainObserver {
    caller: Arc<dyn StoreObserver>,
}

impl PlainObserver {
    pub(crate) fn new(caller: Arc<dyn StoreObserver>) -> Self {
        Self { caller }
    }
}

impl KvObserver for PlainObserver {
    fn on_change(&self, change: &ChangeNotification) {
        let forwarded = StoreChange {
            inserted: change.inserted.clone(),
            updated: change.updated.clone(),
            deleted: change.deleted.clone(),
            device_id: change.device_id.clone(),
        };
        self.caller.on_change(&forwarded);
    }
}

/// Wrapper decoding device-collaboration keys before forwarding.
pub(crate) struct CollaborationObserver {
    caller: Arc<dyn StoreObserver>,
    local_device_id: String,
}

impl CollaborationObserver {
    pub(crate) fn new(caller: Arc<dyn StoreObserver>, local_device_id: String) -> Self {
        Self {
            caller,
            local_device_id,
        }
    }

    fn decode_entries(entries: &[Entry], origin: &mut Option<String>) -> Vec<Entry> {
        let mut decoded = Vec::with_capacity(entries.len());
        for entry in entries {
            match codec::decode(&entry.key) {
                Ok((device_id, logical)) => {
                    if origin.is_none() {
                        *origin = Some(device_id);
                    }
                    decoded.push(Entry::new(logical, entry.value.clone()));
                }
                Err(err) => {
                    warn!(error = %err, "dropping undecodable key from change batch");
                }
            }
        }
        decoded
    }
}

impl KvObserver for CollaborationObserver {
    fn on_change(&self, change: &ChangeNotification) {
        let mut origin = None;
        let forwarded = StoreChange {
            inserted: Self::decode_entries(&change.inserted, &mut origin),
            updated: Self::decode_entries(&change.updated, &mut origin),
            deleted: Self::decode_entries(&change.deleted, &mut origin),
            device_id: if change.device_id.is_empty() {
                // Local writes are namespaced under the local device; the
                // decoded origin confirms it.
                origin.unwrap_or_else(|| self.local_device_id.clone())
            } else {
                change.device_id.clone()
            },
        };
        if forwarded.inserted.is_empty()
            && forwarded.updated.is_empty()
            && forwarded.deleted.is_empty()
        {
            return;
        }
        self.caller.on_change(&forwarded);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

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
    fn test_collaboration_wrapper_surfaces_logical_keys() {
        let recorder = Recorder::new();
        let wrapper =
            CollaborationObserver::new(Arc::clone(&recorder) as _, "local".to_string());

        let change = ChangeNotification {
            inserted: vec![Entry::new(codec::encode("peer-a", b"note"), b"1".as_slice())],
            ..ChangeNotification::default()
        };
        wrapper.on_change(&change);

        let seen = recorder.changes.lock().expect("lock");
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].device_id, "peer-a");
        assert_eq!(seen[0].inserted[0].key, b"note".to_vec());
    }

    #[test]
    fn test_collaboration_wrapper_drops_undecodable_batches() {
        let recorder = Recorder::new();
        let wrapper =
            CollaborationObserver::new(Arc::clone(&recorder) as _, "local".to_string());

        let change = ChangeNotification {
            inserted: vec![Entry::new(b"xy".as_slice(), b"1".as_slice())],
            ..ChangeNotification::default()
        };
        wrapper.on_change(&change);

        assert!(recorder.changes.lock().expect("lock").is_empty());
    }
}
