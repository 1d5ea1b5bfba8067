//! Per-device management layer for MeshKV.
//!
//! This crate sits between application callers (identified by bundle
//! name and store id) and a pluggable synchronizing storage engine
//! (`meshkv-engine`). It owns everything around the engine that a
//! per-device daemon needs:
//!
//! * store lifecycle with reference-counted sharing and a hard cap on
//!   concurrently open stores per bundle ([`app`], [`user`]),
//! * the rate-limited, status-normalized operation facade over one open
//!   store ([`handle`], [`flow`]),
//! * secret-key and metadata bookkeeping that keeps encrypted stores
//!   recoverable across corruption ([`meta`], [`keystore`]),
//! * scheduled backup export and corruption-triggered import
//!   ([`backup`]),
//! * account-identity migration when the signed-in account changes
//!   ([`service`], [`migration`]),
//! * the key codec multiplexing several devices' logical keyspaces onto
//!   one physical store ([`codec`]).
//!
//! [`KvStoreService`] is the assembled entry point; embedders inject the
//! engine, the platform providers ([`provider`]) and a device keystore,
//! and get the full facade back.

pub mod app;
pub mod backup;
pub mod codec;
pub mod config;
mod error;
pub mod flow;
pub mod handle;
pub mod keystore;
pub mod meta;
pub mod migration;
pub mod observer;
pub mod paths;
pub mod provider;
pub mod scheduler;
pub mod service;
pub mod sync;
pub mod types;
pub mod user;

pub use config::ServiceConfig;
pub use error::{StoreError, StoreResult};
pub use handle::{DeviceEntries, StoreHandle, StoreResultSet};
pub use migration::MigrationStatus;
pub use observer::{StoreChange, StoreObserver};
pub use service::{KvStoreService, MigrationCoordinator};
pub use sync::{SyncCallback, SyncOutcome};
pub use types::{
    KvStoreType, Options, PathType, SecurityLevel, StoreIdentity, SubscribeType,
};
