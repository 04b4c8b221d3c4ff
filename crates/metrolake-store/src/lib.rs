//! metrolake-store: Object store access and partition bookkeeping
//!
//! Maps partitions onto object keys, persists the manifest that tracks
//! which partitions are materialized, and writes partition objects so
//! readers never observe a half-written one.

pub mod client;
pub mod hash;
pub mod key;
pub mod lock;
pub mod maintenance;
pub mod manifest;
pub mod writer;

pub use client::{LakeStore, ObjectStoreClient, StoreKind, StoreSettings};
pub use hash::{combine_hashes, hash_bytes, record_set_hash, short_hash};
pub use key::{
    LAKE_ROOT, Layer, MANIFEST_KEY, PartitionKey, dataset_prefix, date_prefix, default_variant,
    is_tmp_key, is_valid_dataset, layer_prefix, make_key, parse_key, report_key, tmp_key,
};
pub use lock::{KeyGuard, KeyLocks};
pub use maintenance::{VerifyResult, cleanup_tmp, stale_tmp_objects, verify, verify_all};
pub use manifest::{
    Claim, ManifestEntry, ManifestError, ManifestState, ManifestStore, PartitionStatus,
};
pub use writer::{LayerWriter, PartitionRef, WriteError, read_partition};
