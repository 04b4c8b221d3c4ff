//! Blake3 hashing for partition objects and record sets

use metrolake_core::Record;

/// Hash raw bytes with blake3.
pub fn hash_bytes(data: &[u8]) -> blake3::Hash {
    blake3::hash(data)
}

/// Combine multiple hashes into one by hashing their concatenated bytes.
pub fn combine_hashes(hashes: &[blake3::Hash]) -> blake3::Hash {
    let mut hasher = blake3::Hasher::new();
    for h in hashes {
        hasher.update(h.as_bytes());
    }
    hasher.finalize()
}

/// Return the first 8 hex characters of a blake3 hash.
pub fn short_hash(hash: &blake3::Hash) -> String {
    hash.to_hex()[..8].to_string()
}

/// Order-independent hash of a record set.
///
/// Ingestion timestamps are not part of the fingerprint, so re-fetching the
/// same upstream data yields the same hash.
pub fn record_set_hash(records: &[Record]) -> blake3::Hash {
    let mut prints: Vec<String> = records.iter().map(Record::fingerprint).collect();
    prints.sort_unstable();

    let mut hasher = blake3::Hasher::new();
    for p in &prints {
        hasher.update(p.as_bytes());
        hasher.update(b"\n");
    }
    hasher.finalize()
}
