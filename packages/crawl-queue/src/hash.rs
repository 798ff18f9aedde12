use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Length of the short digests stored in `parameters_hash` and process ids.
pub const SHORT_HASH_LENGTH: usize = 10;

/// Full SHA256 hex digest.
pub fn full_hash(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Fixed-length prefix of the SHA256 hex digest.
pub fn short_hash(input: &str) -> String {
    let mut hash = full_hash(input);
    hash.truncate(SHORT_HASH_LENGTH);
    hash
}

/// Opaque worker id derived from a time-ordered UUID.
pub fn new_process_id() -> String {
    short_hash(&Uuid::now_v7().to_string())
}

/// Id grouping all entries of one generation pass (fits a signed 32 bit column).
pub fn new_set_id() -> i64 {
    let digest = Sha256::digest(Uuid::now_v7().as_bytes());
    let prefix = hex::encode(&digest[..4]);
    i64::from_str_radix(&prefix[..7], 16).unwrap_or_default()
}
