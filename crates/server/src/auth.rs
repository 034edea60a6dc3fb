use sha2::{Digest, Sha256};

/// One-way digest for stored credentials, hex encoded. Login re-hashes the
/// submitted password and compares against the stored digest.
pub fn hash_password(password: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(password.as_bytes());
    format!("{:x}", hasher.finalize())
}
