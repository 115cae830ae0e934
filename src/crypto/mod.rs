//! Hashing and randomness helpers: payload content hashes, auth
//! fingerprints for pool keys and the run ids tagging remote process groups.

use ring::digest;
use ring::rand::{SecureRandom, SystemRandom};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Lowercase hex SHA-256 of `data`.
pub fn sha256_hex(data: &[u8]) -> String {
    to_hex(digest::digest(&digest::SHA256, data).as_ref())
}

/// SHA-256 over several length-prefixed parts.
/// Length prefixes keep `["ab", "c"]` and `["a", "bc"]` distinct.
pub fn fingerprint(parts: &[&[u8]]) -> String {
    let mut ctx = digest::Context::new(&digest::SHA256);
    for part in parts {
        ctx.update(&(part.len() as u64).to_be_bytes());
        ctx.update(part);
    }
    to_hex(ctx.finish().as_ref())
}

/// Random 16-hex-char identifier.
pub fn random_id() -> String {
    let rng = SystemRandom::new();
    let mut bytes = [0u8; 8];
    match rng.fill(&mut bytes) {
        Ok(()) => to_hex(&bytes),
        Err(_) => {
            // Fall back to clock + counter; uniqueness within one host is enough.
            static COUNTER: AtomicU64 = AtomicU64::new(0);
            let nanos = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_nanos() as u64)
                .unwrap_or(0);
            let n = COUNTER.fetch_add(1, Ordering::Relaxed);
            log::warn!("System RNG unavailable, using clock-based run id");
            format!("{:016x}", nanos ^ n.rotate_left(48))
        }
    }
}

fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}
