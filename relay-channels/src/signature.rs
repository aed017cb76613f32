//! Callback authenticity checks.

use sha2::{Digest, Sha256};

/// `hex(sha256(timestamp + nonce + encrypt_key + body))`, the value the
/// platform sends in `X-Lark-Signature`.
pub fn compute_signature(timestamp: &str, nonce: &str, encrypt_key: &str, body: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(timestamp.as_bytes());
    hasher.update(nonce.as_bytes());
    hasher.update(encrypt_key.as_bytes());
    hasher.update(body);
    format!("{:x}", hasher.finalize())
}

pub fn verify_signature(
    timestamp: &str,
    nonce: &str,
    encrypt_key: &str,
    body: &[u8],
    signature: &str,
) -> bool {
    let computed = compute_signature(timestamp, nonce, encrypt_key, body);
    constant_time_eq(&computed, signature.trim())
}

/// Payload token check. A payload without a token never matches.
pub fn verify_token(expected: &str, actual: Option<&str>) -> bool {
    match actual {
        Some(actual) => constant_time_eq(expected, actual),
        None => false,
    }
}

fn constant_time_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.bytes()
        .zip(b.bytes())
        .fold(0, |acc, (x, y)| acc | (x ^ y))
        == 0
}
