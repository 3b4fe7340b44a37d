//! Request fingerprinting for cache lookups
//!
//! The fingerprint is a canonicalized string of method, URL, query params and
//! a fixed subset of request headers, hashed to a stable key. Two requests
//! that differ only in irrelevant headers share a fingerprint.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use sha2::{Digest, Sha256};

use crate::transport::HttpMethod;

/// Headers that participate in the fingerprint, lower-case.
pub const FINGERPRINT_HEADERS: &[&str] = &[
    "accept",
    "accept-encoding",
    "accept-language",
    "authorization",
];

/// Raw material for a cache key.
#[derive(Debug, Clone)]
pub struct KeyInput<'a> {
    pub method: HttpMethod,
    pub url: &'a str,
    pub params: &'a HashMap<String, String>,
    pub headers: &'a HashMap<String, String>,
}

/// Caller-supplied key generator, overriding the built-in fingerprint.
pub type KeyGenerator = Arc<dyn Fn(&KeyInput<'_>) -> String + Send + Sync>;

/// Hash applied to the canonical fingerprint string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum KeyHash {
    /// SHA-256, hex encoded
    #[default]
    Sha256,

    /// Deterministic non-cryptographic 32-bit FNV-1a, 8 hex digits
    Fnv32,
}

/// Build the canonical (pre-hash) fingerprint string.
pub fn canonical_fingerprint(input: &KeyInput<'_>) -> String {
    // Params are serialized through a BTreeMap for a deterministic order.
    let sorted_params: BTreeMap<&String, &String> = input.params.iter().collect();
    let params_json =
        serde_json::to_string(&sorted_params).unwrap_or_else(|_| "{}".to_string());

    let mut header_parts: Vec<String> = Vec::new();
    for name in FINGERPRINT_HEADERS {
        let value = input
            .headers
            .iter()
            .find(|(header, _)| header.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str());
        if let Some(value) = value {
            header_parts.push(format!("{}:{}", name, value));
        }
    }

    format!(
        "{}:{}:{}:{}",
        input.method.as_str(),
        input.url,
        params_json,
        header_parts.join("|")
    )
}

/// Hash the canonical fingerprint into the final cache key.
pub fn hash_fingerprint(canonical: &str, hash: KeyHash) -> String {
    match hash {
        KeyHash::Sha256 => {
            let mut hasher = Sha256::new();
            hasher.update(canonical.as_bytes());
            format!("{:x}", hasher.finalize())
        }
        KeyHash::Fnv32 => format!("{:08x}", fnv1a_32(canonical.as_bytes())),
    }
}

fn fnv1a_32(bytes: &[u8]) -> u32 {
    const FNV_OFFSET: u32 = 0x811c_9dc5;
    const FNV_PRIME: u32 = 0x0100_0193;

    let mut hash = FNV_OFFSET;
    for byte in bytes {
        hash ^= u32::from(*byte);
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}
