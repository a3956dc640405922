//! Message signing and verification
//!
//! `signature = HMAC_SHA256(api_key_hash, canonical_encoding)` where the
//! canonical encoding is sorted-key JSON with no whitespace, excluding the
//! signature field itself. Both parties can derive the key: the agent
//! hashes its plaintext key, the service stores only the hash.

use hmac::{Hmac, Mac};
use serde_json::{Map, Value};
use sha2::Sha256;
use subtle::ConstantTimeEq;

use super::DialecticMessage;

type HmacSha256 = Hmac<Sha256>;

fn canonicalize(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let mut sorted = Map::new();
            for key in keys {
                sorted.insert(key.clone(), canonicalize(&map[key]));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.iter().map(canonicalize).collect()),
        other => other.clone(),
    }
}

/// Sorted-key, whitespace-free encoding of the message without its
/// signature.
pub fn canonical_encoding(message: &DialecticMessage) -> String {
    let mut value = serde_json::to_value(message).unwrap_or(Value::Null);
    if let Value::Object(map) = &mut value {
        map.remove("signature");
    }
    canonicalize(&value).to_string()
}

/// Sign a message's canonical encoding with the author's key hash.
pub fn sign_message(message: &DialecticMessage, api_key_hash: &str) -> String {
    let mut mac = HmacSha256::new_from_slice(api_key_hash.as_bytes())
        .expect("hmac accepts any key length");
    mac.update(canonical_encoding(message).as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// Verify the carried signature in constant time.
pub fn verify_signature(message: &DialecticMessage, api_key_hash: &str) -> bool {
    let expected = sign_message(message, api_key_hash);
    let a = expected.as_bytes();
    let b = message.signature.as_bytes();
    if a.len() != b.len() {
        return false;
    }
    a.ct_eq(b).into()
}
