//! Request signing
//!
//! Canonicalization and HMAC signing of the registration envelope, plus
//! the short `reqsign` signature attached to share-mode requests.

use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

use hmac::{Hmac, Mac};
use md5::Md5;
use sha2::{Digest, Sha256};

type HmacSha256 = Hmac<Sha256>;

const CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

/// Current unix time in seconds.
pub fn unix_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// 16 random bytes as 32 lowercase hex characters.
pub fn nonce() -> String {
    let mut bytes = [0u8; 16];
    // getrandom only fails when the OS entropy source is unusable.
    let _ = getrandom::fill(&mut bytes);
    hex::encode(bytes)
}

/// Random lowercase alphanumeric string from the OS RNG.
pub fn random_alphanumeric(length: usize) -> String {
    let mut bytes = vec![0u8; length];
    let _ = getrandom::fill(&mut bytes);
    bytes
        .iter()
        .map(|b| CHARSET[*b as usize % CHARSET.len()] as char)
        .collect()
}

/// Canonical signing string: `k1=urlencode(v1)&k2=urlencode(v2)&...` in
/// sorted key order, no trailing separator.
pub fn canonical_message(params: &BTreeMap<String, String>) -> String {
    params
        .iter()
        .map(|(k, v)| format!("{}={}", k, query_escape(v)))
        .collect::<Vec<_>>()
        .join("&")
}

/// Form-encode the parameters for the POST body (same sorted order).
pub fn encode_form(params: &BTreeMap<String, String>) -> String {
    let mut serializer = url::form_urlencoded::Serializer::new(String::new());
    for (k, v) in params {
        serializer.append_pair(k, v);
    }
    serializer.finish()
}

/// Hex HMAC-SHA256 over `message`.
pub fn hmac_sha256_hex(secret: &str, message: &str) -> String {
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC can take key of any size");
    mac.update(message.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// Request signature: `<ts>-<rand16>-<md5_hex(path@ts@rand16@secret)>`.
pub fn req_sign(path: &str, secret: &str) -> String {
    let timestamp = unix_timestamp();
    let random = random_alphanumeric(16);
    let sign_input = format!("{path}@{timestamp}@{random}@{secret}");
    let hash = hex::encode(Md5::digest(sign_input.as_bytes()));
    format!("{timestamp}-{random}-{hash}")
}

fn query_escape(value: &str) -> String {
    url::form_urlencoded::byte_serialize(value.as_bytes()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_canonical_message_sorts_and_escapes() {
        let p = params(&[("timestamp", "170000"), ("key", "abc 123"), ("nonce", "ff")]);
        assert_eq!(
            canonical_message(&p),
            "key=abc+123&nonce=ff&timestamp=170000"
        );
    }

    #[test]
    fn test_canonicalization_is_stable_under_insert_order() {
        let a = params(&[("b", "2"), ("a", "1"), ("c", "3")]);
        let c = params(&[("c", "3"), ("a", "1"), ("b", "2")]);
        assert_eq!(canonical_message(&a), canonical_message(&c));
        assert_eq!(
            hmac_sha256_hex("secret", &canonical_message(&a)),
            hmac_sha256_hex("secret", &canonical_message(&c))
        );
    }

    #[test]
    fn test_hmac_known_vector() {
        // HMAC-SHA256("key", "The quick brown fox jumps over the lazy dog")
        assert_eq!(
            hmac_sha256_hex("key", "The quick brown fox jumps over the lazy dog"),
            "f7bc83f430538424b13298e6aa6fb143ef4d59a14946175997479dbc2d1a3cd8"
        );
    }

    #[test]
    fn test_nonce_shape() {
        let n = nonce();
        assert_eq!(n.len(), 32);
        assert!(n.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(nonce(), nonce());
    }

    #[test]
    fn test_random_alphanumeric_charset() {
        let s = random_alphanumeric(16);
        assert_eq!(s.len(), 16);
        assert!(s
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()));
    }

    #[test]
    fn test_req_sign_shape() {
        let sign = req_sign("/api/adm/v1/registNode", "s3cret");
        let parts: Vec<&str> = sign.splitn(3, '-').collect();
        assert_eq!(parts.len(), 3);
        assert!(parts[0].parse::<u64>().is_ok());
        assert_eq!(parts[1].len(), 16);
        assert_eq!(parts[2].len(), 32);
        assert!(parts[2].chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_encode_form_matches_sorted_order() {
        let p = params(&[("version", "1.0"), ("key", "k"), ("nonce", "n")]);
        assert_eq!(encode_form(&p), "key=k&nonce=n&version=1.0");
    }
}
