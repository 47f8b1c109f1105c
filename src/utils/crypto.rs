use base64::{engine::general_purpose, Engine as _};
use rand::RngCore;
use sha2::Sha256;
use subtle::ConstantTimeEq;

pub const KDF_ITERATIONS: u32 = 260_000;
pub const SALT_LEN: usize = 32;
pub const DERIVED_KEY_LEN: usize = 64;

/// Derive the stored digest for a raw API key. Salt and digest travel base64.
pub fn derive_key_hash(raw_key: &str, salt: &[u8], iterations: u32) -> Vec<u8> {
    let mut derived = vec![0u8; DERIVED_KEY_LEN];
    pbkdf2::pbkdf2_hmac::<Sha256>(raw_key.as_bytes(), salt, iterations, &mut derived);
    derived
}

pub fn hash_api_key(raw_key: &str) -> (String, String) {
    let mut salt = [0u8; SALT_LEN];
    rand::thread_rng().fill_bytes(&mut salt);
    let derived = derive_key_hash(raw_key, &salt, KDF_ITERATIONS);
    (
        general_purpose::STANDARD.encode(salt),
        general_purpose::STANDARD.encode(derived),
    )
}

pub fn verify_api_key(raw_key: &str, salt_b64: &str, hash_b64: &str, iterations: u32) -> bool {
    let Ok(salt) = general_purpose::STANDARD.decode(salt_b64) else {
        return false;
    };
    let Ok(expected) = general_purpose::STANDARD.decode(hash_b64) else {
        return false;
    };
    let derived = derive_key_hash(raw_key, &salt, iterations);
    derived.ct_eq(&expected).into()
}

/// New raw key: `sk-proj-` + 48 hex chars. Shown to the creator exactly once.
pub fn generate_api_key() -> String {
    let mut bytes = [0u8; 24];
    rand::thread_rng().fill_bytes(&mut bytes);
    let hex: String = bytes.iter().map(|b| format!("{:02x}", b)).collect();
    format!("{}{}", crate::constants::API_KEY_PREFIX, hex)
}

pub fn constant_time_str_eq(left: &str, right: &str) -> bool {
    let left_bytes = left.as_bytes();
    let right_bytes = right.as_bytes();
    let max_len = left_bytes.len().max(right_bytes.len());
    let mut diff = left_bytes.len() ^ right_bytes.len();

    for i in 0..max_len {
        let l = left_bytes.get(i).copied().unwrap_or(0);
        let r = right_bytes.get(i).copied().unwrap_or(0);
        diff |= (l ^ r) as usize;
    }

    diff == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_key_has_expected_shape() {
        let key = generate_api_key();
        assert!(key.starts_with("sk-proj-"));
        assert_eq!(key.len(), crate::constants::API_KEY_MIN_LEN);
        assert!(key["sk-proj-".len()..]
            .chars()
            .all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn hash_and_verify_round_trip() {
        let raw = generate_api_key();
        let (salt, hash) = hash_api_key(&raw);
        assert!(verify_api_key(&raw, &salt, &hash, KDF_ITERATIONS));
        assert!(!verify_api_key("sk-proj-wrong", &salt, &hash, KDF_ITERATIONS));
    }

    #[test]
    fn verify_rejects_garbage_encodings() {
        assert!(!verify_api_key("sk-proj-x", "not base64!!", "also not", KDF_ITERATIONS));
    }

    #[test]
    fn constant_time_compare_matches_and_rejects() {
        assert!(constant_time_str_eq("abc123", "abc123"));
        assert!(!constant_time_str_eq("abc123", "abc124"));
        assert!(!constant_time_str_eq("abc123", "abc1234"));
    }
}
