use rand::{distributions::Alphanumeric, Rng};
use sha2::{Digest, Sha256};

/// SHA-256 hex digest. Bearer tokens and recovery codes are only ever
/// stored in this form.
pub fn hash_token(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}

/// Recovery codes look like `ABCD-EFGH`; comparison is case-insensitive.
pub fn generate_recovery_code() -> String {
    let raw: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(8)
        .map(|c| (c as char).to_ascii_uppercase())
        .collect();
    format!("{}-{}", &raw[..4], &raw[4..])
}

pub fn normalize_recovery_code(code: &str) -> String {
    code.trim().to_ascii_uppercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_token_is_stable_hex() {
        let a = hash_token("abc");
        assert_eq!(a, hash_token("abc"));
        assert_eq!(a.len(), 64);
        assert_ne!(a, hash_token("abd"));
    }

    #[test]
    fn test_recovery_code_shape() {
        let code = generate_recovery_code();
        assert_eq!(code.len(), 9);
        assert_eq!(&code[4..5], "-");
        assert_eq!(code, normalize_recovery_code(&code.to_lowercase()));
    }
}
