//! Protocol clock and shared-secret signatures.

use std::sync::OnceLock;
use std::time::Instant;

use sha2::{Digest, Sha256};

static EPOCH: OnceLock<Instant> = OnceLock::new();

/// Monotonic milliseconds since the first call in this process.
#[must_use]
pub fn now() -> u64 {
    EPOCH.get_or_init(Instant::now).elapsed().as_millis() as u64
}

/// SHA-256 of `secret` as 64 lowercase hex characters.
#[must_use]
pub fn sign(secret: &str) -> String {
    let digest = Sha256::digest(secret.as_bytes());
    format!("{digest:x}")
}

/// Checks a handshake token against the configured secret.
///
/// No secret configured accepts anything.
#[must_use]
pub fn verify_token(token: Option<&str>, secret: Option<&str>) -> bool {
    let Some(secret) = secret else {
        return true;
    };
    let Some(token) = token else {
        return false;
    };
    let expected = sign(secret);
    if token.len() != expected.len() {
        return false;
    }
    token
        .bytes()
        .zip(expected.bytes())
        .fold(0u8, |acc, (a, b)| acc | (a ^ b))
        == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_is_lowercase_hex() {
        let token = sign("hunter2");
        assert_eq!(token.len(), 64);
        assert!(token.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
        assert_eq!(token, sign("hunter2"));
        assert_ne!(token, sign("hunter3"));
    }

    #[test]
    fn test_sign_known_vector() {
        assert_eq!(
            sign(""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn test_verify_token() {
        let good = sign("secret");
        assert!(verify_token(None, None));
        assert!(verify_token(Some("anything"), None));
        assert!(verify_token(Some(&good), Some("secret")));
        assert!(!verify_token(None, Some("secret")));
        assert!(!verify_token(Some(&sign("other")), Some("secret")));
        assert!(!verify_token(Some("short"), Some("secret")));
    }

    #[test]
    fn test_now_is_monotonic() {
        let a = now();
        std::thread::sleep(std::time::Duration::from_millis(5));
        let b = now();
        assert!(b >= a + 4);
    }
}
