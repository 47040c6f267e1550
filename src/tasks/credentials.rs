//! Credential digests and one-time verification codes.
//!
//! Clear-text credentials only ever exist inside a task's request fields; the
//! store sees the hex digest.

use sha2::{Digest, Sha256};
use uuid::Uuid;

/// SHA-256 hex digest of a credential
pub fn credential_digest(credential: &str) -> String {
    hex::encode(Sha256::digest(credential.as_bytes()))
}

/// Compare a stored digest with the digest of a supplied credential
pub fn digest_matches(stored_digest: &str, credential: &str) -> bool {
    stored_digest.eq_ignore_ascii_case(&credential_digest(credential))
}

/// Fresh one-time code: random UUID followed by the digest of `seed`
pub fn generate_verification_code(seed: &str) -> String {
    let mut code = Uuid::new_v4().simple().to_string();
    code.push_str(&credential_digest(seed));
    code
}

/// Loose address check applied before a code is mailed out
pub fn is_valid_email(address: &str) -> bool {
    if address.len() > 254 || address.chars().any(char::is_whitespace) {
        return false;
    }
    let Some((local, domain)) = address.split_once('@') else {
        return false;
    };
    !local.is_empty()
        && !domain.contains('@')
        && domain.contains('.')
        && domain.split('.').all(|label| !label.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_digest_is_stable_hex() {
        let digest = credential_digest("pw1");
        assert_eq!(digest.len(), 64);
        assert_eq!(digest, credential_digest("pw1"));
        assert_ne!(digest, credential_digest("pw2"));
        assert!(digest_matches(&digest.to_uppercase(), "pw1"));
        assert!(!digest_matches(&digest, "pw2"));
    }

    #[test]
    fn test_codes_are_unique() {
        let first = generate_verification_code("alice");
        let second = generate_verification_code("alice");
        assert_ne!(first, second);
        assert_eq!(first.len(), 32 + 64);
        assert!(first.ends_with(&credential_digest("alice")));
    }

    #[test]
    fn test_email_validation() {
        assert!(is_valid_email("alice@example.com"));
        assert!(is_valid_email("a.b@mail.example.org"));
        assert!(!is_valid_email("alice"));
        assert!(!is_valid_email("@example.com"));
        assert!(!is_valid_email("alice@localhost"));
        assert!(!is_valid_email("alice@example..com"));
        assert!(!is_valid_email("alice@@example.com"));
        assert!(!is_valid_email("al ice@example.com"));
    }
}
