//! Small shared helpers.

use rand::Rng;
use rand::distributions::Alphanumeric;
use subtle::ConstantTimeEq;

/// Random URL-safe string of the given length (alphanumeric alphabet).
#[must_use]
pub fn rand_str(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

/// Constant-time string equality for secrets and signatures.
#[must_use]
pub fn secrets_equal(a: &str, b: &str) -> bool {
    a.as_bytes().ct_eq(b.as_bytes()).into()
}

#[cfg(test)]
mod tests {
    use super::{rand_str, secrets_equal};

    #[test]
    fn rand_str_length_and_alphabet() {
        let value = rand_str(64);
        assert_eq!(value.len(), 64);
        assert!(value.chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[test]
    fn rand_str_is_not_constant() {
        assert_ne!(rand_str(48), rand_str(48));
    }

    #[test]
    fn secrets_equal_matches_exactly() {
        assert!(secrets_equal("abc", "abc"));
        assert!(!secrets_equal("abc", "abd"));
        assert!(!secrets_equal("abc", "abcd"));
        assert!(!secrets_equal("abc", ""));
    }
}
