//! PKCE verifier/state generation and S256 challenge

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use rand::Rng;
use sha2::{Digest, Sha256};

/// Unreserved characters allowed in a PKCE code verifier
pub const VERIFIER_CHARS: &[u8] =
    b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz-._~";

/// Length of generated verifiers and state values (PKCE allows 43-128)
pub const RANDOM_STRING_LEN: usize = 64;

/// Random string drawn uniformly from `VERIFIER_CHARS`
pub fn generate_random_string(len: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..len)
        .map(|_| VERIFIER_CHARS[rng.gen_range(0..VERIFIER_CHARS.len())] as char)
        .collect()
}

/// Base64url(SHA-256(verifier)) without padding
pub fn code_challenge_s256(verifier: &str) -> String {
    let digest = Sha256::digest(verifier.as_bytes());
    URL_SAFE_NO_PAD.encode(digest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_random_string_alphabet_and_length() {
        let value = generate_random_string(RANDOM_STRING_LEN);
        assert_eq!(value.len(), 64);
        assert!(value.bytes().all(|b| VERIFIER_CHARS.contains(&b)));
    }

    #[test]
    fn test_random_strings_differ() {
        assert_ne!(
            generate_random_string(RANDOM_STRING_LEN),
            generate_random_string(RANDOM_STRING_LEN)
        );
    }

    #[test]
    fn test_challenge_matches_rfc7636_vector() {
        // RFC 7636 appendix B
        let challenge = code_challenge_s256("dBjftJeZ4CVP-mB92K27uhbUJU1p1r_wW1gFWFOEjXk");
        assert_eq!(challenge, "E9Melhoa2OwvFrEMTJguCHaoeK1t8URWbuGJSstw-cM");
    }

    #[test]
    fn test_challenge_is_url_safe() {
        for _ in 0..32 {
            let challenge = code_challenge_s256(&generate_random_string(RANDOM_STRING_LEN));
            assert_eq!(challenge.len(), 43);
            assert!(!challenge.contains(['+', '/', '=']));
        }
    }

    proptest! {
        #[test]
        fn prop_random_string_stays_in_alphabet(len in 0usize..256) {
            let value = generate_random_string(len);
            prop_assert_eq!(value.len(), len);
            prop_assert!(value.bytes().all(|b| VERIFIER_CHARS.contains(&b)));
        }

        #[test]
        fn prop_challenge_is_43_url_safe_chars(verifier in "[A-Za-z0-9._~-]{43,128}") {
            let challenge = code_challenge_s256(&verifier);
            prop_assert_eq!(challenge.len(), 43);
            prop_assert!(challenge
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_'));
        }
    }
}
