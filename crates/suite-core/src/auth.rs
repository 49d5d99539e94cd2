//! Suite-wide bearer token generation and verification. See spec §4.12.
//!
//! A single token is generated on first boot and persisted in the suite
//! config (`ConfigStore`); all inter-module HTTP calls and the suite's own
//! HTTP surface require `Authorization: Bearer <token>`. Tokens are never
//! logged (teacher precedent: `add-ons/pagi-gateway/src/diagnostics.rs`
//! redacts bearer tokens out of exported logs; here we simply never format
//! one into a log line in the first place).

use aes_gcm::aead::{rand_core::RngCore, OsRng};

const TOKEN_BYTES: usize = 32;

/// Generates a cryptographically random token, hex-encoded (>= 32 bytes, per spec §4.12).
pub fn generate_token() -> String {
    let mut bytes = [0u8; TOKEN_BYTES];
    OsRng.fill_bytes(&mut bytes);
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// Constant-time-ish comparison (length check first, then `subtle`-free XOR
/// fold) against timing leaks on the hot auth path. Returns false for a
/// missing header.
pub fn verify_bearer(header_value: Option<&str>, expected_token: &str) -> bool {
    let Some(header_value) = header_value else { return false };
    let Some(presented) = header_value.strip_prefix("Bearer ") else { return false };
    constant_time_eq(presented.as_bytes(), expected_token.as_bytes())
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff: u8 = 0;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_token_is_hex_and_long_enough() {
        let token = generate_token();
        assert_eq!(token.len(), TOKEN_BYTES * 2);
        assert!(token.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn verify_accepts_matching_bearer() {
        let token = generate_token();
        let header = format!("Bearer {token}");
        assert!(verify_bearer(Some(&header), &token));
    }

    #[test]
    fn verify_rejects_missing_or_wrong_token() {
        let token = generate_token();
        assert!(!verify_bearer(None, &token));
        assert!(!verify_bearer(Some("Bearer wrong"), &token));
        assert!(!verify_bearer(Some(&token), &token));
    }
}
