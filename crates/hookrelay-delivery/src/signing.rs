//! HMAC-SHA256 payload signatures.
//!
//! The signature is computed over the exact bytes placed on the wire, never
//! over a re-serialized form, and sent hex-encoded in [`SIGNATURE_HEADER`].

use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::error::{DeliveryError, Result};

type HmacSha256 = Hmac<Sha256>;

/// Header carrying the hex signature.
pub const SIGNATURE_HEADER: &str = "X-Signature-SHA256";

/// Lowercase hex HMAC-SHA256 of `payload` keyed with `secret`.
///
/// # Errors
///
/// Returns `DeliveryError::InvalidRequest` if the key is rejected. HMAC
/// accepts keys of any length, so this only guards the API contract.
pub fn sign_payload(secret: &[u8], payload: &[u8]) -> Result<String> {
    let mut mac = HmacSha256::new_from_slice(secret)
        .map_err(|e| DeliveryError::invalid_request(format!("invalid signing key: {e}")))?;
    mac.update(payload);
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Checks a hex signature in constant time.
pub fn verify_signature(secret: &[u8], payload: &[u8], signature_hex: &str) -> bool {
    let Ok(signature) = hex::decode(signature_hex.trim()) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret) else {
        return false;
    };
    mac.update(payload);
    mac.verify_slice(&signature).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_is_lowercase_hex_of_sha256_width() {
        let signature = sign_payload(b"abc", b"hello").unwrap();
        assert_eq!(signature.len(), 64);
        assert!(signature.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn signature_matches_independent_computation() {
        let mut mac = HmacSha256::new_from_slice(b"abc").unwrap();
        mac.update(b"hello");
        let expected = hex::encode(mac.finalize().into_bytes());

        assert_eq!(sign_payload(b"abc", b"hello").unwrap(), expected);
    }

    #[test]
    fn any_byte_change_changes_signature() {
        let original = sign_payload(b"abc", b"hello").unwrap();
        assert_ne!(sign_payload(b"abc", b"hellp").unwrap(), original);
        assert_ne!(sign_payload(b"abc", b"hello ").unwrap(), original);
        assert_ne!(sign_payload(b"abd", b"hello").unwrap(), original);
    }

    #[test]
    fn verification_round_trip() {
        let signature = sign_payload(b"secret", b"{\"a\":1}").unwrap();
        assert!(verify_signature(b"secret", b"{\"a\":1}", &signature));
        assert!(!verify_signature(b"secret", b"{\"a\":2}", &signature));
        assert!(!verify_signature(b"secret", b"{\"a\":1}", "not-hex"));
    }

    #[test]
    fn empty_secret_is_accepted() {
        assert!(sign_payload(b"", b"hello").is_ok());
    }
}
