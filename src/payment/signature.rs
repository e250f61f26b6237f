//! Gateway callback signatures: `hex(HMAC-SHA256(secret, "<order>|<payment>"))`.

use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::error::AppError;

type HmacSha256 = Hmac<Sha256>;

pub fn hmac_sha256_hex(secret: &str, message: &str) -> Result<String, AppError> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|err| AppError::Internal(format!("invalid hmac key: {err}")))?;
    mac.update(message.as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

pub fn sign(secret: &str, order_id: &str, payment_id: &str) -> Result<String, AppError> {
    hmac_sha256_hex(secret, &format!("{order_id}|{payment_id}"))
}

pub fn verify(
    secret: &str,
    order_id: &str,
    payment_id: &str,
    signature: &str,
) -> Result<bool, AppError> {
    let expected = sign(secret, order_id, payment_id)?;
    Ok(constant_time_eq(&expected, &signature.to_ascii_lowercase()))
}

/// Compares without short-circuiting on the first differing byte.
pub fn constant_time_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.bytes()
        .zip(b.bytes())
        .fold(0u8, |acc, (x, y)| acc | (x ^ y))
        == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matches_the_published_test_vector() {
        let mac = hmac_sha256_hex("key", "The quick brown fox jumps over the lazy dog").unwrap();
        assert_eq!(
            mac,
            "f7bc83f430538424b13298e6aa6fb143ef4d59a14946175997479dbc2d1a3cd8"
        );
    }

    #[test]
    fn signature_binds_order_and_payment() {
        let signature = sign("secret", "order_1", "pay_1").unwrap();
        assert!(verify("secret", "order_1", "pay_1", &signature).unwrap());
        assert!(verify("secret", "order_1", "pay_1", &signature.to_uppercase()).unwrap());
        assert!(!verify("secret", "order_1", "pay_2", &signature).unwrap());
        assert!(!verify("other", "order_1", "pay_1", &signature).unwrap());
    }

    #[test]
    fn constant_time_eq_handles_length_mismatch() {
        assert!(constant_time_eq("abc", "abc"));
        assert!(!constant_time_eq("abc", "abd"));
        assert!(!constant_time_eq("abc", "ab"));
    }
}
