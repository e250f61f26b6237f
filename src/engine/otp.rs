use rand::Rng;

use crate::error::AppError;

pub const OTP_LEN: usize = 4;

/// Fresh four-digit ride OTP, never starting with zero.
pub fn generate() -> String {
    rand::thread_rng().gen_range(1000..=9999).to_string()
}

pub fn validate_format(otp: &str) -> Result<(), AppError> {
    if otp.len() != OTP_LEN || !otp.bytes().all(|b| b.is_ascii_digit()) {
        return Err(AppError::BadRequest(format!(
            "otp must be exactly {OTP_LEN} digits"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_otps_are_four_digits() {
        for _ in 0..1_000 {
            let otp = generate();
            assert!(validate_format(&otp).is_ok(), "bad otp {otp}");
            assert!(!otp.starts_with('0'));
        }
    }

    #[test]
    fn malformed_otps_are_rejected() {
        for otp in ["", "123", "12345", "12a4", "１２３４"] {
            assert!(validate_format(otp).is_err(), "accepted {otp:?}");
        }
    }
}
