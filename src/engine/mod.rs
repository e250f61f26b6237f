pub mod dispatch;
pub mod fare;
pub mod location;
pub mod otp;
pub mod pending;
pub mod rides;
