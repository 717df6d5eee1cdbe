pub mod availability;
pub mod bookings;
pub mod confirmation;
pub mod daycare;
pub mod earnings;
pub mod late_fee;
pub mod medical;
pub mod notifications;
pub mod otp_limit;
pub mod sweep;
pub mod trust;
