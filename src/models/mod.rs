pub mod auth;
pub mod availability;
pub mod booking;
pub mod daycare;
pub mod earning;
pub mod provider;
pub mod user;
