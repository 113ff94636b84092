pub mod admin;
pub mod analysis;
pub mod health;
pub mod registration;

pub use health::{health_check, metrics, readiness_check};
