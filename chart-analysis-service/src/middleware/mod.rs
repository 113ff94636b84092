pub mod admin;

pub use admin::admin_session_middleware;
