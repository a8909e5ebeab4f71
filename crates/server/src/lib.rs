//! HTTP server for the ferry resumable upload engine.
//!
//! This crate provides:
//! - tus 1.0 upload endpoints backed by the upload session manager
//! - Edge/direct routing decisions and presigned direct uploads
//! - Batch completion and asynchronous webhook notifications
//! - Background expiry of idle sessions and restart recovery

pub mod error;
pub mod handlers;
pub mod metrics;
pub mod notify;
pub mod routes;
pub mod sessions;
pub mod state;
pub mod sweeper;

pub use error::ApiError;
pub use notify::NotificationHub;
pub use routes::create_router;
pub use sessions::SessionManager;
pub use state::AppState;
