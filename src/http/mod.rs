//! HTTP surface: middleware composition, admin API and servers.

mod admin;
mod app;
mod server;
mod stack;

pub use admin::{admin_router, GovernanceStats, RollbackRequest, RollbackResponse, MANUAL_ROLLBACK_REASON};
pub use app::app_router;
pub use server::{serve_listener, HttpServer};
pub use stack::GovernanceStack;
