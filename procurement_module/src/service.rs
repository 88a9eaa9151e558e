mod config;
mod handlers;
mod server;
mod state;
mod verify;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

pub use config::{ServiceConfig, DEFAULT_INBOUND_BODY_MAX_BYTES, DEFAULT_SYSTEM_USER_EMAIL};
pub use server::{build_router, run_server};
pub use state::{AppState, Collaborators};
