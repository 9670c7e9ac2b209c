pub mod api;
pub mod connection;
pub mod error;
pub mod server;

pub use error::{ApiError, ServerError};
pub use server::{build_router, start, AppState, ServerConfig, ServerHandle};
