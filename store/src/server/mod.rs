//! HTTP API of the store node.

mod config;
mod error;
pub mod handlers;
pub mod http;
pub mod metrics;
mod middleware;
mod response;

pub use config::CliArgs;
pub use error::ApiError;
pub use handlers::AppState;
pub use http::{StoreServer, build_router, serve};
pub use metrics::Metrics;
