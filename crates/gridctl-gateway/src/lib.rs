pub mod a2a_routes;
pub mod api_routes;
pub mod app;
pub mod auth;
pub mod error;
pub mod mcp_routes;
pub mod sse;
pub mod state;

pub use app::{build_app, serve};
pub use state::{AppState, LogBuffer, LogLayer};
