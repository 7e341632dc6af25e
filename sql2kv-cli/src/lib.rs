//! HTTP front end for the bulk-load bridge: configuration, routes and
//! process wiring around `sql2kv-core`.

pub mod api;
pub mod config;
pub mod server;

pub use api::{ApiError, ApiState, create_api_routes};
pub use config::{Cli, ServerConfig};
