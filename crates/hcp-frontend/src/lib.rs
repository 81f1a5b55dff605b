//! ARM resource-provider frontend for ARO HCP
//!
//! Admits create/update/delete/action requests as Operation records and
//! serves reads derived from them.

#![deny(missing_docs)]

pub mod arm;
pub mod middleware;
pub mod routes;
pub mod server;

pub use arm::CloudError;
pub use routes::AppState;
pub use server::{build_app, serve, ServerConfig};
