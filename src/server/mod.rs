//! HTTP server for Covenant

pub mod http;

pub use http::{run, AppState};
