//! HTTP server for Handoff

pub mod http;

pub use http::{run, AppState};
