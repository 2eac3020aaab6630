//! Shared types for Handoff

mod error;

pub use error::{HandoffError, Result};
