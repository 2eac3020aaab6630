//! Handoff - donation fulfillment service
//!
//! Takes a posted donation from "available" to "completed": one recipient
//! claims it, the goods change hands by self-pickup, a volunteer run or a
//! donor drop-off, the recipient confirms receipt and the donor signs off.
//!
//! ## Components
//!
//! - **Store**: authoritative persistence (MongoDB or in-memory), every write conditional
//! - **Services**: claim arbitration, fulfillment state machines, confirmation, notifications
//! - **Cache**: read-through views with prefix invalidation, never authoritative
//! - **NATS**: live status and notification events, best-effort
//! - **Server**: JSON HTTP API over hyper

pub mod cache;
pub mod config;
pub mod db;
pub mod nats;
pub mod routes;
pub mod server;
pub mod services;
pub mod store;
pub mod types;

pub use config::Args;
pub use server::{run, AppState};
pub use services::Handoff;
pub use types::{HandoffError, Result};
