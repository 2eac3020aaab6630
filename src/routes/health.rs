//! Health check endpoints
//!
//! - /health, /healthz - Liveness probe with backend and cache status
//! - /version - Build info for deployment verification
//!
//! The service reports healthy whenever it is serving; a degraded cache or
//! bus never blocks fulfillment, so neither affects the probe.

use bytes::Bytes;
use http_body_util::Full;
use hyper::{Response, StatusCode};
use serde::Serialize;
use std::sync::Arc;

use super::json_response;
use crate::cache::CacheStats;
use crate::server::AppState;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub healthy: bool,
    pub version: &'static str,
    pub git_commit: &'static str,
    pub node_id: String,
    /// "development" or "production"
    pub mode: &'static str,
    pub uptime: u64,
    pub timestamp: String,
    pub store: &'static str,
    pub bus: &'static str,
    pub cache: CacheHealth,
}

#[derive(Serialize)]
pub struct CacheHealth {
    pub backend: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stats: Option<CacheStats>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionInfo {
    pub version: &'static str,
    pub git_commit: &'static str,
    pub build_timestamp: &'static str,
}

pub fn health_check(state: Arc<AppState>) -> Response<Full<Bytes>> {
    let ctx = state.handoff.context();

    let response = HealthResponse {
        healthy: true,
        version: env!("CARGO_PKG_VERSION"),
        git_commit: env!("GIT_COMMIT_SHORT"),
        node_id: state.args.node_id.to_string(),
        mode: if state.args.dev_mode {
            "development"
        } else {
            "production"
        },
        uptime: state.started_at.elapsed().as_secs(),
        timestamp: chrono::Utc::now().to_rfc3339(),
        store: state.handoff.store_backend(),
        bus: ctx.publisher.bus_name(),
        cache: CacheHealth {
            backend: ctx.views.backend_name(),
            stats: state.local_cache.as_ref().map(|c| c.stats()),
        },
    };

    json_response(StatusCode::OK, &response)
}

pub fn version_info() -> Response<Full<Bytes>> {
    json_response(
        StatusCode::OK,
        &VersionInfo {
            version: env!("CARGO_PKG_VERSION"),
            git_commit: env!("GIT_COMMIT_SHORT"),
            build_timestamp: env!("BUILD_TIMESTAMP"),
        },
    )
}
