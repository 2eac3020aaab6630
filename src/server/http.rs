//! HTTP front door
//!
//! One tokio task per connection, each served by hyper's http1 builder.
//! Dispatch is a match on method and path; anything under `/api/v1/` is
//! handed to the fulfillment API router.

use bytes::Bytes;
use http_body_util::{combinators::BoxBody as HttpBoxBody, BodyExt, Full};
use hyper::body::Incoming;
use hyper::header::{
    HeaderValue, ACCESS_CONTROL_ALLOW_HEADERS, ACCESS_CONTROL_ALLOW_METHODS,
    ACCESS_CONTROL_ALLOW_ORIGIN,
};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

use crate::cache::LocalCache;
use crate::config::Args;
use crate::routes;
use crate::services::Handoff;
use crate::types::HandoffError;

type BoxBody = HttpBoxBody<Bytes, hyper::Error>;

/// Everything a request handler can reach
pub struct AppState {
    pub args: Args,
    pub handoff: Handoff,
    /// Present only with the in-process cache; feeds `/health` stats
    pub local_cache: Option<Arc<LocalCache>>,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(args: Args, handoff: Handoff, local_cache: Option<Arc<LocalCache>>) -> Self {
        Self {
            args,
            handoff,
            local_cache,
            started_at: Instant::now(),
        }
    }
}

/// Bind and serve forever. Only a bind failure returns.
pub async fn run(state: Arc<AppState>) -> Result<(), HandoffError> {
    let listener = TcpListener::bind(state.args.listen).await?;
    let ctx = state.handoff.context();
    info!(
        listen = %state.args.listen,
        node = %state.args.node_id,
        store = state.handoff.store_backend(),
        bus = ctx.publisher.bus_name(),
        cache = ctx.views.backend_name(),
        "Handoff accepting connections"
    );
    if state.args.dev_mode {
        warn!("Dev mode: X-User-Id is trusted as-is");
    }

    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!(error = %e, "accept failed");
                continue;
            }
        };
        tokio::spawn(serve_connection(Arc::clone(&state), stream, peer));
    }
}

async fn serve_connection(state: Arc<AppState>, stream: TcpStream, peer: SocketAddr) {
    let service = service_fn(move |req| {
        let state = Arc::clone(&state);
        async move { Ok::<_, hyper::Error>(handle(state, peer, req).await) }
    });

    let served = http1::Builder::new()
        .title_case_headers(true)
        .serve_connection(TokioIo::new(stream), service)
        .await;
    if let Err(e) = served {
        debug!(%peer, error = %e, "connection closed with error");
    }
}

async fn handle(
    state: Arc<AppState>,
    peer: SocketAddr,
    req: Request<Incoming>,
) -> Response<BoxBody> {
    let started = Instant::now();
    let method = req.method().clone();
    let path = req.uri().path().to_owned();

    let mut response = boxed(dispatch(state, req, &method, &path).await);
    allow_any_origin(&mut response);

    debug!(
        %peer,
        %method,
        path = %path,
        status = response.status().as_u16(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "request"
    );
    response
}

async fn dispatch(
    state: Arc<AppState>,
    req: Request<Incoming>,
    method: &Method,
    path: &str,
) -> Response<Full<Bytes>> {
    match (method, path) {
        (&Method::OPTIONS, _) => {
            let mut preflight = Response::new(Full::new(Bytes::new()));
            *preflight.status_mut() = StatusCode::NO_CONTENT;
            preflight
        }
        (&Method::GET, "/health" | "/healthz") => routes::health_check(state),
        (&Method::GET, "/version") => routes::version_info(),
        (_, p) if p.starts_with(routes::API_PREFIX) => {
            routes::handle_api_request(req, state, p).await
        }
        _ => routes::error_response(&HandoffError::NotFound(format!(
            "no route for {method} {path}"
        ))),
    }
}

fn allow_any_origin<B>(response: &mut Response<B>) {
    let headers = response.headers_mut();
    headers.insert(ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("*"));
    headers.insert(ACCESS_CONTROL_ALLOW_HEADERS, HeaderValue::from_static("*"));
    headers.insert(
        ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static("GET, POST, OPTIONS"),
    );
}

fn boxed(response: Response<Full<Bytes>>) -> Response<BoxBody> {
    response.map(|body| body.map_err(|never| match never {}).boxed())
}
