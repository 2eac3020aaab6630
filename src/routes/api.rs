//! Fulfillment JSON API
//!
//! Every operation is exposed under `/api/v1/`. The acting user comes from the
//! `X-User-Id` header; identity is trusted as given.
//!
//! ```text
//! POST /api/v1/donations                             post a donation
//! GET  /api/v1/donations?status=&category=&...       list donations
//! GET  /api/v1/donations/{id}
//! POST /api/v1/donations/{id}/reserve                {recipient_id}
//! POST /api/v1/donations/{id}/release
//! POST /api/v1/donations/{id}/withdraw
//! POST /api/v1/donations/{id}/claims                 {quantity}
//! GET  /api/v1/claims                                caller's claims
//! GET  /api/v1/claims/{id}
//! POST /api/v1/claims/{id}/pickup-collected
//! POST /api/v1/claims/{id}/cancel
//! POST /api/v1/claims/{id}/confirm-receipt
//! POST /api/v1/claims/{id}/confirm-donor             pickup sign-off
//! POST /api/v1/deliveries/{id}/assign
//! POST /api/v1/deliveries/{id}/status                {status}
//! POST /api/v1/deliveries/{id}/confirm-donor
//! POST /api/v1/direct-deliveries/{id}/status         {status, scheduled_for?, reason?}
//! POST /api/v1/direct-deliveries/{id}/confirm-donor
//! GET  /api/v1/tasks/open
//! GET  /api/v1/tasks/mine
//! GET  /api/v1/tracking/{claim_id}
//! GET  /api/v1/notifications
//! GET  /api/v1/notifications/unread-count
//! POST /api/v1/notifications/{id}/read
//! POST /api/v1/admin/expire-donations
//! ```

use bytes::Bytes;
use chrono::{DateTime, Utc};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::{Method, Request, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::sync::Arc;

use super::{error_response, json_response};
use crate::db::schemas::{
    DeliveryMode, DeliveryStatus, Destination, DirectDeliveryStatus, DonationStatus, NewDonation,
};
use crate::server::AppState;
use crate::services::Handoff;
use crate::store::DonationFilter;
use crate::types::{HandoffError, Result};

pub const API_PREFIX: &str = "/api/v1/";

/// Header carrying the acting user's id
pub const USER_HEADER: &str = "x-user-id";

// =============================================================================
// Request Types
// =============================================================================

#[derive(Debug, Default, Deserialize)]
struct PageQuery {
    limit: Option<u32>,
    offset: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct DonationListQuery {
    status: Option<DonationStatus>,
    category: Option<String>,
    delivery_mode: Option<DeliveryMode>,
    destination: Option<Destination>,
    donor_id: Option<String>,
    limit: Option<u32>,
    offset: Option<u64>,
}

impl DonationListQuery {
    fn filter(&self) -> DonationFilter {
        DonationFilter {
            status: self.status,
            category: self.category.clone(),
            delivery_mode: self.delivery_mode,
            destination: self.destination,
            donor_id: self.donor_id.clone(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ReserveRequest {
    recipient_id: String,
}

#[derive(Debug, Deserialize)]
struct ClaimRequest {
    quantity: u32,
}

#[derive(Debug, Deserialize)]
struct DeliveryStatusRequest {
    status: DeliveryStatus,
}

#[derive(Debug, Deserialize)]
struct DirectStatusRequest {
    status: DirectDeliveryStatus,
    #[serde(default)]
    scheduled_for: Option<DateTime<Utc>>,
    #[serde(default)]
    reason: Option<String>,
}

// =============================================================================
// Router
// =============================================================================

pub async fn handle_api_request(
    req: Request<Incoming>,
    state: Arc<AppState>,
    path: &str,
) -> Response<Full<Bytes>> {
    match route(req, &state.handoff, path).await {
        Ok(response) => response,
        Err(err) => error_response(&err),
    }
}

async fn route(
    req: Request<Incoming>,
    handoff: &Handoff,
    path: &str,
) -> Result<Response<Full<Bytes>>> {
    let method = req.method().clone();
    let query = req.uri().query().unwrap_or("").to_string();
    let caller = caller_id(&req);

    let segments: Vec<&str> = path
        .strip_prefix(API_PREFIX)
        .unwrap_or("")
        .split('/')
        .filter(|s| !s.is_empty())
        .collect();

    match (method, segments.as_slice()) {
        // -- donations ---------------------------------------------------------
        (Method::POST, ["donations"]) => {
            let donor_id = require_caller(&caller)?;
            let attrs: NewDonation = read_json(req).await?;
            let donation = handoff.post_donation(donor_id, attrs).await?;
            Ok(json_response(StatusCode::CREATED, &donation))
        }
        (Method::GET, ["donations"]) => {
            let q: DonationListQuery = read_query(&query)?;
            let page = handoff.page(q.limit, q.offset);
            let donations = handoff.list_donations(&q.filter(), page).await?;
            Ok(json_response(StatusCode::OK, &donations))
        }
        (Method::GET, ["donations", id]) => {
            Ok(json_response(StatusCode::OK, &handoff.get_donation(id).await?))
        }
        (Method::POST, ["donations", id, "reserve"]) => {
            let donor_id = require_caller(&caller)?;
            let body: ReserveRequest = read_json(req).await?;
            let donation = handoff
                .reserve_donation(id, donor_id, &body.recipient_id)
                .await?;
            Ok(json_response(StatusCode::OK, &donation))
        }
        (Method::POST, ["donations", id, "release"]) => {
            let donor_id = require_caller(&caller)?;
            let donation = handoff.release_reservation(id, donor_id).await?;
            Ok(json_response(StatusCode::OK, &donation))
        }
        (Method::POST, ["donations", id, "withdraw"]) => {
            let donor_id = require_caller(&caller)?;
            let donation = handoff.withdraw_donation(id, donor_id).await?;
            Ok(json_response(StatusCode::OK, &donation))
        }
        (Method::POST, ["donations", id, "claims"]) => {
            let recipient_id = require_caller(&caller)?;
            let body: ClaimRequest = read_json(req).await?;
            let claim = handoff.create_claim(id, recipient_id, body.quantity).await?;
            Ok(json_response(StatusCode::CREATED, &claim))
        }

        // -- claims ------------------------------------------------------------
        (Method::GET, ["claims"]) => {
            let recipient_id = require_caller(&caller)?;
            let q: PageQuery = read_query(&query)?;
            let claims = handoff
                .list_my_claims(recipient_id, handoff.page(q.limit, q.offset))
                .await?;
            Ok(json_response(StatusCode::OK, &claims))
        }
        (Method::GET, ["claims", id]) => {
            let actor_id = require_caller(&caller)?;
            Ok(json_response(StatusCode::OK, &handoff.get_claim(id, actor_id).await?))
        }
        (Method::POST, ["claims", id, "pickup-collected"]) => {
            let recipient_id = require_caller(&caller)?;
            let claim = handoff.mark_pickup_collected(id, recipient_id).await?;
            Ok(json_response(StatusCode::OK, &claim))
        }
        (Method::POST, ["claims", id, "cancel"]) => {
            let actor_id = require_caller(&caller)?;
            let claim = handoff.cancel_pickup_claim(id, actor_id).await?;
            Ok(json_response(StatusCode::OK, &claim))
        }
        (Method::POST, ["claims", id, "confirm-receipt"]) => {
            let recipient_id = require_caller(&caller)?;
            let ack = handoff.confirm_receipt(id, recipient_id).await?;
            Ok(json_response(StatusCode::OK, &ack))
        }
        (Method::POST, ["claims", id, "confirm-donor"]) => {
            let donor_id = require_caller(&caller)?;
            let donation = handoff.confirm_donor_pickup(id, donor_id).await?;
            Ok(json_response(StatusCode::OK, &donation))
        }

        // -- volunteer deliveries ---------------------------------------------
        (Method::POST, ["deliveries", id, "assign"]) => {
            let volunteer_id = require_caller(&caller)?;
            let delivery = handoff.assign_volunteer(id, volunteer_id).await?;
            Ok(json_response(StatusCode::OK, &delivery))
        }
        (Method::POST, ["deliveries", id, "status"]) => {
            let actor_id = require_caller(&caller)?;
            let body: DeliveryStatusRequest = read_json(req).await?;
            let delivery = handoff
                .advance_delivery_status(id, actor_id, body.status)
                .await?;
            Ok(json_response(StatusCode::OK, &delivery))
        }
        (Method::POST, ["deliveries", id, "confirm-donor"]) => {
            let donor_id = require_caller(&caller)?;
            let donation = handoff.confirm_donor_delivery(id, donor_id).await?;
            Ok(json_response(StatusCode::OK, &donation))
        }
        (Method::GET, ["tasks", "open"]) => {
            let q: PageQuery = read_query(&query)?;
            let tasks = handoff
                .list_open_tasks(handoff.page(q.limit, q.offset))
                .await?;
            Ok(json_response(StatusCode::OK, &tasks))
        }
        (Method::GET, ["tasks", "mine"]) => {
            let volunteer_id = require_caller(&caller)?;
            let tasks = handoff.list_volunteer_tasks(volunteer_id).await?;
            Ok(json_response(StatusCode::OK, &tasks))
        }

        // -- direct deliveries -------------------------------------------------
        (Method::POST, ["direct-deliveries", id, "status"]) => {
            let donor_id = require_caller(&caller)?;
            let body: DirectStatusRequest = read_json(req).await?;
            let direct = handoff
                .mark_direct_delivery_status(
                    id,
                    donor_id,
                    body.status,
                    body.scheduled_for,
                    body.reason,
                )
                .await?;
            Ok(json_response(StatusCode::OK, &direct))
        }
        (Method::POST, ["direct-deliveries", id, "confirm-donor"]) => {
            let donor_id = require_caller(&caller)?;
            let donation = handoff.confirm_donor_direct_delivery(id, donor_id).await?;
            Ok(json_response(StatusCode::OK, &donation))
        }

        // -- tracking ----------------------------------------------------------
        (Method::GET, ["tracking", claim_id]) => {
            let actor_id = require_caller(&caller)?;
            let view = handoff.get_tracking(claim_id, actor_id).await?;
            Ok(json_response(StatusCode::OK, &view))
        }

        // -- notifications -----------------------------------------------------
        (Method::GET, ["notifications"]) => {
            let user_id = require_caller(&caller)?;
            let q: PageQuery = read_query(&query)?;
            let feed = handoff
                .list_notifications(user_id, handoff.page(q.limit, q.offset))
                .await?;
            Ok(json_response(StatusCode::OK, &feed))
        }
        (Method::GET, ["notifications", "unread-count"]) => {
            let user_id = require_caller(&caller)?;
            let unread = handoff.unread_count(user_id).await?;
            Ok(json_response(
                StatusCode::OK,
                &serde_json::json!({ "unread": unread }),
            ))
        }
        (Method::POST, ["notifications", id, "read"]) => {
            let user_id = require_caller(&caller)?;
            let ack = handoff.mark_notification_read(id, user_id).await?;
            Ok(json_response(StatusCode::OK, &ack))
        }

        // -- admin -------------------------------------------------------------
        (Method::POST, ["admin", "expire-donations"]) => {
            let report = handoff.expire_donations(Utc::now()).await?;
            Ok(json_response(StatusCode::OK, &report))
        }

        (method, _) => Err(HandoffError::NotFound(format!("no route for {} {}", method, path))),
    }
}

// =============================================================================
// Helpers
// =============================================================================

fn caller_id(req: &Request<Incoming>) -> Option<String> {
    req.headers()
        .get(USER_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

fn require_caller(caller: &Option<String>) -> Result<&str> {
    caller
        .as_deref()
        .ok_or_else(|| HandoffError::Unauthenticated("missing X-User-Id header".into()))
}

async fn read_json<T: DeserializeOwned>(req: Request<Incoming>) -> Result<T> {
    let body = req
        .into_body()
        .collect()
        .await
        .map_err(|e| HandoffError::BadRequest(format!("Invalid body: {}", e)))?
        .to_bytes();
    Ok(serde_json::from_slice(&body)?)
}

fn read_query<T: DeserializeOwned>(query: &str) -> Result<T> {
    serde_urlencoded::from_str(query)
        .map_err(|e| HandoffError::BadRequest(format!("Invalid query: {}", e)))
}
