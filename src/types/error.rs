//! Error types for Handoff
//!
//! Every domain operation returns `HandoffError`. Conflict and transition
//! errors carry the persisted status the caller raced against, so a client
//! can decide between re-reading and giving up.

use hyper::StatusCode;

/// Main error type for Handoff operations
#[derive(Debug, thiserror::Error)]
pub enum HandoffError {
    /// Someone else holds the donation (claimed, reserved for another recipient, or gone)
    #[error("Donation {donation_id} is no longer available (status: {current})")]
    AlreadyClaimed { donation_id: String, current: String },

    /// The recipient is the donor of the donation
    #[error("Donation {donation_id} belongs to you and cannot be claimed")]
    SelfClaim { donation_id: String },

    /// A different volunteer is already bound to the delivery
    #[error("Delivery {delivery_id} is already assigned to {volunteer_id}")]
    AlreadyAssigned {
        delivery_id: String,
        volunteer_id: String,
    },

    /// A conditional write lost a race; re-read before retrying
    #[error("{entity} {id} changed concurrently (status: {current})")]
    StaleState {
        entity: &'static str,
        id: String,
        current: String,
    },

    #[error("Invalid {entity} transition: {from} -> {to}")]
    InvalidTransition {
        entity: &'static str,
        from: String,
        to: String,
    },

    /// No caller identity on the request
    #[error("Unauthenticated: {0}")]
    Unauthenticated(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Confirmation out of order for claim {claim_id}: {missing}")]
    PrematureConfirmation { claim_id: String, missing: String },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    /// Cache or pub/sub outage
    #[error("Unavailable: {0}")]
    Unavailable(String),

    #[error("NATS error: {0}")]
    Nats(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl HandoffError {
    /// Convert error to HTTP status code
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::AlreadyClaimed { .. } => StatusCode::CONFLICT,
            Self::AlreadyAssigned { .. } => StatusCode::CONFLICT,
            Self::StaleState { .. } => StatusCode::CONFLICT,
            Self::SelfClaim { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            Self::InvalidTransition { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            Self::Unauthenticated(_) => StatusCode::UNAUTHORIZED,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::PrematureConfirmation { .. } => StatusCode::PRECONDITION_FAILED,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Nats(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Database(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Stable machine-readable code
    pub fn code(&self) -> &'static str {
        match self {
            Self::AlreadyClaimed { .. } => "already_claimed",
            Self::SelfClaim { .. } => "self_claim",
            Self::AlreadyAssigned { .. } => "already_assigned",
            Self::StaleState { .. } => "stale_state",
            Self::InvalidTransition { .. } => "invalid_transition",
            Self::Unauthenticated(_) => "unauthenticated",
            Self::Forbidden(_) => "forbidden",
            Self::PrematureConfirmation { .. } => "premature_confirmation",
            Self::NotFound(_) => "not_found",
            Self::BadRequest(_) => "bad_request",
            Self::Unavailable(_) => "unavailable",
            Self::Nats(_) => "nats",
            Self::Database(_) => "database",
            Self::Config(_) => "config",
            Self::Internal(_) => "internal",
        }
    }

    /// Whether the caller may retry after re-reading current state
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::AlreadyClaimed { .. }
                | Self::AlreadyAssigned { .. }
                | Self::StaleState { .. }
                | Self::Unavailable(_)
                | Self::Nats(_)
                | Self::Database(_)
        )
    }

    /// Persisted status the failed operation observed, if any
    pub fn current_status(&self) -> Option<&str> {
        match self {
            Self::AlreadyClaimed { current, .. } | Self::StaleState { current, .. } => {
                Some(current)
            }
            Self::InvalidTransition { from, .. } => Some(from),
            _ => None,
        }
    }

    /// JSON body for HTTP error responses
    pub fn to_json(&self) -> serde_json::Value {
        let mut body = serde_json::json!({
            "error": self.to_string(),
            "code": self.code(),
            "retryable": self.is_retryable(),
        });
        if let Some(current) = self.current_status() {
            body["current_status"] = serde_json::Value::String(current.to_string());
        }
        body
    }
}

impl From<std::io::Error> for HandoffError {
    fn from(err: std::io::Error) -> Self {
        Self::Internal(err.to_string())
    }
}

impl From<serde_json::Error> for HandoffError {
    fn from(err: serde_json::Error) -> Self {
        Self::BadRequest(format!("JSON error: {}", err))
    }
}

impl From<hyper::Error> for HandoffError {
    fn from(err: hyper::Error) -> Self {
        Self::Internal(format!("HTTP error: {}", err))
    }
}

impl From<mongodb::error::Error> for HandoffError {
    fn from(err: mongodb::error::Error) -> Self {
        Self::Database(err.to_string())
    }
}

impl From<bson::ser::Error> for HandoffError {
    fn from(err: bson::ser::Error) -> Self {
        Self::Database(format!("BSON encode failed: {}", err))
    }
}

/// Result type alias for Handoff operations
pub type Result<T> = std::result::Result<T, HandoffError>;
