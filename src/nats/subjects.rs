//! Subject naming and event payloads
//!
//! - `<prefix>.user.<user_id>.notifications`: every notification a user receives
//! - `<prefix>.claim.<claim_id>.status`: every status change in a claim's lifecycle
//! - `<prefix>.tasks.open`: a new unbound volunteer task exists

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Default subject prefix
pub const DEFAULT_SUBJECT_PREFIX: &str = "handoff";

/// Subject builder for one deployment prefix
#[derive(Debug, Clone)]
pub struct Subjects {
    prefix: String,
}

impl Subjects {
    pub fn new(prefix: &str) -> Self {
        Self {
            prefix: prefix.trim_end_matches('.').to_string(),
        }
    }

    pub fn user_notifications(&self, user_id: &str) -> String {
        format!("{}.user.{}.notifications", self.prefix, user_id)
    }

    pub fn claim_status(&self, claim_id: &str) -> String {
        format!("{}.claim.{}.status", self.prefix, claim_id)
    }

    pub fn open_tasks(&self) -> String {
        format!("{}.tasks.open", self.prefix)
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }
}

impl Default for Subjects {
    fn default() -> Self {
        Self::new(DEFAULT_SUBJECT_PREFIX)
    }
}

/// Which record a status event describes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusEntity {
    Donation,
    Claim,
    Delivery,
    DirectDelivery,
}

/// Published on the claim status subject after every committed transition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusEvent {
    pub entity: StatusEntity,
    pub id: String,
    pub claim_id: String,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous: Option<String>,
    pub actor_id: String,
    pub at: DateTime<Utc>,
}

impl StatusEvent {
    pub fn new(
        entity: StatusEntity,
        id: &str,
        claim_id: &str,
        status: impl ToString,
        actor_id: &str,
    ) -> Self {
        Self {
            entity,
            id: id.to_string(),
            claim_id: claim_id.to_string(),
            status: status.to_string(),
            previous: None,
            actor_id: actor_id.to_string(),
            at: Utc::now(),
        }
    }

    pub fn with_previous(mut self, previous: impl ToString) -> Self {
        self.previous = Some(previous.to_string());
        self
    }
}

/// Untargeted signal that a volunteer task is waiting
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskAvailable {
    pub delivery_id: String,
    pub claim_id: String,
    pub donation_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pickup_location: Option<String>,
    pub at: DateTime<Utc>,
}
