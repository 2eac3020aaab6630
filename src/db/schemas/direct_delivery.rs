//! Direct delivery document schema
//!
//! Donor-to-recipient handoff without a volunteer:
//! `coordination_needed -> scheduled -> out_for_delivery -> delivered`,
//! with `cancelled` reachable from any non-terminal status.

use bson::{doc, Document};
use chrono::{DateTime, Utc};
use mongodb::options::IndexOptions;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::db::mongo::{IntoIndexes, MutMetadata};
use crate::db::schemas::Metadata;

/// Collection name for direct deliveries
pub const DIRECT_DELIVERY_COLLECTION: &str = "direct_deliveries";

#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum DirectDeliveryStatus {
    #[default]
    CoordinationNeeded,
    Scheduled,
    OutForDelivery,
    Delivered,
    Cancelled,
}

impl DirectDeliveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CoordinationNeeded => "coordination_needed",
            Self::Scheduled => "scheduled",
            Self::OutForDelivery => "out_for_delivery",
            Self::Delivered => "delivered",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Delivered | Self::Cancelled)
    }

    /// Whether `self -> target` is a defined transition
    pub fn can_transition_to(&self, target: Self) -> bool {
        if self.is_terminal() {
            return false;
        }
        match target {
            Self::Cancelled => true,
            Self::Scheduled => *self == Self::CoordinationNeeded,
            Self::OutForDelivery => *self == Self::Scheduled,
            Self::Delivered => *self == Self::OutForDelivery,
            Self::CoordinationNeeded => false,
        }
    }
}

impl fmt::Display for DirectDeliveryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DirectDeliveryStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "coordination_needed" => Ok(Self::CoordinationNeeded),
            "scheduled" => Ok(Self::Scheduled),
            "out_for_delivery" => Ok(Self::OutForDelivery),
            "delivered" => Ok(Self::Delivered),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(format!("unknown direct delivery status '{}'", other)),
        }
    }
}

/// Direct delivery document stored in MongoDB
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct DirectDeliveryDoc {
    #[serde(rename = "_id")]
    pub id: String,

    #[serde(default)]
    pub metadata: Metadata,

    pub claim_id: String,
    pub donation_id: String,
    pub donor_id: String,
    pub recipient_id: String,

    pub status: DirectDeliveryStatus,

    /// Agreed drop-off time, set when scheduling
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduled_for: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scheduled_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub out_for_delivery_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delivered_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cancelled_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cancel_reason: Option<String>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl DirectDeliveryDoc {
    pub fn new(
        id: String,
        claim_id: String,
        donation_id: String,
        donor_id: String,
        recipient_id: String,
    ) -> Self {
        let now = Utc::now();
        Self {
            id,
            metadata: Metadata::new(),
            claim_id,
            donation_id,
            donor_id,
            recipient_id,
            status: DirectDeliveryStatus::CoordinationNeeded,
            scheduled_for: None,
            scheduled_at: None,
            out_for_delivery_at: None,
            delivered_at: None,
            cancelled_at: None,
            cancel_reason: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Field values written alongside a direct delivery status change
#[derive(Debug, Clone, Default)]
pub struct DirectDeliveryUpdate {
    pub scheduled_for: Option<DateTime<Utc>>,
    pub cancel_reason: Option<String>,
}

impl DirectDeliveryDoc {
    /// Apply a status step to the in-memory copy
    pub fn apply_status(
        &mut self,
        status: DirectDeliveryStatus,
        update: &DirectDeliveryUpdate,
        at: DateTime<Utc>,
    ) {
        self.status = status;
        self.updated_at = at;
        match status {
            DirectDeliveryStatus::CoordinationNeeded => {}
            DirectDeliveryStatus::Scheduled => {
                self.scheduled_at = Some(at);
                if update.scheduled_for.is_some() {
                    self.scheduled_for = update.scheduled_for;
                }
            }
            DirectDeliveryStatus::OutForDelivery => self.out_for_delivery_at = Some(at),
            DirectDeliveryStatus::Delivered => self.delivered_at = Some(at),
            DirectDeliveryStatus::Cancelled => {
                self.cancelled_at = Some(at);
                self.cancel_reason = update.cancel_reason.clone();
            }
        }
    }
}

impl IntoIndexes for DirectDeliveryDoc {
    fn into_indices() -> Vec<(Document, Option<IndexOptions>)> {
        vec![(
            doc! { "claim_id": 1 },
            Some(
                IndexOptions::builder()
                    .unique(true)
                    .name("claim_id_unique".to_string())
                    .build(),
            ),
        )]
    }
}

impl MutMetadata for DirectDeliveryDoc {
    fn mut_metadata(&mut self) -> &mut Metadata {
        &mut self.metadata
    }
}
