//! Volunteer delivery document schema
//!
//! `pending -> assigned -> accepted -> picked_up -> in_transit -> delivered`,
//! strictly forward, one step at a time. Each step writes its own timestamp.

use bson::{doc, Document};
use chrono::{DateTime, Utc};
use mongodb::options::IndexOptions;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::db::mongo::{IntoIndexes, MutMetadata};
use crate::db::schemas::Metadata;

/// Collection name for volunteer deliveries
pub const DELIVERY_COLLECTION: &str = "deliveries";

#[derive(
    Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash,
)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    #[default]
    Pending,
    Assigned,
    Accepted,
    PickedUp,
    InTransit,
    Delivered,
}

impl DeliveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Assigned => "assigned",
            Self::Accepted => "accepted",
            Self::PickedUp => "picked_up",
            Self::InTransit => "in_transit",
            Self::Delivered => "delivered",
        }
    }

    /// The only status this one may advance to
    pub fn next(&self) -> Option<Self> {
        match self {
            Self::Pending => Some(Self::Assigned),
            Self::Assigned => Some(Self::Accepted),
            Self::Accepted => Some(Self::PickedUp),
            Self::PickedUp => Some(Self::InTransit),
            Self::InTransit => Some(Self::Delivered),
            Self::Delivered => None,
        }
    }

    /// Document field holding the timestamp written when entering this status
    pub fn timestamp_field(&self) -> Option<&'static str> {
        match self {
            Self::Pending => None,
            Self::Assigned => Some("assigned_at"),
            Self::Accepted => Some("accepted_at"),
            Self::PickedUp => Some("picked_up_at"),
            Self::InTransit => Some("in_transit_at"),
            Self::Delivered => Some("delivered_at"),
        }
    }
}

impl fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeliveryStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "assigned" => Ok(Self::Assigned),
            "accepted" => Ok(Self::Accepted),
            "picked_up" => Ok(Self::PickedUp),
            "in_transit" => Ok(Self::InTransit),
            "delivered" => Ok(Self::Delivered),
            other => Err(format!("unknown delivery status '{}'", other)),
        }
    }
}

/// Volunteer delivery document stored in MongoDB
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct DeliveryDoc {
    #[serde(rename = "_id")]
    pub id: String,

    #[serde(default)]
    pub metadata: Metadata,

    pub claim_id: String,
    pub donation_id: String,
    pub donor_id: String,
    pub recipient_id: String,

    /// Bound volunteer; `None` while the task is open
    #[serde(default)]
    pub volunteer_id: Option<String>,

    pub status: DeliveryStatus,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pickup_location: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accepted_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub picked_up_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub in_transit_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delivered_at: Option<DateTime<Utc>>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl DeliveryDoc {
    pub fn new(
        id: String,
        claim_id: String,
        donation_id: String,
        donor_id: String,
        recipient_id: String,
        pickup_location: Option<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id,
            metadata: Metadata::new(),
            claim_id,
            donation_id,
            donor_id,
            recipient_id,
            volunteer_id: None,
            status: DeliveryStatus::Pending,
            pickup_location,
            assigned_at: None,
            accepted_at: None,
            picked_up_at: None,
            in_transit_at: None,
            delivered_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Apply a status step to the in-memory copy, setting its timestamp
    pub fn apply_status(&mut self, status: DeliveryStatus, at: DateTime<Utc>) {
        self.status = status;
        self.updated_at = at;
        match status {
            DeliveryStatus::Pending => {}
            DeliveryStatus::Assigned => self.assigned_at = Some(at),
            DeliveryStatus::Accepted => self.accepted_at = Some(at),
            DeliveryStatus::PickedUp => self.picked_up_at = Some(at),
            DeliveryStatus::InTransit => self.in_transit_at = Some(at),
            DeliveryStatus::Delivered => self.delivered_at = Some(at),
        }
    }
}

impl IntoIndexes for DeliveryDoc {
    fn into_indices() -> Vec<(Document, Option<IndexOptions>)> {
        vec![
            (
                doc! { "claim_id": 1 },
                Some(
                    IndexOptions::builder()
                        .unique(true)
                        .name("claim_id_unique".to_string())
                        .build(),
                ),
            ),
            // Open task query: volunteer_id null + pending
            (
                doc! { "volunteer_id": 1, "status": 1 },
                Some(
                    IndexOptions::builder()
                        .name("volunteer_status_index".to_string())
                        .build(),
                ),
            ),
        ]
    }
}

impl MutMetadata for DeliveryDoc {
    fn mut_metadata(&mut self) -> &mut Metadata {
        &mut self.metadata
    }
}
