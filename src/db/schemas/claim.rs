//! Claim document schema
//!
//! A claim is a recipient's binding commitment to one donation. The row only
//! moves between `claimed` and a terminal status; progress in between lives on
//! the delivery records. Confirmation timestamps are written once.

use bson::{doc, Document};
use chrono::{DateTime, Utc};
use mongodb::options::IndexOptions;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::db::mongo::{IntoIndexes, MutMetadata};
use crate::db::schemas::{DeliveryMode, Metadata};

/// Collection name for claims
pub const CLAIM_COLLECTION: &str = "claims";

#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ClaimStatus {
    #[default]
    Claimed,
    Completed,
    Cancelled,
}

impl ClaimStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Claimed => "claimed",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Claimed)
    }
}

impl fmt::Display for ClaimStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Claim document stored in MongoDB
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ClaimDoc {
    #[serde(rename = "_id")]
    pub id: String,

    #[serde(default)]
    pub metadata: Metadata,

    pub donation_id: String,

    pub recipient_id: String,

    /// Copied from the donation for ownership checks without a join
    pub donor_id: String,

    pub quantity: u32,

    /// Copied from the donation; selects the fulfillment record variant
    pub delivery_mode: DeliveryMode,

    pub status: ClaimStatus,

    /// Self-pickup handoff time (pickup mode only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handed_off_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub receipt_confirmed_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub donor_confirmed_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cancelled_at: Option<DateTime<Utc>>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ClaimDoc {
    pub fn new(
        id: String,
        donation_id: String,
        recipient_id: String,
        donor_id: String,
        quantity: u32,
        delivery_mode: DeliveryMode,
    ) -> Self {
        let now = Utc::now();
        Self {
            id,
            metadata: Metadata::new(),
            donation_id,
            recipient_id,
            donor_id,
            quantity,
            delivery_mode,
            status: ClaimStatus::Claimed,
            handed_off_at: None,
            receipt_confirmed_at: None,
            donor_confirmed_at: None,
            cancelled_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Whether the given user is a party to this claim
    pub fn involves(&self, user_id: &str) -> bool {
        self.recipient_id == user_id || self.donor_id == user_id
    }
}

impl IntoIndexes for ClaimDoc {
    fn into_indices() -> Vec<(Document, Option<IndexOptions>)> {
        vec![
            // At most one active claim per donation
            (
                doc! { "donation_id": 1 },
                Some(
                    IndexOptions::builder()
                        .unique(true)
                        .partial_filter_expression(doc! { "status": "claimed" })
                        .name("active_claim_per_donation".to_string())
                        .build(),
                ),
            ),
            (
                doc! { "recipient_id": 1 },
                Some(
                    IndexOptions::builder()
                        .name("recipient_id_index".to_string())
                        .build(),
                ),
            ),
        ]
    }
}

impl MutMetadata for ClaimDoc {
    fn mut_metadata(&mut self) -> &mut Metadata {
        &mut self.metadata
    }
}
