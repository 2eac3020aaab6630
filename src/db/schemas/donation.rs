//! Donation document schema
//!
//! A donation is posted by its donor and only changes status through the
//! claim arbitrator and the fulfillment state machines.

use bson::{doc, Document};
use chrono::{DateTime, Utc};
use mongodb::options::IndexOptions;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::db::mongo::{IntoIndexes, MutMetadata};
use crate::db::schemas::Metadata;

/// Collection name for donations
pub const DONATION_COLLECTION: &str = "donations";

/// Donation lifecycle status
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum DonationStatus {
    #[default]
    Available,
    /// Soft reservation for one recipient, not yet claimed
    Matched,
    Claimed,
    InTransit,
    Delivered,
    Completed,
    Cancelled,
    Expired,
}

impl DonationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Available => "available",
            Self::Matched => "matched",
            Self::Claimed => "claimed",
            Self::InTransit => "in_transit",
            Self::Delivered => "delivered",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
            Self::Expired => "expired",
        }
    }

    /// Whether a recipient may still claim the donation
    pub fn is_claimable(&self) -> bool {
        matches!(self, Self::Available | Self::Matched)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled | Self::Expired)
    }
}

impl fmt::Display for DonationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How the goods travel from donor to recipient
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryMode {
    /// Recipient collects from the donor
    #[default]
    Pickup,
    /// A volunteer carries the goods
    Volunteer,
    /// The donor delivers in person
    Direct,
}

impl DeliveryMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pickup => "pickup",
            Self::Volunteer => "volunteer",
            Self::Direct => "direct",
        }
    }
}

impl fmt::Display for DeliveryMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Who the donation is intended for
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Destination {
    #[default]
    Recipients,
    Organization,
}

impl Destination {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Recipients => "recipients",
            Self::Organization => "organization",
        }
    }
}

/// Physical condition of the donated goods
#[derive(Serialize, Deserialize, Clone, Copy, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ItemCondition {
    New,
    LikeNew,
    #[default]
    Good,
    Fair,
    Worn,
}

/// Donation document stored in MongoDB
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct DonationDoc {
    #[serde(rename = "_id")]
    pub id: String,

    #[serde(default)]
    pub metadata: Metadata,

    /// Donor user ID
    pub donor_id: String,

    pub title: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    pub category: String,

    /// Number of units offered
    pub quantity: u32,

    #[serde(default)]
    pub condition: ItemCondition,

    pub delivery_mode: DeliveryMode,

    #[serde(default)]
    pub destination: Destination,

    pub status: DonationStatus,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pickup_location: Option<String>,

    /// Recipient holding the soft reservation while `matched`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reserved_for: Option<String>,

    /// Offer deadline; past it an unclaimed donation expires
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub available_until: Option<DateTime<Utc>>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl DonationDoc {
    /// Build a new `available` donation from donor-supplied attributes
    pub fn new(id: String, donor_id: String, attrs: NewDonation) -> Self {
        let now = Utc::now();
        Self {
            id,
            metadata: Metadata::new(),
            donor_id,
            title: attrs.title,
            description: attrs.description,
            category: attrs.category,
            quantity: attrs.quantity,
            condition: attrs.condition,
            delivery_mode: attrs.delivery_mode,
            destination: attrs.destination,
            status: DonationStatus::Available,
            pickup_location: attrs.pickup_location,
            reserved_for: None,
            available_until: attrs.available_until,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }
}

/// Attributes a donor supplies when posting
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct NewDonation {
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    pub category: String,
    pub quantity: u32,
    #[serde(default)]
    pub condition: ItemCondition,
    pub delivery_mode: DeliveryMode,
    #[serde(default)]
    pub destination: Destination,
    #[serde(default)]
    pub pickup_location: Option<String>,
    #[serde(default)]
    pub available_until: Option<DateTime<Utc>>,
}

impl IntoIndexes for DonationDoc {
    fn into_indices() -> Vec<(Document, Option<IndexOptions>)> {
        vec![
            (
                doc! { "status": 1, "category": 1 },
                Some(
                    IndexOptions::builder()
                        .name("status_category_index".to_string())
                        .build(),
                ),
            ),
            (
                doc! { "donor_id": 1 },
                Some(
                    IndexOptions::builder()
                        .name("donor_id_index".to_string())
                        .build(),
                ),
            ),
        ]
    }
}

impl MutMetadata for DonationDoc {
    fn mut_metadata(&mut self) -> &mut Metadata {
        &mut self.metadata
    }
}
