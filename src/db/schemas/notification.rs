//! Notification document schema
//!
//! Append-only, role-targeted records. The payload is a tagged union per
//! event kind. Rows flagged with an `action_required` are the pending work
//! queue of the confirmation protocol and are only marked read by performing
//! that action.

use bson::{doc, Document};
use chrono::{DateTime, Utc};
use mongodb::options::IndexOptions;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::db::mongo::{IntoIndexes, MutMetadata};
use crate::db::schemas::{
    DeliveryMode, DeliveryStatus, DirectDeliveryStatus, DonationStatus, Metadata,
};

/// Collection name for notifications
pub const NOTIFICATION_COLLECTION: &str = "notifications";

/// Follow-up a notification asks of its owner
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ActionRequired {
    /// Recipient must acknowledge the goods arrived
    ConfirmReceipt,
    /// Donor must sign off the completed handoff
    DonorFinalConfirmation,
}

impl ActionRequired {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ConfirmReceipt => "confirm_receipt",
            Self::DonorFinalConfirmation => "donor_final_confirmation",
        }
    }
}

/// Event payload, one variant per notification type
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NotificationEvent {
    ClaimCreated {
        donation_id: String,
        claim_id: String,
        recipient_id: String,
        quantity: u32,
        delivery_mode: DeliveryMode,
    },
    DonationReserved {
        donation_id: String,
        donor_id: String,
    },
    VolunteerAssigned {
        delivery_id: String,
        claim_id: String,
        volunteer_id: String,
    },
    DeliveryStatusChanged {
        delivery_id: String,
        claim_id: String,
        status: DeliveryStatus,
    },
    DirectDeliveryStatusChanged {
        direct_delivery_id: String,
        claim_id: String,
        status: DirectDeliveryStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        scheduled_for: Option<DateTime<Utc>>,
    },
    /// Goods handed over; the recipient must confirm
    HandoffRecorded {
        claim_id: String,
        donation_id: String,
        delivery_mode: DeliveryMode,
    },
    ReceiptConfirmed {
        claim_id: String,
        donation_id: String,
        recipient_id: String,
    },
    DonationCompleted {
        claim_id: String,
        donation_id: String,
    },
    ClaimCancelled {
        claim_id: String,
        donation_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    DonationExpired {
        donation_id: String,
        previous: DonationStatus,
    },
}

impl NotificationEvent {
    /// Notification type string, same as the serde tag
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ClaimCreated { .. } => "claim_created",
            Self::DonationReserved { .. } => "donation_reserved",
            Self::VolunteerAssigned { .. } => "volunteer_assigned",
            Self::DeliveryStatusChanged { .. } => "delivery_status_changed",
            Self::DirectDeliveryStatusChanged { .. } => "direct_delivery_status_changed",
            Self::HandoffRecorded { .. } => "handoff_recorded",
            Self::ReceiptConfirmed { .. } => "receipt_confirmed",
            Self::DonationCompleted { .. } => "donation_completed",
            Self::ClaimCancelled { .. } => "claim_cancelled",
            Self::DonationExpired { .. } => "donation_expired",
        }
    }

    /// Claim this event belongs to, if any
    pub fn claim_id(&self) -> Option<&str> {
        match self {
            Self::ClaimCreated { claim_id, .. }
            | Self::VolunteerAssigned { claim_id, .. }
            | Self::DeliveryStatusChanged { claim_id, .. }
            | Self::DirectDeliveryStatusChanged { claim_id, .. }
            | Self::HandoffRecorded { claim_id, .. }
            | Self::ReceiptConfirmed { claim_id, .. }
            | Self::DonationCompleted { claim_id, .. }
            | Self::ClaimCancelled { claim_id, .. } => Some(claim_id),
            Self::DonationReserved { .. } | Self::DonationExpired { .. } => None,
        }
    }
}

impl fmt::Display for NotificationEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.kind())
    }
}

/// Notification document stored in MongoDB
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct NotificationDoc {
    /// Time-ordered (v7) id; sorting by id gives creation order
    #[serde(rename = "_id")]
    pub id: String,

    #[serde(default)]
    pub metadata: Metadata,

    /// Owning user
    pub user_id: String,

    pub title: String,

    pub message: String,

    pub event: NotificationEvent,

    /// Claim reference, lifted out of the payload for action lookups
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub claim_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action_required: Option<ActionRequired>,

    #[serde(default)]
    pub read: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read_at: Option<DateTime<Utc>>,

    pub created_at: DateTime<Utc>,
}

impl NotificationDoc {
    pub fn new(
        id: String,
        user_id: String,
        title: String,
        message: String,
        event: NotificationEvent,
        action_required: Option<ActionRequired>,
    ) -> Self {
        let claim_id = event.claim_id().map(str::to_string);
        Self {
            id,
            metadata: Metadata::new(),
            user_id,
            title,
            message,
            event,
            claim_id,
            action_required,
            read: false,
            read_at: None,
            created_at: Utc::now(),
        }
    }

    /// Notification type string
    pub fn kind(&self) -> &'static str {
        self.event.kind()
    }
}

impl IntoIndexes for NotificationDoc {
    fn into_indices() -> Vec<(Document, Option<IndexOptions>)> {
        vec![
            // Feed: newest first per user
            (
                doc! { "user_id": 1, "_id": -1 },
                Some(
                    IndexOptions::builder()
                        .name("user_feed_index".to_string())
                        .build(),
                ),
            ),
            // Outstanding actions per claim
            (
                doc! { "user_id": 1, "claim_id": 1, "action_required": 1, "read": 1 },
                Some(
                    IndexOptions::builder()
                        .name("user_action_index".to_string())
                        .build(),
                ),
            ),
        ]
    }
}

impl MutMetadata for NotificationDoc {
    fn mut_metadata(&mut self) -> &mut Metadata {
        &mut self.metadata
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_tag_matches_kind() {
        let event = NotificationEvent::HandoffRecorded {
            claim_id: "c1".into(),
            donation_id: "d1".into(),
            delivery_mode: DeliveryMode::Volunteer,
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["type"], event.kind());
        assert_eq!(value["delivery_mode"], "volunteer");
    }

    #[test]
    fn test_claim_id_lifted_from_payload() {
        let doc = NotificationDoc::new(
            "n1".into(),
            "u1".into(),
            "t".into(),
            "m".into(),
            NotificationEvent::ReceiptConfirmed {
                claim_id: "c9".into(),
                donation_id: "d1".into(),
                recipient_id: "r".into(),
            },
            Some(ActionRequired::DonorFinalConfirmation),
        );
        assert_eq!(doc.claim_id.as_deref(), Some("c9"));
        assert!(!doc.read);
    }

    #[test]
    fn test_expired_has_no_claim() {
        let event = NotificationEvent::DonationExpired {
            donation_id: "d1".into(),
            previous: DonationStatus::Available,
        };
        assert!(event.claim_id().is_none());
    }
}
