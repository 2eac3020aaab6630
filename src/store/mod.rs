//! Persistent store abstraction
//!
//! The store is the single source of truth. Every mutation is one conditional
//! write: a change carries the state it expects, and the store reports whether
//! the row still matched. Callers never read-then-write to decide a
//! transition.
//!
//! ## Backends
//!
//! - [`MongoStore`]: MongoDB collections, guards expressed as update filters
//! - [`MemoryStore`]: in-process maps with per-row compare-and-set

pub mod memory;
pub mod mongo;

pub use memory::MemoryStore;
pub use mongo::MongoStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::db::schemas::{
    ActionRequired, ClaimDoc, ClaimStatus, DeliveryDoc, DeliveryMode, DeliveryStatus,
    Destination, DirectDeliveryDoc, DirectDeliveryStatus, DirectDeliveryUpdate, DonationDoc,
    DonationStatus, NotificationDoc,
};
use crate::types::Result;

/// Offset pagination
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Page {
    pub limit: u32,
    pub offset: u64,
}

impl Page {
    pub fn new(limit: u32, offset: u64) -> Self {
        Self { limit, offset }
    }
}

impl Default for Page {
    fn default() -> Self {
        Self {
            limit: 20,
            offset: 0,
        }
    }
}

/// Filter for donation list queries
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DonationFilter {
    #[serde(default)]
    pub status: Option<DonationStatus>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub delivery_mode: Option<DeliveryMode>,
    #[serde(default)]
    pub destination: Option<Destination>,
    #[serde(default)]
    pub donor_id: Option<String>,
}

impl DonationFilter {
    pub fn matches(&self, donation: &DonationDoc) -> bool {
        self.status.map_or(true, |s| donation.status == s)
            && self.category.as_ref().map_or(true, |c| &donation.category == c)
            && self.delivery_mode.map_or(true, |m| donation.delivery_mode == m)
            && self.destination.map_or(true, |d| donation.destination == d)
            && self.donor_id.as_ref().map_or(true, |d| &donation.donor_id == d)
    }
}

/// What happens to the soft reservation during a donation transition
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reservation {
    Keep,
    Set(String),
    Clear,
}

/// Guarded donation status change
#[derive(Debug, Clone)]
pub struct DonationTransition {
    /// Statuses the row must currently be in
    pub expected: Vec<DonationStatus>,
    /// If set, the row must be reserved for this recipient or not reserved at all
    pub holder: Option<String>,
    pub status: DonationStatus,
    pub reservation: Reservation,
    pub at: DateTime<Utc>,
}

impl DonationTransition {
    pub fn new(expected: &[DonationStatus], status: DonationStatus) -> Self {
        Self {
            expected: expected.to_vec(),
            holder: None,
            status,
            reservation: Reservation::Keep,
            at: Utc::now(),
        }
    }

    pub fn held_by(mut self, recipient_id: &str) -> Self {
        self.holder = Some(recipient_id.to_string());
        self
    }

    pub fn reservation(mut self, reservation: Reservation) -> Self {
        self.reservation = reservation;
        self
    }

    pub fn guard_matches(&self, donation: &DonationDoc) -> bool {
        if !self.expected.contains(&donation.status) {
            return false;
        }
        match (&self.holder, &donation.reserved_for) {
            (Some(holder), Some(reserved)) => holder == reserved,
            _ => true,
        }
    }

    pub fn apply(&self, donation: &mut DonationDoc) {
        donation.status = self.status;
        donation.updated_at = self.at;
        match &self.reservation {
            Reservation::Keep => {}
            Reservation::Set(recipient) => donation.reserved_for = Some(recipient.clone()),
            Reservation::Clear => donation.reserved_for = None,
        }
        if self.status == DonationStatus::Completed {
            donation.completed_at = Some(self.at);
        }
    }
}

/// Guarded claim change; each variant carries its own precondition
#[derive(Debug, Clone, PartialEq)]
pub enum ClaimChange {
    /// Pickup handoff happened (requires no earlier handoff)
    HandOff { at: DateTime<Utc> },
    /// Recipient acknowledged receipt (requires no earlier receipt)
    ConfirmReceipt { at: DateTime<Utc> },
    /// Donor signed off (requires a recorded receipt)
    Complete { at: DateTime<Utc> },
    /// Claim withdrawn before any handoff
    Cancel {
        at: DateTime<Utc>,
        require_no_handoff: bool,
    },
}

impl ClaimChange {
    pub fn guard_matches(&self, claim: &ClaimDoc) -> bool {
        if claim.status != ClaimStatus::Claimed {
            return false;
        }
        match self {
            Self::HandOff { .. } => claim.handed_off_at.is_none(),
            Self::ConfirmReceipt { .. } => claim.receipt_confirmed_at.is_none(),
            Self::Complete { .. } => claim.receipt_confirmed_at.is_some(),
            Self::Cancel {
                require_no_handoff, ..
            } => !require_no_handoff || claim.handed_off_at.is_none(),
        }
    }

    pub fn apply(&self, claim: &mut ClaimDoc) {
        match self {
            Self::HandOff { at } => {
                claim.handed_off_at = Some(*at);
                claim.updated_at = *at;
            }
            Self::ConfirmReceipt { at } => {
                claim.receipt_confirmed_at = Some(*at);
                claim.updated_at = *at;
            }
            Self::Complete { at } => {
                claim.status = ClaimStatus::Completed;
                claim.donor_confirmed_at = Some(*at);
                claim.updated_at = *at;
            }
            Self::Cancel { at, .. } => {
                claim.status = ClaimStatus::Cancelled;
                claim.cancelled_at = Some(*at);
                claim.updated_at = *at;
            }
        }
    }
}

/// Guarded volunteer delivery change
#[derive(Debug, Clone, PartialEq)]
pub enum DeliveryChange {
    /// Bind a volunteer to an unbound pending delivery
    Assign {
        volunteer_id: String,
        at: DateTime<Utc>,
    },
    /// Move one step forward; only the bound volunteer may do it
    Advance {
        volunteer_id: String,
        from: DeliveryStatus,
        to: DeliveryStatus,
        at: DateTime<Utc>,
    },
}

impl DeliveryChange {
    pub fn guard_matches(&self, delivery: &DeliveryDoc) -> bool {
        match self {
            Self::Assign { .. } => {
                delivery.status == DeliveryStatus::Pending && delivery.volunteer_id.is_none()
            }
            Self::Advance {
                volunteer_id, from, ..
            } => {
                delivery.status == *from
                    && delivery.volunteer_id.as_deref() == Some(volunteer_id.as_str())
            }
        }
    }

    pub fn apply(&self, delivery: &mut DeliveryDoc) {
        match self {
            Self::Assign { volunteer_id, at } => {
                delivery.volunteer_id = Some(volunteer_id.clone());
                delivery.apply_status(DeliveryStatus::Assigned, *at);
            }
            Self::Advance { to, at, .. } => delivery.apply_status(*to, *at),
        }
    }
}

/// Guarded direct delivery change
#[derive(Debug, Clone)]
pub struct DirectDeliveryChange {
    pub from: DirectDeliveryStatus,
    pub to: DirectDeliveryStatus,
    pub update: DirectDeliveryUpdate,
    pub at: DateTime<Utc>,
}

impl DirectDeliveryChange {
    pub fn guard_matches(&self, direct: &DirectDeliveryDoc) -> bool {
        direct.status == self.from
    }

    pub fn apply(&self, direct: &mut DirectDeliveryDoc) {
        direct.apply_status(self.to, &self.update, self.at);
    }
}

/// Persistent store for the fulfillment lifecycle
#[async_trait]
pub trait FulfillmentStore: Send + Sync {
    /// Backend name for health reporting
    fn backend(&self) -> &'static str;

    // -- donations ---------------------------------------------------------

    async fn insert_donation(&self, donation: &DonationDoc) -> Result<()>;

    async fn get_donation(&self, id: &str) -> Result<Option<DonationDoc>>;

    async fn list_donations(&self, filter: &DonationFilter, page: Page)
        -> Result<Vec<DonationDoc>>;

    /// Claimable donations whose `available_until` is before `now`
    async fn list_expirable_donations(&self, now: DateTime<Utc>) -> Result<Vec<DonationDoc>>;

    /// Returns false if the guard no longer matched
    async fn transition_donation(&self, id: &str, change: &DonationTransition) -> Result<bool>;

    // -- claims ------------------------------------------------------------

    /// Fails if another active claim exists for the same donation
    async fn insert_claim(&self, claim: &ClaimDoc) -> Result<()>;

    async fn delete_claim(&self, id: &str) -> Result<bool>;

    async fn get_claim(&self, id: &str) -> Result<Option<ClaimDoc>>;

    async fn find_active_claim(&self, donation_id: &str) -> Result<Option<ClaimDoc>>;

    async fn list_claims_for_recipient(&self, recipient_id: &str, page: Page)
        -> Result<Vec<ClaimDoc>>;

    async fn update_claim(&self, id: &str, change: &ClaimChange) -> Result<bool>;

    // -- volunteer deliveries ---------------------------------------------

    async fn insert_delivery(&self, delivery: &DeliveryDoc) -> Result<()>;

    async fn get_delivery(&self, id: &str) -> Result<Option<DeliveryDoc>>;

    async fn get_delivery_for_claim(&self, claim_id: &str) -> Result<Option<DeliveryDoc>>;

    /// `volunteer_id IS NULL AND status = pending`, oldest first
    async fn list_open_deliveries(&self, page: Page) -> Result<Vec<DeliveryDoc>>;

    /// Undelivered deliveries bound to the volunteer
    async fn list_volunteer_deliveries(&self, volunteer_id: &str) -> Result<Vec<DeliveryDoc>>;

    async fn update_delivery(&self, id: &str, change: &DeliveryChange) -> Result<bool>;

    // -- direct deliveries -------------------------------------------------

    async fn insert_direct_delivery(&self, direct: &DirectDeliveryDoc) -> Result<()>;

    async fn get_direct_delivery(&self, id: &str) -> Result<Option<DirectDeliveryDoc>>;

    async fn get_direct_delivery_for_claim(&self, claim_id: &str)
        -> Result<Option<DirectDeliveryDoc>>;

    async fn update_direct_delivery(&self, id: &str, change: &DirectDeliveryChange)
        -> Result<bool>;

    // -- notifications -----------------------------------------------------

    async fn insert_notification(&self, notification: &NotificationDoc) -> Result<()>;

    async fn get_notification(&self, id: &str) -> Result<Option<NotificationDoc>>;

    /// Newest first
    async fn list_notifications(&self, user_id: &str, page: Page)
        -> Result<Vec<NotificationDoc>>;

    async fn count_unread(&self, user_id: &str) -> Result<u64>;

    /// Marks one unread notification owned by `user_id`; false if nothing changed
    async fn mark_notification_read(
        &self,
        id: &str,
        user_id: &str,
        at: DateTime<Utc>,
    ) -> Result<bool>;

    /// Marks every unread `action` notification for the claim read; returns count
    async fn resolve_actions(
        &self,
        user_id: &str,
        claim_id: &str,
        action: ActionRequired,
        at: DateTime<Utc>,
    ) -> Result<u64>;
}
