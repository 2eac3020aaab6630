//! Services layer for Handoff
//!
//! Business logic for the fulfillment lifecycle. Services coordinate the
//! persistent store (authoritative), the view cache and the event bus.
//!
//! ## Services
//!
//! - **Donations**: posting, reads, soft reservation, withdrawal, expiry
//! - **ClaimArbitrator**: at most one active claim per donation
//! - **VolunteerDeliveries**: the volunteer delivery state machine and task queries
//! - **DirectDeliveries**: the donor-delivers state machine
//! - **PickupHandoff**: self-pickup handoff and pre-handoff cancellation
//! - **ConfirmationProtocol**: recipient receipt and donor final sign-off
//! - **NotificationDispatcher**: role-targeted notification rows and live events
//!
//! [`Handoff`] bundles them behind one facade used by the HTTP routes.

pub mod claims;
pub mod confirmation;
pub mod delivery;
pub mod direct;
pub mod donations;
pub mod fulfillment;
pub mod notifications;
pub mod pickup;

pub use claims::ClaimArbitrator;
pub use confirmation::{ConfirmationProtocol, ReceiptAck};
pub use delivery::VolunteerDeliveries;
pub use direct::DirectDeliveries;
pub use donations::{Donations, ExpiryReport};
pub use fulfillment::{Fulfillment, TrackingView};
pub use notifications::{Notice, NotificationDispatcher, ReadAck};
pub use pickup::PickupHandoff;

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::warn;
use uuid::Uuid;

use crate::cache::{affected, ViewKey, ViewLayer};
use crate::config::Args;
use crate::db::schemas::{
    ClaimDoc, DeliveryDoc, DeliveryStatus, DirectDeliveryDoc, DirectDeliveryStatus, DonationDoc,
    DonationStatus, NewDonation, NotificationDoc,
};
use crate::nats::{Publisher, StatusEvent};
use crate::store::{DonationFilter, DonationTransition, FulfillmentStore, Page};
use crate::types::{HandoffError, Result};

/// Tunables for the service layer
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Bound on optimistic claim retries before surfacing `AlreadyClaimed`
    pub claim_max_attempts: u32,
    pub default_page_size: u32,
    pub max_page_size: u32,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            claim_max_attempts: 3,
            default_page_size: 20,
            max_page_size: 100,
        }
    }
}

impl From<&Args> for ServiceConfig {
    fn from(args: &Args) -> Self {
        Self {
            claim_max_attempts: args.claim_max_attempts,
            default_page_size: args.default_page_size,
            max_page_size: args.max_page_size,
        }
    }
}

/// Shared handles every service works through
#[derive(Clone)]
pub struct Context {
    pub store: Arc<dyn FulfillmentStore>,
    pub views: ViewLayer,
    pub publisher: Publisher,
    pub notifier: NotificationDispatcher,
    pub config: ServiceConfig,
}

impl Context {
    pub fn new(
        store: Arc<dyn FulfillmentStore>,
        views: ViewLayer,
        publisher: Publisher,
        config: ServiceConfig,
    ) -> Self {
        let notifier = NotificationDispatcher::new(store.clone(), views.clone(), publisher.clone());
        Self {
            store,
            views,
            publisher,
            notifier,
            config,
        }
    }

    /// Time-ordered id
    pub fn new_id() -> String {
        Uuid::now_v7().to_string()
    }

    /// Clamp caller paging to the configured bounds
    pub fn page(&self, limit: Option<u32>, offset: Option<u64>) -> Page {
        let limit = limit
            .filter(|l| *l > 0)
            .unwrap_or(self.config.default_page_size)
            .min(self.config.max_page_size);
        Page::new(limit, offset.unwrap_or(0))
    }

    pub async fn load_donation(&self, id: &str) -> Result<DonationDoc> {
        self.store
            .get_donation(id)
            .await?
            .ok_or_else(|| HandoffError::NotFound(format!("donation {}", id)))
    }

    pub async fn load_claim(&self, id: &str) -> Result<ClaimDoc> {
        self.store
            .get_claim(id)
            .await?
            .ok_or_else(|| HandoffError::NotFound(format!("claim {}", id)))
    }

    pub async fn load_delivery(&self, id: &str) -> Result<DeliveryDoc> {
        self.store
            .get_delivery(id)
            .await?
            .ok_or_else(|| HandoffError::NotFound(format!("delivery {}", id)))
    }

    pub async fn load_direct_delivery(&self, id: &str) -> Result<DirectDeliveryDoc> {
        self.store
            .get_direct_delivery(id)
            .await?
            .ok_or_else(|| HandoffError::NotFound(format!("direct delivery {}", id)))
    }

    /// Move a donation along with its fulfillment record.
    ///
    /// The fulfillment record is authoritative; if the donation has already
    /// moved on, the mismatch is logged and the operation continues.
    pub async fn follow_donation(
        &self,
        donation_id: &str,
        expected: &[DonationStatus],
        to: DonationStatus,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        let mut change = DonationTransition::new(expected, to);
        change.at = at;
        let applied = self.store.transition_donation(donation_id, &change).await?;
        if !applied {
            warn!(donation_id, to = %to, "Donation was not in an expected status, left as is");
        }
        Ok(applied)
    }

    /// Publish a status event on the claim's channel
    pub async fn publish_status(&self, event: &StatusEvent) {
        let subject = self.publisher.subjects().claim_status(&event.claim_id);
        self.publisher.publish_json(&subject, event).await;
    }

    /// Invalidate the donation views and a claim's tracking view
    pub async fn invalidate_claim_views(&self, donation_id: &str, claim_id: &str) {
        let mut prefixes = affected::donation(donation_id);
        prefixes.push(affected::tracking(claim_id));
        self.views.invalidate(&prefixes).await;
    }
}

/// Facade over every fulfillment operation
#[derive(Clone)]
pub struct Handoff {
    ctx: Context,
    pub donations: Donations,
    pub claims: ClaimArbitrator,
    pub volunteer: VolunteerDeliveries,
    pub direct: DirectDeliveries,
    pub pickup: PickupHandoff,
    pub confirmation: ConfirmationProtocol,
}

impl Handoff {
    pub fn new(
        store: Arc<dyn FulfillmentStore>,
        views: ViewLayer,
        publisher: Publisher,
        config: ServiceConfig,
    ) -> Self {
        let ctx = Context::new(store, views, publisher, config);
        Self {
            donations: Donations::new(ctx.clone()),
            claims: ClaimArbitrator::new(ctx.clone()),
            volunteer: VolunteerDeliveries::new(ctx.clone()),
            direct: DirectDeliveries::new(ctx.clone()),
            pickup: PickupHandoff::new(ctx.clone()),
            confirmation: ConfirmationProtocol::new(ctx.clone()),
            ctx,
        }
    }

    pub fn context(&self) -> &Context {
        &self.ctx
    }

    pub fn store_backend(&self) -> &'static str {
        self.ctx.store.backend()
    }

    pub fn page(&self, limit: Option<u32>, offset: Option<u64>) -> Page {
        self.ctx.page(limit, offset)
    }

    // -- donations ---------------------------------------------------------

    pub async fn post_donation(&self, donor_id: &str, attrs: NewDonation) -> Result<DonationDoc> {
        self.donations.post(donor_id, attrs).await
    }

    pub async fn get_donation(&self, donation_id: &str) -> Result<DonationDoc> {
        self.donations.get(donation_id).await
    }

    pub async fn list_donations(
        &self,
        filter: &DonationFilter,
        page: Page,
    ) -> Result<Vec<DonationDoc>> {
        self.donations.list(filter, page).await
    }

    pub async fn reserve_donation(
        &self,
        donation_id: &str,
        donor_id: &str,
        recipient_id: &str,
    ) -> Result<DonationDoc> {
        self.donations.reserve(donation_id, donor_id, recipient_id).await
    }

    pub async fn release_reservation(
        &self,
        donation_id: &str,
        donor_id: &str,
    ) -> Result<DonationDoc> {
        self.donations.release(donation_id, donor_id).await
    }

    pub async fn withdraw_donation(&self, donation_id: &str, donor_id: &str) -> Result<DonationDoc> {
        self.donations.withdraw(donation_id, donor_id).await
    }

    pub async fn expire_donations(&self, now: DateTime<Utc>) -> Result<ExpiryReport> {
        self.donations.expire(now).await
    }

    // -- claims ------------------------------------------------------------

    pub async fn create_claim(
        &self,
        donation_id: &str,
        recipient_id: &str,
        quantity: u32,
    ) -> Result<ClaimDoc> {
        self.claims.create_claim(donation_id, recipient_id, quantity).await
    }

    pub async fn get_claim(&self, claim_id: &str, actor_id: &str) -> Result<ClaimDoc> {
        let claim = self.ctx.load_claim(claim_id).await?;
        if !claim.involves(actor_id) {
            return Err(HandoffError::Forbidden(format!(
                "{} is not a party to claim {}",
                actor_id, claim_id
            )));
        }
        Ok(claim)
    }

    pub async fn list_my_claims(&self, recipient_id: &str, page: Page) -> Result<Vec<ClaimDoc>> {
        self.ctx
            .store
            .list_claims_for_recipient(recipient_id, page)
            .await
    }

    // -- volunteer deliveries ---------------------------------------------

    pub async fn assign_volunteer(
        &self,
        delivery_id: &str,
        volunteer_id: &str,
    ) -> Result<DeliveryDoc> {
        self.volunteer.assign(delivery_id, volunteer_id).await
    }

    pub async fn advance_delivery_status(
        &self,
        delivery_id: &str,
        actor_id: &str,
        target: DeliveryStatus,
    ) -> Result<DeliveryDoc> {
        self.volunteer.advance(delivery_id, actor_id, target).await
    }

    pub async fn list_open_tasks(&self, page: Page) -> Result<Vec<DeliveryDoc>> {
        self.volunteer.list_open_tasks(page).await
    }

    pub async fn list_volunteer_tasks(&self, volunteer_id: &str) -> Result<Vec<DeliveryDoc>> {
        self.volunteer.list_volunteer_tasks(volunteer_id).await
    }

    // -- direct deliveries -------------------------------------------------

    pub async fn mark_direct_delivery_status(
        &self,
        direct_delivery_id: &str,
        donor_id: &str,
        target: DirectDeliveryStatus,
        scheduled_for: Option<DateTime<Utc>>,
        reason: Option<String>,
    ) -> Result<DirectDeliveryDoc> {
        self.direct
            .mark_status(direct_delivery_id, donor_id, target, scheduled_for, reason)
            .await
    }

    // -- self-pickup -------------------------------------------------------

    pub async fn mark_pickup_collected(
        &self,
        claim_id: &str,
        recipient_id: &str,
    ) -> Result<ClaimDoc> {
        self.pickup.mark_collected(claim_id, recipient_id).await
    }

    pub async fn cancel_pickup_claim(&self, claim_id: &str, actor_id: &str) -> Result<ClaimDoc> {
        self.pickup.cancel(claim_id, actor_id).await
    }

    // -- confirmation ------------------------------------------------------

    pub async fn confirm_receipt(&self, claim_id: &str, recipient_id: &str) -> Result<ReceiptAck> {
        self.confirmation.confirm_receipt(claim_id, recipient_id).await
    }

    pub async fn confirm_donor_delivery(
        &self,
        delivery_id: &str,
        donor_id: &str,
    ) -> Result<DonationDoc> {
        self.confirmation
            .confirm_donor_delivery(delivery_id, donor_id)
            .await
    }

    pub async fn confirm_donor_pickup(&self, claim_id: &str, donor_id: &str) -> Result<DonationDoc> {
        self.confirmation.confirm_donor_pickup(claim_id, donor_id).await
    }

    pub async fn confirm_donor_direct_delivery(
        &self,
        direct_delivery_id: &str,
        donor_id: &str,
    ) -> Result<DonationDoc> {
        self.confirmation
            .confirm_donor_direct_delivery(direct_delivery_id, donor_id)
            .await
    }

    // -- tracking ----------------------------------------------------------

    /// Donation, claim and fulfillment record for one of its parties
    pub async fn get_tracking(&self, claim_id: &str, actor_id: &str) -> Result<TrackingView> {
        let ctx = &self.ctx;
        let view: TrackingView = ctx
            .views
            .read_through(ViewKey::tracking(claim_id), ctx.views.user_ttl(), || {
                TrackingView::load(ctx, claim_id)
            })
            .await?;
        if !view.visible_to(actor_id) {
            return Err(HandoffError::Forbidden(format!(
                "{} may not track claim {}",
                actor_id, claim_id
            )));
        }
        Ok(view)
    }

    // -- notifications -----------------------------------------------------

    pub async fn list_notifications(
        &self,
        user_id: &str,
        page: Page,
    ) -> Result<Vec<NotificationDoc>> {
        self.ctx.notifier.list(user_id, page).await
    }

    pub async fn unread_count(&self, user_id: &str) -> Result<u64> {
        self.ctx.notifier.unread_count(user_id).await
    }

    pub async fn mark_notification_read(
        &self,
        notification_id: &str,
        user_id: &str,
    ) -> Result<ReadAck> {
        self.ctx.notifier.mark_read(notification_id, user_id).await
    }
}
