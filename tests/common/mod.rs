//! Shared fixtures for the integration tests
//!
//! Every test runs the full service stack in-process: `MemoryStore`,
//! `LocalCache` views and a `LocalBus`, or failing doubles in their place.

#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use handoff::cache::{CacheBackend, CacheConfig, ViewLayer};
use handoff::db::schemas::{
    ActionRequired, ClaimDoc, DeliveryDoc, DeliveryMode, DirectDeliveryDoc, DonationDoc,
    NewDonation, NotificationDoc,
};
use handoff::nats::{EventBus, LocalBus, Publisher, Subjects};
use handoff::services::{Handoff, ServiceConfig};
use handoff::store::{
    ClaimChange, DeliveryChange, DirectDeliveryChange, DonationFilter, DonationTransition,
    FulfillmentStore, MemoryStore, Page,
};
use handoff::{HandoffError, Result};

pub const DONOR: &str = "donor-1";
pub const RECIPIENT: &str = "recipient-1";
pub const VOLUNTEER: &str = "volunteer-1";

pub struct Stack {
    pub handoff: Handoff,
    pub store: Arc<MemoryStore>,
    pub bus: Arc<LocalBus>,
}

/// Healthy in-process stack
pub fn stack() -> Stack {
    let store = Arc::new(MemoryStore::new());
    let bus = Arc::new(LocalBus::default());
    let handoff = Handoff::new(
        store.clone(),
        ViewLayer::local(CacheConfig::default()),
        Publisher::new(bus.clone(), Subjects::default()),
        ServiceConfig::default(),
    );
    Stack {
        handoff,
        store,
        bus,
    }
}

/// Stack with the given cache backend and bus in front of a memory store
pub fn stack_with(
    cache: Arc<dyn CacheBackend>,
    bus: Arc<dyn EventBus>,
) -> (Handoff, Arc<MemoryStore>) {
    let store = Arc::new(MemoryStore::new());
    let handoff = Handoff::new(
        store.clone(),
        ViewLayer::new(cache, CacheConfig::default()),
        Publisher::new(bus, Subjects::default()),
        ServiceConfig::default(),
    );
    (handoff, store)
}

/// Healthy views and bus in front of any store
pub fn stack_on(store: Arc<dyn FulfillmentStore>) -> Handoff {
    Handoff::new(
        store,
        ViewLayer::local(CacheConfig::default()),
        Publisher::new(Arc::new(LocalBus::default()), Subjects::default()),
        ServiceConfig::default(),
    )
}

pub fn attrs(mode: DeliveryMode) -> NewDonation {
    NewDonation {
        title: "Winter coats".into(),
        description: Some("Three adult coats".into()),
        category: "clothing".into(),
        quantity: 3,
        delivery_mode: mode,
        pickup_location: Some("12 Elm St".into()),
        ..Default::default()
    }
}

pub async fn post(handoff: &Handoff, mode: DeliveryMode) -> DonationDoc {
    handoff.post_donation(DONOR, attrs(mode)).await.unwrap()
}

/// Posted and claimed by `RECIPIENT`
pub async fn claimed(handoff: &Handoff, mode: DeliveryMode) -> (DonationDoc, ClaimDoc) {
    let donation = post(handoff, mode).await;
    let claim = handoff.create_claim(&donation.id, RECIPIENT, 1).await.unwrap();
    (donation, claim)
}

pub async fn delivery_for(handoff: &Handoff, claim: &ClaimDoc) -> DeliveryDoc {
    handoff
        .context()
        .store
        .get_delivery_for_claim(&claim.id)
        .await
        .unwrap()
        .expect("volunteer claims have a delivery")
}

pub async fn direct_for(handoff: &Handoff, claim: &ClaimDoc) -> DirectDeliveryDoc {
    handoff
        .context()
        .store
        .get_direct_delivery_for_claim(&claim.id)
        .await
        .unwrap()
        .expect("direct claims have a direct delivery")
}

/// Notification kinds in a user's feed, newest first
pub async fn kinds(store: &MemoryStore, user_id: &str) -> Vec<&'static str> {
    store
        .list_notifications(user_id, handoff::store::Page::new(100, 0))
        .await
        .unwrap()
        .iter()
        .map(|n| n.kind())
        .collect()
}

/// Notifications of one kind a user holds for a claim
pub async fn count_kind(store: &MemoryStore, user_id: &str, claim_id: &str, kind: &str) -> usize {
    store
        .list_notifications(user_id, handoff::store::Page::new(100, 0))
        .await
        .unwrap()
        .iter()
        .filter(|n| n.claim_id.as_deref() == Some(claim_id) && n.kind() == kind)
        .count()
}

// =============================================================================
// Failing doubles
// =============================================================================

/// Cache that is always down
pub struct DownCache;

#[async_trait]
impl CacheBackend for DownCache {
    fn name(&self) -> &'static str {
        "down"
    }

    async fn get(&self, _key: &str) -> Result<Option<Vec<u8>>> {
        Err(HandoffError::Unavailable("cache offline".into()))
    }

    async fn set(&self, _key: &str, _data: Vec<u8>, _ttl: std::time::Duration) -> Result<()> {
        Err(HandoffError::Unavailable("cache offline".into()))
    }

    async fn invalidate_prefix(&self, _prefix: &str) -> Result<usize> {
        Err(HandoffError::Unavailable("cache offline".into()))
    }

    async fn generation(&self) -> Result<u64> {
        Err(HandoffError::Unavailable("cache offline".into()))
    }

    async fn set_if_current(
        &self,
        _key: &str,
        _data: Vec<u8>,
        _ttl: std::time::Duration,
        _seen: u64,
    ) -> Result<bool> {
        Err(HandoffError::Unavailable("cache offline".into()))
    }
}

/// Bus that refuses every publish
pub struct DownBus;

#[async_trait]
impl EventBus for DownBus {
    fn name(&self) -> &'static str {
        "down"
    }

    async fn publish(&self, _subject: &str, _payload: Bytes) -> Result<()> {
        Err(HandoffError::Nats("connection refused".into()))
    }
}

/// Memory store whose claim or donation writes fail while switched on
#[derive(Default)]
pub struct FlakyStore {
    pub inner: Arc<MemoryStore>,
    pub fail_claim_updates: AtomicBool,
    pub fail_donation_transitions: AtomicBool,
}

impl FlakyStore {
    pub fn fail_claims(&self, on: bool) {
        self.fail_claim_updates.store(on, Ordering::SeqCst);
    }

    pub fn fail_donations(&self, on: bool) {
        self.fail_donation_transitions.store(on, Ordering::SeqCst);
    }
}

#[async_trait]
impl FulfillmentStore for FlakyStore {
    fn backend(&self) -> &'static str {
        "flaky"
    }

    async fn insert_donation(&self, donation: &DonationDoc) -> Result<()> {
        self.inner.insert_donation(donation).await
    }

    async fn get_donation(&self, id: &str) -> Result<Option<DonationDoc>> {
        self.inner.get_donation(id).await
    }

    async fn list_donations(&self, filter: &DonationFilter, page: Page) -> Result<Vec<DonationDoc>> {
        self.inner.list_donations(filter, page).await
    }

    async fn list_expirable_donations(&self, now: DateTime<Utc>) -> Result<Vec<DonationDoc>> {
        self.inner.list_expirable_donations(now).await
    }

    async fn transition_donation(&self, id: &str, change: &DonationTransition) -> Result<bool> {
        if self.fail_donation_transitions.load(Ordering::SeqCst) {
            return Err(HandoffError::Database("donations collection unreachable".into()));
        }
        self.inner.transition_donation(id, change).await
    }

    async fn insert_claim(&self, claim: &ClaimDoc) -> Result<()> {
        self.inner.insert_claim(claim).await
    }

    async fn delete_claim(&self, id: &str) -> Result<bool> {
        self.inner.delete_claim(id).await
    }

    async fn get_claim(&self, id: &str) -> Result<Option<ClaimDoc>> {
        self.inner.get_claim(id).await
    }

    async fn find_active_claim(&self, donation_id: &str) -> Result<Option<ClaimDoc>> {
        self.inner.find_active_claim(donation_id).await
    }

    async fn list_claims_for_recipient(
        &self,
        recipient_id: &str,
        page: Page,
    ) -> Result<Vec<ClaimDoc>> {
        self.inner.list_claims_for_recipient(recipient_id, page).await
    }

    async fn update_claim(&self, id: &str, change: &ClaimChange) -> Result<bool> {
        if self.fail_claim_updates.load(Ordering::SeqCst) {
            return Err(HandoffError::Database("claims collection unreachable".into()));
        }
        self.inner.update_claim(id, change).await
    }

    async fn insert_delivery(&self, delivery: &DeliveryDoc) -> Result<()> {
        self.inner.insert_delivery(delivery).await
    }

    async fn get_delivery(&self, id: &str) -> Result<Option<DeliveryDoc>> {
        self.inner.get_delivery(id).await
    }

    async fn get_delivery_for_claim(&self, claim_id: &str) -> Result<Option<DeliveryDoc>> {
        self.inner.get_delivery_for_claim(claim_id).await
    }

    async fn list_open_deliveries(&self, page: Page) -> Result<Vec<DeliveryDoc>> {
        self.inner.list_open_deliveries(page).await
    }

    async fn list_volunteer_deliveries(&self, volunteer_id: &str) -> Result<Vec<DeliveryDoc>> {
        self.inner.list_volunteer_deliveries(volunteer_id).await
    }

    async fn update_delivery(&self, id: &str, change: &DeliveryChange) -> Result<bool> {
        self.inner.update_delivery(id, change).await
    }

    async fn insert_direct_delivery(&self, direct: &DirectDeliveryDoc) -> Result<()> {
        self.inner.insert_direct_delivery(direct).await
    }

    async fn get_direct_delivery(&self, id: &str) -> Result<Option<DirectDeliveryDoc>> {
        self.inner.get_direct_delivery(id).await
    }

    async fn get_direct_delivery_for_claim(
        &self,
        claim_id: &str,
    ) -> Result<Option<DirectDeliveryDoc>> {
        self.inner.get_direct_delivery_for_claim(claim_id).await
    }

    async fn update_direct_delivery(
        &self,
        id: &str,
        change: &DirectDeliveryChange,
    ) -> Result<bool> {
        self.inner.update_direct_delivery(id, change).await
    }

    async fn insert_notification(&self, notification: &NotificationDoc) -> Result<()> {
        self.inner.insert_notification(notification).await
    }

    async fn get_notification(&self, id: &str) -> Result<Option<NotificationDoc>> {
        self.inner.get_notification(id).await
    }

    async fn list_notifications(&self, user_id: &str, page: Page) -> Result<Vec<NotificationDoc>> {
        self.inner.list_notifications(user_id, page).await
    }

    async fn count_unread(&self, user_id: &str) -> Result<u64> {
        self.inner.count_unread(user_id).await
    }

    async fn mark_notification_read(
        &self,
        id: &str,
        user_id: &str,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        self.inner.mark_notification_read(id, user_id, at).await
    }

    async fn resolve_actions(
        &self,
        user_id: &str,
        claim_id: &str,
        action: ActionRequired,
        at: DateTime<Utc>,
    ) -> Result<u64> {
        self.inner.resolve_actions(user_id, claim_id, action, at).await
    }
}
