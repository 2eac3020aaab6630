//! In-process fulfillment store
//!
//! Concurrent maps keyed by document id. A conditional write holds only the
//! target row's shard lock while it checks the guard and applies the change,
//! so two racing writers on the same row serialize and exactly one wins.
//! Used in development mode and by the test suite.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::debug;

use super::{
    ClaimChange, DeliveryChange, DirectDeliveryChange, DonationFilter, DonationTransition,
    FulfillmentStore, Page,
};
use crate::db::schemas::{
    ActionRequired, ClaimDoc, ClaimStatus, DeliveryDoc, DeliveryStatus, DirectDeliveryDoc,
    DonationDoc, NotificationDoc,
};
use crate::types::{HandoffError, Result};

/// In-memory store
#[derive(Default)]
pub struct MemoryStore {
    donations: DashMap<String, DonationDoc>,
    claims: DashMap<String, ClaimDoc>,
    /// donation_id -> active claim_id (the unique partial index)
    active_claims: DashMap<String, String>,
    deliveries: DashMap<String, DeliveryDoc>,
    direct_deliveries: DashMap<String, DirectDeliveryDoc>,
    notifications: DashMap<String, NotificationDoc>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn paginate<T>(items: Vec<T>, page: Page) -> Vec<T> {
    items
        .into_iter()
        .skip(page.offset as usize)
        .take(page.limit as usize)
        .collect()
}

fn insert_unique<T: Clone>(map: &DashMap<String, T>, id: &str, doc: &T, kind: &str) -> Result<()> {
    match map.entry(id.to_string()) {
        Entry::Occupied(_) => Err(HandoffError::Database(format!(
            "duplicate {} id {}",
            kind, id
        ))),
        Entry::Vacant(slot) => {
            slot.insert(doc.clone());
            Ok(())
        }
    }
}

#[async_trait]
impl FulfillmentStore for MemoryStore {
    fn backend(&self) -> &'static str {
        "memory"
    }

    async fn insert_donation(&self, donation: &DonationDoc) -> Result<()> {
        insert_unique(&self.donations, &donation.id, donation, "donation")
    }

    async fn get_donation(&self, id: &str) -> Result<Option<DonationDoc>> {
        Ok(self.donations.get(id).map(|d| d.clone()))
    }

    async fn list_donations(
        &self,
        filter: &DonationFilter,
        page: Page,
    ) -> Result<Vec<DonationDoc>> {
        let mut items: Vec<DonationDoc> = self
            .donations
            .iter()
            .filter(|d| filter.matches(d.value()))
            .map(|d| d.value().clone())
            .collect();
        items.sort_by(|a, b| b.id.cmp(&a.id));
        Ok(paginate(items, page))
    }

    async fn list_expirable_donations(&self, now: DateTime<Utc>) -> Result<Vec<DonationDoc>> {
        Ok(self
            .donations
            .iter()
            .filter(|d| d.status.is_claimable() && d.available_until.is_some_and(|t| t < now))
            .map(|d| d.value().clone())
            .collect())
    }

    async fn transition_donation(&self, id: &str, change: &DonationTransition) -> Result<bool> {
        let Some(mut donation) = self.donations.get_mut(id) else {
            return Ok(false);
        };
        if !change.guard_matches(&donation) {
            debug!(donation_id = id, current = %donation.status, "Donation guard did not match");
            return Ok(false);
        }
        change.apply(&mut donation);
        Ok(true)
    }

    async fn insert_claim(&self, claim: &ClaimDoc) -> Result<()> {
        match self.active_claims.entry(claim.donation_id.clone()) {
            Entry::Occupied(existing) => {
                return Err(HandoffError::Database(format!(
                    "donation {} already has active claim {}",
                    claim.donation_id,
                    existing.get()
                )));
            }
            Entry::Vacant(slot) => {
                slot.insert(claim.id.clone());
            }
        }
        if let Err(e) = insert_unique(&self.claims, &claim.id, claim, "claim") {
            self.active_claims.remove(&claim.donation_id);
            return Err(e);
        }
        Ok(())
    }

    async fn delete_claim(&self, id: &str) -> Result<bool> {
        match self.claims.remove(id) {
            Some((_, claim)) => {
                self.active_claims
                    .remove_if(&claim.donation_id, |_, active| active == id);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn get_claim(&self, id: &str) -> Result<Option<ClaimDoc>> {
        Ok(self.claims.get(id).map(|c| c.clone()))
    }

    async fn find_active_claim(&self, donation_id: &str) -> Result<Option<ClaimDoc>> {
        let Some(claim_id) = self.active_claims.get(donation_id).map(|c| c.clone()) else {
            return Ok(None);
        };
        Ok(self
            .claims
            .get(&claim_id)
            .filter(|c| c.status == ClaimStatus::Claimed)
            .map(|c| c.clone()))
    }

    async fn list_claims_for_recipient(
        &self,
        recipient_id: &str,
        page: Page,
    ) -> Result<Vec<ClaimDoc>> {
        let mut items: Vec<ClaimDoc> = self
            .claims
            .iter()
            .filter(|c| c.recipient_id == recipient_id)
            .map(|c| c.value().clone())
            .collect();
        items.sort_by(|a, b| b.id.cmp(&a.id));
        Ok(paginate(items, page))
    }

    async fn update_claim(&self, id: &str, change: &ClaimChange) -> Result<bool> {
        let Some(mut claim) = self.claims.get_mut(id) else {
            return Ok(false);
        };
        if !change.guard_matches(&claim) {
            return Ok(false);
        }
        change.apply(&mut claim);
        if claim.status.is_terminal() {
            self.active_claims
                .remove_if(&claim.donation_id, |_, active| active == id);
        }
        Ok(true)
    }

    async fn insert_delivery(&self, delivery: &DeliveryDoc) -> Result<()> {
        insert_unique(&self.deliveries, &delivery.id, delivery, "delivery")
    }

    async fn get_delivery(&self, id: &str) -> Result<Option<DeliveryDoc>> {
        Ok(self.deliveries.get(id).map(|d| d.clone()))
    }

    async fn get_delivery_for_claim(&self, claim_id: &str) -> Result<Option<DeliveryDoc>> {
        Ok(self
            .deliveries
            .iter()
            .find(|d| d.claim_id == claim_id)
            .map(|d| d.value().clone()))
    }

    async fn list_open_deliveries(&self, page: Page) -> Result<Vec<DeliveryDoc>> {
        let mut items: Vec<DeliveryDoc> = self
            .deliveries
            .iter()
            .filter(|d| d.volunteer_id.is_none() && d.status == DeliveryStatus::Pending)
            .map(|d| d.value().clone())
            .collect();
        items.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(paginate(items, page))
    }

    async fn list_volunteer_deliveries(&self, volunteer_id: &str) -> Result<Vec<DeliveryDoc>> {
        let mut items: Vec<DeliveryDoc> = self
            .deliveries
            .iter()
            .filter(|d| {
                d.volunteer_id.as_deref() == Some(volunteer_id)
                    && d.status != DeliveryStatus::Delivered
            })
            .map(|d| d.value().clone())
            .collect();
        items.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(items)
    }

    async fn update_delivery(&self, id: &str, change: &DeliveryChange) -> Result<bool> {
        let Some(mut delivery) = self.deliveries.get_mut(id) else {
            return Ok(false);
        };
        if !change.guard_matches(&delivery) {
            return Ok(false);
        }
        change.apply(&mut delivery);
        Ok(true)
    }

    async fn insert_direct_delivery(&self, direct: &DirectDeliveryDoc) -> Result<()> {
        insert_unique(&self.direct_deliveries, &direct.id, direct, "direct delivery")
    }

    async fn get_direct_delivery(&self, id: &str) -> Result<Option<DirectDeliveryDoc>> {
        Ok(self.direct_deliveries.get(id).map(|d| d.clone()))
    }

    async fn get_direct_delivery_for_claim(
        &self,
        claim_id: &str,
    ) -> Result<Option<DirectDeliveryDoc>> {
        Ok(self
            .direct_deliveries
            .iter()
            .find(|d| d.claim_id == claim_id)
            .map(|d| d.value().clone()))
    }

    async fn update_direct_delivery(
        &self,
        id: &str,
        change: &DirectDeliveryChange,
    ) -> Result<bool> {
        let Some(mut direct) = self.direct_deliveries.get_mut(id) else {
            return Ok(false);
        };
        if !change.guard_matches(&direct) {
            return Ok(false);
        }
        change.apply(&mut direct);
        Ok(true)
    }

    async fn insert_notification(&self, notification: &NotificationDoc) -> Result<()> {
        insert_unique(
            &self.notifications,
            &notification.id,
            notification,
            "notification",
        )
    }

    async fn get_notification(&self, id: &str) -> Result<Option<NotificationDoc>> {
        Ok(self.notifications.get(id).map(|n| n.clone()))
    }

    async fn list_notifications(&self, user_id: &str, page: Page) -> Result<Vec<NotificationDoc>> {
        let mut items: Vec<NotificationDoc> = self
            .notifications
            .iter()
            .filter(|n| n.user_id == user_id)
            .map(|n| n.value().clone())
            .collect();
        items.sort_by(|a, b| b.id.cmp(&a.id));
        Ok(paginate(items, page))
    }

    async fn count_unread(&self, user_id: &str) -> Result<u64> {
        Ok(self
            .notifications
            .iter()
            .filter(|n| n.user_id == user_id && !n.read)
            .count() as u64)
    }

    async fn mark_notification_read(
        &self,
        id: &str,
        user_id: &str,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        let Some(mut notification) = self.notifications.get_mut(id) else {
            return Ok(false);
        };
        if notification.user_id != user_id || notification.read {
            return Ok(false);
        }
        notification.read = true;
        notification.read_at = Some(at);
        Ok(true)
    }

    async fn resolve_actions(
        &self,
        user_id: &str,
        claim_id: &str,
        action: ActionRequired,
        at: DateTime<Utc>,
    ) -> Result<u64> {
        let mut resolved = 0;
        for mut notification in self.notifications.iter_mut() {
            if notification.user_id == user_id
                && notification.claim_id.as_deref() == Some(claim_id)
                && notification.action_required == Some(action)
                && !notification.read
            {
                notification.read = true;
                notification.read_at = Some(at);
                resolved += 1;
            }
        }
        Ok(resolved)
    }
}
