//! MongoDB fulfillment store
//!
//! Each guarded change becomes one conditional update whose filter carries the
//! expected state. A zero matched count means another writer got there first.

use async_trait::async_trait;
use bson::{doc, Bson, Document};
use chrono::{DateTime, Utc};
use tracing::info;

use super::{
    ClaimChange, DeliveryChange, DirectDeliveryChange, DonationFilter, DonationTransition,
    FulfillmentStore, Page, Reservation,
};
use crate::db::schemas::{
    ActionRequired, ClaimDoc, ClaimStatus, DeliveryDoc, DeliveryStatus, DirectDeliveryDoc,
    DirectDeliveryStatus, DonationDoc, DonationStatus, NotificationDoc, CLAIM_COLLECTION,
    DELIVERY_COLLECTION, DIRECT_DELIVERY_COLLECTION, DONATION_COLLECTION,
    NOTIFICATION_COLLECTION,
};
use crate::db::{MongoClient, MongoCollection};
use crate::types::Result;

/// MongoDB-backed store
#[derive(Clone)]
pub struct MongoStore {
    donations: MongoCollection<DonationDoc>,
    claims: MongoCollection<ClaimDoc>,
    deliveries: MongoCollection<DeliveryDoc>,
    direct_deliveries: MongoCollection<DirectDeliveryDoc>,
    notifications: MongoCollection<NotificationDoc>,
}

impl MongoStore {
    /// Open every collection, applying schema indexes
    pub async fn new(client: &MongoClient) -> Result<Self> {
        let store = Self {
            donations: client.collection(DONATION_COLLECTION).await?,
            claims: client.collection(CLAIM_COLLECTION).await?,
            deliveries: client.collection(DELIVERY_COLLECTION).await?,
            direct_deliveries: client.collection(DIRECT_DELIVERY_COLLECTION).await?,
            notifications: client.collection(NOTIFICATION_COLLECTION).await?,
        };
        info!(db = client.db_name(), "Fulfillment collections ready");
        Ok(store)
    }
}

fn ts(at: &DateTime<Utc>) -> Result<Bson> {
    Ok(bson::to_bson(at)?)
}

fn statuses(expected: &[DonationStatus]) -> Vec<&'static str> {
    expected.iter().map(DonationStatus::as_str).collect()
}

fn donation_filter_doc(filter: &DonationFilter) -> Document {
    let mut query = Document::new();
    if let Some(status) = filter.status {
        query.insert("status", status.as_str());
    }
    if let Some(category) = &filter.category {
        query.insert("category", category.as_str());
    }
    if let Some(mode) = filter.delivery_mode {
        query.insert("delivery_mode", mode.as_str());
    }
    if let Some(destination) = filter.destination {
        query.insert("destination", destination.as_str());
    }
    if let Some(donor) = &filter.donor_id {
        query.insert("donor_id", donor.as_str());
    }
    query
}

/// Ids are v7 UUIDs, so id order is creation order. `created_at` is an
/// RFC 3339 string whose fractional digits vary and cannot be sorted.
fn newest_first() -> Document {
    doc! { "_id": -1 }
}

fn oldest_first() -> Document {
    doc! { "_id": 1 }
}

fn page_limit(page: Page) -> i64 {
    i64::from(page.limit)
}

#[async_trait]
impl FulfillmentStore for MongoStore {
    fn backend(&self) -> &'static str {
        "mongo"
    }

    async fn insert_donation(&self, donation: &DonationDoc) -> Result<()> {
        self.donations.insert_one(donation.clone()).await
    }

    async fn get_donation(&self, id: &str) -> Result<Option<DonationDoc>> {
        self.donations.find_one(doc! { "_id": id }).await
    }

    async fn list_donations(
        &self,
        filter: &DonationFilter,
        page: Page,
    ) -> Result<Vec<DonationDoc>> {
        self.donations
            .find_page(
                donation_filter_doc(filter),
                newest_first(),
                page.offset,
                page_limit(page),
            )
            .await
    }

    async fn list_expirable_donations(&self, now: DateTime<Utc>) -> Result<Vec<DonationDoc>> {
        let candidates = self
            .donations
            .find_page(
                doc! {
                    "status": { "$in": statuses(&[DonationStatus::Available, DonationStatus::Matched]) },
                    "available_until": { "$exists": true },
                },
                oldest_first(),
                0,
                0,
            )
            .await?;
        // Deadlines are stored as RFC 3339 strings, compare them as timestamps
        Ok(candidates
            .into_iter()
            .filter(|d| d.available_until.is_some_and(|t| t < now))
            .collect())
    }

    async fn transition_donation(&self, id: &str, change: &DonationTransition) -> Result<bool> {
        let mut filter = doc! {
            "_id": id,
            "status": { "$in": statuses(&change.expected) },
        };
        if let Some(holder) = &change.holder {
            filter.insert(
                "$or",
                vec![
                    doc! { "reserved_for": holder.as_str() },
                    doc! { "reserved_for": { "$exists": false } },
                    doc! { "reserved_for": Bson::Null },
                ],
            );
        }

        let mut set = doc! {
            "status": change.status.as_str(),
            "updated_at": ts(&change.at)?,
        };
        if change.status == DonationStatus::Completed {
            set.insert("completed_at", ts(&change.at)?);
        }
        let mut update = Document::new();
        match &change.reservation {
            Reservation::Keep => {}
            Reservation::Set(recipient) => {
                set.insert("reserved_for", recipient.as_str());
            }
            Reservation::Clear => {
                update.insert("$unset", doc! { "reserved_for": "" });
            }
        }
        update.insert("$set", set);

        self.donations.update_where(filter, update).await
    }

    async fn insert_claim(&self, claim: &ClaimDoc) -> Result<()> {
        // The partial unique index rejects a second active claim
        self.claims.insert_one(claim.clone()).await
    }

    async fn delete_claim(&self, id: &str) -> Result<bool> {
        self.claims.delete_one(doc! { "_id": id }).await
    }

    async fn get_claim(&self, id: &str) -> Result<Option<ClaimDoc>> {
        self.claims.find_one(doc! { "_id": id }).await
    }

    async fn find_active_claim(&self, donation_id: &str) -> Result<Option<ClaimDoc>> {
        self.claims
            .find_one(doc! {
                "donation_id": donation_id,
                "status": ClaimStatus::Claimed.as_str(),
            })
            .await
    }

    async fn list_claims_for_recipient(
        &self,
        recipient_id: &str,
        page: Page,
    ) -> Result<Vec<ClaimDoc>> {
        self.claims
            .find_page(
                doc! { "recipient_id": recipient_id },
                newest_first(),
                page.offset,
                page_limit(page),
            )
            .await
    }

    async fn update_claim(&self, id: &str, change: &ClaimChange) -> Result<bool> {
        let mut filter = doc! {
            "_id": id,
            "status": ClaimStatus::Claimed.as_str(),
        };
        let set = match change {
            ClaimChange::HandOff { at } => {
                filter.insert("handed_off_at", doc! { "$exists": false });
                doc! { "handed_off_at": ts(at)?, "updated_at": ts(at)? }
            }
            ClaimChange::ConfirmReceipt { at } => {
                filter.insert("receipt_confirmed_at", doc! { "$exists": false });
                doc! { "receipt_confirmed_at": ts(at)?, "updated_at": ts(at)? }
            }
            ClaimChange::Complete { at } => {
                filter.insert("receipt_confirmed_at", doc! { "$exists": true });
                doc! {
                    "status": ClaimStatus::Completed.as_str(),
                    "donor_confirmed_at": ts(at)?,
                    "updated_at": ts(at)?,
                }
            }
            ClaimChange::Cancel {
                at,
                require_no_handoff,
            } => {
                if *require_no_handoff {
                    filter.insert("handed_off_at", doc! { "$exists": false });
                }
                doc! {
                    "status": ClaimStatus::Cancelled.as_str(),
                    "cancelled_at": ts(at)?,
                    "updated_at": ts(at)?,
                }
            }
        };
        self.claims
            .update_where(filter, doc! { "$set": set })
            .await
    }

    async fn insert_delivery(&self, delivery: &DeliveryDoc) -> Result<()> {
        self.deliveries.insert_one(delivery.clone()).await
    }

    async fn get_delivery(&self, id: &str) -> Result<Option<DeliveryDoc>> {
        self.deliveries.find_one(doc! { "_id": id }).await
    }

    async fn get_delivery_for_claim(&self, claim_id: &str) -> Result<Option<DeliveryDoc>> {
        self.deliveries.find_one(doc! { "claim_id": claim_id }).await
    }

    async fn list_open_deliveries(&self, page: Page) -> Result<Vec<DeliveryDoc>> {
        self.deliveries
            .find_page(
                doc! {
                    "status": DeliveryStatus::Pending.as_str(),
                    "volunteer_id": Bson::Null,
                },
                oldest_first(),
                page.offset,
                page_limit(page),
            )
            .await
    }

    async fn list_volunteer_deliveries(&self, volunteer_id: &str) -> Result<Vec<DeliveryDoc>> {
        self.deliveries
            .find_page(
                doc! {
                    "volunteer_id": volunteer_id,
                    "status": { "$ne": DeliveryStatus::Delivered.as_str() },
                },
                oldest_first(),
                0,
                0,
            )
            .await
    }

    async fn update_delivery(&self, id: &str, change: &DeliveryChange) -> Result<bool> {
        let (filter, set) = match change {
            DeliveryChange::Assign { volunteer_id, at } => (
                doc! {
                    "_id": id,
                    "status": DeliveryStatus::Pending.as_str(),
                    "volunteer_id": Bson::Null,
                },
                doc! {
                    "volunteer_id": volunteer_id.as_str(),
                    "status": DeliveryStatus::Assigned.as_str(),
                    "assigned_at": ts(at)?,
                    "updated_at": ts(at)?,
                },
            ),
            DeliveryChange::Advance {
                volunteer_id,
                from,
                to,
                at,
            } => {
                let mut set = doc! {
                    "status": to.as_str(),
                    "updated_at": ts(at)?,
                };
                if let Some(field) = to.timestamp_field() {
                    set.insert(field, ts(at)?);
                }
                (
                    doc! {
                        "_id": id,
                        "status": from.as_str(),
                        "volunteer_id": volunteer_id.as_str(),
                    },
                    set,
                )
            }
        };
        self.deliveries
            .update_where(filter, doc! { "$set": set })
            .await
    }

    async fn insert_direct_delivery(&self, direct: &DirectDeliveryDoc) -> Result<()> {
        self.direct_deliveries.insert_one(direct.clone()).await
    }

    async fn get_direct_delivery(&self, id: &str) -> Result<Option<DirectDeliveryDoc>> {
        self.direct_deliveries.find_one(doc! { "_id": id }).await
    }

    async fn get_direct_delivery_for_claim(
        &self,
        claim_id: &str,
    ) -> Result<Option<DirectDeliveryDoc>> {
        self.direct_deliveries
            .find_one(doc! { "claim_id": claim_id })
            .await
    }

    async fn update_direct_delivery(
        &self,
        id: &str,
        change: &DirectDeliveryChange,
    ) -> Result<bool> {
        let at = ts(&change.at)?;
        let mut set = doc! {
            "status": change.to.as_str(),
            "updated_at": at.clone(),
        };
        match change.to {
            DirectDeliveryStatus::CoordinationNeeded => {}
            DirectDeliveryStatus::Scheduled => {
                set.insert("scheduled_at", at);
                if let Some(when) = &change.update.scheduled_for {
                    set.insert("scheduled_for", ts(when)?);
                }
            }
            DirectDeliveryStatus::OutForDelivery => {
                set.insert("out_for_delivery_at", at);
            }
            DirectDeliveryStatus::Delivered => {
                set.insert("delivered_at", at);
            }
            DirectDeliveryStatus::Cancelled => {
                set.insert("cancelled_at", at);
                if let Some(reason) = &change.update.cancel_reason {
                    set.insert("cancel_reason", reason.as_str());
                }
            }
        }
        self.direct_deliveries
            .update_where(
                doc! { "_id": id, "status": change.from.as_str() },
                doc! { "$set": set },
            )
            .await
    }

    async fn insert_notification(&self, notification: &NotificationDoc) -> Result<()> {
        self.notifications.insert_one(notification.clone()).await
    }

    async fn get_notification(&self, id: &str) -> Result<Option<NotificationDoc>> {
        self.notifications.find_one(doc! { "_id": id }).await
    }

    async fn list_notifications(&self, user_id: &str, page: Page) -> Result<Vec<NotificationDoc>> {
        self.notifications
            .find_page(
                doc! { "user_id": user_id },
                newest_first(),
                page.offset,
                page_limit(page),
            )
            .await
    }

    async fn count_unread(&self, user_id: &str) -> Result<u64> {
        self.notifications
            .count(doc! { "user_id": user_id, "read": false })
            .await
    }

    async fn mark_notification_read(
        &self,
        id: &str,
        user_id: &str,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        self.notifications
            .update_where(
                doc! { "_id": id, "user_id": user_id, "read": false },
                doc! { "$set": { "read": true, "read_at": ts(&at)? } },
            )
            .await
    }

    async fn resolve_actions(
        &self,
        user_id: &str,
        claim_id: &str,
        action: ActionRequired,
        at: DateTime<Utc>,
    ) -> Result<u64> {
        self.notifications
            .update_many(
                doc! {
                    "user_id": user_id,
                    "claim_id": claim_id,
                    "action_required": action.as_str(),
                    "read": false,
                },
                doc! { "$set": { "read": true, "read_at": ts(&at)? } },
            )
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_doc_only_includes_set_fields() {
        let filter = DonationFilter {
            category: Some("food".into()),
            status: Some(DonationStatus::Available),
            ..Default::default()
        };
        let query = donation_filter_doc(&filter);
        assert_eq!(query.get_str("category").unwrap(), "food");
        assert_eq!(query.get_str("status").unwrap(), "available");
        assert!(query.get("donor_id").is_none());
    }

    #[test]
    fn test_timestamps_match_document_encoding() {
        let at = Utc::now();
        let encoded = ts(&at).unwrap();
        let stored = bson::to_document(&doc! { "at": encoded }).unwrap();
        let expected = bson::to_bson(&at).unwrap();
        assert_eq!(stored.get("at"), Some(&expected));
        assert!(matches!(expected, Bson::String(_)));
    }

    #[test]
    fn test_listings_sort_on_id_alone() {
        assert_eq!(newest_first(), doc! { "_id": -1 });
        assert_eq!(oldest_first(), doc! { "_id": 1 });
        assert!(!newest_first().contains_key("created_at"));
    }
}
