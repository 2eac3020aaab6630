//! Volunteer delivery state machine
//!
//! `pending -> assigned -> accepted -> picked_up -> in_transit -> delivered`
//!
//! Strictly forward, one step at a time, each step a conditional write
//! guarded by the current status and the bound volunteer. `delivered` is not
//! the end of the claim; it hands over to the confirmation protocol.

use chrono::Utc;
use tracing::{info, warn};

use super::{Context, Notice};
use crate::cache::{affected, ViewKey};
use crate::db::schemas::{
    ActionRequired, DeliveryDoc, DeliveryMode, DeliveryStatus, DonationStatus, NotificationEvent,
};
use crate::nats::{StatusEntity, StatusEvent};
use crate::store::{DeliveryChange, Page};
use crate::types::{HandoffError, Result};

#[derive(Clone)]
pub struct VolunteerDeliveries {
    ctx: Context,
}

impl VolunteerDeliveries {
    pub fn new(ctx: Context) -> Self {
        Self { ctx }
    }

    /// `assignVolunteer`: bind a volunteer to a pending delivery
    pub async fn assign(&self, delivery_id: &str, volunteer_id: &str) -> Result<DeliveryDoc> {
        let delivery = self.ctx.load_delivery(delivery_id).await?;
        if volunteer_id == delivery.donor_id || volunteer_id == delivery.recipient_id {
            return Err(HandoffError::Forbidden(
                "the donor and recipient cannot volunteer for their own delivery".into(),
            ));
        }

        let change = DeliveryChange::Assign {
            volunteer_id: volunteer_id.to_string(),
            at: Utc::now(),
        };
        if !self.ctx.store.update_delivery(delivery_id, &change).await? {
            let current = self.ctx.load_delivery(delivery_id).await?;
            return match current.volunteer_id.as_deref() {
                // Repeated self-assignment
                Some(bound) if bound == volunteer_id => Ok(current),
                Some(bound) => Err(HandoffError::AlreadyAssigned {
                    delivery_id: delivery_id.to_string(),
                    volunteer_id: bound.to_string(),
                }),
                None => Err(HandoffError::StaleState {
                    entity: "delivery",
                    id: delivery_id.to_string(),
                    current: current.status.to_string(),
                }),
            };
        }

        info!(delivery_id, volunteer_id, claim_id = %delivery.claim_id, "Volunteer assigned");
        self.ctx
            .views
            .invalidate(&[
                affected::open_tasks(),
                affected::volunteer_tasks(volunteer_id),
                affected::tracking(&delivery.claim_id),
            ])
            .await;
        self.ctx
            .publish_status(
                &StatusEvent::new(
                    StatusEntity::Delivery,
                    delivery_id,
                    &delivery.claim_id,
                    DeliveryStatus::Assigned,
                    volunteer_id,
                )
                .with_previous(DeliveryStatus::Pending),
            )
            .await;

        let event = NotificationEvent::VolunteerAssigned {
            delivery_id: delivery_id.to_string(),
            claim_id: delivery.claim_id.clone(),
            volunteer_id: volunteer_id.to_string(),
        };
        self.ctx
            .notifier
            .emit_all(vec![
                Notice::new(
                    &delivery.donor_id,
                    "A volunteer is on it",
                    "A volunteer will collect your donation",
                    event.clone(),
                ),
                Notice::new(
                    &delivery.recipient_id,
                    "A volunteer is on it",
                    "A volunteer will bring your donation",
                    event,
                ),
            ])
            .await;

        self.ctx.load_delivery(delivery_id).await
    }

    /// `advanceDeliveryStatus`
    pub async fn advance(
        &self,
        delivery_id: &str,
        actor_id: &str,
        target: DeliveryStatus,
    ) -> Result<DeliveryDoc> {
        if target == DeliveryStatus::Assigned {
            return self.assign(delivery_id, actor_id).await;
        }

        let delivery = self.ctx.load_delivery(delivery_id).await?;
        if delivery.volunteer_id.as_deref() != Some(actor_id) {
            return Err(HandoffError::Forbidden(format!(
                "only the assigned volunteer may update delivery {}",
                delivery_id
            )));
        }
        if delivery.status.next() != Some(target) {
            return Err(HandoffError::InvalidTransition {
                entity: "delivery",
                from: delivery.status.to_string(),
                to: target.to_string(),
            });
        }

        let at = Utc::now();
        let change = DeliveryChange::Advance {
            volunteer_id: actor_id.to_string(),
            from: delivery.status,
            to: target,
            at,
        };
        if !self.ctx.store.update_delivery(delivery_id, &change).await? {
            let current = self.ctx.load_delivery(delivery_id).await?;
            warn!(delivery_id, actor_id, current = %current.status, "Lost delivery race");
            return Err(HandoffError::StaleState {
                entity: "delivery",
                id: delivery_id.to_string(),
                current: current.status.to_string(),
            });
        }

        info!(
            delivery_id,
            claim_id = %delivery.claim_id,
            from = %delivery.status,
            to = %target,
            "Delivery advanced"
        );

        match target {
            DeliveryStatus::InTransit => {
                self.ctx
                    .follow_donation(
                        &delivery.donation_id,
                        &[DonationStatus::Claimed],
                        DonationStatus::InTransit,
                        at,
                    )
                    .await?;
            }
            DeliveryStatus::Delivered => {
                self.ctx
                    .follow_donation(
                        &delivery.donation_id,
                        &[DonationStatus::Claimed, DonationStatus::InTransit],
                        DonationStatus::Delivered,
                        at,
                    )
                    .await?;
            }
            _ => {}
        }

        self.ctx
            .views
            .invalidate(&[affected::volunteer_tasks(actor_id)])
            .await;
        self.ctx
            .invalidate_claim_views(&delivery.donation_id, &delivery.claim_id)
            .await;
        self.ctx
            .publish_status(
                &StatusEvent::new(
                    StatusEntity::Delivery,
                    delivery_id,
                    &delivery.claim_id,
                    target,
                    actor_id,
                )
                .with_previous(delivery.status),
            )
            .await;

        self.notify_progress(&delivery, target).await;
        self.ctx.load_delivery(delivery_id).await
    }

    async fn notify_progress(&self, delivery: &DeliveryDoc, status: DeliveryStatus) {
        let event = NotificationEvent::DeliveryStatusChanged {
            delivery_id: delivery.id.clone(),
            claim_id: delivery.claim_id.clone(),
            status,
        };
        let title = format!("Delivery {}", status.as_str().replace('_', " "));

        let recipient_notice = if status == DeliveryStatus::Delivered {
            Notice::new(
                &delivery.recipient_id,
                "Your donation was delivered",
                "Please confirm you received it",
                NotificationEvent::HandoffRecorded {
                    claim_id: delivery.claim_id.clone(),
                    donation_id: delivery.donation_id.clone(),
                    delivery_mode: DeliveryMode::Volunteer,
                },
            )
            .requiring(ActionRequired::ConfirmReceipt)
        } else {
            Notice::new(
                &delivery.recipient_id,
                title.clone(),
                format!("Your delivery is now {}", status),
                event.clone(),
            )
        };

        self.ctx
            .notifier
            .emit_all(vec![
                Notice::new(
                    &delivery.donor_id,
                    title,
                    format!("Your donation's delivery is now {}", status),
                    event,
                ),
                recipient_notice,
            ])
            .await;
    }

    /// `listOpenTasks`: unbound pending deliveries, oldest first
    pub async fn list_open_tasks(&self, page: Page) -> Result<Vec<DeliveryDoc>> {
        let store = &self.ctx.store;
        self.ctx
            .views
            .read_through(ViewKey::open_tasks(page), self.ctx.views.list_ttl(), || {
                store.list_open_deliveries(page)
            })
            .await
    }

    /// `listVolunteerTasks`: the volunteer's undelivered deliveries
    pub async fn list_volunteer_tasks(&self, volunteer_id: &str) -> Result<Vec<DeliveryDoc>> {
        let store = &self.ctx.store;
        self.ctx
            .views
            .read_through(
                ViewKey::volunteer_tasks(volunteer_id),
                self.ctx.views.user_ttl(),
                || store.list_volunteer_deliveries(volunteer_id),
            )
            .await
    }
}
