//! Direct delivery state machine
//!
//! `coordination_needed -> scheduled -> out_for_delivery -> delivered`, with
//! `cancelled` reachable from any non-terminal state. Only the donor drives
//! it. Cancelling releases the claim so the donation can be claimed again.

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use super::{ClaimArbitrator, Context, Notice};
use crate::db::schemas::{
    ActionRequired, ClaimStatus, DeliveryMode, DirectDeliveryDoc, DirectDeliveryStatus,
    DirectDeliveryUpdate, DonationStatus, NotificationEvent,
};
use crate::nats::{StatusEntity, StatusEvent};
use crate::store::DirectDeliveryChange;
use crate::types::{HandoffError, Result};

#[derive(Clone)]
pub struct DirectDeliveries {
    ctx: Context,
}

impl DirectDeliveries {
    pub fn new(ctx: Context) -> Self {
        Self { ctx }
    }

    /// `markDirectDeliveryStatus`
    pub async fn mark_status(
        &self,
        direct_delivery_id: &str,
        donor_id: &str,
        target: DirectDeliveryStatus,
        scheduled_for: Option<DateTime<Utc>>,
        reason: Option<String>,
    ) -> Result<DirectDeliveryDoc> {
        let direct = self.ctx.load_direct_delivery(direct_delivery_id).await?;
        if direct.donor_id != donor_id {
            return Err(HandoffError::Forbidden(format!(
                "only the donor may update direct delivery {}",
                direct_delivery_id
            )));
        }
        if target == DirectDeliveryStatus::Cancelled && direct.status == target {
            return self.finish_cancel(direct, donor_id, reason).await;
        }
        if !direct.status.can_transition_to(target) {
            return Err(HandoffError::InvalidTransition {
                entity: "direct_delivery",
                from: direct.status.to_string(),
                to: target.to_string(),
            });
        }

        let at = Utc::now();
        let change = DirectDeliveryChange {
            from: direct.status,
            to: target,
            update: DirectDeliveryUpdate {
                scheduled_for,
                cancel_reason: reason.clone(),
            },
            at,
        };
        if !self
            .ctx
            .store
            .update_direct_delivery(direct_delivery_id, &change)
            .await?
        {
            let current = self.ctx.load_direct_delivery(direct_delivery_id).await?;
            warn!(direct_delivery_id, current = %current.status, "Lost direct delivery race");
            return Err(HandoffError::StaleState {
                entity: "direct_delivery",
                id: direct_delivery_id.to_string(),
                current: current.status.to_string(),
            });
        }

        info!(
            direct_delivery_id,
            claim_id = %direct.claim_id,
            from = %direct.status,
            to = %target,
            "Direct delivery updated"
        );

        match target {
            DirectDeliveryStatus::OutForDelivery => {
                self.ctx
                    .follow_donation(
                        &direct.donation_id,
                        &[DonationStatus::Claimed],
                        DonationStatus::InTransit,
                        at,
                    )
                    .await?;
            }
            DirectDeliveryStatus::Delivered => {
                self.ctx
                    .follow_donation(
                        &direct.donation_id,
                        &[DonationStatus::Claimed, DonationStatus::InTransit],
                        DonationStatus::Delivered,
                        at,
                    )
                    .await?;
            }
            DirectDeliveryStatus::Cancelled => {
                let claim = self.ctx.load_claim(&direct.claim_id).await?;
                ClaimArbitrator::release_claim(&self.ctx, &claim, donor_id, reason, at).await?;
            }
            _ => {}
        }

        self.ctx
            .invalidate_claim_views(&direct.donation_id, &direct.claim_id)
            .await;
        self.ctx
            .publish_status(
                &StatusEvent::new(
                    StatusEntity::DirectDelivery,
                    direct_delivery_id,
                    &direct.claim_id,
                    target,
                    donor_id,
                )
                .with_previous(direct.status),
            )
            .await;

        let updated = self.ctx.load_direct_delivery(direct_delivery_id).await?;
        self.notify_recipient(&updated).await;
        Ok(updated)
    }

    /// A cancelled row whose claim or donation was left behind by an earlier
    /// failed attempt. Completes the release; anything else is a repeat.
    async fn finish_cancel(
        &self,
        direct: DirectDeliveryDoc,
        donor_id: &str,
        reason: Option<String>,
    ) -> Result<DirectDeliveryDoc> {
        let at = Utc::now();
        let claim = self.ctx.load_claim(&direct.claim_id).await?;
        let resumed = match claim.status {
            ClaimStatus::Claimed => {
                ClaimArbitrator::release_claim(&self.ctx, &claim, donor_id, reason, at).await?;
                true
            }
            ClaimStatus::Cancelled => {
                ClaimArbitrator::reopen_donation(&self.ctx, &direct.donation_id, at).await?
            }
            ClaimStatus::Completed => false,
        };
        if !resumed {
            return Err(HandoffError::InvalidTransition {
                entity: "direct_delivery",
                from: direct.status.to_string(),
                to: DirectDeliveryStatus::Cancelled.to_string(),
            });
        }

        warn!(
            direct_delivery_id = %direct.id,
            claim_id = %direct.claim_id,
            "Finished an interrupted direct delivery cancellation"
        );
        self.ctx
            .invalidate_claim_views(&direct.donation_id, &direct.claim_id)
            .await;
        Ok(direct)
    }

    async fn notify_recipient(&self, direct: &DirectDeliveryDoc) {
        let notice = match direct.status {
            // The claim release already told the recipient
            DirectDeliveryStatus::Cancelled | DirectDeliveryStatus::CoordinationNeeded => return,
            DirectDeliveryStatus::Delivered => Notice::new(
                &direct.recipient_id,
                "Your donation was delivered",
                "Please confirm you received it",
                NotificationEvent::HandoffRecorded {
                    claim_id: direct.claim_id.clone(),
                    donation_id: direct.donation_id.clone(),
                    delivery_mode: DeliveryMode::Direct,
                },
            )
            .requiring(ActionRequired::ConfirmReceipt),
            status => Notice::new(
                &direct.recipient_id,
                match status {
                    DirectDeliveryStatus::Scheduled => "Delivery scheduled",
                    _ => "Donation on its way",
                },
                match direct.scheduled_for {
                    Some(when) if status == DirectDeliveryStatus::Scheduled => {
                        format!("The donor will drop it off at {}", when.to_rfc3339())
                    }
                    _ => format!("Delivery is now {}", status),
                },
                NotificationEvent::DirectDeliveryStatusChanged {
                    direct_delivery_id: direct.id.clone(),
                    claim_id: direct.claim_id.clone(),
                    status,
                    scheduled_for: direct.scheduled_for,
                },
            ),
        };
        self.ctx.notifier.emit_best_effort(notice).await;
    }
}
