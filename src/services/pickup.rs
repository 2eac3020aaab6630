//! Self-pickup handoff
//!
//! In pickup mode the claim row is the unit of tracking. The recipient
//! records collecting the goods; before that, either party may call the
//! pickup off.

use chrono::Utc;
use tracing::info;

use super::{ClaimArbitrator, Context, Notice};
use crate::db::schemas::{
    ActionRequired, ClaimDoc, ClaimStatus, DeliveryMode, DonationStatus, NotificationEvent,
};
use crate::nats::{StatusEntity, StatusEvent};
use crate::store::ClaimChange;
use crate::types::{HandoffError, Result};

#[derive(Clone)]
pub struct PickupHandoff {
    ctx: Context,
}

impl PickupHandoff {
    pub fn new(ctx: Context) -> Self {
        Self { ctx }
    }

    async fn load_pickup_claim(&self, claim_id: &str) -> Result<ClaimDoc> {
        let claim = self.ctx.load_claim(claim_id).await?;
        if claim.delivery_mode != DeliveryMode::Pickup {
            return Err(HandoffError::BadRequest(format!(
                "claim {} is a {} claim, not a pickup",
                claim_id, claim.delivery_mode
            )));
        }
        Ok(claim)
    }

    /// `markPickupCollected`: the recipient has the goods
    pub async fn mark_collected(&self, claim_id: &str, recipient_id: &str) -> Result<ClaimDoc> {
        let claim = self.load_pickup_claim(claim_id).await?;
        if claim.recipient_id != recipient_id {
            return Err(HandoffError::Forbidden(format!(
                "only the recipient may record collecting claim {}",
                claim_id
            )));
        }

        let at = Utc::now();
        if !self
            .ctx
            .store
            .update_claim(claim_id, &ClaimChange::HandOff { at })
            .await?
        {
            let current = self.ctx.load_claim(claim_id).await?;
            if current.handed_off_at.is_some() && current.status == ClaimStatus::Claimed {
                // Already recorded
                return Ok(current);
            }
            return Err(HandoffError::InvalidTransition {
                entity: "claim",
                from: current.status.to_string(),
                to: "collected".into(),
            });
        }

        info!(claim_id, recipient_id, "Pickup collected");
        self.ctx
            .follow_donation(
                &claim.donation_id,
                &[DonationStatus::Claimed],
                DonationStatus::Delivered,
                at,
            )
            .await?;
        self.ctx
            .invalidate_claim_views(&claim.donation_id, claim_id)
            .await;
        self.ctx
            .publish_status(&StatusEvent::new(
                StatusEntity::Claim,
                claim_id,
                claim_id,
                "collected",
                recipient_id,
            ))
            .await;

        let event = NotificationEvent::HandoffRecorded {
            claim_id: claim_id.to_string(),
            donation_id: claim.donation_id.clone(),
            delivery_mode: DeliveryMode::Pickup,
        };
        self.ctx
            .notifier
            .emit_all(vec![
                Notice::new(
                    &claim.recipient_id,
                    "Pickup recorded",
                    "Please confirm you received everything",
                    event.clone(),
                )
                .requiring(ActionRequired::ConfirmReceipt),
                Notice::new(
                    &claim.donor_id,
                    "Your donation was picked up",
                    "The recipient collected your donation",
                    event,
                ),
            ])
            .await;

        self.ctx.load_claim(claim_id).await
    }

    /// `cancelPickupClaim`: call off a pickup before the handoff
    pub async fn cancel(&self, claim_id: &str, actor_id: &str) -> Result<ClaimDoc> {
        let claim = self.load_pickup_claim(claim_id).await?;
        if !claim.involves(actor_id) {
            return Err(HandoffError::Forbidden(format!(
                "only the donor or recipient may cancel claim {}",
                claim_id
            )));
        }
        let at = Utc::now();
        // An earlier cancel that died before reopening the donation
        if claim.status == ClaimStatus::Cancelled
            && ClaimArbitrator::reopen_donation(&self.ctx, &claim.donation_id, at).await?
        {
            self.ctx
                .invalidate_claim_views(&claim.donation_id, &claim.id)
                .await;
            return Ok(claim);
        }
        ClaimArbitrator::release_claim(&self.ctx, &claim, actor_id, None, at).await
    }
}
