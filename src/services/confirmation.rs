//! Confirmation protocol
//!
//! 1. The handling party records the handoff (volunteer `delivered`, direct
//!    `delivered`, or pickup collected). The recipient gets a
//!    `confirm_receipt` action.
//! 2. The recipient confirms receipt. Write-once: repeats are no-ops. The
//!    donor gets a `donor_final_confirmation` action.
//! 3. The donor signs off. Only this step completes the claim and the
//!    donation, and it requires step 2.
//!
//! Each action notification is marked read by performing its step, never by
//! viewing it. All three modes go through the same code via [`Fulfillment`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::{Context, Fulfillment, Notice};
use crate::cache::affected;
use crate::db::schemas::{
    ActionRequired, ClaimDoc, ClaimStatus, DeliveryMode, DonationDoc, DonationStatus,
    NotificationEvent,
};
use crate::nats::{StatusEntity, StatusEvent};
use crate::store::ClaimChange;
use crate::types::{HandoffError, Result};

/// Acknowledgement of `confirmReceipt`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReceiptAck {
    pub claim_id: String,
    pub receipt_confirmed_at: DateTime<Utc>,
    /// False when the receipt had already been confirmed
    pub newly_confirmed: bool,
}

#[derive(Clone)]
pub struct ConfirmationProtocol {
    ctx: Context,
}

impl ConfirmationProtocol {
    pub fn new(ctx: Context) -> Self {
        Self { ctx }
    }

    /// `confirmReceipt`
    pub async fn confirm_receipt(&self, claim_id: &str, recipient_id: &str) -> Result<ReceiptAck> {
        let claim = self.ctx.load_claim(claim_id).await?;
        if claim.recipient_id != recipient_id {
            return Err(HandoffError::Forbidden(format!(
                "only the recipient may confirm receipt for claim {}",
                claim_id
            )));
        }
        if let Some(at) = claim.receipt_confirmed_at {
            debug!(claim_id, "Receipt already confirmed");
            return Ok(ReceiptAck {
                claim_id: claim.id,
                receipt_confirmed_at: at,
                newly_confirmed: false,
            });
        }
        if claim.status == ClaimStatus::Cancelled {
            return Err(HandoffError::InvalidTransition {
                entity: "claim",
                from: claim.status.to_string(),
                to: "receipt_confirmed".into(),
            });
        }

        let fulfillment = Fulfillment::for_claim(&self.ctx, &claim).await?;
        if !fulfillment.handoff_recorded() {
            return Err(HandoffError::PrematureConfirmation {
                claim_id: claim_id.to_string(),
                missing: format!("handoff ({} is {})", fulfillment.mode(), fulfillment.status()),
            });
        }

        let at = Utc::now();
        if !self
            .ctx
            .store
            .update_claim(claim_id, &ClaimChange::ConfirmReceipt { at })
            .await?
        {
            let current = self.ctx.load_claim(claim_id).await?;
            return match current.receipt_confirmed_at {
                // A concurrent call confirmed first
                Some(confirmed_at) => Ok(ReceiptAck {
                    claim_id: current.id,
                    receipt_confirmed_at: confirmed_at,
                    newly_confirmed: false,
                }),
                None => Err(HandoffError::StaleState {
                    entity: "claim",
                    id: claim_id.to_string(),
                    current: current.status.to_string(),
                }),
            };
        }

        info!(claim_id, recipient_id, mode = %claim.delivery_mode, "Receipt confirmed");

        self.ctx
            .notifier
            .resolve_best_effort(recipient_id, claim_id, ActionRequired::ConfirmReceipt)
            .await;
        self.ctx
            .views
            .invalidate(&[affected::tracking(claim_id)])
            .await;
        self.ctx
            .publish_status(&StatusEvent::new(
                StatusEntity::Claim,
                claim_id,
                claim_id,
                "receipt_confirmed",
                recipient_id,
            ))
            .await;
        self.ctx
            .notifier
            .emit_best_effort(
                Notice::new(
                    &claim.donor_id,
                    "Recipient confirmed receipt",
                    "Please give the final confirmation to complete the donation",
                    NotificationEvent::ReceiptConfirmed {
                        claim_id: claim_id.to_string(),
                        donation_id: claim.donation_id.clone(),
                        recipient_id: recipient_id.to_string(),
                    },
                )
                .requiring(ActionRequired::DonorFinalConfirmation),
            )
            .await;

        Ok(ReceiptAck {
            claim_id: claim.id,
            receipt_confirmed_at: at,
            newly_confirmed: true,
        })
    }

    /// `confirmDonorDelivery` (volunteer mode)
    pub async fn confirm_donor_delivery(
        &self,
        delivery_id: &str,
        donor_id: &str,
    ) -> Result<DonationDoc> {
        let delivery = self.ctx.load_delivery(delivery_id).await?;
        self.finalize(Fulfillment::Volunteer(delivery), donor_id).await
    }

    /// `confirmDonorPickup`
    pub async fn confirm_donor_pickup(&self, claim_id: &str, donor_id: &str) -> Result<DonationDoc> {
        let claim = self.ctx.load_claim(claim_id).await?;
        if claim.delivery_mode != DeliveryMode::Pickup {
            return Err(HandoffError::BadRequest(format!(
                "claim {} is a {} claim, not a pickup",
                claim_id, claim.delivery_mode
            )));
        }
        self.finalize(Fulfillment::Pickup(claim), donor_id).await
    }

    /// `confirmDonorDirectDelivery`
    pub async fn confirm_donor_direct_delivery(
        &self,
        direct_delivery_id: &str,
        donor_id: &str,
    ) -> Result<DonationDoc> {
        let direct = self.ctx.load_direct_delivery(direct_delivery_id).await?;
        self.finalize(Fulfillment::Direct(direct), donor_id).await
    }

    /// Donor sign-off, shared by every mode
    async fn finalize(&self, fulfillment: Fulfillment, donor_id: &str) -> Result<DonationDoc> {
        if fulfillment.donor_id() != donor_id {
            return Err(HandoffError::Forbidden(format!(
                "only the donor may give final confirmation for claim {}",
                fulfillment.claim_id()
            )));
        }

        let claim_id = fulfillment.claim_id().to_string();
        let claim = self.ctx.load_claim(&claim_id).await?;
        match claim.status {
            ClaimStatus::Completed => return self.ctx.load_donation(&claim.donation_id).await,
            ClaimStatus::Cancelled => {
                return Err(HandoffError::InvalidTransition {
                    entity: "claim",
                    from: claim.status.to_string(),
                    to: ClaimStatus::Completed.to_string(),
                })
            }
            ClaimStatus::Claimed => {}
        }
        self.ensure_ready(&fulfillment, &claim)?;

        let at = Utc::now();
        if !self
            .ctx
            .store
            .update_claim(&claim_id, &ClaimChange::Complete { at })
            .await?
        {
            let current = self.ctx.load_claim(&claim_id).await?;
            if current.status == ClaimStatus::Completed {
                return self.ctx.load_donation(&current.donation_id).await;
            }
            self.ensure_ready(&fulfillment, &current)?;
            return Err(HandoffError::StaleState {
                entity: "claim",
                id: claim_id,
                current: current.status.to_string(),
            });
        }

        self.ctx
            .follow_donation(
                &claim.donation_id,
                &[
                    DonationStatus::Claimed,
                    DonationStatus::InTransit,
                    DonationStatus::Delivered,
                ],
                DonationStatus::Completed,
                at,
            )
            .await?;

        info!(
            claim_id = %claim_id,
            donation_id = %claim.donation_id,
            mode = %fulfillment.mode(),
            "Donation completed"
        );

        self.ctx
            .notifier
            .resolve_best_effort(donor_id, &claim_id, ActionRequired::DonorFinalConfirmation)
            .await;
        self.ctx
            .invalidate_claim_views(&claim.donation_id, &claim_id)
            .await;
        if let Some(volunteer_id) = fulfillment.volunteer_id() {
            self.ctx
                .views
                .invalidate(&[affected::volunteer_tasks(volunteer_id)])
                .await;
        }
        self.ctx
            .publish_status(
                &StatusEvent::new(
                    StatusEntity::Claim,
                    &claim_id,
                    &claim_id,
                    ClaimStatus::Completed,
                    donor_id,
                )
                .with_previous(ClaimStatus::Claimed),
            )
            .await;

        let event = NotificationEvent::DonationCompleted {
            claim_id: claim_id.clone(),
            donation_id: claim.donation_id.clone(),
        };
        let mut notices = vec![Notice::new(
            &claim.recipient_id,
            "Donation complete",
            "The donor confirmed the handoff. Thank you!",
            event.clone(),
        )];
        if let Some(volunteer_id) = fulfillment.volunteer_id() {
            notices.push(Notice::new(
                volunteer_id,
                "Delivery complete",
                "The donor confirmed the delivery you made. Thank you!",
                event,
            ));
        }
        self.ctx.notifier.emit_all(notices).await;

        self.ctx.load_donation(&claim.donation_id).await
    }

    fn ensure_ready(&self, fulfillment: &Fulfillment, claim: &ClaimDoc) -> Result<()> {
        // Pickup records are snapshots of the claim; judge the fresh row
        let handed_off = match fulfillment {
            Fulfillment::Pickup(_) => claim.handed_off_at.is_some(),
            other => other.handoff_recorded(),
        };
        if !handed_off {
            return Err(HandoffError::PrematureConfirmation {
                claim_id: claim.id.clone(),
                missing: "handoff".into(),
            });
        }
        if claim.receipt_confirmed_at.is_none() {
            return Err(HandoffError::PrematureConfirmation {
                claim_id: claim.id.clone(),
                missing: "recipient receipt".into(),
            });
        }
        Ok(())
    }
}
