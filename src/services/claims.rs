//! Claim arbitrator
//!
//! A claim is won by one conditional write on the donation's status
//! (`available|matched -> claimed`). The conflict check always reads the
//! store, never the cache. A lost race is retried a bounded number of times
//! against a fresh read, then surfaced as `AlreadyClaimed`.
//!
//! The store additionally refuses a second active claim row per donation, so
//! the invariant holds even if two writers both believed they had won.

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use super::{Context, Notice};
use crate::cache::affected;
use crate::db::schemas::{
    ClaimDoc, DeliveryDoc, DeliveryMode, DirectDeliveryDoc, DonationDoc, DonationStatus,
    NotificationEvent,
};
use crate::nats::{StatusEntity, StatusEvent, TaskAvailable};
use crate::store::{ClaimChange, DonationTransition, Reservation};
use crate::types::{HandoffError, Result};

#[derive(Clone)]
pub struct ClaimArbitrator {
    ctx: Context,
}

impl ClaimArbitrator {
    pub fn new(ctx: Context) -> Self {
        Self { ctx }
    }

    /// `createClaim`
    pub async fn create_claim(
        &self,
        donation_id: &str,
        recipient_id: &str,
        quantity: u32,
    ) -> Result<ClaimDoc> {
        if recipient_id.trim().is_empty() {
            return Err(HandoffError::BadRequest("recipient id is required".into()));
        }

        let max_attempts = self.ctx.config.claim_max_attempts.max(1);
        let mut last_seen = DonationStatus::Available;

        for attempt in 1..=max_attempts {
            let donation = self.ctx.load_donation(donation_id).await?;
            last_seen = donation.status;

            if donation.donor_id == recipient_id {
                return Err(HandoffError::SelfClaim {
                    donation_id: donation_id.to_string(),
                });
            }
            if quantity == 0 || quantity > donation.quantity {
                return Err(HandoffError::BadRequest(format!(
                    "quantity must be between 1 and {}",
                    donation.quantity
                )));
            }
            if !donation.status.is_claimable() || reserved_for_other(&donation, recipient_id) {
                return Err(already_claimed(&donation));
            }

            let change = DonationTransition::new(&[donation.status], DonationStatus::Claimed)
                .held_by(recipient_id)
                .reservation(Reservation::Clear);
            if !self.ctx.store.transition_donation(donation_id, &change).await? {
                warn!(donation_id, recipient_id, attempt, "Lost claim race, re-reading");
                continue;
            }

            return self.commit(donation, recipient_id, quantity).await;
        }

        Err(HandoffError::AlreadyClaimed {
            donation_id: donation_id.to_string(),
            current: last_seen.to_string(),
        })
    }

    /// The donation is ours; write the claim and its fulfillment record
    async fn commit(
        &self,
        donation: DonationDoc,
        recipient_id: &str,
        quantity: u32,
    ) -> Result<ClaimDoc> {
        let claim = ClaimDoc::new(
            Context::new_id(),
            donation.id.clone(),
            recipient_id.to_string(),
            donation.donor_id.clone(),
            quantity,
            donation.delivery_mode,
        );

        if let Err(e) = self.ctx.store.insert_claim(&claim).await {
            self.undo_donation(&donation).await;
            return Err(e);
        }

        let record = match donation.delivery_mode {
            DeliveryMode::Pickup => Ok(None),
            DeliveryMode::Volunteer => {
                let delivery = DeliveryDoc::new(
                    Context::new_id(),
                    claim.id.clone(),
                    donation.id.clone(),
                    donation.donor_id.clone(),
                    recipient_id.to_string(),
                    donation.pickup_location.clone(),
                );
                self.ctx
                    .store
                    .insert_delivery(&delivery)
                    .await
                    .map(|_| Some(delivery))
            }
            DeliveryMode::Direct => {
                let direct = DirectDeliveryDoc::new(
                    Context::new_id(),
                    claim.id.clone(),
                    donation.id.clone(),
                    donation.donor_id.clone(),
                    recipient_id.to_string(),
                );
                self.ctx
                    .store
                    .insert_direct_delivery(&direct)
                    .await
                    .map(|_| None)
            }
        };

        let delivery = match record {
            Ok(delivery) => delivery,
            Err(e) => {
                if let Err(undo) = self.ctx.store.delete_claim(&claim.id).await {
                    warn!(claim_id = %claim.id, error = %undo, "Failed to remove orphaned claim");
                }
                self.undo_donation(&donation).await;
                return Err(e);
            }
        };

        info!(
            claim_id = %claim.id,
            donation_id = %donation.id,
            recipient_id,
            mode = %donation.delivery_mode,
            "Claim created"
        );

        self.ctx
            .invalidate_claim_views(&donation.id, &claim.id)
            .await;
        self.ctx
            .publish_status(
                &StatusEvent::new(
                    StatusEntity::Donation,
                    &donation.id,
                    &claim.id,
                    DonationStatus::Claimed,
                    recipient_id,
                )
                .with_previous(donation.status),
            )
            .await;

        self.ctx
            .notifier
            .emit_best_effort(Notice::new(
                &donation.donor_id,
                "Your donation was claimed",
                format!("\"{}\" was claimed ({} units)", donation.title, quantity),
                NotificationEvent::ClaimCreated {
                    donation_id: donation.id.clone(),
                    claim_id: claim.id.clone(),
                    recipient_id: recipient_id.to_string(),
                    quantity,
                    delivery_mode: donation.delivery_mode,
                },
            ))
            .await;

        if let Some(delivery) = delivery {
            // Volunteers discover tasks by query; this is only a wake-up signal
            self.ctx
                .views
                .invalidate(&[affected::open_tasks()])
                .await;
            let subject = self.ctx.publisher.subjects().open_tasks();
            self.ctx
                .publisher
                .publish_json(
                    &subject,
                    &TaskAvailable {
                        delivery_id: delivery.id.clone(),
                        claim_id: claim.id.clone(),
                        donation_id: donation.id.clone(),
                        pickup_location: delivery.pickup_location.clone(),
                        at: delivery.created_at,
                    },
                )
                .await;
        }

        Ok(claim)
    }

    /// Put the donation back the way the claim found it
    async fn undo_donation(&self, before: &DonationDoc) {
        let reservation = match &before.reserved_for {
            Some(recipient) => Reservation::Set(recipient.clone()),
            None => Reservation::Clear,
        };
        let change = DonationTransition::new(&[DonationStatus::Claimed], before.status)
            .reservation(reservation);
        match self.ctx.store.transition_donation(&before.id, &change).await {
            Ok(true) => debug!(donation_id = %before.id, "Donation claim rolled back"),
            Ok(false) => warn!(donation_id = %before.id, "Donation moved before rollback"),
            Err(e) => warn!(donation_id = %before.id, error = %e, "Donation rollback failed"),
        }
    }

    /// Cancel an active claim and put its donation back on the board.
    ///
    /// Used when a pickup is called off before handoff and when a direct
    /// delivery is cancelled. `counterpart` is told why.
    pub async fn release_claim(
        ctx: &Context,
        claim: &ClaimDoc,
        actor_id: &str,
        reason: Option<String>,
        at: DateTime<Utc>,
    ) -> Result<ClaimDoc> {
        let change = ClaimChange::Cancel {
            at,
            require_no_handoff: true,
        };
        if !ctx.store.update_claim(&claim.id, &change).await? {
            let current = ctx.load_claim(&claim.id).await?;
            let from = if current.handed_off_at.is_some() {
                "handed_off".to_string()
            } else {
                current.status.to_string()
            };
            return Err(HandoffError::InvalidTransition {
                entity: "claim",
                from,
                to: "cancelled".into(),
            });
        }

        info!(claim_id = %claim.id, actor_id, "Claim cancelled");
        Self::reopen_donation(ctx, &claim.donation_id, at).await?;

        ctx.invalidate_claim_views(&claim.donation_id, &claim.id).await;
        ctx.publish_status(&StatusEvent::new(
            StatusEntity::Claim,
            &claim.id,
            &claim.id,
            "cancelled",
            actor_id,
        ))
        .await;

        let counterpart = if actor_id == claim.donor_id {
            &claim.recipient_id
        } else {
            &claim.donor_id
        };
        ctx.notifier
            .emit_best_effort(Notice::new(
                counterpart,
                "Claim cancelled",
                match &reason {
                    Some(r) => format!("The handoff was called off: {}", r),
                    None => "The handoff was called off".to_string(),
                },
                NotificationEvent::ClaimCancelled {
                    claim_id: claim.id.clone(),
                    donation_id: claim.donation_id.clone(),
                    reason,
                },
            ))
            .await;

        ctx.load_claim(&claim.id).await
    }

    /// Put a donation whose claim was cancelled back on offer. Safe to repeat:
    /// it does nothing while any claim on the donation is still active, or
    /// once the donation has left `claimed|in_transit`.
    pub async fn reopen_donation(
        ctx: &Context,
        donation_id: &str,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        if let Some(active) = ctx.store.find_active_claim(donation_id).await? {
            debug!(donation_id, claim_id = %active.id, "Donation still held by an active claim");
            return Ok(false);
        }

        let mut reopen = DonationTransition::new(
            &[DonationStatus::Claimed, DonationStatus::InTransit],
            DonationStatus::Available,
        )
        .reservation(Reservation::Clear);
        reopen.at = at;
        let reopened = ctx.store.transition_donation(donation_id, &reopen).await?;
        if reopened {
            info!(donation_id, "Donation back on offer");
        } else {
            warn!(donation_id, "Donation not reopened after cancellation");
        }
        Ok(reopened)
    }
}

fn reserved_for_other(donation: &DonationDoc, recipient_id: &str) -> bool {
    donation.status == DonationStatus::Matched
        && donation
            .reserved_for
            .as_deref()
            .is_some_and(|holder| holder != recipient_id)
}

fn already_claimed(donation: &DonationDoc) -> HandoffError {
    HandoffError::AlreadyClaimed {
        donation_id: donation.id.clone(),
        current: donation.status.to_string(),
    }
}
