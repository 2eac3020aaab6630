//! Donation service
//!
//! Posting and reading donations, the donor's soft reservation (`matched`),
//! withdrawal, and the expiry sweep. Claiming lives in the arbitrator.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::{Context, Notice};
use crate::cache::{affected, ViewKey};
use crate::db::schemas::{DonationDoc, DonationStatus, NewDonation, NotificationEvent};
use crate::store::{DonationFilter, DonationTransition, Page, Reservation};
use crate::types::{HandoffError, Result};

/// Outcome of an expiry sweep
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExpiryReport {
    pub expired: Vec<String>,
    /// Candidates that were claimed or changed before the sweep reached them
    pub skipped: usize,
}

#[derive(Clone)]
pub struct Donations {
    ctx: Context,
}

impl Donations {
    pub fn new(ctx: Context) -> Self {
        Self { ctx }
    }

    /// `postDonation`: new donations start `available`
    pub async fn post(&self, donor_id: &str, attrs: NewDonation) -> Result<DonationDoc> {
        if donor_id.trim().is_empty() {
            return Err(HandoffError::BadRequest("donor id is required".into()));
        }
        if attrs.title.trim().is_empty() || attrs.category.trim().is_empty() {
            return Err(HandoffError::BadRequest(
                "title and category must not be empty".into(),
            ));
        }
        if attrs.quantity == 0 {
            return Err(HandoffError::BadRequest("quantity must be positive".into()));
        }
        if let Some(until) = attrs.available_until {
            if until <= Utc::now() {
                return Err(HandoffError::BadRequest(
                    "available_until must be in the future".into(),
                ));
            }
        }

        let donation = DonationDoc::new(Context::new_id(), donor_id.to_string(), attrs);
        self.ctx.store.insert_donation(&donation).await?;
        self.ctx
            .views
            .invalidate(&affected::donation(&donation.id))
            .await;

        info!(
            donation_id = %donation.id,
            donor_id,
            mode = %donation.delivery_mode,
            quantity = donation.quantity,
            "Donation posted"
        );
        Ok(donation)
    }

    pub async fn get(&self, donation_id: &str) -> Result<DonationDoc> {
        let ctx = &self.ctx;
        ctx.views
            .read_through(ViewKey::donation(donation_id), ctx.views.list_ttl(), || {
                ctx.load_donation(donation_id)
            })
            .await
    }

    pub async fn list(&self, filter: &DonationFilter, page: Page) -> Result<Vec<DonationDoc>> {
        let store = &self.ctx.store;
        self.ctx
            .views
            .read_through(
                ViewKey::donation_list(filter, page),
                self.ctx.views.list_ttl(),
                || store.list_donations(filter, page),
            )
            .await
    }

    /// `available -> matched`, held for one recipient
    pub async fn reserve(
        &self,
        donation_id: &str,
        donor_id: &str,
        recipient_id: &str,
    ) -> Result<DonationDoc> {
        let donation = self.owned_by(donation_id, donor_id).await?;
        if recipient_id == donor_id {
            return Err(HandoffError::SelfClaim {
                donation_id: donation_id.to_string(),
            });
        }

        let change = DonationTransition::new(&[DonationStatus::Available], DonationStatus::Matched)
            .reservation(Reservation::Set(recipient_id.to_string()));
        if !self.ctx.store.transition_donation(donation_id, &change).await? {
            return Err(self.refused(&donation, DonationStatus::Matched).await);
        }

        self.ctx
            .views
            .invalidate(&affected::donation(donation_id))
            .await;
        info!(donation_id, recipient_id, "Donation reserved");

        self.ctx
            .notifier
            .emit_best_effort(Notice::new(
                recipient_id,
                "A donation was set aside for you",
                format!("\"{}\" is reserved for you to claim", donation.title),
                NotificationEvent::DonationReserved {
                    donation_id: donation_id.to_string(),
                    donor_id: donor_id.to_string(),
                },
            ))
            .await;

        self.ctx.load_donation(donation_id).await
    }

    /// `matched -> available`
    pub async fn release(&self, donation_id: &str, donor_id: &str) -> Result<DonationDoc> {
        let donation = self.owned_by(donation_id, donor_id).await?;
        let change = DonationTransition::new(&[DonationStatus::Matched], DonationStatus::Available)
            .reservation(Reservation::Clear);
        if !self.ctx.store.transition_donation(donation_id, &change).await? {
            return Err(self.refused(&donation, DonationStatus::Available).await);
        }

        self.ctx
            .views
            .invalidate(&affected::donation(donation_id))
            .await;
        info!(donation_id, "Reservation released");
        self.ctx.load_donation(donation_id).await
    }

    /// Donor takes an unclaimed donation off the board
    pub async fn withdraw(&self, donation_id: &str, donor_id: &str) -> Result<DonationDoc> {
        let donation = self.owned_by(donation_id, donor_id).await?;
        let change = DonationTransition::new(
            &[DonationStatus::Available, DonationStatus::Matched],
            DonationStatus::Cancelled,
        )
        .reservation(Reservation::Clear);
        if !self.ctx.store.transition_donation(donation_id, &change).await? {
            return Err(self.refused(&donation, DonationStatus::Cancelled).await);
        }

        self.ctx
            .views
            .invalidate(&affected::donation(donation_id))
            .await;
        info!(donation_id, "Donation withdrawn");
        self.ctx.load_donation(donation_id).await
    }

    /// Expire every unclaimed donation past its deadline
    pub async fn expire(&self, now: DateTime<Utc>) -> Result<ExpiryReport> {
        let candidates = self.ctx.store.list_expirable_donations(now).await?;
        let mut report = ExpiryReport::default();

        for donation in candidates {
            let mut change = DonationTransition::new(
                &[DonationStatus::Available, DonationStatus::Matched],
                DonationStatus::Expired,
            )
            .reservation(Reservation::Clear);
            change.at = now;

            if !self.ctx.store.transition_donation(&donation.id, &change).await? {
                warn!(donation_id = %donation.id, "Donation changed before it could expire");
                report.skipped += 1;
                continue;
            }

            self.ctx
                .views
                .invalidate(&affected::donation(&donation.id))
                .await;
            self.ctx
                .notifier
                .emit_best_effort(Notice::new(
                    &donation.donor_id,
                    "Donation expired",
                    format!("\"{}\" passed its availability date unclaimed", donation.title),
                    NotificationEvent::DonationExpired {
                        donation_id: donation.id.clone(),
                        previous: donation.status,
                    },
                ))
                .await;
            report.expired.push(donation.id);
        }

        info!(expired = report.expired.len(), skipped = report.skipped, "Expiry sweep finished");
        Ok(report)
    }

    async fn owned_by(&self, donation_id: &str, donor_id: &str) -> Result<DonationDoc> {
        let donation = self.ctx.load_donation(donation_id).await?;
        if donation.donor_id != donor_id {
            return Err(HandoffError::Forbidden(format!(
                "only the donor may change donation {}",
                donation_id
            )));
        }
        Ok(donation)
    }

    /// Error for a donation transition whose guard did not hold
    async fn refused(&self, before: &DonationDoc, to: DonationStatus) -> HandoffError {
        let current = match self.ctx.store.get_donation(&before.id).await {
            Ok(Some(d)) => d.status,
            _ => before.status,
        };
        HandoffError::InvalidTransition {
            entity: "donation",
            from: current.to_string(),
            to: to.to_string(),
        }
    }
}
