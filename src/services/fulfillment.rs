//! Fulfillment record
//!
//! One interface over the three delivery modes. The claim row tracks a
//! self-pickup directly; volunteer and direct modes each have their own
//! record. The confirmation protocol only talks to [`Fulfillment`].

use serde::{Deserialize, Serialize};

use super::Context;
use crate::db::schemas::{
    ClaimDoc, DeliveryDoc, DeliveryMode, DeliveryStatus, DirectDeliveryDoc, DirectDeliveryStatus,
    DonationDoc,
};
use crate::types::{HandoffError, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", content = "record", rename_all = "snake_case")]
pub enum Fulfillment {
    Pickup(ClaimDoc),
    Volunteer(DeliveryDoc),
    Direct(DirectDeliveryDoc),
}

impl Fulfillment {
    /// Load the record matching the claim's delivery mode
    pub async fn for_claim(ctx: &Context, claim: &ClaimDoc) -> Result<Self> {
        match claim.delivery_mode {
            DeliveryMode::Pickup => Ok(Self::Pickup(claim.clone())),
            DeliveryMode::Volunteer => ctx
                .store
                .get_delivery_for_claim(&claim.id)
                .await?
                .map(Self::Volunteer)
                .ok_or_else(|| {
                    HandoffError::Internal(format!("claim {} has no delivery record", claim.id))
                }),
            DeliveryMode::Direct => ctx
                .store
                .get_direct_delivery_for_claim(&claim.id)
                .await?
                .map(Self::Direct)
                .ok_or_else(|| {
                    HandoffError::Internal(format!(
                        "claim {} has no direct delivery record",
                        claim.id
                    ))
                }),
        }
    }

    pub fn mode(&self) -> DeliveryMode {
        match self {
            Self::Pickup(_) => DeliveryMode::Pickup,
            Self::Volunteer(_) => DeliveryMode::Volunteer,
            Self::Direct(_) => DeliveryMode::Direct,
        }
    }

    /// Id of the record itself (the claim id in pickup mode)
    pub fn record_id(&self) -> &str {
        match self {
            Self::Pickup(c) => &c.id,
            Self::Volunteer(d) => &d.id,
            Self::Direct(d) => &d.id,
        }
    }

    pub fn claim_id(&self) -> &str {
        match self {
            Self::Pickup(c) => &c.id,
            Self::Volunteer(d) => &d.claim_id,
            Self::Direct(d) => &d.claim_id,
        }
    }

    pub fn donation_id(&self) -> &str {
        match self {
            Self::Pickup(c) => &c.donation_id,
            Self::Volunteer(d) => &d.donation_id,
            Self::Direct(d) => &d.donation_id,
        }
    }

    pub fn donor_id(&self) -> &str {
        match self {
            Self::Pickup(c) => &c.donor_id,
            Self::Volunteer(d) => &d.donor_id,
            Self::Direct(d) => &d.donor_id,
        }
    }

    pub fn recipient_id(&self) -> &str {
        match self {
            Self::Pickup(c) => &c.recipient_id,
            Self::Volunteer(d) => &d.recipient_id,
            Self::Direct(d) => &d.recipient_id,
        }
    }

    pub fn volunteer_id(&self) -> Option<&str> {
        match self {
            Self::Volunteer(d) => d.volunteer_id.as_deref(),
            _ => None,
        }
    }

    /// Whether the physically-handling party has recorded the handoff
    pub fn handoff_recorded(&self) -> bool {
        match self {
            Self::Pickup(c) => c.handed_off_at.is_some(),
            Self::Volunteer(d) => d.status == DeliveryStatus::Delivered,
            Self::Direct(d) => d.status == DirectDeliveryStatus::Delivered,
        }
    }

    /// Current status label of the record
    pub fn status(&self) -> String {
        match self {
            Self::Pickup(c) if c.handed_off_at.is_some() => "collected".to_string(),
            Self::Pickup(c) => c.status.to_string(),
            Self::Volunteer(d) => d.status.to_string(),
            Self::Direct(d) => d.status.to_string(),
        }
    }

    /// Donor, recipient, or the bound volunteer
    pub fn involves(&self, user_id: &str) -> bool {
        self.donor_id() == user_id
            || self.recipient_id() == user_id
            || self.volunteer_id() == Some(user_id)
    }
}

/// Everything a party needs to follow one claim
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackingView {
    pub donation: DonationDoc,
    pub claim: ClaimDoc,
    pub fulfillment: Fulfillment,
}

impl TrackingView {
    pub async fn load(ctx: &Context, claim_id: &str) -> Result<Self> {
        let claim = ctx.load_claim(claim_id).await?;
        let donation = ctx.load_donation(&claim.donation_id).await?;
        let fulfillment = Fulfillment::for_claim(ctx, &claim).await?;
        Ok(Self {
            donation,
            claim,
            fulfillment,
        })
    }

    pub fn visible_to(&self, user_id: &str) -> bool {
        self.claim.involves(user_id) || self.fulfillment.involves(user_id)
    }
}
