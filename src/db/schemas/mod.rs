//! Database schemas for Handoff
//!
//! Defines MongoDB document structures for donations, claims, deliveries,
//! direct deliveries and notifications.

mod claim;
mod delivery;
mod direct_delivery;
mod donation;
mod metadata;
mod notification;

pub use claim::{ClaimDoc, ClaimStatus, CLAIM_COLLECTION};
pub use delivery::{DeliveryDoc, DeliveryStatus, DELIVERY_COLLECTION};
pub use direct_delivery::{
    DirectDeliveryDoc, DirectDeliveryStatus, DirectDeliveryUpdate, DIRECT_DELIVERY_COLLECTION,
};
pub use donation::{
    DeliveryMode, Destination, DonationDoc, DonationStatus, ItemCondition, NewDonation,
    DONATION_COLLECTION,
};
pub use metadata::Metadata;
pub use notification::{ActionRequired, NotificationDoc, NotificationEvent, NOTIFICATION_COLLECTION};
