//! Integration tests for the three fulfillment modes
//!
//! Volunteer deliveries move strictly forward one step at a time, direct
//! deliveries follow the donor, pickups are recorded by the recipient.

mod common;

use std::sync::Arc;

use common::*;
use handoff::db::schemas::{
    ClaimStatus, DeliveryMode, DeliveryStatus, DirectDeliveryStatus, DonationStatus,
};
use handoff::services::Fulfillment;
use handoff::store::{FulfillmentStore, Page};
use handoff::HandoffError;

const VOLUNTEER_STEPS: [DeliveryStatus; 4] = [
    DeliveryStatus::Accepted,
    DeliveryStatus::PickedUp,
    DeliveryStatus::InTransit,
    DeliveryStatus::Delivered,
];

// =============================================================================
// Volunteer mode
// =============================================================================

#[tokio::test]
async fn test_volunteer_delivery_runs_forward_to_delivered() {
    let s = stack();
    let (donation, claim) = claimed(&s.handoff, DeliveryMode::Volunteer).await;
    let delivery = delivery_for(&s.handoff, &claim).await;

    let assigned = s.handoff.assign_volunteer(&delivery.id, VOLUNTEER).await.unwrap();
    assert_eq!(assigned.status, DeliveryStatus::Assigned);
    assert_eq!(assigned.volunteer_id.as_deref(), Some(VOLUNTEER));
    assert!(s.handoff.list_open_tasks(Page::default()).await.unwrap().is_empty());
    assert_eq!(s.handoff.list_volunteer_tasks(VOLUNTEER).await.unwrap().len(), 1);

    for step in VOLUNTEER_STEPS {
        let d = s
            .handoff
            .advance_delivery_status(&delivery.id, VOLUNTEER, step)
            .await
            .unwrap();
        assert_eq!(d.status, step);
    }

    let d = s.handoff.context().load_delivery(&delivery.id).await.unwrap();
    assert!(d.accepted_at.is_some() && d.picked_up_at.is_some());
    assert!(d.in_transit_at.is_some() && d.delivered_at.is_some());

    let after = s.handoff.get_donation(&donation.id).await.unwrap();
    assert_eq!(after.status, DonationStatus::Delivered);

    // Delivered tasks leave the volunteer's list
    assert!(s.handoff.list_volunteer_tasks(VOLUNTEER).await.unwrap().is_empty());

    let recipient = kinds(&s.store, RECIPIENT).await;
    assert_eq!(recipient[0], "handoff_recorded");
    assert!(recipient.contains(&"volunteer_assigned"));
}

/// Skipping ahead from `assigned` is refused with the current status
#[tokio::test]
async fn test_skipping_a_step_is_invalid_transition() {
    let s = stack();
    let (donation, claim) = claimed(&s.handoff, DeliveryMode::Volunteer).await;
    let delivery = delivery_for(&s.handoff, &claim).await;
    s.handoff.assign_volunteer(&delivery.id, VOLUNTEER).await.unwrap();

    for (target, name) in [
        (DeliveryStatus::InTransit, "in_transit"),
        (DeliveryStatus::PickedUp, "picked_up"),
        (DeliveryStatus::Delivered, "delivered"),
    ] {
        let err = s
            .handoff
            .advance_delivery_status(&delivery.id, VOLUNTEER, target)
            .await
            .unwrap_err();
        match err {
            HandoffError::InvalidTransition { from, to, .. } => {
                assert_eq!(from, "assigned");
                assert_eq!(to, name);
            }
            other => panic!("expected InvalidTransition, got {other:?}"),
        }
    }

    // Nothing moved
    let d = s.handoff.context().load_delivery(&delivery.id).await.unwrap();
    assert_eq!(d.status, DeliveryStatus::Assigned);
    assert!(d.in_transit_at.is_none());
    assert_eq!(
        s.handoff.get_donation(&donation.id).await.unwrap().status,
        DonationStatus::Claimed
    );
}

#[tokio::test]
async fn test_going_backwards_is_invalid_transition() {
    let s = stack();
    let (_, claim) = claimed(&s.handoff, DeliveryMode::Volunteer).await;
    let delivery = delivery_for(&s.handoff, &claim).await;
    s.handoff.assign_volunteer(&delivery.id, VOLUNTEER).await.unwrap();
    for step in &VOLUNTEER_STEPS[..2] {
        s.handoff
            .advance_delivery_status(&delivery.id, VOLUNTEER, *step)
            .await
            .unwrap();
    }

    let err = s
        .handoff
        .advance_delivery_status(&delivery.id, VOLUNTEER, DeliveryStatus::Accepted)
        .await
        .unwrap_err();
    assert!(matches!(err, HandoffError::InvalidTransition { .. }));
}

#[tokio::test]
async fn test_only_bound_volunteer_advances() {
    let s = stack();
    let (_, claim) = claimed(&s.handoff, DeliveryMode::Volunteer).await;
    let delivery = delivery_for(&s.handoff, &claim).await;
    s.handoff.assign_volunteer(&delivery.id, VOLUNTEER).await.unwrap();

    for actor in ["volunteer-2", DONOR, RECIPIENT] {
        let err = s
            .handoff
            .advance_delivery_status(&delivery.id, actor, DeliveryStatus::Accepted)
            .await
            .unwrap_err();
        assert!(matches!(err, HandoffError::Forbidden(_)), "actor {actor}");
    }
}

#[tokio::test]
async fn test_second_volunteer_gets_already_assigned() {
    let s = stack();
    let (_, claim) = claimed(&s.handoff, DeliveryMode::Volunteer).await;
    let delivery = delivery_for(&s.handoff, &claim).await;
    s.handoff.assign_volunteer(&delivery.id, VOLUNTEER).await.unwrap();

    let err = s
        .handoff
        .assign_volunteer(&delivery.id, "volunteer-2")
        .await
        .unwrap_err();
    match err {
        HandoffError::AlreadyAssigned { volunteer_id, .. } => assert_eq!(volunteer_id, VOLUNTEER),
        other => panic!("expected AlreadyAssigned, got {other:?}"),
    }

    // Repeating the assignment is harmless
    let again = s.handoff.assign_volunteer(&delivery.id, VOLUNTEER).await.unwrap();
    assert_eq!(again.status, DeliveryStatus::Assigned);
}

#[tokio::test]
async fn test_parties_cannot_volunteer_for_own_delivery() {
    let s = stack();
    let (_, claim) = claimed(&s.handoff, DeliveryMode::Volunteer).await;
    let delivery = delivery_for(&s.handoff, &claim).await;

    for actor in [DONOR, RECIPIENT] {
        let err = s.handoff.assign_volunteer(&delivery.id, actor).await.unwrap_err();
        assert!(matches!(err, HandoffError::Forbidden(_)));
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_assignment_single_volunteer() {
    let s = stack();
    let (_, claim) = claimed(&s.handoff, DeliveryMode::Volunteer).await;
    let delivery = delivery_for(&s.handoff, &claim).await;

    let mut handles = Vec::new();
    for i in 0..8 {
        let handoff = s.handoff.clone();
        let delivery_id = delivery.id.clone();
        handles.push(tokio::spawn(async move {
            handoff
                .assign_volunteer(&delivery_id, &format!("volunteer-{i}"))
                .await
        }));
    }

    let mut winners = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => winners += 1,
            Err(HandoffError::AlreadyAssigned { .. }) => {}
            Err(other) => panic!("unexpected error {other:?}"),
        }
    }
    assert_eq!(winners, 1);
}

// =============================================================================
// Direct mode
// =============================================================================

#[tokio::test]
async fn test_direct_delivery_follows_donor() {
    let s = stack();
    let (donation, claim) = claimed(&s.handoff, DeliveryMode::Direct).await;
    let direct = direct_for(&s.handoff, &claim).await;
    assert_eq!(direct.status, DirectDeliveryStatus::CoordinationNeeded);

    let when = chrono::Utc::now() + chrono::Duration::days(1);
    let scheduled = s
        .handoff
        .mark_direct_delivery_status(
            &direct.id,
            DONOR,
            DirectDeliveryStatus::Scheduled,
            Some(when),
            None,
        )
        .await
        .unwrap();
    assert_eq!(scheduled.scheduled_for, Some(when));

    s.handoff
        .mark_direct_delivery_status(&direct.id, DONOR, DirectDeliveryStatus::OutForDelivery, None, None)
        .await
        .unwrap();
    assert_eq!(
        s.handoff.get_donation(&donation.id).await.unwrap().status,
        DonationStatus::InTransit
    );

    let delivered = s
        .handoff
        .mark_direct_delivery_status(&direct.id, DONOR, DirectDeliveryStatus::Delivered, None, None)
        .await
        .unwrap();
    assert!(delivered.delivered_at.is_some());
    assert_eq!(
        s.handoff.get_donation(&donation.id).await.unwrap().status,
        DonationStatus::Delivered
    );
    assert_eq!(kinds(&s.store, RECIPIENT).await[0], "handoff_recorded");
}

#[tokio::test]
async fn test_only_donor_drives_direct_delivery() {
    let s = stack();
    let (_, claim) = claimed(&s.handoff, DeliveryMode::Direct).await;
    let direct = direct_for(&s.handoff, &claim).await;

    let err = s
        .handoff
        .mark_direct_delivery_status(&direct.id, RECIPIENT, DirectDeliveryStatus::Scheduled, None, None)
        .await
        .unwrap_err();
    assert!(matches!(err, HandoffError::Forbidden(_)));
}

#[tokio::test]
async fn test_direct_delivery_cannot_skip_to_delivered_from_cancelled() {
    let s = stack();
    let (_, claim) = claimed(&s.handoff, DeliveryMode::Direct).await;
    let direct = direct_for(&s.handoff, &claim).await;

    s.handoff
        .mark_direct_delivery_status(
            &direct.id,
            DONOR,
            DirectDeliveryStatus::Cancelled,
            None,
            Some("car broke down".into()),
        )
        .await
        .unwrap();

    let err = s
        .handoff
        .mark_direct_delivery_status(&direct.id, DONOR, DirectDeliveryStatus::Delivered, None, None)
        .await
        .unwrap_err();
    match err {
        HandoffError::InvalidTransition { from, .. } => assert_eq!(from, "cancelled"),
        other => panic!("expected InvalidTransition, got {other:?}"),
    }
}

/// Cancelling a direct delivery releases the claim and reopens the donation
#[tokio::test]
async fn test_direct_cancel_reopens_donation() {
    let s = stack();
    let (donation, claim) = claimed(&s.handoff, DeliveryMode::Direct).await;
    let direct = direct_for(&s.handoff, &claim).await;

    let cancelled = s
        .handoff
        .mark_direct_delivery_status(
            &direct.id,
            DONOR,
            DirectDeliveryStatus::Cancelled,
            None,
            Some("moved away".into()),
        )
        .await
        .unwrap();
    assert_eq!(cancelled.cancel_reason.as_deref(), Some("moved away"));

    let claim = s.handoff.get_claim(&claim.id, RECIPIENT).await.unwrap();
    assert_eq!(claim.status, ClaimStatus::Cancelled);
    assert_eq!(
        s.handoff.get_donation(&donation.id).await.unwrap().status,
        DonationStatus::Available
    );
    assert!(kinds(&s.store, RECIPIENT).await.contains(&"claim_cancelled"));

    // Someone else may claim it now
    s.handoff
        .create_claim(&donation.id, "recipient-2", 1)
        .await
        .unwrap();
}

// =============================================================================
// Pickup mode
// =============================================================================

#[tokio::test]
async fn test_pickup_collected_moves_donation_to_delivered() {
    let s = stack();
    let (donation, claim) = claimed(&s.handoff, DeliveryMode::Pickup).await;

    let err = s
        .handoff
        .mark_pickup_collected(&claim.id, DONOR)
        .await
        .unwrap_err();
    assert!(matches!(err, HandoffError::Forbidden(_)));

    let collected = s.handoff.mark_pickup_collected(&claim.id, RECIPIENT).await.unwrap();
    assert!(collected.handed_off_at.is_some());
    assert_eq!(
        s.handoff.get_donation(&donation.id).await.unwrap().status,
        DonationStatus::Delivered
    );

    // Recording twice is harmless and does not notify again
    s.handoff.mark_pickup_collected(&claim.id, RECIPIENT).await.unwrap();
    let handoffs = kinds(&s.store, RECIPIENT)
        .await
        .into_iter()
        .filter(|k| *k == "handoff_recorded")
        .count();
    assert_eq!(handoffs, 1);
}

#[tokio::test]
async fn test_pickup_cancel_before_handoff_reopens_donation() {
    let s = stack();
    let (donation, claim) = claimed(&s.handoff, DeliveryMode::Pickup).await;

    let err = s.handoff.cancel_pickup_claim(&claim.id, "stranger").await.unwrap_err();
    assert!(matches!(err, HandoffError::Forbidden(_)));

    let cancelled = s.handoff.cancel_pickup_claim(&claim.id, RECIPIENT).await.unwrap();
    assert_eq!(cancelled.status, ClaimStatus::Cancelled);
    assert_eq!(
        s.handoff.get_donation(&donation.id).await.unwrap().status,
        DonationStatus::Available
    );
    assert!(kinds(&s.store, DONOR).await.contains(&"claim_cancelled"));
}

#[tokio::test]
async fn test_pickup_cancel_after_handoff_is_refused() {
    let s = stack();
    let (_, claim) = claimed(&s.handoff, DeliveryMode::Pickup).await;
    s.handoff.mark_pickup_collected(&claim.id, RECIPIENT).await.unwrap();

    let err = s.handoff.cancel_pickup_claim(&claim.id, DONOR).await.unwrap_err();
    assert!(matches!(err, HandoffError::InvalidTransition { .. }));
}

#[tokio::test]
async fn test_pickup_operations_reject_other_modes() {
    let s = stack();
    let (_, claim) = claimed(&s.handoff, DeliveryMode::Volunteer).await;

    let err = s
        .handoff
        .mark_pickup_collected(&claim.id, RECIPIENT)
        .await
        .unwrap_err();
    assert!(matches!(err, HandoffError::BadRequest(_)));
}

// =============================================================================
// Tracking
// =============================================================================

#[tokio::test]
async fn test_tracking_visible_to_parties_only() {
    let s = stack();
    let (donation, claim) = claimed(&s.handoff, DeliveryMode::Volunteer).await;
    let delivery = delivery_for(&s.handoff, &claim).await;

    let err = s.handoff.get_tracking(&claim.id, VOLUNTEER).await.unwrap_err();
    assert!(matches!(err, HandoffError::Forbidden(_)));

    s.handoff.assign_volunteer(&delivery.id, VOLUNTEER).await.unwrap();

    for actor in [DONOR, RECIPIENT, VOLUNTEER] {
        let view = s.handoff.get_tracking(&claim.id, actor).await.unwrap();
        assert_eq!(view.donation.id, donation.id);
        match &view.fulfillment {
            Fulfillment::Volunteer(d) => assert_eq!(d.status, DeliveryStatus::Assigned),
            other => panic!("expected volunteer record, got {other:?}"),
        }
    }

    let err = s.handoff.get_tracking(&claim.id, "stranger").await.unwrap_err();
    assert!(matches!(err, HandoffError::Forbidden(_)));
}

#[tokio::test]
async fn test_claim_read_is_limited_to_parties() {
    let s = stack();
    let (_, claim) = claimed(&s.handoff, DeliveryMode::Pickup).await;

    assert!(s.handoff.get_claim(&claim.id, DONOR).await.is_ok());
    assert!(matches!(
        s.handoff.get_claim(&claim.id, "stranger").await,
        Err(HandoffError::Forbidden(_))
    ));

    let mine = s
        .handoff
        .list_my_claims(RECIPIENT, Page::default())
        .await
        .unwrap();
    assert_eq!(mine.len(), 1);
}

/// A cancel whose claim write failed leaves the row cancelled; cancelling
/// again finishes releasing the claim
#[tokio::test]
async fn test_interrupted_direct_cancel_can_be_finished() {
    let store = Arc::new(FlakyStore::default());
    let handoff = stack_on(store.clone());
    let (donation, claim) = claimed(&handoff, DeliveryMode::Direct).await;
    let direct = direct_for(&handoff, &claim).await;

    store.fail_claims(true);
    let err = handoff
        .mark_direct_delivery_status(&direct.id, DONOR, DirectDeliveryStatus::Cancelled, None, None)
        .await
        .unwrap_err();
    assert!(matches!(err, HandoffError::Database(_)));
    store.fail_claims(false);

    let stuck = store.inner.get_claim(&claim.id).await.unwrap().unwrap();
    assert_eq!(stuck.status, ClaimStatus::Claimed);

    let finished = handoff
        .mark_direct_delivery_status(&direct.id, DONOR, DirectDeliveryStatus::Cancelled, None, None)
        .await
        .unwrap();
    assert_eq!(finished.status, DirectDeliveryStatus::Cancelled);

    let claim = store.inner.get_claim(&claim.id).await.unwrap().unwrap();
    assert_eq!(claim.status, ClaimStatus::Cancelled);
    assert_eq!(
        handoff.get_donation(&donation.id).await.unwrap().status,
        DonationStatus::Available
    );
    handoff
        .create_claim(&donation.id, "recipient-2", 1)
        .await
        .unwrap();

    // Nothing left to finish
    let err = handoff
        .mark_direct_delivery_status(&direct.id, DONOR, DirectDeliveryStatus::Cancelled, None, None)
        .await
        .unwrap_err();
    assert!(matches!(err, HandoffError::InvalidTransition { .. }));
}

/// The claim was cancelled but the donation never reopened
#[tokio::test]
async fn test_cancel_reopens_donation_left_claimed() {
    let store = Arc::new(FlakyStore::default());
    let handoff = stack_on(store.clone());
    let (donation, claim) = claimed(&handoff, DeliveryMode::Direct).await;
    let direct = direct_for(&handoff, &claim).await;

    store.fail_donations(true);
    handoff
        .mark_direct_delivery_status(&direct.id, DONOR, DirectDeliveryStatus::Cancelled, None, None)
        .await
        .unwrap_err();
    store.fail_donations(false);
    let held = store.inner.get_donation(&donation.id).await.unwrap().unwrap();
    assert_eq!(held.status, DonationStatus::Claimed);

    handoff
        .mark_direct_delivery_status(&direct.id, DONOR, DirectDeliveryStatus::Cancelled, None, None)
        .await
        .unwrap();
    assert_eq!(
        handoff.get_donation(&donation.id).await.unwrap().status,
        DonationStatus::Available
    );
}

#[tokio::test]
async fn test_interrupted_pickup_cancel_can_be_finished() {
    let store = Arc::new(FlakyStore::default());
    let handoff = stack_on(store.clone());
    let (donation, claim) = claimed(&handoff, DeliveryMode::Pickup).await;

    store.fail_donations(true);
    handoff.cancel_pickup_claim(&claim.id, RECIPIENT).await.unwrap_err();
    store.fail_donations(false);

    let again = handoff.cancel_pickup_claim(&claim.id, RECIPIENT).await.unwrap();
    assert_eq!(again.status, ClaimStatus::Cancelled);
    assert_eq!(
        handoff.get_donation(&donation.id).await.unwrap().status,
        DonationStatus::Available
    );
}
