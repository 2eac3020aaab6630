//! Integration tests for the confirmation protocol
//!
//! handoff recorded -> recipient confirms receipt -> donor signs off.

mod common;

use common::*;
use handoff::db::schemas::{
    ActionRequired, ClaimStatus, DeliveryMode, DeliveryStatus, DirectDeliveryStatus,
    DonationStatus,
};
use handoff::services::Handoff;
use handoff::store::{FulfillmentStore, MemoryStore, Page};
use handoff::HandoffError;

/// Claim, assign and run a volunteer delivery to `delivered`
async fn delivered_by_volunteer(handoff: &Handoff) -> (String, String, String) {
    let (donation, claim) = claimed(handoff, DeliveryMode::Volunteer).await;
    let delivery = delivery_for(handoff, &claim).await;
    handoff.assign_volunteer(&delivery.id, VOLUNTEER).await.unwrap();
    for step in [
        DeliveryStatus::Accepted,
        DeliveryStatus::PickedUp,
        DeliveryStatus::InTransit,
        DeliveryStatus::Delivered,
    ] {
        handoff
            .advance_delivery_status(&delivery.id, VOLUNTEER, step)
            .await
            .unwrap();
    }
    (donation.id, claim.id, delivery.id)
}

async fn pending_actions(store: &MemoryStore, user_id: &str) -> Vec<ActionRequired> {
    store
        .list_notifications(user_id, Page::new(100, 0))
        .await
        .unwrap()
        .into_iter()
        .filter(|n| !n.read)
        .filter_map(|n| n.action_required)
        .collect()
}

// =============================================================================
// Ordering
// =============================================================================

#[tokio::test]
async fn test_receipt_before_handoff_is_premature() {
    let s = stack();
    let (_, claim) = claimed(&s.handoff, DeliveryMode::Volunteer).await;

    let err = s.handoff.confirm_receipt(&claim.id, RECIPIENT).await.unwrap_err();
    assert!(matches!(err, HandoffError::PrematureConfirmation { .. }));

    let claim = s.handoff.get_claim(&claim.id, RECIPIENT).await.unwrap();
    assert!(claim.receipt_confirmed_at.is_none());
}

#[tokio::test]
async fn test_donor_confirm_before_receipt_is_premature() {
    let s = stack();
    let (donation_id, claim_id, delivery_id) = delivered_by_volunteer(&s.handoff).await;

    let err = s
        .handoff
        .confirm_donor_delivery(&delivery_id, DONOR)
        .await
        .unwrap_err();
    match err {
        HandoffError::PrematureConfirmation { missing, .. } => {
            assert_eq!(missing, "recipient receipt")
        }
        other => panic!("expected PrematureConfirmation, got {other:?}"),
    }

    let claim = s.handoff.get_claim(&claim_id, DONOR).await.unwrap();
    assert_eq!(claim.status, ClaimStatus::Claimed);
    assert_eq!(
        s.handoff.get_donation(&donation_id).await.unwrap().status,
        DonationStatus::Delivered
    );
}

#[tokio::test]
async fn test_only_recipient_confirms_receipt() {
    let s = stack();
    let (_, claim_id, _) = delivered_by_volunteer(&s.handoff).await;

    for actor in [DONOR, VOLUNTEER] {
        let err = s.handoff.confirm_receipt(&claim_id, actor).await.unwrap_err();
        assert!(matches!(err, HandoffError::Forbidden(_)));
    }
}

#[tokio::test]
async fn test_only_donor_gives_final_confirmation() {
    let s = stack();
    let (_, claim_id, delivery_id) = delivered_by_volunteer(&s.handoff).await;
    s.handoff.confirm_receipt(&claim_id, RECIPIENT).await.unwrap();

    for actor in [RECIPIENT, VOLUNTEER] {
        let err = s
            .handoff
            .confirm_donor_delivery(&delivery_id, actor)
            .await
            .unwrap_err();
        assert!(matches!(err, HandoffError::Forbidden(_)));
    }
}

// =============================================================================
// Full volunteer flow
// =============================================================================

/// Scenario A end to end: both confirmations complete claim and donation
#[tokio::test]
async fn test_volunteer_flow_completes() {
    let s = stack();
    let (donation_id, claim_id, delivery_id) = delivered_by_volunteer(&s.handoff).await;
    assert_eq!(
        pending_actions(&s.store, RECIPIENT).await,
        vec![ActionRequired::ConfirmReceipt]
    );

    let ack = s.handoff.confirm_receipt(&claim_id, RECIPIENT).await.unwrap();
    assert!(ack.newly_confirmed);
    assert!(pending_actions(&s.store, RECIPIENT).await.is_empty());
    assert_eq!(
        pending_actions(&s.store, DONOR).await,
        vec![ActionRequired::DonorFinalConfirmation]
    );

    let donation = s
        .handoff
        .confirm_donor_delivery(&delivery_id, DONOR)
        .await
        .unwrap();
    assert_eq!(donation.id, donation_id);
    assert_eq!(donation.status, DonationStatus::Completed);
    assert!(donation.completed_at.is_some());

    let claim = s.handoff.get_claim(&claim_id, DONOR).await.unwrap();
    assert_eq!(claim.status, ClaimStatus::Completed);
    assert!(claim.donor_confirmed_at.is_some());
    assert!(pending_actions(&s.store, DONOR).await.is_empty());

    assert_eq!(kinds(&s.store, RECIPIENT).await[0], "donation_completed");
    assert_eq!(kinds(&s.store, VOLUNTEER).await[0], "donation_completed");

    let view = s.handoff.get_tracking(&claim_id, VOLUNTEER).await.unwrap();
    assert_eq!(view.claim.status, ClaimStatus::Completed);
    assert_eq!(view.donation.status, DonationStatus::Completed);
}

#[tokio::test]
async fn test_repeated_receipt_is_a_noop() {
    let s = stack();
    let (_, claim_id, _) = delivered_by_volunteer(&s.handoff).await;

    let first = s.handoff.confirm_receipt(&claim_id, RECIPIENT).await.unwrap();
    let second = s.handoff.confirm_receipt(&claim_id, RECIPIENT).await.unwrap();
    assert!(first.newly_confirmed);
    assert!(!second.newly_confirmed);
    assert_eq!(first.receipt_confirmed_at, second.receipt_confirmed_at);

    let sent = count_kind(&s.store, DONOR, &claim_id, "receipt_confirmed").await;
    assert_eq!(sent, 1);
}

/// Concurrent receipts write once and notify the donor once
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_receipts_notify_donor_once() {
    let s = stack();
    let (_, claim_id, _) = delivered_by_volunteer(&s.handoff).await;

    let mut handles = Vec::new();
    for _ in 0..8 {
        let handoff = s.handoff.clone();
        let claim_id = claim_id.clone();
        handles.push(tokio::spawn(async move {
            handoff.confirm_receipt(&claim_id, RECIPIENT).await
        }));
    }

    let mut newly = 0;
    let mut stamps = Vec::new();
    for handle in handles {
        let ack = handle.await.unwrap().unwrap();
        if ack.newly_confirmed {
            newly += 1;
        }
        stamps.push(ack.receipt_confirmed_at);
    }
    assert_eq!(newly, 1);
    stamps.dedup();
    assert_eq!(stamps.len(), 1);

    let sent = count_kind(&s.store, DONOR, &claim_id, "receipt_confirmed").await;
    assert_eq!(sent, 1);
}

#[tokio::test]
async fn test_repeated_donor_confirmation_returns_completed_donation() {
    let s = stack();
    let (_, claim_id, delivery_id) = delivered_by_volunteer(&s.handoff).await;
    s.handoff.confirm_receipt(&claim_id, RECIPIENT).await.unwrap();
    s.handoff
        .confirm_donor_delivery(&delivery_id, DONOR)
        .await
        .unwrap();

    let again = s
        .handoff
        .confirm_donor_delivery(&delivery_id, DONOR)
        .await
        .unwrap();
    assert_eq!(again.status, DonationStatus::Completed);

    let completions = count_kind(&s.store, RECIPIENT, &claim_id, "donation_completed").await;
    assert_eq!(completions, 1);
}

// =============================================================================
// Other modes
// =============================================================================

#[tokio::test]
async fn test_pickup_flow_completes() {
    let s = stack();
    let (donation, claim) = claimed(&s.handoff, DeliveryMode::Pickup).await;

    let err = s
        .handoff
        .confirm_donor_pickup(&claim.id, DONOR)
        .await
        .unwrap_err();
    match err {
        HandoffError::PrematureConfirmation { missing, .. } => assert_eq!(missing, "handoff"),
        other => panic!("expected PrematureConfirmation, got {other:?}"),
    }

    s.handoff.mark_pickup_collected(&claim.id, RECIPIENT).await.unwrap();
    s.handoff.confirm_receipt(&claim.id, RECIPIENT).await.unwrap();
    let done = s.handoff.confirm_donor_pickup(&claim.id, DONOR).await.unwrap();

    assert_eq!(done.id, donation.id);
    assert_eq!(done.status, DonationStatus::Completed);
}

#[tokio::test]
async fn test_direct_flow_completes() {
    let s = stack();
    let (donation, claim) = claimed(&s.handoff, DeliveryMode::Direct).await;
    let direct = direct_for(&s.handoff, &claim).await;

    for status in [
        DirectDeliveryStatus::Scheduled,
        DirectDeliveryStatus::OutForDelivery,
    ] {
        s.handoff
            .mark_direct_delivery_status(&direct.id, DONOR, status, None, None)
            .await
            .unwrap();
    }
    let err = s.handoff.confirm_receipt(&claim.id, RECIPIENT).await.unwrap_err();
    assert!(matches!(err, HandoffError::PrematureConfirmation { .. }));

    s.handoff
        .mark_direct_delivery_status(&direct.id, DONOR, DirectDeliveryStatus::Delivered, None, None)
        .await
        .unwrap();
    s.handoff.confirm_receipt(&claim.id, RECIPIENT).await.unwrap();
    let done = s
        .handoff
        .confirm_donor_direct_delivery(&direct.id, DONOR)
        .await
        .unwrap();

    assert_eq!(done.id, donation.id);
    assert_eq!(done.status, DonationStatus::Completed);
    assert_eq!(kinds(&s.store, RECIPIENT).await[0], "donation_completed");
}

#[tokio::test]
async fn test_confirm_on_cancelled_claim_is_invalid_transition() {
    let s = stack();
    let (_, claim) = claimed(&s.handoff, DeliveryMode::Pickup).await;
    s.handoff.cancel_pickup_claim(&claim.id, DONOR).await.unwrap();

    let err = s.handoff.confirm_receipt(&claim.id, RECIPIENT).await.unwrap_err();
    assert!(matches!(err, HandoffError::InvalidTransition { .. }));

    let err = s
        .handoff
        .confirm_donor_pickup(&claim.id, DONOR)
        .await
        .unwrap_err();
    assert!(matches!(err, HandoffError::InvalidTransition { .. }));
}
