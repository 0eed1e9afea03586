use std::sync::Arc;

use chrono::{Duration, Utc};
use proptest::prelude::*;

use deal_eng::clock::ManualClock;
use deal_eng::ledger::NewOffer;
use deal_eng::model::Listing;
use deal_eng::pipeline::{PipelineError, StageUpdate};
use deal_eng::store::MemoryStore;
use deal_eng::{
    Amount, Config, DealStatus, Desk, DeskError, ListingId, Offer, OfferStatus, Stage, UserId,
};

const LISTING: ListingId = 3;
const SELLER: UserId = 100;
const BUYERS: [UserId; 2] = [1, 2];

#[derive(Debug, Clone)]
enum Op {
    Submit { buyer: usize, major: i64 },
    Withdraw { buyer: usize },
    Counter { buyer: usize, major: i64 },
    Renegotiate { buyer: usize, major: i64 },
    Accept { buyer: usize, by_buyer: bool },
    Reject { buyer: usize },
    Wait { hours: i64 },
}

fn op() -> impl Strategy<Value = Op> {
    let buyer = 0..BUYERS.len();
    let major = -5i64..500;
    prop_oneof![
        (buyer.clone(), major.clone()).prop_map(|(buyer, major)| Op::Submit { buyer, major }),
        buyer.clone().prop_map(|buyer| Op::Withdraw { buyer }),
        (buyer.clone(), major.clone()).prop_map(|(buyer, major)| Op::Counter { buyer, major }),
        (buyer.clone(), major).prop_map(|(buyer, major)| Op::Renegotiate { buyer, major }),
        (buyer.clone(), any::<bool>()).prop_map(|(buyer, by_buyer)| Op::Accept { buyer, by_buyer }),
        buyer.prop_map(|buyer| Op::Reject { buyer }),
        (1i64..30).prop_map(|hours| Op::Wait { hours }),
    ]
}

fn desk(clock: Arc<ManualClock>) -> Desk {
    let config = Config {
        offer_ttl_hours: Some(24),
        ..Config::default()
    };
    let desk = Desk::new(Arc::new(MemoryStore::new()), clock, config);
    desk.register_listing(Listing {
        id: LISTING,
        seller: SELLER,
        title: "Print shop".to_string(),
    })
    .unwrap();
    desk
}

fn latest_offer(desk: &Desk, buyer: UserId) -> Option<Offer> {
    desk.offers_for_listing(LISTING)
        .unwrap()
        .into_iter()
        .filter(|o| o.buyer == buyer)
        .last()
}

/// Apply a transition on the buyer's latest offer.
fn transition(desk: &Desk, op: &Op, offer: &Offer) -> Result<(), DeskError> {
    let id = offer.id;
    match *op {
        Op::Withdraw { buyer } => desk.withdraw_offer(id, BUYERS[buyer]).map(drop),
        Op::Counter { major, .. } => desk
            .counter_offer(id, SELLER, Amount::from_major(major))
            .map(drop),
        Op::Renegotiate { buyer, major } => desk
            .renegotiate_offer(id, BUYERS[buyer], Amount::from_major(major), None)
            .map(drop),
        Op::Accept { buyer, by_buyer } => {
            let actor = if by_buyer { BUYERS[buyer] } else { SELLER };
            desk.accept_offer(id, actor).map(drop)
        }
        Op::Reject { .. } => desk.reject_offer(id, SELLER).map(drop),
        Op::Submit { .. } | Op::Wait { .. } => Ok(()),
    }
}

fn expected_status(stage: Stage) -> DealStatus {
    match stage {
        Stage::OfferMade | Stage::CounterOffer => DealStatus::Negotiation,
        Stage::LoiSigned => DealStatus::Loi,
        Stage::DueDiligence | Stage::FinalReview => DealStatus::Closing,
        Stage::Closed => DealStatus::Completed,
    }
}

proptest! {
    #[test]
    fn offers_keep_their_invariants(ops in prop::collection::vec(op(), 1..60)) {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let desk = desk(clock.clone());

        for op in &ops {
            match *op {
                Op::Submit { buyer, major } => {
                    let _ = desk.submit_offer(NewOffer {
                        listing: LISTING,
                        buyer: BUYERS[buyer],
                        amount: Amount::from_major(major),
                        message: None,
                        expires_at: None,
                    });
                }
                Op::Wait { hours } => clock.advance(Duration::hours(hours)),
                Op::Withdraw { buyer }
                | Op::Counter { buyer, .. }
                | Op::Renegotiate { buyer, .. }
                | Op::Accept { buyer, .. }
                | Op::Reject { buyer } => {
                    let Some(offer) = latest_offer(&desk, BUYERS[buyer]) else {
                        continue;
                    };
                    // Reading settles expiry, so the transition sees a live state.
                    let before = desk.offer(offer.id).unwrap();
                    let result = transition(&desk, op, &before);
                    let after = desk.offer(offer.id).unwrap();

                    match result {
                        Err(_) => prop_assert_eq!(&after, &before),
                        Ok(()) => prop_assert!(
                            before.status.can_become(after.status)
                                || (before.status == OfferStatus::Accepted
                                    && after.status == OfferStatus::Accepted),
                            "{} -> {}", before.status, after.status
                        ),
                    }
                }
            }

            let offers = desk.offers_for_listing(LISTING).unwrap();
            for buyer in BUYERS {
                let active = offers
                    .iter()
                    .filter(|o| o.buyer == buyer && o.status.is_active())
                    .count();
                prop_assert!(active <= 1, "buyer {} has {} active offers", buyer, active);
            }

            let deals = desk.deals().unwrap();
            let accepted: Vec<_> = offers
                .iter()
                .filter(|o| o.status == OfferStatus::Accepted)
                .collect();
            prop_assert_eq!(deals.len(), accepted.len());
            for offer in accepted {
                let deal = desk.deal_for_offer(offer.id).unwrap().unwrap();
                prop_assert_eq!(offer.deal, Some(deal.id));
                prop_assert_eq!(deal.amount, offer.amount);
                prop_assert!(deal.amount.is_positive());
            }
        }
    }

    #[test]
    fn deal_status_follows_stage(stages in prop::collection::vec(0..Stage::ALL.len(), 1..20)) {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let desk = desk(clock);
        let offer = desk
            .submit_offer(NewOffer {
                listing: LISTING,
                buyer: BUYERS[0],
                amount: Amount::from_major(250),
                message: None,
                expires_at: None,
            })
            .unwrap();
        let id = desk.accept_offer(offer.id, SELLER).unwrap();

        let mut applied = 0;
        for idx in stages {
            let before = desk.deal(id).unwrap();
            let result = desk.update_stage(
                id,
                StageUpdate {
                    actor: SELLER,
                    stage: Stage::ALL[idx],
                    amount: None,
                    notes: None,
                },
            );
            let deal = desk.deal(id).unwrap();

            if before.stage == Stage::Closed {
                prop_assert_eq!(result, Err(DeskError::Pipeline(PipelineError::DealClosed(id))));
                prop_assert_eq!(&deal, &before);
            } else {
                prop_assert!(result.is_ok());
                applied += 1;
                prop_assert_eq!(deal.stage, Stage::ALL[idx]);
            }
            prop_assert_eq!(deal.status(), expected_status(deal.stage));
            prop_assert_eq!(deal.history.len(), applied);
            let summary = desk.progress_summary(id).unwrap();
            prop_assert_eq!(summary.status, deal.status());
            prop_assert_eq!(summary.is_terminal, deal.stage == Stage::Closed);
        }
    }
}
