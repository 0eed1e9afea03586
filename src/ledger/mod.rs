//! Offer ledger.
//!
//! Offers move along the graph in [`OfferStatus::allowed_targets`]. Every
//! transition re-reads the offer, checks it, and commits the new state
//! conditioned on the version it read, together with the counterparty notice
//! and (on acceptance) the new deal. Expiry is evaluated lazily whenever an
//! offer is touched.
//!
//! The `offer-slot/{listing}/{buyer}` index always names the newest offer of
//! a (listing, buyer) pair. Submitting rewrites it under a version check, so
//! two submissions cannot both see a free slot.

use std::sync::Arc;

use chrono::Duration;
use tracing::{info, warn};

use crate::Amount;
use crate::clock::Clock;
use crate::inbox::{Inbox, Notice};
use crate::model::{
    DealId, Listing, ListingId, Offer, OfferId, OfferStatus, Timestamp, UserId,
};
use crate::pipeline::Pipeline;
use crate::store::{self, Batch, EntityKind, RecordStore, Versioned};

mod error;
pub use error::{LedgerError, Party};

/// A buyer's submission.
#[derive(Debug, Clone)]
pub struct NewOffer {
    pub listing: ListingId,
    pub buyer: UserId,
    pub amount: Amount,
    pub message: Option<String>,
    pub expires_at: Option<Timestamp>,
}

#[derive(Clone)]
pub struct OfferLedger {
    store: Arc<dyn RecordStore>,
    clock: Arc<dyn Clock>,
    pipeline: Pipeline,
    inbox: Inbox,
    /// Lifetime given to offers submitted without an explicit expiry.
    default_ttl: Option<Duration>,
}

/// Public API
impl OfferLedger {
    pub fn new(
        store: Arc<dyn RecordStore>,
        clock: Arc<dyn Clock>,
        pipeline: Pipeline,
        inbox: Inbox,
    ) -> Self {
        Self {
            store,
            clock,
            pipeline,
            inbox,
            default_ttl: None,
        }
    }

    pub fn with_default_ttl(mut self, ttl: Option<Duration>) -> Self {
        self.default_ttl = ttl;
        self
    }

    /// Store a listing so offers can resolve its seller.
    pub fn register_listing(&self, listing: Listing) -> Result<(), LedgerError> {
        let id = listing.id;
        let mut batch = Batch::new();
        match store::load::<Listing>(self.store.as_ref(), id)? {
            Some(current) => batch.replace(current.version, listing),
            None => batch.create(listing),
        }
        self.store.commit(batch)?;
        info!(listing = id, "listing registered");
        Ok(())
    }

    /// `(none) -> pending`
    pub fn submit(&self, new: NewOffer) -> Result<Offer, LedgerError> {
        if !new.amount.is_positive() {
            return Err(LedgerError::InvalidAmount(new.amount));
        }
        let listing = store::load::<Listing>(self.store.as_ref(), new.listing)?
            .ok_or(LedgerError::ListingNotFound(new.listing))?
            .record;
        if listing.seller == new.buyer {
            return Err(LedgerError::WrongParty {
                actor: new.buyer,
                expected: Party::Buyer,
            });
        }

        let slot_name = slot_index(new.listing, new.buyer);
        let slot = store::load_index(self.store.as_ref(), &slot_name)?;
        if let Some(slot) = &slot {
            let existing = self.load(slot.record.target)?;
            if existing.record.status.is_active() {
                let now = self.clock.now();
                if existing.record.is_expired_at(now) {
                    self.expire(existing, now)?;
                } else {
                    return Err(LedgerError::DuplicateActiveOffer {
                        listing: new.listing,
                        buyer: new.buyer,
                        existing: existing.record.id,
                    });
                }
            }
        }

        let now = self.clock.now();
        let offer = Offer {
            id: self.store.next_id(EntityKind::Offer)?,
            listing: new.listing,
            buyer: new.buyer,
            seller: listing.seller,
            amount: new.amount,
            counter_amount: None,
            message: new.message,
            status: OfferStatus::Pending,
            rounds: 0,
            deal: None,
            created_at: now,
            updated_at: now,
            expires_at: new.expires_at.or(self.default_ttl.map(|ttl| now + ttl)),
        };

        let mut batch = Batch::new();
        batch.set_index(&slot_name, slot.map(|s| s.version), offer.id);
        self.stage_notice(
            &mut batch,
            &offer,
            Party::Buyer,
            format!("New offer of {} on listing {}", offer.amount, offer.listing),
        )?;
        batch.create(offer.clone());
        self.store.commit(batch)?;

        info!(
            offer = offer.id,
            listing = offer.listing,
            buyer = offer.buyer,
            amount = %offer.amount,
            "offer submitted"
        );
        Ok(offer)
    }

    /// `pending -> withdrawn`, buyer only.
    pub fn withdraw(&self, id: OfferId, buyer: UserId) -> Result<Offer, LedgerError> {
        let Versioned {
            version,
            record: mut offer,
        } = self.load_live(id)?;
        ensure_transition(&offer, OfferStatus::Withdrawn)?;
        ensure_party(&offer, buyer, Party::Buyer)?;

        offer.status = OfferStatus::Withdrawn;
        let content = format!("Offer #{id} was withdrawn");
        self.commit_transition(version, offer, Party::Buyer, content)
    }

    /// `pending -> countered`, seller only.
    pub fn counter(
        &self,
        id: OfferId,
        seller: UserId,
        amount: Amount,
    ) -> Result<Offer, LedgerError> {
        if !amount.is_positive() {
            return Err(LedgerError::InvalidAmount(amount));
        }
        let Versioned {
            version,
            record: mut offer,
        } = self.load_live(id)?;
        ensure_transition(&offer, OfferStatus::Countered)?;
        ensure_party(&offer, seller, Party::Seller)?;

        offer.status = OfferStatus::Countered;
        offer.counter_amount = Some(amount);
        offer.rounds += 1;
        let content = format!("Your offer #{id} was countered at {amount}");
        self.commit_transition(version, offer, Party::Seller, content)
    }

    /// `countered -> pending`, buyer only: answer a counter with a new amount.
    pub fn renegotiate(
        &self,
        id: OfferId,
        buyer: UserId,
        amount: Amount,
        message: Option<String>,
    ) -> Result<Offer, LedgerError> {
        if !amount.is_positive() {
            return Err(LedgerError::InvalidAmount(amount));
        }
        let Versioned {
            version,
            record: mut offer,
        } = self.load_live(id)?;
        ensure_transition(&offer, OfferStatus::Pending)?;
        ensure_party(&offer, buyer, Party::Buyer)?;

        offer.status = OfferStatus::Pending;
        offer.amount = amount;
        offer.counter_amount = None;
        if message.is_some() {
            offer.message = message;
        }
        let content = format!("Offer #{id} renegotiated at {amount}");
        self.commit_transition(version, offer, Party::Buyer, content)
    }

    /// `pending|countered -> accepted`, opening a deal.
    ///
    /// The seller accepts a pending offer, the buyer accepts a counter (at
    /// the counter amount). Accepting an accepted offer returns its deal.
    pub fn accept(&self, id: OfferId, actor: UserId) -> Result<DealId, LedgerError> {
        let Versioned {
            version,
            record: mut offer,
        } = self.load_live(id)?;
        if let (OfferStatus::Accepted, Some(deal)) = (offer.status, offer.deal) {
            if actor != offer.buyer {
                ensure_party(&offer, actor, Party::Seller)?;
            }
            info!(offer = id, deal, "offer already accepted");
            return Ok(deal);
        }
        ensure_transition(&offer, OfferStatus::Accepted)?;
        let side = match offer.status {
            OfferStatus::Countered => Party::Buyer,
            _ => Party::Seller,
        };
        ensure_party(&offer, actor, side)?;

        offer.amount = offer.final_amount();
        offer.status = OfferStatus::Accepted;
        offer.updated_at = self.clock.now();

        let mut batch = Batch::new();
        let deal = self.pipeline.create_from_offer(&mut batch, &offer)?;
        offer.deal = Some(deal.id);
        self.stage_notice(
            &mut batch,
            &offer,
            side,
            format!("Offer #{id} was accepted at {}", offer.amount),
        )?;
        batch.replace(version, offer);
        self.store.commit(batch)?;

        info!(offer = id, deal = deal.id, amount = %deal.amount, "offer accepted");
        Ok(deal.id)
    }

    /// `pending|countered -> rejected`, seller only.
    pub fn reject(&self, id: OfferId, seller: UserId) -> Result<Offer, LedgerError> {
        let Versioned {
            version,
            record: mut offer,
        } = self.load_live(id)?;
        ensure_transition(&offer, OfferStatus::Rejected)?;
        ensure_party(&offer, seller, Party::Seller)?;

        offer.status = OfferStatus::Rejected;
        let content = format!("Your offer #{id} was rejected");
        self.commit_transition(version, offer, Party::Seller, content)
    }

    /// Read an offer, persisting `expired` first if its time has passed.
    pub fn get_offer(&self, id: OfferId) -> Result<Offer, LedgerError> {
        let current = self.load(id)?;
        let now = self.clock.now();
        if current.record.is_expired_at(now) {
            return self.expire(current, now);
        }
        Ok(current.record)
    }

    /// Every offer ever made on a listing, oldest first.
    pub fn offers_for_listing(&self, listing: ListingId) -> Result<Vec<Offer>, LedgerError> {
        let mut offers: Vec<_> = store::find::<Offer>(self.store.as_ref(), |o| o.listing == listing)?
            .into_iter()
            .map(|v| v.record)
            .collect();
        offers.sort_by_key(|o| (o.created_at, o.id));
        Ok(offers)
    }
}

/// Private API
impl OfferLedger {
    fn load(&self, id: OfferId) -> Result<Versioned<Offer>, LedgerError> {
        store::load::<Offer>(self.store.as_ref(), id)?.ok_or(LedgerError::NotFound(id))
    }

    /// Load an offer for a transition. An offer past its expiry is moved to
    /// `expired` and the transition fails with `OfferExpired`.
    fn load_live(&self, id: OfferId) -> Result<Versioned<Offer>, LedgerError> {
        let current = self.load(id)?;
        let now = self.clock.now();
        if current.record.is_expired_at(now) {
            self.expire(current, now)?;
            return Err(LedgerError::OfferExpired(id));
        }
        Ok(current)
    }

    fn expire(&self, current: Versioned<Offer>, now: Timestamp) -> Result<Offer, LedgerError> {
        let Versioned {
            version,
            record: mut offer,
        } = current;
        let id = offer.id;
        offer.status = OfferStatus::Expired;
        offer.updated_at = now;

        let mut batch = Batch::new();
        self.stage_notice(&mut batch, &offer, Party::Seller, format!("Offer #{id} expired"))?;
        batch.replace(version, offer.clone());
        self.store.commit(batch)?;

        warn!(offer = id, expires_at = ?offer.expires_at, "offer expired");
        Ok(offer)
    }

    fn commit_transition(
        &self,
        version: u64,
        mut offer: Offer,
        from: Party,
        content: String,
    ) -> Result<Offer, LedgerError> {
        offer.updated_at = self.clock.now();

        let mut batch = Batch::new();
        self.stage_notice(&mut batch, &offer, from, content)?;
        batch.replace(version, offer.clone());
        self.store.commit(batch)?;

        info!(
            offer = offer.id,
            status = %offer.status,
            amount = %offer.amount,
            counter = ?offer.counter_amount.map(|a| a.to_string()),
            "offer {}", offer.status
        );
        Ok(offer)
    }

    /// Queue a message from `from`'s side of the offer to the other side.
    fn stage_notice(
        &self,
        batch: &mut Batch,
        offer: &Offer,
        from: Party,
        content: String,
    ) -> Result<(), LedgerError> {
        let (from, to) = match from {
            Party::Buyer => (offer.buyer, offer.seller),
            Party::Seller => (offer.seller, offer.buyer),
        };
        self.inbox.stage_notice(
            batch,
            Notice {
                from,
                to,
                listing: Some(offer.listing),
                content,
            },
        )?;
        Ok(())
    }
}

fn slot_index(listing: ListingId, buyer: UserId) -> String {
    format!("offer-slot/{listing}/{buyer}")
}

fn ensure_transition(offer: &Offer, to: OfferStatus) -> Result<(), LedgerError> {
    if offer.status.can_become(to) {
        Ok(())
    } else {
        Err(LedgerError::InvalidTransition {
            offer: offer.id,
            from: offer.status,
            to,
        })
    }
}

fn ensure_party(offer: &Offer, actor: UserId, expected: Party) -> Result<(), LedgerError> {
    let owner = match expected {
        Party::Buyer => offer.buyer,
        Party::Seller => offer.seller,
    };
    if owner == actor {
        Ok(())
    } else {
        Err(LedgerError::WrongParty { actor, expected })
    }
}
