//! Deal pipeline.
//!
//! A deal is opened when an offer is accepted and walks the stages of
//! [`Stage::ALL`] until `Closed`. Stage updates may jump forward or move back;
//! each one leaves a [`StageChange`] in the deal history.

use std::sync::Arc;

use tracing::{info, warn};

use crate::Amount;
use crate::clock::Clock;
use crate::inbox::{Inbox, Notice};
use crate::model::{Deal, DealId, DealStatus, Offer, OfferId, OfferStatus, Stage, StageChange, UserId};
use crate::store::{self, Batch, EntityKind, RecordStore, Versioned};

mod error;
pub use error::PipelineError;

/// A requested stage move.
#[derive(Debug, Clone)]
pub struct StageUpdate {
    pub actor: UserId,
    pub stage: Stage,
    /// New agreed price, if the update reprices the deal.
    pub amount: Option<Amount>,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageProgress {
    pub stage: Stage,
    pub completed: bool,
}

/// Presentation view of where a deal stands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressSummary {
    pub deal: DealId,
    pub stage: Stage,
    pub stage_index: usize,
    pub status: DealStatus,
    pub is_terminal: bool,
    pub stages: Vec<StageProgress>,
}

#[derive(Clone)]
pub struct Pipeline {
    store: Arc<dyn RecordStore>,
    clock: Arc<dyn Clock>,
    inbox: Inbox,
}

/// Public API
impl Pipeline {
    pub fn new(store: Arc<dyn RecordStore>, clock: Arc<dyn Clock>, inbox: Inbox) -> Self {
        Self {
            store,
            clock,
            inbox,
        }
    }

    pub fn deal(&self, id: DealId) -> Result<Deal, PipelineError> {
        self.load(id).map(|v| v.record)
    }

    pub fn deal_for_offer(&self, offer: OfferId) -> Result<Option<Deal>, PipelineError> {
        Ok(store::find::<Deal>(self.store.as_ref(), |d| d.offer == offer)?
            .into_iter()
            .next()
            .map(|v| v.record))
    }

    /// Every deal, oldest first.
    pub fn deals(&self) -> Result<Vec<Deal>, PipelineError> {
        let mut deals: Vec<_> = store::find::<Deal>(self.store.as_ref(), |_| true)?
            .into_iter()
            .map(|v| v.record)
            .collect();
        deals.sort_by_key(|d| d.id);
        Ok(deals)
    }

    /// Move a deal to `update.stage`, recording the change and notifying the
    /// counterparty in the same commit.
    pub fn update_stage(&self, id: DealId, update: StageUpdate) -> Result<Deal, PipelineError> {
        let Versioned {
            version,
            record: mut deal,
        } = self.load(id)?;

        if deal.stage.is_terminal() {
            return Err(PipelineError::DealClosed(id));
        }
        if let Some(amount) = update.amount {
            if !amount.is_positive() {
                return Err(PipelineError::InvalidAmount(amount));
            }
        }

        let now = self.clock.now();
        let change = StageChange {
            from: deal.stage,
            to: update.stage,
            actor: update.actor,
            at: now,
            note: update.notes.clone(),
            repriced: update
                .amount
                .filter(|amount| *amount != deal.amount)
                .map(|amount| (deal.amount, amount)),
        };
        if change.is_regression() {
            warn!(deal = id, from = %change.from, to = %change.to, "deal stage moved back");
        }

        let audit = change.describe();
        deal.notes = Some(match &update.notes {
            Some(note) => format!("{audit}; {note}"),
            None => audit,
        });
        deal.stage = update.stage;
        if let Some((_, amount)) = change.repriced {
            deal.amount = amount;
        }
        deal.updated_at = now;
        deal.history.push(change);

        let (from, to) = if update.actor == deal.buyer {
            (deal.buyer, deal.seller)
        } else {
            (deal.seller, deal.buyer)
        };
        let mut batch = Batch::new();
        self.inbox.stage_notice(
            &mut batch,
            Notice {
                from,
                to,
                listing: Some(deal.listing),
                content: format!("Deal #{id} moved to {}", deal.stage),
            },
        )?;
        batch.replace(version, deal.clone());
        self.store.commit(batch)?;

        info!(
            deal = id,
            stage = %deal.stage,
            status = %deal.status(),
            amount = %deal.amount,
            "deal stage updated"
        );
        Ok(deal)
    }

    /// Same as [`update_stage`](Self::update_stage) with the stage given by name.
    pub fn update_stage_named(
        &self,
        id: DealId,
        actor: UserId,
        stage: &str,
        amount: Option<Amount>,
        notes: Option<String>,
    ) -> Result<Deal, PipelineError> {
        let stage = stage
            .parse::<Stage>()
            .map_err(|err| PipelineError::InvalidStage(err.0))?;
        self.update_stage(
            id,
            StageUpdate {
                actor,
                stage,
                amount,
                notes,
            },
        )
    }

    pub fn progress_summary(&self, id: DealId) -> Result<ProgressSummary, PipelineError> {
        let deal = self.deal(id)?;
        let current = deal.stage.index();
        Ok(ProgressSummary {
            deal: id,
            stage: deal.stage,
            stage_index: current,
            status: deal.status(),
            is_terminal: deal.stage.is_terminal(),
            stages: Stage::ALL
                .into_iter()
                .map(|stage| StageProgress {
                    stage,
                    completed: stage.index() <= current,
                })
                .collect(),
        })
    }
}

/// Crate API, called by the ledger when an offer is accepted.
impl Pipeline {
    /// Stage a new deal for an accepted offer on `batch`.
    pub(crate) fn create_from_offer(
        &self,
        batch: &mut Batch,
        offer: &Offer,
    ) -> Result<Deal, PipelineError> {
        if offer.status != OfferStatus::Accepted {
            return Err(PipelineError::OfferNotAccepted {
                offer: offer.id,
                status: offer.status,
            });
        }

        let now = self.clock.now();
        let deal = Deal {
            id: self.store.next_id(EntityKind::Deal)?,
            offer: offer.id,
            listing: offer.listing,
            buyer: offer.buyer,
            seller: offer.seller,
            amount: offer.amount,
            stage: Stage::OfferMade,
            notes: None,
            history: Vec::new(),
            created_at: now,
            updated_at: now,
        };
        batch.create(deal.clone());
        Ok(deal)
    }
}

/// Private API
impl Pipeline {
    fn load(&self, id: DealId) -> Result<Versioned<Deal>, PipelineError> {
        store::load::<Deal>(self.store.as_ref(), id)?.ok_or(PipelineError::NotFound(id))
    }
}
