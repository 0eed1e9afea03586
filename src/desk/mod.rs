//! Negotiation desk.
//!
//! The desk wires the offer ledger, the deal pipeline and the inbox over one
//! record store and exposes every operation with a single error type. It
//! also replays [`Command`]s, retrying lost optimistic races up to
//! `Config::max_retries` more times.

use std::fmt;
use std::sync::Arc;

use tokio_stream::{Stream, StreamExt};
use tracing::{info, warn};

use crate::Amount;
use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::inbox::{Delivery, Inbox, Notice};
use crate::ledger::{NewOffer, OfferLedger};
use crate::model::{
    Command, Conversation, ConversationId, Deal, DealId, Listing, ListingId, Message, MessageId,
    Offer, OfferId, UserId,
};
use crate::pipeline::{Pipeline, ProgressSummary, StageUpdate};
use crate::store::{MemoryStore, RecordStore};

mod error;
pub use error::{DeskError, Retryable};

/// Re-run `op` while it fails with a retryable error, at most
/// `max_retries` times after the first attempt. The last result is returned
/// as is.
pub fn retry<T, E>(max_retries: u32, mut op: impl FnMut() -> Result<T, E>) -> Result<T, E>
where
    E: Retryable + fmt::Display,
{
    let mut retries = 0;
    loop {
        match op() {
            Err(err) if err.is_retryable() && retries < max_retries => {
                retries += 1;
                warn!(retry = retries, reason = %err, "write conflict, retrying");
            }
            result => return result,
        }
    }
}

/// Outcome counts of a [`Desk::run`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub applied: usize,
    pub skipped: usize,
}

#[derive(Clone)]
pub struct Desk {
    ledger: OfferLedger,
    pipeline: Pipeline,
    inbox: Inbox,
    config: Config,
}

/// Public API
impl Desk {
    pub fn new(store: Arc<dyn RecordStore>, clock: Arc<dyn Clock>, config: Config) -> Self {
        let inbox = Inbox::new(store.clone(), clock.clone());
        let pipeline = Pipeline::new(store.clone(), clock.clone(), inbox.clone());
        let ledger = OfferLedger::new(store, clock, pipeline.clone(), inbox.clone())
            .with_default_ttl(config.offer_ttl());
        Self {
            ledger,
            pipeline,
            inbox,
            config,
        }
    }

    /// A desk over a fresh [`MemoryStore`] and the system clock.
    pub fn in_memory(config: Config) -> Self {
        Self::new(Arc::new(MemoryStore::new()), Arc::new(SystemClock), config)
    }

    pub fn ledger(&self) -> &OfferLedger {
        &self.ledger
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    pub fn inbox(&self) -> &Inbox {
        &self.inbox
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Apply commands from `stream` until it ends. Failed commands are logged
    /// and skipped.
    pub async fn run(&self, mut stream: impl Stream<Item = Command> + Unpin) -> RunSummary {
        let mut summary = RunSummary::default();
        while let Some(command) = stream.next().await {
            match self.apply(command) {
                Ok(()) => summary.applied += 1,
                Err(_) => summary.skipped += 1,
            }
        }
        summary
    }

    /// Apply a single command, retrying lost races.
    pub fn apply(&self, command: Command) -> Result<(), DeskError> {
        let retries = self.config.max_retries;
        match command {
            Command::RegisterListing {
                listing,
                seller,
                title,
            } => {
                let result = self.register_listing(Listing {
                    id: listing,
                    seller,
                    title,
                });
                Self::log_result("listing", seller, listing, None, &result);
                result?;
            }
            Command::Submit {
                buyer,
                listing,
                amount,
                message,
            } => {
                let result = retry(retries, || {
                    self.submit_offer(NewOffer {
                        listing,
                        buyer,
                        amount,
                        message: message.clone(),
                        expires_at: None,
                    })
                });
                Self::log_result("submit", buyer, listing, Some(amount), &result);
                result?;
            }
            Command::Withdraw { buyer, offer } => {
                let result = retry(retries, || self.withdraw_offer(offer, buyer));
                Self::log_result("withdraw", buyer, offer, None, &result);
                result?;
            }
            Command::Counter {
                seller,
                offer,
                amount,
            } => {
                let result = retry(retries, || self.counter_offer(offer, seller, amount));
                Self::log_result("counter", seller, offer, Some(amount), &result);
                result?;
            }
            Command::Renegotiate {
                buyer,
                offer,
                amount,
                message,
            } => {
                let result = retry(retries, || {
                    self.renegotiate_offer(offer, buyer, amount, message.clone())
                });
                Self::log_result("renegotiate", buyer, offer, Some(amount), &result);
                result?;
            }
            Command::Accept { actor, offer } => {
                let result = retry(retries, || self.accept_offer(offer, actor));
                Self::log_result("accept", actor, offer, None, &result);
                result?;
            }
            Command::Reject { seller, offer } => {
                let result = retry(retries, || self.reject_offer(offer, seller));
                Self::log_result("reject", seller, offer, None, &result);
                result?;
            }
            Command::UpdateStage {
                actor,
                deal,
                stage,
                amount,
                notes,
            } => {
                let result = retry(retries, || {
                    self.update_stage(
                        deal,
                        StageUpdate {
                            actor,
                            stage,
                            amount,
                            notes: notes.clone(),
                        },
                    )
                });
                Self::log_result("stage", actor, deal, amount, &result);
                result?;
            }
            Command::Post {
                sender,
                conversation,
                content,
            } => {
                let result = retry(retries, || {
                    self.post_message(conversation, sender, &content)
                });
                Self::log_result("post", sender, conversation, None, &result);
                result?;
            }
            Command::Open {
                viewer,
                conversation,
            } => {
                let result = retry(retries, || self.open_conversation(conversation, viewer));
                Self::log_result("open", viewer, conversation, None, &result);
                result?;
            }
        }
        Ok(())
    }
}

/// Offer operations
impl Desk {
    pub fn register_listing(&self, listing: Listing) -> Result<(), DeskError> {
        Ok(self.ledger.register_listing(listing)?)
    }

    pub fn submit_offer(&self, new: NewOffer) -> Result<Offer, DeskError> {
        Ok(self.ledger.submit(new)?)
    }

    pub fn withdraw_offer(&self, offer: OfferId, buyer: UserId) -> Result<Offer, DeskError> {
        Ok(self.ledger.withdraw(offer, buyer)?)
    }

    pub fn counter_offer(
        &self,
        offer: OfferId,
        seller: UserId,
        amount: Amount,
    ) -> Result<Offer, DeskError> {
        Ok(self.ledger.counter(offer, seller, amount)?)
    }

    pub fn renegotiate_offer(
        &self,
        offer: OfferId,
        buyer: UserId,
        amount: Amount,
        message: Option<String>,
    ) -> Result<Offer, DeskError> {
        Ok(self.ledger.renegotiate(offer, buyer, amount, message)?)
    }

    /// Accept an offer and return the deal it opened.
    pub fn accept_offer(&self, offer: OfferId, actor: UserId) -> Result<DealId, DeskError> {
        Ok(self.ledger.accept(offer, actor)?)
    }

    pub fn reject_offer(&self, offer: OfferId, seller: UserId) -> Result<Offer, DeskError> {
        Ok(self.ledger.reject(offer, seller)?)
    }

    pub fn offer(&self, offer: OfferId) -> Result<Offer, DeskError> {
        Ok(self.ledger.get_offer(offer)?)
    }

    pub fn offers_for_listing(&self, listing: ListingId) -> Result<Vec<Offer>, DeskError> {
        Ok(self.ledger.offers_for_listing(listing)?)
    }
}

/// Deal operations
impl Desk {
    pub fn update_stage(&self, deal: DealId, update: StageUpdate) -> Result<Deal, DeskError> {
        Ok(self.pipeline.update_stage(deal, update)?)
    }

    pub fn update_stage_named(
        &self,
        deal: DealId,
        actor: UserId,
        stage: &str,
        amount: Option<Amount>,
        notes: Option<String>,
    ) -> Result<Deal, DeskError> {
        Ok(self
            .pipeline
            .update_stage_named(deal, actor, stage, amount, notes)?)
    }

    pub fn progress_summary(&self, deal: DealId) -> Result<ProgressSummary, DeskError> {
        Ok(self.pipeline.progress_summary(deal)?)
    }

    pub fn deal(&self, deal: DealId) -> Result<Deal, DeskError> {
        Ok(self.pipeline.deal(deal)?)
    }

    pub fn deal_for_offer(&self, offer: OfferId) -> Result<Option<Deal>, DeskError> {
        Ok(self.pipeline.deal_for_offer(offer)?)
    }

    pub fn deals(&self) -> Result<Vec<Deal>, DeskError> {
        Ok(self.pipeline.deals()?)
    }
}

/// Conversation operations
impl Desk {
    pub fn post_message(
        &self,
        conversation: ConversationId,
        sender: UserId,
        content: &str,
    ) -> Result<MessageId, DeskError> {
        Ok(self.inbox.post_message(conversation, sender, content)?)
    }

    pub fn open_conversation(
        &self,
        conversation: ConversationId,
        viewer: UserId,
    ) -> Result<usize, DeskError> {
        Ok(self.inbox.open_conversation(conversation, viewer)?)
    }

    pub fn notify(&self, notice: Notice) -> Result<Delivery, DeskError> {
        Ok(self.inbox.notify(notice)?)
    }

    pub fn conversation(&self, conversation: ConversationId) -> Result<Conversation, DeskError> {
        Ok(self.inbox.conversation(conversation)?)
    }

    pub fn find_conversation(
        &self,
        a: UserId,
        b: UserId,
        listing: Option<ListingId>,
    ) -> Result<Option<Conversation>, DeskError> {
        Ok(self.inbox.find_conversation(a, b, listing)?)
    }

    pub fn messages(&self, conversation: ConversationId) -> Result<Vec<Message>, DeskError> {
        Ok(self.inbox.messages(conversation)?)
    }

    pub fn unread_count(
        &self,
        conversation: ConversationId,
        participant: UserId,
    ) -> Result<u32, DeskError> {
        Ok(self.inbox.unread_count(conversation, participant)?)
    }
}

/// Private API
impl Desk {
    /// Small helper to log `apply` results
    fn log_result<T>(
        op: &str,
        actor: UserId,
        id: u64,
        amount: Option<Amount>,
        result: &Result<T, DeskError>,
    ) {
        match (result, amount) {
            (Ok(_), Some(amt)) => {
                info!(actor, id, amount = %amt, "{op} applied");
            }
            (Ok(_), None) => {
                info!(actor, id, "{op} applied");
            }
            (Err(e), Some(amt)) => {
                info!(actor, id, amount = %amt, reason = %e, "{op} skipped");
            }
            (Err(e), None) => {
                info!(actor, id, reason = %e, "{op} skipped");
            }
        }
    }
}
