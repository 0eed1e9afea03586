//! Core domain types for the deal desk.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::Amount;

/// User identifier (buyer, seller or admin).
pub type UserId = u64;

/// Listing identifier.
pub type ListingId = u64;

/// Offer identifier.
pub type OfferId = u64;

/// Deal identifier.
pub type DealId = u64;

/// Conversation identifier.
pub type ConversationId = u64;

/// Message identifier.
pub type MessageId = u64;

/// Wall-clock instant used for every timestamp.
pub type Timestamp = DateTime<Utc>;

/// A listing as seen by the desk: only its owner matters here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Listing {
    pub id: ListingId,
    pub seller: UserId,
    pub title: String,
}

/// Lifecycle state of an offer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OfferStatus {
    Pending,
    Countered,
    Accepted,
    Rejected,
    Withdrawn,
    Expired,
}

impl OfferStatus {
    /// Pending and countered offers are still negotiable.
    pub fn is_active(self) -> bool {
        matches!(self, OfferStatus::Pending | OfferStatus::Countered)
    }

    pub fn is_terminal(self) -> bool {
        !self.is_active()
    }

    /// States reachable from `self` in one step.
    ///
    /// `Pending` and `Countered` point at each other: a buyer may answer a
    /// counter with a fresh amount as many times as the offer lives.
    pub fn allowed_targets(self) -> &'static [OfferStatus] {
        use OfferStatus::*;
        match self {
            Pending => &[Countered, Accepted, Rejected, Withdrawn, Expired],
            Countered => &[Pending, Accepted, Rejected, Expired],
            Accepted | Rejected | Withdrawn | Expired => &[],
        }
    }

    pub fn can_become(self, to: OfferStatus) -> bool {
        self.allowed_targets().contains(&to)
    }
}

impl fmt::Display for OfferStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OfferStatus::Pending => "pending",
            OfferStatus::Countered => "countered",
            OfferStatus::Accepted => "accepted",
            OfferStatus::Rejected => "rejected",
            OfferStatus::Withdrawn => "withdrawn",
            OfferStatus::Expired => "expired",
        };
        f.write_str(name)
    }
}

/// A buyer's proposed price on a listing.
#[derive(Debug, Clone, PartialEq)]
pub struct Offer {
    pub id: OfferId,
    pub listing: ListingId,
    pub buyer: UserId,
    pub seller: UserId,
    pub amount: Amount,
    /// Latest seller counter. Kept after the offer leaves `Countered`
    /// unless the buyer renegotiated.
    pub counter_amount: Option<Amount>,
    pub message: Option<String>,
    pub status: OfferStatus,
    /// Number of counters made so far.
    pub rounds: u32,
    /// Set once accepted.
    pub deal: Option<DealId>,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
    pub expires_at: Option<Timestamp>,
}

impl Offer {
    pub fn is_expired_at(&self, now: Timestamp) -> bool {
        self.status.is_active() && self.expires_at.is_some_and(|at| now > at)
    }

    /// The price a deal would close at if this offer were accepted now.
    pub fn final_amount(&self) -> Amount {
        match (self.status, self.counter_amount) {
            (OfferStatus::Countered, Some(counter)) => counter,
            _ => self.amount,
        }
    }
}

/// Ordered phase of a deal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Stage {
    OfferMade,
    CounterOffer,
    LoiSigned,
    DueDiligence,
    FinalReview,
    Closed,
}

impl Stage {
    pub const ALL: [Stage; 6] = [
        Stage::OfferMade,
        Stage::CounterOffer,
        Stage::LoiSigned,
        Stage::DueDiligence,
        Stage::FinalReview,
        Stage::Closed,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn is_terminal(self) -> bool {
        self == Stage::Closed
    }

    /// Coarse status, always derived from the stage.
    pub fn status(self) -> DealStatus {
        match self {
            Stage::OfferMade | Stage::CounterOffer => DealStatus::Negotiation,
            Stage::LoiSigned => DealStatus::Loi,
            Stage::DueDiligence | Stage::FinalReview => DealStatus::Closing,
            Stage::Closed => DealStatus::Completed,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Stage::OfferMade => "Offer Made",
            Stage::CounterOffer => "Counter Offer",
            Stage::LoiSigned => "LOI Signed",
            Stage::DueDiligence => "Due Diligence",
            Stage::FinalReview => "Final Review",
            Stage::Closed => "Closed",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("'{0}' is not a deal stage")]
pub struct ParseStageError(pub String);

impl FromStr for Stage {
    type Err = ParseStageError;

    /// Accepts the display names and their snake_case spelling.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace(['_', '-'], " ");
        Stage::ALL
            .into_iter()
            .find(|stage| stage.name().to_ascii_lowercase() == normalized)
            .ok_or_else(|| ParseStageError(s.to_string()))
    }
}

static STAGE_ORDER: [Stage; 6] = Stage::ALL;

/// Summary of a deal's stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DealStatus {
    Negotiation,
    Loi,
    Closing,
    Completed,
}

impl fmt::Display for DealStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DealStatus::Negotiation => "negotiation",
            DealStatus::Loi => "loi",
            DealStatus::Closing => "closing",
            DealStatus::Completed => "completed",
        };
        f.write_str(name)
    }
}

/// Audit entry written by every stage update.
#[derive(Debug, Clone, PartialEq)]
pub struct StageChange {
    pub from: Stage,
    pub to: Stage,
    pub actor: UserId,
    pub at: Timestamp,
    pub note: Option<String>,
    /// Previous and new amount when the update repriced the deal.
    pub repriced: Option<(Amount, Amount)>,
}

impl StageChange {
    pub fn is_regression(&self) -> bool {
        self.to < self.from
    }

    /// Stages jumped over by a forward move.
    pub fn skipped(&self) -> &'static [Stage] {
        if self.to.index() > self.from.index() + 1 {
            &STAGE_ORDER[self.from.index() + 1..self.to.index()]
        } else {
            &[]
        }
    }

    /// One-line human description for the deal notes.
    pub fn describe(&self) -> String {
        let mut line = format!("stage {} -> {}", self.from, self.to);
        if self.is_regression() {
            line.push_str(" (moved back)");
        }
        let skipped = self.skipped();
        if !skipped.is_empty() {
            let names: Vec<_> = skipped.iter().map(|s| s.name()).collect();
            line.push_str(&format!(" (skipped {})", names.join(", ")));
        }
        if let Some((old, new)) = self.repriced {
            line.push_str(&format!(" amount {old} -> {new}"));
        }
        line
    }
}

/// A deal tracked from acceptance to close.
#[derive(Debug, Clone, PartialEq)]
pub struct Deal {
    pub id: DealId,
    pub offer: OfferId,
    pub listing: ListingId,
    pub buyer: UserId,
    pub seller: UserId,
    pub amount: Amount,
    pub stage: Stage,
    pub notes: Option<String>,
    pub history: Vec<StageChange>,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

impl Deal {
    pub fn status(&self) -> DealStatus {
        self.stage.status()
    }
}

/// A two-party thread with one unread counter per side.
#[derive(Debug, Clone, PartialEq)]
pub struct Conversation {
    pub id: ConversationId,
    pub participants: [UserId; 2],
    pub listing: Option<ListingId>,
    pub unread: [u32; 2],
    /// Sequence number handed to the next message.
    pub next_seq: u64,
    pub updated_at: Timestamp,
}

impl Conversation {
    pub fn position(&self, user: UserId) -> Option<usize> {
        self.participants.iter().position(|p| *p == user)
    }

    pub fn unread_for(&self, user: UserId) -> Option<u32> {
        self.position(user).map(|idx| self.unread[idx])
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub id: MessageId,
    pub conversation: ConversationId,
    pub seq: u64,
    pub sender: UserId,
    pub content: String,
    pub read: bool,
    pub created_at: Timestamp,
}

/// A replayable request against the desk.
#[derive(Debug, Clone)]
pub enum Command {
    /// Make a listing known to the desk.
    RegisterListing {
        listing: ListingId,
        seller: UserId,
        title: String,
    },
    Submit {
        buyer: UserId,
        listing: ListingId,
        amount: Amount,
        message: Option<String>,
    },
    Withdraw { buyer: UserId, offer: OfferId },
    Counter {
        seller: UserId,
        offer: OfferId,
        amount: Amount,
    },
    Renegotiate {
        buyer: UserId,
        offer: OfferId,
        amount: Amount,
        message: Option<String>,
    },
    Accept { actor: UserId, offer: OfferId },
    Reject { seller: UserId, offer: OfferId },
    UpdateStage {
        actor: UserId,
        deal: DealId,
        stage: Stage,
        amount: Option<Amount>,
        notes: Option<String>,
    },
    Post {
        sender: UserId,
        conversation: ConversationId,
        content: String,
    },
    Open {
        viewer: UserId,
        conversation: ConversationId,
    },
}

impl Command {
    pub fn name(&self) -> &'static str {
        match self {
            Command::RegisterListing { .. } => "listing",
            Command::Submit { .. } => "submit",
            Command::Withdraw { .. } => "withdraw",
            Command::Counter { .. } => "counter",
            Command::Renegotiate { .. } => "renegotiate",
            Command::Accept { .. } => "accept",
            Command::Reject { .. } => "reject",
            Command::UpdateStage { .. } => "stage",
            Command::Post { .. } => "post",
            Command::Open { .. } => "open",
        }
    }
}
