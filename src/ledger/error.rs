//! Error types for the offer ledger.

use std::fmt;

use thiserror::Error;

use crate::Amount;
use crate::inbox::InboxError;
use crate::model::{ListingId, OfferId, OfferStatus, UserId};
use crate::pipeline::PipelineError;
use crate::store::{RecordKey, StoreError};

/// Side of an offer an action belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Party {
    Buyer,
    Seller,
}

impl fmt::Display for Party {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Party::Buyer => f.write_str("buyer"),
            Party::Seller => f.write_str("seller"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LedgerError {
    #[error("offer amount must be positive, got {0}")]
    InvalidAmount(Amount),

    #[error("listing {0} not found")]
    ListingNotFound(ListingId),

    #[error("offer {0} not found")]
    NotFound(OfferId),

    #[error("buyer {buyer} already has active offer {existing} on listing {listing}")]
    DuplicateActiveOffer {
        listing: ListingId,
        buyer: UserId,
        existing: OfferId,
    },

    #[error("offer {offer} cannot move from {from} to {to}")]
    InvalidTransition {
        offer: OfferId,
        from: OfferStatus,
        to: OfferStatus,
    },

    #[error("offer {0} has expired")]
    OfferExpired(OfferId),

    #[error("user {actor} is not the {expected} here")]
    WrongParty { actor: UserId, expected: Party },

    #[error("{0} was modified concurrently, re-read and retry")]
    ConcurrentModification(RecordKey),

    #[error("deal creation failed: {0}")]
    Pipeline(#[from] PipelineError),

    #[error("notification failed: {0}")]
    Notify(#[from] InboxError),

    #[error(transparent)]
    Store(StoreError),
}

impl LedgerError {
    pub fn is_retryable(&self) -> bool {
        match self {
            LedgerError::ConcurrentModification(_) => true,
            LedgerError::Pipeline(err) => err.is_retryable(),
            LedgerError::Notify(InboxError::ConcurrentModification(_)) => true,
            _ => false,
        }
    }

    /// The offer can no longer be acted on this way, or not by this user.
    pub fn is_lifecycle(&self) -> bool {
        matches!(
            self,
            LedgerError::InvalidTransition { .. }
                | LedgerError::OfferExpired(_)
                | LedgerError::DuplicateActiveOffer { .. }
                | LedgerError::WrongParty { .. }
        )
    }
}

impl From<StoreError> for LedgerError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Conflict(key) => LedgerError::ConcurrentModification(key),
            other => LedgerError::Store(other),
        }
    }
}
