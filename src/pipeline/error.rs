//! Error types for deal stage tracking.

use thiserror::Error;

use crate::Amount;
use crate::inbox::InboxError;
use crate::model::{DealId, OfferId, OfferStatus};
use crate::store::{RecordKey, StoreError};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PipelineError {
    #[error("offer {offer} is {status}, only accepted offers open a deal")]
    OfferNotAccepted { offer: OfferId, status: OfferStatus },

    #[error("'{0}' is not a deal stage")]
    InvalidStage(String),

    #[error("deal {0} not found")]
    NotFound(DealId),

    #[error("deal {0} is closed")]
    DealClosed(DealId),

    #[error("deal amount must be positive, got {0}")]
    InvalidAmount(Amount),

    #[error("{0} was modified concurrently, re-read and retry")]
    ConcurrentModification(RecordKey),

    #[error("notification failed: {0}")]
    Notify(#[from] InboxError),

    #[error(transparent)]
    Store(StoreError),
}

impl PipelineError {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            PipelineError::ConcurrentModification(_)
                | PipelineError::Notify(InboxError::ConcurrentModification(_))
        )
    }
}

impl From<StoreError> for PipelineError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Conflict(key) => PipelineError::ConcurrentModification(key),
            other => PipelineError::Store(other),
        }
    }
}
