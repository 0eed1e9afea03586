//! Top-level error returned by the desk.

use thiserror::Error;

use crate::inbox::InboxError;
use crate::ledger::LedgerError;
use crate::pipeline::PipelineError;
use crate::store::StoreError;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeskError {
    #[error("offer: {0}")]
    Ledger(#[from] LedgerError),

    #[error("deal: {0}")]
    Pipeline(#[from] PipelineError),

    #[error("conversation: {0}")]
    Inbox(#[from] InboxError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl DeskError {
    /// Only lost optimistic races are worth retrying.
    pub fn is_retryable(&self) -> bool {
        match self {
            DeskError::Ledger(err) => err.is_retryable(),
            DeskError::Pipeline(err) => err.is_retryable(),
            DeskError::Inbox(err) => err.is_retryable(),
            DeskError::Store(err) => matches!(err, StoreError::Conflict(_)),
        }
    }

    /// The entity is in a state that no longer allows the request, as
    /// opposed to a malformed request or a store failure.
    pub fn is_lifecycle(&self) -> bool {
        match self {
            DeskError::Ledger(err) => err.is_lifecycle(),
            DeskError::Pipeline(PipelineError::DealClosed(_)) => true,
            _ => false,
        }
    }

    /// The record store failed; the request itself may be fine.
    pub fn is_infrastructure(&self) -> bool {
        matches!(
            self,
            DeskError::Store(_)
                | DeskError::Ledger(LedgerError::Store(_))
                | DeskError::Ledger(LedgerError::Notify(InboxError::Store(_)))
                | DeskError::Ledger(LedgerError::Pipeline(PipelineError::Store(_)))
                | DeskError::Pipeline(PipelineError::Store(_))
                | DeskError::Pipeline(PipelineError::Notify(InboxError::Store(_)))
                | DeskError::Inbox(InboxError::Store(_))
        )
    }
}

/// Errors that can tell a lost race apart from a real failure.
pub trait Retryable {
    fn is_retryable(&self) -> bool;
}

impl Retryable for DeskError {
    fn is_retryable(&self) -> bool {
        DeskError::is_retryable(self)
    }
}

impl Retryable for LedgerError {
    fn is_retryable(&self) -> bool {
        LedgerError::is_retryable(self)
    }
}

impl Retryable for PipelineError {
    fn is_retryable(&self) -> bool {
        PipelineError::is_retryable(self)
    }
}

impl Retryable for InboxError {
    fn is_retryable(&self) -> bool {
        InboxError::is_retryable(self)
    }
}
