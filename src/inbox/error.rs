//! Error types for conversation bookkeeping.

use thiserror::Error;

use crate::model::{ConversationId, UserId};
use crate::store::{RecordKey, StoreError};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InboxError {
    #[error("conversation {0} does not exist")]
    UnknownConversation(ConversationId),

    #[error("user {sender} is not a participant of conversation {conversation}")]
    UnknownSender {
        conversation: ConversationId,
        sender: UserId,
    },

    #[error("user {viewer} is not a participant of conversation {conversation}")]
    UnknownViewer {
        conversation: ConversationId,
        viewer: UserId,
    },

    #[error("message content is empty")]
    EmptyMessage,

    #[error("user {0} cannot open a conversation with themselves")]
    SameParticipant(UserId),

    #[error("{0} was modified concurrently, re-read and retry")]
    ConcurrentModification(RecordKey),

    #[error(transparent)]
    Store(StoreError),
}

impl InboxError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, InboxError::ConcurrentModification(_))
    }
}

impl From<StoreError> for InboxError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Conflict(key) => InboxError::ConcurrentModification(key),
            other => InboxError::Store(other),
        }
    }
}
