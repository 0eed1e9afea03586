//! Conversations, messages and per-participant unread counters.
//!
//! A participant's unread counter always equals the number of unread
//! messages the other participant sent. Every write that touches a message's
//! `read` flag also rewrites the conversation record, so the conversation
//! version serializes posts and opens of the same thread.

use std::sync::Arc;

use tracing::{debug, info};

use crate::clock::Clock;
use crate::model::{Conversation, ConversationId, ListingId, Message, MessageId, Timestamp, UserId};
use crate::store::{self, Batch, EntityKind, RecordStore, Versioned};

mod error;
pub use error::InboxError;

/// A counterparty message to deliver, creating the thread if needed.
#[derive(Debug, Clone)]
pub struct Notice {
    pub from: UserId,
    pub to: UserId,
    pub listing: Option<ListingId>,
    pub content: String,
}

/// Where a posted message landed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Delivery {
    pub conversation: ConversationId,
    pub message: MessageId,
}

#[derive(Clone)]
pub struct Inbox {
    store: Arc<dyn RecordStore>,
    clock: Arc<dyn Clock>,
}

/// Public API
impl Inbox {
    pub fn new(store: Arc<dyn RecordStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Append a message and bump the recipient's unread counter in one commit.
    pub fn post_message(
        &self,
        conversation: ConversationId,
        sender: UserId,
        content: &str,
    ) -> Result<MessageId, InboxError> {
        let current = self.load(conversation)?;
        if current.record.position(sender).is_none() {
            return Err(InboxError::UnknownSender {
                conversation,
                sender,
            });
        }

        let mut batch = Batch::new();
        let message = self.append(&mut batch, current, false, sender, content)?;
        self.store.commit(batch)?;

        info!(conversation, sender, message, "message posted");
        Ok(message)
    }

    /// Mark everything the other side sent as read and zero the viewer's
    /// counter. Returns how many messages flipped.
    pub fn open_conversation(
        &self,
        conversation: ConversationId,
        viewer: UserId,
    ) -> Result<usize, InboxError> {
        let Versioned {
            version,
            record: mut thread,
        } = self.load(conversation)?;
        let position = thread
            .position(viewer)
            .ok_or(InboxError::UnknownViewer {
                conversation,
                viewer,
            })?;

        let unread = store::find::<Message>(self.store.as_ref(), |m| {
            m.conversation == conversation && m.sender != viewer && !m.read
        })?;

        if unread.is_empty() && thread.unread[position] == 0 {
            debug!(conversation, viewer, "nothing unread");
            return Ok(0);
        }

        let flipped = unread.len();
        let mut batch = Batch::new();
        for Versioned {
            version: seen_at,
            record: mut message,
        } in unread
        {
            message.read = true;
            batch.replace(seen_at, message);
        }
        thread.unread[position] = 0;
        batch.replace(version, thread);
        self.store.commit(batch)?;

        info!(conversation, viewer, flipped, "conversation opened");
        Ok(flipped)
    }

    /// Find-or-create the thread between the two parties and post into it.
    pub fn notify(&self, notice: Notice) -> Result<Delivery, InboxError> {
        let mut batch = Batch::new();
        let delivery = self.stage_notice(&mut batch, notice)?;
        self.store.commit(batch)?;
        Ok(delivery)
    }

    pub fn conversation(&self, id: ConversationId) -> Result<Conversation, InboxError> {
        self.load(id).map(|v| v.record)
    }

    /// Look up the thread of an unordered pair without creating it.
    pub fn find_conversation(
        &self,
        a: UserId,
        b: UserId,
        listing: Option<ListingId>,
    ) -> Result<Option<Conversation>, InboxError> {
        let Some(entry) = store::load_index(self.store.as_ref(), &thread_index(a, b, listing))?
        else {
            return Ok(None);
        };
        self.load(entry.record.target).map(|v| Some(v.record))
    }

    /// Messages in posting order.
    pub fn messages(&self, conversation: ConversationId) -> Result<Vec<Message>, InboxError> {
        self.load(conversation)?;
        let mut messages: Vec<_> =
            store::find::<Message>(self.store.as_ref(), |m| m.conversation == conversation)?
                .into_iter()
                .map(|v| v.record)
                .collect();
        messages.sort_by_key(|m| (m.created_at, m.seq));
        Ok(messages)
    }

    pub fn unread_count(
        &self,
        conversation: ConversationId,
        participant: UserId,
    ) -> Result<u32, InboxError> {
        self.load(conversation)?
            .record
            .unread_for(participant)
            .ok_or(InboxError::UnknownViewer {
                conversation,
                viewer: participant,
            })
    }
}

/// Crate API, used to fold notices into another component's commit.
impl Inbox {
    pub(crate) fn stage_notice(
        &self,
        batch: &mut Batch,
        notice: Notice,
    ) -> Result<Delivery, InboxError> {
        let Notice {
            from,
            to,
            listing,
            content,
        } = notice;
        if from == to {
            return Err(InboxError::SameParticipant(from));
        }

        let index = thread_index(from, to, listing);
        let (thread, is_new) = match store::load_index(self.store.as_ref(), &index)? {
            Some(entry) => (self.load(entry.record.target)?, false),
            None => {
                let id = self.store.next_id(EntityKind::Conversation)?;
                batch.set_index(&index, None, id);
                let thread = Conversation {
                    id,
                    participants: [from, to],
                    listing,
                    unread: [0, 0],
                    next_seq: 0,
                    updated_at: self.clock.now(),
                };
                (Versioned { version: 0, record: thread }, true)
            }
        };

        let conversation = thread.record.id;
        let message = self.append(batch, thread, is_new, from, &content)?;
        debug!(conversation, from, to, "notice staged");
        Ok(Delivery {
            conversation,
            message,
        })
    }
}

/// Private API
impl Inbox {
    fn load(&self, id: ConversationId) -> Result<Versioned<Conversation>, InboxError> {
        store::load::<Conversation>(self.store.as_ref(), id)?
            .ok_or(InboxError::UnknownConversation(id))
    }

    /// Stage the message insert and the counter bump on the same batch.
    fn append(
        &self,
        batch: &mut Batch,
        thread: Versioned<Conversation>,
        is_new: bool,
        sender: UserId,
        content: &str,
    ) -> Result<MessageId, InboxError> {
        if content.trim().is_empty() {
            return Err(InboxError::EmptyMessage);
        }
        let Versioned {
            version,
            record: mut thread,
        } = thread;
        let conversation = thread.id;
        let sender_position = thread.position(sender).ok_or(InboxError::UnknownSender {
            conversation,
            sender,
        })?;

        let now: Timestamp = self.clock.now();
        let id = self.store.next_id(EntityKind::Message)?;
        batch.create(Message {
            id,
            conversation,
            seq: thread.next_seq,
            sender,
            content: content.to_string(),
            read: false,
            created_at: now,
        });

        thread.unread[1 - sender_position] += 1;
        thread.next_seq += 1;
        thread.updated_at = now;
        if is_new {
            batch.create(thread);
        } else {
            batch.replace(version, thread);
        }

        Ok(id)
    }
}

fn thread_index(a: UserId, b: UserId, listing: Option<ListingId>) -> String {
    let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
    match listing {
        Some(listing) => format!("thread/{lo}/{hi}/{listing}"),
        None => format!("thread/{lo}/{hi}/-"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::MemoryStore;
    use chrono::Utc;

    const BUYER: UserId = 10;
    const SELLER: UserId = 20;

    fn inbox() -> Inbox {
        Inbox::new(
            Arc::new(MemoryStore::new()),
            Arc::new(ManualClock::new(Utc::now())),
        )
    }

    fn notice(from: UserId, to: UserId, content: &str) -> Notice {
        Notice {
            from,
            to,
            listing: Some(1),
            content: content.to_string(),
        }
    }

    fn unread_from(inbox: &Inbox, conversation: ConversationId, viewer: UserId) -> u32 {
        inbox
            .messages(conversation)
            .unwrap()
            .iter()
            .filter(|m| m.sender != viewer && !m.read)
            .count() as u32
    }

    #[test]
    fn notify_creates_thread_once_for_unordered_pair() {
        let inbox = inbox();
        let first = inbox.notify(notice(BUYER, SELLER, "hello")).unwrap();
        let second = inbox.notify(notice(SELLER, BUYER, "hi back")).unwrap();

        assert_eq!(first.conversation, second.conversation);
        let thread = inbox.find_conversation(SELLER, BUYER, Some(1)).unwrap().unwrap();
        assert_eq!(thread.participants, [BUYER, SELLER]);
        assert_eq!(thread.unread, [1, 1]);
    }

    #[test]
    fn threads_are_keyed_by_listing() {
        let inbox = inbox();
        let on_listing = inbox.notify(notice(BUYER, SELLER, "about 1")).unwrap();
        let general = inbox
            .notify(Notice {
                listing: None,
                ..notice(BUYER, SELLER, "general")
            })
            .unwrap();
        assert_ne!(on_listing.conversation, general.conversation);
    }

    #[test]
    fn post_increments_only_recipient() {
        let inbox = inbox();
        let conversation = inbox.notify(notice(BUYER, SELLER, "one")).unwrap().conversation;
        inbox.post_message(conversation, BUYER, "two").unwrap();

        assert_eq!(inbox.unread_count(conversation, SELLER).unwrap(), 2);
        assert_eq!(inbox.unread_count(conversation, BUYER).unwrap(), 0);
    }

    #[test]
    fn post_to_unknown_conversation_fails() {
        let inbox = inbox();
        assert_eq!(
            inbox.post_message(99, BUYER, "hi"),
            Err(InboxError::UnknownConversation(99))
        );
    }

    #[test]
    fn post_by_outsider_fails() {
        let inbox = inbox();
        let conversation = inbox.notify(notice(BUYER, SELLER, "one")).unwrap().conversation;
        assert_eq!(
            inbox.post_message(conversation, 99, "intruding"),
            Err(InboxError::UnknownSender {
                conversation,
                sender: 99
            })
        );
        assert_eq!(inbox.messages(conversation).unwrap().len(), 1);
    }

    #[test]
    fn empty_message_is_rejected() {
        let inbox = inbox();
        let conversation = inbox.notify(notice(BUYER, SELLER, "one")).unwrap().conversation;
        assert_eq!(
            inbox.post_message(conversation, BUYER, "   "),
            Err(InboxError::EmptyMessage)
        );
    }

    #[test]
    fn self_notice_is_rejected() {
        let inbox = inbox();
        assert_eq!(
            inbox.notify(notice(BUYER, BUYER, "me")),
            Err(InboxError::SameParticipant(BUYER))
        );
    }

    #[test]
    fn open_flips_other_side_and_zeroes_viewer() {
        let inbox = inbox();
        let conversation = inbox.notify(notice(BUYER, SELLER, "one")).unwrap().conversation;
        inbox.post_message(conversation, BUYER, "two").unwrap();
        inbox.post_message(conversation, SELLER, "reply").unwrap();

        let flipped = inbox.open_conversation(conversation, SELLER).unwrap();
        assert_eq!(flipped, 2);
        assert_eq!(inbox.unread_count(conversation, SELLER).unwrap(), 0);
        // the buyer's unread reply is untouched
        assert_eq!(inbox.unread_count(conversation, BUYER).unwrap(), 1);
        assert_eq!(unread_from(&inbox, conversation, BUYER), 1);
        assert_eq!(unread_from(&inbox, conversation, SELLER), 0);
    }

    #[test]
    fn open_with_nothing_unread_is_a_no_op() {
        let inbox = inbox();
        let conversation = inbox.notify(notice(BUYER, SELLER, "one")).unwrap().conversation;
        assert_eq!(inbox.open_conversation(conversation, BUYER).unwrap(), 0);
        assert_eq!(inbox.unread_count(conversation, SELLER).unwrap(), 1);
    }

    #[test]
    fn open_by_outsider_fails() {
        let inbox = inbox();
        let conversation = inbox.notify(notice(BUYER, SELLER, "one")).unwrap().conversation;
        assert_eq!(
            inbox.open_conversation(conversation, 99),
            Err(InboxError::UnknownViewer {
                conversation,
                viewer: 99
            })
        );
    }

    #[test]
    fn messages_are_ordered_by_time_then_sequence() {
        let inbox = inbox();
        let conversation = inbox.notify(notice(BUYER, SELLER, "a")).unwrap().conversation;
        inbox.post_message(conversation, SELLER, "b").unwrap();
        inbox.post_message(conversation, BUYER, "c").unwrap();

        let contents: Vec<_> = inbox
            .messages(conversation)
            .unwrap()
            .into_iter()
            .map(|m| m.content)
            .collect();
        assert_eq!(contents, ["a", "b", "c"]);
    }
}
