//! Record store collaborator.
//!
//! The desk keeps no mutable state of its own: every operation reads the
//! records it needs, decides, and commits a [`Batch`] of conditional writes.
//! A batch applies completely or not at all.

use std::fmt;

use thiserror::Error;

use crate::model::{Conversation, Deal, Listing, Message, Offer};

pub mod memory;
pub use memory::MemoryStore;

/// Store-assigned record version, bumped on every write.
pub type Version = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EntityKind {
    Listing,
    Offer,
    Deal,
    Conversation,
    Message,
    Index,
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EntityKind::Listing => "listing",
            EntityKind::Offer => "offer",
            EntityKind::Deal => "deal",
            EntityKind::Conversation => "conversation",
            EntityKind::Message => "message",
            EntityKind::Index => "index",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RecordKey {
    pub kind: EntityKind,
    pub id: String,
}

impl RecordKey {
    pub fn entity(kind: EntityKind, id: u64) -> Self {
        Self {
            kind,
            id: id.to_string(),
        }
    }

    pub fn index(name: impl Into<String>) -> Self {
        Self {
            kind: EntityKind::Index,
            id: name.into(),
        }
    }
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.kind, self.id)
    }
}

/// Pointer record used to make uniqueness constraints atomic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexEntry {
    pub target: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Record {
    Listing(Listing),
    Offer(Offer),
    Deal(Deal),
    Conversation(Conversation),
    Message(Message),
    Index(IndexEntry),
}

impl Record {
    pub fn kind(&self) -> EntityKind {
        match self {
            Record::Listing(_) => EntityKind::Listing,
            Record::Offer(_) => EntityKind::Offer,
            Record::Deal(_) => EntityKind::Deal,
            Record::Conversation(_) => EntityKind::Conversation,
            Record::Message(_) => EntityKind::Message,
            Record::Index(_) => EntityKind::Index,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Versioned<T> {
    pub version: Version,
    pub record: T,
}

/// Condition a write is applied under.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expect {
    /// The key must not exist yet.
    Absent,
    /// The stored version must still be this one.
    Version(Version),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Write {
    pub key: RecordKey,
    pub expect: Expect,
    pub record: Record,
}

/// One logical unit of work.
#[derive(Debug, Default)]
pub struct Batch {
    writes: Vec<Write>,
}

impl Batch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, key: RecordKey, expect: Expect, record: Record) {
        self.writes.push(Write {
            key,
            expect,
            record,
        });
    }

    /// Insert a new entity.
    pub fn create<E: Entity>(&mut self, entity: E) {
        self.push(E::key(entity.id()), Expect::Absent, entity.into_record());
    }

    /// Overwrite an entity read at `version`.
    pub fn replace<E: Entity>(&mut self, version: Version, entity: E) {
        self.push(
            E::key(entity.id()),
            Expect::Version(version),
            entity.into_record(),
        );
    }

    /// Point an index at `target`; `current` is the version read, if any.
    pub fn set_index(&mut self, name: &str, current: Option<Version>, target: u64) {
        let expect = current.map_or(Expect::Absent, Expect::Version);
        self.push(
            RecordKey::index(name),
            expect,
            Record::Index(IndexEntry { target }),
        );
    }

    pub fn len(&self) -> usize {
        self.writes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.writes.is_empty()
    }

    pub fn into_writes(self) -> Vec<Write> {
        self.writes
    }
}

/// Errors raised by a record store.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("record {0} was modified concurrently")]
    Conflict(RecordKey),

    #[error("record {0} holds an unexpected entity")]
    Corrupt(RecordKey),

    #[error("batch writes {0} more than once")]
    DuplicateWrite(RecordKey),

    #[error("record store unavailable: {0}")]
    Unavailable(String),
}

/// The persistence collaborator: point reads, conditional batch writes and
/// per-kind scans.
pub trait RecordStore: Send + Sync {
    fn get(&self, key: &RecordKey) -> Result<Option<Versioned<Record>>, StoreError>;

    /// Check every expectation, then apply every write.
    fn commit(&self, batch: Batch) -> Result<(), StoreError>;

    fn query(
        &self,
        kind: EntityKind,
        predicate: &dyn Fn(&Record) -> bool,
    ) -> Result<Vec<Versioned<Record>>, StoreError>;

    /// Allocate a fresh id for `kind`.
    fn next_id(&self, kind: EntityKind) -> Result<u64, StoreError>;
}

/// A typed entity stored under `KIND`.
pub trait Entity: Sized {
    const KIND: EntityKind;

    fn id(&self) -> u64;

    fn into_record(self) -> Record;

    fn from_record(record: Record) -> Option<Self>;

    fn as_entity(record: &Record) -> Option<&Self>;

    fn key(id: u64) -> RecordKey {
        RecordKey::entity(Self::KIND, id)
    }
}

macro_rules! entity {
    ($ty:ident, $kind:ident) => {
        impl Entity for $ty {
            const KIND: EntityKind = EntityKind::$kind;

            fn id(&self) -> u64 {
                self.id
            }

            fn into_record(self) -> Record {
                Record::$kind(self)
            }

            fn from_record(record: Record) -> Option<Self> {
                match record {
                    Record::$kind(entity) => Some(entity),
                    _ => None,
                }
            }

            fn as_entity(record: &Record) -> Option<&Self> {
                match record {
                    Record::$kind(entity) => Some(entity),
                    _ => None,
                }
            }
        }
    };
}

entity!(Listing, Listing);
entity!(Offer, Offer);
entity!(Deal, Deal);
entity!(Conversation, Conversation);
entity!(Message, Message);

/// Read one entity by id.
pub fn load<E: Entity>(
    store: &dyn RecordStore,
    id: u64,
) -> Result<Option<Versioned<E>>, StoreError> {
    let key = E::key(id);
    match store.get(&key)? {
        None => Ok(None),
        Some(Versioned { version, record }) => E::from_record(record)
            .map(|record| Some(Versioned { version, record }))
            .ok_or(StoreError::Corrupt(key)),
    }
}

/// Scan every entity of type `E` matching `predicate`.
pub fn find<E: Entity>(
    store: &dyn RecordStore,
    predicate: impl Fn(&E) -> bool,
) -> Result<Vec<Versioned<E>>, StoreError> {
    let rows = store.query(E::KIND, &|record: &Record| {
        E::as_entity(record).is_some_and(&predicate)
    })?;

    rows.into_iter()
        .map(|Versioned { version, record }| {
            let kind = record.kind();
            E::from_record(record)
                .map(|record| Versioned { version, record })
                .ok_or_else(|| StoreError::Corrupt(RecordKey::index(format!("{kind}/*"))))
        })
        .collect()
}

pub fn load_index(
    store: &dyn RecordStore,
    name: &str,
) -> Result<Option<Versioned<IndexEntry>>, StoreError> {
    let key = RecordKey::index(name);
    match store.get(&key)? {
        None => Ok(None),
        Some(Versioned {
            version,
            record: Record::Index(entry),
        }) => Ok(Some(Versioned {
            version,
            record: entry,
        })),
        Some(_) => Err(StoreError::Corrupt(key)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_display_kind_and_id() {
        assert_eq!(RecordKey::entity(EntityKind::Offer, 7).to_string(), "offer/7");
        assert_eq!(
            RecordKey::index("offer-slot/1/2").to_string(),
            "index/offer-slot/1/2"
        );
    }

    #[test]
    fn set_index_expects_absent_without_version() {
        let mut batch = Batch::new();
        batch.set_index("a", None, 1);
        batch.set_index("b", Some(3), 2);
        let writes = batch.into_writes();
        assert_eq!(writes[0].expect, Expect::Absent);
        assert_eq!(writes[1].expect, Expect::Version(3));
    }
}
