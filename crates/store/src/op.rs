//! Conditional operations committed atomically by [`Database::commit`].
//!
//! An [`Op`] names one record, carries zero or more [`Assert`]s that must
//! hold against the committed state, and at most one [`Effect`]. Ops are
//! built through the typed [`OpBuilder`] so document closures see decoded
//! values:
//!
//! ```no_run
//! # use keel_store::{Collection, CollectionId, Op};
//! # #[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
//! # struct Counter { value: u64 }
//! # struct Counters;
//! # impl Collection for Counters { const ID: CollectionId = CollectionId::Sequences; type Doc = Counter; }
//! let op = Op::on::<Counters>("machine")
//!     .matches(|c: &Counter| c.value < 10)
//!     .update(|c: &mut Counter| c.value += 1);
//! ```
//!
//! [`Database::commit`]: crate::Database::commit

use std::{fmt, marker::PhantomData};

use keel_types::{CodecError, decode, encode};

use crate::collections::{Collection, CollectionId};

pub(crate) type Predicate = Box<dyn Fn(&[u8]) -> Result<bool, CodecError> + Send + Sync>;
pub(crate) type Encoder = Box<dyn FnOnce() -> Result<Vec<u8>, CodecError> + Send>;
pub(crate) type Mutation = Box<dyn FnOnce(&[u8]) -> Result<Vec<u8>, CodecError> + Send>;

/// Precondition checked against the committed state before any effect runs.
pub enum Assert {
    /// The record exists.
    Exists,
    /// The record does not exist.
    Missing,
    /// The record exists and was last written at this revno.
    Revno(u64),
    /// The record exists and its decoded document satisfies the predicate.
    Matches(Predicate),
}

impl fmt::Debug for Assert {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Assert::Exists => f.write_str("Exists"),
            Assert::Missing => f.write_str("Missing"),
            Assert::Revno(revno) => write!(f, "Revno({revno})"),
            Assert::Matches(_) => f.write_str("Matches(..)"),
        }
    }
}

/// Write applied when every assertion in the batch holds.
pub enum Effect {
    /// Assertion only.
    None,
    /// Create the record. Aborts the batch if the record already exists.
    Insert(Encoder),
    /// Rewrite the document. A missing record is left missing.
    Update(Mutation),
    /// Delete the record. Deleting a missing record is a no-op.
    Remove,
}

impl fmt::Debug for Effect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Effect::None => "None",
            Effect::Insert(_) => "Insert(..)",
            Effect::Update(_) => "Update(..)",
            Effect::Remove => "Remove",
        })
    }
}

/// One record's share of a conditional batch.
#[derive(Debug)]
pub struct Op {
    /// Target collection.
    pub collection: CollectionId,
    /// Target record id.
    pub id: String,
    /// Preconditions.
    pub asserts: Vec<Assert>,
    /// Write to apply.
    pub effect: Effect,
}

impl Op {
    /// Starts building an op against record `id` of collection `C`.
    pub fn on<C: Collection>(id: impl Into<String>) -> OpBuilder<C> {
        OpBuilder { id: id.into(), asserts: Vec::new(), _collection: PhantomData }
    }

    /// Whether this op writes anything.
    pub fn is_write(&self) -> bool {
        !matches!(self.effect, Effect::None)
    }
}

/// Typed builder for [`Op`].
///
/// Assertion methods accumulate; effect methods finish the op.
pub struct OpBuilder<C: Collection> {
    id: String,
    asserts: Vec<Assert>,
    _collection: PhantomData<C>,
}

impl<C: Collection> OpBuilder<C> {
    /// Requires the record to exist.
    #[must_use]
    pub fn exists(mut self) -> Self {
        self.asserts.push(Assert::Exists);
        self
    }

    /// Requires the record to be absent.
    #[must_use]
    pub fn missing(mut self) -> Self {
        self.asserts.push(Assert::Missing);
        self
    }

    /// Requires the record to be unchanged since it was read at `revno`.
    #[must_use]
    pub fn revno(mut self, revno: u64) -> Self {
        self.asserts.push(Assert::Revno(revno));
        self
    }

    /// Requires the record to exist and satisfy `predicate`.
    #[must_use]
    pub fn matches<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&C::Doc) -> bool + Send + Sync + 'static,
    {
        self.asserts.push(Assert::Matches(Box::new(move |bytes| {
            let doc: C::Doc = decode(bytes)?;
            Ok(predicate(&doc))
        })));
        self
    }

    /// Finishes the op with no effect.
    pub fn check(self) -> Op {
        self.finish(Effect::None)
    }

    /// Finishes the op by inserting `doc`.
    pub fn insert(self, doc: C::Doc) -> Op {
        self.finish(Effect::Insert(Box::new(move || encode(&doc))))
    }

    /// Finishes the op by mutating the stored document in place.
    pub fn update<F>(self, mutate: F) -> Op
    where
        F: FnOnce(&mut C::Doc) + Send + 'static,
    {
        self.finish(Effect::Update(Box::new(move |bytes| {
            let mut doc: C::Doc = decode(bytes)?;
            mutate(&mut doc);
            encode(&doc)
        })))
    }

    /// Finishes the op by deleting the record.
    pub fn remove(self) -> Op {
        self.finish(Effect::Remove)
    }

    fn finish(self, effect: Effect) -> Op {
        Op { collection: C::ID, id: self.id, asserts: self.asserts, effect }
    }
}
