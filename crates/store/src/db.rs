//! The record store database.
//!
//! A [`Database`] holds every collection in memory behind a single
//! reader/writer lock. Commits take the write lock, check every assertion of
//! the batch against one consistent view, apply the effects, persist through
//! the backend, and publish a [`CommitEvent`] before releasing the lock, so
//! change subscribers observe events in commit order.

use std::{
    collections::BTreeMap,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
};

use keel_types::{decode, encode};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use snafu::ResultExt;
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::{
    backend::{FORMAT_VERSION, FileBackend, InMemoryBackend, MAGIC, StorageBackend},
    collections::{Collection, CollectionId},
    error::{AbortedSnafu, CodecSnafu, CorruptedSnafu, Error, Result, UnauthorizedSnafu},
    op::{Assert, Effect, Op},
};

/// Default number of commit events buffered for each change subscriber.
pub const DEFAULT_CHANGE_CAPACITY: usize = 1024;

/// Database configuration.
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    /// Commit events buffered per subscriber before it lags.
    pub change_capacity: usize,
    /// Reject every commit with `Error::Unauthorized`.
    pub read_only: bool,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self { change_capacity: DEFAULT_CHANGE_CAPACITY, read_only: false }
    }
}

/// A decoded record with its revision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record<T> {
    /// Record id.
    pub id: String,
    /// Commit sequence number of the last write to this record.
    pub revno: u64,
    /// Decoded document.
    pub doc: T,
}

/// One record touched by a commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Change {
    /// Collection of the record.
    pub collection: CollectionId,
    /// Record id.
    pub id: String,
    /// New revno, or `None` if the record was removed.
    pub revno: Option<u64>,
}

/// Everything a single commit changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitEvent {
    /// Commit sequence number.
    pub seq: u64,
    /// Records written or removed, in op order.
    pub changes: Vec<Change>,
}

impl CommitEvent {
    /// Whether any change touched `collection`.
    pub fn touches(&self, collection: CollectionId) -> bool {
        self.changes.iter().any(|c| c.collection == collection)
    }
}

/// Database statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DatabaseStats {
    /// Latest commit sequence number.
    pub seq: u64,
    /// Commit calls that succeeded.
    pub commits: u64,
    /// Commit calls that aborted on a precondition.
    pub aborts: u64,
    /// Records currently stored.
    pub records: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredRecord {
    revno: u64,
    bytes: Vec<u8>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Snapshot {
    seq: u64,
    records: Vec<(CollectionId, String, StoredRecord)>,
}

struct Inner {
    collections: Vec<BTreeMap<String, StoredRecord>>,
    seq: u64,
}

impl Inner {
    fn empty() -> Self {
        Self { collections: vec![BTreeMap::new(); CollectionId::COUNT], seq: 0 }
    }

    fn table(&self, collection: CollectionId) -> &BTreeMap<String, StoredRecord> {
        &self.collections[collection.index()]
    }

    fn table_mut(&mut self, collection: CollectionId) -> &mut BTreeMap<String, StoredRecord> {
        &mut self.collections[collection.index()]
    }
}

type Undo = (CollectionId, String, Option<StoredRecord>);

/// The record store.
pub struct Database<B: StorageBackend = InMemoryBackend> {
    backend: B,
    config: DatabaseConfig,
    inner: RwLock<Inner>,
    changes: Mutex<Option<broadcast::Sender<Arc<CommitEvent>>>>,
    closed: AtomicBool,
    commits: AtomicU64,
    aborts: AtomicU64,
}

impl Database<InMemoryBackend> {
    /// Opens an empty in-memory database.
    ///
    /// # Errors
    ///
    /// Infallible in practice; the signature matches the durable backends.
    pub fn open_in_memory() -> Result<Self> {
        Self::with_backend(InMemoryBackend::new(), DatabaseConfig::default())
    }

    /// Opens an empty in-memory database with custom configuration.
    ///
    /// # Errors
    ///
    /// Infallible in practice; the signature matches the durable backends.
    pub fn open_in_memory_with_config(config: DatabaseConfig) -> Result<Self> {
        Self::with_backend(InMemoryBackend::new(), config)
    }
}

impl Database<FileBackend> {
    /// Opens the database persisted at `path`, creating it if absent.
    ///
    /// # Errors
    ///
    /// Returns `Error::Io` if the file cannot be read and `Error::Corrupted`
    /// if it is not a snapshot written by this store.
    pub fn open<P: AsRef<std::path::Path>>(path: P) -> Result<Self> {
        Self::with_backend(FileBackend::open(path)?, DatabaseConfig::default())
    }
}

impl<B: StorageBackend> Database<B> {
    /// Opens a database over `backend`, loading its last snapshot.
    ///
    /// # Errors
    ///
    /// Returns `Error::Io` or `Error::Corrupted` if the snapshot cannot be loaded.
    pub fn with_backend(backend: B, config: DatabaseConfig) -> Result<Self> {
        let inner = match backend.load()? {
            Some(bytes) => Self::restore(&bytes)?,
            None => Inner::empty(),
        };
        if inner.seq > 0 {
            info!(seq = inner.seq, "Restored store snapshot");
        }
        let (tx, _) = broadcast::channel(config.change_capacity.max(1));
        Ok(Self {
            backend,
            config,
            inner: RwLock::new(inner),
            changes: Mutex::new(Some(tx)),
            closed: AtomicBool::new(false),
            commits: AtomicU64::new(0),
            aborts: AtomicU64::new(0),
        })
    }

    fn restore(bytes: &[u8]) -> Result<Inner> {
        let header_len = MAGIC.len() + 2;
        if bytes.len() < header_len || &bytes[..MAGIC.len()] != MAGIC {
            return CorruptedSnafu { reason: "bad magic" }.fail();
        }
        let version = u16::from_le_bytes([bytes[MAGIC.len()], bytes[MAGIC.len() + 1]]);
        if version != FORMAT_VERSION {
            return CorruptedSnafu { reason: format!("unsupported format version {version}") }
                .fail();
        }
        let snapshot: Snapshot = decode(&bytes[header_len..])
            .map_err(|e| Error::Corrupted { reason: e.to_string() })?;
        let mut inner = Inner::empty();
        inner.seq = snapshot.seq;
        for (collection, id, record) in snapshot.records {
            inner.table_mut(collection).insert(id, record);
        }
        Ok(inner)
    }

    fn snapshot_bytes(inner: &Inner, seq: u64) -> Result<Vec<u8>> {
        let records = CollectionId::ALL
            .iter()
            .flat_map(|&c| inner.table(c).iter().map(move |(id, r)| (c, id.clone(), r.clone())))
            .collect();
        let body = encode(&Snapshot { seq, records })
            .map_err(|e| Error::Corrupted { reason: e.to_string() })?;
        let mut bytes = Vec::with_capacity(MAGIC.len() + 2 + body.len());
        bytes.extend_from_slice(MAGIC);
        bytes.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
        bytes.extend_from_slice(&body);
        Ok(bytes)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Closed);
        }
        Ok(())
    }

    // ========================================================================
    // Reads
    // ========================================================================

    /// Reads one record by id.
    ///
    /// # Errors
    ///
    /// Returns `Error::Closed` after [`close`](Self::close) and `Error::Codec`
    /// if the stored document does not decode as `C::Doc`.
    pub fn get<C: Collection>(&self, id: &str) -> Result<Option<Record<C::Doc>>> {
        self.ensure_open()?;
        let inner = self.inner.read();
        inner.table(C::ID).get(id).map(|stored| Self::decode_record::<C>(id, stored)).transpose()
    }

    /// Returns every record of `C` whose document satisfies `predicate`.
    ///
    /// # Errors
    ///
    /// Returns `Error::Closed` after close and `Error::Codec` on undecodable documents.
    pub fn find<C: Collection>(
        &self,
        predicate: impl Fn(&C::Doc) -> bool,
    ) -> Result<Vec<Record<C::Doc>>> {
        self.ensure_open()?;
        let inner = self.inner.read();
        let mut found = Vec::new();
        for (id, stored) in inner.table(C::ID) {
            let record = Self::decode_record::<C>(id, stored)?;
            if predicate(&record.doc) {
                found.push(record);
            }
        }
        Ok(found)
    }

    /// Returns every record of `C`.
    ///
    /// # Errors
    ///
    /// Same as [`find`](Self::find).
    pub fn all<C: Collection>(&self) -> Result<Vec<Record<C::Doc>>> {
        self.find::<C>(|_| true)
    }

    /// Returns the ids of every record of `C`, in order.
    ///
    /// # Errors
    ///
    /// Returns `Error::Closed` after close.
    pub fn ids<C: Collection>(&self) -> Result<Vec<String>> {
        self.ensure_open()?;
        Ok(self.inner.read().table(C::ID).keys().cloned().collect())
    }

    /// Returns the revno of a record without decoding it.
    ///
    /// # Errors
    ///
    /// Returns `Error::Closed` after close.
    pub fn revno(&self, collection: CollectionId, id: &str) -> Result<Option<u64>> {
        self.ensure_open()?;
        Ok(self.inner.read().table(collection).get(id).map(|r| r.revno))
    }

    fn decode_record<C: Collection>(id: &str, stored: &StoredRecord) -> Result<Record<C::Doc>> {
        let doc = decode(&stored.bytes).context(CodecSnafu { collection: C::ID, id })?;
        Ok(Record { id: id.to_string(), revno: stored.revno, doc })
    }

    // ========================================================================
    // Commit
    // ========================================================================

    /// Atomically applies a batch of conditional operations.
    ///
    /// Every assertion is checked against the state before the batch. If any
    /// fails, or an insert targets an existing record, nothing is written and
    /// `Error::Aborted` is returned. On success, returns the sequence number
    /// of the commit (unchanged if no op wrote anything).
    ///
    /// # Errors
    ///
    /// - `Error::Aborted` if a precondition does not hold.
    /// - `Error::Closed` after [`close`](Self::close).
    /// - `Error::Unauthorized` on a read-only database.
    /// - `Error::Codec` or `Error::Io` if encoding or persistence fails; the
    ///   batch is rolled back.
    pub fn commit(&self, ops: Vec<Op>) -> Result<u64> {
        self.ensure_open()?;
        if self.config.read_only {
            return UnauthorizedSnafu { message: "session is read-only" }.fail();
        }
        let mut inner = self.inner.write();
        self.ensure_open()?;

        if let Err(e) = Self::check_asserts(&inner, &ops) {
            if e.is_aborted() {
                self.aborts.fetch_add(1, Ordering::Relaxed);
                debug!(error = %e, "Commit aborted on assertion");
            }
            return Err(e);
        }

        let seq = inner.seq + 1;
        let mut undo = Vec::new();
        let changes = match Self::apply_effects(&mut inner, seq, ops, &mut undo) {
            Ok(changes) => changes,
            Err(e) => {
                Self::rollback(&mut inner, undo);
                if e.is_aborted() {
                    self.aborts.fetch_add(1, Ordering::Relaxed);
                    debug!(error = %e, "Commit aborted on insert");
                }
                return Err(e);
            },
        };

        self.commits.fetch_add(1, Ordering::Relaxed);
        if changes.is_empty() {
            return Ok(inner.seq);
        }

        if self.backend.is_durable() {
            let persisted = Self::snapshot_bytes(&inner, seq).and_then(|b| self.backend.persist(&b));
            if let Err(e) = persisted {
                Self::rollback(&mut inner, undo);
                self.commits.fetch_sub(1, Ordering::Relaxed);
                return Err(e);
            }
        }

        inner.seq = seq;
        debug!(seq, changes = changes.len(), "Committed batch");
        if let Some(tx) = self.changes.lock().as_ref() {
            // No receivers is fine; nobody is watching.
            let _ = tx.send(Arc::new(CommitEvent { seq, changes }));
        }
        Ok(seq)
    }

    fn check_asserts(inner: &Inner, ops: &[Op]) -> Result<()> {
        for op in ops {
            let current = inner.table(op.collection).get(&op.id);
            for assert in &op.asserts {
                let failure = match (assert, current) {
                    (Assert::Exists, None)
                    | (Assert::Revno(_), None)
                    | (Assert::Matches(_), None) => Some("record missing".to_string()),
                    (Assert::Missing, Some(_)) => Some("record exists".to_string()),
                    (Assert::Revno(expected), Some(stored)) if stored.revno != *expected => {
                        Some(format!("revno {} != {expected}", stored.revno))
                    },
                    (Assert::Matches(predicate), Some(stored)) => {
                        let holds = predicate(&stored.bytes)
                            .context(CodecSnafu { collection: op.collection, id: op.id.as_str() })?;
                        (!holds).then(|| "document does not match".to_string())
                    },
                    _ => None,
                };
                if let Some(reason) = failure {
                    return AbortedSnafu { collection: op.collection, id: op.id.as_str(), reason }
                        .fail();
                }
            }
        }
        Ok(())
    }

    fn apply_effects(
        inner: &mut Inner,
        seq: u64,
        ops: Vec<Op>,
        undo: &mut Vec<Undo>,
    ) -> Result<Vec<Change>> {
        let mut changes = Vec::new();
        for Op { collection, id, effect, .. } in ops {
            let table = inner.table_mut(collection);
            match effect {
                Effect::None => {},
                Effect::Insert(encoder) => {
                    if table.contains_key(&id) {
                        return AbortedSnafu { collection, id, reason: "record already exists" }
                            .fail();
                    }
                    let bytes = encoder().context(CodecSnafu { collection, id: id.as_str() })?;
                    table.insert(id.clone(), StoredRecord { revno: seq, bytes });
                    undo.push((collection, id.clone(), None));
                    changes.push(Change { collection, id, revno: Some(seq) });
                },
                Effect::Update(mutate) => {
                    let Some(stored) = table.get_mut(&id) else {
                        continue;
                    };
                    let bytes =
                        mutate(&stored.bytes).context(CodecSnafu { collection, id: id.as_str() })?;
                    if bytes == stored.bytes {
                        continue;
                    }
                    let previous = std::mem::replace(stored, StoredRecord { revno: seq, bytes });
                    undo.push((collection, id.clone(), Some(previous)));
                    changes.push(Change { collection, id, revno: Some(seq) });
                },
                Effect::Remove => {
                    if let Some(previous) = table.remove(&id) {
                        undo.push((collection, id.clone(), Some(previous)));
                        changes.push(Change { collection, id, revno: None });
                    }
                },
            }
        }
        Ok(changes)
    }

    fn rollback(inner: &mut Inner, undo: Vec<Undo>) {
        for (collection, id, previous) in undo.into_iter().rev() {
            let table = inner.table_mut(collection);
            match previous {
                Some(record) => {
                    table.insert(id, record);
                },
                None => {
                    table.remove(&id);
                },
            }
        }
    }

    // ========================================================================
    // Change stream and session
    // ========================================================================

    /// Subscribes to commit events.
    ///
    /// Events published after this call are delivered in commit order. The
    /// receiver reports `Closed` once the database is closed.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<CommitEvent>> {
        match self.changes.lock().as_ref() {
            Some(tx) => tx.subscribe(),
            None => broadcast::channel(1).1,
        }
    }

    /// Closes the session.
    ///
    /// Subsequent reads and commits fail with `Error::Closed` and every change
    /// subscriber observes the end of its stream. Closing twice is a no-op.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        // Taking the write lock waits for an in-flight commit to publish.
        let _inner = self.inner.write();
        self.changes.lock().take();
        info!("Store closed");
    }

    /// Whether [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Returns commit counters and record totals.
    pub fn stats(&self) -> DatabaseStats {
        let inner = self.inner.read();
        DatabaseStats {
            seq: inner.seq,
            commits: self.commits.load(Ordering::Relaxed),
            aborts: self.aborts.load(Ordering::Relaxed),
            records: inner.collections.iter().map(BTreeMap::len).sum(),
        }
    }

    /// Returns the backend.
    pub fn backend(&self) -> &B {
        &self.backend
    }
}
