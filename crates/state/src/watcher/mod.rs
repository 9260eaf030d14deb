//! Change notification.
//!
//! A [`Watcher`] delivers one initial value describing the current state of
//! what it watches, then a new value after every commit that changes it.
//! Delivery goes through a single slot: a value nobody has taken yet is
//! merged with the next one by [`Coalesce`] instead of queueing behind it.
//! Notify-style watches therefore collapse bursts into one wake-up, and
//! name-set watches accumulate the union of everything that changed.
//!
//! The channel closes once, when the watcher is stopped or dropped or when
//! the state session closes. A closed watcher is terminal; use
//! [`Watcher::take_error`] to learn whether it ended on a failure.

mod hub;
mod sources;

use std::{collections::BTreeSet, fmt, sync::Arc};

use keel_store::{Change, CollectionId, Database, StorageBackend};
use keel_types::StatusInfo;
use parking_lot::Mutex;
use tokio::{sync::Notify, task::JoinHandle};
use tokio_util::sync::CancellationToken;

pub(crate) use hub::WatcherHub;
pub(crate) use sources::{EntityWatch, InterfacesWatch, LeasesWatch, StatusWatch, UnitsWatch};

use crate::error::{Result, StateError};

/// How an undelivered value absorbs a newer one.
pub trait Coalesce: Send + 'static {
    /// Merges `newer` into `self`. The default keeps only `newer`.
    fn coalesce(&mut self, newer: Self)
    where
        Self: Sized,
    {
        *self = newer;
    }
}

impl Coalesce for () {}

impl Coalesce for StatusInfo {}

impl Coalesce for BTreeSet<String> {
    fn coalesce(&mut self, newer: Self) {
        self.extend(newer);
    }
}

/// What a watch observes and how it turns commits into values.
///
/// `initial` is called once after the watch has subscribed, so no commit is
/// missed between the two. `changed` is called after every relevant commit
/// (or after a lagged receiver forced a resync) and returns `None` when the
/// value of interest did not change.
pub(crate) trait WatchSource<B: StorageBackend>: Send + 'static {
    type Value: Coalesce + Clone + fmt::Debug;

    /// Collections whose commits can change the value.
    fn collections(&self) -> Vec<CollectionId>;

    /// Whether `change` can affect the value.
    fn is_relevant(&self, change: &Change) -> bool {
        self.collections().contains(&change.collection)
    }

    fn initial(&mut self, db: &Database<B>) -> Result<Self::Value>;

    fn changed(&mut self, db: &Database<B>) -> Result<Option<Self::Value>>;
}

// ============================================================================
// Delivery slot
// ============================================================================

struct SlotState<T> {
    pending: Option<T>,
    closed: bool,
    error: Option<StateError>,
}

/// Single-value mailbox shared by a watch loop and its [`Watcher`].
pub(crate) struct Slot<T> {
    state: Mutex<SlotState<T>>,
    notify: Notify,
}

impl<T: Coalesce> Slot<T> {
    pub(crate) fn new() -> Self {
        Self {
            state: Mutex::new(SlotState { pending: None, closed: false, error: None }),
            notify: Notify::new(),
        }
    }

    /// Stores `value`, merging it into any undelivered one.
    ///
    /// Returns false once the slot is closed.
    pub(crate) fn send(&self, value: T) -> bool {
        {
            let mut state = self.state.lock();
            if state.closed {
                return false;
            }
            match state.pending.as_mut() {
                Some(pending) => pending.coalesce(value),
                None => state.pending = Some(value),
            }
        }
        self.notify.notify_one();
        true
    }

    /// Closes the slot. Only the first call has any effect.
    pub(crate) fn close(&self, error: Option<StateError>) {
        {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            state.error = error;
        }
        self.notify.notify_one();
    }

    fn discard(&self) {
        self.state.lock().pending = None;
    }

    fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    fn take_error(&self) -> Option<StateError> {
        self.state.lock().error.take()
    }

    async fn recv(&self) -> Option<T> {
        loop {
            {
                let mut state = self.state.lock();
                if let Some(value) = state.pending.take() {
                    return Some(value);
                }
                if state.closed {
                    return None;
                }
            }
            // notify_one stores a permit, so a send between the check and
            // this await still wakes us.
            self.notify.notified().await;
        }
    }
}

// ============================================================================
// Watcher handle
// ============================================================================

/// Receiving end of a watch.
///
/// Dropping the handle cancels the watch.
pub struct Watcher<T: Coalesce> {
    slot: Arc<Slot<T>>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl<T: Coalesce> fmt::Debug for Watcher<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Watcher").field("closed", &self.slot.is_closed()).finish_non_exhaustive()
    }
}

impl<T: Coalesce> Watcher<T> {
    pub(crate) fn new(
        slot: Arc<Slot<T>>,
        cancel: CancellationToken,
        task: JoinHandle<()>,
    ) -> Self {
        Self { slot, cancel, task: Some(task) }
    }

    /// Waits for the next value.
    ///
    /// Returns `None` once the watcher is closed; it never yields again.
    pub async fn next(&mut self) -> Option<T> {
        self.slot.recv().await
    }

    /// Stops the watch and waits for its loop to exit.
    ///
    /// Undelivered values are dropped. Stopping twice is a no-op.
    pub async fn stop(&mut self) {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
        self.slot.close(None);
        self.slot.discard();
    }

    /// Whether the channel has closed.
    pub fn is_closed(&self) -> bool {
        self.slot.is_closed()
    }

    /// Takes the error that ended the watch, if it ended on one.
    ///
    /// A watch ended by [`stop`](Self::stop) has no error; one ended by the
    /// session closing reports [`StateError::Closed`].
    pub fn take_error(&self) -> Option<StateError> {
        self.slot.take_error()
    }
}

impl<T: Coalesce> Drop for Watcher<T> {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::disallowed_methods)]
mod tests {
    use super::*;

    fn names(items: &[&str]) -> BTreeSet<String> {
        items.iter().map(|s| (*s).to_string()).collect()
    }

    #[tokio::test]
    async fn test_slot_unions_name_sets() {
        let slot = Slot::new();
        assert!(slot.send(names(&["a"])));
        assert!(slot.send(names(&["b", "c"])));
        assert_eq!(slot.recv().await.unwrap(), names(&["a", "b", "c"]));

        slot.close(None);
        assert!(!slot.send(names(&["d"])));
        assert_eq!(slot.recv().await, None);
    }

    #[tokio::test]
    async fn test_slot_replaces_status() {
        let slot = Slot::new();
        slot.send(StatusInfo { info: "first".into(), ..StatusInfo::default() });
        slot.send(StatusInfo { info: "second".into(), ..StatusInfo::default() });
        assert_eq!(slot.recv().await.unwrap().info, "second");
    }

    #[tokio::test]
    async fn test_pending_value_survives_close_once() {
        let slot = Slot::new();
        slot.send(());
        slot.close(Some(StateError::Closed));
        slot.close(None);
        assert_eq!(slot.recv().await, Some(()));
        assert_eq!(slot.recv().await, None);
        assert!(matches!(slot.take_error(), Some(StateError::Closed)));
        assert!(slot.take_error().is_none());
    }

    #[tokio::test]
    async fn test_recv_wakes_on_send() {
        let slot = Arc::new(Slot::new());
        let receiver = Arc::clone(&slot);
        let handle = tokio::spawn(async move { receiver.recv().await });
        tokio::task::yield_now().await;
        slot.send(());
        assert_eq!(handle.await.unwrap(), Some(()));
    }
}
