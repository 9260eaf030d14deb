//! Fan-out of the store change stream to watch loops.

use std::sync::{Arc, Weak};

use futures::{StreamExt, stream::select_all};
use keel_store::{CollectionId, CommitEvent, Database, StorageBackend};
use parking_lot::Mutex;
use tokio::{
    runtime::Handle,
    sync::broadcast::{self, error::RecvError},
};
use tokio_stream::wrappers::{BroadcastStream, errors::BroadcastStreamRecvError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{Slot, WatchSource, Watcher};
use crate::{
    error::{Result, StateError},
    metrics,
};

/// What the dispatcher forwards on a per-collection channel.
#[derive(Debug, Clone)]
enum HubEvent {
    /// A commit that touched the channel's collection.
    Commit(Arc<CommitEvent>),
    /// The dispatcher fell behind the store; recompute from scratch.
    Resync,
}

type Senders = [broadcast::Sender<HubEvent>];

/// Demultiplexes committed changes by collection and runs watch loops.
///
/// The dispatcher task starts with the first watch, so a session that never
/// watches never needs a runtime. It exits when the store closes, which
/// drops every per-collection sender and ends every watch loop.
pub(crate) struct WatcherHub<B: StorageBackend> {
    db: Arc<Database<B>>,
    capacity: usize,
    /// `None` until the dispatcher starts; dead once it has exited.
    senders: Mutex<Option<Weak<Senders>>>,
}

impl<B: StorageBackend + 'static> WatcherHub<B> {
    pub(crate) fn new(db: Arc<Database<B>>, capacity: usize) -> Self {
        Self { db, capacity, senders: Mutex::new(None) }
    }

    fn subscribe(
        &self,
        runtime: &Handle,
        collections: &[CollectionId],
    ) -> Result<Vec<broadcast::Receiver<HubEvent>>> {
        if self.db.is_closed() {
            return Err(StateError::Closed);
        }
        let mut slot = self.senders.lock();
        let senders = match slot.as_ref() {
            Some(weak) => weak.upgrade().ok_or(StateError::Closed)?,
            None => {
                let senders: Arc<Senders> = (0..CollectionId::COUNT)
                    .map(|_| broadcast::channel(self.capacity).0)
                    .collect::<Vec<_>>()
                    .into();
                *slot = Some(Arc::downgrade(&senders));
                runtime.spawn(dispatch(self.db.subscribe(), Arc::clone(&senders)));
                senders
            },
        };
        Ok(collections.iter().map(|c| senders[c.index()].subscribe()).collect())
    }

    /// Starts a watch loop for `source`.
    ///
    /// The initial value is computed here, after subscribing, and is
    /// pending on the returned watcher.
    ///
    /// # Errors
    ///
    /// - [`StateError::NotValid`] when called outside a tokio runtime.
    /// - [`StateError::Closed`] if the session is closed.
    /// - Whatever the initial read of `source` returns.
    pub(crate) fn watch<S: WatchSource<B>>(&self, mut source: S) -> Result<Watcher<S::Value>> {
        let runtime = Handle::try_current()
            .map_err(|_| StateError::not_valid("cannot start watcher: no tokio runtime running"))?;
        let receivers = self.subscribe(&runtime, &source.collections())?;
        let initial = source.initial(&self.db)?;
        let slot = Arc::new(Slot::new());
        slot.send(initial);
        let cancel = CancellationToken::new();
        let task = runtime.spawn(watch_loop(
            Arc::clone(&self.db),
            source,
            receivers,
            Arc::clone(&slot),
            cancel.clone(),
        ));
        Ok(Watcher::new(slot, cancel, task))
    }
}

async fn dispatch(mut changes: broadcast::Receiver<Arc<CommitEvent>>, senders: Arc<Senders>) {
    loop {
        match changes.recv().await {
            Ok(event) => {
                let mut seen = [false; CollectionId::COUNT];
                for change in &event.changes {
                    let idx = change.collection.index();
                    if !seen[idx] {
                        seen[idx] = true;
                        // No receivers is not an error.
                        let _ = senders[idx].send(HubEvent::Commit(Arc::clone(&event)));
                    }
                }
            },
            Err(RecvError::Lagged(skipped)) => {
                warn!(skipped, "Watcher dispatcher lagged, forcing resync");
                for sender in senders.iter() {
                    let _ = sender.send(HubEvent::Resync);
                }
            },
            Err(RecvError::Closed) => {
                debug!("Change stream closed, stopping watcher dispatcher");
                return;
            },
        }
    }
}

async fn watch_loop<B, S>(
    db: Arc<Database<B>>,
    mut source: S,
    receivers: Vec<broadcast::Receiver<HubEvent>>,
    slot: Arc<Slot<S::Value>>,
    cancel: CancellationToken,
) where
    B: StorageBackend + 'static,
    S: WatchSource<B>,
{
    metrics::watcher_started();
    let mut events = select_all(receivers.into_iter().map(BroadcastStream::new));
    loop {
        let event = tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            event = events.next() => event,
        };
        match event {
            Some(Ok(HubEvent::Commit(commit))) => {
                if !commit.changes.iter().any(|c| source.is_relevant(c)) {
                    continue;
                }
            },
            Some(Ok(HubEvent::Resync) | Err(BroadcastStreamRecvError::Lagged(_))) => {
                metrics::record_watcher_resync();
            },
            None => {
                slot.close(Some(StateError::Closed));
                break;
            },
        }
        match source.changed(&db) {
            Ok(Some(value)) => {
                if !slot.send(value) {
                    break;
                }
            },
            Ok(None) => {},
            Err(StateError::Closed) => {
                slot.close(Some(StateError::Closed));
                break;
            },
            Err(e) => {
                warn!(error = %e, "Watch failed");
                slot.close(Some(e));
                break;
            },
        }
    }
    slot.close(None);
    metrics::watcher_stopped();
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::disallowed_methods)]
mod tests {
    use std::time::Duration;

    use keel_store::Op;
    use keel_types::{Life, MachineId};

    use super::*;
    use crate::{
        docs::{MachineDoc, Machines},
        watcher::{Coalesce, EntityWatch},
    };

    fn machine(id: &str) -> MachineDoc {
        MachineDoc {
            id: MachineId::new(id),
            series: "quantal".into(),
            jobs: Vec::new(),
            life: Life::Alive,
            principals: Vec::new(),
            has_vote: false,
            wants_vote: false,
            clean: true,
            nonce: String::new(),
            addresses: Vec::new(),
            machine_addresses: Vec::new(),
            supported_containers: None,
            agent_version: None,
        }
    }

    fn hub() -> (Arc<Database>, WatcherHub<keel_store::InMemoryBackend>) {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let hub = WatcherHub::new(Arc::clone(&db), 16);
        (db, hub)
    }

    async fn next_within<T: Coalesce>(w: &mut Watcher<T>) -> Option<T> {
        tokio::time::timeout(Duration::from_secs(5), w.next()).await.unwrap()
    }

    #[tokio::test]
    async fn test_entity_watch_ignores_other_ids() {
        let (db, hub) = hub();
        db.commit(vec![Op::on::<Machines>("0").insert(machine("0"))]).unwrap();
        let mut w = hub.watch(EntityWatch::new(vec![(CollectionId::Machines, "0".into())])).unwrap();
        next_within(&mut w).await.unwrap();

        db.commit(vec![Op::on::<Machines>("1").insert(machine("1"))]).unwrap();
        db.commit(vec![Op::on::<Machines>("0").update(|m| m.clean = false)]).unwrap();
        next_within(&mut w).await.unwrap();
        assert!(tokio::time::timeout(Duration::from_millis(50), w.next()).await.is_err());

        w.stop().await;
        assert!(w.is_closed());
        assert_eq!(w.next().await, None);
        assert!(w.take_error().is_none());
    }

    #[test]
    fn test_watch_outside_runtime_is_refused() {
        let (db, hub) = hub();
        db.commit(vec![Op::on::<Machines>("0").insert(machine("0"))]).unwrap();
        let err = hub.watch(EntityWatch::new(vec![(CollectionId::Machines, "0".into())])).unwrap_err();
        assert!(matches!(err, StateError::NotValid { .. }));
        assert_eq!(err.to_string(), "cannot start watcher: no tokio runtime running");
        // The dispatcher was never started.
        assert!(hub.senders.lock().is_none());
    }

    #[tokio::test]
    async fn test_close_ends_every_watch() {
        let (db, hub) = hub();
        let mut a = hub.watch(EntityWatch::new(vec![(CollectionId::Machines, "0".into())])).unwrap();
        let mut b = hub.watch(EntityWatch::new(vec![(CollectionId::Units, "u/0".into())])).unwrap();
        next_within(&mut a).await.unwrap();
        next_within(&mut b).await.unwrap();

        db.close();
        assert_eq!(next_within(&mut a).await, None);
        assert_eq!(next_within(&mut b).await, None);
        assert!(matches!(a.take_error(), Some(StateError::Closed)));

        let err = hub.watch(EntityWatch::new(vec![(CollectionId::Machines, "0".into())]));
        assert!(matches!(err, Err(StateError::Closed)));
    }
}
