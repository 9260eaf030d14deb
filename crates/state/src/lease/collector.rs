//! Background removal of expired lease records.
//!
//! Expired claims already read as free, so collection only bounds storage
//! and tells lease watchers that a name was let go. Each record is removed
//! with a revno assertion so a claim renewed between the scan and the
//! commit survives.

use std::{sync::Arc, time::Duration};

use keel_store::{Database, InMemoryBackend, Op, StorageBackend};
use keel_types::Clock;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    docs::Leases,
    error::{Result, StateError},
    metrics,
    state::State,
    txn::TxnRunner,
};

/// Shortest cycle interval accepted by [`LeaseExpiryCollector::with_interval`].
const MIN_INTERVAL: Duration = Duration::from_millis(1);

/// Periodically deletes expired lease records in every namespace.
pub struct LeaseExpiryCollector<B: StorageBackend = InMemoryBackend> {
    db: Arc<Database<B>>,
    runner: Arc<TxnRunner<B>>,
    clock: Arc<dyn Clock>,
    /// Time between cycles.
    interval: Duration,
    /// Maximum records removed per cycle.
    max_batch_size: usize,
}

impl<B: StorageBackend + 'static> LeaseExpiryCollector<B> {
    /// Creates a collector using the session's lease configuration.
    pub fn new(state: &State<B>) -> Self {
        let config = &state.config().lease;
        Self {
            db: Arc::clone(state.db()),
            runner: Arc::clone(state.runner()),
            clock: state.clock(),
            interval: config.gc_interval,
            max_batch_size: config.gc_batch_size,
        }
    }

    /// Overrides the cycle interval, raised to at least one millisecond.
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval.max(MIN_INTERVAL);
        self
    }

    /// Removes up to one batch of expired leases.
    ///
    /// Records renewed or removed concurrently are skipped. Returns how many
    /// were removed.
    ///
    /// # Errors
    ///
    /// [`StateError::Closed`] after close.
    pub fn run_cycle(&self) -> Result<usize> {
        let now = self.clock.now();
        let expired = self.db.find::<Leases>(|l| !l.is_live(now))?;
        let mut removed = 0;
        for record in expired.into_iter().take(self.max_batch_size) {
            match self
                .runner
                .run_once(vec![Op::on::<Leases>(record.id.as_str()).revno(record.revno).remove()])
            {
                Ok(_) => removed += 1,
                Err(e) if e.is_aborted() => {
                    debug!(lease = %record.id, "Lease changed during collection, skipping");
                },
                Err(e) => return Err(StateError::from(e)),
            }
        }
        if removed > 0 {
            metrics::record_leases_expired(removed);
            info!(count = removed, "Collected expired leases");
        }
        Ok(removed)
    }

    /// Starts the collector on the current tokio runtime.
    ///
    /// The task exits when `cancel` fires or the session closes.
    pub fn start(self, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval(self.interval);
            loop {
                tokio::select! {
                    () = cancel.cancelled() => {
                        debug!("Lease collector cancelled");
                        return;
                    }
                    _ = ticker.tick() => {}
                }
                match self.run_cycle() {
                    Ok(_) => {},
                    Err(StateError::Closed) => {
                        debug!("Lease collector stopping, state closed");
                        return;
                    },
                    Err(e) => warn!(error = %e, "Lease collection cycle failed"),
                }
            }
        })
    }
}
