//! Lease storage and the claim protocol.

use std::{collections::BTreeMap, fmt, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use keel_store::{Database, InMemoryBackend, Op, StorageBackend};
use keel_types::Clock;
use tracing::{debug, info};

use super::{LeaseError, Secretary};
use crate::{
    docs::{LeaseDoc, Leases, lease_key},
    metrics,
    txn::TxnRunner,
};

/// A live claim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseInfo {
    /// Current holder.
    pub holder: String,
    /// When the holder first claimed the lease.
    pub start: DateTime<Utc>,
    /// When the claim lapses unless extended.
    pub expiry: DateTime<Utc>,
}

impl From<LeaseDoc> for LeaseInfo {
    fn from(doc: LeaseDoc) -> Self {
        Self { holder: doc.holder, start: doc.start, expiry: doc.expiry }
    }
}

/// Stores and arbitrates the leases of one namespace.
pub struct LeaseManager<B: StorageBackend = InMemoryBackend> {
    db: Arc<Database<B>>,
    runner: Arc<TxnRunner<B>>,
    namespace: String,
    secretary: Arc<dyn Secretary>,
    clock: Arc<dyn Clock>,
    poll_interval: Duration,
}

impl<B: StorageBackend> Clone for LeaseManager<B> {
    fn clone(&self) -> Self {
        Self {
            db: Arc::clone(&self.db),
            runner: Arc::clone(&self.runner),
            namespace: self.namespace.clone(),
            secretary: Arc::clone(&self.secretary),
            clock: Arc::clone(&self.clock),
            poll_interval: self.poll_interval,
        }
    }
}

impl<B: StorageBackend> fmt::Debug for LeaseManager<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LeaseManager")
            .field("namespace", &self.namespace)
            .field("secretary", &self.secretary)
            .finish_non_exhaustive()
    }
}

impl<B: StorageBackend + 'static> LeaseManager<B> {
    pub(crate) fn new(
        db: Arc<Database<B>>,
        runner: Arc<TxnRunner<B>>,
        namespace: &str,
        secretary: Arc<dyn Secretary>,
        clock: Arc<dyn Clock>,
        poll_interval: Duration,
    ) -> Self {
        Self { db, runner, namespace: namespace.to_string(), secretary, clock, poll_interval }
    }

    /// Namespace this manager arbitrates.
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    fn validate(&self, name: &str, holder: &str, duration: Duration) -> Result<(), LeaseError> {
        let checked = self
            .secretary
            .check_lease(name)
            .and_then(|()| self.secretary.check_holder(holder))
            .and_then(|()| self.secretary.check_duration(duration));
        if checked.is_err() {
            metrics::record_lease_claim(&self.namespace, "invalid");
        }
        checked
    }

    fn expiry_after(now: DateTime<Utc>, duration: Duration) -> Result<DateTime<Utc>, LeaseError> {
        chrono::Duration::from_std(duration)
            .ok()
            .and_then(|d| now.checked_add_signed(d))
            .ok_or_else(|| LeaseError::NotValid {
                message: format!("lease duration {duration:?} out of range"),
            })
    }

    fn denied(&self, name: &str, holder: &str) -> LeaseError {
        metrics::record_lease_claim(&self.namespace, "denied");
        debug!(namespace = %self.namespace, lease = name, holder, "Lease claim denied");
        LeaseError::Denied { lease: name.to_string(), holder: holder.to_string() }
    }

    /// Commits a single lease op; an abort means someone else got there first.
    fn commit(&self, op: Op, name: &str, holder: &str) -> Result<(), LeaseError> {
        match self.runner.run_once(vec![op]) {
            Ok(_) => Ok(()),
            Err(e) if e.is_aborted() => Err(self.denied(name, holder)),
            Err(e) => Err(e.into()),
        }
    }

    /// Claims `name` for `holder` until `duration` from now.
    ///
    /// A holder reclaiming its own live lease extends it; the expiry never
    /// moves backwards.
    ///
    /// # Errors
    ///
    /// - [`LeaseError::NotValid`] if the secretary rejects the request; no
    ///   storage is touched.
    /// - [`LeaseError::Denied`] if another holder has a live claim or a
    ///   concurrent claim committed first.
    pub fn claim(&self, name: &str, holder: &str, duration: Duration) -> Result<(), LeaseError> {
        self.validate(name, holder, duration)?;
        let now = self.clock.now();
        let expiry = Self::expiry_after(now, duration)?;
        let key = lease_key(&self.namespace, name);
        let op = match self.db.get::<Leases>(&key)? {
            Some(current) if current.doc.is_live(now) && current.doc.holder != holder => {
                return Err(self.denied(name, holder));
            },
            Some(current) if current.doc.is_live(now) => Op::on::<Leases>(key.as_str())
                .revno(current.revno)
                .update(move |l| l.expiry = l.expiry.max(expiry)),
            Some(current) => {
                let holder = holder.to_string();
                Op::on::<Leases>(key.as_str()).revno(current.revno).update(move |l| {
                    l.holder = holder;
                    l.start = now;
                    l.expiry = expiry;
                })
            },
            None => Op::on::<Leases>(key.as_str()).missing().insert(LeaseDoc {
                namespace: self.namespace.clone(),
                name: name.to_string(),
                holder: holder.to_string(),
                start: now,
                expiry,
            }),
        };
        self.commit(op, name, holder)?;
        metrics::record_lease_claim(&self.namespace, "granted");
        info!(namespace = %self.namespace, lease = name, holder, %expiry, "Lease claimed");
        Ok(())
    }

    /// Extends `holder`'s live claim on `name` to `duration` from now.
    ///
    /// # Errors
    ///
    /// - [`LeaseError::NotValid`] if the secretary rejects the request.
    /// - [`LeaseError::Denied`] if `holder` does not hold a live claim.
    pub fn extend(&self, name: &str, holder: &str, duration: Duration) -> Result<(), LeaseError> {
        self.validate(name, holder, duration)?;
        let now = self.clock.now();
        let expiry = Self::expiry_after(now, duration)?;
        let key = lease_key(&self.namespace, name);
        let Some(current) = self.db.get::<Leases>(&key)? else {
            return Err(self.denied(name, holder));
        };
        if !current.doc.is_live(now) || current.doc.holder != holder {
            return Err(self.denied(name, holder));
        }
        let op = Op::on::<Leases>(key.as_str())
            .revno(current.revno)
            .update(move |l| l.expiry = l.expiry.max(expiry));
        self.commit(op, name, holder)?;
        debug!(namespace = %self.namespace, lease = name, holder, %expiry, "Lease extended");
        Ok(())
    }

    /// Gives up `holder`'s claim on `name`.
    ///
    /// Releasing a lease nobody holds is a no-op.
    ///
    /// # Errors
    ///
    /// [`LeaseError::Denied`] if the lease is held by someone else.
    pub fn release(&self, name: &str, holder: &str) -> Result<(), LeaseError> {
        let key = lease_key(&self.namespace, name);
        let Some(current) = self.db.get::<Leases>(&key)? else {
            return Ok(());
        };
        if current.doc.holder != holder {
            return Err(self.denied(name, holder));
        }
        self.commit(Op::on::<Leases>(key.as_str()).revno(current.revno).remove(), name, holder)?;
        info!(namespace = %self.namespace, lease = name, holder, "Lease released");
        Ok(())
    }

    /// Holder of the live claim on `name`, if any.
    ///
    /// # Errors
    ///
    /// [`LeaseError::Closed`] after close.
    pub fn holder(&self, name: &str) -> Result<Option<String>, LeaseError> {
        let now = self.clock.now();
        Ok(self
            .db
            .get::<Leases>(&lease_key(&self.namespace, name))?
            .filter(|r| r.doc.is_live(now))
            .map(|r| r.doc.holder))
    }

    /// Every live claim in the namespace, keyed by lease name.
    ///
    /// # Errors
    ///
    /// [`LeaseError::Closed`] after close.
    pub fn leases(&self) -> Result<BTreeMap<String, LeaseInfo>, LeaseError> {
        let now = self.clock.now();
        let namespace = self.namespace.clone();
        let records = self.db.find::<Leases>(move |l| l.namespace == namespace && l.is_live(now))?;
        Ok(records.into_iter().map(|r| (r.doc.name.clone(), r.doc.into())).collect())
    }

    /// Resolves once `name` has no live claim.
    ///
    /// Re-reads the lease every poll interval.
    ///
    /// # Errors
    ///
    /// [`LeaseError::Closed`] if the session closes while waiting.
    pub async fn wait_until_expired(&self, name: &str) -> Result<(), LeaseError> {
        loop {
            if self.holder(name)?.is_none() {
                return Ok(());
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }
}
