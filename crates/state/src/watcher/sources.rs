//! The kinds of things a watcher can observe.

use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
};

use keel_store::{Change, CollectionId, Database, StorageBackend};
use keel_types::{Clock, Life, MachineId, StatusInfo};

use super::WatchSource;
use crate::{
    docs::{Interfaces, Leases, Machines, Statuses, Units},
    error::Result,
};

// ============================================================================
// Single records
// ============================================================================

/// Notifies when any of a fixed set of records is written or removed.
pub(crate) struct EntityWatch {
    targets: Vec<(CollectionId, String)>,
    revnos: Vec<Option<u64>>,
}

impl EntityWatch {
    pub(crate) fn new(targets: Vec<(CollectionId, String)>) -> Self {
        Self { targets, revnos: Vec::new() }
    }

    fn read<B: StorageBackend>(&self, db: &Database<B>) -> Result<Vec<Option<u64>>> {
        self.targets.iter().map(|(collection, id)| Ok(db.revno(*collection, id)?)).collect()
    }
}

impl<B: StorageBackend + 'static> WatchSource<B> for EntityWatch {
    type Value = ();

    fn collections(&self) -> Vec<CollectionId> {
        let set: BTreeSet<_> = self.targets.iter().map(|(c, _)| *c).collect();
        set.into_iter().collect()
    }

    fn is_relevant(&self, change: &Change) -> bool {
        self.targets.iter().any(|(c, id)| *c == change.collection && *id == change.id)
    }

    fn initial(&mut self, db: &Database<B>) -> Result<()> {
        self.revnos = self.read(db)?;
        Ok(())
    }

    fn changed(&mut self, db: &Database<B>) -> Result<Option<()>> {
        let revnos = self.read(db)?;
        if revnos == self.revnos {
            return Ok(None);
        }
        self.revnos = revnos;
        Ok(Some(()))
    }
}

/// Delivers an entity's status whenever it changes.
pub(crate) struct StatusWatch {
    key: String,
    last: Option<StatusInfo>,
}

impl StatusWatch {
    pub(crate) fn new(key: String) -> Self {
        Self { key, last: None }
    }

    fn read<B: StorageBackend>(&self, db: &Database<B>) -> Result<StatusInfo> {
        Ok(db.get::<Statuses>(&self.key)?.map(|r| r.doc).unwrap_or_default())
    }
}

impl<B: StorageBackend + 'static> WatchSource<B> for StatusWatch {
    type Value = StatusInfo;

    fn collections(&self) -> Vec<CollectionId> {
        vec![CollectionId::Statuses]
    }

    fn is_relevant(&self, change: &Change) -> bool {
        change.collection == CollectionId::Statuses && change.id == self.key
    }

    fn initial(&mut self, db: &Database<B>) -> Result<StatusInfo> {
        let status = self.read(db)?;
        self.last = Some(status.clone());
        Ok(status)
    }

    fn changed(&mut self, db: &Database<B>) -> Result<Option<StatusInfo>> {
        let status = self.read(db)?;
        if self.last.as_ref() == Some(&status) {
            return Ok(None);
        }
        self.last = Some(status.clone());
        Ok(Some(status))
    }
}

// ============================================================================
// Record sets
// ============================================================================

/// Reports units on a machine whose life changed, that arrived, or that
/// left while not yet dead.
///
/// A dead unit disappearing is its expected end and is not reported.
pub(crate) struct UnitsWatch {
    machine: MachineId,
    principals_only: bool,
    known: BTreeMap<String, Life>,
}

impl UnitsWatch {
    pub(crate) fn new(machine: MachineId, principals_only: bool) -> Self {
        Self { machine, principals_only, known: BTreeMap::new() }
    }

    fn read<B: StorageBackend>(&self, db: &Database<B>) -> Result<BTreeMap<String, Life>> {
        let mut units = BTreeMap::new();
        let Some(machine) = db.get::<Machines>(self.machine.as_str())? else {
            return Ok(units);
        };
        for principal in &machine.doc.principals {
            let Some(unit) = db.get::<Units>(principal.as_str())? else {
                continue;
            };
            if !self.principals_only {
                for sub in &unit.doc.subordinates {
                    if let Some(sub) = db.get::<Units>(sub.as_str())? {
                        units.insert(sub.doc.name.to_string(), sub.doc.life);
                    }
                }
            }
            units.insert(unit.doc.name.to_string(), unit.doc.life);
        }
        Ok(units)
    }
}

impl<B: StorageBackend + 'static> WatchSource<B> for UnitsWatch {
    type Value = BTreeSet<String>;

    fn collections(&self) -> Vec<CollectionId> {
        vec![CollectionId::Machines, CollectionId::Units]
    }

    fn is_relevant(&self, change: &Change) -> bool {
        match change.collection {
            CollectionId::Machines => change.id == self.machine.as_str(),
            CollectionId::Units => true,
            _ => false,
        }
    }

    fn initial(&mut self, db: &Database<B>) -> Result<BTreeSet<String>> {
        self.known = self.read(db)?;
        Ok(self.known.keys().cloned().collect())
    }

    fn changed(&mut self, db: &Database<B>) -> Result<Option<BTreeSet<String>>> {
        let current = self.read(db)?;
        let mut changed: BTreeSet<String> = current
            .iter()
            .filter(|(name, life)| self.known.get(*name) != Some(*life))
            .map(|(name, _)| name.clone())
            .collect();
        changed.extend(
            self.known
                .iter()
                .filter(|(name, life)| **life != Life::Dead && !current.contains_key(*name))
                .map(|(name, _)| name.clone()),
        );
        self.known = current;
        Ok((!changed.is_empty()).then_some(changed))
    }
}

/// Notifies when a machine's network interfaces are added, removed, or
/// toggled.
pub(crate) struct InterfacesWatch {
    machine: MachineId,
    known: BTreeMap<String, bool>,
}

impl InterfacesWatch {
    pub(crate) fn new(machine: MachineId) -> Self {
        Self { machine, known: BTreeMap::new() }
    }

    fn read<B: StorageBackend>(&self, db: &Database<B>) -> Result<BTreeMap<String, bool>> {
        let machine = self.machine.clone();
        let records = db.find::<Interfaces>(move |i| i.machine_id == machine)?;
        Ok(records.into_iter().map(|r| (r.id, r.doc.disabled)).collect())
    }
}

impl<B: StorageBackend + 'static> WatchSource<B> for InterfacesWatch {
    type Value = ();

    fn collections(&self) -> Vec<CollectionId> {
        vec![CollectionId::Interfaces]
    }

    fn initial(&mut self, db: &Database<B>) -> Result<()> {
        self.known = self.read(db)?;
        Ok(())
    }

    fn changed(&mut self, db: &Database<B>) -> Result<Option<()>> {
        let current = self.read(db)?;
        if current == self.known {
            return Ok(None);
        }
        self.known = current;
        Ok(Some(()))
    }
}

/// Reports lease names in a namespace whose holder changed.
///
/// An expired claim counts as released once its record is collected or
/// re-claimed.
pub(crate) struct LeasesWatch {
    namespace: String,
    prefix: String,
    clock: Arc<dyn Clock>,
    holders: BTreeMap<String, String>,
}

impl LeasesWatch {
    pub(crate) fn new(namespace: &str, clock: Arc<dyn Clock>) -> Self {
        Self {
            namespace: namespace.to_string(),
            prefix: format!("{namespace}#"),
            clock,
            holders: BTreeMap::new(),
        }
    }

    fn read<B: StorageBackend>(&self, db: &Database<B>) -> Result<BTreeMap<String, String>> {
        let now = self.clock.now();
        let namespace = self.namespace.clone();
        let records = db.find::<Leases>(move |l| l.namespace == namespace && l.is_live(now))?;
        Ok(records.into_iter().map(|r| (r.doc.name, r.doc.holder)).collect())
    }
}

impl<B: StorageBackend + 'static> WatchSource<B> for LeasesWatch {
    type Value = BTreeSet<String>;

    fn collections(&self) -> Vec<CollectionId> {
        vec![CollectionId::Leases]
    }

    fn is_relevant(&self, change: &Change) -> bool {
        change.collection == CollectionId::Leases && change.id.starts_with(&self.prefix)
    }

    fn initial(&mut self, db: &Database<B>) -> Result<BTreeSet<String>> {
        self.holders = self.read(db)?;
        Ok(self.holders.keys().cloned().collect())
    }

    fn changed(&mut self, db: &Database<B>) -> Result<Option<BTreeSet<String>>> {
        let current = self.read(db)?;
        let mut changed: BTreeSet<String> = current
            .iter()
            .filter(|(name, holder)| self.holders.get(*name) != Some(*holder))
            .map(|(name, _)| name.clone())
            .collect();
        changed.extend(self.holders.keys().filter(|name| !current.contains_key(*name)).cloned());
        self.holders = current;
        Ok((!changed.is_empty()).then_some(changed))
    }
}
