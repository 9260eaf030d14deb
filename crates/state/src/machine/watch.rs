//! Watches scoped to one machine.

use std::collections::BTreeSet;

use keel_store::{CollectionId, StorageBackend};
use keel_types::StatusInfo;

use super::Machine;
use crate::{
    docs::machine_key,
    error::Result,
    watcher::{EntityWatch, InterfacesWatch, StatusWatch, UnitsWatch, Watcher},
};

impl<B: StorageBackend + 'static> Machine<B> {
    /// Notifies whenever the machine record changes.
    ///
    /// # Errors
    ///
    /// [`StateError::Closed`](crate::StateError::Closed) after close, or
    /// [`StateError::NotValid`](crate::StateError::NotValid) outside a tokio
    /// runtime.
    pub fn watch(&self) -> Result<Watcher<()>> {
        self.st.hub().watch(EntityWatch::new(vec![(CollectionId::Machines, self.doc.id.to_string())]))
    }

    /// Delivers the machine's agent status whenever it changes.
    ///
    /// # Errors
    ///
    /// [`StateError::Closed`](crate::StateError::Closed) after close, or
    /// [`StateError::NotValid`](crate::StateError::NotValid) outside a tokio
    /// runtime.
    pub fn watch_status(&self) -> Result<Watcher<StatusInfo>> {
        self.st.hub().watch(StatusWatch::new(machine_key(&self.doc.id)))
    }

    /// Reports principal and subordinate units on this machine whose life
    /// changed, or that were assigned or unassigned.
    ///
    /// The first event names every unit currently on the machine.
    ///
    /// # Errors
    ///
    /// [`StateError::Closed`](crate::StateError::Closed) after close, or
    /// [`StateError::NotValid`](crate::StateError::NotValid) outside a tokio
    /// runtime.
    pub fn watch_units(&self) -> Result<Watcher<BTreeSet<String>>> {
        self.st.hub().watch(UnitsWatch::new(self.doc.id.clone(), false))
    }

    /// Like [`watch_units`](Self::watch_units), ignoring subordinates.
    ///
    /// # Errors
    ///
    /// [`StateError::Closed`](crate::StateError::Closed) after close, or
    /// [`StateError::NotValid`](crate::StateError::NotValid) outside a tokio
    /// runtime.
    pub fn watch_principal_units(&self) -> Result<Watcher<BTreeSet<String>>> {
        self.st.hub().watch(UnitsWatch::new(self.doc.id.clone(), true))
    }

    /// Notifies when a network interface of this machine is added, removed,
    /// enabled, or disabled.
    ///
    /// # Errors
    ///
    /// [`StateError::Closed`](crate::StateError::Closed) after close, or
    /// [`StateError::NotValid`](crate::StateError::NotValid) outside a tokio
    /// runtime.
    pub fn watch_interfaces(&self) -> Result<Watcher<()>> {
        self.st.hub().watch(InterfacesWatch::new(self.doc.id.clone()))
    }
}
