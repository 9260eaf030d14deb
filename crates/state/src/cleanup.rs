//! Deferred teardown queued by forced machine destruction.

use keel_store::{Op, StorageBackend};
use keel_types::{Life, MachineId};
use tracing::{debug, info, warn};

use crate::{
    docs::{CleanupDoc, Cleanups},
    error::Result,
    lifecycle::Lifecycle,
    metrics,
    state::State,
};

impl<B: StorageBackend + 'static> State<B> {
    /// Whether any cleanup work is queued.
    ///
    /// # Errors
    ///
    /// [`StateError::Closed`](crate::StateError::Closed) after close.
    pub fn needs_cleanup(&self) -> Result<bool> {
        Ok(!self.db().all::<Cleanups>()?.is_empty())
    }

    /// Processes every queued cleanup.
    ///
    /// Each cleanup record is deleted once its work succeeds. Failures are
    /// logged and the record is kept for the next call. Returns how many
    /// cleanups completed.
    ///
    /// # Errors
    ///
    /// [`StateError::Closed`](crate::StateError::Closed) after close.
    pub fn cleanup(&self) -> Result<usize> {
        let mut done = 0;
        for record in self.db().all::<Cleanups>()? {
            let outcome = match &record.doc {
                CleanupDoc::ForceDestroyMachine(id) => self.force_destroy_machine(id),
            };
            let kind = match &record.doc {
                CleanupDoc::ForceDestroyMachine(_) => "force_destroy_machine",
            };
            match outcome {
                Ok(()) => {
                    self.runner()
                        .run_once(vec![Op::on::<Cleanups>(record.id.as_str()).remove()])?;
                    metrics::record_cleanup(kind, true);
                    debug!(cleanup = %record.id, "Cleanup completed");
                    done += 1;
                },
                Err(e) => {
                    metrics::record_cleanup(kind, false);
                    warn!(cleanup = %record.id, error = %e, "Cleanup failed");
                },
            }
        }
        Ok(done)
    }

    /// Removes every unit on `id` and its containers, then marks it dead.
    ///
    /// Containers are torn down depth first and removed once dead.
    fn force_destroy_machine(&self, id: &MachineId) -> Result<()> {
        let Some(record) = self.machine_record(id)? else {
            return Ok(());
        };
        let mut machine = crate::machine::Machine::new(self.clone(), record.doc);
        if machine.life() == Life::Dead {
            return Ok(());
        }
        for child in machine.containers()? {
            self.force_destroy_machine(&child)?;
            if let Some(container) = self.machine_record(&child)? {
                let mut container = crate::machine::Machine::new(self.clone(), container.doc);
                container.remove()?;
            }
        }
        for mut unit in machine.units()? {
            if unit.is_principal() {
                unit.force_remove()?;
            }
        }
        machine.ensure_dead()?;
        info!(machine = %id, "Forced machine teardown finished");
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::disallowed_methods)]
mod tests {
    use keel_test_utils::test_state_config;
    use keel_types::{ContainerType, MachineJob};

    use super::*;
    use crate::{MachineTemplate, Removal};

    #[test]
    fn test_force_destroy_tears_down_units_and_containers() {
        let st = State::in_memory(test_state_config()).unwrap();
        let mut host = st.add_machine("quantal", &[MachineJob::HostUnits]).unwrap();
        let template =
            MachineTemplate::builder().series("quantal").jobs(vec![MachineJob::HostUnits]).build();
        let container =
            st.add_machine_inside_machine(template, host.id(), ContainerType::Lxc).unwrap();

        let wordpress = st.add_service("wordpress", false).unwrap();
        let logging = st.add_service("logging", true).unwrap();
        let mut on_host = wordpress.add_unit().unwrap();
        on_host.assign_to_machine(&host).unwrap();
        logging.add_subordinate_unit(&on_host).unwrap();
        let mut in_container = wordpress.add_unit().unwrap();
        in_container.assign_to_machine(&container).unwrap();

        assert!(!st.needs_cleanup().unwrap());
        host.force_destroy().unwrap();
        host.force_destroy().unwrap();
        assert!(st.needs_cleanup().unwrap());

        assert_eq!(st.cleanup().unwrap(), 1);
        assert!(!st.needs_cleanup().unwrap());

        host.refresh().unwrap();
        assert_eq!(host.life(), Life::Dead);
        assert!(host.containers().unwrap().is_empty());
        assert!(wordpress.all_units().unwrap().is_empty());
        assert!(logging.all_units().unwrap().is_empty());
        assert!(st.machine(container.id().as_str()).unwrap_err().is_not_found());
        assert_eq!(host.remove().unwrap(), Removal::Deleted);
    }

    #[test]
    fn test_cleanup_of_vanished_machine_completes() {
        let st = State::in_memory(test_state_config()).unwrap();
        let mut m = st.add_machine("quantal", &[MachineJob::HostUnits]).unwrap();
        m.force_destroy().unwrap();
        m.ensure_dead().unwrap();
        m.remove().unwrap();
        assert_eq!(st.cleanup().unwrap(), 1);
    }
}
