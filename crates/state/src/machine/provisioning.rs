//! Provisioning: instance identity, hardware, and constraints.

use std::collections::BTreeSet;

use keel_store::{Op, StorageBackend};
use keel_types::{Constraints, HardwareCharacteristics, Life};
use tracing::info;

use super::{Machine, NetworkInterfaceInfo, network};
use crate::{
    docs::{ConstraintsColl, InstanceDoc, Instances, Machines, machine_key},
    error::{Result, StateError},
    network::NetworkInfo,
};

/// Nonce prefix of machines provisioned by hand rather than by a provider.
pub const MANUAL_NONCE_PREFIX: &str = "manual:";

impl<B: StorageBackend + 'static> Machine<B> {
    /// Provider instance id.
    ///
    /// # Errors
    ///
    /// [`StateError::NotProvisioned`] until the provisioner has recorded one.
    pub fn instance_id(&self) -> Result<String> {
        Ok(self.instance()?.instance_id)
    }

    fn instance(&self) -> Result<InstanceDoc> {
        match self.st.db().get::<Instances>(self.doc.id.as_str())? {
            Some(record) => Ok(record.doc),
            None => Err(StateError::NotProvisioned { machine: self.doc.id.clone() }),
        }
    }

    /// Whether the machine was provisioned with `nonce`.
    ///
    /// # Errors
    ///
    /// [`StateError::Closed`] after close.
    pub fn check_provisioned(&self, nonce: &str) -> Result<bool> {
        let Some(record) = self.st.machine_record(&self.doc.id)? else {
            return Ok(false);
        };
        let provisioned = self.st.db().get::<Instances>(self.doc.id.as_str())?.is_some();
        Ok(provisioned && !nonce.is_empty() && record.doc.nonce == nonce)
    }

    /// Whether the machine was provisioned by hand.
    pub fn is_manual(&self) -> bool {
        self.doc.nonce.starts_with(MANUAL_NONCE_PREFIX)
    }

    /// Hardware of the provisioned instance.
    ///
    /// # Errors
    ///
    /// [`StateError::NotFound`] until the machine is provisioned.
    pub fn hardware_characteristics(&self) -> Result<HardwareCharacteristics> {
        match self.st.db().get::<Instances>(self.doc.id.as_str())? {
            Some(record) => Ok(record.doc.hardware),
            None => Err(StateError::not_found(format!(
                "hardware characteristics for machine {}",
                self.doc.id
            ))),
        }
    }

    /// Provider-reported instance status.
    ///
    /// # Errors
    ///
    /// [`StateError::NotProvisioned`] until the machine is provisioned.
    pub fn instance_status(&self) -> Result<String> {
        Ok(self.instance()?.status)
    }

    /// Records the provider-reported instance status.
    ///
    /// # Errors
    ///
    /// [`StateError::NotProvisioned`] until the machine is provisioned.
    pub fn set_instance_status(&self, status: &str) -> Result<()> {
        let id = self.doc.id.clone();
        let value = status.to_string();
        self.st.runner().run(|_| {
            if self.st.db().get::<Instances>(id.as_str())?.is_none() {
                return Err(StateError::NotProvisioned { machine: id.clone() });
            }
            let value = value.clone();
            Ok(Some(vec![Op::on::<Instances>(id.as_str()).exists().update(move |i| i.status = value)]))
        })
    }

    /// Records the provider instance backing this machine.
    ///
    /// # Errors
    ///
    /// See [`set_instance_info`](Self::set_instance_info).
    pub fn set_provisioned(
        &mut self,
        instance_id: &str,
        nonce: &str,
        hardware: Option<HardwareCharacteristics>,
    ) -> Result<()> {
        self.set_instance_info(instance_id, nonce, hardware, Vec::new(), Vec::new())
    }

    /// Records the provider instance, its networks, and its interfaces in
    /// one transaction.
    ///
    /// # Errors
    ///
    /// - [`StateError::NotValid`] if `instance_id` or `nonce` is empty, an
    ///   interface is malformed, the machine is dead, or it is already
    ///   provisioned.
    /// - [`StateError::NotFound`] if the machine has been removed.
    pub fn set_instance_info(
        &mut self,
        instance_id: &str,
        nonce: &str,
        hardware: Option<HardwareCharacteristics>,
        networks: Vec<NetworkInfo>,
        interfaces: Vec<NetworkInterfaceInfo>,
    ) -> Result<()> {
        let id = self.doc.id.clone();
        let what = format!("cannot set instance data for machine {:?}", id.as_str());
        if instance_id.is_empty() || nonce.is_empty() {
            return Err(StateError::not_valid(format!(
                "{what}: instance id and nonce cannot be empty"
            )));
        }
        for net in &networks {
            net.validate().map_err(|e| StateError::not_valid(format!("{what}: {e}")))?;
        }
        let mut names = BTreeSet::new();
        let mut macs = BTreeSet::new();
        for interface in &interfaces {
            if !names.insert(interface.interface_name.as_str()) {
                return Err(StateError::AlreadyExists {
                    message: format!(
                        "{what}: {:?} on machine {:?} already exists",
                        interface.interface_name,
                        id.as_str()
                    ),
                });
            }
            if !macs.insert((interface.mac_address.as_str(), interface.network_name.as_str())) {
                return Err(StateError::AlreadyExists {
                    message: format!(
                        "{what}: MAC address {:?} on network {:?} already exists",
                        interface.mac_address, interface.network_name
                    ),
                });
            }
        }
        let instance = InstanceDoc {
            instance_id: instance_id.to_string(),
            status: String::new(),
            hardware: hardware.unwrap_or_default(),
        };
        let nonce_value = nonce.to_string();
        self.st
            .runner()
            .run(|_| {
                let Some(record) = self.st.machine_record(&id)? else {
                    return Err(StateError::not_found(format!("machine {id}")));
                };
                if record.doc.life == Life::Dead {
                    return Err(StateError::not_valid(format!("{what}: machine is dead")));
                }
                if !record.doc.nonce.is_empty()
                    || self.st.db().get::<Instances>(id.as_str())?.is_some()
                {
                    return Err(StateError::not_valid(format!("{what}: already set")));
                }
                let stored_nonce = nonce_value.clone();
                let mut ops = vec![
                    Op::on::<Machines>(id.as_str())
                        .matches(|m| m.life != Life::Dead && m.nonce.is_empty())
                        .update(move |m| m.nonce = stored_nonce),
                    Op::on::<Instances>(id.as_str()).missing().insert(instance.clone()),
                ];
                for net in &networks {
                    ops.extend(crate::network::add_network_ops(self.st.db(), net)?);
                }
                for interface in &interfaces {
                    ops.extend(network::add_interface_ops(
                        &self.st,
                        &id,
                        interface,
                        &networks,
                    )?);
                }
                Ok(Some(ops))
            })
            .map_err(|e| e.with_context(what.clone()))?;
        self.doc.nonce = nonce.to_string();
        info!(machine = %id, instance_id, "Machine provisioned");
        Ok(())
    }

    // ========================================================================
    // Constraints
    // ========================================================================

    /// Constraints recorded for the provisioner.
    ///
    /// # Errors
    ///
    /// [`StateError::NotFound`] once the machine has been removed.
    pub fn constraints(&self) -> Result<Constraints> {
        match self.st.db().get::<ConstraintsColl>(&machine_key(&self.doc.id))? {
            Some(record) => Ok(record.doc),
            None => Err(StateError::not_found(format!("constraints for machine {}", self.doc.id))),
        }
    }

    /// Replaces the machine's constraints.
    ///
    /// Only permitted while the machine is alive and not yet provisioned.
    ///
    /// # Errors
    ///
    /// [`StateError::NotValid`] otherwise.
    pub fn set_constraints(&self, constraints: Constraints) -> Result<()> {
        let id = self.doc.id.clone();
        self.st
            .runner()
            .run(|_| {
                let record = self.st.machine_record(&id)?;
                let Some(record) = record.filter(|r| r.doc.life == Life::Alive) else {
                    return Err(StateError::not_valid(
                        "cannot set constraints: not found or not alive",
                    ));
                };
                if !record.doc.nonce.is_empty() {
                    return Err(StateError::not_valid(
                        "cannot set constraints: machine is already provisioned",
                    ));
                }
                let value = constraints.clone();
                Ok(Some(vec![
                    Op::on::<Machines>(id.as_str())
                        .matches(|m| m.life == Life::Alive && m.nonce.is_empty())
                        .check(),
                    Op::on::<ConstraintsColl>(machine_key(&id)).exists().update(move |c| *c = value),
                ]))
            })
            .map_err(|e| e.with_context("cannot set constraints"))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::disallowed_methods)]
mod tests {
    use keel_test_utils::test_state_config;
    use keel_types::{ErrorKind, MachineJob};

    use super::*;
    use crate::{Lifecycle, MachineTemplate, State};

    fn state() -> State {
        State::in_memory(test_state_config()).unwrap()
    }

    #[test]
    fn test_unprovisioned_machine() {
        let st = state();
        let m = st.add_machine("quantal", &[MachineJob::HostUnits]).unwrap();
        let err = m.instance_id().unwrap_err();
        assert_eq!(err.to_string(), "machine 0 not provisioned");
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert!(!m.check_provisioned("fake_nonce").unwrap());
        assert!(m.hardware_characteristics().unwrap_err().is_not_found());
    }

    #[test]
    fn test_set_provisioned_once() {
        let st = state();
        let mut m = st.add_machine("quantal", &[MachineJob::HostUnits]).unwrap();
        let hc = HardwareCharacteristics { arch: Some("amd64".into()), mem: Some(4096), ..Default::default() };
        m.set_provisioned("i-1234", "fake_nonce", Some(hc.clone())).unwrap();

        assert_eq!(m.instance_id().unwrap(), "i-1234");
        assert_eq!(m.hardware_characteristics().unwrap(), hc);
        assert!(m.check_provisioned("fake_nonce").unwrap());
        assert!(!m.check_provisioned("other").unwrap());
        assert!(!m.is_manual());

        let err = m.set_provisioned("i-5678", "fake_nonce", None).unwrap_err();
        assert_eq!(err.to_string(), r#"cannot set instance data for machine "0": already set"#);
    }

    #[test]
    fn test_set_provisioned_rejects_empty_values() {
        let st = state();
        let mut m = st.add_machine("quantal", &[MachineJob::HostUnits]).unwrap();
        let err = m.set_provisioned("", "nonce", None).unwrap_err();
        assert_eq!(
            err.to_string(),
            r#"cannot set instance data for machine "0": instance id and nonce cannot be empty"#
        );
        assert!(m.set_provisioned("i-1", "", None).is_err());
    }

    #[test]
    fn test_set_provisioned_on_dead_machine() {
        let st = state();
        let mut m = st.add_machine("quantal", &[MachineJob::HostUnits]).unwrap();
        m.ensure_dead().unwrap();
        let err = m.set_provisioned("i-1", "nonce", None).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotValid);
    }

    #[test]
    fn test_instance_status() {
        let st = state();
        let mut m = st.add_machine("quantal", &[MachineJob::HostUnits]).unwrap();
        assert!(matches!(m.set_instance_status("running"), Err(StateError::NotProvisioned { .. })));
        m.set_provisioned("i-1", "nonce", None).unwrap();
        m.set_instance_status("running").unwrap();
        assert_eq!(m.instance_status().unwrap(), "running");
    }

    #[test]
    fn test_manual_machine() {
        let st = state();
        let template = MachineTemplate::builder()
            .series("quantal")
            .jobs(vec![MachineJob::HostUnits])
            .instance_id("manual:10.0.0.1")
            .nonce("manual:10.0.0.1:abc")
            .build();
        let m = st.add_machine_with(template).unwrap();
        assert!(m.is_manual());
        assert_eq!(m.instance_id().unwrap(), "manual:10.0.0.1");
    }

    #[test]
    fn test_constraints_only_before_provisioning() {
        let st = state();
        let mut m = st.add_machine("quantal", &[MachineJob::HostUnits]).unwrap();
        assert_eq!(m.constraints().unwrap(), Constraints::default());

        let cons = Constraints { mem: Some(8192), ..Default::default() };
        m.set_constraints(cons.clone()).unwrap();
        assert_eq!(m.constraints().unwrap(), cons);

        m.set_provisioned("i-1", "nonce", None).unwrap();
        let err = m.set_constraints(Constraints::default()).unwrap_err();
        assert_eq!(err.to_string(), "cannot set constraints: machine is already provisioned");

        let mut other = st.add_machine("quantal", &[MachineJob::HostUnits]).unwrap();
        other.destroy().unwrap();
        let err = other.set_constraints(Constraints::default()).unwrap_err();
        assert_eq!(err.to_string(), "cannot set constraints: not found or not alive");
    }
}
