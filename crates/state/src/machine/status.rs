//! Machine agent status and container support.

use std::collections::BTreeMap;

use keel_store::{Op, StorageBackend};
use keel_types::{ContainerType, Life, Status, StatusInfo};
use tracing::warn;

use super::Machine;
use crate::{
    docs::{ContainerRefs, Instances, Machines, Statuses, machine_key},
    error::{Result, StateError},
    status::{self, StatusOwner},
};

impl<B: StorageBackend + 'static> Machine<B> {
    /// Current agent status.
    ///
    /// # Errors
    ///
    /// [`StateError::NotFound`] once the machine has been removed.
    pub fn status(&self) -> Result<StatusInfo> {
        match self.st.db().get::<Statuses>(&machine_key(&self.doc.id))? {
            Some(record) => Ok(record.doc),
            None => Err(StateError::not_found(format!("status for machine {}", self.doc.id))),
        }
    }

    /// Sets the agent status.
    ///
    /// # Errors
    ///
    /// [`StateError::NotValid`] for statuses an agent may not set, or if the
    /// machine is dead or gone.
    pub fn set_status(
        &self,
        status: Status,
        info: &str,
        data: BTreeMap<String, String>,
    ) -> Result<()> {
        status::validate(StatusOwner::Machine, status, info)?;
        let id = self.doc.id.clone();
        let value = status::info(status, info, data);
        self.st
            .runner()
            .run(|_| {
                let alive = self.st.machine_record(&id)?.is_some_and(|r| r.doc.life != Life::Dead);
                if !alive {
                    return Err(StateError::not_valid(format!(
                        "cannot set status of machine {:?}: not found or not alive",
                        id.as_str()
                    )));
                }
                let provisioned = self.st.db().get::<Instances>(id.as_str())?.is_some();
                if status == Status::Pending && provisioned {
                    return Err(StateError::not_valid(format!(
                        "cannot set invalid status {:?}",
                        status.as_str()
                    )));
                }
                let value = value.clone();
                Ok(Some(vec![
                    Op::on::<Machines>(id.as_str()).matches(|m| m.life != Life::Dead).check(),
                    Op::on::<Statuses>(machine_key(&id)).exists().update(move |s| *s = value),
                ]))
            })
            .map_err(|e| e.with_context(format!("cannot set status of machine {id}")))
    }

    /// Container types the machine agent reported it can host.
    ///
    /// `None` until the agent has reported.
    pub fn supported_containers(&self) -> Option<&[ContainerType]> {
        self.doc.supported_containers.as_deref()
    }

    /// Records that the machine cannot host any containers.
    ///
    /// Existing containers are flagged with an error status.
    ///
    /// # Errors
    ///
    /// [`StateError::NotFound`] or [`StateError::NotValid`] if the machine is
    /// gone or dead.
    pub fn supports_no_containers(&mut self) -> Result<()> {
        self.update_supported_containers(Vec::new())
    }

    /// Records the container types the machine can host.
    ///
    /// Existing containers of other types are flagged with an error status.
    ///
    /// # Errors
    ///
    /// [`StateError::NotValid`] for an empty list or one naming `none`.
    pub fn set_supported_containers(&mut self, types: &[ContainerType]) -> Result<()> {
        if types.is_empty() {
            return Err(StateError::not_valid("at least one valid container type is required"));
        }
        if types.contains(&ContainerType::None) {
            return Err(StateError::not_valid(format!(
                "{:?} is not a valid container type",
                ContainerType::None.as_str()
            )));
        }
        let mut supported = types.to_vec();
        supported.sort();
        supported.dedup();
        self.update_supported_containers(supported)
    }

    fn update_supported_containers(&mut self, supported: Vec<ContainerType>) -> Result<()> {
        let id = self.doc.id.clone();
        let mut flagged = Vec::new();
        self.st
            .runner()
            .run(|_| {
                let Some(record) = self.st.machine_record(&id)? else {
                    return Err(StateError::not_found(format!("machine {id}")));
                };
                if record.doc.life == Life::Dead {
                    return Err(StateError::not_valid(format!(
                        "cannot update supported containers of machine {id}: machine is dead"
                    )));
                }
                let new_value = supported.clone();
                let mut ops = vec![
                    Op::on::<Machines>(id.as_str())
                        .revno(record.revno)
                        .update(move |m| m.supported_containers = Some(new_value)),
                ];
                let mut children = Vec::new();
                if let Some(refs) = self.st.db().get::<ContainerRefs>(id.as_str())? {
                    ops.push(Op::on::<ContainerRefs>(id.as_str()).revno(refs.revno).check());
                    children = refs.doc.children;
                }
                flagged.clear();
                for child in children {
                    let Some(kind) = child.container_type() else {
                        continue;
                    };
                    if supported.contains(&kind) {
                        continue;
                    }
                    let data = BTreeMap::from([("type".to_string(), kind.to_string())]);
                    ops.push(Op::on::<Statuses>(machine_key(&child)).update(move |s| {
                        *s = status::info(Status::Error, "unsupported container", data);
                    }));
                    flagged.push(child);
                }
                Ok(Some(ops))
            })
            .map_err(|e| e.with_context(format!("cannot update supported containers of machine {id}")))?;
        for child in &flagged {
            warn!(machine = %id, container = %child, "Container type no longer supported by host");
        }
        self.doc.supported_containers = Some(supported);
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::disallowed_methods)]
mod tests {
    use keel_test_utils::test_state_config;
    use keel_types::{ErrorKind, MachineJob};

    use crate::{Lifecycle, MachineTemplate, State};

    use super::*;

    fn state() -> State {
        State::in_memory(test_state_config()).unwrap()
    }

    #[test]
    fn test_new_machine_is_pending() {
        let st = state();
        let m = st.add_machine("quantal", &[MachineJob::HostUnits]).unwrap();
        assert_eq!(m.status().unwrap().status, Status::Pending);
    }

    #[test]
    fn test_set_status_validation_and_dead_machine() {
        let st = state();
        let mut m = st.add_machine("quantal", &[MachineJob::HostUnits]).unwrap();
        m.set_status(Status::Started, "", BTreeMap::new()).unwrap();
        assert_eq!(m.status().unwrap().status, Status::Started);

        let err = m.set_status(Status::Error, "", BTreeMap::new()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotValid);

        m.set_status(Status::Pending, "", BTreeMap::new()).unwrap();
        m.set_provisioned("i-1", "nonce", None).unwrap();
        let err = m.set_status(Status::Pending, "", BTreeMap::new()).unwrap_err();
        assert_eq!(err.to_string(), r#"cannot set invalid status "pending""#);

        m.ensure_dead().unwrap();
        let err = m.set_status(Status::Stopped, "", BTreeMap::new()).unwrap_err();
        assert_eq!(
            err.to_string(),
            r#"cannot set status of machine "0": not found or not alive"#
        );
    }

    #[test]
    fn test_supported_containers_flags_existing_containers() {
        let st = state();
        let mut host = st.add_machine("quantal", &[MachineJob::HostUnits]).unwrap();
        assert_eq!(host.supported_containers(), None);
        let template = MachineTemplate::builder()
            .series("quantal")
            .jobs(vec![MachineJob::HostUnits])
            .build();
        let lxc = st
            .add_machine_inside_machine(template.clone(), host.id(), ContainerType::Lxc)
            .unwrap();
        let kvm = st
            .add_machine_inside_machine(template.clone(), host.id(), ContainerType::Kvm)
            .unwrap();

        host.set_supported_containers(&[ContainerType::Kvm, ContainerType::Kvm]).unwrap();
        assert_eq!(host.supported_containers(), Some(&[ContainerType::Kvm][..]));

        let status = lxc.status().unwrap();
        assert_eq!(status.status, Status::Error);
        assert_eq!(status.info, "unsupported container");
        assert_eq!(status.data.get("type").map(String::as_str), Some("lxc"));
        assert_eq!(kvm.status().unwrap().status, Status::Pending);

        let err = st
            .add_machine_inside_machine(template, host.id(), ContainerType::Lxc)
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "cannot add a new machine: machine 0 cannot host lxc containers"
        );
    }

    #[test]
    fn test_supported_containers_rejects_none_and_empty() {
        let st = state();
        let mut m = st.add_machine("quantal", &[MachineJob::HostUnits]).unwrap();
        let err = m.set_supported_containers(&[ContainerType::None]).unwrap_err();
        assert_eq!(err.to_string(), r#""none" is not a valid container type"#);
        assert!(m.set_supported_containers(&[]).is_err());

        m.supports_no_containers().unwrap();
        assert_eq!(m.supported_containers(), Some(&[][..]));
    }
}
