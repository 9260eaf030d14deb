//! Machines and containers.
//!
//! A [`Machine`] handle caches the machine document it last read. Reads of
//! cached attributes are free; every guarded write re-reads the record,
//! decides from the fresh copy, and asserts what it decided on.

mod addresses;
mod network;
mod provisioning;
mod status;
mod watch;

use std::fmt;

use keel_store::{InMemoryBackend, Op, StorageBackend};
use keel_types::{ContainerType, Life, MachineId, MachineJob};
use tracing::{debug, info};

use crate::{
    docs::{
        Annotations, CleanupDoc, Cleanups, ConstraintsColl, ContainerRefs, Instances, Interfaces,
        MachineDoc, Machines, Networks, RequestedNetworks, Statuses, machine_key,
    },
    error::{Blocker, Result, StateError},
    lifecycle::{Lifecycle, Removal},
    state::State,
    unit::Unit,
};

pub use network::{NetworkInterface, NetworkInterfaceInfo};
pub use provisioning::MANUAL_NONCE_PREFIX;

/// Handle to a machine or container.
pub struct Machine<B: StorageBackend = InMemoryBackend> {
    st: State<B>,
    doc: MachineDoc,
}

impl<B: StorageBackend> Clone for Machine<B> {
    fn clone(&self) -> Self {
        Self { st: self.st.clone(), doc: self.doc.clone() }
    }
}

impl<B: StorageBackend> fmt::Debug for Machine<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Machine")
            .field("id", &self.doc.id)
            .field("life", &self.doc.life)
            .finish_non_exhaustive()
    }
}

impl<B: StorageBackend + 'static> Machine<B> {
    pub(crate) fn new(st: State<B>, doc: MachineDoc) -> Self {
        Self { st, doc }
    }

    /// Machine id.
    pub fn id(&self) -> &MachineId {
        &self.doc.id
    }

    /// Entity tag, e.g. `machine-1-lxc-0`.
    pub fn tag(&self) -> String {
        self.doc.id.tag()
    }

    /// OS series.
    pub fn series(&self) -> &str {
        &self.doc.series
    }

    /// Jobs the machine was created with.
    pub fn jobs(&self) -> &[MachineJob] {
        &self.doc.jobs
    }

    /// Whether the machine runs the controller.
    pub fn is_manager(&self) -> bool {
        self.doc.is_manager()
    }

    /// Whether the machine has ever hosted a unit.
    pub fn clean(&self) -> bool {
        self.doc.clean
    }

    /// Container type if this machine is a container.
    pub fn container_type(&self) -> Option<ContainerType> {
        self.doc.id.container_type()
    }

    /// Host machine if this machine is a container.
    pub fn parent_id(&self) -> Option<MachineId> {
        self.doc.id.parent_id()
    }

    /// Principal units assigned here, as of the last read.
    pub fn principals(&self) -> &[keel_types::UnitName] {
        &self.doc.principals
    }

    pub(crate) fn entity(&self) -> String {
        format!("machine {}", self.doc.id)
    }

    pub(crate) fn state(&self) -> &State<B> {
        &self.st
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    fn advance_lifecycle(&mut self, target: Life) -> Result<()> {
        if self.doc.is_manager() {
            return Err(StateError::blocked(self.entity(), Blocker::Required));
        }
        let id = self.doc.id.clone();
        let entity = self.entity();
        let mut observed = None;
        self.st
            .runner()
            .run(|_| {
                let Some(record) = self.st.machine_record(&id)? else {
                    observed = Some(Life::Removed);
                    return Ok(None);
                };
                let current = record.doc;
                if current.life >= target {
                    observed = Some(current.life);
                    return Ok(None);
                }
                if current.has_vote {
                    return Err(StateError::blocked(entity.clone(), Blocker::HasVote));
                }
                let children = self
                    .st
                    .db()
                    .get::<ContainerRefs>(id.as_str())?
                    .map(|r| r.doc.children)
                    .unwrap_or_default();
                if !children.is_empty() {
                    return Err(StateError::blocked(entity.clone(), Blocker::HasContainers(children)));
                }
                if !current.principals.is_empty() {
                    return Err(StateError::blocked(
                        entity.clone(),
                        Blocker::HasAssignedUnits(current.principals),
                    ));
                }
                let life = current.life;
                observed = Some(target);
                Ok(Some(vec![
                    Op::on::<Machines>(id.as_str())
                        .matches(move |m| {
                            m.life == life
                                && !m.has_vote
                                && m.principals.is_empty()
                                && !m.is_manager()
                        })
                        .update(move |m| m.life = target),
                    Op::on::<ContainerRefs>(id.as_str()).matches(|c| c.children.is_empty()).check(),
                ]))
            })
            .map_err(|e| e.with_context(format!("machine {id} cannot advance lifecycle")))?;
        if let Some(life) = observed {
            self.doc.life = self.doc.life.max(life);
        }
        debug!(machine = %id, life = %self.doc.life, "Advanced machine lifecycle");
        Ok(())
    }

    /// Queues a forced teardown processed by [`State::cleanup`].
    ///
    /// The cleanup destroys and removes every unit on the machine and its
    /// containers, then marks it dead.
    ///
    /// # Errors
    ///
    /// [`StateError::Blocked`] with [`Blocker::Required`] for manager machines.
    pub fn force_destroy(&mut self) -> Result<()> {
        if self.doc.is_manager() {
            return Err(StateError::blocked(self.entity(), Blocker::Required));
        }
        let id = self.doc.id.clone();
        let cleanup_id = format!("machine:{id}");
        self.st
            .runner()
            .run(|_| {
                let Some(record) = self.st.machine_record(&id)? else {
                    return Ok(None);
                };
                if record.doc.life == Life::Dead
                    || self.st.db().get::<Cleanups>(&cleanup_id)?.is_some()
                {
                    return Ok(None);
                }
                Ok(Some(vec![
                    Op::on::<Machines>(id.as_str()).matches(|m| m.life != Life::Dead).check(),
                    Op::on::<Cleanups>(cleanup_id.as_str())
                        .missing()
                        .insert(CleanupDoc::ForceDestroyMachine(id.clone())),
                ]))
            })
            .map_err(|e| e.with_context(format!("cannot force destroy machine {id}")))?;
        info!(machine = %id, "Queued forced machine teardown");
        Ok(())
    }

    // ========================================================================
    // Voting and agent
    // ========================================================================

    /// Whether the machine should be a voting replica set member.
    pub fn wants_vote(&self) -> bool {
        self.doc.wants_vote
    }

    /// Whether the machine is a voting replica set member.
    pub fn has_vote(&self) -> bool {
        self.doc.has_vote
    }

    /// Records whether the machine currently has a vote.
    ///
    /// # Errors
    ///
    /// [`StateError::NotFound`] if the machine was removed,
    /// [`StateError::NotValid`] if it is dead.
    pub fn set_has_vote(&mut self, has_vote: bool) -> Result<()> {
        let id = self.doc.id.clone();
        self.guarded_update(
            &format!("cannot set HasVote of machine {id}"),
            move |m| m.has_vote = has_vote,
        )?;
        self.doc.has_vote = has_vote;
        Ok(())
    }

    /// Agent version last reported, if any.
    pub fn agent_version(&self) -> Option<&str> {
        self.doc.agent_version.as_deref()
    }

    /// Records the agent version.
    ///
    /// # Errors
    ///
    /// [`StateError::NotFound`] if the machine was removed,
    /// [`StateError::NotValid`] if it is dead or `version` is empty.
    pub fn set_agent_version(&mut self, version: &str) -> Result<()> {
        if version.is_empty() {
            return Err(StateError::not_valid(format!(
                "cannot set agent version for machine {}: empty version",
                self.doc.id
            )));
        }
        let id = self.doc.id.clone();
        let stored = version.to_string();
        self.guarded_update(
            &format!("cannot set agent version for machine {id}"),
            move |m| m.agent_version = Some(stored.clone()),
        )?;
        self.doc.agent_version = Some(version.to_string());
        Ok(())
    }

    /// Updates the machine document if it exists and is not dead.
    fn guarded_update<F>(&self, what: &str, mutate: F) -> Result<()>
    where
        F: Fn(&mut MachineDoc) + Clone + Send + 'static,
    {
        let id = self.doc.id.clone();
        self.st
            .runner()
            .run(|_| {
                let Some(record) = self.st.machine_record(&id)? else {
                    return Err(StateError::not_found(format!("machine {id}")));
                };
                if record.doc.life == Life::Dead {
                    return Err(StateError::not_valid(format!("{what}: machine is dead")));
                }
                Ok(Some(vec![
                    Op::on::<Machines>(id.as_str()).revno(record.revno).update(mutate.clone()),
                ]))
            })
            .map_err(|e| e.with_context(what.to_string()))
    }

    // ========================================================================
    // Children
    // ========================================================================

    /// Ids of the containers hosted by this machine.
    ///
    /// # Errors
    ///
    /// [`StateError::NotFound`] once the machine has been removed.
    pub fn containers(&self) -> Result<Vec<MachineId>> {
        match self.st.db().get::<ContainerRefs>(self.doc.id.as_str())? {
            Some(record) => Ok(record.doc.children),
            None => Err(StateError::not_found(format!("container info for machine {}", self.doc.id))),
        }
    }

    /// Units deployed on this machine: its principals and their subordinates.
    ///
    /// # Errors
    ///
    /// [`StateError::NotFound`] once the machine has been removed.
    pub fn units(&self) -> Result<Vec<Unit<B>>> {
        let Some(record) = self.st.machine_record(&self.doc.id)? else {
            return Err(StateError::not_found(self.entity()));
        };
        let mut units = Vec::new();
        for name in &record.doc.principals {
            let Some(principal) = self.st.unit_by_name(name)? else {
                continue;
            };
            let subordinates = principal.subordinate_names().to_vec();
            units.push(principal);
            for sub in &subordinates {
                if let Some(unit) = self.st.unit_by_name(sub)? {
                    units.push(unit);
                }
            }
        }
        Ok(units)
    }

    // ========================================================================
    // Annotations
    // ========================================================================

    /// Annotations of this machine.
    ///
    /// # Errors
    ///
    /// [`StateError::Closed`] after close.
    pub fn annotations(&self) -> Result<std::collections::BTreeMap<String, String>> {
        crate::annotations::get(&self.st, &machine_key(&self.doc.id))
    }

    /// Sets annotations; empty values delete keys.
    ///
    /// # Errors
    ///
    /// [`StateError::NotValid`] for keys containing `.`.
    pub fn set_annotations(
        &self,
        pairs: std::collections::BTreeMap<String, String>,
    ) -> Result<()> {
        let id = self.doc.id.clone();
        crate::annotations::set(
            &self.st,
            &machine_key(&id),
            || {
                let alive = self.st.machine_record(&id)?.is_some_and(|r| r.doc.life != Life::Dead);
                if !alive {
                    return Err(StateError::not_valid("machine not found or dead"));
                }
                Ok(Op::on::<Machines>(id.as_str()).matches(|m| m.life != Life::Dead).check())
            },
            pairs,
        )
        .map_err(|e| match e {
            StateError::NotValid { message } => StateError::not_valid(format!(
                "cannot update annotations on {}: {message}",
                self.tag()
            )),
            other => other,
        })
    }

    fn remove_ops(&self, record_doc: &MachineDoc) -> Result<Vec<Op>> {
        let id = record_doc.id.clone();
        let key = machine_key(&id);
        let mut ops = vec![
            Op::on::<Machines>(id.as_str()).matches(|m| m.life == Life::Dead).remove(),
            Op::on::<ContainerRefs>(id.as_str()).remove(),
            Op::on::<Instances>(id.as_str()).remove(),
            Op::on::<Statuses>(key.clone()).remove(),
            Op::on::<ConstraintsColl>(key.clone()).remove(),
            Op::on::<RequestedNetworks>(key.clone()).remove(),
            Op::on::<Annotations>(key).remove(),
        ];
        let machine = id.clone();
        for interface in self.st.db().find::<Interfaces>(move |i| i.machine_id == machine)? {
            let mac = interface.doc.mac_address.clone();
            ops.push(Op::on::<Interfaces>(interface.id).remove());
            ops.push(Op::on::<Networks>(interface.doc.network_name).update(move |n| {
                n.macs.remove(&mac);
            }));
        }
        if let Some(parent) = id.parent_id() {
            let child = id.clone();
            ops.push(
                Op::on::<ContainerRefs>(parent.as_str())
                    .update(move |refs| refs.children.retain(|c| *c != child)),
            );
        }
        Ok(ops)
    }
}

impl<B: StorageBackend + 'static> Lifecycle for Machine<B> {
    fn life(&self) -> Life {
        self.doc.life
    }

    /// Moves an alive machine to `Dying`.
    fn destroy(&mut self) -> Result<()> {
        self.advance_lifecycle(Life::Dying)
    }

    fn ensure_dead(&mut self) -> Result<()> {
        self.advance_lifecycle(Life::Dead)
    }

    fn remove(&mut self) -> Result<Removal> {
        if self.doc.is_manager() {
            return Err(StateError::blocked(self.entity(), Blocker::Required));
        }
        let id = self.doc.id.clone();
        let mut outcome = Removal::AlreadyGone;
        self.st
            .runner()
            .run(|_| {
                let Some(record) = self.st.machine_record(&id)? else {
                    outcome = Removal::AlreadyGone;
                    return Ok(None);
                };
                if record.doc.life != Life::Dead {
                    return Err(StateError::blocked(format!("machine {id}"), Blocker::NotDead));
                }
                outcome = Removal::Deleted;
                self.remove_ops(&record.doc).map(Some)
            })
            .map_err(|e| e.with_context(format!("cannot remove machine {id}")))?;
        self.doc.life = Life::Removed;
        if outcome == Removal::Deleted {
            info!(machine = %id, "Removed machine");
        }
        Ok(outcome)
    }

    fn refresh(&mut self) -> Result<()> {
        match self.st.machine_record(&self.doc.id)? {
            Some(record) => {
                self.doc = record.doc;
                Ok(())
            },
            None => Err(StateError::not_found(self.entity())),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::disallowed_methods)]
mod tests {
    use keel_test_utils::test_state_config;
    use keel_types::ErrorKind;

    use super::*;

    fn state() -> State {
        State::in_memory(test_state_config()).unwrap()
    }

    #[test]
    fn test_destroy_then_ensure_dead_then_remove() {
        let st = state();
        let mut m = st.add_machine("quantal", &[MachineJob::HostUnits]).unwrap();
        assert_eq!(m.id().as_str(), "0");

        m.destroy().unwrap();
        assert_eq!(m.life(), Life::Dying);
        m.destroy().unwrap();
        assert_eq!(m.life(), Life::Dying);

        m.ensure_dead().unwrap();
        assert_eq!(m.life(), Life::Dead);

        assert_eq!(m.remove().unwrap(), Removal::Deleted);
        assert_eq!(m.remove().unwrap(), Removal::AlreadyGone);
        let err = m.refresh().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert_eq!(err.to_string(), "machine 0 not found");
    }

    #[test]
    fn test_remove_requires_dead() {
        let st = state();
        let mut m = st.add_machine("quantal", &[MachineJob::HostUnits]).unwrap();
        let err = m.remove().unwrap_err();
        assert_eq!(err.to_string(), "cannot remove machine 0: machine is not dead");
        assert_eq!(err.blocker(), Some(&Blocker::NotDead));
    }

    #[test]
    fn test_manager_machine_never_leaves_alive() {
        let st = state();
        let mut m = st.add_machine("quantal", &[MachineJob::ManageEnviron]).unwrap();
        assert!(m.wants_vote());
        let before = st.txn_attempts();
        for result in [m.destroy(), m.ensure_dead(), m.force_destroy()] {
            let err = result.unwrap_err();
            assert_eq!(err.to_string(), "machine 0 is required by the environment");
        }
        assert_eq!(st.txn_attempts(), before);
        m.refresh().unwrap();
        assert_eq!(m.life(), Life::Alive);
    }

    #[test]
    fn test_manager_machine_remove_reports_required_before_not_dead() {
        let st = state();
        let mut m = st.add_machine("quantal", &[MachineJob::ManageEnviron]).unwrap();
        let before = st.txn_attempts();
        let err = m.remove().unwrap_err();
        assert_eq!(err.blocker(), Some(&Blocker::Required));
        assert_eq!(err.to_string(), "machine 0 is required by the environment");
        assert_eq!(st.txn_attempts(), before);
        assert_eq!(m.life(), Life::Alive);
    }

    #[test]
    fn test_voting_machine_cannot_die() {
        let st = state();
        let mut m = st.add_machine("quantal", &[MachineJob::HostUnits]).unwrap();
        m.set_has_vote(true).unwrap();
        let err = m.ensure_dead().unwrap_err();
        assert_eq!(err.to_string(), "machine 0 is a voting replica set member");
        m.set_has_vote(false).unwrap();
        m.ensure_dead().unwrap();
    }

    #[test]
    fn test_container_blocks_host_until_removed() {
        let st = state();
        let mut host = st.add_machine("quantal", &[MachineJob::HostUnits]).unwrap();
        let template = crate::MachineTemplate::builder()
            .series("quantal")
            .jobs(vec![MachineJob::HostUnits])
            .build();
        let mut container = st
            .add_machine_inside_machine(template, host.id(), ContainerType::Lxc)
            .unwrap();
        assert_eq!(container.id().as_str(), "0/lxc/0");
        assert_eq!(container.parent_id(), Some(host.id().clone()));
        assert_eq!(host.containers().unwrap(), vec![container.id().clone()]);

        let err = host.destroy().unwrap_err();
        assert_eq!(err.to_string(), r#"machine 0 is hosting containers "0/lxc/0""#);

        container.ensure_dead().unwrap();
        container.remove().unwrap();
        assert!(host.containers().unwrap().is_empty());
        host.destroy().unwrap();
    }

    #[test]
    fn test_agent_version_and_vote_on_dead_machine() {
        let st = state();
        let mut m = st.add_machine("quantal", &[MachineJob::HostUnits]).unwrap();
        m.set_agent_version("1.20.0").unwrap();
        assert_eq!(m.agent_version(), Some("1.20.0"));
        m.ensure_dead().unwrap();
        let err = m.set_has_vote(true).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotValid);
    }

    #[test]
    fn test_annotations_round_trip_and_reject_dotted_keys() {
        let st = state();
        let m = st.add_machine("quantal", &[MachineJob::HostUnits]).unwrap();
        let pairs = [("owner".to_string(), "ops".to_string())].into_iter().collect();
        m.set_annotations(pairs).unwrap();
        assert_eq!(m.annotations().unwrap().get("owner").map(String::as_str), Some("ops"));

        let bad = [("a.b".to_string(), "x".to_string())].into_iter().collect();
        let err = m.set_annotations(bad).unwrap_err();
        assert_eq!(
            err.to_string(),
            r#"cannot update annotations on machine-0: invalid key "a.b""#
        );
    }
}
