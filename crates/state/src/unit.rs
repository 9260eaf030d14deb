//! Units: the dependents a machine carries.
//!
//! A principal unit is assigned to a machine and keeps that machine from
//! dying. A subordinate unit lives alongside one principal and keeps it from
//! dying until the subordinate is removed.

use std::{collections::BTreeMap, fmt};

use keel_store::{CollectionId, InMemoryBackend, Op, StorageBackend};
use keel_types::{Life, MachineId, MachineJob, ServiceName, Status, StatusInfo, UnitName};
use tracing::{debug, info};

use crate::{
    docs::{Annotations, Machines, Services, Statuses, UnitDoc, Units, service_key, unit_key},
    error::{Blocker, Result, StateError},
    lifecycle::{Lifecycle, Removal},
    machine::Machine,
    state::State,
    status::{self, StatusOwner},
    watcher::{EntityWatch, Watcher},
};

/// Handle to a unit.
pub struct Unit<B: StorageBackend = InMemoryBackend> {
    st: State<B>,
    doc: UnitDoc,
}

impl<B: StorageBackend> Clone for Unit<B> {
    fn clone(&self) -> Self {
        Self { st: self.st.clone(), doc: self.doc.clone() }
    }
}

impl<B: StorageBackend> fmt::Debug for Unit<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Unit")
            .field("name", &self.doc.name)
            .field("life", &self.doc.life)
            .finish_non_exhaustive()
    }
}

impl<B: StorageBackend + 'static> Unit<B> {
    pub(crate) fn new(st: State<B>, doc: UnitDoc) -> Self {
        Self { st, doc }
    }

    /// Unit name, e.g. `wordpress/0`.
    pub fn name(&self) -> &UnitName {
        &self.doc.name
    }

    /// Entity tag, e.g. `unit-wordpress-0`.
    pub fn tag(&self) -> String {
        self.doc.name.tag()
    }

    /// Owning service.
    pub fn service_name(&self) -> &ServiceName {
        &self.doc.service
    }

    /// Whether this unit is a principal rather than a subordinate.
    pub fn is_principal(&self) -> bool {
        self.doc.principal.is_none()
    }

    /// Principal of a subordinate unit.
    pub fn principal_name(&self) -> Option<&UnitName> {
        self.doc.principal.as_ref()
    }

    /// Subordinates of a principal unit, as of the last read.
    pub fn subordinate_names(&self) -> &[UnitName] {
        &self.doc.subordinates
    }

    fn entity(&self) -> String {
        format!("unit {}", self.doc.name)
    }

    /// Machine the unit is deployed on.
    ///
    /// Subordinates report their principal's machine.
    ///
    /// # Errors
    ///
    /// [`StateError::NotFound`] if the unit is not assigned.
    pub fn assigned_machine_id(&self) -> Result<MachineId> {
        let not_assigned =
            || StateError::not_found(format!("machine assignment of unit {:?}", self.doc.name.as_str()));
        let name = self.doc.principal.as_ref().unwrap_or(&self.doc.name);
        let Some(record) = self.st.db().get::<Units>(name.as_str())? else {
            return Err(not_assigned());
        };
        record.doc.machine_id.ok_or_else(not_assigned)
    }

    // ========================================================================
    // Assignment
    // ========================================================================

    /// Assigns this principal unit to `machine`.
    ///
    /// Assigning again to the same machine is a no-op.
    ///
    /// # Errors
    ///
    /// [`StateError::NotValid`] if the unit is a subordinate, either side is
    /// not alive, the machine cannot host units, or the unit is assigned
    /// elsewhere.
    pub fn assign_to_machine(&mut self, machine: &Machine<B>) -> Result<()> {
        let name = self.doc.name.clone();
        let mid = machine.id().clone();
        let what = format!("cannot assign unit {:?} to machine {mid}", name.as_str());
        if !self.is_principal() {
            return Err(StateError::not_valid(format!("{what}: unit is a subordinate")));
        }
        self.st
            .runner()
            .run(|_| {
                let Some(unit) = self.st.db().get::<Units>(name.as_str())? else {
                    return Err(StateError::not_found(format!("unit {:?}", name.as_str())));
                };
                match &unit.doc.machine_id {
                    Some(current) if *current == mid => return Ok(None),
                    Some(current) => {
                        return Err(StateError::not_valid(format!(
                            "{what}: unit is already assigned to machine {current}"
                        )));
                    },
                    None => {},
                }
                if unit.doc.life != Life::Alive {
                    return Err(StateError::not_valid(format!("{what}: unit is not alive")));
                }
                let Some(host) = self.st.machine_record(&mid)? else {
                    return Err(StateError::not_found(format!("machine {mid}")));
                };
                if host.doc.life != Life::Alive {
                    return Err(StateError::not_valid(format!("{what}: machine is not alive")));
                }
                if !host.doc.jobs.contains(&MachineJob::HostUnits) {
                    return Err(StateError::not_valid(format!(
                        "{what}: machine cannot host units"
                    )));
                }
                let assigned = mid.clone();
                let principal = name.clone();
                Ok(Some(vec![
                    Op::on::<Units>(name.as_str())
                        .matches(|u| u.life == Life::Alive && u.machine_id.is_none())
                        .update(move |u| u.machine_id = Some(assigned)),
                    Op::on::<Machines>(mid.as_str())
                        .matches(|m| m.life == Life::Alive)
                        .update(move |m| {
                            m.principals.push(principal);
                            m.clean = false;
                        }),
                ]))
            })
            .map_err(|e| e.with_context(what.clone()))?;
        self.doc.machine_id = Some(mid.clone());
        info!(unit = %name, machine = %mid, "Assigned unit to machine");
        Ok(())
    }

    /// Removes the unit's machine assignment.
    ///
    /// # Errors
    ///
    /// [`StateError::NotFound`] if the unit was removed.
    pub fn unassign_from_machine(&mut self) -> Result<()> {
        let name = self.doc.name.clone();
        self.st
            .runner()
            .run(|_| {
                let Some(unit) = self.st.db().get::<Units>(name.as_str())? else {
                    return Err(StateError::not_found(format!("unit {:?}", name.as_str())));
                };
                let Some(mid) = unit.doc.machine_id else {
                    return Ok(None);
                };
                let expected = mid.clone();
                let principal = name.clone();
                Ok(Some(vec![
                    Op::on::<Units>(name.as_str())
                        .matches(move |u| u.machine_id.as_ref() == Some(&expected))
                        .update(|u| u.machine_id = None),
                    Op::on::<Machines>(mid.as_str())
                        .update(move |m| m.principals.retain(|p| *p != principal)),
                ]))
            })
            .map_err(|e| e.with_context(format!("cannot unassign unit {:?}", name.as_str())))?;
        self.doc.machine_id = None;
        debug!(unit = %name, "Unassigned unit");
        Ok(())
    }

    // ========================================================================
    // Status and annotations
    // ========================================================================

    /// Current agent status.
    ///
    /// # Errors
    ///
    /// [`StateError::NotFound`] once the unit has been removed.
    pub fn status(&self) -> Result<StatusInfo> {
        match self.st.db().get::<Statuses>(&unit_key(&self.doc.name))? {
            Some(record) => Ok(record.doc),
            None => Err(StateError::not_found(format!("status for unit {:?}", self.doc.name.as_str()))),
        }
    }

    /// Sets the agent status.
    ///
    /// # Errors
    ///
    /// [`StateError::NotValid`] for statuses an agent may not set, or if the
    /// unit is dead or gone.
    pub fn set_status(
        &self,
        status: Status,
        info: &str,
        data: BTreeMap<String, String>,
    ) -> Result<()> {
        status::validate(StatusOwner::Unit, status, info)?;
        let name = self.doc.name.clone();
        let value = status::info(status, info, data);
        self.st
            .runner()
            .run(|_| {
                let alive = self
                    .st
                    .db()
                    .get::<Units>(name.as_str())?
                    .is_some_and(|r| r.doc.life != Life::Dead);
                if !alive {
                    return Err(StateError::not_valid(format!(
                        "cannot set status of unit {:?}: not found or not alive",
                        name.as_str()
                    )));
                }
                let value = value.clone();
                Ok(Some(vec![
                    Op::on::<Units>(name.as_str()).matches(|u| u.life != Life::Dead).check(),
                    Op::on::<Statuses>(unit_key(&name)).exists().update(move |s| *s = value),
                ]))
            })
            .map_err(|e| e.with_context(format!("cannot set status of unit {name}")))
    }

    /// Annotations of this unit.
    ///
    /// # Errors
    ///
    /// [`StateError::Closed`] after close.
    pub fn annotations(&self) -> Result<BTreeMap<String, String>> {
        crate::annotations::get(&self.st, &unit_key(&self.doc.name))
    }

    /// Sets annotations; empty values delete keys.
    ///
    /// # Errors
    ///
    /// [`StateError::NotValid`] for keys containing `.` or a dead unit.
    pub fn set_annotations(&self, pairs: BTreeMap<String, String>) -> Result<()> {
        let name = self.doc.name.clone();
        crate::annotations::set(
            &self.st,
            &unit_key(&name),
            || {
                let alive = self
                    .st
                    .db()
                    .get::<Units>(name.as_str())?
                    .is_some_and(|r| r.doc.life != Life::Dead);
                if !alive {
                    return Err(StateError::not_valid("unit not found or dead"));
                }
                Ok(Op::on::<Units>(name.as_str()).matches(|u| u.life != Life::Dead).check())
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

    /// Watches the unit document.
    ///
    /// # Errors
    ///
    /// [`StateError::Closed`] after close, or [`StateError::NotValid`]
    /// outside a tokio runtime.
    pub fn watch(&self) -> Result<Watcher<()>> {
        self.st
            .hub()
            .watch(EntityWatch::new(vec![(CollectionId::Units, self.doc.name.to_string())]))
    }

    // ========================================================================
    // Teardown
    // ========================================================================

    /// Destroys subordinates, then this unit, then removes everything.
    ///
    /// Used by forced machine teardown; ignores assignment.
    pub(crate) fn force_remove(&mut self) -> Result<()> {
        match self.refresh() {
            Err(e) if e.is_not_found() => return Ok(()),
            result => result?,
        }
        for sub in self.doc.subordinates.clone() {
            if let Some(mut unit) = self.st.unit_by_name(&sub)? {
                unit.force_remove()?;
            }
        }
        self.destroy()?;
        self.ensure_dead()?;
        self.remove()?;
        Ok(())
    }

    fn advance(&mut self, dying: bool) -> Result<()> {
        let name = self.doc.name.clone();
        let entity = self.entity();
        let mut observed = None;
        self.st
            .runner()
            .run(|_| {
                let Some(record) = self.st.db().get::<Units>(name.as_str())? else {
                    observed = Some(Life::Removed);
                    return Ok(None);
                };
                let current = record.doc;
                if dying && current.life != Life::Alive {
                    observed = Some(current.life);
                    return Ok(None);
                }
                let direct = current.principal.is_none()
                    && current.machine_id.is_none()
                    && current.subordinates.is_empty();
                let target = if dying && !direct { Life::Dying } else { Life::Dead };
                if current.life >= target {
                    observed = Some(current.life);
                    return Ok(None);
                }
                if target == Life::Dead && !current.subordinates.is_empty() {
                    return Err(StateError::blocked(
                        entity.clone(),
                        Blocker::HasSubordinates(current.subordinates),
                    ));
                }
                let life = current.life;
                let drained = target == Life::Dead;
                let unassigned = dying && drained;
                observed = Some(target);
                Ok(Some(vec![
                    Op::on::<Units>(name.as_str())
                        .matches(move |u| {
                            u.life == life
                                && (!drained || u.subordinates.is_empty())
                                && (!unassigned || u.machine_id.is_none())
                        })
                        .update(move |u| u.life = target),
                ]))
            })
            .map_err(|e| e.with_context(format!("unit {name} cannot advance lifecycle")))?;
        if let Some(life) = observed {
            self.doc.life = self.doc.life.max(life);
        }
        debug!(unit = %name, life = %self.doc.life, "Advanced unit lifecycle");
        Ok(())
    }
}

impl<B: StorageBackend + 'static> Lifecycle for Unit<B> {
    fn life(&self) -> Life {
        self.doc.life
    }

    /// Moves an alive unit to `Dying`, or straight to `Dead` when it is an
    /// unassigned principal without subordinates.
    fn destroy(&mut self) -> Result<()> {
        self.advance(true)
    }

    fn ensure_dead(&mut self) -> Result<()> {
        self.advance(false)
    }

    fn remove(&mut self) -> Result<Removal> {
        let name = self.doc.name.clone();
        let mut outcome = Removal::AlreadyGone;
        self.st
            .runner()
            .run(|_| {
                let Some(record) = self.st.db().get::<Units>(name.as_str())? else {
                    outcome = Removal::AlreadyGone;
                    return Ok(None);
                };
                if record.doc.life != Life::Dead {
                    return Err(StateError::blocked(self.entity(), Blocker::NotDead));
                }
                outcome = Removal::Deleted;
                let key = unit_key(&name);
                let mut ops = vec![
                    Op::on::<Units>(name.as_str()).revno(record.revno).remove(),
                    Op::on::<Statuses>(key.clone()).remove(),
                    Op::on::<Annotations>(key).remove(),
                ];
                if let Some(mid) = &record.doc.machine_id {
                    let unit = name.clone();
                    ops.push(
                        Op::on::<Machines>(mid.as_str())
                            .update(move |m| m.principals.retain(|p| *p != unit)),
                    );
                }
                if let Some(principal) = &record.doc.principal {
                    let unit = name.clone();
                    ops.push(
                        Op::on::<Units>(principal.as_str())
                            .update(move |u| u.subordinates.retain(|s| *s != unit)),
                    );
                }
                let service = record.doc.service.as_str();
                if let Some(svc) = self.st.db().get::<Services>(service)? {
                    if svc.doc.life == Life::Dying && svc.doc.unit_count <= 1 {
                        ops.push(Op::on::<Services>(service).revno(svc.revno).remove());
                        ops.push(Op::on::<Annotations>(service_key(&record.doc.service)).remove());
                    } else {
                        ops.push(
                            Op::on::<Services>(service)
                                .revno(svc.revno)
                                .update(|s| s.unit_count = s.unit_count.saturating_sub(1)),
                        );
                    }
                }
                Ok(Some(ops))
            })
            .map_err(|e| e.with_context(format!("cannot remove unit {name}")))?;
        self.doc.life = Life::Removed;
        if outcome == Removal::Deleted {
            info!(unit = %name, "Removed unit");
        }
        Ok(outcome)
    }

    fn refresh(&mut self) -> Result<()> {
        match self.st.db().get::<Units>(self.doc.name.as_str())? {
            Some(record) => {
                self.doc = record.doc;
                Ok(())
            },
            None => Err(StateError::not_found(format!("unit {:?}", self.doc.name.as_str()))),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::disallowed_methods)]
mod tests {
    use keel_test_utils::test_state_config;
    use keel_types::ErrorKind;

    use super::*;

    fn setup() -> (State, Machine) {
        let st = State::in_memory(test_state_config()).unwrap();
        let m = st.add_machine("quantal", &[MachineJob::HostUnits]).unwrap();
        (st, m)
    }

    #[test]
    fn test_assignment_blocks_machine_destroy() {
        let (st, mut m) = setup();
        let svc = st.add_service("wordpress", false).unwrap();
        let mut unit = svc.add_unit().unwrap();
        assert_eq!(unit.name().as_str(), "wordpress/0");
        unit.assign_to_machine(&m).unwrap();
        unit.assign_to_machine(&m).unwrap();
        assert_eq!(unit.assigned_machine_id().unwrap(), *m.id());

        let err = m.destroy().unwrap_err();
        assert_eq!(err.to_string(), r#"machine 0 has unit "wordpress/0" assigned"#);
        assert_eq!(err.blocker().unwrap().offending_ids(), vec!["wordpress/0"]);

        unit.unassign_from_machine().unwrap();
        assert!(unit.assigned_machine_id().unwrap_err().is_not_found());
        m.destroy().unwrap();
        assert_eq!(m.life(), Life::Dying);
        m.refresh().unwrap();
        assert!(!m.clean());
    }

    #[test]
    fn test_assign_rejects_bad_targets() {
        let (st, mut m) = setup();
        let manager = st.add_machine("quantal", &[MachineJob::ManageEnviron]).unwrap();
        let svc = st.add_service("wordpress", false).unwrap();
        let mut unit = svc.add_unit().unwrap();

        let err = unit.assign_to_machine(&manager).unwrap_err();
        assert_eq!(
            err.to_string(),
            r#"cannot assign unit "wordpress/0" to machine 1: machine cannot host units"#
        );

        m.destroy().unwrap();
        let err = unit.assign_to_machine(&m).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotValid);

        let other = st.add_machine("quantal", &[MachineJob::HostUnits]).unwrap();
        unit.assign_to_machine(&other).unwrap();
        let third = st.add_machine("quantal", &[MachineJob::HostUnits]).unwrap();
        let err = unit.assign_to_machine(&third).unwrap_err();
        assert_eq!(
            err.to_string(),
            r#"cannot assign unit "wordpress/0" to machine 3: unit is already assigned to machine 2"#
        );
    }

    #[test]
    fn test_unassigned_principal_dies_directly() {
        let (st, _m) = setup();
        let svc = st.add_service("wordpress", false).unwrap();
        let mut unit = svc.add_unit().unwrap();
        unit.destroy().unwrap();
        assert_eq!(unit.life(), Life::Dead);
        assert_eq!(unit.remove().unwrap(), Removal::Deleted);
        assert_eq!(unit.remove().unwrap(), Removal::AlreadyGone);
        assert!(st.unit("wordpress/0").unwrap_err().is_not_found());
    }

    #[test]
    fn test_assigned_unit_goes_through_dying() {
        let (st, m) = setup();
        let svc = st.add_service("wordpress", false).unwrap();
        let mut unit = svc.add_unit().unwrap();
        unit.assign_to_machine(&m).unwrap();
        unit.destroy().unwrap();
        assert_eq!(unit.life(), Life::Dying);

        let err = unit.remove().unwrap_err();
        assert_eq!(err.to_string(), "cannot remove unit wordpress/0: unit is not dead");

        unit.ensure_dead().unwrap();
        unit.remove().unwrap();
        let mut m = st.machine("0").unwrap();
        assert!(m.principals().is_empty());
        m.ensure_dead().unwrap();
    }

    #[test]
    fn test_subordinates_block_principal_death() {
        let (st, m) = setup();
        let wordpress = st.add_service("wordpress", false).unwrap();
        let logging = st.add_service("logging", true).unwrap();
        let mut principal = wordpress.add_unit().unwrap();
        principal.assign_to_machine(&m).unwrap();
        let mut sub = logging.add_subordinate_unit(&principal).unwrap();
        assert_eq!(sub.principal_name(), Some(principal.name()));
        assert_eq!(sub.assigned_machine_id().unwrap(), *m.id());

        principal.refresh().unwrap();
        assert_eq!(principal.subordinate_names(), [sub.name().clone()]);
        let names: Vec<_> = m.units().unwrap().iter().map(|u| u.name().to_string()).collect();
        assert_eq!(names, ["wordpress/0", "logging/0"]);

        let err = principal.ensure_dead().unwrap_err();
        assert_eq!(err.to_string(), r#"unit wordpress/0 has subordinates "logging/0""#);

        sub.destroy().unwrap();
        assert_eq!(sub.life(), Life::Dying);
        sub.ensure_dead().unwrap();
        sub.remove().unwrap();
        principal.ensure_dead().unwrap();
    }

    #[test]
    fn test_unit_status() {
        let (st, _m) = setup();
        let svc = st.add_service("wordpress", false).unwrap();
        let mut unit = svc.add_unit().unwrap();
        assert_eq!(unit.status().unwrap().status, Status::Pending);
        unit.set_status(Status::Installed, "", BTreeMap::new()).unwrap();
        assert_eq!(unit.status().unwrap().status, Status::Installed);
        let err = unit.set_status(Status::Pending, "", BTreeMap::new()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotValid);

        unit.destroy().unwrap();
        let err = unit.set_status(Status::Started, "", BTreeMap::new()).unwrap_err();
        assert_eq!(
            err.to_string(),
            r#"cannot set status of unit "wordpress/0": not found or not alive"#
        );
    }

    #[test]
    fn test_force_remove_takes_subordinates_along() {
        let (st, m) = setup();
        let wordpress = st.add_service("wordpress", false).unwrap();
        let logging = st.add_service("logging", true).unwrap();
        let mut principal = wordpress.add_unit().unwrap();
        principal.assign_to_machine(&m).unwrap();
        logging.add_subordinate_unit(&principal).unwrap();

        principal.force_remove().unwrap();
        assert!(st.unit("wordpress/0").unwrap_err().is_not_found());
        assert!(st.unit("logging/0").unwrap_err().is_not_found());
        let m = st.machine("0").unwrap();
        assert!(m.principals().is_empty());
    }
}
