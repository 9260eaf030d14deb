//! Services and unit creation.

use std::fmt;

use keel_store::{InMemoryBackend, Op, StorageBackend};
use keel_types::{Life, ServiceName, Status, StatusInfo, UnitName};
use tracing::{debug, info};

use crate::{
    docs::{Annotations, ServiceDoc, Services, Statuses, UnitDoc, Units, service_key, unit_key},
    error::{Result, StateError},
    state::State,
    unit::Unit,
};

/// Handle to a service.
pub struct Service<B: StorageBackend = InMemoryBackend> {
    st: State<B>,
    doc: ServiceDoc,
}

impl<B: StorageBackend> Clone for Service<B> {
    fn clone(&self) -> Self {
        Self { st: self.st.clone(), doc: self.doc.clone() }
    }
}

impl<B: StorageBackend> fmt::Debug for Service<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Service")
            .field("name", &self.doc.name)
            .field("life", &self.doc.life)
            .finish_non_exhaustive()
    }
}

impl<B: StorageBackend + 'static> Service<B> {
    pub(crate) fn new(st: State<B>, doc: ServiceDoc) -> Self {
        Self { st, doc }
    }

    /// Service name.
    pub fn name(&self) -> &ServiceName {
        &self.doc.name
    }

    /// Whether units of this service are subordinates.
    pub fn is_subordinate(&self) -> bool {
        self.doc.subordinate
    }

    /// Life as of the last read.
    pub fn life(&self) -> Life {
        self.doc.life
    }

    /// Adds a principal unit.
    ///
    /// # Errors
    ///
    /// [`StateError::NotValid`] for subordinate services or a service that
    /// is not alive.
    pub fn add_unit(&self) -> Result<Unit<B>> {
        if self.doc.subordinate {
            return Err(StateError::not_valid(format!(
                "cannot directly add units to subordinate service {:?}",
                self.doc.name.as_str()
            )));
        }
        self.insert_unit(None)
    }

    /// Adds a subordinate unit of this service alongside `principal`.
    ///
    /// # Errors
    ///
    /// - [`StateError::NotValid`] if this service is not subordinate,
    ///   `principal` is itself a subordinate, or either is not alive.
    /// - [`StateError::AlreadyExists`] if `principal` already has a unit of
    ///   this service.
    pub fn add_subordinate_unit(&self, principal: &Unit<B>) -> Result<Unit<B>> {
        if !self.doc.subordinate {
            return Err(StateError::not_valid(format!(
                "cannot add subordinate unit to principal service {:?}",
                self.doc.name.as_str()
            )));
        }
        if !principal.is_principal() {
            return Err(StateError::not_valid(format!(
                "cannot add subordinate unit to subordinate unit {:?}",
                principal.name().as_str()
            )));
        }
        self.insert_unit(Some(principal.name()))
    }

    fn insert_unit(&self, principal: Option<&UnitName>) -> Result<Unit<B>> {
        let service = self.doc.name.clone();
        let what = format!("cannot add unit to service {:?}", service.as_str());
        let mut created = None;
        self.st
            .runner()
            .run(|_| {
                let Some(svc) = self.st.db().get::<Services>(service.as_str())? else {
                    return Err(StateError::not_found(format!("service {:?}", service.as_str())));
                };
                if svc.doc.life != Life::Alive {
                    return Err(StateError::not_valid(format!("{what}: service is not alive")));
                }
                let name = UnitName::new(format!("{service}/{}", svc.doc.unit_seq));
                let mut doc = UnitDoc {
                    name: name.clone(),
                    service: service.clone(),
                    life: Life::Alive,
                    principal: principal.cloned(),
                    subordinates: Vec::new(),
                    machine_id: None,
                };
                let mut ops = vec![
                    Op::on::<Services>(service.as_str()).revno(svc.revno).update(|s| {
                        s.unit_seq += 1;
                        s.unit_count += 1;
                    }),
                ];
                if let Some(principal) = principal {
                    let Some(host) = self.st.db().get::<Units>(principal.as_str())? else {
                        return Err(StateError::not_found(format!("unit {:?}", principal.as_str())));
                    };
                    if host.doc.life != Life::Alive {
                        return Err(StateError::not_valid(format!(
                            "{what}: unit {:?} is not alive",
                            principal.as_str()
                        )));
                    }
                    if host.doc.subordinates.iter().any(|s| s.service() == service) {
                        return Err(StateError::AlreadyExists {
                            message: format!(
                                "{what}: unit {:?} already has a subordinate of service {:?}",
                                principal.as_str(),
                                service.as_str()
                            ),
                        });
                    }
                    doc.machine_id = host.doc.machine_id.clone();
                    let sub = name.clone();
                    ops.push(
                        Op::on::<Units>(principal.as_str())
                            .revno(host.revno)
                            .update(move |u| u.subordinates.push(sub)),
                    );
                }
                ops.push(Op::on::<Units>(name.as_str()).missing().insert(doc.clone()));
                ops.push(Op::on::<Statuses>(unit_key(&name)).insert(StatusInfo {
                    status: Status::Pending,
                    ..StatusInfo::default()
                }));
                created = Some(doc);
                Ok(Some(ops))
            })
            .map_err(|e| e.with_context(what.clone()))?;
        let doc = created.ok_or_else(|| StateError::not_valid(what))?;
        debug!(unit = %doc.name, service = %service, "Added unit");
        Ok(Unit::new(self.st.clone(), doc))
    }

    /// Every unit of this service, ordered by name.
    ///
    /// # Errors
    ///
    /// [`StateError::Closed`] after close.
    pub fn all_units(&self) -> Result<Vec<Unit<B>>> {
        let service = self.doc.name.clone();
        let records = self.st.db().find::<Units>(move |u| u.service == service)?;
        Ok(records.into_iter().map(|r| Unit::new(self.st.clone(), r.doc)).collect())
    }

    /// Starts tearing the service down.
    ///
    /// A service without units is removed at once; otherwise it becomes
    /// `Dying` and is removed with its last unit.
    ///
    /// # Errors
    ///
    /// [`StateError::Contention`] if the service keeps changing.
    pub fn destroy(&mut self) -> Result<()> {
        let name = self.doc.name.clone();
        let mut observed = None;
        self.st
            .runner()
            .run(|_| {
                let Some(svc) = self.st.db().get::<Services>(name.as_str())? else {
                    observed = Some(Life::Removed);
                    return Ok(None);
                };
                if svc.doc.life != Life::Alive {
                    observed = Some(svc.doc.life);
                    return Ok(None);
                }
                if svc.doc.unit_count == 0 {
                    observed = Some(Life::Removed);
                    return Ok(Some(vec![
                        Op::on::<Services>(name.as_str()).revno(svc.revno).remove(),
                        Op::on::<Annotations>(service_key(&name)).remove(),
                    ]));
                }
                observed = Some(Life::Dying);
                Ok(Some(vec![
                    Op::on::<Services>(name.as_str())
                        .revno(svc.revno)
                        .update(|s| s.life = Life::Dying),
                ]))
            })
            .map_err(|e| e.with_context(format!("cannot destroy service {:?}", name.as_str())))?;
        if let Some(life) = observed {
            self.doc.life = self.doc.life.max(life);
        }
        info!(service = %name, life = %self.doc.life, "Destroyed service");
        Ok(())
    }

    /// Re-reads the service.
    ///
    /// # Errors
    ///
    /// [`StateError::NotFound`] once removed.
    pub fn refresh(&mut self) -> Result<()> {
        match self.st.db().get::<Services>(self.doc.name.as_str())? {
            Some(record) => {
                self.doc = record.doc;
                Ok(())
            },
            None => Err(StateError::not_found(format!("service {:?}", self.doc.name.as_str()))),
        }
    }
}
