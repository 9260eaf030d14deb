//! The state session.
//!
//! [`State`] is a cheap, cloneable handle to one model's control-plane
//! records. It owns the store, the transaction runner, the watcher hub, the
//! clock, and the configuration; entity handles ([`Machine`], [`Service`],
//! [`Unit`]) borrow all of that through a clone of it.

use std::{collections::BTreeSet, fmt, sync::Arc};

use keel_store::{Database, InMemoryBackend, Op, Record, StorageBackend};
use keel_types::{
    Address, Clock, Constraints, ContainerType, HardwareCharacteristics, Life, MachineId,
    MachineJob, ServiceName, Status, StatusInfo, SystemClock, UnitName, config::StateConfig,
    validation,
};
use tracing::{debug, info};

use crate::{
    docs::{
        ConstraintsColl, ContainerRefs, ContainerRefsDoc, InstanceDoc, Instances, MachineDoc,
        Machines, RequestedNetworks, RequestedNetworksDoc, SETTINGS_ID, SequenceDoc, Sequences,
        Services, Settings, SettingsDoc, Statuses, Units, machine_key,
    },
    error::{Result, StateError},
    lease::{Claimer, LeaseManager, Secretary, SingularSecretary},
    machine::Machine,
    service::Service,
    txn::{HookCheck, HookFn, TestHook, TxnRunner},
    unit::Unit,
    watcher::{LeasesWatch, Watcher, WatcherHub},
};

/// Lease namespace used for controller singleton leases.
pub const SINGULAR_NAMESPACE: &str = "singular-controller";

/// Everything needed to create a machine.
#[derive(Debug, Clone, Default, bon::Builder)]
pub struct MachineTemplate {
    /// OS series, e.g. `trusty`.
    #[builder(into)]
    pub series: String,
    /// Jobs; must be non-empty and without duplicates.
    pub jobs: Vec<MachineJob>,
    /// Constraints recorded for the provisioner.
    #[builder(default)]
    pub constraints: Constraints,
    /// Networks the machine should join.
    #[builder(default)]
    pub requested_networks: Vec<String>,
    /// Instance id, for machines that already exist in the provider.
    #[builder(into)]
    pub instance_id: Option<String>,
    /// Provisioning nonce; required with `instance_id`.
    #[builder(into)]
    pub nonce: Option<String>,
    /// Hardware of the existing instance.
    pub hardware: Option<HardwareCharacteristics>,
    /// Provider addresses known up front.
    #[builder(default)]
    pub addresses: Vec<Address>,
    /// Keep a manager machine out of the replica set vote.
    #[builder(default)]
    pub no_vote: bool,
}

impl MachineTemplate {
    fn validate(&self, container: bool) -> Result<()> {
        let fail = |reason: &str| {
            Err(StateError::not_valid(format!("cannot add a new machine: {reason}")))
        };
        if self.series.is_empty() {
            return fail("no series specified");
        }
        if self.jobs.is_empty() {
            return fail("no jobs specified");
        }
        for (i, job) in self.jobs.iter().enumerate() {
            if self.jobs[..i].contains(job) {
                return fail(&format!("duplicate job: {job}"));
            }
        }
        if self.instance_id.is_some() && self.nonce.as_deref().unwrap_or_default().is_empty() {
            return fail("cannot add a machine with an instance id and no nonce");
        }
        if container && self.jobs.contains(&MachineJob::ManageEnviron) {
            return fail("a container cannot manage the environment");
        }
        Ok(())
    }
}

struct StateInner<B: StorageBackend> {
    db: Arc<Database<B>>,
    config: StateConfig,
    clock: Arc<dyn Clock>,
    runner: Arc<TxnRunner<B>>,
    hub: WatcherHub<B>,
}

/// Handle to a model's control-plane state.
pub struct State<B: StorageBackend = InMemoryBackend> {
    inner: Arc<StateInner<B>>,
}

impl<B: StorageBackend> Clone for State<B> {
    fn clone(&self) -> Self {
        Self { inner: Arc::clone(&self.inner) }
    }
}

impl<B: StorageBackend> fmt::Debug for State<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("State")
            .field("model_uuid", &self.inner.config.model_uuid)
            .field("closed", &self.inner.db.is_closed())
            .finish_non_exhaustive()
    }
}

impl State<InMemoryBackend> {
    /// Opens state over a fresh in-memory store using the system clock.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::NotValid`] if `config` does not validate.
    pub fn in_memory(config: StateConfig) -> Result<Self> {
        Self::in_memory_with_clock(config, Arc::new(SystemClock))
    }

    /// Opens state over a fresh in-memory store using `clock`.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::NotValid`] if `config` does not validate.
    pub fn in_memory_with_clock(config: StateConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        let db = Database::open_in_memory_with_config(keel_store::DatabaseConfig {
            change_capacity: config.watcher.channel_capacity,
            ..keel_store::DatabaseConfig::default()
        })?;
        Self::open(db, config, clock)
    }
}

impl<B: StorageBackend + 'static> State<B> {
    /// Opens state over `db`.
    ///
    /// Creates the model settings record if the store is empty.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::NotValid`] if `config` does not validate, or a
    /// store error if the settings record cannot be written.
    pub fn open(db: Database<B>, config: StateConfig, clock: Arc<dyn Clock>) -> Result<Self> {
        config.validate().map_err(|e| StateError::not_valid(e.to_string()))?;
        let db = Arc::new(db);
        if db.get::<Settings>(SETTINGS_ID)?.is_none() {
            db.commit(vec![Op::on::<Settings>(SETTINGS_ID).missing().insert(SettingsDoc::default())])?;
        }
        let runner = Arc::new(TxnRunner::new(Arc::clone(&db), config.txn.max_attempts));
        let hub = WatcherHub::new(Arc::clone(&db), config.watcher.channel_capacity);
        info!(model_uuid = %config.model_uuid, "Opened state");
        Ok(Self { inner: Arc::new(StateInner { db, config, clock, runner, hub }) })
    }

    pub(crate) fn db(&self) -> &Arc<Database<B>> {
        &self.inner.db
    }

    pub(crate) fn runner(&self) -> &Arc<TxnRunner<B>> {
        &self.inner.runner
    }

    pub(crate) fn hub(&self) -> &WatcherHub<B> {
        &self.inner.hub
    }

    /// Configuration this state was opened with.
    pub fn config(&self) -> &StateConfig {
        &self.inner.config
    }

    /// Clock used for lease expiry.
    pub fn clock(&self) -> Arc<dyn Clock> {
        Arc::clone(&self.inner.clock)
    }

    /// Closes the session.
    ///
    /// Every watcher's channel closes and later operations fail with
    /// [`StateError::Closed`]. Closing twice is a no-op.
    pub fn close(&self) {
        self.inner.db.close();
    }

    /// Whether [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.inner.db.is_closed()
    }

    // ========================================================================
    // Test hooks
    // ========================================================================

    /// Runs each closure just before one upcoming commit attempt.
    pub fn set_before_hooks(&self, hooks: Vec<HookFn>) -> HookCheck {
        self.set_transaction_hooks(
            hooks.into_iter().map(|f| TestHook { before: Some(f), after: None }).collect(),
        )
    }

    /// Runs each closure just after one upcoming commit attempt.
    pub fn set_after_hooks(&self, hooks: Vec<HookFn>) -> HookCheck {
        self.set_transaction_hooks(
            hooks.into_iter().map(|f| TestHook { before: None, after: Some(f) }).collect(),
        )
    }

    /// Installs hooks consumed one per commit attempt.
    pub fn set_transaction_hooks(&self, hooks: Vec<TestHook>) -> HookCheck {
        self.inner.runner.set_hooks(hooks)
    }

    /// Total commit attempts made through this session.
    pub fn txn_attempts(&self) -> u64 {
        self.inner.runner.attempts()
    }

    // ========================================================================
    // Model settings
    // ========================================================================

    fn settings(&self) -> Result<SettingsDoc> {
        Ok(self.inner.db.get::<Settings>(SETTINGS_ID)?.map(|r| r.doc).unwrap_or_default())
    }

    /// Whether merged address lists put IPv6 first.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::Closed`] after close.
    pub fn prefer_ipv6(&self) -> Result<bool> {
        Ok(self.settings()?.prefer_ipv6)
    }

    /// Sets the address ordering preference.
    ///
    /// # Errors
    ///
    /// Returns a store error if the write fails.
    pub fn set_prefer_ipv6(&self, prefer: bool) -> Result<()> {
        self.inner
            .runner
            .run_once(vec![Op::on::<Settings>(SETTINGS_ID).update(move |s| s.prefer_ipv6 = prefer)])?;
        Ok(())
    }

    /// Model-wide default constraints.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::Closed`] after close.
    pub fn model_constraints(&self) -> Result<Constraints> {
        Ok(self.settings()?.constraints)
    }

    /// Replaces the model-wide default constraints.
    ///
    /// # Errors
    ///
    /// Returns a store error if the write fails.
    pub fn set_model_constraints(&self, constraints: Constraints) -> Result<()> {
        self.inner.runner.run_once(vec![
            Op::on::<Settings>(SETTINGS_ID).update(move |s| s.constraints = constraints),
        ])?;
        Ok(())
    }

    // ========================================================================
    // Machines
    // ========================================================================

    pub(crate) fn machine_record(&self, id: &MachineId) -> Result<Option<Record<MachineDoc>>> {
        Ok(self.inner.db.get::<Machines>(id.as_str())?)
    }

    /// Loads a machine.
    ///
    /// # Errors
    ///
    /// - [`StateError::NotValid`] if `id` is not a machine id.
    /// - [`StateError::NotFound`] if no such machine exists.
    pub fn machine(&self, id: &str) -> Result<Machine<B>> {
        if !validation::is_valid_machine_id(id) {
            return Err(StateError::not_valid(format!("{id:?} is not a valid machine id")));
        }
        let id = MachineId::new(id);
        match self.machine_record(&id)? {
            Some(record) => Ok(Machine::new(self.clone(), record.doc)),
            None => Err(StateError::not_found(format!("machine {id}"))),
        }
    }

    /// Loads every machine, ordered by id.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::Closed`] after close.
    pub fn all_machines(&self) -> Result<Vec<Machine<B>>> {
        let records = self.inner.db.all::<Machines>()?;
        Ok(records.into_iter().map(|r| Machine::new(self.clone(), r.doc)).collect())
    }

    /// Adds a top-level machine with `series` and `jobs`.
    ///
    /// # Errors
    ///
    /// See [`add_machine_with`](Self::add_machine_with).
    pub fn add_machine(&self, series: &str, jobs: &[MachineJob]) -> Result<Machine<B>> {
        self.add_machine_with(MachineTemplate {
            series: series.to_string(),
            jobs: jobs.to_vec(),
            ..MachineTemplate::default()
        })
    }

    /// Adds a top-level machine from a template.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::NotValid`] if the template is incomplete.
    pub fn add_machine_with(&self, template: MachineTemplate) -> Result<Machine<B>> {
        template.validate(false)?;
        let mut created = None;
        self.inner
            .runner
            .run(|_| {
                let (n, seq_op) = self.sequence_op("machine")?;
                let id = MachineId::new(n.to_string());
                let doc = new_machine_doc(&id, &template);
                let constraints = template.constraints.with_fallback(&self.model_constraints()?);
                let mut ops = vec![seq_op];
                ops.extend(machine_insert_ops(&doc, &template, constraints));
                created = Some(doc);
                Ok(Some(ops))
            })
            .map_err(|e| e.with_context("cannot add a new machine"))?;
        let doc = created.ok_or_else(|| StateError::not_valid("cannot add a new machine"))?;
        info!(machine = %doc.id, "Added machine");
        Ok(Machine::new(self.clone(), doc))
    }

    /// Adds a container of `kind` inside machine `parent`.
    ///
    /// # Errors
    ///
    /// - [`StateError::NotFound`] if the parent does not exist.
    /// - [`StateError::NotValid`] if the parent is not alive, cannot host
    ///   `kind`, or the template is incomplete.
    pub fn add_machine_inside_machine(
        &self,
        template: MachineTemplate,
        parent: &MachineId,
        kind: ContainerType,
    ) -> Result<Machine<B>> {
        template.validate(true)?;
        if kind == ContainerType::None {
            return Err(StateError::not_valid(
                "cannot add a new machine: no container type specified",
            ));
        }
        let mut created = None;
        self.inner
            .runner
            .run(|_| {
                let Some(host) = self.machine_record(parent)? else {
                    return Err(StateError::not_found(format!("machine {parent}")));
                };
                if host.doc.life != Life::Alive {
                    return Err(StateError::not_valid(format!(
                        "cannot add a new machine: machine {parent} is not alive"
                    )));
                }
                if let Some(supported) = &host.doc.supported_containers {
                    if !supported.contains(&kind) {
                        return Err(StateError::not_valid(format!(
                            "cannot add a new machine: machine {parent} cannot host {kind} containers"
                        )));
                    }
                }
                let (n, seq_op) = self.sequence_op(&format!("container:{parent}/{kind}"))?;
                let id = parent.child(kind, n);
                let doc = new_machine_doc(&id, &template);
                let child = id.clone();
                let mut ops = vec![
                    seq_op,
                    Op::on::<Machines>(parent.as_str()).matches(|m| m.life == Life::Alive).check(),
                    Op::on::<ContainerRefs>(parent.as_str())
                        .exists()
                        .update(move |refs| refs.children.push(child)),
                ];
                let constraints = template.constraints.with_fallback(&self.model_constraints()?);
                ops.extend(machine_insert_ops(&doc, &template, constraints));
                created = Some(doc);
                Ok(Some(ops))
            })
            .map_err(|e| e.with_context("cannot add a new machine"))?;
        let doc = created.ok_or_else(|| StateError::not_valid("cannot add a new machine"))?;
        info!(machine = %doc.id, parent = %parent, "Added container");
        Ok(Machine::new(self.clone(), doc))
    }

    /// Reads sequence `name` and returns its next value with the op that
    /// claims it.
    pub(crate) fn sequence_op(&self, name: &str) -> Result<(u64, Op)> {
        Ok(match self.inner.db.get::<Sequences>(name)? {
            Some(record) => (
                record.doc.next,
                Op::on::<Sequences>(name).revno(record.revno).update(|s| s.next += 1),
            ),
            None => (0, Op::on::<Sequences>(name).missing().insert(SequenceDoc { next: 1 })),
        })
    }

    // ========================================================================
    // Services and units
    // ========================================================================

    /// Adds a service.
    ///
    /// # Errors
    ///
    /// - [`StateError::NotValid`] if `name` is not a valid service name.
    /// - [`StateError::AlreadyExists`] if the service exists.
    pub fn add_service(&self, name: &str, subordinate: bool) -> Result<Service<B>> {
        if !validation::is_valid_service_name(name) {
            return Err(StateError::not_valid(format!("invalid service name {name:?}")));
        }
        let doc = crate::docs::ServiceDoc {
            name: ServiceName::new(name),
            subordinate,
            life: Life::Alive,
            unit_seq: 0,
            unit_count: 0,
        };
        let insert = doc.clone();
        let result = self.inner.runner.run_once(vec![Op::on::<Services>(name).missing().insert(insert)]);
        match result {
            Ok(_) => {},
            Err(e) if e.is_aborted() => {
                return Err(StateError::AlreadyExists {
                    message: format!("cannot add service {name:?}: service already exists"),
                });
            },
            Err(e) => return Err(e.into()),
        }
        debug!(service = name, subordinate, "Added service");
        Ok(Service::new(self.clone(), doc))
    }

    /// Loads a service.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::NotFound`] if no such service exists.
    pub fn service(&self, name: &str) -> Result<Service<B>> {
        match self.inner.db.get::<Services>(name)? {
            Some(record) => Ok(Service::new(self.clone(), record.doc)),
            None => Err(StateError::not_found(format!("service {name:?}"))),
        }
    }

    /// Loads a unit.
    ///
    /// # Errors
    ///
    /// - [`StateError::NotValid`] if `name` is not a unit name.
    /// - [`StateError::NotFound`] if no such unit exists.
    pub fn unit(&self, name: &str) -> Result<Unit<B>> {
        if !validation::is_valid_unit_name(name) {
            return Err(StateError::not_valid(format!("{name:?} is not a valid unit name")));
        }
        match self.inner.db.get::<Units>(name)? {
            Some(record) => Ok(Unit::new(self.clone(), record.doc)),
            None => Err(StateError::not_found(format!("unit {name:?}"))),
        }
    }

    pub(crate) fn unit_by_name(&self, name: &UnitName) -> Result<Option<Unit<B>>> {
        Ok(self.inner.db.get::<Units>(name.as_str())?.map(|r| Unit::new(self.clone(), r.doc)))
    }

    // ========================================================================
    // Leases
    // ========================================================================

    /// Lease manager for `namespace` enforcing `secretary`'s policy.
    pub fn lease_manager(
        &self,
        namespace: &str,
        secretary: Arc<dyn Secretary>,
    ) -> LeaseManager<B> {
        LeaseManager::new(
            Arc::clone(&self.inner.db),
            Arc::clone(&self.inner.runner),
            namespace,
            secretary,
            self.clock(),
            self.inner.config.lease.wait_poll_interval,
        )
    }

    /// Claimer for the controller and model singleton leases.
    ///
    /// Lease names must be this controller's or model's uuid and holders
    /// must be machine tags.
    pub fn singular_claimer(&self) -> Claimer<B> {
        let secretary = SingularSecretary::new(
            self.inner.config.controller_uuid.clone(),
            self.inner.config.model_uuid.clone(),
        );
        Claimer::new(self.lease_manager(SINGULAR_NAMESPACE, Arc::new(secretary)))
    }

    /// Watches lease holders in `namespace`.
    ///
    /// The first event carries every leased name; later events carry the
    /// names whose holder changed or that were released or collected.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::Closed`] after close, or
    /// [`StateError::NotValid`] outside a tokio runtime.
    pub fn watch_leases(&self, namespace: &str) -> Result<Watcher<BTreeSet<String>>> {
        self.inner.hub.watch(LeasesWatch::new(namespace, self.clock()))
    }
}

fn new_machine_doc(id: &MachineId, template: &MachineTemplate) -> MachineDoc {
    let manager = template.jobs.contains(&MachineJob::ManageEnviron);
    MachineDoc {
        id: id.clone(),
        series: template.series.clone(),
        jobs: template.jobs.clone(),
        life: Life::Alive,
        principals: Vec::new(),
        has_vote: false,
        wants_vote: manager && !template.no_vote,
        clean: true,
        nonce: template.nonce.clone().unwrap_or_default(),
        addresses: template.addresses.clone(),
        machine_addresses: Vec::new(),
        supported_containers: None,
        agent_version: None,
    }
}

fn machine_insert_ops(
    doc: &MachineDoc,
    template: &MachineTemplate,
    constraints: Constraints,
) -> Vec<Op> {
    let id = doc.id.as_str();
    let key = machine_key(&doc.id);
    let mut ops = vec![
        Op::on::<Machines>(id).missing().insert(doc.clone()),
        Op::on::<ContainerRefs>(id).missing().insert(ContainerRefsDoc::default()),
        Op::on::<Statuses>(key.clone()).insert(StatusInfo {
            status: Status::Pending,
            ..StatusInfo::default()
        }),
        Op::on::<ConstraintsColl>(key.clone()).insert(constraints),
        Op::on::<RequestedNetworks>(key)
            .insert(RequestedNetworksDoc { networks: template.requested_networks.clone() }),
    ];
    if let Some(instance_id) = &template.instance_id {
        ops.push(Op::on::<Instances>(id).missing().insert(InstanceDoc {
            instance_id: instance_id.clone(),
            status: String::new(),
            hardware: template.hardware.clone().unwrap_or_default(),
        }));
    }
    ops
}
