//! Persisted documents and their collection bindings.
//!
//! Each document type is bound to one [`CollectionId`] through a marker type
//! implementing [`Collection`]. Per-entity satellite records (status,
//! constraints, annotations) are keyed by the entity's global key so they
//! can be shared by machines, units, and services.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use keel_store::{Collection, CollectionId};
use keel_types::{
    Address, Constraints, ContainerType, HardwareCharacteristics, Life, MachineId, MachineJob,
    ServiceName, StatusInfo, UnitName,
};
use serde::{Deserialize, Serialize};

/// Global key of a machine's satellite records.
pub(crate) fn machine_key(id: &MachineId) -> String {
    format!("m#{id}")
}

/// Global key of a unit's satellite records.
pub(crate) fn unit_key(name: &UnitName) -> String {
    format!("u#{name}")
}

/// Global key of a service's satellite records.
pub(crate) fn service_key(name: &ServiceName) -> String {
    format!("s#{name}")
}

/// Record id of a network interface.
pub(crate) fn interface_key(machine: &MachineId, interface: &str) -> String {
    format!("{machine}#{interface}")
}

/// Record id of a lease.
pub(crate) fn lease_key(namespace: &str, name: &str) -> String {
    format!("{namespace}#{name}")
}

/// Id of the model settings singleton.
pub(crate) const SETTINGS_ID: &str = "model";

macro_rules! bind {
    ($marker:ident, $id:expr, $doc:ty) => {
        pub(crate) struct $marker;

        impl Collection for $marker {
            const ID: CollectionId = $id;
            type Doc = $doc;
        }
    };
}

// ============================================================================
// Entities
// ============================================================================

/// A machine or container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct MachineDoc {
    pub id: MachineId,
    pub series: String,
    pub jobs: Vec<MachineJob>,
    pub life: Life,
    /// Principal units assigned here.
    pub principals: Vec<UnitName>,
    pub has_vote: bool,
    pub wants_vote: bool,
    /// False once a unit has ever been assigned.
    pub clean: bool,
    /// Set with the instance id when provisioned.
    pub nonce: String,
    /// Provider-reported addresses.
    pub addresses: Vec<Address>,
    /// Agent-reported addresses.
    pub machine_addresses: Vec<Address>,
    /// `None` until the agent reports what it can host.
    pub supported_containers: Option<Vec<ContainerType>>,
    pub agent_version: Option<String>,
}

impl MachineDoc {
    pub fn is_manager(&self) -> bool {
        self.jobs.contains(&MachineJob::ManageEnviron)
    }
}

bind!(Machines, CollectionId::Machines, MachineDoc);

/// A unit of a service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct UnitDoc {
    pub name: UnitName,
    pub service: ServiceName,
    pub life: Life,
    /// Set for subordinate units.
    pub principal: Option<UnitName>,
    pub subordinates: Vec<UnitName>,
    /// Machine a principal is assigned to.
    pub machine_id: Option<MachineId>,
}

bind!(Units, CollectionId::Units, UnitDoc);

/// A service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct ServiceDoc {
    pub name: ServiceName,
    pub subordinate: bool,
    pub life: Life,
    /// Next unit sequence number.
    pub unit_seq: u64,
    /// Units currently stored.
    pub unit_count: u64,
}

bind!(Services, CollectionId::Services, ServiceDoc);

// ============================================================================
// Machine children
// ============================================================================

/// Containers hosted by a machine.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct ContainerRefsDoc {
    pub children: Vec<MachineId>,
}

bind!(ContainerRefs, CollectionId::Containers, ContainerRefsDoc);

/// Provisioned instance of a machine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct InstanceDoc {
    pub instance_id: String,
    pub status: String,
    pub hardware: HardwareCharacteristics,
}

bind!(Instances, CollectionId::Instances, InstanceDoc);
bind!(ConstraintsColl, CollectionId::Constraints, Constraints);
bind!(Statuses, CollectionId::Statuses, StatusInfo);

/// Networks a machine was asked to join.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct RequestedNetworksDoc {
    pub networks: Vec<String>,
}

bind!(RequestedNetworks, CollectionId::RequestedNetworks, RequestedNetworksDoc);

/// A network interface of a machine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct InterfaceDoc {
    pub machine_id: MachineId,
    pub interface_name: String,
    pub mac_address: String,
    pub network_name: String,
    pub is_virtual: bool,
    pub disabled: bool,
}

bind!(Interfaces, CollectionId::Interfaces, InterfaceDoc);

/// Free-form key/value annotations of an entity.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct AnnotationsDoc {
    pub entries: BTreeMap<String, String>,
}

bind!(Annotations, CollectionId::Annotations, AnnotationsDoc);

// ============================================================================
// Model-wide records
// ============================================================================

/// A known network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct NetworkDoc {
    pub name: String,
    pub provider_id: String,
    pub cidr: String,
    pub vlan_tag: u16,
    /// MAC addresses of interfaces on this network.
    pub macs: BTreeSet<String>,
}

bind!(Networks, CollectionId::Networks, NetworkDoc);

/// A lease claim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct LeaseDoc {
    pub namespace: String,
    pub name: String,
    pub holder: String,
    pub start: DateTime<Utc>,
    pub expiry: DateTime<Utc>,
}

impl LeaseDoc {
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.expiry > now
    }
}

bind!(Leases, CollectionId::Leases, LeaseDoc);

/// Deferred work processed by `State::cleanup`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) enum CleanupDoc {
    /// Tear down a machine's units and containers, then mark it dead.
    ForceDestroyMachine(MachineId),
}

bind!(Cleanups, CollectionId::Cleanups, CleanupDoc);

/// Model settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct SettingsDoc {
    pub prefer_ipv6: bool,
    pub constraints: Constraints,
}

bind!(Settings, CollectionId::Settings, SettingsDoc);

/// An id sequence.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct SequenceDoc {
    pub next: u64,
}

bind!(Sequences, CollectionId::Sequences, SequenceDoc);
