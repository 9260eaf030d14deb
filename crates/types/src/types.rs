//! Entity identifiers and the attribute vocabulary stored on machines and units.

use std::{borrow::Borrow, collections::BTreeMap, fmt, str::FromStr};

use serde::{Deserialize, Serialize};

// ============================================================================
// Identifier newtypes
// ============================================================================

/// Generates a string-backed identifier newtype with tag support.
///
/// Each generated type provides:
/// - `new()` / `as_str()` / `into_inner()` accessors
/// - `tag()` producing `"<kind>-<id with '/' replaced by '-'>"`
/// - `Display` (the bare id), `From<&str>`, `From<String>`, `Borrow<str>`
/// - Serde transparent serialization
macro_rules! define_name {
    (
        $(#[$meta:meta])*
        $name:ident, $tag_kind:expr
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Creates an identifier from a raw string without validation.
            #[inline]
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            /// Returns the raw identifier.
            #[inline]
            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// Consumes the identifier, returning the raw string.
            #[inline]
            pub fn into_inner(self) -> String {
                self.0
            }

            /// Returns the entity tag, e.g. `machine-0-lxc-1`.
            pub fn tag(&self) -> String {
                format!("{}-{}", $tag_kind, self.0.replace('/', "-"))
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            #[inline]
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl From<String> for $name {
            #[inline]
            fn from(value: String) -> Self {
                Self(value)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl Borrow<str> for $name {
            fn borrow(&self) -> &str {
                &self.0
            }
        }
    };
}

define_name!(
    /// Identifier of a machine.
    ///
    /// Top-level machines are decimal sequence numbers (`"0"`, `"1"`); containers
    /// append `/<container-type>/<n>` to their parent's id (`"1/lxc/0"`).
    MachineId, "machine"
);

define_name!(
    /// Name of a service, e.g. `wordpress`.
    ServiceName, "service"
);

define_name!(
    /// Name of a unit: `<service>/<sequence>`, e.g. `wordpress/0`.
    UnitName, "unit"
);

impl MachineId {
    /// Returns the id of the machine hosting this container, if any.
    pub fn parent_id(&self) -> Option<MachineId> {
        let (parent, _) = self.0.rsplit_once('/')?;
        let (parent, _) = parent.rsplit_once('/')?;
        Some(MachineId::new(parent))
    }

    /// Returns the container type of this machine if it is a container.
    pub fn container_type(&self) -> Option<ContainerType> {
        let parts: Vec<&str> = self.0.rsplitn(3, '/').collect();
        match parts.as_slice() {
            [_, kind, _] => kind.parse().ok(),
            _ => None,
        }
    }

    /// Whether this id names a container rather than a top-level machine.
    pub fn is_container(&self) -> bool {
        self.0.contains('/')
    }

    /// Builds the id of the `n`th container of `kind` inside this machine.
    pub fn child(&self, kind: ContainerType, n: u64) -> MachineId {
        MachineId(format!("{}/{}/{}", self.0, kind, n))
    }
}

impl UnitName {
    /// Returns the service this unit belongs to.
    pub fn service(&self) -> ServiceName {
        match self.0.split_once('/') {
            Some((service, _)) => ServiceName::new(service),
            None => ServiceName::new(self.0.clone()),
        }
    }
}

// ============================================================================
// Life
// ============================================================================

/// Life state of an entity.
///
/// The order is total and transitions only ever move forward:
/// `Alive < Dying < Dead < Removed`. `Removed` is never persisted; it is what
/// an observer records once the record has been deleted.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub enum Life {
    /// Entity is in normal operation.
    #[default]
    Alive,
    /// Entity is being torn down; dependents are draining.
    Dying,
    /// Entity is finished and may be removed.
    Dead,
    /// Record deleted.
    Removed,
}

impl Life {
    /// Whether moving from `self` to `next` respects monotonicity.
    #[must_use]
    pub fn can_become(self, next: Life) -> bool {
        next >= self
    }

    /// Returns the string form used in status output.
    pub const fn as_str(self) -> &'static str {
        match self {
            Life::Alive => "alive",
            Life::Dying => "dying",
            Life::Dead => "dead",
            Life::Removed => "removed",
        }
    }
}

impl fmt::Display for Life {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Machine attributes
// ============================================================================

/// Responsibility assigned to a machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum MachineJob {
    /// The machine may host service units.
    HostUnits,
    /// The machine runs the controller. Such a machine never leaves `Alive`.
    ManageEnviron,
}

impl fmt::Display for MachineJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MachineJob::HostUnits => f.write_str("JobHostUnits"),
            MachineJob::ManageEnviron => f.write_str("JobManageEnviron"),
        }
    }
}

/// Kind of container a machine may be, or may host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ContainerType {
    /// Sentinel meaning "no container"; not valid as a supported container.
    None,
    /// LXC system container.
    Lxc,
    /// KVM virtual machine.
    Kvm,
}

impl ContainerType {
    /// Returns the lowercase name used in ids.
    pub const fn as_str(self) -> &'static str {
        match self {
            ContainerType::None => "none",
            ContainerType::Lxc => "lxc",
            ContainerType::Kvm => "kvm",
        }
    }
}

impl fmt::Display for ContainerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ContainerType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(ContainerType::None),
            "lxc" => Ok(ContainerType::Lxc),
            "kvm" => Ok(ContainerType::Kvm),
            other => Err(format!("invalid container type {other:?}")),
        }
    }
}

/// Agent-reported status of a machine or unit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Status {
    /// Not started yet.
    #[default]
    Pending,
    /// Unit charm installed.
    Installed,
    /// Agent running.
    Started,
    /// Agent stopped cleanly.
    Stopped,
    /// Agent reported an error; must carry info.
    Error,
    /// Agent unreachable. Derived, never set directly.
    Down,
}

impl Status {
    /// Returns the lowercase status name.
    pub const fn as_str(self) -> &'static str {
        match self {
            Status::Pending => "pending",
            Status::Installed => "installed",
            Status::Started => "started",
            Status::Stopped => "stopped",
            Status::Error => "error",
            Status::Down => "down",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status value with its free-form message and structured data.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusInfo {
    /// The status itself.
    pub status: Status,
    /// Human readable detail.
    pub info: String,
    /// Structured detail, e.g. `{"type": "lxc"}`.
    pub data: BTreeMap<String, String>,
}

/// Hardware of a provisioned instance. Unknown values are `None`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HardwareCharacteristics {
    /// CPU architecture, e.g. `amd64`.
    pub arch: Option<String>,
    /// Memory in MiB.
    pub mem: Option<u64>,
    /// Root disk in MiB.
    pub root_disk: Option<u64>,
    /// Number of cores.
    pub cpu_cores: Option<u64>,
    /// Relative CPU power (100 = one 2007-era core).
    pub cpu_power: Option<u64>,
    /// Provider tags.
    pub tags: Option<Vec<String>>,
    /// Availability zone.
    pub availability_zone: Option<String>,
}

/// Resource constraints requested for a machine.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Constraints {
    /// Required architecture.
    pub arch: Option<String>,
    /// Minimum core count.
    pub cpu_cores: Option<u64>,
    /// Minimum CPU power.
    pub cpu_power: Option<u64>,
    /// Minimum memory in MiB.
    pub mem: Option<u64>,
    /// Minimum root disk in MiB.
    pub root_disk: Option<u64>,
    /// Container type to place the machine in.
    pub container: Option<ContainerType>,
    /// Required provider tags.
    pub tags: Option<Vec<String>>,
}

impl Constraints {
    /// Returns `self` with unset fields filled from `fallback`.
    #[must_use]
    pub fn with_fallback(&self, fallback: &Constraints) -> Constraints {
        Constraints {
            arch: self.arch.clone().or_else(|| fallback.arch.clone()),
            cpu_cores: self.cpu_cores.or(fallback.cpu_cores),
            cpu_power: self.cpu_power.or(fallback.cpu_power),
            mem: self.mem.or(fallback.mem),
            root_disk: self.root_disk.or(fallback.root_disk),
            container: self.container.or(fallback.container),
            tags: self.tags.clone().or_else(|| fallback.tags.clone()),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::disallowed_methods)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn test_machine_tag_replaces_slashes() {
        assert_eq!(MachineId::new("1").tag(), "machine-1");
        assert_eq!(MachineId::new("1/lxc/0").tag(), "machine-1-lxc-0");
        assert_eq!(UnitName::new("wordpress/0").tag(), "unit-wordpress-0");
    }

    #[test]
    fn test_container_parent_and_type() {
        let id = MachineId::new("1/lxc/0");
        assert_eq!(id.parent_id(), Some(MachineId::new("1")));
        assert_eq!(id.container_type(), Some(ContainerType::Lxc));
        assert!(id.is_container());

        let nested = MachineId::new("1/lxc/0/kvm/2");
        assert_eq!(nested.parent_id(), Some(MachineId::new("1/lxc/0")));
        assert_eq!(nested.container_type(), Some(ContainerType::Kvm));

        let top = MachineId::new("7");
        assert_eq!(top.parent_id(), None);
        assert_eq!(top.container_type(), None);
        assert!(!top.is_container());
    }

    #[test]
    fn test_child_id() {
        let parent = MachineId::new("2");
        assert_eq!(parent.child(ContainerType::Kvm, 3).as_str(), "2/kvm/3");
    }

    #[test]
    fn test_unit_service() {
        assert_eq!(UnitName::new("logging/12").service().as_str(), "logging");
    }

    #[test]
    fn test_container_type_parse() {
        assert_eq!("lxc".parse::<ContainerType>(), Ok(ContainerType::Lxc));
        assert_eq!("none".parse::<ContainerType>(), Ok(ContainerType::None));
        assert!("docker".parse::<ContainerType>().is_err());
    }

    #[test]
    fn test_constraints_fallback_prefers_own_values() {
        let own = Constraints { mem: Some(4096), ..Constraints::default() };
        let model = Constraints {
            mem: Some(1024),
            cpu_cores: Some(2),
            ..Constraints::default()
        };
        let merged = own.with_fallback(&model);
        assert_eq!(merged.mem, Some(4096));
        assert_eq!(merged.cpu_cores, Some(2));
    }

    fn life_strategy() -> impl Strategy<Value = Life> {
        prop_oneof![Just(Life::Alive), Just(Life::Dying), Just(Life::Dead), Just(Life::Removed)]
    }

    proptest! {
        #[test]
        fn prop_can_become_matches_order(a in life_strategy(), b in life_strategy()) {
            prop_assert_eq!(a.can_become(b), a <= b);
        }
    }
}
