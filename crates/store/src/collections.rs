//! Fixed collection definitions for the record store.
//!
//! Every collection is known at compile time. Typed access goes through the
//! [`Collection`] trait, which binds a [`CollectionId`] to the document type
//! stored in it; the binding itself lives with the code that owns the
//! document.

use std::fmt;

use serde::{Deserialize, Serialize, de::DeserializeOwned};

/// Compile-time collection identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(u8)]
pub enum CollectionId {
    // ========================================================================
    // Entities
    // ========================================================================
    /// Machine documents keyed by machine id.
    Machines = 0,
    /// Units keyed by unit name.
    Units = 1,
    /// Services keyed by service name.
    Services = 2,

    // ========================================================================
    // Machine children
    // ========================================================================
    /// Container references: machine id -> child container ids.
    Containers = 3,
    /// Provisioned instance data keyed by machine id.
    Instances = 4,
    /// Constraints keyed by entity global key.
    Constraints = 5,
    /// Agent status keyed by entity global key.
    Statuses = 6,
    /// Networks requested for a machine, keyed by machine global key.
    RequestedNetworks = 7,
    /// Network interfaces keyed by `<machine>#<interface>`.
    Interfaces = 8,
    /// Annotations keyed by entity global key.
    Annotations = 9,

    // ========================================================================
    // Model-wide records
    // ========================================================================
    /// Known networks keyed by network name.
    Networks = 10,
    /// Lease claims keyed by `<namespace>#<lease>`.
    Leases = 11,
    /// Pending cleanup jobs.
    Cleanups = 12,
    /// Model settings singleton.
    Settings = 13,
    /// Id sequences keyed by sequence name.
    Sequences = 14,
}

impl CollectionId {
    /// Number of collections.
    pub const COUNT: usize = 15;

    /// All collections in declaration order.
    pub const ALL: [CollectionId; Self::COUNT] = [
        CollectionId::Machines,
        CollectionId::Units,
        CollectionId::Services,
        CollectionId::Containers,
        CollectionId::Instances,
        CollectionId::Constraints,
        CollectionId::Statuses,
        CollectionId::RequestedNetworks,
        CollectionId::Interfaces,
        CollectionId::Annotations,
        CollectionId::Networks,
        CollectionId::Leases,
        CollectionId::Cleanups,
        CollectionId::Settings,
        CollectionId::Sequences,
    ];

    /// Returns the collection name.
    pub const fn name(self) -> &'static str {
        match self {
            CollectionId::Machines => "machines",
            CollectionId::Units => "units",
            CollectionId::Services => "services",
            CollectionId::Containers => "containers",
            CollectionId::Instances => "instances",
            CollectionId::Constraints => "constraints",
            CollectionId::Statuses => "statuses",
            CollectionId::RequestedNetworks => "requested_networks",
            CollectionId::Interfaces => "interfaces",
            CollectionId::Annotations => "annotations",
            CollectionId::Networks => "networks",
            CollectionId::Leases => "leases",
            CollectionId::Cleanups => "cleanups",
            CollectionId::Settings => "settings",
            CollectionId::Sequences => "sequences",
        }
    }

    /// Returns the position of this collection in [`CollectionId::ALL`].
    pub const fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for CollectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Binds a collection id to its document type.
pub trait Collection: Send + Sync + 'static {
    /// The collection this type reads and writes.
    const ID: CollectionId;

    /// The stored document.
    type Doc: Serialize + DeserializeOwned + Clone + fmt::Debug + Send + Sync + 'static;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_is_in_discriminant_order() {
        for (i, collection) in CollectionId::ALL.iter().enumerate() {
            assert_eq!(collection.index(), i, "{collection} out of order");
        }
    }

    #[test]
    fn test_names_are_unique() {
        let mut names: Vec<&str> = CollectionId::ALL.iter().map(|c| c.name()).collect();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), CollectionId::COUNT);
    }
}
