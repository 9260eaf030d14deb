//! Model-wide networks.

use std::collections::BTreeSet;

use keel_store::{Database, Op, StorageBackend};

use crate::{
    docs::{NetworkDoc, Networks},
    error::{Result, StateError},
    state::State,
};

/// Description of a provider network.
#[derive(Debug, Clone, Default, PartialEq, Eq, bon::Builder)]
pub struct NetworkInfo {
    /// Model-unique name.
    #[builder(into)]
    pub name: String,
    /// Provider-specific id.
    #[builder(into)]
    pub provider_id: String,
    /// Address range, e.g. `10.0.0.0/24`.
    #[builder(into)]
    pub cidr: String,
    /// VLAN tag; 0 for none. Must be below 4095.
    #[builder(default)]
    pub vlan_tag: u16,
}

impl NetworkInfo {
    pub(crate) fn validate(&self) -> std::result::Result<(), String> {
        if self.name.is_empty() {
            return Err("network name must be not empty".to_string());
        }
        if self.provider_id.is_empty() {
            return Err(format!("provider id of network {:?} must be not empty", self.name));
        }
        if self.vlan_tag >= 4095 {
            return Err(format!("invalid VLAN tag {}: must be between 0 and 4094", self.vlan_tag));
        }
        Ok(())
    }

    fn doc(&self) -> NetworkDoc {
        NetworkDoc {
            name: self.name.clone(),
            provider_id: self.provider_id.clone(),
            cidr: self.cidr.clone(),
            vlan_tag: self.vlan_tag,
            macs: BTreeSet::new(),
        }
    }
}

impl From<NetworkDoc> for NetworkInfo {
    fn from(doc: NetworkDoc) -> Self {
        Self { name: doc.name, provider_id: doc.provider_id, cidr: doc.cidr, vlan_tag: doc.vlan_tag }
    }
}

/// Ops that create `info` unless an identical network already exists.
pub(crate) fn add_network_ops<B: StorageBackend>(
    db: &Database<B>,
    info: &NetworkInfo,
) -> Result<Vec<Op>> {
    match db.get::<Networks>(&info.name)? {
        Some(existing) if NetworkInfo::from(existing.doc.clone()) == *info => Ok(Vec::new()),
        Some(_) => Err(StateError::AlreadyExists {
            message: format!("network {:?} already exists", info.name),
        }),
        None => Ok(vec![Op::on::<Networks>(info.name.as_str()).missing().insert(info.doc())]),
    }
}

impl<B: StorageBackend + 'static> State<B> {
    /// Adds a network.
    ///
    /// # Errors
    ///
    /// - [`StateError::NotValid`] if `info` is malformed.
    /// - [`StateError::AlreadyExists`] if the name is taken.
    pub fn add_network(&self, info: NetworkInfo) -> Result<NetworkInfo> {
        let what = format!("cannot add network {:?}", info.name);
        info.validate().map_err(|e| StateError::not_valid(format!("{what}: {e}")))?;
        let result = self
            .runner()
            .run_once(vec![Op::on::<Networks>(info.name.as_str()).missing().insert(info.doc())]);
        match result {
            Ok(_) => Ok(info),
            Err(e) if e.is_aborted() => Err(StateError::AlreadyExists {
                message: format!("{what}: network {:?} already exists", info.name),
            }),
            Err(e) => Err(e.into()),
        }
    }

    /// Loads a network.
    ///
    /// # Errors
    ///
    /// [`StateError::NotFound`] if no such network exists.
    pub fn network(&self, name: &str) -> Result<NetworkInfo> {
        match self.db().get::<Networks>(name)? {
            Some(record) => Ok(record.doc.into()),
            None => Err(StateError::not_found(format!("network {name:?}"))),
        }
    }

    /// Every network, ordered by name.
    ///
    /// # Errors
    ///
    /// [`StateError::Closed`] after close.
    pub fn all_networks(&self) -> Result<Vec<NetworkInfo>> {
        Ok(self.db().all::<Networks>()?.into_iter().map(|r| r.doc.into()).collect())
    }
}
