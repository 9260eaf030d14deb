//! Requested networks and network interfaces of a machine.

use std::fmt;

use keel_store::{InMemoryBackend, Op, StorageBackend};
use keel_types::{Life, MachineId, validation};
use tracing::debug;

use super::Machine;
use crate::{
    docs::{
        InterfaceDoc, Interfaces, Machines, Networks, RequestedNetworks, interface_key,
        machine_key,
    },
    error::{Result, StateError},
    lifecycle::Removal,
    network::NetworkInfo,
    state::State,
};

/// Description of a network interface to add to a machine.
#[derive(Debug, Clone, Default, PartialEq, Eq, bon::Builder)]
pub struct NetworkInterfaceInfo {
    /// Hardware address, `aa:bb:cc:dd:ee:ff`.
    #[builder(into)]
    pub mac_address: String,
    /// Device name, e.g. `eth0`.
    #[builder(into)]
    pub interface_name: String,
    /// Network the interface is attached to.
    #[builder(into)]
    pub network_name: String,
    /// Whether the interface is virtual (VLAN, bridge).
    #[builder(default)]
    pub is_virtual: bool,
    /// Whether the interface starts disabled.
    #[builder(default)]
    pub disabled: bool,
}

/// Ops that attach `info` to `machine`.
///
/// `pending` lists networks created earlier in the same batch; they have no
/// attached MAC addresses yet.
pub(crate) fn add_interface_ops<B: StorageBackend + 'static>(
    st: &State<B>,
    machine: &MachineId,
    info: &NetworkInterfaceInfo,
    pending: &[NetworkInfo],
) -> Result<Vec<Op>> {
    let what = format!(
        "cannot add network interface {:?} to machine {:?}",
        info.interface_name,
        machine.as_str()
    );
    if info.mac_address.is_empty() {
        return Err(StateError::not_valid(format!("{what}: MAC address must be not empty")));
    }
    if !validation::is_valid_mac_address(&info.mac_address) {
        return Err(StateError::not_valid(format!(
            "{what}: MAC address {:?} not valid",
            info.mac_address
        )));
    }
    if info.interface_name.is_empty() {
        return Err(StateError::not_valid(format!("{what}: interface name must be not empty")));
    }

    let network = st.db().get::<Networks>(&info.network_name)?;
    let is_pending = pending.iter().any(|n| n.name == info.network_name);
    match &network {
        Some(net) if net.doc.macs.contains(&info.mac_address) => {
            return Err(StateError::AlreadyExists {
                message: format!(
                    "{what}: MAC address {:?} on network {:?} already exists",
                    info.mac_address, info.network_name
                ),
            });
        },
        Some(_) => {},
        None if is_pending => {},
        None => {
            return Err(StateError::not_found(format!(
                "{what}: network {:?}",
                info.network_name
            )));
        },
    }

    let id = interface_key(machine, &info.interface_name);
    if st.db().get::<Interfaces>(&id)?.is_some() {
        return Err(StateError::AlreadyExists {
            message: format!(
                "{what}: {:?} on machine {:?} already exists",
                info.interface_name,
                machine.as_str()
            ),
        });
    }

    let doc = InterfaceDoc {
        machine_id: machine.clone(),
        interface_name: info.interface_name.clone(),
        mac_address: info.mac_address.clone(),
        network_name: info.network_name.clone(),
        is_virtual: info.is_virtual,
        disabled: info.disabled,
    };
    let attach = info.mac_address.clone();
    let network_op = if network.is_some() {
        let mac = info.mac_address.clone();
        Op::on::<Networks>(info.network_name.as_str())
            .matches(move |n| !n.macs.contains(&mac))
            .update(move |n| {
                n.macs.insert(attach);
            })
    } else {
        Op::on::<Networks>(info.network_name.as_str()).update(move |n| {
            n.macs.insert(attach);
        })
    };
    Ok(vec![Op::on::<Interfaces>(id).missing().insert(doc), network_op])
}

impl<B: StorageBackend + 'static> Machine<B> {
    /// Names of the networks the machine was asked to join.
    ///
    /// # Errors
    ///
    /// [`StateError::NotFound`] once the machine has been removed.
    pub fn requested_networks(&self) -> Result<Vec<String>> {
        match self.st.db().get::<RequestedNetworks>(&machine_key(&self.doc.id))? {
            Some(record) => Ok(record.doc.networks),
            None => Err(StateError::not_found(format!(
                "requested networks for machine {}",
                self.doc.id
            ))),
        }
    }

    /// Known networks among those the machine was asked to join.
    ///
    /// # Errors
    ///
    /// [`StateError::NotFound`] once the machine has been removed.
    pub fn networks(&self) -> Result<Vec<NetworkInfo>> {
        let mut networks = Vec::new();
        for name in self.requested_networks()? {
            if let Some(record) = self.st.db().get::<Networks>(&name)? {
                networks.push(record.doc.into());
            }
        }
        Ok(networks)
    }

    /// Attaches a network interface to this machine.
    ///
    /// # Errors
    ///
    /// - [`StateError::NotValid`] for a malformed interface or a machine
    ///   that is not alive.
    /// - [`StateError::NotFound`] if the machine or network does not exist.
    /// - [`StateError::AlreadyExists`] if the interface name is taken on
    ///   this machine or the MAC address is taken on the network.
    pub fn add_network_interface(&self, info: NetworkInterfaceInfo) -> Result<NetworkInterface<B>> {
        let id = self.doc.id.clone();
        let what = format!(
            "cannot add network interface {:?} to machine {:?}",
            info.interface_name,
            id.as_str()
        );
        self.st
            .runner()
            .run(|_| {
                let Some(record) = self.st.machine_record(&id)? else {
                    return Err(StateError::not_found(format!("{what}: machine {id}")));
                };
                if record.doc.life != Life::Alive {
                    return Err(StateError::not_valid(format!("{what}: machine is not alive")));
                }
                let mut ops =
                    vec![Op::on::<Machines>(id.as_str()).matches(|m| m.life == Life::Alive).check()];
                ops.extend(add_interface_ops(&self.st, &id, &info, &[])?);
                Ok(Some(ops))
            })
            .map_err(|e| e.with_context(what.clone()))?;
        debug!(machine = %id, interface = %info.interface_name, "Added network interface");
        let key = interface_key(&id, &info.interface_name);
        match self.st.db().get::<Interfaces>(&key)? {
            Some(record) => Ok(NetworkInterface::new(self.st.clone(), record.id, record.doc)),
            None => Err(StateError::not_found(format!("network interface {key:?}"))),
        }
    }

    /// Network interfaces of this machine, ordered by name.
    ///
    /// # Errors
    ///
    /// [`StateError::Closed`] after close.
    pub fn network_interfaces(&self) -> Result<Vec<NetworkInterface<B>>> {
        let id = self.doc.id.clone();
        let records = self.st.db().find::<Interfaces>(move |i| i.machine_id == id)?;
        Ok(records
            .into_iter()
            .map(|r| NetworkInterface::new(self.st.clone(), r.id, r.doc))
            .collect())
    }
}

/// Handle to a machine's network interface.
pub struct NetworkInterface<B: StorageBackend = InMemoryBackend> {
    st: State<B>,
    id: String,
    doc: InterfaceDoc,
}

impl<B: StorageBackend> fmt::Debug for NetworkInterface<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NetworkInterface")
            .field("id", &self.id)
            .field("disabled", &self.doc.disabled)
            .finish_non_exhaustive()
    }
}

impl<B: StorageBackend + 'static> NetworkInterface<B> {
    fn new(st: State<B>, id: String, doc: InterfaceDoc) -> Self {
        Self { st, id, doc }
    }

    /// Hardware address.
    pub fn mac_address(&self) -> &str {
        &self.doc.mac_address
    }

    /// Device name.
    pub fn interface_name(&self) -> &str {
        &self.doc.interface_name
    }

    /// Attached network.
    pub fn network_name(&self) -> &str {
        &self.doc.network_name
    }

    /// Owning machine.
    pub fn machine_id(&self) -> &MachineId {
        &self.doc.machine_id
    }

    /// Whether the interface is virtual.
    pub fn is_virtual(&self) -> bool {
        self.doc.is_virtual
    }

    /// Whether the interface is disabled, as of the last read.
    pub fn is_disabled(&self) -> bool {
        self.doc.disabled
    }

    /// Enables the interface.
    ///
    /// # Errors
    ///
    /// See [`disable`](Self::disable).
    pub fn enable(&mut self) -> Result<()> {
        self.set_disabled(false)
    }

    /// Disables the interface.
    ///
    /// # Errors
    ///
    /// [`StateError::NotFound`] if the interface was removed and
    /// [`StateError::NotValid`] if its machine is not alive.
    pub fn disable(&mut self) -> Result<()> {
        self.set_disabled(true)
    }

    fn set_disabled(&mut self, disabled: bool) -> Result<()> {
        let action = if disabled { "disable" } else { "enable" };
        let what = format!("cannot {action} network interface {:?}", self.doc.interface_name);
        let machine = self.doc.machine_id.clone();
        let id = self.id.clone();
        self.st
            .runner()
            .run(|_| {
                if self.st.db().get::<Interfaces>(&id)?.is_none() {
                    return Err(StateError::not_found(format!("{what}: network interface")));
                }
                let alive = self.st.machine_record(&machine)?.is_some_and(|r| r.doc.life == Life::Alive);
                if !alive {
                    return Err(StateError::not_valid(format!("{what}: machine is not alive")));
                }
                Ok(Some(vec![
                    Op::on::<Machines>(machine.as_str()).matches(|m| m.life == Life::Alive).check(),
                    Op::on::<Interfaces>(id.as_str()).exists().update(move |i| i.disabled = disabled),
                ]))
            })
            .map_err(|e| e.with_context(what.clone()))?;
        self.doc.disabled = disabled;
        Ok(())
    }

    /// Detaches the interface.
    ///
    /// # Errors
    ///
    /// [`StateError::Closed`] after close.
    pub fn remove(&mut self) -> Result<Removal> {
        let mut outcome = Removal::AlreadyGone;
        let id = self.id.clone();
        self.st.runner().run(|_| {
            let Some(record) = self.st.db().get::<Interfaces>(&id)? else {
                outcome = Removal::AlreadyGone;
                return Ok(None);
            };
            outcome = Removal::Deleted;
            let mac = record.doc.mac_address.clone();
            Ok(Some(vec![
                Op::on::<Interfaces>(id.as_str()).revno(record.revno).remove(),
                Op::on::<Networks>(record.doc.network_name).update(move |n| {
                    n.macs.remove(&mac);
                }),
            ]))
        })?;
        Ok(outcome)
    }

    /// Re-reads the interface.
    ///
    /// # Errors
    ///
    /// [`StateError::NotFound`] once removed.
    pub fn refresh(&mut self) -> Result<()> {
        match self.st.db().get::<Interfaces>(&self.id)? {
            Some(record) => {
                self.doc = record.doc;
                Ok(())
            },
            None => Err(StateError::not_found(format!("network interface {:?}", self.id))),
        }
    }
}
