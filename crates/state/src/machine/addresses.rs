//! Provider and agent addresses.

use keel_store::StorageBackend;
use keel_types::{Address, merge_addresses};

use super::Machine;
use crate::error::Result;

impl<B: StorageBackend + 'static> Machine<B> {
    /// Provider and agent addresses merged into one list.
    ///
    /// Ordering honors the model's IPv6 preference at the time of the call.
    ///
    /// # Errors
    ///
    /// [`StateError::Closed`](crate::StateError::Closed) after close.
    pub fn addresses(&self) -> Result<Vec<Address>> {
        let prefer_ipv6 = self.st.prefer_ipv6()?;
        Ok(merge_addresses(&self.doc.addresses, &self.doc.machine_addresses, prefer_ipv6))
    }

    /// Provider-reported addresses, as of the last read.
    pub fn provider_addresses(&self) -> &[Address] {
        &self.doc.addresses
    }

    /// Agent-reported addresses, as of the last read.
    pub fn machine_addresses(&self) -> &[Address] {
        &self.doc.machine_addresses
    }

    /// Replaces the provider-reported addresses.
    ///
    /// # Errors
    ///
    /// [`StateError::NotFound`](crate::StateError::NotFound) if the machine
    /// was removed, [`StateError::NotValid`](crate::StateError::NotValid) if
    /// it is dead.
    pub fn set_addresses(&mut self, addresses: Vec<Address>) -> Result<()> {
        let stored = addresses.clone();
        self.guarded_update(
            &format!("cannot set addresses of machine {}", self.doc.id),
            move |m| m.addresses = stored.clone(),
        )?;
        self.doc.addresses = addresses;
        Ok(())
    }

    /// Replaces the agent-reported addresses.
    ///
    /// # Errors
    ///
    /// Same as [`set_addresses`](Self::set_addresses).
    pub fn set_machine_addresses(&mut self, addresses: Vec<Address>) -> Result<()> {
        let stored = addresses.clone();
        self.guarded_update(
            &format!("cannot set machine addresses of machine {}", self.doc.id),
            move |m| m.machine_addresses = stored.clone(),
        )?;
        self.doc.machine_addresses = addresses;
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used, clippy::disallowed_methods)]
mod tests {
    use keel_test_utils::test_state_config;
    use keel_types::{ErrorKind, MachineJob};

    use crate::{Lifecycle, State};

    use super::*;

    fn values(addresses: &[Address]) -> Vec<&str> {
        addresses.iter().map(|a| a.value.as_str()).collect()
    }

    #[test]
    fn test_merged_addresses_follow_preference() {
        let st = State::in_memory(test_state_config()).unwrap();
        let mut m = st.add_machine("quantal", &[MachineJob::HostUnits]).unwrap();
        m.set_addresses(vec![Address::new("8.8.8.8"), Address::new("2001:db8::1")]).unwrap();
        m.set_machine_addresses(vec![Address::new("10.0.0.1"), Address::new("8.8.8.8")]).unwrap();

        assert_eq!(values(&m.addresses().unwrap()), ["8.8.8.8", "2001:db8::1", "10.0.0.1"]);

        st.set_prefer_ipv6(true).unwrap();
        assert_eq!(values(&m.addresses().unwrap()), ["2001:db8::1", "8.8.8.8", "10.0.0.1"]);

        m.refresh().unwrap();
        assert_eq!(values(m.machine_addresses()), ["10.0.0.1", "8.8.8.8"]);
    }

    #[test]
    fn test_set_addresses_on_dead_machine() {
        let st = State::in_memory(test_state_config()).unwrap();
        let mut m = st.add_machine("quantal", &[MachineJob::HostUnits]).unwrap();
        m.ensure_dead().unwrap();
        let err = m.set_addresses(vec![Address::new("10.0.0.2")]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotValid);
        assert_eq!(err.to_string(), "cannot set addresses of machine 0: machine is dead");
    }
}
