//! Property tests over arbitrary sequences of lifecycle operations.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::disallowed_methods)]

use std::{collections::BTreeSet, time::Duration};

use keel_state::{Lifecycle, State};
use keel_test_utils::{random_uuid, strategies, strategies::LifecycleStep, test_state_config};
use keel_types::{ErrorKind, Life, MachineJob, config::StateConfig, merge_addresses};
use proptest::prelude::*;

proptest! {
    #![proptest_config(ProptestConfig::with_cases(128))]

    /// Life observed through any handle never decreases, a machine with an
    /// assigned unit never reaches `Dying`, and refusals are always one of
    /// the structured kinds.
    #[test]
    fn prop_machine_life_is_monotonic(steps in strategies::arb_lifecycle_steps(30)) {
        let st = State::in_memory(test_state_config()).unwrap();
        let mut machine = st.add_machine("quantal", &[MachineJob::HostUnits]).unwrap();
        let mut observer = st.machine(machine.id().as_str()).unwrap();
        let service = st.add_service("wordpress", false).unwrap();
        let mut unit = service.add_unit().unwrap();

        let mut last = Life::Alive;
        for step in steps {
            let outcome = match step {
                LifecycleStep::AssignUnit => unit.assign_to_machine(&machine),
                LifecycleStep::UnassignUnit => unit.unassign_from_machine(),
                LifecycleStep::Destroy => machine.destroy(),
                LifecycleStep::EnsureDead => machine.ensure_dead(),
                LifecycleStep::Remove => machine.remove().map(|_| ()),
                LifecycleStep::Refresh => machine.refresh(),
            };
            if let Err(e) = outcome {
                prop_assert!(
                    matches!(
                        e.kind(),
                        ErrorKind::Blocked | ErrorKind::NotValid | ErrorKind::NotFound
                    ),
                    "unexpected error {e}"
                );
            }

            prop_assert!(machine.life() >= last, "{:?} after {:?}", machine.life(), last);
            last = machine.life();

            match observer.refresh() {
                Ok(()) => {
                    prop_assert!(observer.life() <= last || last == Life::Removed);
                    if observer.life() != Life::Alive {
                        prop_assert!(observer.principals().is_empty());
                    }
                },
                Err(e) => prop_assert_eq!(e.kind(), ErrorKind::NotFound),
            }
        }
    }

    /// Addresses read back through a fresh handle follow the merge rule and
    /// carry no empty or duplicate values.
    #[test]
    fn prop_merged_addresses_are_unique(
        provider in proptest::collection::vec(strategies::arb_address(), 0..6),
        agent in proptest::collection::vec(strategies::arb_address(), 0..6),
        prefer_ipv6 in any::<bool>(),
    ) {
        let st = State::in_memory(test_state_config()).unwrap();
        st.set_prefer_ipv6(prefer_ipv6).unwrap();
        let mut machine = st.add_machine("quantal", &[MachineJob::HostUnits]).unwrap();
        machine.set_addresses(provider.clone()).unwrap();
        machine.set_machine_addresses(agent.clone()).unwrap();

        let fresh = st.machine(machine.id().as_str()).unwrap();
        let merged = fresh.addresses().unwrap();
        prop_assert_eq!(&merged, &merge_addresses(&provider, &agent, prefer_ipv6));

        let values: Vec<_> = merged.iter().map(|a| a.value.as_str()).collect();
        prop_assert!(values.iter().all(|v| !v.is_empty()));
        prop_assert_eq!(values.iter().collect::<BTreeSet<_>>().len(), values.len());
    }

    /// Any machine tag may hold the singular model lease, and only one at a
    /// time.
    #[test]
    fn prop_singular_lease_accepts_machine_tags(
        first in strategies::arb_machine_tag(),
        second in strategies::arb_machine_tag(),
    ) {
        let config = StateConfig::builder()
            .controller_uuid(random_uuid())
            .model_uuid(random_uuid())
            .build()
            .unwrap();
        let model = config.model_uuid.clone();
        let st = State::in_memory(config).unwrap();
        let claimer = st.singular_claimer();
        let minute = Duration::from_secs(60);

        claimer.claim_lease(&model, &first, minute).unwrap();
        let again = claimer.claim_lease(&model, &second, minute);
        if first == second {
            prop_assert!(again.is_ok());
        } else {
            prop_assert!(again.unwrap_err().is_denied());
        }
        prop_assert_eq!(claimer.manager().holder(&model).unwrap(), Some(first));
    }
}
