//! Machine and unit lifecycle across whole sessions: blocking, idempotence,
//! races between guarded writers, and the required manager machine.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::disallowed_methods)]

use std::{
    collections::BTreeMap,
    sync::{Arc, Barrier},
    thread,
};

use keel_state::{
    Blocker, HookFn, Lifecycle, Machine, MachineTemplate, Removal, State, StateError, TestHook,
};
use keel_test_utils::{init_tracing, test_state_config, test_state_config_with_attempts};
use keel_types::{ContainerType, ErrorKind, Life, MachineJob, UnitName};

fn state() -> State {
    init_tracing();
    State::in_memory(test_state_config()).unwrap()
}

fn host(st: &State) -> Machine {
    st.add_machine("quantal", &[MachineJob::HostUnits]).unwrap()
}

// ============================================================================
// Blocking and idempotence
// ============================================================================

#[test]
fn assigned_unit_blocks_destroy_until_unassigned() {
    let st = state();
    let mut m = host(&st);
    let wordpress = st.add_service("wordpress", false).unwrap();
    let mut unit = wordpress.add_unit().unwrap();
    unit.assign_to_machine(&m).unwrap();

    let err = m.destroy().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Blocked);
    assert_eq!(err.blocker(), Some(&Blocker::HasAssignedUnits(vec![UnitName::new("wordpress/0")])));
    assert_eq!(err.blocker().unwrap().offending_ids(), ["wordpress/0"]);
    assert_eq!(m.life(), Life::Alive);

    unit.unassign_from_machine().unwrap();
    m.destroy().unwrap();
    assert_eq!(m.life(), Life::Dying);
    m.ensure_dead().unwrap();
    assert_eq!(m.life(), Life::Dead);
    assert_eq!(m.remove().unwrap(), Removal::Deleted);

    let err = m.refresh().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[test]
fn repeated_transitions_are_no_ops() {
    let st = state();
    let mut m = host(&st);
    m.destroy().unwrap();
    m.destroy().unwrap();
    m.ensure_dead().unwrap();

    let before = st.txn_attempts();
    m.ensure_dead().unwrap();
    m.destroy().unwrap();
    assert_eq!(st.txn_attempts(), before);

    assert_eq!(m.remove().unwrap(), Removal::Deleted);
    assert_eq!(m.remove().unwrap(), Removal::AlreadyGone);
    assert_eq!(m.life(), Life::Removed);
}

#[test]
fn stale_handle_never_moves_life_backwards() {
    let st = state();
    let mut fresh = host(&st);
    let mut stale = st.machine(fresh.id().as_str()).unwrap();
    fresh.ensure_dead().unwrap();

    assert_eq!(stale.life(), Life::Alive);
    stale.destroy().unwrap();
    assert_eq!(stale.life(), Life::Dead);
}

#[test]
fn containers_block_their_host() {
    let st = state();
    let mut parent = host(&st);
    let template = MachineTemplate::builder()
        .series("quantal")
        .jobs(vec![MachineJob::HostUnits])
        .build();
    let mut child =
        st.add_machine_inside_machine(template, parent.id(), ContainerType::Lxc).unwrap();

    let err = parent.ensure_dead().unwrap_err();
    assert_eq!(err.blocker(), Some(&Blocker::HasContainers(vec![child.id().clone()])));

    child.ensure_dead().unwrap();
    child.remove().unwrap();
    parent.ensure_dead().unwrap();
}

// ============================================================================
// Races
// ============================================================================

#[test]
fn destroy_losing_race_to_assignment_is_blocked() {
    let st = state();
    let mut m = host(&st);
    let wordpress = st.add_service("wordpress", false).unwrap();
    let mut unit = wordpress.add_unit().unwrap();

    let target = m.clone();
    let check = st.set_before_hooks(vec![Box::new(move || {
        unit.assign_to_machine(&target).unwrap();
    })]);
    let before = st.txn_attempts();
    let err = m.destroy().unwrap_err();
    check.assert_consumed();

    assert_eq!(err.kind(), ErrorKind::Blocked);
    // The interleaved assignment plus the aborted destroy.
    assert_eq!(st.txn_attempts() - before, 2);
    m.refresh().unwrap();
    assert_eq!(m.life(), Life::Alive);
}

#[test]
fn assignment_losing_race_to_destroy_fails_on_fresh_facts() {
    let st = state();
    let m = host(&st);
    let wordpress = st.add_service("wordpress", false).unwrap();
    let mut unit = wordpress.add_unit().unwrap();

    let mut target = m.clone();
    let check = st.set_before_hooks(vec![Box::new(move || target.destroy().unwrap())]);
    let err = unit.assign_to_machine(&m).unwrap_err();
    check.assert_consumed();

    assert_eq!(err.kind(), ErrorKind::NotValid);
    assert_eq!(
        err.to_string(),
        r#"cannot assign unit "wordpress/0" to machine 0: machine is not alive"#
    );
}

#[test]
fn assignment_retries_when_still_valid() {
    let st = state();
    let m = host(&st);
    let wordpress = st.add_service("wordpress", false).unwrap();
    let mut first = wordpress.add_unit().unwrap();
    let mut second = wordpress.add_unit().unwrap();

    let target = m.clone();
    let check = st.set_before_hooks(vec![Box::new(move || {
        second.assign_to_machine(&target).unwrap();
    })]);
    first.assign_to_machine(&m).unwrap();
    check.assert_consumed();

    let mut m = m;
    m.refresh().unwrap();
    assert_eq!(m.principals().len(), 2);
}

#[test]
fn sustained_interference_ends_in_contention() {
    let st = State::in_memory(test_state_config_with_attempts(3)).unwrap();
    let m = host(&st);
    let hooks = (0..3)
        .map(|i| {
            let noisy = m.clone();
            Box::new(move || {
                noisy.set_annotations(BTreeMap::from([("owner".into(), format!("noisy-{i}"))])).unwrap();
            }) as HookFn
        })
        .collect();
    let check = st.set_before_hooks(hooks);
    let before = st.txn_attempts();
    let err = m.set_annotations(BTreeMap::from([("owner".into(), "me".into())])).unwrap_err();
    check.assert_consumed();

    assert_eq!(err.kind(), ErrorKind::Contention);
    assert!(matches!(err, StateError::Contention { .. }));
    // Three interfering writes and three aborted attempts, then no more.
    assert_eq!(st.txn_attempts() - before, 6);
    assert_eq!(m.annotations().unwrap()["owner"], "noisy-2");
}

#[test]
fn destroy_under_churning_assignment_ends_in_contention() {
    init_tracing();
    let st = State::in_memory(test_state_config_with_attempts(3)).unwrap();
    let _m0 = host(&st);
    let mut m1 = host(&st);
    assert_eq!(m1.id().as_str(), "1");
    let unit = st.add_service("wordpress", false).unwrap().add_unit().unwrap();

    // Each attempt sees an empty machine, then an assignment lands before the
    // commit and is undone right after it.
    let hooks = (0..3)
        .map(|_| {
            let mut assigning = unit.clone();
            let mut unassigning = unit.clone();
            let target = m1.clone();
            TestHook::around(
                move || assigning.assign_to_machine(&target).unwrap(),
                move || unassigning.unassign_from_machine().unwrap(),
            )
        })
        .collect();
    let check = st.set_transaction_hooks(hooks);
    let err = m1.destroy().unwrap_err();
    check.assert_consumed();

    assert_eq!(err.kind(), ErrorKind::Contention);
    assert_eq!(
        err.to_string(),
        "machine 1 cannot advance lifecycle: state changing too quickly; try again soon"
    );
    m1.refresh().unwrap();
    assert_eq!(m1.life(), Life::Alive);
    assert!(m1.principals().is_empty());
}

#[test]
fn concurrent_assign_and_destroy_agree() {
    for _ in 0..10 {
        let st = State::in_memory(test_state_config_with_attempts(20)).unwrap();
        let m = host(&st);
        let wordpress = st.add_service("wordpress", false).unwrap();
        let units: Vec<_> = (0..4).map(|_| wordpress.add_unit().unwrap()).collect();
        let barrier = Arc::new(Barrier::new(units.len() + 1));

        let assigners: Vec<_> = units
            .into_iter()
            .map(|mut unit| {
                let target = m.clone();
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    unit.assign_to_machine(&target).is_ok()
                })
            })
            .collect();
        let mut victim = m.clone();
        let destroyer = {
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                victim.destroy()
            })
        };

        let assigned = assigners.into_iter().map(|h| h.join().unwrap()).filter(|ok| *ok).count();
        let destroyed = destroyer.join().unwrap();

        let mut m = m;
        m.refresh().unwrap();
        match destroyed {
            Ok(()) => {
                assert_eq!(m.life(), Life::Dying);
                assert!(m.principals().is_empty());
                assert_eq!(assigned, 0);
            },
            Err(e) => {
                assert_eq!(e.kind(), ErrorKind::Blocked);
                assert_eq!(m.life(), Life::Alive);
                assert_eq!(m.principals().len(), assigned);
            },
        }
    }
}

// ============================================================================
// Required machines
// ============================================================================

#[test]
fn manager_machine_refuses_every_transition_without_a_transaction() {
    let st = state();
    let mut m = st.add_machine("quantal", &[MachineJob::ManageEnviron]).unwrap();
    let before = st.txn_attempts();

    for err in [
        m.destroy().unwrap_err(),
        m.force_destroy().unwrap_err(),
        m.ensure_dead().unwrap_err(),
        m.remove().unwrap_err(),
    ] {
        assert_eq!(err.kind(), ErrorKind::Blocked);
        assert_eq!(err.blocker(), Some(&Blocker::Required));
        assert_eq!(err.to_string(), "machine 0 is required by the environment");
    }
    assert_eq!(st.txn_attempts(), before);
    assert_eq!(m.life(), Life::Alive);
}
