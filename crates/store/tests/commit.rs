//! Conditional batch semantics: atomicity, aborts, concurrency, and the change stream.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::disallowed_methods)]

use std::{
    sync::{Arc, Barrier},
    thread,
};

use keel_store::{Collection, CollectionId, Database, DatabaseConfig, Error, Op};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Host {
    name: String,
    dependents: Vec<String>,
}

struct Hosts;

impl Collection for Hosts {
    const ID: CollectionId = CollectionId::Machines;
    type Doc = Host;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Note {
    text: String,
}

struct Notes;

impl Collection for Notes {
    const ID: CollectionId = CollectionId::Annotations;
    type Doc = Note;
}

fn host(name: &str) -> Host {
    Host { name: name.to_string(), dependents: Vec::new() }
}

fn seeded() -> Database {
    let db = Database::open_in_memory().expect("open");
    db.commit(vec![Op::on::<Hosts>("e").missing().insert(host("e"))]).expect("seed");
    db
}

// ============================================================================
// Atomicity
// ============================================================================

#[test]
fn failed_assertion_writes_nothing() {
    let db = seeded();
    let before = db.stats();

    let result = db.commit(vec![
        Op::on::<Notes>("e").insert(Note { text: "first".to_string() }),
        Op::on::<Hosts>("e").matches(|h: &Host| h.name == "other").update(|h| h.name.clear()),
    ]);

    let err = result.unwrap_err();
    assert!(err.is_aborted(), "expected abort, got {err}");
    assert!(db.get::<Notes>("e").unwrap().is_none(), "first op must not be applied");
    assert_eq!(db.get::<Hosts>("e").unwrap().unwrap().doc.name, "e");
    let after = db.stats();
    assert_eq!(after.seq, before.seq);
    assert_eq!(after.aborts, before.aborts + 1);
}

#[test]
fn insert_over_existing_record_aborts_and_rolls_back_earlier_effects() {
    let db = seeded();
    let result = db.commit(vec![
        Op::on::<Notes>("n").insert(Note { text: "x".to_string() }),
        Op::on::<Hosts>("e").insert(host("dup")),
    ]);
    assert!(matches!(result, Err(Error::Aborted { collection: CollectionId::Machines, .. })));
    assert!(db.get::<Notes>("n").unwrap().is_none());
}

#[test]
fn update_and_remove_of_missing_records_are_no_ops() {
    let db = seeded();
    let seq = db.stats().seq;
    let committed = db
        .commit(vec![
            Op::on::<Hosts>("ghost").update(|h| h.name = "boo".to_string()),
            Op::on::<Notes>("ghost").remove(),
        ])
        .expect("no-op batch commits");
    assert_eq!(committed, seq);
    assert!(db.get::<Hosts>("ghost").unwrap().is_none());
}

#[test]
fn identical_update_does_not_bump_revno() {
    let db = seeded();
    let revno = db.get::<Hosts>("e").unwrap().unwrap().revno;
    db.commit(vec![Op::on::<Hosts>("e").update(|h| h.name = "e".to_string())]).unwrap();
    assert_eq!(db.get::<Hosts>("e").unwrap().unwrap().revno, revno);
}

#[test]
fn revno_assertion_detects_intervening_write() {
    let db = seeded();
    let read = db.get::<Hosts>("e").unwrap().unwrap();
    db.commit(vec![Op::on::<Hosts>("e").update(|h| h.dependents.push("u/0".to_string()))])
        .unwrap();

    let stale = db.commit(vec![Op::on::<Hosts>("e").revno(read.revno).update(|h| h.name.clear())]);
    assert!(stale.unwrap_err().is_aborted());

    let fresh = db.get::<Hosts>("e").unwrap().unwrap();
    db.commit(vec![Op::on::<Hosts>("e").revno(fresh.revno).update(|h| h.name = "f".to_string())])
        .expect("fresh revno commits");
}

#[test]
fn find_filters_by_predicate() {
    let db = seeded();
    db.commit(vec![
        Op::on::<Hosts>("a").insert(Host { name: "a".into(), dependents: vec!["x".into()] }),
        Op::on::<Hosts>("b").insert(host("b")),
    ])
    .unwrap();
    let busy = db.find::<Hosts>(|h| !h.dependents.is_empty()).unwrap();
    assert_eq!(busy.len(), 1);
    assert_eq!(busy[0].id, "a");
    assert_eq!(db.all::<Hosts>().unwrap().len(), 3);
    assert_eq!(db.ids::<Hosts>().unwrap(), ["a", "b", "e"]);
    assert!(db.ids::<Notes>().unwrap().is_empty());
}

// ============================================================================
// Concurrency
// ============================================================================

#[test]
fn concurrent_guarded_writers_exactly_one_commits() {
    let db = Arc::new(seeded());
    let writers = 8;
    let barrier = Arc::new(Barrier::new(writers));

    let handles: Vec<_> = (0..writers)
        .map(|i| {
            let db = Arc::clone(&db);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                db.commit(vec![
                    Op::on::<Hosts>("e")
                        .matches(|h: &Host| h.dependents.is_empty())
                        .update(move |h| h.dependents.push(format!("u/{i}"))),
                ])
            })
        })
        .collect();

    let results: Vec<_> = handles.into_iter().map(|h| h.join().expect("join")).collect();
    let committed = results.iter().filter(|r| r.is_ok()).count();
    let aborted = results.iter().filter(|r| matches!(r, Err(e) if e.is_aborted())).count();
    assert_eq!(committed, 1);
    assert_eq!(aborted, writers - 1);
    assert_eq!(db.get::<Hosts>("e").unwrap().unwrap().doc.dependents.len(), 1);
}

// ============================================================================
// Change stream and session
// ============================================================================

#[tokio::test]
async fn commit_events_arrive_in_order_with_removals_marked() {
    let db = seeded();
    let mut rx = db.subscribe();

    let s1 = db.commit(vec![Op::on::<Notes>("n").insert(Note { text: "a".into() })]).unwrap();
    let s2 = db
        .commit(vec![Op::on::<Notes>("n").remove(), Op::on::<Hosts>("e").update(|h| h.name.push('!'))])
        .unwrap();

    let first = rx.recv().await.expect("first event");
    assert_eq!(first.seq, s1);
    assert_eq!(first.changes[0].revno, Some(s1));

    let second = rx.recv().await.expect("second event");
    assert_eq!(second.seq, s2);
    assert_eq!(second.changes.len(), 2);
    assert_eq!(second.changes[0].revno, None);
    assert!(second.touches(CollectionId::Machines));
    assert!(!second.touches(CollectionId::Units));
}

#[tokio::test]
async fn close_ends_subscriptions_and_rejects_operations() {
    let db = seeded();
    let mut rx = db.subscribe();
    db.close();
    db.close();

    assert!(matches!(rx.recv().await, Err(tokio::sync::broadcast::error::RecvError::Closed)));
    assert!(matches!(db.get::<Hosts>("e"), Err(Error::Closed)));
    assert!(matches!(db.commit(Vec::new()), Err(Error::Closed)));

    let mut late = db.subscribe();
    assert!(late.recv().await.is_err());
}

#[test]
fn read_only_session_rejects_commits() {
    let config = DatabaseConfig { read_only: true, ..DatabaseConfig::default() };
    let db = Database::open_in_memory_with_config(config).unwrap();
    let err = db.commit(vec![Op::on::<Notes>("n").insert(Note { text: "a".into() })]).unwrap_err();
    assert!(matches!(err, Error::Unauthorized { .. }));
    assert_eq!(err.kind(), keel_types::ErrorKind::Unauthorized);
}
