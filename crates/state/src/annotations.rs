//! Free-form annotations shared by machines, units, and services.

use std::collections::BTreeMap;

use keel_store::{Op, StorageBackend};

use crate::{
    docs::{Annotations, AnnotationsDoc},
    error::{Result, StateError},
    state::State,
};

/// Annotations stored under `key`; empty if none were ever set.
pub(crate) fn get<B: StorageBackend + 'static>(
    st: &State<B>,
    key: &str,
) -> Result<BTreeMap<String, String>> {
    Ok(st.db().get::<Annotations>(key)?.map(|r| r.doc.entries).unwrap_or_default())
}

/// Merges `pairs` into the annotations under `key`.
///
/// Empty values delete their key. `guard` runs on every attempt; it returns
/// the op asserting the owning entity can still be annotated, or
/// [`StateError::NotValid`] if it cannot.
pub(crate) fn set<B, G>(
    st: &State<B>,
    key: &str,
    guard: G,
    pairs: BTreeMap<String, String>,
) -> Result<()>
where
    B: StorageBackend + 'static,
    G: Fn() -> Result<Op>,
{
    if let Some(bad) = pairs.keys().find(|k| k.contains('.')) {
        return Err(StateError::not_valid(format!("invalid key {bad:?}")));
    }
    if pairs.is_empty() {
        return Ok(());
    }
    st.runner().run(|_| {
        let mut ops = vec![guard()?];
        match st.db().get::<Annotations>(key)? {
            Some(record) => {
                let pairs = pairs.clone();
                ops.push(Op::on::<Annotations>(key).revno(record.revno).update(move |doc| {
                    apply(&mut doc.entries, pairs);
                }));
            },
            None => {
                let mut entries = BTreeMap::new();
                apply(&mut entries, pairs.clone());
                if entries.is_empty() {
                    return Ok(None);
                }
                ops.push(Op::on::<Annotations>(key).missing().insert(AnnotationsDoc { entries }));
            },
        }
        Ok(Some(ops))
    })
}

fn apply(entries: &mut BTreeMap<String, String>, pairs: BTreeMap<String, String>) {
    for (k, v) in pairs {
        if v.is_empty() {
            entries.remove(&k);
        } else {
            entries.insert(k, v);
        }
    }
}
