//! A thread-safe in-memory storage for the currently active environment. [`EnvironmentStore`]
//! provides concurrent access for readers (flag evaluation) and writers (the poller thread and
//! the realtime listener).
use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
};

use chrono::{DateTime, Utc};

use crate::{
    context::EvaluationContext,
    environment::{EnvironmentDocument, Identity},
    mapper,
};

/// An immutable environment document together with everything derived from it.
///
/// Snapshots are never mutated: every refresh installs a new one. A reader holding an
/// `Arc<EnvironmentSnapshot>` sees one consistent document for as long as it holds it.
#[derive(Debug)]
pub struct EnvironmentSnapshot {
    document: EnvironmentDocument,
    /// Identifier → position in `document.identity_overrides`.
    identity_overrides: HashMap<String, usize>,
    /// Identity-less evaluation context of the document.
    context: EvaluationContext,
}

impl EnvironmentSnapshot {
    pub fn new(document: EnvironmentDocument) -> EnvironmentSnapshot {
        let identity_overrides = document
            .identity_overrides
            .iter()
            .enumerate()
            .map(|(i, identity)| (identity.identifier.clone(), i))
            .collect();
        let context = mapper::environment_context(&document);

        EnvironmentSnapshot {
            document,
            identity_overrides,
            context,
        }
    }

    pub fn document(&self) -> &EnvironmentDocument {
        &self.document
    }

    pub fn context(&self) -> &EvaluationContext {
        &self.context
    }

    /// Look up the override record of `identifier`. Absence is a normal outcome.
    pub fn identity_override(&self, identifier: &str) -> Option<&Identity> {
        self.identity_overrides
            .get(identifier)
            .and_then(|&i| self.document.identity_overrides.get(i))
    }

    pub fn identity_override_count(&self) -> usize {
        self.identity_overrides.len()
    }

    pub fn updated_at(&self) -> Option<DateTime<Utc>> {
        self.document.updated_at
    }
}

/// `EnvironmentStore` provides a `Sync` storage for the environment that allows concurrent
/// access for readers and writers.
///
/// The document and its derived index are installed together as one [`EnvironmentSnapshot`],
/// so a reader can never observe a document paired with a stale index.
#[derive(Debug, Default)]
pub struct EnvironmentStore {
    snapshot: RwLock<Option<Arc<EnvironmentSnapshot>>>,
}

impl EnvironmentStore {
    /// Create a new empty store.
    pub fn new() -> Self {
        EnvironmentStore::default()
    }

    /// Get the currently-active snapshot. Returns `None` if no environment has been stored yet.
    pub fn get_environment(&self) -> Option<Arc<EnvironmentSnapshot>> {
        // self.snapshot.read() should always return Ok(). Err() is possible only if the lock is
        // poisoned (writer panicked while holding the lock), which should never happen. Still,
        // using .ok()? here to not crash the app.
        let snapshot = self.snapshot.read().ok()?;
        snapshot.clone()
    }

    /// Replace the environment, returning the previous snapshot.
    pub fn set_environment(&self, document: EnvironmentDocument) -> Option<Arc<EnvironmentSnapshot>> {
        // Building the snapshot before requesting the lock to minimize lock span.
        let new_value = Some(Arc::new(EnvironmentSnapshot::new(document)));

        let mut slot = self.snapshot.write().ok()?;
        std::mem::replace(&mut slot, new_value)
    }

    /// Look up the override record of `identifier` in the current snapshot.
    pub fn get_identity_override(&self, identifier: &str) -> Option<Identity> {
        self.get_environment()?
            .identity_override(identifier)
            .cloned()
    }

    /// `updated_at` of the current document, if any.
    pub fn updated_at(&self) -> Option<DateTime<Utc>> {
        self.get_environment()?.updated_at()
    }

    pub fn is_empty(&self) -> bool {
        self.get_environment().is_none()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    };

    use serde_json::json;

    use super::EnvironmentStore;
    use crate::environment::EnvironmentDocument;

    /// A document whose api key and every identity override carry the same generation tag.
    fn document(generation: usize) -> EnvironmentDocument {
        let overrides = (0..generation % 5 + 1)
            .map(|i| {
                json!({
                    "identifier": format!("identity_{i}"),
                    "environment_api_key": format!("gen_{generation}"),
                })
            })
            .collect::<Vec<_>>();
        serde_json::from_value(json!({
            "api_key": format!("gen_{generation}"),
            "project": {"id": 1, "name": "p"},
            "identity_overrides": overrides,
        }))
        .unwrap()
    }

    #[test]
    fn can_set_environment_from_another_thread() {
        let store = Arc::new(EnvironmentStore::new());
        assert!(store.get_environment().is_none());

        {
            let store = store.clone();
            let _ = std::thread::spawn(move || {
                store.set_environment(document(1));
            })
            .join();
        }

        assert!(store.get_environment().is_some());
    }

    #[test]
    fn set_returns_previous_snapshot() {
        let store = EnvironmentStore::new();
        assert!(store.set_environment(document(1)).is_none());
        let previous = store.set_environment(document(2)).unwrap();
        assert_eq!(previous.document().api_key, "gen_1");
        assert_eq!(store.get_environment().unwrap().document().api_key, "gen_2");
    }

    #[test]
    fn snapshot_survives_replacement() {
        let store = EnvironmentStore::new();
        store.set_environment(document(1));
        let held = store.get_environment().unwrap();
        store.set_environment(document(2));
        assert_eq!(held.document().api_key, "gen_1");
        assert!(held.identity_override("identity_1").is_some());
    }

    #[test]
    fn identity_override_lookup() {
        let store = EnvironmentStore::new();
        assert!(store.get_identity_override("identity_0").is_none());

        store.set_environment(document(3));
        let identity = store.get_identity_override("identity_3").unwrap();
        assert_eq!(identity.environment_api_key, "gen_3");
        assert!(store.get_identity_override("identity_4").is_none());
        assert!(store.get_identity_override("unknown").is_none());
    }

    #[test]
    fn readers_never_observe_torn_snapshots() {
        let store = Arc::new(EnvironmentStore::new());
        store.set_environment(document(0));
        let done = Arc::new(AtomicBool::new(false));

        let readers = (0..8)
            .map(|_| {
                let store = store.clone();
                let done = done.clone();
                std::thread::spawn(move || {
                    let mut checked = 0usize;
                    while !done.load(Ordering::Relaxed) || checked == 0 {
                        let snapshot = store.get_environment().unwrap();
                        let api_key = &snapshot.document().api_key;
                        assert_eq!(
                            snapshot.identity_override_count(),
                            snapshot.document().identity_overrides.len()
                        );
                        for identity in &snapshot.document().identity_overrides {
                            let indexed = snapshot.identity_override(&identity.identifier).unwrap();
                            assert_eq!(&indexed.environment_api_key, api_key);
                        }
                        assert_eq!(&snapshot.context().environment.key, api_key);
                        checked += 1;
                    }
                    checked
                })
            })
            .collect::<Vec<_>>();

        let writers = (0..2)
            .map(|w| {
                let store = store.clone();
                std::thread::spawn(move || {
                    for generation in 0..200 {
                        store.set_environment(document(generation * 2 + w));
                    }
                })
            })
            .collect::<Vec<_>>();

        for writer in writers {
            writer.join().unwrap();
        }
        done.store(true, Ordering::Relaxed);
        for reader in readers {
            assert!(reader.join().unwrap() > 0);
        }
    }
}
