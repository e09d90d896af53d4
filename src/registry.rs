// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Database registry: name → shared [`ReplicatedDb`].
//!
//! The only mutable structure shared across control paths. Backed by a
//! sharded concurrent map so `get` on the serve path never blocks behind
//! `add`/`remove`. Readers receive an `Arc` whose lifetime extends past the
//! registry entry; removal waits for those references to drain at the host
//! level.

use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::db::ReplicatedDb;

#[derive(Default)]
pub struct DbRegistry {
    dbs: DashMap<String, Arc<ReplicatedDb>>,
}

impl DbRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Atomically insert. Returns `false` (leaving the incumbent untouched)
    /// if the name is taken.
    pub fn add(&self, db: Arc<ReplicatedDb>) -> bool {
        match self.dbs.entry(db.name().to_string()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(db);
                true
            }
        }
    }

    /// Atomically remove, handing back the registered database if present.
    pub fn remove(&self, name: &str) -> Option<Arc<ReplicatedDb>> {
        self.dbs.remove(name).map(|(_, db)| db)
    }

    /// Shared reference that outlives the registry entry.
    pub fn get(&self, name: &str) -> Option<Arc<ReplicatedDb>> {
        self.dbs.get(name).map(|entry| Arc::clone(entry.value()))
    }

    /// Snapshot of all registered databases (sweeper, shutdown).
    pub fn all(&self) -> Vec<Arc<ReplicatedDb>> {
        self.dbs.iter().map(|entry| Arc::clone(entry.value())).collect()
    }

    pub fn len(&self) -> usize {
        self.dbs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dbs.is_empty()
    }
}
