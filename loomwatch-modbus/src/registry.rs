//! Process-wide store of per-machine state.
//!
//! The map lock is only taken to hand out or enumerate entries. Each poll task
//! keeps its own [`MachineHandle`] and is the sole writer of that entry, so
//! machines never contend with each other.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::state::MachineState;

type Slot = Arc<Mutex<Option<MachineState>>>;

/// Keyed store of [`MachineState`], one entry per machine id.
#[derive(Debug, Default)]
pub struct MachineRegistry {
    machines: RwLock<HashMap<String, Slot>>,
}

/// Exclusive write access to one machine's entry.
#[derive(Debug, Clone)]
pub struct MachineHandle {
    id: String,
    slot: Slot,
}

impl MachineHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Run `f` against the entry; `None` until the first frame is applied.
    pub fn update<R>(&self, f: impl FnOnce(&mut Option<MachineState>) -> R) -> R {
        let mut guard = self.slot.lock();
        f(&mut guard)
    }

    /// Clone of the current state, if any.
    pub fn get(&self) -> Option<MachineState> {
        self.slot.lock().clone()
    }
}

impl MachineRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, id: &str) -> Slot {
        if let Some(slot) = self.machines.read().get(id) {
            return slot.clone();
        }
        self.machines
            .write()
            .entry(id.to_string())
            .or_default()
            .clone()
    }

    /// Handle to the entry for `id`, creating an empty one if needed.
    pub fn handle(&self, id: &str) -> MachineHandle {
        MachineHandle {
            id: id.to_string(),
            slot: self.slot(id),
        }
    }

    /// Install a previously published state for `id`.
    pub fn seed(&self, id: &str, state: MachineState) {
        *self.slot(id).lock() = Some(state);
    }

    /// Clone of the state for `id`.
    pub fn get(&self, id: &str) -> Option<MachineState> {
        let slot = self.machines.read().get(id).cloned()?;
        let state = slot.lock().clone();
        state
    }

    /// Number of machines with a state.
    pub fn len(&self) -> usize {
        self.machines
            .read()
            .values()
            .filter(|slot| slot.lock().is_some())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy of every machine with a state, keyed by id.
    ///
    /// Entries are locked one at a time, so the copy is not a single
    /// consistent instant across machines.
    pub fn snapshot(&self) -> BTreeMap<String, MachineState> {
        let slots: Vec<(String, Slot)> = self
            .machines
            .read()
            .iter()
            .map(|(id, slot)| (id.clone(), slot.clone()))
            .collect();

        slots
            .into_iter()
            .filter_map(|(id, slot)| {
                let state = slot.lock().clone()?;
                Some((id, state))
            })
            .collect()
    }

    /// Drop shift snapshots that went out in `published`.
    ///
    /// A snapshot taken after `published` was built is kept for the next round.
    pub fn clear_published_snapshots(&self, published: &BTreeMap<String, MachineState>) -> usize {
        let mut cleared = 0;
        for (id, sent) in published {
            let Some(sent_snapshot) = sent.previous_shift_snapshot.as_ref() else {
                continue;
            };
            let Some(slot) = self.machines.read().get(id).cloned() else {
                continue;
            };
            let mut guard = slot.lock();
            if let Some(state) = guard.as_mut() {
                if state.previous_shift_snapshot.as_ref() == Some(sent_snapshot) {
                    state.previous_shift_snapshot = None;
                    cleared += 1;
                }
            }
        }
        cleared
    }
}
