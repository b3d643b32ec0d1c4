//! Pick records: which units are frozen by which user interaction.
//!
//! A pick id is allocated on the requesting side and becomes a handle for
//! follow-up requests (set-state, copy, destroy, release). The back-end owns
//! the authoritative registry mapping ids to the picked units and their rigid
//! offsets in the pick frame. Allocation and the registry share a set of
//! live ids so an id is never handed out twice while still in use; the
//! original recycled ids by peeking at the registry from the requesting
//! thread, which is a data race this split avoids.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use glam::{Quat, Vec3};

use crate::simulation::types::{PickId, UnitIndex};

/// One picked unit: its index and its pose relative to the pick frame.
#[derive(Debug, Clone, Copy)]
pub struct PickRecord {
    pub unit_index: UnitIndex,
    /// Offset from the pick position to the unit's center, in the pick's
    /// inverse frame.
    pub position_offset: Vec3,
    /// Offset from the pick orientation to the unit's orientation.
    pub orientation_offset: Quat,
}

/// Allocates pick ids: monotonic, skipping 0 and any id still live.
#[derive(Debug, Default)]
pub struct PickIdAllocator {
    inner: Mutex<AllocState>,
}

#[derive(Debug, Default)]
struct AllocState {
    last: PickId,
    live: HashSet<PickId>,
}

impl PickIdAllocator {
    pub fn allocate(&self) -> PickId {
        let mut state = self.inner.lock().unwrap();
        loop {
            state.last = state.last.wrapping_add(1);
            if state.last != 0 && !state.live.contains(&state.last) {
                break;
            }
        }
        let id = state.last;
        state.live.insert(id);
        id
    }

    fn retire(&self, pick_id: PickId) {
        self.inner.lock().unwrap().live.remove(&pick_id);
    }

    fn mark_live(&self, pick_id: PickId) {
        self.inner.lock().unwrap().live.insert(pick_id);
    }

    fn retire_all(&self) {
        self.inner.lock().unwrap().live.clear();
    }

    #[cfg(test)]
    pub fn is_live(&self, pick_id: PickId) -> bool {
        self.inner.lock().unwrap().live.contains(&pick_id)
    }
}

/// Back-end-owned map from pick ids to their record lists.
///
/// Invariant: an id has an entry here iff at least one unit carries it in
/// `pick_id`, and iff the id is still marked live in the allocator.
pub struct PickRegistry {
    records: HashMap<PickId, Vec<PickRecord>>,
    allocator: Arc<PickIdAllocator>,
}

impl PickRegistry {
    pub fn new(allocator: Arc<PickIdAllocator>) -> Self {
        Self {
            records: HashMap::new(),
            allocator,
        }
    }

    pub fn records(&self, pick_id: PickId) -> Option<&[PickRecord]> {
        self.records.get(&pick_id).map(Vec::as_slice)
    }

    pub fn contains(&self, pick_id: PickId) -> bool {
        self.records.contains_key(&pick_id)
    }

    pub fn push_record(&mut self, pick_id: PickId, record: PickRecord) {
        // The id may have been retired between allocation and record
        // creation (a pick that missed, followed by a create); holding
        // records always implies liveness.
        self.allocator.mark_live(pick_id);
        self.records.entry(pick_id).or_default().push(record);
    }

    /// Removes a whole pick and retires its id. Returns the records, if the
    /// id had any.
    pub fn remove(&mut self, pick_id: PickId) -> Option<Vec<PickRecord>> {
        let records = self.records.remove(&pick_id);
        self.allocator.retire(pick_id);
        records
    }

    /// Retires an id that ended up without a record (failed pick, release of
    /// an unknown id). No-op while the id still has records.
    pub fn retire_if_empty(&mut self, pick_id: PickId) {
        if !self.records.contains_key(&pick_id) {
            self.allocator.retire(pick_id);
        }
    }

    /// Removes one unit's record from a pick, as happens when another pick
    /// grabs a unit that is already held. Drops the pick entirely if that
    /// was its last unit.
    pub fn unpick_unit(&mut self, pick_id: PickId, unit_index: UnitIndex) {
        if let Some(records) = self.records.get_mut(&pick_id) {
            for i in 0..records.len() {
                if records[i].unit_index == unit_index {
                    records.swap_remove(i);
                    break;
                }
            }
            if records.is_empty() {
                self.records.remove(&pick_id);
                self.allocator.retire(pick_id);
            }
        }
    }

    /// Rewrites a picked unit's index after the state array moved it.
    pub fn change_unit_index(
        &mut self,
        pick_id: PickId,
        current_index: UnitIndex,
        new_index: UnitIndex,
    ) {
        if let Some(records) = self.records.get_mut(&pick_id) {
            for record in records.iter_mut() {
                if record.unit_index == current_index {
                    record.unit_index = new_index;
                    break;
                }
            }
        }
    }

    /// Drops every pick, as a session load does.
    pub fn clear(&mut self) {
        self.records.clear();
        self.allocator.retire_all();
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(unit_index: UnitIndex) -> PickRecord {
        PickRecord {
            unit_index,
            position_offset: Vec3::ZERO,
            orientation_offset: Quat::IDENTITY,
        }
    }

    #[test]
    fn allocation_skips_zero_and_live_ids() {
        let alloc = Arc::new(PickIdAllocator::default());
        let a = alloc.allocate();
        let b = alloc.allocate();
        assert_ne!(a, 0);
        assert_ne!(b, 0);
        assert_ne!(a, b);

        // Wrap the counter around; the still-live ids must be skipped.
        alloc.inner.lock().unwrap().last = PickId::MAX;
        let c = alloc.allocate();
        assert!(c != 0 && c != a && c != b);
    }

    #[test]
    fn remove_retires_the_id() {
        let alloc = Arc::new(PickIdAllocator::default());
        let mut registry = PickRegistry::new(Arc::clone(&alloc));
        let id = alloc.allocate();
        registry.push_record(id, record(4));
        assert!(alloc.is_live(id));
        let records = registry.remove(id).unwrap();
        assert_eq!(records.len(), 1);
        assert!(!alloc.is_live(id));
    }

    #[test]
    fn unpicking_the_last_unit_drops_the_pick() {
        let alloc = Arc::new(PickIdAllocator::default());
        let mut registry = PickRegistry::new(Arc::clone(&alloc));
        let id = alloc.allocate();
        registry.push_record(id, record(1));
        registry.push_record(id, record(2));

        registry.unpick_unit(id, 1);
        assert_eq!(registry.records(id).unwrap().len(), 1);
        assert!(alloc.is_live(id));

        registry.unpick_unit(id, 2);
        assert!(registry.records(id).is_none());
        assert!(!alloc.is_live(id));
    }

    #[test]
    fn failed_pick_frees_its_id() {
        let alloc = Arc::new(PickIdAllocator::default());
        let mut registry = PickRegistry::new(Arc::clone(&alloc));
        let id = alloc.allocate();
        registry.retire_if_empty(id);
        assert!(!alloc.is_live(id));
    }
}
