//! Copy buffer: a detached snapshot of picked units and their internal
//! bonds, kept for later pasting.

use glam::{Quat, Vec3};

use crate::simulation::bonds::Bond;
use crate::simulation::types::UnitTypeId;

/// A copied unit: its type and its pose relative to the pick frame the copy
/// was taken in.
#[derive(Debug, Clone, Copy)]
pub struct CopiedUnit {
    pub unit_type: UnitTypeId,
    pub position_offset: Vec3,
    pub orientation_offset: Quat,
}

/// Contents of the copy buffer. Bond endpoints are expressed in copy-buffer
/// local indices (0..units.len()); paste rebases them onto freshly created
/// units. A successful copy replaces the whole buffer atomically.
#[derive(Debug, Clone, Default)]
pub struct CopyBuffer {
    pub units: Vec<CopiedUnit>,
    pub bonds: Vec<(Bond, Bond)>,
}

impl CopyBuffer {
    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    /// Replaces the buffer contents in one step.
    pub fn replace(&mut self, units: Vec<CopiedUnit>, bonds: Vec<(Bond, Bond)>) {
        debug_assert!(bonds
            .iter()
            .all(|(a, b)| (a.unit_index as usize) < units.len()
                && (b.unit_index as usize) < units.len()));
        self.units = units;
        self.bonds = bonds;
    }
}
