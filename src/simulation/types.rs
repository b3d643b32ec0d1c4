//! Core unit and state types shared by the simulation, the snapshot codec,
//! and the wire protocol.
//!
//! The simulation state is an ordered array of [`UnitState`] records indexed
//! by `u32`. Indices are dense: deleting a unit moves the last unit into the
//! freed slot (see the engine's destroy handling), so every index below the
//! current count is valid. Anything that needs to survive such a move (bonds,
//! pick records, grid membership) is rewritten at deletion time.

use glam::{Mat3, Quat, Vec3};

/// Identifies a unit type within a session's type list.
pub type UnitTypeId = u16;

/// Identifies a simulation session. A new id is issued for every successful
/// load; 0 is never a valid session.
pub type SessionId = u16;

/// Handle held by a user interaction that has frozen one or more units.
/// 0 means "not held".
pub type PickId = u16;

/// Index of a unit in the state array.
pub type UnitIndex = u32;

/// A potential bonding site, expressed as an offset from the unit's center
/// of gravity in the unit's local coordinate frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BondSite {
    pub offset: Vec3,
}

/// Immutable description of a kind of structural unit.
///
/// The inverse mass and inverse moment of inertia are precomputed because the
/// integrator divides by them for every unit on every step. They are never
/// serialized; readers recompute them from `mass` and `moment_of_inertia`.
#[derive(Debug, Clone)]
pub struct UnitType {
    pub name: String,
    /// Circumsphere radius, also the reach of the central repelling force.
    pub radius: f32,
    pub mass: f32,
    pub inv_mass: f32,
    pub moment_of_inertia: Mat3,
    pub inv_moment_of_inertia: Mat3,
    pub bond_sites: Vec<BondSite>,
    /// Triangle-list render mesh, in unit-local coordinates.
    pub mesh_vertices: Vec<Vec3>,
    pub mesh_triangles: Vec<u32>,
}

impl UnitType {
    /// Builds a unit type from its serialized fields, recomputing the
    /// inverse mass and inverse inertia tensor.
    pub fn new(
        name: String,
        radius: f32,
        mass: f32,
        moment_of_inertia: Mat3,
        bond_sites: Vec<BondSite>,
        mesh_vertices: Vec<Vec3>,
        mesh_triangles: Vec<u32>,
    ) -> Self {
        Self {
            name,
            radius,
            mass,
            inv_mass: 1.0 / mass,
            inv_moment_of_inertia: moment_of_inertia.inverse(),
            moment_of_inertia,
            bond_sites,
            mesh_vertices,
            mesh_triangles,
        }
    }

    /// Largest bond-site offset magnitude, used for grid cell sizing.
    pub fn max_bond_site_reach(&self) -> f32 {
        self.bond_sites
            .iter()
            .map(|bs| bs.offset.length())
            .fold(0.0, f32::max)
    }
}

/// Full per-instance state of a structural unit.
#[derive(Debug, Clone, Copy)]
pub struct UnitState {
    pub unit_type: UnitTypeId,
    /// Pick currently holding this unit, or 0 if the unit moves freely.
    pub pick_id: PickId,
    /// Position inside the simulation domain, kept wrapped.
    pub position: Vec3,
    /// Unit quaternion, renormalized after every integration step.
    pub orientation: Quat,
    pub linear_velocity: Vec3,
    pub angular_velocity: Vec3,
}

impl Default for UnitState {
    fn default() -> Self {
        Self {
            unit_type: 0,
            pick_id: 0,
            position: Vec3::ZERO,
            orientation: Quat::IDENTITY,
            linear_velocity: Vec3::ZERO,
            angular_velocity: Vec3::ZERO,
        }
    }
}

/// The subset of a unit's state a renderer needs, in 32-bit floats. This is
/// what goes over the wire in simulation update broadcasts.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReducedUnitState {
    pub unit_type: UnitTypeId,
    pub position: Vec3,
    pub orientation: Quat,
}

impl Default for ReducedUnitState {
    fn default() -> Self {
        Self {
            unit_type: 0,
            position: Vec3::ZERO,
            orientation: Quat::IDENTITY,
        }
    }
}

impl From<&UnitState> for ReducedUnitState {
    fn from(state: &UnitState) -> Self {
        Self {
            unit_type: state.unit_type,
            position: state.position,
            orientation: state.orientation,
        }
    }
}

/// A published array of unit states, stamped with the session that produced
/// it and a monotonically increasing step counter.
///
/// Readers must discard arrays whose `session_id` does not match the current
/// session; after a load, stale arrays from the previous session can still
/// sit in the triple buffer's unlocked slots.
#[derive(Debug, Clone, Default)]
pub struct StateArray<S> {
    pub session_id: SessionId,
    pub time_stamp: u32,
    pub states: Vec<S>,
}

pub type UnitStateArray = StateArray<UnitState>;
pub type ReducedUnitStateArray = StateArray<ReducedUnitState>;

impl UnitStateArray {
    /// Reduces this array into `out`, reusing its allocation.
    pub fn reduce_into(&self, out: &mut ReducedUnitStateArray) {
        out.session_id = self.session_id;
        out.time_stamp = self.time_stamp;
        out.states.clear();
        out.states.extend(self.states.iter().map(ReducedUnitState::from));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unit_type_precomputes_inverses() {
        let moi = Mat3::from_diagonal(Vec3::new(2.0, 4.0, 8.0));
        let ut = UnitType::new("test".into(), 1.0, 4.0, moi, Vec::new(), Vec::new(), Vec::new());
        assert_eq!(ut.inv_mass, 0.25);
        let recovered = ut.inv_moment_of_inertia * Vec3::new(2.0, 4.0, 8.0);
        assert!((recovered - Vec3::ONE).length() < 1e-6);
    }

    #[test]
    fn reduce_keeps_stamps_and_poses() {
        let mut full = UnitStateArray::default();
        full.session_id = 3;
        full.time_stamp = 17;
        full.states.push(UnitState {
            unit_type: 2,
            pick_id: 9,
            position: Vec3::new(1.0, 2.0, 3.0),
            orientation: Quat::from_rotation_y(0.5),
            linear_velocity: Vec3::X,
            angular_velocity: Vec3::Y,
        });

        let mut reduced = ReducedUnitStateArray::default();
        full.reduce_into(&mut reduced);
        assert_eq!(reduced.session_id, 3);
        assert_eq!(reduced.time_stamp, 17);
        assert_eq!(reduced.states.len(), 1);
        assert_eq!(reduced.states[0].unit_type, 2);
        assert_eq!(reduced.states[0].position, Vec3::new(1.0, 2.0, 3.0));
    }
}
