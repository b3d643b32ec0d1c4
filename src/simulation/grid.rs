//! Wrap-around uniform grid accelerating neighborhood queries.
//!
//! Cell size is derived from the worst-case interaction radius over all unit
//! types, so any pair of units that can interact is guaranteed to sit in
//! adjacent cells. Every cell stores the indices of its 26 neighbors plus
//! itself, computed once with periodic wrap-around, which makes neighbor
//! traversal branchless during force calculation.
//!
//! A unit's current cell is recovered from `unit_cells[unit_index]`, not from
//! a pointer stored in the unit, so the grid and the state array never hold
//! references into each other.

use glam::Vec3;

use crate::simulation::domain::Domain;
use crate::simulation::types::{UnitIndex, UnitState, UnitType};

/// A single grid cell: its occupants and its precomputed neighborhood.
#[derive(Debug, Clone)]
pub struct Cell {
    /// Indices of this cell and its 26 wrap-around neighbors.
    pub neighbors: [u32; 27],
    /// Indices of the units currently inside this cell.
    pub units: Vec<UnitIndex>,
}

#[derive(Debug, Clone)]
pub struct SpatialGrid {
    num_cells: [u32; 3],
    cell_size: [f32; 3],
    origin: Vec3,
    cells: Vec<Cell>,
    /// Linear cell index of each unit, indexed by unit index.
    unit_cells: Vec<u32>,
}

/// Returns the next representable `f32` above a positive finite value.
fn next_up(value: f32) -> f32 {
    f32::from_bits(value.to_bits() + 1)
}

impl SpatialGrid {
    /// Creates an empty grid for the given domain, unit types, and force
    /// parameters.
    ///
    /// The minimum cell size is the worst case of the central force reach
    /// (`2*radius + overshoot`) and the vertex force reach
    /// (`2*|bond_site| + vertex_force_radius`) over all types. Cell sizes are
    /// nudged up by single float increments until positions on the domain
    /// boundary can no longer round to an out-of-range cell index.
    pub fn new(
        domain: &Domain,
        unit_types: &[UnitType],
        central_force_overshoot: f32,
        vertex_force_radius: f32,
    ) -> Self {
        let mut min_cell_size = vertex_force_radius.max(f32::EPSILON);
        for ut in unit_types {
            min_cell_size = min_cell_size.max(ut.radius * 2.0 + central_force_overshoot);
            for bs in &ut.bond_sites {
                min_cell_size = min_cell_size.max(bs.offset.length() * 2.0 + vertex_force_radius);
            }
        }

        let size = domain.size();
        let mut num_cells = [1u32; 3];
        let mut cell_size = [0.0f32; 3];
        for i in 0..3 {
            num_cells[i] = ((size[i] / min_cell_size).floor() as u32).max(1);
            cell_size[i] = size[i] / num_cells[i] as f32;
            while ((domain.max[i] - domain.min[i]) / cell_size[i]) as u32 >= num_cells[i] {
                cell_size[i] = next_up(cell_size[i]);
            }
        }

        let total = (num_cells[0] * num_cells[1] * num_cells[2]) as usize;
        let mut cells = Vec::with_capacity(total);
        let nx = num_cells[0] as i64;
        let ny = num_cells[1] as i64;
        let nz = num_cells[2] as i64;
        for z in 0..nz {
            for y in 0..ny {
                for x in 0..nx {
                    let mut neighbors = [0u32; 27];
                    let mut n = 0;
                    for dz in -1..=1i64 {
                        for dy in -1..=1i64 {
                            for dx in -1..=1i64 {
                                let wx = (x + dx).rem_euclid(nx);
                                let wy = (y + dy).rem_euclid(ny);
                                let wz = (z + dz).rem_euclid(nz);
                                neighbors[n] = ((wz * ny + wy) * nx + wx) as u32;
                                n += 1;
                            }
                        }
                    }
                    cells.push(Cell {
                        neighbors,
                        units: Vec::new(),
                    });
                }
            }
        }

        Self {
            num_cells,
            cell_size,
            origin: domain.min,
            cells,
            unit_cells: Vec::new(),
        }
    }

    pub fn num_cells(&self) -> [u32; 3] {
        self.num_cells
    }

    pub fn cell_size(&self) -> [f32; 3] {
        self.cell_size
    }

    /// Makes room in the per-unit cell index array for `num_units` units.
    pub fn reserve(&mut self, num_units: usize) {
        if self.unit_cells.len() < num_units {
            self.unit_cells.resize(num_units, 0);
        }
    }

    /// Per-axis cell coordinates of a pre-wrapped position.
    pub fn cell_coords(&self, position: Vec3) -> [u32; 3] {
        let mut coords = [0u32; 3];
        for i in 0..3 {
            coords[i] = ((position[i] - self.origin[i]) / self.cell_size[i]) as u32;
        }
        coords
    }

    /// Linear cell index of a pre-wrapped position.
    pub fn cell_of(&self, position: Vec3) -> u32 {
        let c = self.cell_coords(position);
        (c[2] * self.num_cells[1] + c[1]) * self.num_cells[0] + c[0]
    }

    /// Linear cell index currently assigned to a unit.
    pub fn cell_of_unit(&self, unit_index: UnitIndex) -> u32 {
        self.unit_cells[unit_index as usize]
    }

    pub fn cell(&self, cell_index: u32) -> &Cell {
        &self.cells[cell_index as usize]
    }

    /// Cell at possibly out-of-range per-axis coordinates, wrapped onto the
    /// grid. Used for pick neighborhoods that straddle the domain boundary.
    pub fn wrapped_cell(&self, coords: [i64; 3]) -> &Cell {
        let mut wrapped = [0u32; 3];
        for i in 0..3 {
            wrapped[i] = coords[i].rem_euclid(self.num_cells[i] as i64) as u32;
        }
        let index = (wrapped[2] * self.num_cells[1] + wrapped[1]) * self.num_cells[0] + wrapped[0];
        &self.cells[index as usize]
    }

    /// Adds a new unit at the given position.
    pub fn insert(&mut self, unit_index: UnitIndex, position: Vec3) {
        let cell_index = self.cell_of(position);
        self.cells[cell_index as usize].units.push(unit_index);
        if self.unit_cells.len() <= unit_index as usize {
            self.unit_cells.resize(unit_index as usize + 1, 0);
        }
        self.unit_cells[unit_index as usize] = cell_index;
    }

    /// Updates cell membership after a unit moved. O(1) if the cell did not
    /// change, otherwise a swap-remove from the old cell's list.
    pub fn move_unit(&mut self, unit_index: UnitIndex, position: Vec3) {
        let cell_index = self.cell_of(position);
        let old = self.unit_cells[unit_index as usize];
        if old != cell_index {
            Self::remove_from_cell(&mut self.cells[old as usize], unit_index);
            self.cells[cell_index as usize].units.push(unit_index);
            self.unit_cells[unit_index as usize] = cell_index;
        }
    }

    /// Updates cell membership for a whole state array after an integration
    /// step.
    pub fn move_units(&mut self, states: &[UnitState]) {
        for (i, state) in states.iter().enumerate() {
            self.move_unit(i as UnitIndex, state.position);
        }
    }

    /// Removes a unit from its cell. The hole in the per-unit index array is
    /// left behind; callers compact indices via [`Self::change_unit_index`].
    pub fn remove(&mut self, unit_index: UnitIndex) {
        let cell_index = self.unit_cells[unit_index as usize];
        Self::remove_from_cell(&mut self.cells[cell_index as usize], unit_index);
    }

    /// Rewrites the index a unit is registered under, after the state array
    /// moved it into a different slot.
    pub fn change_unit_index(&mut self, current_index: UnitIndex, new_index: UnitIndex) {
        let cell_index = self.unit_cells[current_index as usize];
        self.unit_cells[new_index as usize] = cell_index;
        for ui in &mut self.cells[cell_index as usize].units {
            if *ui == current_index {
                *ui = new_index;
                break;
            }
        }
    }

    fn remove_from_cell(cell: &mut Cell, unit_index: UnitIndex) {
        for i in 0..cell.units.len() {
            if cell.units[i] == unit_index {
                cell.units.swap_remove(i);
                break;
            }
        }
    }

    /// Verifies the grid invariant: every unit is registered in the cell its
    /// position maps to, exactly once. Panics on violation.
    pub fn check(&self, states: &[UnitState]) {
        for (i, state) in states.iter().enumerate() {
            let expected = self.cell_of(state.position);
            assert_eq!(
                self.unit_cells[i], expected,
                "unit {i} registered in cell {} but positioned in {expected}",
                self.unit_cells[i]
            );
            let occurrences = self.cells[expected as usize]
                .units
                .iter()
                .filter(|&&u| u == i as UnitIndex)
                .count();
            assert_eq!(occurrences, 1, "unit {i} appears {occurrences} times in its cell");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulation::types::UnitType;
    use glam::{Mat3, Quat};

    fn test_type() -> UnitType {
        UnitType::new(
            "probe".into(),
            1.0,
            1.0,
            Mat3::IDENTITY,
            vec![],
            vec![],
            vec![],
        )
    }

    fn test_grid(domain: &Domain) -> SpatialGrid {
        SpatialGrid::new(domain, &[test_type()], 0.5, 1.0)
    }

    fn unit_at(position: Vec3) -> UnitState {
        UnitState {
            position,
            orientation: Quat::IDENTITY,
            ..Default::default()
        }
    }

    #[test]
    fn boundary_positions_never_overshoot() {
        let domain = Domain::new(Vec3::ZERO, Vec3::new(10.0, 7.0, 13.0));
        let grid = test_grid(&domain);
        let n = grid.num_cells();
        // The top corner is outside the half-open domain, but float rounding
        // during wrapping can produce positions arbitrarily close to it.
        let just_inside = Vec3::new(
            f32::from_bits(domain.max.x.to_bits() - 1),
            f32::from_bits(domain.max.y.to_bits() - 1),
            f32::from_bits(domain.max.z.to_bits() - 1),
        );
        let c = grid.cell_coords(just_inside);
        for i in 0..3 {
            assert!(c[i] < n[i]);
        }
    }

    #[test]
    fn neighbors_wrap_around() {
        let domain = Domain::new(Vec3::ZERO, Vec3::splat(12.0));
        let grid = test_grid(&domain);
        let n = grid.num_cells();
        assert!(n[0] >= 3);
        // The cell at the origin corner must count the far corner cell among
        // its neighbors.
        let origin_cell = grid.cell_of(Vec3::splat(0.1));
        let far_cell = grid.cell_of(Vec3::new(11.9, 11.9, 11.9));
        assert!(grid.cell(origin_cell).neighbors.contains(&far_cell));
        // Every cell is its own 14th neighbor (center of the 3x3x3 block).
        assert_eq!(grid.cell(origin_cell).neighbors[13], origin_cell);
    }

    #[test]
    fn consistency_under_random_churn() {
        let domain = Domain::new(Vec3::ZERO, Vec3::splat(20.0));
        let mut grid = test_grid(&domain);
        let mut states: Vec<UnitState> = Vec::new();
        let mut seed = 0x9e3779b9u32;
        let mut next = move || {
            seed ^= seed << 13;
            seed ^= seed >> 17;
            seed ^= seed << 5;
            seed
        };
        let mut rand_pos = {
            let mut next = next.clone();
            move || {
                Vec3::new(
                    next() as f32 / u32::MAX as f32 * 20.0,
                    next() as f32 / u32::MAX as f32 * 20.0,
                    next() as f32 / u32::MAX as f32 * 20.0,
                )
            }
        };

        for step in 0..2000u32 {
            match next() % 4 {
                // insert
                0 => {
                    let p = domain.wrap_position(rand_pos());
                    let i = states.len() as UnitIndex;
                    grid.reserve(states.len() + 1);
                    grid.insert(i, p);
                    states.push(unit_at(p));
                }
                // move
                1 if !states.is_empty() => {
                    let i = (next() as usize) % states.len();
                    let p = domain.wrap_position(rand_pos());
                    states[i].position = p;
                    grid.move_unit(i as UnitIndex, p);
                }
                // remove last-swap, mirroring the engine's destroy compaction
                2 if !states.is_empty() => {
                    let i = (next() as usize) % states.len();
                    grid.remove(i as UnitIndex);
                    let last = states.len() - 1;
                    if i != last {
                        states[i] = states[last];
                        grid.change_unit_index(last as UnitIndex, i as UnitIndex);
                    }
                    states.pop();
                }
                _ => {}
            }
            if step % 64 == 0 {
                grid.check(&states);
            }
        }
        grid.check(&states);
    }
}
