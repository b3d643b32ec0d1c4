//! The versioned binary snapshot file.
//!
//! Layout (everything little-endian):
//! - 32-byte tag: `"NanotechConstructionKit 2.0\r\n"` zero-padded.
//! - unit-type vector (length-prefixed).
//! - domain box.
//! - four scalars: vertex force radius/strength, central force
//!   overshoot/strength.
//! - unit-state vector (length-prefixed; pick ids are not stored).
//! - bond vector: one record per bond, up half only
//!   (`unit0, site0, unit1, site1`); loading materializes both directions.
//!
//! Reading parses the whole file into a [`Snapshot`] before the caller
//! commits anything, so a truncated or corrupt file can be rejected without
//! touching live simulation state.

use std::io::{Read, Write};

use thiserror::Error;

use crate::simulation::bonds::{Bond, BondMap};
use crate::simulation::domain::Domain;
use crate::simulation::types::{UnitState, UnitType};
use crate::wire::{WireRead, WireWrite};

/// File identifier, zero-padded to 32 bytes on disk.
pub const FILE_TAG: &str = "NanotechConstructionKit 2.0\r\n";
const TAG_LEN: usize = 32;

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("input is not a unit file")]
    BadTag,
    #[error("unit {unit} references unknown type {unit_type}")]
    UnknownUnitType { unit: u32, unit_type: u16 },
    #[error("bond references unit {unit} of {count} or site {site}")]
    BadBond { unit: u32, site: u32, count: u32 },
    #[error("unit type {name:?} is invalid: {reason}")]
    BadUnitType { name: String, reason: String },
}

/// A fully decoded snapshot, ready to be committed into a simulation.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub unit_types: Vec<UnitType>,
    pub domain: Domain,
    pub vertex_force_radius: f32,
    pub vertex_force_strength: f32,
    pub central_force_overshoot: f32,
    pub central_force_strength: f32,
    pub states: Vec<UnitState>,
    pub bonds: Vec<(Bond, Bond)>,
}

fn tag_bytes() -> [u8; TAG_LEN] {
    let mut tag = [0u8; TAG_LEN];
    tag[..FILE_TAG.len()].copy_from_slice(FILE_TAG.as_bytes());
    tag
}

/// Writes a snapshot. Bonds are taken from the map's up halves.
pub fn write_snapshot<W: Write + ?Sized>(
    w: &mut W,
    unit_types: &[UnitType],
    domain: &Domain,
    vertex_force_radius: f32,
    vertex_force_strength: f32,
    central_force_overshoot: f32,
    central_force_strength: f32,
    states: &[UnitState],
    bonds: &BondMap,
) -> Result<(), SnapshotError> {
    w.write_all(&tag_bytes())?;

    (unit_types.len() as u32).write_wire(w)?;
    for ut in unit_types {
        ut.write_wire(w)?;
    }

    domain.write_wire(w)?;

    vertex_force_radius.write_wire(w)?;
    vertex_force_strength.write_wire(w)?;
    central_force_overshoot.write_wire(w)?;
    central_force_strength.write_wire(w)?;

    (states.len() as u32).write_wire(w)?;
    for state in states {
        state.write_wire(w)?;
    }

    (bonds.len() as u32).write_wire(w)?;
    for (a, b) in bonds.iter_up() {
        a.write_wire(w)?;
        b.write_wire(w)?;
    }

    w.flush()?;
    Ok(())
}

/// Reads and validates a snapshot.
pub fn read_snapshot<R: Read + ?Sized>(r: &mut R) -> Result<Snapshot, SnapshotError> {
    let mut tag = [0u8; TAG_LEN];
    r.read_exact(&mut tag)?;
    if tag != tag_bytes() {
        return Err(SnapshotError::BadTag);
    }

    let unit_types: Vec<UnitType> = Vec::read_wire(r)?;
    for ut in &unit_types {
        if !(ut.radius > 0.0) {
            return Err(SnapshotError::BadUnitType {
                name: ut.name.clone(),
                reason: format!("radius {} is not positive", ut.radius),
            });
        }
        if !(ut.mass > 0.0) {
            return Err(SnapshotError::BadUnitType {
                name: ut.name.clone(),
                reason: format!("mass {} is not positive", ut.mass),
            });
        }
    }

    let domain = Domain::read_wire(r)?;

    let vertex_force_radius = f32::read_wire(r)?;
    let vertex_force_strength = f32::read_wire(r)?;
    let central_force_overshoot = f32::read_wire(r)?;
    let central_force_strength = f32::read_wire(r)?;

    let states: Vec<UnitState> = Vec::read_wire(r)?;
    for (i, state) in states.iter().enumerate() {
        if state.unit_type as usize >= unit_types.len() {
            return Err(SnapshotError::UnknownUnitType {
                unit: i as u32,
                unit_type: state.unit_type,
            });
        }
    }

    let num_bonds = u32::read_wire(r)?;
    let mut bonds = Vec::with_capacity(num_bonds.min(crate::wire::MAX_SEQUENCE_LEN) as usize);
    for _ in 0..num_bonds {
        let a = Bond::read_wire(r)?;
        let b = Bond::read_wire(r)?;
        for half in [&a, &b] {
            let unit = half.unit_index;
            let site = half.bond_site_index;
            let valid = (unit as usize) < states.len()
                && (site as usize)
                    < unit_types[states[unit as usize].unit_type as usize].bond_sites.len();
            if !valid {
                return Err(SnapshotError::BadBond {
                    unit,
                    site,
                    count: states.len() as u32,
                });
            }
        }
        bonds.push((a, b));
    }

    Ok(Snapshot {
        unit_types,
        domain,
        vertex_force_radius,
        vertex_force_strength,
        central_force_overshoot,
        central_force_strength,
        states,
        bonds,
    })
}
