//! Bonds between structural units' bonding sites.
//!
//! Every bond is stored in both directions: an entry mapping site A to site B
//! and one mapping B to A. The "up" half of a bond is the one whose source
//! unit index is smaller; passes that must visit each bond once (forces,
//! saving) iterate the up halves only.

use std::collections::HashMap;

use crate::simulation::types::UnitIndex;

/// One end of a bond: a bonding site on a unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Bond {
    pub unit_index: UnitIndex,
    pub bond_site_index: u32,
}

impl Bond {
    pub fn new(unit_index: UnitIndex, bond_site_index: u32) -> Self {
        Self {
            unit_index,
            bond_site_index,
        }
    }
}

/// Map of current bonds. Both halves are present or neither is.
#[derive(Debug, Clone, Default)]
pub struct BondMap {
    map: HashMap<Bond, Bond>,
}

impl BondMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Partner of the given site, if bonded.
    pub fn partner(&self, site: Bond) -> Option<Bond> {
        self.map.get(&site).copied()
    }

    pub fn is_bonded(&self, site: Bond) -> bool {
        self.map.contains_key(&site)
    }

    /// Inserts both halves of a bond.
    pub fn insert_pair(&mut self, a: Bond, b: Bond) {
        self.map.insert(a, b);
        self.map.insert(b, a);
    }

    /// Removes both halves of the bond attached to `site`. Returns the
    /// former partner, if any.
    pub fn remove_pair(&mut self, site: Bond) -> Option<Bond> {
        let partner = self.map.remove(&site)?;
        self.map.remove(&partner);
        Some(partner)
    }

    /// Number of bonds (pairs, not halves).
    pub fn len(&self) -> usize {
        self.map.len() / 2
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn clear(&mut self) {
        self.map.clear();
    }

    /// Iterates the up halves, one entry per bond.
    pub fn iter_up(&self) -> impl Iterator<Item = (Bond, Bond)> + '_ {
        self.map
            .iter()
            .filter(|(a, b)| a.unit_index < b.unit_index)
            .map(|(a, b)| (*a, *b))
    }

    /// Rewrites the endpoint index of every bond attached to
    /// `current_index`, after the state array moved the unit to `new_index`.
    /// `num_sites` is the unit's bond site count.
    pub fn change_unit_index(
        &mut self,
        current_index: UnitIndex,
        new_index: UnitIndex,
        num_sites: u32,
    ) {
        for site in 0..num_sites {
            let old_half = Bond::new(current_index, site);
            if let Some(partner) = self.map.remove(&old_half) {
                let new_half = Bond::new(new_index, site);
                self.map.insert(new_half, partner);
                self.map.insert(partner, new_half);
            }
        }
    }

    /// Checks the bond symmetry invariant: for every half (a -> b), the half
    /// (b -> a) exists and the endpoints are on distinct units. Panics on
    /// violation.
    #[cfg(test)]
    pub fn check(&self) {
        for (a, b) in &self.map {
            assert_ne!(a.unit_index, b.unit_index, "self-bond at {a:?}");
            assert_eq!(self.map.get(b), Some(a), "missing reverse half for {a:?} -> {b:?}");
        }
    }
}
