//! Server configuration, read from a RON file.
//!
//! Every key has a default, so a missing file or a sparse one still yields a
//! runnable simulation. Unit types are validated individually; a malformed
//! type definition is reported and skipped, and the simulation proceeds with
//! the remainder.

use std::path::Path;

use glam::{Mat3, Vec3};
use log::error;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::interface::Parameters;
use crate::simulation::domain::Domain;
use crate::simulation::types::{BondSite, UnitType};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read configuration: {0}")]
    Io(#[from] std::io::Error),
    #[error("could not parse configuration: {0}")]
    Parse(#[from] ron::error::SpannedError),
}

/// A unit type definition as it appears in the configuration file. The
/// moment of inertia is given in rows.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnitTypeConfig {
    pub name: String,
    pub radius: f32,
    pub mass: f32,
    pub moment_of_inertia: [[f32; 3]; 3],
    pub bond_sites: Vec<Vec3>,
    pub mesh_vertices: Vec<Vec3>,
    pub mesh_triangles: Vec<u32>,
}

impl UnitTypeConfig {
    /// A regular tetrahedron with bond sites on its four vertices; the
    /// default building block.
    pub fn tetrahedron() -> Self {
        let s = 1.0 / 3.0f32.sqrt();
        let corners = vec![
            Vec3::new(s, s, s),
            Vec3::new(s, -s, -s),
            Vec3::new(-s, s, -s),
            Vec3::new(-s, -s, s),
        ];
        Self {
            name: "tetrahedron".into(),
            radius: 1.0,
            mass: 1.0,
            moment_of_inertia: [[0.4, 0.0, 0.0], [0.0, 0.4, 0.0], [0.0, 0.0, 0.4]],
            bond_sites: corners.clone(),
            mesh_vertices: corners,
            mesh_triangles: vec![0, 1, 2, 0, 3, 1, 0, 2, 3, 1, 3, 2],
        }
    }

    fn validate(&self) -> Result<UnitType, String> {
        if !(self.radius > 0.0) {
            return Err(format!("radius {} is not positive", self.radius));
        }
        if !(self.mass > 0.0) {
            return Err(format!("mass {} is not positive", self.mass));
        }
        let moi = mat3_from_rows(&self.moment_of_inertia);
        if moi.determinant().abs() < f32::EPSILON {
            return Err("moment of inertia is singular".into());
        }
        if self.mesh_triangles.len() % 3 != 0 {
            return Err(format!(
                "mesh triangle list length {} is not a multiple of 3",
                self.mesh_triangles.len()
            ));
        }
        if let Some(&index) = self
            .mesh_triangles
            .iter()
            .find(|&&index| index as usize >= self.mesh_vertices.len())
        {
            return Err(format!("mesh triangle references vertex {index} out of range"));
        }

        Ok(UnitType::new(
            self.name.clone(),
            self.radius,
            self.mass,
            moi,
            self.bond_sites
                .iter()
                .map(|&offset| BondSite { offset })
                .collect(),
            self.mesh_vertices.clone(),
            self.mesh_triangles.clone(),
        ))
    }
}

fn mat3_from_rows(rows: &[[f32; 3]; 3]) -> Mat3 {
    Mat3::from_cols(
        Vec3::new(rows[0][0], rows[1][0], rows[2][0]),
        Vec3::new(rows[0][1], rows[1][1], rows[2][1]),
        Vec3::new(rows[0][2], rows[1][2], rows[2][2]),
    )
}

/// All recognized configuration options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    /// The periodic simulation box.
    pub domain: Domain,
    /// Broadcast cadence of the session layer, in Hz.
    pub simulation_update_rate: f64,

    pub vertex_force_radius: f32,
    pub vertex_force_strength: f32,
    pub central_force_overshoot: f32,
    pub central_force_strength: f32,

    pub linear_dampening: f32,
    pub angular_dampening: f32,
    pub attenuation: f32,
    pub time_factor: f32,

    /// Safety ceiling for the effective integration step, in simulation
    /// seconds.
    pub time_step_ceiling: f32,

    pub structural_unit_types: Vec<UnitTypeConfig>,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            domain: Domain::default(),
            simulation_update_rate: 60.0,
            vertex_force_radius: 1.0,
            vertex_force_strength: 20.0,
            central_force_overshoot: 0.5,
            central_force_strength: 20.0,
            linear_dampening: 0.0,
            angular_dampening: 0.0,
            attenuation: 0.9,
            time_factor: 10.0,
            time_step_ceiling: 0.06,
            structural_unit_types: vec![UnitTypeConfig::tetrahedron()],
        }
    }
}

impl SimulationConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Ok(ron::from_str(&text)?)
    }

    /// The user-adjustable parameter subset.
    pub fn parameters(&self) -> Parameters {
        Parameters {
            linear_dampening: self.linear_dampening,
            angular_dampening: self.angular_dampening,
            attenuation: self.attenuation,
            time_factor: self.time_factor,
        }
    }

    /// Validates the configured unit types, skipping (and reporting) any
    /// that are malformed.
    pub fn build_unit_types(&self) -> Vec<UnitType> {
        let mut unit_types = Vec::with_capacity(self.structural_unit_types.len());
        for definition in &self.structural_unit_types {
            match definition.validate() {
                Ok(unit_type) => unit_types.push(unit_type),
                Err(reason) => {
                    error!("ignoring unit type {:?}: {reason}", definition.name);
                }
            }
        }
        unit_types
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_round_trips_through_ron() {
        let config = SimulationConfig::default();
        let text = ron::to_string(&config).unwrap();
        let parsed: SimulationConfig = ron::from_str(&text).unwrap();
        assert_eq!(parsed.simulation_update_rate, 60.0);
        assert_eq!(parsed.structural_unit_types.len(), 1);
        assert_eq!(parsed.domain, config.domain);
    }

    #[test]
    fn sparse_config_fills_defaults() {
        let parsed: SimulationConfig = ron::from_str("(time_factor: 4.0)").unwrap();
        assert_eq!(parsed.time_factor, 4.0);
        assert_eq!(parsed.attenuation, 0.9);
        assert_eq!(parsed.time_step_ceiling, 0.06);
    }

    #[test]
    fn malformed_unit_types_are_skipped() {
        let mut config = SimulationConfig::default();
        config.structural_unit_types.push(UnitTypeConfig {
            name: "broken".into(),
            radius: -1.0,
            mass: 1.0,
            moment_of_inertia: [[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]],
            bond_sites: vec![],
            mesh_vertices: vec![],
            mesh_triangles: vec![],
        });
        let types = config.build_unit_types();
        assert_eq!(types.len(), 1);
        assert_eq!(types[0].name, "tetrahedron");
    }

    #[test]
    fn moment_of_inertia_reads_rows() {
        let definition = UnitTypeConfig {
            name: "asym".into(),
            radius: 1.0,
            mass: 2.0,
            moment_of_inertia: [[1.0, 2.0, 3.0], [4.0, 5.0, 6.0], [7.0, 8.0, 10.0]],
            bond_sites: vec![],
            mesh_vertices: vec![],
            mesh_triangles: vec![],
        };
        let unit_type = definition.validate().unwrap();
        // Row 0 of the config is row 0 of the tensor.
        assert_eq!(unit_type.moment_of_inertia.row(0), Vec3::new(1.0, 2.0, 3.0));
        assert_eq!(unit_type.inv_mass, 0.5);
    }
}
