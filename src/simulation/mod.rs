//! The simulation core: state model, spatial grid, bonds, integrator, and
//! the concurrency plumbing that connects the back-end to its front-ends.
//!
//! The back-end ([`Simulation`]) runs on its own thread and owns all
//! authoritative state. Front-ends talk to it through a
//! [`SimulationHandle`]: requests go into a queue drained once per tick,
//! published states come back through a lock-free triple buffer.

pub mod bonds;
pub mod copy_buffer;
pub mod domain;
pub mod engine;
pub mod grid;
pub mod handle;
pub mod picks;
pub mod requests;
pub mod triple_buffer;
pub mod types;

pub use bonds::{Bond, BondMap};
pub use domain::Domain;
pub use engine::{ForceConstants, Simulation};
pub use grid::SpatialGrid;
pub use handle::SimulationHandle;
pub use requests::UiRequest;
pub use types::{
    PickId, ReducedUnitState, ReducedUnitStateArray, SessionId, StateArray, UnitIndex, UnitState,
    UnitStateArray, UnitType, UnitTypeId,
};
