//! # Nanokit: a networked rigid structural-unit construction simulator
//!
//! Nanokit simulates a population of rigid polyhedral "structural units" in
//! a periodic box. Units repel each other around their centers, attract each
//! other at bonding sites, and form and break bonds as those sites drift in
//! and out of reach. Users grab units (or whole bonded complexes), drag them
//! around, copy, paste, and destroy them, either in-process or over a TCP
//! session protocol.
//!
//! ## Architecture
//!
//! Three subsystems carry the weight:
//!
//! - **Simulation engine** ([`simulation`]): a deterministic integrator over
//!   a state array, accelerated by a wrap-around uniform grid with
//!   precomputed 27-cell neighborhoods. The back-end owns all authoritative
//!   state and runs on its own thread.
//! - **Concurrency pipeline**: published states cross the back-end/front-end
//!   boundary through a lock-free triple buffer
//!   ([`simulation::triple_buffer`]); user requests flow the other way
//!   through a queue drained atomically between integration steps
//!   ([`simulation::requests`]).
//! - **Session layer** ([`protocol`], [`server`], [`client`]): a
//!   message-framed protocol that distributes the unit-type dictionary and
//!   domain on session changes and broadcasts reduced state snapshots at a
//!   configurable rate, translating client pick ids to authoritative ones.
//!
//! Around those: the snapshot codec ([`snapshot`]) for the versioned binary
//! state file, the wire atoms both it and the protocol share ([`wire`]),
//! the RON configuration ([`config`]), and the [`interface`] seam that lets
//! renderers drive a local and a remote simulation identically.
//!
//! ## Dataflow, one tick
//!
//! ```text
//! requests -> pick registry mutations -> integrator (grid-accelerated)
//!          -> bond make/break -> publish via triple buffer
//!          -> session layer reduces and broadcasts
//! ```

pub mod client;
pub mod config;
pub mod interface;
pub mod protocol;
pub mod server;
pub mod simulation;
pub mod snapshot;
pub mod streams;
pub mod wire;

pub use interface::{Parameters, SimulationInterface};
pub use simulation::{Simulation, SimulationHandle};
