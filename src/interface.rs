//! The seam between simulations and their consumers.
//!
//! [`SimulationInterface`] is implemented both by the in-process front-end of
//! a local simulation ([`crate::simulation::SimulationHandle`]) and by the
//! network client ([`crate::client::RemoteSimulation`]), so renderers and
//! network adapters can drive either without caring where the back-end runs.

use std::io::{Read, Write};
use std::sync::Arc;

use glam::{Quat, Vec3};
use serde::{Deserialize, Serialize};

use crate::simulation::domain::Domain;
use crate::simulation::types::{PickId, SessionId, UnitType, UnitTypeId};
use crate::snapshot::SnapshotError;

/// User-adjustable simulation parameters. These flow from front-ends to the
/// back-end through a triple buffer and are snapshotted once per tick.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Parameters {
    /// Dampening factor for linear velocity differences at bond sites.
    /// Applied to the raw, unnormalized difference.
    pub linear_dampening: f32,
    /// Dampening factor for angular velocity differences of bonded units.
    pub angular_dampening: f32,
    /// Overall velocity attenuation factor, per simulation second.
    pub attenuation: f32,
    /// Speed-up factor from real time to simulation time. Externally
    /// supplied velocities are divided by this so the UI can express them in
    /// real time.
    pub time_factor: f32,
}

impl Default for Parameters {
    fn default() -> Self {
        Self {
            linear_dampening: 0.0,
            angular_dampening: 0.0,
            attenuation: 1.0,
            time_factor: 1.0,
        }
    }
}

/// One-shot callback invoked after a save request finished writing.
pub type SaveCompletion = Box<dyn FnOnce(Result<(), SnapshotError>) + Send>;

/// Called when the session changes (a load completed and a new session id is
/// valid).
pub type SessionChangedCallback = Box<dyn Fn(SessionId) + Send + Sync>;

/// Called when parameters changed asynchronously (e.g. another client set
/// them).
pub type ParametersChangedCallback = Box<dyn Fn(&Parameters) + Send + Sync>;

/// Operations offered by a simulation, local or remote.
///
/// Request methods enqueue work and return immediately; the back-end applies
/// requests atomically between integration steps, in enqueue order. A pick
/// id returned by `pick_point`/`pick_ray`/`paste` is immediately valid for
/// follow-up requests from the same producer.
pub trait SimulationInterface {
    /// Id of the current session, or 0 if no session is valid yet.
    fn session_id(&self) -> SessionId;

    /// The session's unit type dictionary.
    fn unit_types(&self) -> Arc<Vec<UnitType>>;

    /// The session's periodic simulation box.
    fn domain(&self) -> Domain;

    /// True while the session data (types, domain) matches the most recent
    /// load.
    fn is_session_valid(&self) -> bool;

    /// Locks the most recent published state; returns true if it is newer
    /// than the previously locked one.
    fn lock_new_state(&mut self) -> bool;

    /// True if the locked state belongs to the current session. Stale
    /// arrays from before a load fail this check and must not be rendered.
    fn is_locked_state_valid(&self) -> bool;

    fn get_parameters(&self) -> Parameters;
    fn set_parameters(&self, new_parameters: Parameters);

    fn set_session_changed_callback(&self, callback: Option<SessionChangedCallback>);
    fn set_parameters_changed_callback(&self, callback: Option<ParametersChangedCallback>);

    /// Picks the unit closest to `position` within `radius` (optionally the
    /// whole bond-connected complex) and returns the pick id holding it.
    fn pick_point(&self, position: Vec3, radius: f32, orientation: Quat, connected: bool)
        -> PickId;

    /// Ray variant of picking. Present for interface compatibility; the
    /// back-end currently implements only point picking and treats this as
    /// a no-op that still allocates an id.
    fn pick_ray(&self, position: Vec3, direction: Vec3, orientation: Quat, connected: bool)
        -> PickId;

    /// Instantiates the copy buffer at the given pose and returns a pick id
    /// holding all new units.
    fn paste(
        &self,
        position: Vec3,
        orientation: Quat,
        linear_velocity: Vec3,
        angular_velocity: Vec3,
    ) -> PickId;

    /// Creates a new unit held by `pick_id`, if that id does not already
    /// hold units.
    fn create(
        &self,
        pick_id: PickId,
        unit_type: UnitTypeId,
        position: Vec3,
        orientation: Quat,
        linear_velocity: Vec3,
        angular_velocity: Vec3,
    );

    /// Moves every unit held by `pick_id` to the given pose, preserving the
    /// per-unit offsets recorded at pick time.
    fn set_state(
        &self,
        pick_id: PickId,
        position: Vec3,
        orientation: Quat,
        linear_velocity: Vec3,
        angular_velocity: Vec3,
    );

    /// Copies the units held by `pick_id` (and their internal bonds) into
    /// the copy buffer, replacing its previous contents.
    fn copy(&self, pick_id: PickId);

    /// Deletes every unit held by `pick_id`.
    fn destroy(&self, pick_id: PickId);

    /// Releases every unit held by `pick_id` back to free motion. Unknown
    /// ids are ignored.
    fn release(&self, pick_id: PickId);

    /// Replaces the whole simulation state with a snapshot read from
    /// `source`, starting a new session. Invalidates the current session
    /// immediately; a decode failure leaves the simulation state untouched
    /// (and the session invalid until a later load succeeds).
    fn load_state(&self, source: Box<dyn Read + Send>);

    /// Writes a snapshot of the state to `sink` between two integration
    /// steps. The completion callback is invoked exactly once when the
    /// write has finished.
    fn save_state(&self, sink: Box<dyn Write + Send>, completion: Option<SaveCompletion>);
}
