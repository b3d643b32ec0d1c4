//! Requests from front-ends to the simulation back-end.
//!
//! Producers append to a mutex-guarded list; the back-end swaps the whole
//! list out once per tick, so the lock is held only for the swap and the
//! per-tick ordering matches enqueue order.

use std::io::{Read, Write};

use glam::{Quat, Vec3};

use crate::interface::SaveCompletion;
use crate::simulation::types::{PickId, SessionId, UnitTypeId};

/// A single queued request. Velocities in pick/create/set-state requests are
/// expressed in real time; the back-end divides them by the current time
/// factor when it applies the request.
pub enum UiRequest {
    PickPoint {
        pick_id: PickId,
        position: Vec3,
        radius: f32,
        orientation: Quat,
        connected: bool,
    },
    PickRay {
        pick_id: PickId,
        position: Vec3,
        direction: Vec3,
        orientation: Quat,
        connected: bool,
    },
    Paste {
        pick_id: PickId,
        position: Vec3,
        orientation: Quat,
        linear_velocity: Vec3,
        angular_velocity: Vec3,
    },
    Create {
        pick_id: PickId,
        unit_type: UnitTypeId,
        position: Vec3,
        orientation: Quat,
        linear_velocity: Vec3,
        angular_velocity: Vec3,
    },
    SetState {
        pick_id: PickId,
        position: Vec3,
        orientation: Quat,
        linear_velocity: Vec3,
        angular_velocity: Vec3,
    },
    Copy {
        pick_id: PickId,
    },
    Destroy {
        pick_id: PickId,
    },
    Release {
        pick_id: PickId,
    },
    SaveState {
        sink: Box<dyn Write + Send>,
        completion: Option<SaveCompletion>,
    },
    LoadState {
        source: Box<dyn Read + Send>,
        session_id: SessionId,
    },
}
