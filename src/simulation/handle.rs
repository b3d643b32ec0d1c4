//! Front-end access to a local simulation back-end.
//!
//! The back-end ([`crate::simulation::Simulation`]) exclusively owns the
//! authoritative state: grid, bond map, pick registry, copy buffer. Everything
//! front-ends may touch concurrently lives in [`SimShared`]: the request
//! queue, the parameters triple buffer, the pick id allocator, and the
//! session bookkeeping. [`SimulationHandle`] wraps the shared state together
//! with the reader half of the state triple buffer and implements
//! [`SimulationInterface`] on top.

use std::io::{Read, Write};
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use glam::{Quat, Vec3};

use crate::interface::{
    Parameters, ParametersChangedCallback, SaveCompletion, SessionChangedCallback,
    SimulationInterface,
};
use crate::simulation::domain::Domain;
use crate::simulation::picks::PickIdAllocator;
use crate::simulation::requests::UiRequest;
use crate::simulation::triple_buffer::{Reader, Writer};
use crate::simulation::types::{PickId, SessionId, UnitStateArray, UnitType, UnitTypeId};

/// State shared between the back-end and any number of front-end threads.
pub(crate) struct SimShared {
    /// Session the back-end is currently simulating. Written by the back-end
    /// when a load commits.
    pub(crate) session_id: AtomicU16,
    /// Session id of the most recent load request. Bumping this invalidates
    /// the current session until the load is applied.
    pub(crate) load_session_id: AtomicU16,
    pub(crate) unit_types: RwLock<Arc<Vec<UnitType>>>,
    pub(crate) domain: RwLock<Domain>,
    pub(crate) requests: Mutex<Vec<UiRequest>>,
    pub(crate) pick_ids: Arc<PickIdAllocator>,
    pub(crate) params_writer: Mutex<Writer<Parameters>>,
    pub(crate) current_parameters: Mutex<Parameters>,
    pub(crate) session_changed: Mutex<Option<SessionChangedCallback>>,
}

impl SimShared {
    pub(crate) fn enqueue(&self, request: UiRequest) {
        self.requests.lock().unwrap().push(request);
    }
}

/// The in-process front-end of a local simulation.
///
/// There is exactly one handle per simulation; it owns the single reader
/// slot of the published-state triple buffer. Request methods may be called
/// from the thread that owns the handle while the back-end runs elsewhere.
pub struct SimulationHandle {
    pub(crate) shared: Arc<SimShared>,
    pub(crate) states: Reader<UnitStateArray>,
}

impl SimulationHandle {
    /// The currently locked state array. Stable until the next successful
    /// [`SimulationInterface::lock_new_state`].
    pub fn locked_state(&self) -> &UnitStateArray {
        self.states.get_locked_value()
    }

    /// Allocates a pick id without issuing a request. The session layer uses
    /// this to honor client-allocated ids for create requests that arrive
    /// without a preceding pick.
    pub fn allocate_pick_id(&self) -> PickId {
        self.shared.pick_ids.allocate()
    }
}

impl SimulationInterface for SimulationHandle {
    fn session_id(&self) -> SessionId {
        self.shared.session_id.load(Ordering::Acquire)
    }

    fn unit_types(&self) -> Arc<Vec<UnitType>> {
        self.shared.unit_types.read().unwrap().clone()
    }

    fn domain(&self) -> Domain {
        *self.shared.domain.read().unwrap()
    }

    fn is_session_valid(&self) -> bool {
        let session = self.shared.session_id.load(Ordering::Acquire);
        session != 0 && session == self.shared.load_session_id.load(Ordering::Acquire)
    }

    fn lock_new_state(&mut self) -> bool {
        self.states.lock_new_value()
    }

    fn is_locked_state_valid(&self) -> bool {
        self.states.get_locked_value().session_id
            == self.shared.load_session_id.load(Ordering::Acquire)
    }

    fn get_parameters(&self) -> Parameters {
        *self.shared.current_parameters.lock().unwrap()
    }

    fn set_parameters(&self, new_parameters: Parameters) {
        let mut writer = self.shared.params_writer.lock().unwrap();
        *writer.start_new_value() = new_parameters;
        writer.post_new_value();
        *self.shared.current_parameters.lock().unwrap() = new_parameters;
    }

    fn set_session_changed_callback(&self, callback: Option<SessionChangedCallback>) {
        *self.shared.session_changed.lock().unwrap() = callback;
    }

    fn set_parameters_changed_callback(&self, _callback: Option<ParametersChangedCallback>) {
        // Parameters only change when this handle sets them; there is no
        // asynchronous source in the local case.
    }

    fn pick_point(
        &self,
        position: Vec3,
        radius: f32,
        orientation: Quat,
        connected: bool,
    ) -> PickId {
        let pick_id = self.shared.pick_ids.allocate();
        self.shared.enqueue(UiRequest::PickPoint {
            pick_id,
            position,
            radius,
            orientation,
            connected,
        });
        pick_id
    }

    fn pick_ray(
        &self,
        position: Vec3,
        direction: Vec3,
        orientation: Quat,
        connected: bool,
    ) -> PickId {
        let pick_id = self.shared.pick_ids.allocate();
        self.shared.enqueue(UiRequest::PickRay {
            pick_id,
            position,
            direction,
            orientation,
            connected,
        });
        pick_id
    }

    fn paste(
        &self,
        position: Vec3,
        orientation: Quat,
        linear_velocity: Vec3,
        angular_velocity: Vec3,
    ) -> PickId {
        let pick_id = self.shared.pick_ids.allocate();
        self.shared.enqueue(UiRequest::Paste {
            pick_id,
            position,
            orientation,
            linear_velocity,
            angular_velocity,
        });
        pick_id
    }

    fn create(
        &self,
        pick_id: PickId,
        unit_type: UnitTypeId,
        position: Vec3,
        orientation: Quat,
        linear_velocity: Vec3,
        angular_velocity: Vec3,
    ) {
        self.shared.enqueue(UiRequest::Create {
            pick_id,
            unit_type,
            position,
            orientation,
            linear_velocity,
            angular_velocity,
        });
    }

    fn set_state(
        &self,
        pick_id: PickId,
        position: Vec3,
        orientation: Quat,
        linear_velocity: Vec3,
        angular_velocity: Vec3,
    ) {
        self.shared.enqueue(UiRequest::SetState {
            pick_id,
            position,
            orientation,
            linear_velocity,
            angular_velocity,
        });
    }

    fn copy(&self, pick_id: PickId) {
        self.shared.enqueue(UiRequest::Copy { pick_id });
    }

    fn destroy(&self, pick_id: PickId) {
        self.shared.enqueue(UiRequest::Destroy { pick_id });
    }

    fn release(&self, pick_id: PickId) {
        self.shared.enqueue(UiRequest::Release { pick_id });
    }

    fn load_state(&self, source: Box<dyn Read + Send>) {
        // Invalidate the running session before the request is even seen by
        // the back-end; readers stop trusting published arrays immediately.
        let previous = self
            .shared
            .load_session_id
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |id| {
                let mut next = id.wrapping_add(1);
                if next == 0 {
                    next = 1;
                }
                Some(next)
            })
            .unwrap();
        let mut session_id = previous.wrapping_add(1);
        if session_id == 0 {
            session_id = 1;
        }
        self.shared.enqueue(UiRequest::LoadState { source, session_id });
    }

    fn save_state(&self, sink: Box<dyn Write + Send>, completion: Option<SaveCompletion>) {
        self.shared.enqueue(UiRequest::SaveState { sink, completion });
    }
}
