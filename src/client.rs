//! The network client: a [`SimulationInterface`] backed by a remote server.
//!
//! Request methods serialize straight onto the TCP connection; a reader
//! thread feeds server notifications into client-side session state and
//! pushes reduced state arrays through a triple buffer, exactly like the
//! local back-end publishes full ones. Pick ids are allocated locally and
//! translated by the server.

use std::io::{self, BufReader, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread;

use glam::{Quat, Vec3};
use log::{error, info, warn};

use crate::interface::{
    Parameters, ParametersChangedCallback, SaveCompletion, SessionChangedCallback,
    SimulationInterface,
};
use crate::protocol::{self, ClientMessage, ServerMessage};
use crate::simulation::domain::Domain;
use crate::simulation::triple_buffer::{triple_buffer, Reader, Writer};
use crate::simulation::types::{
    PickId, ReducedUnitStateArray, SessionId, UnitType, UnitTypeId,
};
use crate::snapshot::SnapshotError;
use crate::streams::StreamHub;

struct PendingSave {
    sink: Box<dyn Write + Send>,
    completion: Option<SaveCompletion>,
}

struct ClientShared {
    session_id: AtomicU16,
    domain: RwLock<Domain>,
    unit_types: RwLock<Arc<Vec<UnitType>>>,
    parameters: Mutex<Parameters>,
    last_pick_id: Mutex<PickId>,
    pending_save: Mutex<Option<PendingSave>>,
    session_changed: Mutex<Option<SessionChangedCallback>>,
    parameters_changed: Mutex<Option<ParametersChangedCallback>>,
}

impl ClientShared {
    fn next_pick_id(&self) -> PickId {
        let mut last = self.last_pick_id.lock().unwrap();
        loop {
            *last = last.wrapping_add(1);
            if *last != 0 {
                break;
            }
        }
        *last
    }
}

/// Client-side simulation mirror, connected to a server.
pub struct RemoteSimulation {
    conn: Arc<Mutex<TcpStream>>,
    shared: Arc<ClientShared>,
    states: Reader<ReducedUnitStateArray>,
    hub: Arc<dyn StreamHub>,
}

impl RemoteSimulation {
    /// Connects, performs the protocol hello, and starts the reader thread.
    pub fn connect<A: ToSocketAddrs>(
        addr: A,
        hub: Arc<dyn StreamHub>,
    ) -> io::Result<RemoteSimulation> {
        let mut stream = TcpStream::connect(addr)?;
        let _ = stream.set_nodelay(true);
        protocol::write_hello(&mut stream)
            .map_err(|err| io::Error::new(io::ErrorKind::Other, err.to_string()))?;

        let shared = Arc::new(ClientShared {
            session_id: AtomicU16::new(0),
            domain: RwLock::new(Domain::default()),
            unit_types: RwLock::new(Arc::new(Vec::new())),
            parameters: Mutex::new(Parameters::default()),
            last_pick_id: Mutex::new(0),
            pending_save: Mutex::new(None),
            session_changed: Mutex::new(None),
            parameters_changed: Mutex::new(None),
        });
        let (states_writer, states_reader) = triple_buffer(ReducedUnitStateArray::default());

        {
            let read_half = stream.try_clone()?;
            let shared = Arc::clone(&shared);
            let hub = Arc::clone(&hub);
            thread::Builder::new()
                .name("remote-sim-reader".into())
                .spawn(move || reader_thread(read_half, states_writer, shared, hub))?;
        }

        Ok(RemoteSimulation {
            conn: Arc::new(Mutex::new(stream)),
            shared,
            states: states_reader,
            hub,
        })
    }

    /// The locked reduced state array. Stable until the next successful
    /// [`SimulationInterface::lock_new_state`].
    pub fn locked_reduced_state(&self) -> &ReducedUnitStateArray {
        self.states.get_locked_value()
    }

    fn send(&self, message: &ClientMessage) {
        let bytes = message.encode();
        let mut conn = self.conn.lock().unwrap();
        if let Err(err) = conn.write_all(&bytes) {
            warn!("sending request to server failed: {err}");
        }
    }
}

fn reader_thread(
    stream: TcpStream,
    mut states: Writer<ReducedUnitStateArray>,
    shared: Arc<ClientShared>,
    hub: Arc<dyn StreamHub>,
) {
    let mut reader = BufReader::new(stream);
    loop {
        let message = match ServerMessage::read_from(&mut reader) {
            Ok(message) => message,
            Err(err) => {
                info!("server connection closed: {err}");
                shared.session_id.store(0, Ordering::Release);
                break;
            }
        };

        match message {
            ServerMessage::SessionInvalid => {
                shared.session_id.store(0, Ordering::Release);
            }
            ServerMessage::SessionUpdate {
                session_id,
                domain,
                unit_types,
            } => {
                *shared.domain.write().unwrap() = domain;
                *shared.unit_types.write().unwrap() = Arc::new(unit_types);
                shared.session_id.store(session_id, Ordering::Release);
                if let Some(callback) = &*shared.session_changed.lock().unwrap() {
                    callback(session_id);
                }
            }
            ServerMessage::SetParameters(parameters) => {
                *shared.parameters.lock().unwrap() = parameters;
                if let Some(callback) = &*shared.parameters_changed.lock().unwrap() {
                    callback(&parameters);
                }
            }
            ServerMessage::SimulationUpdate(array) => {
                *states.start_new_value() = array;
                states.post_new_value();
            }
            ServerMessage::SaveStateReply { stream_id } => {
                handle_save_reply(&shared, &hub, stream_id);
            }
        }
    }
}

/// The server announced the stream carrying our requested snapshot; copy it
/// to the local sink on a background thread.
fn handle_save_reply(shared: &ClientShared, hub: &Arc<dyn StreamHub>, stream_id: u32) {
    let pending = shared.pending_save.lock().unwrap().take();
    let PendingSave { sink, completion } = match pending {
        Some(pending) => pending,
        None => {
            warn!("unexpected save reply for stream {stream_id}");
            return;
        }
    };

    match hub.accept_in_stream(stream_id) {
        Ok(source) => {
            let spawned = thread::Builder::new().name("save-stream".into()).spawn(move || {
                let mut source = source;
                let mut sink = sink;
                let result = io::copy(&mut source, &mut sink)
                    .and_then(|_| sink.flush())
                    .map(|_| ())
                    .map_err(SnapshotError::Io);
                if let Err(err) = &result {
                    error!("receiving saved state failed: {err}");
                }
                if let Some(completion) = completion {
                    completion(result);
                }
            });
            if let Err(err) = spawned {
                error!("could not spawn save-stream thread: {err}");
            }
        }
        Err(err) => {
            error!("save stream {stream_id} unavailable: {err}");
            if let Some(completion) = completion {
                completion(Err(SnapshotError::Io(err)));
            }
        }
    }
}

impl SimulationInterface for RemoteSimulation {
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
        self.session_id() != 0
    }

    fn lock_new_state(&mut self) -> bool {
        self.states.lock_new_value()
    }

    fn is_locked_state_valid(&self) -> bool {
        let session = self.session_id();
        session != 0 && self.states.get_locked_value().session_id == session
    }

    fn get_parameters(&self) -> Parameters {
        *self.shared.parameters.lock().unwrap()
    }

    fn set_parameters(&self, new_parameters: Parameters) {
        *self.shared.parameters.lock().unwrap() = new_parameters;
        self.send(&ClientMessage::SetParameters(new_parameters));
    }

    fn set_session_changed_callback(&self, callback: Option<SessionChangedCallback>) {
        *self.shared.session_changed.lock().unwrap() = callback;
    }

    fn set_parameters_changed_callback(&self, callback: Option<ParametersChangedCallback>) {
        *self.shared.parameters_changed.lock().unwrap() = callback;
    }

    fn pick_point(
        &self,
        position: Vec3,
        radius: f32,
        orientation: Quat,
        connected: bool,
    ) -> PickId {
        let pick_id = self.shared.next_pick_id();
        self.send(&ClientMessage::PointPick {
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
        let pick_id = self.shared.next_pick_id();
        self.send(&ClientMessage::RayPick {
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
        let pick_id = self.shared.next_pick_id();
        self.send(&ClientMessage::PasteUnit {
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
        self.send(&ClientMessage::CreateUnit {
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
        self.send(&ClientMessage::SetUnitState {
            pick_id,
            position,
            orientation,
            linear_velocity,
            angular_velocity,
        });
    }

    fn copy(&self, pick_id: PickId) {
        self.send(&ClientMessage::CopyUnit { pick_id });
    }

    fn destroy(&self, pick_id: PickId) {
        self.send(&ClientMessage::DestroyUnit { pick_id });
    }

    fn release(&self, pick_id: PickId) {
        self.send(&ClientMessage::Release { pick_id });
    }

    fn load_state(&self, source: Box<dyn Read + Send>) {
        // Register the out-stream before the request goes out, so the
        // server finds it no matter how fast it reacts.
        let (stream_id, writer) = self.hub.open_out_stream();
        self.send(&ClientMessage::LoadState { stream_id });

        let spawned = thread::Builder::new().name("load-stream".into()).spawn(move || {
            let mut source = source;
            let mut writer = writer;
            if let Err(err) = io::copy(&mut source, &mut writer).and_then(|_| writer.flush()) {
                error!("uploading state failed: {err}");
            }
        });
        if let Err(err) = spawned {
            error!("could not spawn load-stream thread: {err}");
        }
    }

    fn save_state(&self, sink: Box<dyn Write + Send>, completion: Option<SaveCompletion>) {
        {
            let mut pending = self.shared.pending_save.lock().unwrap();
            if pending.is_some() {
                // One save at a time on the client side; the server answers
                // them strictly in order, so a second in-flight save would
                // race for the reply.
                error!("a save operation is already in progress");
                if let Some(completion) = completion {
                    completion(Err(SnapshotError::Io(io::Error::new(
                        io::ErrorKind::WouldBlock,
                        "save already in progress",
                    ))));
                }
                return;
            }
            *pending = Some(PendingSave { sink, completion });
        }
        self.send(&ClientMessage::SaveState);
    }
}
