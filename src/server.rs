//! The authoritative session server.
//!
//! Three kinds of threads cooperate:
//!
//! - the simulation thread runs the back-end in a tight loop with a 1 ms
//!   minimum period, sleeping on a condition variable while no client is
//!   connected (load/save requests wake it for a single iteration);
//! - one reader thread per TCP client parses messages and forwards them as
//!   events;
//! - the event loop thread owns the simulation front-end and all per-client
//!   state, so message handling is single-threaded like the rest of the
//!   session layer. The broadcast timer is a tick channel in the same
//!   `select!`, armed while at least one client is connected.
//!
//! Pick ids on the wire are client-allocated; the event loop translates
//! them to the authoritative ids the simulation hands out and keeps the
//! mapping until the client releases the pick or disconnects.

use std::collections::HashMap;
use std::io::{BufReader, BufWriter, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::path::PathBuf;
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{never, select, tick, unbounded, Receiver, Sender};
use log::{debug, error, info, warn};

use crate::interface::SimulationInterface;
use crate::protocol::{self, ClientMessage, ServerMessage};
use crate::simulation::types::{PickId, ReducedUnitStateArray, SessionId};
use crate::simulation::{Simulation, SimulationHandle};
use crate::snapshot::SnapshotError;
use crate::streams::StreamHub;

/// Minimum wall-clock period of one simulation tick.
const MIN_TICK: Duration = Duration::from_millis(1);

pub type ClientId = u32;

/// Administrative commands, dispatched from the server console.
#[derive(Debug)]
pub enum AdminCommand {
    /// Change the broadcast cadence; re-arms the timer if clients are
    /// connected.
    SetUpdateRate(f64),
    /// Server-side load of a snapshot file, starting a new session.
    LoadFile(PathBuf),
    /// Server-side save of the current state.
    SaveFile(PathBuf),
    Shutdown,
}

enum ServerEvent {
    Connected(ClientId, TcpStream),
    Disconnected(ClientId),
    Message(ClientId, ClientMessage),
    SessionChanged(SessionId),
    Admin(AdminCommand),
}

/// Pause flag for the simulation thread. `pause_after_io` re-arms the pause
/// after one iteration so a queued load/save can be consumed while no
/// clients are connected.
struct PauseControl {
    state: Mutex<PauseState>,
    condvar: Condvar,
}

struct PauseState {
    paused: bool,
    pause_after_io: bool,
    running: bool,
}

impl PauseControl {
    fn new() -> Self {
        Self {
            state: Mutex::new(PauseState {
                paused: true,
                pause_after_io: false,
                running: true,
            }),
            condvar: Condvar::new(),
        }
    }

    /// Blocks while paused. Returns `(running, slept)`; the caller resets
    /// its tick timer after a sleep.
    fn wait_if_paused(&self) -> (bool, bool) {
        let mut state = self.state.lock().unwrap();
        if state.pause_after_io {
            state.paused = true;
            state.pause_after_io = false;
        }
        let mut slept = false;
        while state.paused && state.running {
            slept = true;
            state = self.condvar.wait(state).unwrap();
        }
        (state.running, slept)
    }

    fn pause(&self) {
        self.state.lock().unwrap().paused = true;
    }

    fn unpause(&self) {
        let mut state = self.state.lock().unwrap();
        state.paused = false;
        state.pause_after_io = false;
        self.condvar.notify_one();
    }

    /// Wakes a paused simulation for exactly as long as it takes to consume
    /// a pending I/O request.
    fn wake_for_io(&self) {
        let mut state = self.state.lock().unwrap();
        if state.paused {
            state.paused = false;
            state.pause_after_io = true;
            self.condvar.notify_one();
        }
    }

    fn shutdown(&self) {
        let mut state = self.state.lock().unwrap();
        state.running = false;
        state.paused = false;
        self.condvar.notify_one();
    }
}

/// Handle to a running server: the admin surface.
pub struct ServerHandle {
    events: Sender<ServerEvent>,
    local_addr: SocketAddr,
}

impl ServerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn admin(&self, command: AdminCommand) {
        let _ = self.events.send(ServerEvent::Admin(command));
    }

    pub fn shutdown(&self) {
        self.admin(AdminCommand::Shutdown);
    }
}

pub struct Server;

impl Server {
    /// Starts the server: simulation thread (paused until the first client
    /// connects), accept thread, and event loop.
    pub fn start(
        simulation: Simulation,
        handle: SimulationHandle,
        bind: &str,
        update_rate: f64,
        hub: Arc<dyn StreamHub>,
    ) -> std::io::Result<ServerHandle> {
        let update_rate = if update_rate > 0.0 {
            update_rate
        } else {
            warn!("invalid update rate {update_rate}, falling back to 60 Hz");
            60.0
        };

        let listener = TcpListener::bind(bind)?;
        let local_addr = listener.local_addr()?;
        let (events_tx, events_rx) = unbounded();

        let pause = Arc::new(PauseControl::new());
        {
            let pause = Arc::clone(&pause);
            thread::Builder::new()
                .name("simulation".into())
                .spawn(move || simulation_thread(simulation, pause))?;
        }

        {
            let events = events_tx.clone();
            thread::Builder::new()
                .name("accept".into())
                .spawn(move || accept_thread(listener, events))?;
        }

        // Session changes surface on the back-end thread; forward them into
        // the event loop where the broadcast happens.
        {
            let events = events_tx.clone();
            handle.set_session_changed_callback(Some(Box::new(move |session_id| {
                let _ = events.send(ServerEvent::SessionChanged(session_id));
            })));
        }

        {
            let pause = Arc::clone(&pause);
            thread::Builder::new().name("server-events".into()).spawn(move || {
                let mut event_loop = EventLoop {
                    handle,
                    clients: HashMap::new(),
                    pause,
                    hub,
                    update_rate,
                    ticker: never(),
                    reduced: ReducedUnitStateArray::default(),
                };
                event_loop.run(events_rx);
            })?;
        }

        info!("listening on {local_addr}, update rate {update_rate} Hz");
        Ok(ServerHandle {
            events: events_tx,
            local_addr,
        })
    }
}

fn simulation_thread(mut simulation: Simulation, pause: Arc<PauseControl>) {
    let mut timer = Instant::now();
    loop {
        let (running, slept) = pause.wait_if_paused();
        if !running {
            break;
        }
        if slept {
            timer = Instant::now();
        }

        let now = Instant::now();
        let real_dt = (now - timer).as_secs_f32();
        timer = now;
        simulation.advance(real_dt);

        let elapsed = timer.elapsed();
        if elapsed < MIN_TICK {
            thread::sleep(MIN_TICK - elapsed);
        }
    }
    debug!("simulation thread stopped");
}

fn accept_thread(listener: TcpListener, events: Sender<ServerEvent>) {
    let mut next_client_id: ClientId = 0;
    for stream in listener.incoming() {
        match stream {
            Ok(stream) => {
                next_client_id += 1;
                let client_id = next_client_id;
                let events = events.clone();
                let spawned = thread::Builder::new()
                    .name(format!("client-{client_id}"))
                    .spawn(move || client_reader(client_id, stream, events));
                if let Err(err) = spawned {
                    error!("could not spawn client thread: {err}");
                }
            }
            Err(err) => {
                warn!("accept failed: {err}");
            }
        }
    }
}

fn client_reader(client_id: ClientId, stream: TcpStream, events: Sender<ServerEvent>) {
    let _ = stream.set_nodelay(true);
    let mut reader = BufReader::new(stream);

    if let Err(err) = protocol::read_hello(&mut reader) {
        warn!("client {client_id} failed the protocol hello: {err}");
        return;
    }
    let write_half = match reader.get_ref().try_clone() {
        Ok(stream) => stream,
        Err(err) => {
            warn!("client {client_id}: could not clone socket: {err}");
            return;
        }
    };
    if events
        .send(ServerEvent::Connected(client_id, write_half))
        .is_err()
    {
        return;
    }

    loop {
        match ClientMessage::read_from(&mut reader) {
            Ok(message) => {
                if events.send(ServerEvent::Message(client_id, message)).is_err() {
                    return;
                }
            }
            Err(err) => {
                // A decode failure drops this connection; everyone else is
                // unaffected.
                debug!("client {client_id} disconnected: {err}");
                break;
            }
        }
    }
    let _ = events.send(ServerEvent::Disconnected(client_id));
}

struct ClientState {
    conn: TcpStream,
    /// client-allocated pick id -> authoritative pick id
    pick_map: HashMap<PickId, PickId>,
}

struct EventLoop {
    handle: SimulationHandle,
    clients: HashMap<ClientId, ClientState>,
    pause: Arc<PauseControl>,
    hub: Arc<dyn StreamHub>,
    update_rate: f64,
    ticker: Receiver<Instant>,
    reduced: ReducedUnitStateArray,
}

impl EventLoop {
    fn run(&mut self, events: Receiver<ServerEvent>) {
        loop {
            // Cloned so a handler can swap `self.ticker` (rate change,
            // last client gone) without fighting the borrow in `select!`.
            let ticker = self.ticker.clone();
            select! {
                recv(events) -> event => match event {
                    Ok(event) => {
                        if !self.handle_event(event) {
                            break;
                        }
                    }
                    Err(_) => break,
                },
                recv(ticker) -> _ => self.broadcast_update(),
            }
        }
        self.pause.shutdown();
        info!("server event loop stopped");
    }

    fn handle_event(&mut self, event: ServerEvent) -> bool {
        match event {
            ServerEvent::Connected(client_id, conn) => self.client_connected(client_id, conn),
            ServerEvent::Disconnected(client_id) => self.client_disconnected(client_id),
            ServerEvent::Message(client_id, message) => self.handle_message(client_id, message),
            ServerEvent::SessionChanged(session_id) => {
                info!("session changed to {session_id}");
                let bytes = self.session_update_message().encode();
                self.broadcast(&bytes);
            }
            ServerEvent::Admin(command) => return self.handle_admin(command),
        }
        true
    }

    fn client_connected(&mut self, client_id: ClientId, conn: TcpStream) {
        if self.clients.is_empty() {
            info!("first client connected, unpausing simulation");
            self.pause.unpause();
            self.ticker = tick(update_interval(self.update_rate));
        }
        info!("client {client_id} connected");

        let mut client = ClientState {
            conn,
            pick_map: HashMap::new(),
        };
        send(
            &mut client.conn,
            &ServerMessage::SetParameters(self.handle.get_parameters()).encode(),
        );
        if self.handle.is_session_valid() {
            let bytes = self.session_update_message().encode();
            send(&mut client.conn, &bytes);
        }
        self.clients.insert(client_id, client);
    }

    fn client_disconnected(&mut self, client_id: ClientId) {
        if let Some(client) = self.clients.remove(&client_id) {
            info!("client {client_id} disconnected");
            // Whatever the client still held goes back to free motion.
            for (_, server_pick) in client.pick_map {
                self.handle.release(server_pick);
            }
        }
        if self.clients.is_empty() {
            info!("last client disconnected, pausing simulation");
            self.pause.pause();
            self.ticker = never();
        }
    }

    fn handle_message(&mut self, client_id: ClientId, message: ClientMessage) {
        match message {
            ClientMessage::SetParameters(parameters) => {
                self.handle.set_parameters(parameters);
                // Everyone else learns about the change.
                let bytes = ServerMessage::SetParameters(parameters).encode();
                self.broadcast_except(client_id, &bytes);
            }
            ClientMessage::PointPick {
                pick_id,
                position,
                radius,
                orientation,
                connected,
            } => {
                let server_pick = self.handle.pick_point(position, radius, orientation, connected);
                self.map_pick(client_id, pick_id, server_pick);
            }
            ClientMessage::RayPick {
                pick_id,
                position,
                direction,
                orientation,
                connected,
            } => {
                let server_pick = self.handle.pick_ray(position, direction, orientation, connected);
                self.map_pick(client_id, pick_id, server_pick);
            }
            ClientMessage::PasteUnit {
                pick_id,
                position,
                orientation,
                linear_velocity,
                angular_velocity,
            } => {
                let server_pick =
                    self.handle.paste(position, orientation, linear_velocity, angular_velocity);
                self.map_pick(client_id, pick_id, server_pick);
            }
            ClientMessage::CreateUnit {
                pick_id,
                unit_type,
                position,
                orientation,
                linear_velocity,
                angular_velocity,
            } => {
                // A create without a known mapping (the client reused an id
                // it released, or never picked) starts a fresh pick.
                let server_pick = match self.translate(client_id, pick_id) {
                    Some(server_pick) => server_pick,
                    None => {
                        let server_pick = self.handle.allocate_pick_id();
                        self.map_pick(client_id, pick_id, server_pick);
                        server_pick
                    }
                };
                self.handle.create(
                    server_pick,
                    unit_type,
                    position,
                    orientation,
                    linear_velocity,
                    angular_velocity,
                );
            }
            ClientMessage::SetUnitState {
                pick_id,
                position,
                orientation,
                linear_velocity,
                angular_velocity,
            } => {
                if let Some(server_pick) = self.translate(client_id, pick_id) {
                    self.handle.set_state(
                        server_pick,
                        position,
                        orientation,
                        linear_velocity,
                        angular_velocity,
                    );
                }
            }
            ClientMessage::CopyUnit { pick_id } => {
                if let Some(server_pick) = self.translate(client_id, pick_id) {
                    self.handle.copy(server_pick);
                }
            }
            ClientMessage::DestroyUnit { pick_id } => {
                if let Some(server_pick) = self.translate(client_id, pick_id) {
                    self.handle.destroy(server_pick);
                }
            }
            ClientMessage::Release { pick_id } => {
                let removed = self
                    .clients
                    .get_mut(&client_id)
                    .and_then(|client| client.pick_map.remove(&pick_id));
                if let Some(server_pick) = removed {
                    self.handle.release(server_pick);
                }
            }
            ClientMessage::LoadState { stream_id } => match self.hub.accept_in_stream(stream_id) {
                Ok(source) => {
                    self.broadcast(&ServerMessage::SessionInvalid.encode());
                    self.handle.load_state(source);
                    self.pause.wake_for_io();
                }
                Err(err) => {
                    warn!("client {client_id}: load stream {stream_id} unavailable: {err}");
                }
            },
            ClientMessage::SaveState => {
                let (stream_id, sink) = self.hub.open_out_stream();
                if let Some(client) = self.clients.get_mut(&client_id) {
                    send(
                        &mut client.conn,
                        &ServerMessage::SaveStateReply { stream_id }.encode(),
                    );
                }
                self.handle.save_state(
                    sink,
                    Some(Box::new(move |result| {
                        if let Err(err) = result {
                            error!("save for stream {stream_id} failed: {err}");
                        }
                    })),
                );
                self.pause.wake_for_io();
            }
        }
    }

    fn handle_admin(&mut self, command: AdminCommand) -> bool {
        match command {
            AdminCommand::SetUpdateRate(rate) => {
                if rate > 0.0 {
                    self.update_rate = rate;
                    if !self.clients.is_empty() {
                        self.ticker = tick(update_interval(rate));
                    }
                    info!("update rate set to {rate} Hz");
                } else {
                    warn!("invalid simulation update rate {rate} requested");
                }
            }
            AdminCommand::LoadFile(path) => match std::fs::File::open(&path) {
                Ok(file) => {
                    info!("loading {}", path.display());
                    self.broadcast(&ServerMessage::SessionInvalid.encode());
                    self.handle.load_state(Box::new(BufReader::new(file)));
                    self.pause.wake_for_io();
                }
                Err(err) => {
                    error!("could not open {}: {err}", path.display());
                }
            },
            AdminCommand::SaveFile(path) => match std::fs::File::create(&path) {
                Ok(file) => {
                    info!("saving to {}", path.display());
                    let name = path.display().to_string();
                    self.handle.save_state(
                        Box::new(BufWriter::new(file)),
                        Some(Box::new(move |result: Result<(), SnapshotError>| {
                            match result {
                                Ok(()) => info!("saved {name}"),
                                Err(err) => error!("saving {name} failed: {err}"),
                            }
                        })),
                    );
                    self.pause.wake_for_io();
                }
                Err(err) => {
                    error!("could not create {}: {err}", path.display());
                }
            },
            AdminCommand::Shutdown => return false,
        }
        true
    }

    fn map_pick(&mut self, client_id: ClientId, client_pick: PickId, server_pick: PickId) {
        if let Some(client) = self.clients.get_mut(&client_id) {
            client.pick_map.insert(client_pick, server_pick);
        }
    }

    fn translate(&self, client_id: ClientId, client_pick: PickId) -> Option<PickId> {
        self.clients
            .get(&client_id)?
            .pick_map
            .get(&client_pick)
            .copied()
    }

    fn session_update_message(&self) -> ServerMessage {
        ServerMessage::SessionUpdate {
            session_id: self.handle.session_id(),
            domain: self.handle.domain(),
            unit_types: (*self.handle.unit_types()).clone(),
        }
    }

    /// Broadcasts the newest valid state, reduced for transport.
    fn broadcast_update(&mut self) {
        if self.handle.lock_new_state() && self.handle.is_locked_state_valid() {
            self.handle.locked_state().reduce_into(&mut self.reduced);
            let bytes = ServerMessage::SimulationUpdate(self.reduced.clone()).encode();
            self.broadcast(&bytes);
        }
    }

    fn broadcast(&mut self, bytes: &[u8]) {
        for client in self.clients.values_mut() {
            send(&mut client.conn, bytes);
        }
    }

    fn broadcast_except(&mut self, skip: ClientId, bytes: &[u8]) {
        for (&client_id, client) in self.clients.iter_mut() {
            if client_id != skip {
                send(&mut client.conn, bytes);
            }
        }
    }
}

fn update_interval(rate: f64) -> Duration {
    Duration::from_secs_f64(1.0 / rate)
}

fn send(conn: &mut TcpStream, bytes: &[u8]) {
    // Write errors surface as a disconnect on the client's reader thread;
    // here they are only worth a note.
    if let Err(err) = conn.write_all(bytes) {
        debug!("send failed: {err}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::RemoteSimulation;
    use crate::config::{SimulationConfig, UnitTypeConfig};
    use crate::simulation::domain::Domain;
    use crate::streams::ChannelStreamHub;
    use glam::{Quat, Vec3};
    use std::sync::mpsc;
    use std::time::Duration;

    fn test_config() -> SimulationConfig {
        let mut config = SimulationConfig::default();
        config.domain = Domain::new(Vec3::ZERO, Vec3::splat(10.0));
        config.simulation_update_rate = 120.0;
        config.structural_unit_types = vec![UnitTypeConfig {
            name: "probe".into(),
            radius: 1.0,
            mass: 1.0,
            moment_of_inertia: [[0.4, 0.0, 0.0], [0.0, 0.4, 0.0], [0.0, 0.0, 0.4]],
            bond_sites: vec![Vec3::X, -Vec3::X],
            mesh_vertices: vec![Vec3::X, Vec3::Y, Vec3::Z],
            mesh_triangles: vec![0, 1, 2],
        }];
        config
    }

    fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(10);
        while !condition() {
            assert!(Instant::now() < deadline, "timed out waiting for {what}");
            thread::sleep(Duration::from_millis(5));
        }
    }

    fn start_test_server(hub: Arc<ChannelStreamHub>) -> ServerHandle {
        let config = test_config();
        let (simulation, handle) = Simulation::new(&config);
        Server::start(simulation, handle, "127.0.0.1:0", 120.0, hub).unwrap()
    }

    #[test]
    fn client_receives_session_and_state_updates() {
        let _ = env_logger::builder().is_test(true).try_init();
        let hub = Arc::new(ChannelStreamHub::new());
        let server = start_test_server(Arc::clone(&hub));

        let mut client =
            RemoteSimulation::connect(server.local_addr(), hub as Arc<dyn StreamHub>).unwrap();
        wait_until("session update", || client.is_session_valid());
        assert_eq!(client.unit_types().len(), 1);
        assert_eq!(client.domain().max, Vec3::splat(10.0));

        // Create one unit and watch it arrive in a broadcast.
        let pick = client.pick_point(Vec3::splat(4.0), 0.2, Quat::IDENTITY, false);
        client.create(pick, 0, Vec3::splat(5.0), Quat::IDENTITY, Vec3::ZERO, Vec3::ZERO);
        wait_until("one unit in broadcast state", || {
            client.lock_new_state();
            client.is_locked_state_valid() && client.locked_reduced_state().states.len() == 1
        });
        let state = client.locked_reduced_state().states[0];
        assert!((state.position - Vec3::splat(5.0)).length() < 0.5);

        server.shutdown();
    }

    #[test]
    fn pick_id_translation_survives_release_and_reuse() {
        let _ = env_logger::builder().is_test(true).try_init();
        let hub = Arc::new(ChannelStreamHub::new());
        let server = start_test_server(Arc::clone(&hub));

        let mut client =
            RemoteSimulation::connect(server.local_addr(), hub as Arc<dyn StreamHub>).unwrap();
        wait_until("session update", || client.is_session_valid());

        // Pick in empty space; the mapping exists even though nothing was
        // grabbed, and the create below reuses it.
        let local = client.pick_point(Vec3::splat(2.0), 0.2, Quat::IDENTITY, false);
        client.create(local, 0, Vec3::splat(2.0), Quat::IDENTITY, Vec3::ZERO, Vec3::ZERO);
        wait_until("first unit", || {
            client.lock_new_state();
            client.is_locked_state_valid() && client.locked_reduced_state().states.len() == 1
        });

        // Release drops the mapping; reusing the same local id afterwards
        // must act as a brand-new pick and create a second unit.
        client.release(local);
        client.create(local, 0, Vec3::splat(7.0), Quat::IDENTITY, Vec3::ZERO, Vec3::ZERO);
        wait_until("second unit", || {
            client.lock_new_state();
            client.is_locked_state_valid() && client.locked_reduced_state().states.len() == 2
        });

        server.shutdown();
    }

    #[test]
    fn save_and_load_round_trip_over_the_session_layer() {
        let _ = env_logger::builder().is_test(true).try_init();
        let hub = Arc::new(ChannelStreamHub::new());
        let server = start_test_server(Arc::clone(&hub));

        let mut client = RemoteSimulation::connect(
            server.local_addr(),
            Arc::clone(&hub) as Arc<dyn StreamHub>,
        )
        .unwrap();
        wait_until("session update", || client.is_session_valid());
        let first_session = client.session_id();

        let pick = client.pick_point(Vec3::splat(3.0), 0.2, Quat::IDENTITY, false);
        client.create(pick, 0, Vec3::splat(3.0), Quat::IDENTITY, Vec3::ZERO, Vec3::ZERO);
        client.release(pick);
        wait_until("unit broadcast", || {
            client.lock_new_state();
            client.is_locked_state_valid() && client.locked_reduced_state().states.len() == 1
        });

        // Save through the stream substrate into a shared buffer.
        let buffer = Arc::new(Mutex::new(Vec::new()));
        struct SharedSink(Arc<Mutex<Vec<u8>>>);
        impl Write for SharedSink {
            fn write(&mut self, data: &[u8]) -> std::io::Result<usize> {
                self.0.lock().unwrap().extend_from_slice(data);
                Ok(data.len())
            }
            fn flush(&mut self) -> std::io::Result<()> {
                Ok(())
            }
        }
        let (done_tx, done_rx) = mpsc::channel();
        client.save_state(
            Box::new(SharedSink(Arc::clone(&buffer))),
            Some(Box::new(move |result| {
                done_tx.send(result.is_ok()).unwrap();
            })),
        );
        assert_eq!(done_rx.recv_timeout(Duration::from_secs(10)), Ok(true));
        let bytes = buffer.lock().unwrap().clone();
        assert!(!bytes.is_empty());

        // Load the bytes back; the server starts a new session and the
        // restored unit survives.
        client.load_state(Box::new(std::io::Cursor::new(bytes)));
        wait_until("new session", || {
            client.is_session_valid() && client.session_id() != first_session
        });
        wait_until("restored unit", || {
            client.lock_new_state();
            client.is_locked_state_valid() && client.locked_reduced_state().states.len() == 1
        });

        server.shutdown();
    }
}
