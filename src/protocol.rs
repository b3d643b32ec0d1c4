//! The client-server session protocol.
//!
//! Framing: a connection opens with a fixed hello (protocol name and
//! version), after which each side sends a stream of messages, each a `u16`
//! message id followed by the message body. Bodies are fixed field
//! sequences over the wire atoms in [`crate::wire`]; variable-length parts
//! carry their own length prefixes. Backward-incompatible changes must bump
//! the major half of [`PROTOCOL_VERSION`].

use std::io::{Read, Write};

use glam::{Quat, Vec3};
use thiserror::Error;

use crate::interface::Parameters;
use crate::simulation::domain::Domain;
use crate::simulation::types::{
    PickId, ReducedUnitStateArray, SessionId, UnitType, UnitTypeId,
};
use crate::streams::StreamId;
use crate::wire::{WireRead, WireWrite};

pub const PROTOCOL_NAME: &[u8; 3] = b"NCK";
/// Major version in the upper 16 bits, minor in the lower.
pub const PROTOCOL_VERSION: u32 = 2 << 16;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("unknown message id {0}")]
    UnknownMessage(u16),
    #[error("peer speaks protocol {name:?}, expected {expected:?}")]
    WrongProtocol { name: [u8; 3], expected: [u8; 3] },
    #[error("peer speaks protocol version {0:#x}, expected {PROTOCOL_VERSION:#x}")]
    WrongVersion(u32),
}

/// Message ids sent by clients.
mod client_id {
    pub const SET_PARAMETERS: u16 = 0;
    pub const POINT_PICK: u16 = 1;
    pub const RAY_PICK: u16 = 2;
    pub const PASTE_UNIT: u16 = 3;
    pub const CREATE_UNIT: u16 = 4;
    pub const SET_UNIT_STATE: u16 = 5;
    pub const COPY_UNIT: u16 = 6;
    pub const DESTROY_UNIT: u16 = 7;
    pub const RELEASE: u16 = 8;
    pub const LOAD_STATE: u16 = 9;
    pub const SAVE_STATE: u16 = 10;
}

/// Message ids sent by servers.
mod server_id {
    pub const SESSION_INVALID: u16 = 0;
    pub const SESSION_UPDATE: u16 = 1;
    pub const SET_PARAMETERS: u16 = 2;
    pub const SIMULATION_UPDATE: u16 = 3;
    pub const SAVE_STATE_REPLY: u16 = 4;
}

/// Writes the connection hello. Sent by clients immediately after connect.
pub fn write_hello<W: Write + ?Sized>(w: &mut W) -> Result<(), ProtocolError> {
    w.write_all(PROTOCOL_NAME)?;
    PROTOCOL_VERSION.write_wire(w)?;
    Ok(())
}

/// Reads and checks the connection hello.
pub fn read_hello<R: Read + ?Sized>(r: &mut R) -> Result<(), ProtocolError> {
    let mut name = [0u8; 3];
    r.read_exact(&mut name)?;
    if &name != PROTOCOL_NAME {
        return Err(ProtocolError::WrongProtocol {
            name,
            expected: *PROTOCOL_NAME,
        });
    }
    let version = u32::read_wire(r)?;
    if version >> 16 != PROTOCOL_VERSION >> 16 {
        return Err(ProtocolError::WrongVersion(version));
    }
    Ok(())
}

/// Messages from clients to the server.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    SetParameters(Parameters),
    PointPick {
        pick_id: PickId,
        position: Vec3,
        radius: f32,
        orientation: Quat,
        connected: bool,
    },
    RayPick {
        pick_id: PickId,
        position: Vec3,
        direction: Vec3,
        orientation: Quat,
        connected: bool,
    },
    PasteUnit {
        pick_id: PickId,
        position: Vec3,
        orientation: Quat,
        linear_velocity: Vec3,
        angular_velocity: Vec3,
    },
    CreateUnit {
        pick_id: PickId,
        unit_type: UnitTypeId,
        position: Vec3,
        orientation: Quat,
        linear_velocity: Vec3,
        angular_velocity: Vec3,
    },
    SetUnitState {
        pick_id: PickId,
        position: Vec3,
        orientation: Quat,
        linear_velocity: Vec3,
        angular_velocity: Vec3,
    },
    CopyUnit { pick_id: PickId },
    DestroyUnit { pick_id: PickId },
    Release { pick_id: PickId },
    LoadState { stream_id: StreamId },
    SaveState,
}

impl ClientMessage {
    pub fn write_to<W: Write + ?Sized>(&self, w: &mut W) -> Result<(), ProtocolError> {
        match self {
            ClientMessage::SetParameters(parameters) => {
                client_id::SET_PARAMETERS.write_wire(w)?;
                parameters.write_wire(w)?;
            }
            ClientMessage::PointPick {
                pick_id,
                position,
                radius,
                orientation,
                connected,
            } => {
                client_id::POINT_PICK.write_wire(w)?;
                pick_id.write_wire(w)?;
                position.write_wire(w)?;
                radius.write_wire(w)?;
                orientation.write_wire(w)?;
                connected.write_wire(w)?;
            }
            ClientMessage::RayPick {
                pick_id,
                position,
                direction,
                orientation,
                connected,
            } => {
                client_id::RAY_PICK.write_wire(w)?;
                pick_id.write_wire(w)?;
                position.write_wire(w)?;
                direction.write_wire(w)?;
                orientation.write_wire(w)?;
                connected.write_wire(w)?;
            }
            ClientMessage::PasteUnit {
                pick_id,
                position,
                orientation,
                linear_velocity,
                angular_velocity,
            } => {
                client_id::PASTE_UNIT.write_wire(w)?;
                pick_id.write_wire(w)?;
                position.write_wire(w)?;
                orientation.write_wire(w)?;
                linear_velocity.write_wire(w)?;
                angular_velocity.write_wire(w)?;
            }
            ClientMessage::CreateUnit {
                pick_id,
                unit_type,
                position,
                orientation,
                linear_velocity,
                angular_velocity,
            } => {
                client_id::CREATE_UNIT.write_wire(w)?;
                pick_id.write_wire(w)?;
                unit_type.write_wire(w)?;
                position.write_wire(w)?;
                orientation.write_wire(w)?;
                linear_velocity.write_wire(w)?;
                angular_velocity.write_wire(w)?;
            }
            ClientMessage::SetUnitState {
                pick_id,
                position,
                orientation,
                linear_velocity,
                angular_velocity,
            } => {
                client_id::SET_UNIT_STATE.write_wire(w)?;
                pick_id.write_wire(w)?;
                position.write_wire(w)?;
                orientation.write_wire(w)?;
                linear_velocity.write_wire(w)?;
                angular_velocity.write_wire(w)?;
            }
            ClientMessage::CopyUnit { pick_id } => {
                client_id::COPY_UNIT.write_wire(w)?;
                pick_id.write_wire(w)?;
            }
            ClientMessage::DestroyUnit { pick_id } => {
                client_id::DESTROY_UNIT.write_wire(w)?;
                pick_id.write_wire(w)?;
            }
            ClientMessage::Release { pick_id } => {
                client_id::RELEASE.write_wire(w)?;
                pick_id.write_wire(w)?;
            }
            ClientMessage::LoadState { stream_id } => {
                client_id::LOAD_STATE.write_wire(w)?;
                stream_id.write_wire(w)?;
            }
            ClientMessage::SaveState => {
                client_id::SAVE_STATE.write_wire(w)?;
            }
        }
        Ok(())
    }

    pub fn read_from<R: Read + ?Sized>(r: &mut R) -> Result<Self, ProtocolError> {
        let message_id = u16::read_wire(r)?;
        let message = match message_id {
            client_id::SET_PARAMETERS => ClientMessage::SetParameters(Parameters::read_wire(r)?),
            client_id::POINT_PICK => ClientMessage::PointPick {
                pick_id: PickId::read_wire(r)?,
                position: Vec3::read_wire(r)?,
                radius: f32::read_wire(r)?,
                orientation: Quat::read_wire(r)?,
                connected: bool::read_wire(r)?,
            },
            client_id::RAY_PICK => ClientMessage::RayPick {
                pick_id: PickId::read_wire(r)?,
                position: Vec3::read_wire(r)?,
                direction: Vec3::read_wire(r)?,
                orientation: Quat::read_wire(r)?,
                connected: bool::read_wire(r)?,
            },
            client_id::PASTE_UNIT => ClientMessage::PasteUnit {
                pick_id: PickId::read_wire(r)?,
                position: Vec3::read_wire(r)?,
                orientation: Quat::read_wire(r)?,
                linear_velocity: Vec3::read_wire(r)?,
                angular_velocity: Vec3::read_wire(r)?,
            },
            client_id::CREATE_UNIT => ClientMessage::CreateUnit {
                pick_id: PickId::read_wire(r)?,
                unit_type: UnitTypeId::read_wire(r)?,
                position: Vec3::read_wire(r)?,
                orientation: Quat::read_wire(r)?,
                linear_velocity: Vec3::read_wire(r)?,
                angular_velocity: Vec3::read_wire(r)?,
            },
            client_id::SET_UNIT_STATE => ClientMessage::SetUnitState {
                pick_id: PickId::read_wire(r)?,
                position: Vec3::read_wire(r)?,
                orientation: Quat::read_wire(r)?,
                linear_velocity: Vec3::read_wire(r)?,
                angular_velocity: Vec3::read_wire(r)?,
            },
            client_id::COPY_UNIT => ClientMessage::CopyUnit {
                pick_id: PickId::read_wire(r)?,
            },
            client_id::DESTROY_UNIT => ClientMessage::DestroyUnit {
                pick_id: PickId::read_wire(r)?,
            },
            client_id::RELEASE => ClientMessage::Release {
                pick_id: PickId::read_wire(r)?,
            },
            client_id::LOAD_STATE => ClientMessage::LoadState {
                stream_id: StreamId::read_wire(r)?,
            },
            client_id::SAVE_STATE => ClientMessage::SaveState,
            other => return Err(ProtocolError::UnknownMessage(other)),
        };
        Ok(message)
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut bytes = Vec::new();
        self.write_to(&mut bytes)
            .expect("writing to a Vec cannot fail");
        bytes
    }
}

/// Messages from the server to clients.
#[derive(Debug, Clone)]
pub enum ServerMessage {
    SessionInvalid,
    SessionUpdate {
        session_id: SessionId,
        domain: Domain,
        unit_types: Vec<UnitType>,
    },
    SetParameters(Parameters),
    SimulationUpdate(ReducedUnitStateArray),
    SaveStateReply { stream_id: StreamId },
}

impl ServerMessage {
    pub fn write_to<W: Write + ?Sized>(&self, w: &mut W) -> Result<(), ProtocolError> {
        match self {
            ServerMessage::SessionInvalid => {
                server_id::SESSION_INVALID.write_wire(w)?;
            }
            ServerMessage::SessionUpdate {
                session_id,
                domain,
                unit_types,
            } => {
                server_id::SESSION_UPDATE.write_wire(w)?;
                session_id.write_wire(w)?;
                domain.write_wire(w)?;
                unit_types.write_wire(w)?;
            }
            ServerMessage::SetParameters(parameters) => {
                server_id::SET_PARAMETERS.write_wire(w)?;
                parameters.write_wire(w)?;
            }
            ServerMessage::SimulationUpdate(states) => {
                server_id::SIMULATION_UPDATE.write_wire(w)?;
                states.session_id.write_wire(w)?;
                states.time_stamp.write_wire(w)?;
                states.states.write_wire(w)?;
            }
            ServerMessage::SaveStateReply { stream_id } => {
                server_id::SAVE_STATE_REPLY.write_wire(w)?;
                stream_id.write_wire(w)?;
            }
        }
        Ok(())
    }

    pub fn read_from<R: Read + ?Sized>(r: &mut R) -> Result<Self, ProtocolError> {
        let message_id = u16::read_wire(r)?;
        let message = match message_id {
            server_id::SESSION_INVALID => ServerMessage::SessionInvalid,
            server_id::SESSION_UPDATE => ServerMessage::SessionUpdate {
                session_id: SessionId::read_wire(r)?,
                domain: Domain::read_wire(r)?,
                unit_types: Vec::read_wire(r)?,
            },
            server_id::SET_PARAMETERS => ServerMessage::SetParameters(Parameters::read_wire(r)?),
            server_id::SIMULATION_UPDATE => {
                ServerMessage::SimulationUpdate(ReducedUnitStateArray {
                    session_id: SessionId::read_wire(r)?,
                    time_stamp: u32::read_wire(r)?,
                    states: Vec::read_wire(r)?,
                })
            }
            server_id::SAVE_STATE_REPLY => ServerMessage::SaveStateReply {
                stream_id: StreamId::read_wire(r)?,
            },
            other => return Err(ProtocolError::UnknownMessage(other)),
        };
        Ok(message)
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut bytes = Vec::new();
        self.write_to(&mut bytes)
            .expect("writing to a Vec cannot fail");
        bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulation::types::ReducedUnitState;

    fn client_round_trip(message: ClientMessage) -> ClientMessage {
        let bytes = message.encode();
        let mut cursor = bytes.as_slice();
        let decoded = ClientMessage::read_from(&mut cursor).unwrap();
        assert!(cursor.is_empty());
        decoded
    }

    #[test]
    fn hello_round_trips() {
        let mut bytes = Vec::new();
        write_hello(&mut bytes).unwrap();
        assert_eq!(&bytes[..3], b"NCK");
        read_hello(&mut bytes.as_slice()).unwrap();
    }

    #[test]
    fn hello_rejects_other_protocols_and_major_versions() {
        let mut bytes = Vec::new();
        write_hello(&mut bytes).unwrap();
        bytes[0] = b'X';
        assert!(matches!(
            read_hello(&mut bytes.as_slice()),
            Err(ProtocolError::WrongProtocol { .. })
        ));

        let mut bytes = Vec::new();
        bytes.extend_from_slice(PROTOCOL_NAME);
        (3u32 << 16).write_wire(&mut bytes).unwrap();
        assert!(matches!(
            read_hello(&mut bytes.as_slice()),
            Err(ProtocolError::WrongVersion(_))
        ));
    }

    #[test]
    fn client_messages_round_trip() {
        let messages = vec![
            ClientMessage::SetParameters(Parameters {
                linear_dampening: 0.5,
                angular_dampening: 0.25,
                attenuation: 0.9,
                time_factor: 10.0,
            }),
            ClientMessage::PointPick {
                pick_id: 0x42,
                position: Vec3::new(1.0, 2.0, 3.0),
                radius: 0.5,
                orientation: Quat::from_rotation_y(0.3),
                connected: true,
            },
            ClientMessage::RayPick {
                pick_id: 7,
                position: Vec3::ZERO,
                direction: Vec3::Z,
                orientation: Quat::IDENTITY,
                connected: false,
            },
            ClientMessage::PasteUnit {
                pick_id: 11,
                position: Vec3::new(8.0, 1.0, 2.0),
                orientation: Quat::from_rotation_z(1.2),
                linear_velocity: Vec3::NEG_Y,
                angular_velocity: Vec3::ZERO,
            },
            ClientMessage::CreateUnit {
                pick_id: 3,
                unit_type: 1,
                position: Vec3::splat(5.0),
                orientation: Quat::IDENTITY,
                linear_velocity: Vec3::X,
                angular_velocity: Vec3::Y,
            },
            ClientMessage::SetUnitState {
                pick_id: 3,
                position: Vec3::new(1.0, 1.0, 1.0),
                orientation: Quat::from_rotation_x(0.1),
                linear_velocity: Vec3::Z,
                angular_velocity: Vec3::X,
            },
            ClientMessage::CopyUnit { pick_id: 9 },
            ClientMessage::DestroyUnit { pick_id: 4 },
            ClientMessage::Release { pick_id: 9 },
            ClientMessage::LoadState { stream_id: 77 },
            ClientMessage::SaveState,
        ];
        for message in messages {
            assert_eq!(client_round_trip(message.clone()), message);
        }
    }

    #[test]
    fn simulation_update_round_trips() {
        let mut states = ReducedUnitStateArray::default();
        states.session_id = 5;
        states.time_stamp = 1234;
        states.states.push(ReducedUnitState {
            unit_type: 1,
            position: Vec3::new(4.0, 5.0, 6.0),
            orientation: Quat::from_rotation_x(0.7),
        });

        let bytes = ServerMessage::SimulationUpdate(states.clone()).encode();
        match ServerMessage::read_from(&mut bytes.as_slice()).unwrap() {
            ServerMessage::SimulationUpdate(decoded) => {
                assert_eq!(decoded.session_id, 5);
                assert_eq!(decoded.time_stamp, 1234);
                assert_eq!(decoded.states, states.states);
            }
            other => panic!("decoded wrong message: {other:?}"),
        }
    }

    #[test]
    fn unknown_ids_are_protocol_errors() {
        let bytes = 999u16.to_le_bytes();
        assert!(matches!(
            ClientMessage::read_from(&mut bytes.as_slice()),
            Err(ProtocolError::UnknownMessage(999))
        ));
    }
}
