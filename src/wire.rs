//! Little-endian marshalling of the types that cross process boundaries.
//!
//! Both the snapshot file format and the network protocol are pinned
//! byte-for-byte: primitives are little-endian, lengths (`u32`) precede
//! variable-length sequences, strings are length-prefixed UTF-8. The impls
//! here are the single source of truth for those layouts; the snapshot codec
//! and the protocol layer both build on them.

use std::io::{self, Read, Write};

use glam::{Mat3, Quat, Vec3};

use crate::interface::Parameters;
use crate::simulation::bonds::Bond;
use crate::simulation::domain::Domain;
use crate::simulation::types::{BondSite, ReducedUnitState, UnitState, UnitType};

/// Upper bound on decoded sequence lengths. A corrupt or hostile length
/// prefix must not be allowed to drive a huge allocation.
pub const MAX_SEQUENCE_LEN: u32 = 1 << 24;

pub trait WireWrite {
    fn write_wire<W: Write + ?Sized>(&self, w: &mut W) -> io::Result<()>;
}

pub trait WireRead: Sized {
    fn read_wire<R: Read + ?Sized>(r: &mut R) -> io::Result<Self>;
}

fn oversized_sequence(len: u32) -> io::Error {
    io::Error::new(
        io::ErrorKind::InvalidData,
        format!("sequence length {len} exceeds limit"),
    )
}

macro_rules! wire_primitive {
    ($ty:ty) => {
        impl WireWrite for $ty {
            fn write_wire<W: Write + ?Sized>(&self, w: &mut W) -> io::Result<()> {
                w.write_all(&self.to_le_bytes())
            }
        }
        impl WireRead for $ty {
            fn read_wire<R: Read + ?Sized>(r: &mut R) -> io::Result<Self> {
                let mut buf = [0u8; std::mem::size_of::<$ty>()];
                r.read_exact(&mut buf)?;
                Ok(<$ty>::from_le_bytes(buf))
            }
        }
    };
}

wire_primitive!(u8);
wire_primitive!(u16);
wire_primitive!(u32);
wire_primitive!(u64);
wire_primitive!(f32);
wire_primitive!(f64);

impl WireWrite for bool {
    fn write_wire<W: Write + ?Sized>(&self, w: &mut W) -> io::Result<()> {
        (*self as u8).write_wire(w)
    }
}

impl WireRead for bool {
    fn read_wire<R: Read + ?Sized>(r: &mut R) -> io::Result<Self> {
        Ok(u8::read_wire(r)? != 0)
    }
}

impl WireWrite for String {
    fn write_wire<W: Write + ?Sized>(&self, w: &mut W) -> io::Result<()> {
        (self.len() as u32).write_wire(w)?;
        w.write_all(self.as_bytes())
    }
}

impl WireRead for String {
    fn read_wire<R: Read + ?Sized>(r: &mut R) -> io::Result<Self> {
        let len = u32::read_wire(r)?;
        if len > MAX_SEQUENCE_LEN {
            return Err(oversized_sequence(len));
        }
        let mut bytes = vec![0u8; len as usize];
        r.read_exact(&mut bytes)?;
        String::from_utf8(bytes)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "string is not valid UTF-8"))
    }
}

impl<T: WireWrite> WireWrite for Vec<T> {
    fn write_wire<W: Write + ?Sized>(&self, w: &mut W) -> io::Result<()> {
        (self.len() as u32).write_wire(w)?;
        for item in self {
            item.write_wire(w)?;
        }
        Ok(())
    }
}

impl<T: WireRead> WireRead for Vec<T> {
    fn read_wire<R: Read + ?Sized>(r: &mut R) -> io::Result<Self> {
        let len = u32::read_wire(r)?;
        if len > MAX_SEQUENCE_LEN {
            return Err(oversized_sequence(len));
        }
        let mut items = Vec::with_capacity(len as usize);
        for _ in 0..len {
            items.push(T::read_wire(r)?);
        }
        Ok(items)
    }
}

impl WireWrite for Vec3 {
    fn write_wire<W: Write + ?Sized>(&self, w: &mut W) -> io::Result<()> {
        self.x.write_wire(w)?;
        self.y.write_wire(w)?;
        self.z.write_wire(w)
    }
}

impl WireRead for Vec3 {
    fn read_wire<R: Read + ?Sized>(r: &mut R) -> io::Result<Self> {
        Ok(Vec3::new(
            f32::read_wire(r)?,
            f32::read_wire(r)?,
            f32::read_wire(r)?,
        ))
    }
}

impl WireWrite for Quat {
    fn write_wire<W: Write + ?Sized>(&self, w: &mut W) -> io::Result<()> {
        self.x.write_wire(w)?;
        self.y.write_wire(w)?;
        self.z.write_wire(w)?;
        self.w.write_wire(w)
    }
}

impl WireRead for Quat {
    fn read_wire<R: Read + ?Sized>(r: &mut R) -> io::Result<Self> {
        Ok(Quat::from_xyzw(
            f32::read_wire(r)?,
            f32::read_wire(r)?,
            f32::read_wire(r)?,
            f32::read_wire(r)?,
        ))
    }
}

// Matrices are written row-major, nine scalars.
impl WireWrite for Mat3 {
    fn write_wire<W: Write + ?Sized>(&self, w: &mut W) -> io::Result<()> {
        let rows = self.transpose().to_cols_array();
        for value in rows {
            value.write_wire(w)?;
        }
        Ok(())
    }
}

impl WireRead for Mat3 {
    fn read_wire<R: Read + ?Sized>(r: &mut R) -> io::Result<Self> {
        let mut values = [0.0f32; 9];
        for value in &mut values {
            *value = f32::read_wire(r)?;
        }
        Ok(Mat3::from_cols_array(&values).transpose())
    }
}

impl WireWrite for Domain {
    fn write_wire<W: Write + ?Sized>(&self, w: &mut W) -> io::Result<()> {
        self.min.write_wire(w)?;
        self.max.write_wire(w)
    }
}

impl WireRead for Domain {
    fn read_wire<R: Read + ?Sized>(r: &mut R) -> io::Result<Self> {
        Ok(Domain {
            min: Vec3::read_wire(r)?,
            max: Vec3::read_wire(r)?,
        })
    }
}

impl WireWrite for BondSite {
    fn write_wire<W: Write + ?Sized>(&self, w: &mut W) -> io::Result<()> {
        self.offset.write_wire(w)
    }
}

impl WireRead for BondSite {
    fn read_wire<R: Read + ?Sized>(r: &mut R) -> io::Result<Self> {
        Ok(BondSite {
            offset: Vec3::read_wire(r)?,
        })
    }
}

// Inverse mass and inverse inertia are derived values; they are recomputed
// on read instead of being serialized.
impl WireWrite for UnitType {
    fn write_wire<W: Write + ?Sized>(&self, w: &mut W) -> io::Result<()> {
        self.name.write_wire(w)?;
        self.radius.write_wire(w)?;
        self.mass.write_wire(w)?;
        self.moment_of_inertia.write_wire(w)?;
        self.bond_sites.write_wire(w)?;
        self.mesh_vertices.write_wire(w)?;
        self.mesh_triangles.write_wire(w)
    }
}

impl WireRead for UnitType {
    fn read_wire<R: Read + ?Sized>(r: &mut R) -> io::Result<Self> {
        let name = String::read_wire(r)?;
        let radius = f32::read_wire(r)?;
        let mass = f32::read_wire(r)?;
        let moment_of_inertia = Mat3::read_wire(r)?;
        let bond_sites = Vec::read_wire(r)?;
        let mesh_vertices = Vec::read_wire(r)?;
        let mesh_triangles = Vec::read_wire(r)?;
        Ok(UnitType::new(
            name,
            radius,
            mass,
            moment_of_inertia,
            bond_sites,
            mesh_vertices,
            mesh_triangles,
        ))
    }
}

// Pick ids are transient interaction state and never cross the wire or hit
// disk as part of a unit state.
impl WireWrite for UnitState {
    fn write_wire<W: Write + ?Sized>(&self, w: &mut W) -> io::Result<()> {
        self.unit_type.write_wire(w)?;
        self.position.write_wire(w)?;
        self.orientation.write_wire(w)?;
        self.linear_velocity.write_wire(w)?;
        self.angular_velocity.write_wire(w)
    }
}

impl WireRead for UnitState {
    fn read_wire<R: Read + ?Sized>(r: &mut R) -> io::Result<Self> {
        Ok(UnitState {
            unit_type: u16::read_wire(r)?,
            pick_id: 0,
            position: Vec3::read_wire(r)?,
            orientation: Quat::read_wire(r)?,
            linear_velocity: Vec3::read_wire(r)?,
            angular_velocity: Vec3::read_wire(r)?,
        })
    }
}

impl WireWrite for ReducedUnitState {
    fn write_wire<W: Write + ?Sized>(&self, w: &mut W) -> io::Result<()> {
        self.unit_type.write_wire(w)?;
        self.position.write_wire(w)?;
        self.orientation.write_wire(w)
    }
}

impl WireRead for ReducedUnitState {
    fn read_wire<R: Read + ?Sized>(r: &mut R) -> io::Result<Self> {
        Ok(ReducedUnitState {
            unit_type: u16::read_wire(r)?,
            position: Vec3::read_wire(r)?,
            orientation: Quat::read_wire(r)?,
        })
    }
}

impl WireWrite for Parameters {
    fn write_wire<W: Write + ?Sized>(&self, w: &mut W) -> io::Result<()> {
        self.linear_dampening.write_wire(w)?;
        self.angular_dampening.write_wire(w)?;
        self.attenuation.write_wire(w)?;
        self.time_factor.write_wire(w)
    }
}

impl WireRead for Parameters {
    fn read_wire<R: Read + ?Sized>(r: &mut R) -> io::Result<Self> {
        Ok(Parameters {
            linear_dampening: f32::read_wire(r)?,
            angular_dampening: f32::read_wire(r)?,
            attenuation: f32::read_wire(r)?,
            time_factor: f32::read_wire(r)?,
        })
    }
}

impl WireWrite for Bond {
    fn write_wire<W: Write + ?Sized>(&self, w: &mut W) -> io::Result<()> {
        self.unit_index.write_wire(w)?;
        self.bond_site_index.write_wire(w)
    }
}

impl WireRead for Bond {
    fn read_wire<R: Read + ?Sized>(r: &mut R) -> io::Result<Self> {
        Ok(Bond {
            unit_index: u32::read_wire(r)?,
            bond_site_index: u32::read_wire(r)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round_trip<T: WireWrite + WireRead>(value: &T) -> T {
        let mut bytes = Vec::new();
        value.write_wire(&mut bytes).unwrap();
        let mut cursor = bytes.as_slice();
        let decoded = T::read_wire(&mut cursor).unwrap();
        assert!(cursor.is_empty(), "trailing bytes after decode");
        decoded
    }

    #[test]
    fn primitives_are_little_endian() {
        let mut bytes = Vec::new();
        0x0403_0201u32.write_wire(&mut bytes).unwrap();
        assert_eq!(bytes, [1, 2, 3, 4]);
        bytes.clear();
        0x0201u16.write_wire(&mut bytes).unwrap();
        assert_eq!(bytes, [1, 2]);
    }

    #[test]
    fn strings_are_length_prefixed() {
        let mut bytes = Vec::new();
        "abc".to_string().write_wire(&mut bytes).unwrap();
        assert_eq!(bytes, [3, 0, 0, 0, b'a', b'b', b'c']);
        assert_eq!(round_trip(&"tetrahedron".to_string()), "tetrahedron");
    }

    #[test]
    fn matrix_round_trips_row_major() {
        let m = Mat3::from_cols(
            Vec3::new(1.0, 4.0, 7.0),
            Vec3::new(2.0, 5.0, 8.0),
            Vec3::new(3.0, 6.0, 9.0),
        );
        let mut bytes = Vec::new();
        m.write_wire(&mut bytes).unwrap();
        // First row of the matrix comes first on the wire.
        let first = f32::from_le_bytes(bytes[0..4].try_into().unwrap());
        let second = f32::from_le_bytes(bytes[4..8].try_into().unwrap());
        assert_eq!(first, 1.0);
        assert_eq!(second, 2.0);
        assert_eq!(round_trip(&m), m);
    }

    #[test]
    fn unit_state_round_trips_without_pick_id() {
        let state = UnitState {
            unit_type: 7,
            pick_id: 42,
            position: Vec3::new(1.5, -2.0, 0.25),
            orientation: Quat::from_rotation_z(1.0),
            linear_velocity: Vec3::new(0.1, 0.2, 0.3),
            angular_velocity: Vec3::new(-1.0, 0.0, 2.0),
        };
        let decoded = round_trip(&state);
        assert_eq!(decoded.unit_type, state.unit_type);
        assert_eq!(decoded.pick_id, 0);
        assert_eq!(decoded.position, state.position);
        assert_eq!(decoded.orientation, state.orientation);
        assert_eq!(decoded.linear_velocity, state.linear_velocity);
        assert_eq!(decoded.angular_velocity, state.angular_velocity);
    }

    #[test]
    fn hostile_lengths_are_rejected() {
        let bytes = u32::MAX.to_le_bytes();
        let mut cursor = &bytes[..];
        assert!(Vec::<f32>::read_wire(&mut cursor).is_err());
    }

    #[test]
    fn unit_type_read_recomputes_inverses() {
        let ut = UnitType::new(
            "octahedron".into(),
            2.0,
            8.0,
            Mat3::from_diagonal(Vec3::new(2.0, 2.0, 4.0)),
            vec![BondSite { offset: Vec3::X }, BondSite { offset: -Vec3::X }],
            vec![Vec3::X, Vec3::Y, Vec3::Z],
            vec![0, 1, 2],
        );
        let decoded = round_trip(&ut);
        assert_eq!(decoded.inv_mass, 0.125);
        assert_eq!(decoded.bond_sites.len(), 2);
        assert_eq!(decoded.mesh_triangles, vec![0, 1, 2]);
        let id = decoded.inv_moment_of_inertia * decoded.moment_of_inertia;
        assert!((id * Vec3::ONE - Vec3::ONE).length() < 1e-6);
    }
}
