use std::fmt::{Debug, Display};
use std::io::{self, Write};
use std::ops::{Add, AddAssign, Div, Mul, Sub};
use std::str::FromStr;

use nalgebra_glm::Mat4;
use serde::Deserialize;
extern crate nalgebra_glm as glm;

use crate::write::Serialize;

macro_rules! id_type {
    ($name:ident, $type:ty) => {
        #[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name(pub $type);
        impl Debug for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_fmt(format_args!("{}", &self.0))
            }
        }
    };
}

// 0 is reserved for "no bone"
id_type! {BoneId, u32}

impl BoneId {
    pub const NONE: BoneId = BoneId(0);
    pub fn is_none(self) -> bool {
        self.0 == 0
    }
}

macro_rules! mk_struct {
    ($($(#[$meta:meta])* pub struct $tyname:ident { $(pub $name:ident: $ty:ty,)* })*) => {
        $(
            $(#[$meta])*
            pub struct $tyname {
                $(pub $name: $ty,)*
            }

            impl Serialize for $tyname {
                fn write_to(&self, w: &mut impl Write) -> io::Result<()> {
                    $(self.$name.write_to(w)?;)*
                    Ok(())
                }
            }
        )*
    };
}

mk_struct! {
    #[derive(Clone, Copy, Default)]
    pub struct Vec3d {
        pub x: f32,
        pub y: f32,
        pub z: f32,
    }

    #[derive(Clone, Copy, Default)]
    pub struct Vec2d {
        pub u: f32,
        pub v: f32,
    }
}
impl Eq for Vec3d {}
impl PartialEq for Vec3d {
    // bitwise, so that NaN == NaN and the type can key a hash map
    fn eq(&self, other: &Self) -> bool {
        self.x.to_bits() == other.x.to_bits() && self.y.to_bits() == other.y.to_bits() && self.z.to_bits() == other.z.to_bits()
    }
}
impl std::hash::Hash for Vec3d {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.x.to_bits().hash(state);
        self.y.to_bits().hash(state);
        self.z.to_bits().hash(state);
    }
}
impl Debug for Vec3d {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({}, {}, {})", &self.x, &self.y, &self.z)
    }
}
impl From<[f32; 3]> for Vec3d {
    fn from([x, y, z]: [f32; 3]) -> Self {
        Vec3d { x, y, z }
    }
}
impl From<Vec3d> for [f32; 3] {
    fn from(Vec3d { x, y, z }: Vec3d) -> Self {
        [x, y, z]
    }
}
impl From<Vec3d> for nalgebra_glm::Vec3 {
    fn from(Vec3d { x, y, z }: Vec3d) -> Self {
        glm::vec3(x, y, z)
    }
}
impl From<nalgebra_glm::Vec3> for Vec3d {
    fn from(vec: nalgebra_glm::Vec3) -> Self {
        <[f32; 3]>::from(vec).into()
    }
}
impl Vec3d {
    pub const ZERO: Vec3d = Vec3d { x: 0.0, y: 0.0, z: 0.0 };
    pub fn new(x: f32, y: f32, z: f32) -> Self {
        Vec3d { x, y, z }
    }
    pub fn magnitude(self) -> f32 {
        f32::sqrt(self.x * self.x + self.y * self.y + self.z * self.z)
    }
    /// Zero-length vectors are returned unchanged.
    pub fn normalize(self) -> Vec3d {
        let mag = self.magnitude();
        if mag > 0.0 {
            self / mag
        } else {
            self
        }
    }
    pub fn is_null(self) -> bool {
        self.x.abs() <= 0.000001 && self.y.abs() <= 0.000001 && self.z.abs() <= 0.000001
    }
    /// True when any axis differs by more than `epsilon`.
    pub fn differs_from(self, other: Vec3d, epsilon: f32) -> bool {
        (self.x - other.x).abs() > epsilon || (self.y - other.y).abs() > epsilon || (self.z - other.z).abs() > epsilon
    }
}
impl Add for Vec3d {
    type Output = Vec3d;

    fn add(self, rhs: Self) -> Self::Output {
        Vec3d { x: self.x + rhs.x, y: self.y + rhs.y, z: self.z + rhs.z }
    }
}
impl AddAssign for Vec3d {
    fn add_assign(&mut self, rhs: Vec3d) {
        self.x += rhs.x;
        self.y += rhs.y;
        self.z += rhs.z;
    }
}
impl Sub for Vec3d {
    type Output = Vec3d;

    fn sub(self, rhs: Self) -> Self::Output {
        Vec3d { x: self.x - rhs.x, y: self.y - rhs.y, z: self.z - rhs.z }
    }
}
impl Mul<f32> for Vec3d {
    type Output = Vec3d;

    fn mul(self, rhs: f32) -> Vec3d {
        Vec3d { x: self.x * rhs, y: self.y * rhs, z: self.z * rhs }
    }
}
impl Mul<Vec3d> for &Mat4 {
    type Output = Vec3d;

    fn mul(self, rhs: Vec3d) -> Self::Output {
        self.transform_point(&glm::Vec3::from(rhs).into()).coords.into()
    }
}
impl Div<f32> for Vec3d {
    type Output = Vec3d;

    fn div(self, rhs: f32) -> Vec3d {
        Vec3d { x: self.x / rhs, y: self.y / rhs, z: self.z / rhs }
    }
}

impl Eq for Vec2d {}
impl PartialEq for Vec2d {
    fn eq(&self, other: &Self) -> bool {
        self.u.to_bits() == other.u.to_bits() && self.v.to_bits() == other.v.to_bits()
    }
}
impl std::hash::Hash for Vec2d {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.u.to_bits().hash(state);
        self.v.to_bits().hash(state);
    }
}
impl Debug for Vec2d {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({}, {})", &self.u, &self.v)
    }
}
impl From<[f32; 2]> for Vec2d {
    fn from([u, v]: [f32; 2]) -> Self {
        Vec2d { u, v }
    }
}
impl Vec2d {
    pub fn new(u: f32, v: f32) -> Self {
        Vec2d { u, v }
    }
}

macro_rules! mk_enumeration {
    ($($(#[$meta:meta])* pub enum $tyname:ident($base:ty) {
        $($(#[$doc:meta])* $name:ident = $n:literal,)*
    })*) => {
        $(
            $(#[$meta])*
            pub enum $tyname {
                $($(#[$doc])* $name = $n,)*
            }

            impl Serialize for $tyname {
                fn write_to(&self, w: &mut impl Write) -> io::Result<()> {
                    (*self as $base).write_to(w)
                }
            }

        )*
    };
}

mk_enumeration! {
    /// Legacy bone role codes, one byte per bone record.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum PmdBoneKind(u8) {
        Rotate = 0,
        RotateMove = 1,
        Ik = 2,
        UnderIk = 4,
        UnderRotation = 5,
        IkTip = 6,
        Hidden = 7,
        Twist = 8,
        RotationLink = 9,
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
    #[serde(rename_all = "lowercase")]
    pub enum MorphCategory(u8) {
        #[default]
        Base = 0,
        Brow = 1,
        Eye = 2,
        Lip = 3,
        Other = 4,
    }
}

impl MorphCategory {
    /// Targets never use the base slot; it is reserved for the synthetic base record.
    pub fn for_target(self) -> MorphCategory {
        match self {
            MorphCategory::Base => MorphCategory::Other,
            other => other,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Format {
    /// Legacy fixed-field layout
    Pmd,
    /// Extended layout with length-prefixed UTF-16 strings
    #[default]
    Pmx,
}
impl Format {
    pub const PMD_MAGIC: &'static [u8; 3] = b"Pmd";
    pub const PMX_MAGIC: &'static [u8; 4] = b"PMX ";
    pub const PMD_VERSION: f32 = 1.0;
    pub const PMX_VERSION: f32 = 2.0;

    pub fn extension(self) -> &'static str {
        match self {
            Format::Pmd => "pmd",
            Format::Pmx => "pmx",
        }
    }
}
impl FromStr for Format {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match &*s.to_ascii_lowercase() {
            "pmd" => Ok(Format::Pmd),
            "pmx" => Ok(Format::Pmx),
            other => Err(format!("unknown format {:?}, expected pmd or pmx", other)),
        }
    }
}
impl Display for Format {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Format::Pmd => "PMD",
            Format::Pmx => "PMX",
        })
    }
}

/// Bits of the extended layout's 16-bit bone flag word.
pub mod bone_flags {
    pub const TAIL_IS_BONE: u16 = 0x0001;
    pub const ROTATABLE: u16 = 0x0002;
    pub const MOVABLE: u16 = 0x0004;
    pub const VISIBLE: u16 = 0x0008;
    pub const OPERABLE: u16 = 0x0010;
    pub const IK: u16 = 0x0020;
    pub const INHERIT_ROTATION: u16 = 0x0100;
    pub const INHERIT_TRANSLATION: u16 = 0x0200;
    pub const FIXED_AXIS: u16 = 0x0400;
    pub const LOCAL_AXIS: u16 = 0x0800;
    pub const EXTERNAL_PARENT: u16 = 0x2000;
}

/// Per-axis rotation limits in degrees.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AngleLimits {
    pub min: Vec3d,
    pub max: Vec3d,
}
impl Default for AngleLimits {
    fn default() -> Self {
        AngleLimits { min: Vec3d::new(-180.0, -180.0, -180.0), max: Vec3d::new(180.0, 180.0, 180.0) }
    }
}
impl AngleLimits {
    pub fn is_unlimited(&self) -> bool {
        *self == AngleLimits::default()
    }

    /// Only the axis along the bone (z, bank) may rotate.
    pub fn is_twist(&self) -> bool {
        self.min.x == 0.0 && self.max.x == 0.0 && self.min.y == 0.0 && self.max.y == 0.0 && self.min.z != self.max.z
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vec3d_normalize_keeps_zero() {
        assert_eq!(Vec3d::ZERO.normalize(), Vec3d::ZERO);
        let n = Vec3d::new(3.0, 0.0, 4.0).normalize();
        assert!((n.magnitude() - 1.0).abs() < 1e-6);
    }

    #[test]
    fn vec3d_differs_from_is_per_axis() {
        let a = Vec3d::new(1.0, 1.0, 1.0);
        assert!(!a.differs_from(Vec3d::new(1.000001, 1.0, 1.0), 1e-5));
        assert!(a.differs_from(Vec3d::new(1.0, 1.0, 1.001), 1e-5));
    }

    #[test]
    fn format_parses_case_insensitively() {
        assert_eq!("PMD".parse::<Format>(), Ok(Format::Pmd));
        assert_eq!("pmx".parse::<Format>(), Ok(Format::Pmx));
        assert!("obj".parse::<Format>().is_err());
    }

    #[test]
    fn twist_limits_only_allow_bank() {
        let twist = AngleLimits { min: Vec3d::new(0.0, 0.0, -90.0), max: Vec3d::new(0.0, 0.0, 90.0) };
        assert!(twist.is_twist());
        assert!(!AngleLimits::default().is_twist());
        assert!(AngleLimits::default().is_unlimited());
    }
}
