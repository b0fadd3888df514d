//! Conversions between the `#[repr(C)]` value types and `glam`, plus the
//! output coordinate-system [`Basis`].
//!
//! Internally everything is `glam`: x right, y up, z forward, metres and
//! radians. `a * b` applies `b` first. The POD types only appear where
//! values cross the C ABI.

use crate::types::{Quaternion, Vector2, Vector3};
use glam::{Mat3, Quat, Vec2, Vec3};

pub const EPSILON: f32 = 1e-6;

impl From<Vector2> for Vec2 {
    fn from(v: Vector2) -> Vec2 {
        Vec2::new(v.x, v.y)
    }
}

impl From<Vec2> for Vector2 {
    fn from(v: Vec2) -> Vector2 {
        Vector2::new(v.x, v.y)
    }
}

impl From<Vector3> for Vec3 {
    fn from(v: Vector3) -> Vec3 {
        Vec3::new(v.x, v.y, v.z)
    }
}

impl From<Vec3> for Vector3 {
    fn from(v: Vec3) -> Vector3 {
        Vector3::new(v.x, v.y, v.z)
    }
}

impl From<Quaternion> for Quat {
    fn from(q: Quaternion) -> Quat {
        Quat::from_xyzw(q.x, q.y, q.z, q.w)
    }
}

impl From<Quat> for Quaternion {
    fn from(q: Quat) -> Quaternion {
        Quaternion::new(q.x, q.y, q.z, q.w)
    }
}

/// Heading helpers `glam` does not provide.
pub trait QuatExt {
    /// Yaw of the rotated forward axis, in radians. Positive turns right.
    fn heading(self) -> f32;
    /// The yaw part alone.
    fn yaw_only(self) -> Quat;
    /// Unit quaternion, or identity when the input is degenerate.
    fn unit(self) -> Quat;
    /// Rotation vector along the shortest arc.
    fn rotation_vector(self) -> Vec3;
    /// Angle in radians between two orientations.
    fn angle_to(self, other: Quat) -> f32;
}

impl QuatExt for Quat {
    fn heading(self) -> f32 {
        let f = self * Vec3::Z;
        f.x.atan2(f.z)
    }

    fn yaw_only(self) -> Quat {
        Quat::from_rotation_y(self.heading())
    }

    fn unit(self) -> Quat {
        let len = self.length();
        if !self.is_finite() || len <= EPSILON {
            Quat::IDENTITY
        } else {
            self / len
        }
    }

    fn rotation_vector(self) -> Vec3 {
        let q = self.unit();
        let q = if q.w < 0.0 { -q } else { q };
        q.to_scaled_axis()
    }

    fn angle_to(self, other: Quat) -> f32 {
        // atan2 keeps precision near zero where acos of the dot does not.
        let rel = self.unit().conjugate() * other.unit();
        2.0 * rel.xyz().length().atan2(rel.w.abs())
    }
}

/// Normalised hemisphere-aligned mean of a set of rotations.
pub fn average_rotation(samples: &[Quat]) -> Quat {
    let Some(first) = samples.first().copied() else {
        return Quat::IDENTITY;
    };
    samples
        .iter()
        .fold(Quat::from_xyzw(0.0, 0.0, 0.0, 0.0), |acc, q| {
            if q.dot(first) < 0.0 {
                acc - *q
            } else {
                acc + *q
            }
        })
        .unit()
}

/// Output coordinate-system basis.
///
/// Columns are the images of the internal x, y and z axes. Handedness
/// changes are allowed: rotations and other axial quantities pick up the
/// determinant sign.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Basis {
    m: Mat3,
    det: f32,
}

impl Default for Basis {
    fn default() -> Self {
        Self::IDENTITY
    }
}

impl Basis {
    pub const IDENTITY: Basis = Basis {
        m: Mat3::IDENTITY,
        det: 1.0,
    };

    /// Build a basis from three axes. Returns `None` unless the axes are
    /// finite, non-zero and mutually orthogonal.
    pub fn new(x: Vec3, y: Vec3, z: Vec3) -> Option<Basis> {
        if !(x.is_finite() && y.is_finite() && z.is_finite()) {
            return None;
        }
        let (x, y, z) = (x.try_normalize()?, y.try_normalize()?, z.try_normalize()?);
        const ORTHO: f32 = 1e-3;
        if x.dot(y).abs() > ORTHO || y.dot(z).abs() > ORTHO || z.dot(x).abs() > ORTHO {
            return None;
        }
        let m = Mat3::from_cols(x, y, z);
        Some(Basis {
            m,
            det: m.determinant().signum(),
        })
    }

    pub fn determinant(&self) -> f32 {
        self.det
    }

    /// Map an internal vector into the output frame.
    pub fn vector(&self, v: Vec3) -> Vec3 {
        self.m * v
    }

    /// Map an output-frame vector back into the internal frame.
    pub fn inverse_vector(&self, v: Vec3) -> Vec3 {
        self.m.transpose() * v
    }

    /// Map an axial vector (angular velocity, acceleration).
    pub fn axial(&self, v: Vec3) -> Vec3 {
        self.vector(v) * self.det
    }

    pub fn inverse_axial(&self, v: Vec3) -> Vec3 {
        self.inverse_vector(v) * self.det
    }

    /// Conjugate a rotation into the output frame.
    pub fn rotation(&self, q: Quat) -> Quat {
        Quat::from_vec4(self.axial(q.xyz()).extend(q.w))
    }

    pub fn inverse_rotation(&self, q: Quat) -> Quat {
        Quat::from_vec4(self.inverse_axial(q.xyz()).extend(q.w))
    }
}
