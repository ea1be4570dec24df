//! Kinematic primitives and the geometric predicate provider seam.
//!
//! The engine does not own collision geometry. It consumes per-pair predicates
//! (contact, distance, support) that a collaborator computes, either inline in
//! each [`Frame`](crate::Frame) or through a [`PredicateProvider`].

use serde::{Deserialize, Serialize};

/// A 3D vector in metres (positions) or metres per second (velocities).
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Vec3 {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Vec3 {
    pub const ZERO: Self = Self::new(0.0, 0.0, 0.0);

    pub const fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }

    #[must_use]
    pub fn norm(self) -> f64 {
        self.z.mul_add(self.z, self.x.mul_add(self.x, self.y * self.y)).sqrt()
    }

    #[must_use]
    pub fn sub(self, other: Self) -> Self {
        Self::new(self.x - other.x, self.y - other.y, self.z - other.z)
    }

    #[must_use]
    pub fn scale(self, factor: f64) -> Self {
        Self::new(self.x * factor, self.y * factor, self.z * factor)
    }

    pub fn is_finite(self) -> bool {
        self.x.is_finite() && self.y.is_finite() && self.z.is_finite()
    }
}

/// A unit quaternion `(x, y, z, w)`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Quaternion {
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub w: f64,
}

impl Default for Quaternion {
    fn default() -> Self {
        Self::IDENTITY
    }
}

impl Quaternion {
    pub const IDENTITY: Self = Self {
        x: 0.0,
        y: 0.0,
        z: 0.0,
        w: 1.0,
    };

    pub const fn new(x: f64, y: f64, z: f64, w: f64) -> Self {
        Self { x, y, z, w }
    }

    pub fn is_finite(self) -> bool {
        self.x.is_finite() && self.y.is_finite() && self.z.is_finite() && self.w.is_finite()
    }

    #[must_use]
    pub fn normalized(self) -> Self {
        let n = self
            .w
            .mul_add(self.w, self.z.mul_add(self.z, self.x.mul_add(self.x, self.y * self.y)))
            .sqrt();
        if n <= f64::EPSILON {
            return Self::IDENTITY;
        }
        Self::new(self.x / n, self.y / n, self.z / n, self.w / n)
    }

    #[must_use]
    pub const fn conjugate(self) -> Self {
        Self::new(-self.x, -self.y, -self.z, self.w)
    }

    /// Hamilton product `self * other`.
    #[must_use]
    pub fn mul(self, o: Self) -> Self {
        Self::new(
            self.w * o.x + self.x * o.w + self.y * o.z - self.z * o.y,
            self.w * o.y - self.x * o.z + self.y * o.w + self.z * o.x,
            self.w * o.z + self.x * o.y - self.y * o.x + self.z * o.w,
            self.w * o.w - self.x * o.x - self.y * o.y - self.z * o.z,
        )
    }

    /// Builds a quaternion from a row-major 3x3 rotation matrix.
    #[must_use]
    pub fn from_rotation_matrix(m: [f64; 9]) -> Self {
        let (m00, m01, m02) = (m[0], m[1], m[2]);
        let (m10, m11, m12) = (m[3], m[4], m[5]);
        let (m20, m21, m22) = (m[6], m[7], m[8]);
        let trace = m00 + m11 + m22;

        let q = if trace > 0.0 {
            let s = (trace + 1.0).sqrt() * 2.0;
            Self::new((m21 - m12) / s, (m02 - m20) / s, (m10 - m01) / s, 0.25 * s)
        } else if m00 > m11 && m00 > m22 {
            let s = (1.0 + m00 - m11 - m22).sqrt() * 2.0;
            Self::new(0.25 * s, (m01 + m10) / s, (m02 + m20) / s, (m21 - m12) / s)
        } else if m11 > m22 {
            let s = (1.0 + m11 - m00 - m22).sqrt() * 2.0;
            Self::new((m01 + m10) / s, 0.25 * s, (m12 + m21) / s, (m02 - m20) / s)
        } else {
            let s = (1.0 + m22 - m00 - m11).sqrt() * 2.0;
            Self::new((m02 + m20) / s, (m12 + m21) / s, 0.25 * s, (m10 - m01) / s)
        };
        q.normalized()
    }
}

/// Position and orientation of a body.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Pose {
    pub position: Vec3,
    #[serde(default)]
    pub orientation: Quaternion,
}

impl Pose {
    pub const fn new(position: Vec3, orientation: Quaternion) -> Self {
        Self {
            position,
            orientation,
        }
    }

    pub const fn at(x: f64, y: f64, z: f64) -> Self {
        Self::new(Vec3::new(x, y, z), Quaternion::IDENTITY)
    }

    pub fn is_finite(&self) -> bool {
        self.position.is_finite() && self.orientation.is_finite()
    }
}

/// Linear (m/s) and angular (rad/s) velocity.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Twist {
    pub linear: Vec3,
    #[serde(default)]
    pub angular: Vec3,
}

impl Twist {
    pub const fn linear(x: f64, y: f64, z: f64) -> Self {
        Self {
            linear: Vec3::new(x, y, z),
            angular: Vec3::ZERO,
        }
    }

    pub fn is_finite(&self) -> bool {
        self.linear.is_finite() && self.angular.is_finite()
    }
}

/// Per-entity kinematic state in one frame.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct BodyState {
    pub pose: Pose,
    /// Velocity as reported by the source. Estimated from consecutive poses when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub twist: Option<Twist>,
}

impl BodyState {
    pub const fn at_rest(pose: Pose) -> Self {
        Self {
            pose,
            twist: Some(Twist {
                linear: Vec3::ZERO,
                angular: Vec3::ZERO,
            }),
        }
    }

    pub const fn moving(pose: Pose, twist: Twist) -> Self {
        Self {
            pose,
            twist: Some(twist),
        }
    }
}

/// Predicate values for one entity pair in one frame.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct PairPredicates {
    pub contact: bool,
    #[serde(default)]
    pub distance: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub relative_velocity: Option<Vec3>,
    /// Whether the first entity rests on the second. Absent means not supported.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub support: Option<bool>,
}

impl PairPredicates {
    pub const fn touching() -> Self {
        Self {
            contact: true,
            distance: 0.0,
            relative_velocity: None,
            support: None,
        }
    }

    pub const fn apart(distance: f64) -> Self {
        Self {
            contact: false,
            distance,
            relative_velocity: None,
            support: None,
        }
    }

    pub const fn resting() -> Self {
        Self {
            contact: true,
            distance: 0.0,
            relative_velocity: None,
            support: Some(true),
        }
    }

    pub fn is_finite(&self) -> bool {
        self.distance.is_finite() && self.relative_velocity.is_none_or(Vec3::is_finite)
    }
}

/// Computes pair predicates from two body states.
///
/// Implementations must be pure: the engine may call them from several
/// threads and in any order.
pub trait PredicateProvider: Send + Sync {
    fn evaluate(&self, a: &BodyState, b: &BodyState) -> PairPredicates;
}

/// Centre-distance approximation for sources without collision data.
///
/// Two bodies touch when their centres are within `contact_distance`. The
/// first body is supported by the second when they touch and the first sits at
/// least `support_min_height` above the second.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ProximityProvider {
    pub contact_distance: f64,
    pub support_min_height: f64,
}

impl Default for ProximityProvider {
    fn default() -> Self {
        Self {
            contact_distance: 0.05,
            support_min_height: 0.0,
        }
    }
}

impl PredicateProvider for ProximityProvider {
    fn evaluate(&self, a: &BodyState, b: &BodyState) -> PairPredicates {
        let distance = a.pose.position.sub(b.pose.position).norm();
        let contact = distance <= self.contact_distance;
        let above = a.pose.position.z - b.pose.position.z >= self.support_min_height;
        let relative_velocity = match (a.twist, b.twist) {
            (Some(ta), Some(tb)) => Some(ta.linear.sub(tb.linear)),
            _ => None,
        };
        PairPredicates {
            contact,
            distance,
            relative_velocity,
            support: Some(contact && above),
        }
    }
}

/// Estimates a twist by finite difference between two poses `dt` seconds apart.
///
/// Returns `None` when `dt` is not positive.
pub fn estimate_twist(previous: &Pose, current: &Pose, dt: f64) -> Option<Twist> {
    if dt <= 0.0 || !dt.is_finite() {
        return None;
    }
    let linear = current.position.sub(previous.position).scale(1.0 / dt);

    let mut delta = current
        .orientation
        .normalized()
        .mul(previous.orientation.normalized().conjugate());
    if delta.w < 0.0 {
        delta = Quaternion::new(-delta.x, -delta.y, -delta.z, -delta.w);
    }
    let axis = Vec3::new(delta.x, delta.y, delta.z);
    let sin_half = axis.norm();
    let angular = if sin_half <= f64::EPSILON {
        Vec3::ZERO
    } else {
        let angle = 2.0 * sin_half.atan2(delta.w);
        axis.scale(angle / (sin_half * dt))
    };

    Some(Twist { linear, angular })
}
