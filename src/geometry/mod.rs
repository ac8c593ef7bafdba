//! Pose representation and conversion between the native engine's
//! coordinate convention and the host scene convention.
//!
//! The engine reports poses as 4x4 column-major transforms in a
//! right-handed frame. The host scene graph is left-handed with +Z into
//! the screen, so conversion mirrors the Z axis on both sides of the
//! transform and then decomposes the result into translation, rotation
//! and non-uniform scale.

use nalgebra::{Matrix4, Rotation3, UnitQuaternion, Vector3};

pub type Mat4 = Matrix4<f32>;

/// Scale components below this are treated as degenerate.
const MIN_SCALE: f32 = 1e-8;

/// A transform in the native engine's convention.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Pose(pub Mat4);

impl Pose {
    pub fn identity() -> Self {
        Self(Mat4::identity())
    }

    pub fn from_translation(translation: Vector3<f32>) -> Self {
        Self(Mat4::new_translation(&translation))
    }

    pub fn from_rotation_translation(
        rotation: UnitQuaternion<f32>,
        translation: Vector3<f32>,
    ) -> Self {
        let mut m = rotation.to_homogeneous();
        m.fixed_view_mut::<3, 1>(0, 3).copy_from(&translation);
        Self(m)
    }

    pub fn translation(&self) -> Vector3<f32> {
        self.0.fixed_view::<3, 1>(0, 3).into_owned()
    }

    /// `self * other`, applying `other` first.
    pub fn compose(&self, other: &Pose) -> Pose {
        Pose(self.0 * other.0)
    }

    pub fn inverse(&self) -> Pose {
        match self.0.try_inverse() {
            Some(inv) => Pose(inv),
            None => Pose::identity(),
        }
    }
}

impl Default for Pose {
    fn default() -> Self {
        Self::identity()
    }
}

/// Decomposed transform in the host's convention, ready to apply to a
/// scene node.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Transform {
    pub position: Vector3<f32>,
    pub rotation: UnitQuaternion<f32>,
    pub scale: Vector3<f32>,
}

impl Transform {
    pub fn identity() -> Self {
        Self {
            position: Vector3::zeros(),
            rotation: UnitQuaternion::identity(),
            scale: Vector3::new(1.0, 1.0, 1.0),
        }
    }
}

impl Default for Transform {
    fn default() -> Self {
        Self::identity()
    }
}

/// Mirror the Z axis on both sides of the transform: `F * m * F` with
/// `F = diag(1, 1, -1, 1)`. Converts between the right-handed engine
/// frame and the left-handed host frame in either direction.
fn flip_handedness(m: &Mat4) -> Mat4 {
    let flip = Mat4::from_diagonal(&nalgebra::Vector4::new(1.0, 1.0, -1.0, 1.0));
    flip * m * flip
}

/// Convert a native pose into a host-convention transform.
pub fn host_from_native(pose: &Pose) -> Transform {
    decompose_trs(&flip_handedness(&pose.0))
}

/// Decompose an affine transform into translation, rotation and scale.
///
/// Scale is taken from the basis column lengths. A negative determinant
/// is folded into the Z scale so the remaining basis is a proper
/// rotation. Degenerate (near-zero) scale yields an identity rotation.
pub fn decompose_trs(m: &Mat4) -> Transform {
    let position = m.fixed_view::<3, 1>(0, 3).into_owned();

    let mut basis = m.fixed_view::<3, 3>(0, 0).into_owned();
    let mut scale = Vector3::new(
        basis.column(0).norm(),
        basis.column(1).norm(),
        basis.column(2).norm(),
    );

    if basis.determinant() < 0.0 {
        scale.z = -scale.z;
    }

    if scale.x.abs() < MIN_SCALE || scale.y.abs() < MIN_SCALE || scale.z.abs() < MIN_SCALE {
        return Transform {
            position,
            rotation: UnitQuaternion::identity(),
            scale,
        };
    }

    for (i, s) in [scale.x, scale.y, scale.z].into_iter().enumerate() {
        let col = basis.column(i) / s;
        basis.set_column(i, &col);
    }

    let rotation = UnitQuaternion::from_rotation_matrix(&Rotation3::from_matrix_unchecked(basis));

    Transform {
        position,
        rotation,
        scale,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use std::f32::consts::FRAC_PI_2;

    #[test]
    fn identity_pose_converts_to_identity_transform() {
        let t = host_from_native(&Pose::identity());
        assert_relative_eq!(t.position, Vector3::zeros(), epsilon = 1e-6);
        assert_relative_eq!(t.rotation.angle(), 0.0, epsilon = 1e-6);
        assert_relative_eq!(t.scale, Vector3::new(1.0, 1.0, 1.0), epsilon = 1e-6);
    }

    #[test]
    fn translation_flips_z() {
        let t = host_from_native(&Pose::from_translation(Vector3::new(1.0, 2.0, 3.0)));
        assert_relative_eq!(t.position, Vector3::new(1.0, 2.0, -3.0), epsilon = 1e-6);
        assert_relative_eq!(t.scale, Vector3::new(1.0, 1.0, 1.0), epsilon = 1e-6);
    }

    #[test]
    fn rotation_survives_conversion_as_proper_rotation() {
        let rot = UnitQuaternion::from_axis_angle(&Vector3::y_axis(), FRAC_PI_2);
        let t = host_from_native(&Pose::from_rotation_translation(rot, Vector3::zeros()));
        // Angle is preserved; the axis is mirrored along with the
        // handedness.
        assert_relative_eq!(t.rotation.angle(), FRAC_PI_2, epsilon = 1e-5);
        assert_relative_eq!(t.scale, Vector3::new(1.0, 1.0, 1.0), epsilon = 1e-5);
    }

    #[test]
    fn decompose_extracts_nonuniform_scale() {
        let m = Mat4::new_nonuniform_scaling(&Vector3::new(2.0, 3.0, 4.0));
        let t = decompose_trs(&m);
        assert_relative_eq!(t.scale, Vector3::new(2.0, 3.0, 4.0), epsilon = 1e-6);
        assert_relative_eq!(t.rotation.angle(), 0.0, epsilon = 1e-6);
    }

    #[test]
    fn negative_determinant_folds_into_z_scale() {
        let m = Mat4::from_diagonal(&nalgebra::Vector4::new(1.0, 1.0, -1.0, 1.0));
        let t = decompose_trs(&m);
        assert_relative_eq!(t.scale, Vector3::new(1.0, 1.0, -1.0), epsilon = 1e-6);
    }

    #[test]
    fn compose_and_inverse_round_trip() {
        let rot = UnitQuaternion::from_axis_angle(&Vector3::x_axis(), 0.3);
        let pose = Pose::from_rotation_translation(rot, Vector3::new(0.5, -1.0, 2.0));
        let round_trip = pose.compose(&pose.inverse());
        assert_relative_eq!(round_trip.0, Mat4::identity(), epsilon = 1e-5);
    }
}
