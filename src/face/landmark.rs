//! Named face landmark pose publication.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::engine::{
    Engine, FaceLandmarkHandle, NUM_EXPRESSION_COEFFICIENTS, NUM_IDENTITY_COEFFICIENTS,
};
use crate::geometry::{host_from_native, Transform};
use crate::session::SessionContext;
use crate::targets::FaceTrackingGroup;

/// Landmarks the face model can locate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaceLandmarkName {
    LeftEye,
    RightEye,
    LeftEar,
    RightEar,
    NoseBridge,
    NoseTip,
    NoseBase,
    LipTop,
    LipBottom,
    MouthCenter,
    Chin,
    LeftEyebrow,
    RightEyebrow,
}

impl FaceLandmarkName {
    fn code(self) -> u32 {
        match self {
            FaceLandmarkName::LeftEye => 0,
            FaceLandmarkName::RightEye => 1,
            FaceLandmarkName::LeftEar => 2,
            FaceLandmarkName::RightEar => 3,
            FaceLandmarkName::NoseBridge => 4,
            FaceLandmarkName::NoseTip => 5,
            FaceLandmarkName::NoseBase => 6,
            FaceLandmarkName::LipTop => 7,
            FaceLandmarkName::LipBottom => 8,
            FaceLandmarkName::MouthCenter => 9,
            FaceLandmarkName::Chin => 10,
            FaceLandmarkName::LeftEyebrow => 11,
            FaceLandmarkName::RightEyebrow => 12,
        }
    }
}

/// Follows one named landmark of a tracked face, publishing its pose
/// relative to the face anchor. Position and rotation only; landmarks
/// carry no scale.
pub struct FaceLandmark {
    ctx: Arc<SessionContext>,
    group: Arc<Mutex<FaceTrackingGroup>>,
    face_identity: u32,
    name: FaceLandmarkName,
    current: Option<(FaceLandmarkName, FaceLandmarkHandle)>,
    identity: [f32; NUM_IDENTITY_COEFFICIENTS],
    expression: [f32; NUM_EXPRESSION_COEFFICIENTS],
    transform: Transform,
}

impl FaceLandmark {
    pub fn new(
        ctx: Arc<SessionContext>,
        group: Arc<Mutex<FaceTrackingGroup>>,
        face_identity: u32,
        name: FaceLandmarkName,
    ) -> Self {
        Self {
            ctx,
            group,
            face_identity,
            name,
            current: None,
            identity: [0.0; NUM_IDENTITY_COEFFICIENTS],
            expression: [0.0; NUM_EXPRESSION_COEFFICIENTS],
            transform: Transform::identity(),
        }
    }

    pub fn name(&self) -> FaceLandmarkName {
        self.name
    }

    /// Switch to another landmark; the native instance is recreated on
    /// the next update.
    pub fn set_landmark(&mut self, name: FaceLandmarkName) {
        self.name = name;
    }

    /// Pose relative to the tracked face anchor, in host convention.
    pub fn transform(&self) -> Transform {
        self.transform
    }

    pub fn update(&mut self) {
        let (initialized, mirrored, snapshot) = {
            let group = self.group.lock();
            (
                group.is_initialized(),
                group.is_mirrored(),
                group.anchor_snapshot(self.face_identity),
            )
        };
        if !initialized {
            return;
        }

        let engine = self.ctx.engine().clone();
        let handle = match self.current {
            Some((name, handle)) if name == self.name => handle,
            _ => {
                if let Some((_, old)) = self.current.take() {
                    engine.face_landmark_destroy(old);
                }
                let handle = engine.face_landmark_create(self.name.code());
                self.current = Some((self.name, handle));
                handle
            }
        };

        if let Some(snapshot) = snapshot {
            engine.face_anchor_identity_coefficients(
                snapshot.tracker,
                snapshot.index,
                &mut self.identity,
            );
            engine.face_anchor_expression_coefficients(
                snapshot.tracker,
                snapshot.index,
                &mut self.expression,
            );
        }

        engine.face_landmark_update(handle, &self.identity, &self.expression, mirrored);
        let pose = engine.face_landmark_pose(handle);
        let solved = host_from_native(&pose);
        self.transform.position = solved.position;
        self.transform.rotation = solved.rotation;
    }

    /// Destroy the native landmark. Idempotent; also invoked on drop.
    pub fn dispose(&mut self) {
        if let Some((_, handle)) = self.current.take() {
            self.ctx.engine().face_landmark_destroy(handle);
        }
    }
}

impl Drop for FaceLandmark {
    fn drop(&mut self) {
        self.dispose();
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;

    use super::*;
    use crate::engine::sim::SimEngine;
    use crate::session::CameraRig;

    fn landmark_setup() -> (Arc<SimEngine>, Arc<SessionContext>, FaceLandmark) {
        let engine = Arc::new(SimEngine::new());
        let ctx = SessionContext::new(engine.clone());
        let group = FaceTrackingGroup::new(ctx.clone(), &[0]);
        let landmark = FaceLandmark::new(ctx.clone(), group, 0, FaceLandmarkName::NoseTip);
        (engine, ctx, landmark)
    }

    #[test]
    fn publishes_landmark_position() {
        let (_engine, ctx, mut landmark) = landmark_setup();
        let mut rig = CameraRig::new(ctx);
        rig.start();

        landmark.update();
        // Simulated landmark pose encodes the landmark code.
        assert_relative_eq!(landmark.transform().position.x, 0.05, epsilon = 1e-6);
    }

    #[test]
    fn changing_landmark_recreates_native_instance() {
        let (engine, ctx, mut landmark) = landmark_setup();
        let mut rig = CameraRig::new(ctx);
        rig.start();

        landmark.update();
        landmark.set_landmark(FaceLandmarkName::Chin);
        landmark.update();

        assert_relative_eq!(landmark.transform().position.x, 0.10, epsilon = 1e-6);
        assert_eq!(engine.stale_operations(), 0);

        landmark.dispose();
        landmark.dispose();
        assert_eq!(engine.stale_operations(), 0);
    }
}
