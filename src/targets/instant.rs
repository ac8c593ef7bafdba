//! Instant world tracking target.
//!
//! Places an anchor in the world without any marker: until the user
//! confirms placement the anchor is re-seated every frame at a fixed
//! offset in front of the camera, optionally sliding further away as
//! the camera tilts down. After placement the engine keeps the anchor
//! fixed in the world and the target just follows its pose.

use std::sync::Arc;

use nalgebra::Vector3;
use parking_lot::Mutex;
use tracing::error;

use crate::engine::{Engine, InstantOrientation, Modality, PipelineHandle};
use crate::error::Error;
use crate::geometry::{decompose_trs, host_from_native, Transform};
use crate::session::{CameraListener, ListenerId, SessionContext, SharedListener};

use super::{TargetPhase, Visibility, VisibilityHooks};

const DEFAULT_ANCHOR_OFFSET: Vector3<f32> = Vector3::new(0.0, 0.0, -5.0);
const DEFAULT_MIN_Z_DISTANCE: f32 = 30.0;
const DEFAULT_MAX_Z_DISTANCE: f32 = 80.0;
const DEFAULT_MAX_CAMERA_PITCH_DEG: f32 = 40.0;

pub struct InstantTarget {
    ctx: Arc<SessionContext>,
    phase: TargetPhase,
    mirrored: bool,
    listener_id: Option<ListenerId>,
    acquired: bool,
    /// Anchor offset in camera space used before placement.
    anchor_offset_from_camera: Vector3<f32>,
    /// Slide the pre-placement Z offset with camera pitch.
    move_anchor_on_z: bool,
    min_z_distance: f32,
    max_z_distance: f32,
    max_camera_pitch_deg: f32,
    placed: bool,
    visibility: Visibility,
    hooks: VisibilityHooks,
    transform: Transform,
    init_error: Option<Error>,
    disposed: bool,
}

impl InstantTarget {
    pub fn new(ctx: Arc<SessionContext>) -> Arc<Mutex<Self>> {
        ctx.session.lock().register_target(Modality::Instant);

        let target = Arc::new(Mutex::new(Self {
            ctx: ctx.clone(),
            phase: TargetPhase::Uninitialized,
            mirrored: false,
            listener_id: None,
            acquired: false,
            anchor_offset_from_camera: DEFAULT_ANCHOR_OFFSET,
            move_anchor_on_z: false,
            min_z_distance: DEFAULT_MIN_Z_DISTANCE,
            max_z_distance: DEFAULT_MAX_Z_DISTANCE,
            max_camera_pitch_deg: DEFAULT_MAX_CAMERA_PITCH_DEG,
            placed: false,
            visibility: Visibility::default(),
            hooks: VisibilityHooks::default(),
            transform: Transform::identity(),
            init_error: None,
            disposed: false,
        }));

        let listener: SharedListener = target.clone();
        let id = ctx.broadcaster.subscribe(&listener);
        target.lock().listener_id = Some(id);
        target
    }

    pub fn is_initialized(&self) -> bool {
        self.phase == TargetPhase::Active
    }

    pub fn initialization_error(&self) -> Option<&Error> {
        self.init_error.as_ref()
    }

    pub fn is_placed(&self) -> bool {
        self.placed
    }

    pub fn is_visible(&self) -> bool {
        self.visibility.is_visible()
    }

    pub fn transform(&self) -> Transform {
        self.transform
    }

    pub fn set_anchor_offset_from_camera(&mut self, offset: Vector3<f32>) {
        self.anchor_offset_from_camera = offset;
    }

    pub fn set_move_anchor_on_z(&mut self, enabled: bool) {
        self.move_anchor_on_z = enabled;
    }

    pub fn set_z_distance_range(&mut self, min: f32, max: f32) {
        self.min_z_distance = min;
        self.max_z_distance = max;
    }

    pub fn on_seen(&mut self, hook: impl FnMut() + Send + 'static) {
        self.hooks.on_seen(hook);
    }

    pub fn on_not_seen(&mut self, hook: impl FnMut() + Send + 'static) {
        self.hooks.on_not_seen(hook);
    }

    /// Pin the anchor where it currently is.
    pub fn place(&mut self) {
        self.placed = true;
    }

    /// Resume following the camera until the next `place`.
    pub fn reset_placement(&mut self) {
        self.placed = false;
    }

    /// Per-frame update: re-seat the anchor while unplaced, then publish
    /// its pose.
    pub fn update(&mut self) {
        if self.phase != TargetPhase::Active {
            return;
        }
        let Some(tracker) = self.ctx.session.lock().tracker(Modality::Instant) else {
            return;
        };
        let engine = self.ctx.engine();
        let camera_pose = self.ctx.camera_pose();

        if !self.placed {
            let offset = self.pre_placement_offset();
            engine.instant_anchor_set_from_camera_offset(
                tracker,
                offset,
                InstantOrientation::MinusZAwayFromUser,
            );
        }

        let tracked = engine.anchor_count(tracker) > 0;
        if let Some(event) = self.visibility.observe(tracked) {
            self.hooks.fire(event);
        }
        if tracked {
            let pose = engine.anchor_pose(tracker, 0, &camera_pose, self.mirrored);
            self.transform = host_from_native(&pose);
        }
    }

    /// Camera-relative transform of the anchor; identity until the
    /// engine reports it.
    pub fn camera_relative_transform(&self) -> Transform {
        if self.phase != TargetPhase::Active {
            return Transform::identity();
        }
        let Some(tracker) = self.ctx.session.lock().tracker(Modality::Instant) else {
            return Transform::identity();
        };
        let pose = self
            .ctx
            .engine()
            .anchor_pose_camera_relative(tracker, 0, self.mirrored);
        host_from_native(&pose)
    }

    /// Offset used while unplaced. With `move_anchor_on_z` the Z
    /// distance slides between the configured bounds as the camera
    /// pitches down, pushing the anchor further away the flatter the
    /// view.
    fn pre_placement_offset(&self) -> Vector3<f32> {
        if !self.move_anchor_on_z {
            return self.anchor_offset_from_camera;
        }
        let camera = decompose_trs(&self.ctx.camera_pose().0);
        let pitch_deg = camera.rotation.euler_angles().0.to_degrees();
        if !(0.0..self.max_camera_pitch_deg).contains(&pitch_deg) {
            return self.anchor_offset_from_camera;
        }
        let t = pitch_deg / self.max_camera_pitch_deg;
        let distance = self.min_z_distance + (self.max_z_distance - self.min_z_distance) * t;
        Vector3::new(
            self.anchor_offset_from_camera.x,
            self.anchor_offset_from_camera.y,
            -distance,
        )
    }

    /// Unregister from the camera and release the tracker reference.
    /// Idempotent; also invoked on drop.
    pub fn dispose(&mut self) {
        if self.disposed {
            return;
        }
        self.disposed = true;

        if let Some(id) = self.listener_id.take() {
            self.ctx.broadcaster.unsubscribe(id);
        }
        let mut session = self.ctx.session.lock();
        if self.acquired {
            session.release_tracker(Modality::Instant);
            self.acquired = false;
        }
        session.unregister_target(Modality::Instant);
        self.phase = TargetPhase::Uninitialized;
    }
}

impl CameraListener for InstantTarget {
    fn on_pipeline_ready(&mut self, _pipeline: PipelineHandle) {
        if self.phase == TargetPhase::Active || self.disposed {
            return;
        }
        match self.ctx.session.lock().ensure_tracker(Modality::Instant) {
            Ok(_) => {
                self.acquired = true;
                self.phase = TargetPhase::Active;
            }
            Err(err) => {
                error!(%err, "instant world tracking unavailable");
                self.init_error = Some(err);
            }
        }
    }

    fn on_mirroring_changed(&mut self, mirrored: bool) {
        self.mirrored = mirrored;
    }
}

impl Drop for InstantTarget {
    fn drop(&mut self) {
        self.dispose();
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;
    use nalgebra::UnitQuaternion;

    use super::*;
    use crate::engine::sim::SimEngine;
    use crate::geometry::Pose;
    use crate::session::CameraRig;

    fn started_target() -> (
        Arc<SimEngine>,
        Arc<SessionContext>,
        Arc<Mutex<InstantTarget>>,
    ) {
        let engine = Arc::new(SimEngine::new());
        let ctx = SessionContext::new(engine.clone());
        let target = InstantTarget::new(ctx.clone());
        let mut rig = CameraRig::new(ctx.clone());
        rig.start();
        (engine, ctx, target)
    }

    #[test]
    fn follows_camera_offset_until_placed() {
        let (_engine, _ctx, target) = started_target();
        target.lock().update();

        // Default offset is five units in front of the camera; native
        // -Z maps to host +Z.
        let transform = target.lock().transform();
        assert_relative_eq!(transform.position.z, 5.0, epsilon = 1e-6);
        assert!(target.lock().is_visible());
    }

    #[test]
    fn placement_stops_reanchoring() {
        let (_engine, _ctx, target) = started_target();
        target.lock().update();
        target.lock().place();
        assert!(target.lock().is_placed());

        // A new offset is not applied while placed.
        target
            .lock()
            .set_anchor_offset_from_camera(Vector3::new(0.0, 0.0, -2.0));
        target.lock().update();
        let relative = target.lock().camera_relative_transform();
        assert_relative_eq!(relative.position.z, 5.0, epsilon = 1e-6);

        // Resetting placement resumes following the camera offset.
        target.lock().reset_placement();
        target.lock().update();
        let relative = target.lock().camera_relative_transform();
        assert_relative_eq!(relative.position.z, 2.0, epsilon = 1e-6);
    }

    #[test]
    fn pitch_slides_z_distance_when_enabled() {
        let (_engine, ctx, target) = started_target();
        {
            let mut target = target.lock();
            target.set_move_anchor_on_z(true);
            target.set_z_distance_range(30.0, 80.0);
        }

        // Camera pitched down 20 of 40 degrees: halfway through the
        // distance range.
        let pitch = UnitQuaternion::from_axis_angle(&Vector3::x_axis(), 20.0_f32.to_radians());
        ctx.set_camera_pose(Pose::from_rotation_translation(pitch, Vector3::zeros()));
        target.lock().update();

        let relative = target.lock().camera_relative_transform();
        assert_relative_eq!(relative.position.z, 55.0, epsilon = 1e-3);
    }

    #[test]
    fn dispose_releases_tracker() {
        let (engine, _ctx, target) = started_target();
        assert_eq!(engine.live_trackers(), 1);
        target.lock().dispose();
        target.lock().dispose();
        assert_eq!(engine.live_trackers(), 0);
        assert_eq!(engine.stale_operations(), 0);
    }
}
