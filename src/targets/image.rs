//! Image tracking target.
//!
//! Tracks one trained image descriptor. The descriptor bytes are loaded
//! into the shared image tracker when the pipeline comes up; afterwards
//! the target follows its anchor slot, publishing seen / not-seen edges
//! and a pose with the configured plane orientation applied.

use std::path::Path;
use std::sync::Arc;

use nalgebra::{UnitQuaternion, Vector3};
use parking_lot::Mutex;
use tracing::error;

use crate::engine::{Engine, Modality, PipelineHandle, PreviewImage};
use crate::error::{Error, Result};
use crate::geometry::{host_from_native, Transform};
use crate::session::{CameraListener, ListenerId, SessionContext, SharedListener};

use super::{TargetPhase, Visibility, VisibilityHooks};

/// How the tracked image plane is oriented in the scene.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PlaneOrientation {
    /// Lying flat, e.g. a print on a table.
    Flat,
    /// Standing upright, e.g. a poster on a wall.
    #[default]
    Upright,
}

pub struct ImageTarget {
    ctx: Arc<SessionContext>,
    target_data: Vec<u8>,
    /// Slot of this target within the shared image tracker, assigned in
    /// descriptor load order.
    target_index: usize,
    orientation: PlaneOrientation,
    phase: TargetPhase,
    mirrored: bool,
    listener_id: Option<ListenerId>,
    acquired: bool,
    visibility: Visibility,
    hooks: VisibilityHooks,
    transform: Transform,
    hold_last_pose_on_loss: bool,
    init_error: Option<Error>,
    disposed: bool,
}

impl ImageTarget {
    /// Create a target from trained descriptor bytes and register it
    /// with the camera broadcaster.
    pub fn new(
        ctx: Arc<SessionContext>,
        target_data: Vec<u8>,
        target_index: usize,
        orientation: PlaneOrientation,
    ) -> Arc<Mutex<Self>> {
        ctx.session.lock().register_target(Modality::Image);

        let target = Arc::new(Mutex::new(Self {
            ctx: ctx.clone(),
            target_data,
            target_index,
            orientation,
            phase: TargetPhase::Uninitialized,
            mirrored: false,
            listener_id: None,
            acquired: false,
            visibility: Visibility::default(),
            hooks: VisibilityHooks::default(),
            transform: Transform::identity(),
            hold_last_pose_on_loss: true,
            init_error: None,
            disposed: false,
        }));

        let listener: SharedListener = target.clone();
        let id = ctx.broadcaster.subscribe(&listener);
        target.lock().listener_id = Some(id);
        target
    }

    /// Create a target from a trained descriptor file.
    pub fn from_file(
        ctx: Arc<SessionContext>,
        path: &Path,
        target_index: usize,
        orientation: PlaneOrientation,
    ) -> Result<Arc<Mutex<Self>>> {
        let data = std::fs::read(path)?;
        Ok(Self::new(ctx, data, target_index, orientation))
    }

    pub fn is_initialized(&self) -> bool {
        self.phase == TargetPhase::Active
    }

    pub fn initialization_error(&self) -> Option<&Error> {
        self.init_error.as_ref()
    }

    pub fn is_visible(&self) -> bool {
        self.visibility.is_visible()
    }

    pub fn orientation(&self) -> PlaneOrientation {
        self.orientation
    }

    pub fn transform(&self) -> Transform {
        self.transform
    }

    pub fn set_hold_last_pose_on_loss(&mut self, hold: bool) {
        self.hold_last_pose_on_loss = hold;
    }

    pub fn on_seen(&mut self, hook: impl FnMut() + Send + 'static) {
        self.hooks.on_seen(hook);
    }

    pub fn on_not_seen(&mut self, hook: impl FnMut() + Send + 'static) {
        self.hooks.on_not_seen(hook);
    }

    /// Preview image embedded in the trained descriptor, once loaded.
    pub fn preview_image(&self) -> Option<PreviewImage> {
        if self.phase != TargetPhase::Active {
            return None;
        }
        let tracker = self.ctx.session.lock().tracker(Modality::Image)?;
        self.ctx
            .engine()
            .image_target_preview_rgba(tracker, self.target_index)
    }

    /// Per-frame update: visibility edges plus pose publication while
    /// the image is in view.
    pub fn update(&mut self) {
        if self.phase != TargetPhase::Active {
            return;
        }
        let Some(tracker) = self.ctx.session.lock().tracker(Modality::Image) else {
            return;
        };
        let engine = self.ctx.engine();

        let tracked = engine.anchor_count(tracker) > self.target_index;
        if let Some(event) = self.visibility.observe(tracked) {
            self.hooks.fire(event);
        }

        if tracked {
            let camera_pose = self.ctx.camera_pose();
            let pose =
                engine.anchor_pose(tracker, self.target_index, &camera_pose, self.mirrored);
            let mut transform = host_from_native(&pose);
            transform.rotation = transform.rotation * orientation_offset(self.orientation);
            self.transform = transform;
        } else if !self.hold_last_pose_on_loss {
            self.transform = Transform::identity();
        }
    }

    /// Camera-relative transform; identity while the image is out of
    /// view.
    pub fn camera_relative_transform(&self) -> Transform {
        if self.phase != TargetPhase::Active {
            return Transform::identity();
        }
        let Some(tracker) = self.ctx.session.lock().tracker(Modality::Image) else {
            return Transform::identity();
        };
        let engine = self.ctx.engine();
        if engine.anchor_count(tracker) <= self.target_index {
            return Transform::identity();
        }
        let pose =
            engine.anchor_pose_camera_relative(tracker, self.target_index, self.mirrored);
        host_from_native(&pose)
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
            session.release_tracker(Modality::Image);
            self.acquired = false;
        }
        session.unregister_target(Modality::Image);
        self.phase = TargetPhase::Uninitialized;
    }
}

fn orientation_offset(orientation: PlaneOrientation) -> UnitQuaternion<f32> {
    match orientation {
        // Tip the anchor plane onto its back.
        PlaneOrientation::Flat => {
            UnitQuaternion::from_axis_angle(&Vector3::x_axis(), -std::f32::consts::FRAC_PI_2)
        }
        PlaneOrientation::Upright => UnitQuaternion::identity(),
    }
}

impl CameraListener for ImageTarget {
    fn on_pipeline_ready(&mut self, _pipeline: PipelineHandle) {
        if self.phase == TargetPhase::Active || self.disposed {
            return;
        }
        let mut session = self.ctx.session.lock();
        let tracker = match session.ensure_tracker(Modality::Image) {
            Ok(tracker) => {
                self.acquired = true;
                tracker
            }
            Err(err) => {
                error!(%err, "image tracking unavailable");
                self.init_error = Some(err);
                return;
            }
        };

        if !self.ctx.engine().image_target_load(tracker, &self.target_data) {
            error!("trained image target rejected by the engine");
            session.release_tracker(Modality::Image);
            self.acquired = false;
            self.init_error = Some(Error::ModelLoad(Modality::Image));
            return;
        }
        self.phase = TargetPhase::Active;
    }

    fn on_mirroring_changed(&mut self, mirrored: bool) {
        self.mirrored = mirrored;
    }
}

impl Drop for ImageTarget {
    fn drop(&mut self) {
        self.dispose();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use approx::assert_relative_eq;

    use super::*;
    use crate::engine::sim::{SimAnchor, SimEngine, TRAINED_TARGET_MAGIC};
    use crate::engine::TrackerHandle;
    use crate::geometry::Pose;
    use crate::session::CameraRig;

    fn descriptor() -> Vec<u8> {
        let mut data = TRAINED_TARGET_MAGIC.to_vec();
        data.extend_from_slice(b"descriptor body");
        data
    }

    fn started_session() -> (Arc<SimEngine>, Arc<SessionContext>, CameraRig) {
        let engine = Arc::new(SimEngine::new());
        let ctx = SessionContext::new(engine.clone());
        let rig = CameraRig::new(ctx.clone());
        (engine, ctx, rig)
    }

    fn image_tracker(ctx: &SessionContext) -> TrackerHandle {
        ctx.session.lock().tracker(Modality::Image).unwrap()
    }

    #[test]
    fn loads_descriptor_on_pipeline_ready() {
        let (engine, ctx, mut rig) = started_session();
        let target = ImageTarget::new(ctx, descriptor(), 0, PlaneOrientation::Upright);
        rig.start();

        assert!(target.lock().is_initialized());
        assert!(target.lock().preview_image().is_some());
        assert_eq!(engine.live_trackers(), 1);
    }

    #[test]
    fn rejected_descriptor_releases_tracker() {
        let (engine, ctx, mut rig) = started_session();
        let target = ImageTarget::new(ctx, b"garbage".to_vec(), 0, PlaneOrientation::Upright);
        rig.start();

        let target = target.lock();
        assert!(!target.is_initialized());
        assert!(matches!(
            target.initialization_error(),
            Some(Error::ModelLoad(Modality::Image))
        ));
        assert_eq!(engine.live_trackers(), 0);
        assert_eq!(engine.stale_operations(), 0);
    }

    #[test]
    fn visibility_edges_fire_once() {
        let (engine, ctx, mut rig) = started_session();
        let target = ImageTarget::new(ctx.clone(), descriptor(), 0, PlaneOrientation::Upright);
        rig.start();

        let seen = Arc::new(AtomicUsize::new(0));
        {
            let seen = seen.clone();
            target.lock().on_seen(move || {
                seen.fetch_add(1, Ordering::SeqCst);
            });
        }

        target.lock().update();
        assert_eq!(seen.load(Ordering::SeqCst), 0);

        let tracker = image_tracker(&ctx);
        engine.set_anchors(tracker, vec![SimAnchor::new(Pose::identity())]);
        target.lock().update();
        target.lock().update();
        assert_eq!(seen.load(Ordering::SeqCst), 1);
        assert!(target.lock().is_visible());
    }

    #[test]
    fn flat_orientation_tips_the_plane() {
        let (engine, ctx, mut rig) = started_session();
        let target = ImageTarget::new(ctx.clone(), descriptor(), 0, PlaneOrientation::Flat);
        rig.start();

        let tracker = image_tracker(&ctx);
        engine.set_anchors(tracker, vec![SimAnchor::new(Pose::identity())]);
        target.lock().update();

        let rotation = target.lock().transform().rotation;
        assert_relative_eq!(rotation.angle(), std::f32::consts::FRAC_PI_2, epsilon = 1e-5);
    }

    #[test]
    fn two_targets_share_one_tracker() {
        let (engine, ctx, mut rig) = started_session();
        let first = ImageTarget::new(ctx.clone(), descriptor(), 0, PlaneOrientation::Upright);
        let second = ImageTarget::new(ctx.clone(), descriptor(), 1, PlaneOrientation::Upright);
        rig.start();
        assert_eq!(engine.live_trackers(), 1);

        first.lock().dispose();
        assert_eq!(engine.live_trackers(), 1);
        second.lock().dispose();
        assert_eq!(engine.live_trackers(), 0);
    }
}
