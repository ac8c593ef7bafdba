//! Face tracking targets.
//!
//! A `FaceTrackingGroup` owns the face tracker (through the session's
//! reference counting) and any number of `FaceAnchor` logical targets,
//! one per face the app wants to follow concurrently. Each tick the
//! group reconciles the tracker's reported anchors to its logical
//! targets by stable identity, then publishes a pose and visibility
//! edges per anchor.
//!
//! The group initializes lazily: it subscribes to the camera broadcaster
//! at construction and acquires its tracker references on the
//! pipeline-ready notification. Tracker capacity is sized from the
//! anchors declared at that moment, so anchors must be added before the
//! camera starts.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{error, warn};

use crate::engine::{Engine, Modality, PipelineHandle, TrackerHandle};
use crate::error::Error;
use crate::geometry::{host_from_native, Pose, Transform};
use crate::session::{CameraListener, ListenerId, SessionContext, SharedListener};

use super::registry::MultiTargetRegistry;
use super::{TargetPhase, Visibility, VisibilityHooks};

/// Per-tick view of one tracked anchor, consumed by the face mesh and
/// landmark components. Valid for the current tick only; the index may
/// move or disappear on the next one.
#[derive(Debug, Clone, Copy)]
pub struct AnchorSnapshot {
    pub tracker: TrackerHandle,
    pub index: usize,
    pub mirrored: bool,
}

/// One logical face slot within a group.
pub struct FaceAnchor {
    identity: u32,
    visibility: Visibility,
    hooks: VisibilityHooks,
    transform: Transform,
    hold_last_pose_on_loss: bool,
}

impl FaceAnchor {
    fn new(identity: u32) -> Self {
        Self {
            identity,
            visibility: Visibility::default(),
            hooks: VisibilityHooks::default(),
            transform: Transform::identity(),
            // Losing a face briefly should not snap attached content to
            // the origin, so the last pose is kept by default.
            hold_last_pose_on_loss: true,
        }
    }

    pub fn identity(&self) -> u32 {
        self.identity
    }

    pub fn is_visible(&self) -> bool {
        self.visibility.is_visible()
    }

    /// Transform last published for this anchor. While untracked it
    /// keeps the final tracked pose unless `hold_last_pose_on_loss` is
    /// off.
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

    fn tick(
        &mut self,
        engine: &dyn Engine,
        tracker: TrackerHandle,
        resolved: Option<usize>,
        camera_pose: &Pose,
        mirrored: bool,
    ) {
        match resolved {
            Some(index) => {
                if let Some(event) = self.visibility.observe(true) {
                    self.hooks.fire(event);
                }
                let pose = engine.anchor_pose(tracker, index, camera_pose, mirrored);
                self.transform = host_from_native(&pose);
            }
            None => {
                if let Some(event) = self.visibility.observe(false) {
                    self.hooks.fire(event);
                }
                if !self.hold_last_pose_on_loss {
                    self.transform = Transform::identity();
                }
            }
        }
    }
}

/// Shared face tracker plus its logical targets.
pub struct FaceTrackingGroup {
    ctx: Arc<SessionContext>,
    anchors: Vec<FaceAnchor>,
    registry: MultiTargetRegistry,
    phase: TargetPhase,
    mirrored: bool,
    listener_id: Option<ListenerId>,
    /// Tracker references held with the session, released at disposal.
    acquired: usize,
    init_error: Option<Error>,
    disposed: bool,
}

impl FaceTrackingGroup {
    /// Create a group with one anchor per identity and register it with
    /// the camera broadcaster. If the pipeline is already published the
    /// group initializes synchronously before this returns.
    pub fn new(ctx: Arc<SessionContext>, identities: &[u32]) -> Arc<Mutex<Self>> {
        let mut registry = MultiTargetRegistry::new();
        let mut anchors = Vec::with_capacity(identities.len());
        {
            let mut session = ctx.session.lock();
            for &identity in identities {
                session.register_target(Modality::Face);
                registry.register(identity);
                anchors.push(FaceAnchor::new(identity));
            }
        }

        let group = Arc::new(Mutex::new(Self {
            ctx: ctx.clone(),
            anchors,
            registry,
            phase: TargetPhase::Uninitialized,
            mirrored: false,
            listener_id: None,
            acquired: 0,
            init_error: None,
            disposed: false,
        }));

        let listener: SharedListener = group.clone();
        let id = ctx.broadcaster.subscribe(&listener);
        group.lock().listener_id = Some(id);
        group
    }

    pub fn is_initialized(&self) -> bool {
        self.phase == TargetPhase::Active
    }

    pub fn is_mirrored(&self) -> bool {
        self.mirrored
    }

    /// Error from the initialization attempt, if it failed. The group
    /// stays uninitialized until the app addresses the cause and
    /// re-creates it.
    pub fn initialization_error(&self) -> Option<&Error> {
        self.init_error.as_ref()
    }

    pub fn anchors(&self) -> &[FaceAnchor] {
        &self.anchors
    }

    pub fn anchor(&self, identity: u32) -> Option<&FaceAnchor> {
        self.anchors.iter().find(|a| a.identity == identity)
    }

    pub fn anchor_mut(&mut self, identity: u32) -> Option<&mut FaceAnchor> {
        self.anchors.iter_mut().find(|a| a.identity == identity)
    }

    /// Declare one more face slot. Only possible before initialization:
    /// tracker capacity is fixed at creation and changing it afterwards
    /// requires recreating the tracker.
    pub fn add_anchor(&mut self, identity: u32) -> bool {
        if self.phase == TargetPhase::Active {
            warn!(identity, "face anchors cannot be added after tracker creation");
            return false;
        }
        if self.anchors.iter().any(|a| a.identity == identity) {
            warn!(identity, "duplicate face anchor identity");
            return false;
        }
        self.ctx.session.lock().register_target(Modality::Face);
        self.registry.register(identity);
        self.anchors.push(FaceAnchor::new(identity));
        true
    }

    /// Remove a declared face slot before initialization.
    pub fn remove_anchor(&mut self, identity: u32) -> bool {
        if self.phase == TargetPhase::Active {
            warn!(identity, "face anchors cannot be removed after tracker creation");
            return false;
        }
        let before = self.anchors.len();
        self.anchors.retain(|a| a.identity != identity);
        if self.anchors.len() == before {
            return false;
        }
        self.registry.unregister(identity);
        self.ctx.session.lock().unregister_target(Modality::Face);
        true
    }

    /// Per-frame update: reconcile anchors, then publish poses and
    /// visibility edges. Reconciliation for the tick completes before
    /// any anchor's pose is read.
    pub fn update(&mut self) {
        if self.phase != TargetPhase::Active {
            return;
        }
        let Some(tracker) = self.ctx.session.lock().tracker(Modality::Face) else {
            return;
        };
        let engine = self.ctx.engine().clone();
        self.registry.reconcile(engine.as_ref(), tracker);

        let camera_pose = self.ctx.camera_pose();
        for anchor in &mut self.anchors {
            let resolved = self.registry.resolved(anchor.identity);
            anchor.tick(engine.as_ref(), tracker, resolved, &camera_pose, self.mirrored);
        }
    }

    /// Camera-relative transform of an anchor; identity while the
    /// anchor is untracked.
    pub fn camera_relative_transform(&self, identity: u32) -> Transform {
        match self.anchor_snapshot(identity) {
            Some(snapshot) => {
                let pose = self.ctx.engine().anchor_pose_camera_relative(
                    snapshot.tracker,
                    snapshot.index,
                    snapshot.mirrored,
                );
                host_from_native(&pose)
            }
            None => Transform::identity(),
        }
    }

    /// Current-tick view of a tracked anchor, or `None` while the
    /// target is uninitialized or the face is out of view.
    pub fn anchor_snapshot(&self, identity: u32) -> Option<AnchorSnapshot> {
        if self.phase != TargetPhase::Active {
            return None;
        }
        let tracker = self.ctx.session.lock().tracker(Modality::Face)?;
        let index = self.registry.resolved(identity)?;
        Some(AnchorSnapshot {
            tracker,
            index,
            mirrored: self.mirrored,
        })
    }

    /// Unregister from the camera and release the tracker references.
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
        for _ in 0..self.acquired {
            session.release_tracker(Modality::Face);
        }
        self.acquired = 0;
        for _ in 0..self.anchors.len() {
            session.unregister_target(Modality::Face);
        }
        self.phase = TargetPhase::Uninitialized;
    }
}

impl CameraListener for FaceTrackingGroup {
    fn on_pipeline_ready(&mut self, _pipeline: PipelineHandle) {
        if self.phase == TargetPhase::Active || self.disposed {
            return;
        }
        let mut session = self.ctx.session.lock();
        for _ in 0..self.anchors.len() {
            match session.ensure_tracker(Modality::Face) {
                Ok(_) => self.acquired += 1,
                Err(err) => {
                    // Only tracker creation can fail, so no references
                    // were acquired before this point.
                    error!(%err, "face tracking unavailable");
                    self.init_error = Some(err);
                    return;
                }
            }
        }
        self.phase = TargetPhase::Active;
    }

    fn on_mirroring_changed(&mut self, mirrored: bool) {
        self.mirrored = mirrored;
    }
}

impl Drop for FaceTrackingGroup {
    fn drop(&mut self) {
        self.dispose();
    }
}
