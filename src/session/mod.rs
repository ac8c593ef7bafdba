//! Session-scoped shared state and lifecycle.
//!
//! `SessionContext` replaces the process-wide globals a naive port would
//! use: every component receives the context at construction, and all of
//! it (broadcaster listeners, tracker refcounts, camera pose) dies with
//! the session. Restarting a session or running tests in parallel can
//! therefore never observe another session's state.

pub mod broadcaster;
pub mod camera;
pub mod tracking_session;

pub use broadcaster::{
    CameraListener, ListenerId, MirroringBroadcaster, MirroringState, SharedListener,
};
pub use camera::{BackgroundFrame, CameraRig};
pub use tracking_session::TrackingSession;

use std::sync::Arc;

use parking_lot::Mutex;

use crate::engine::Engine;
use crate::geometry::Pose;

/// Shared state for one tracking session. All mutation happens on the
/// host's update thread; the locks exist for shared ownership, not for
/// cross-thread contention.
pub struct SessionContext {
    engine: Arc<dyn Engine>,
    pub session: Mutex<TrackingSession>,
    pub broadcaster: MirroringBroadcaster,
    camera_pose: Mutex<Pose>,
}

impl SessionContext {
    pub fn new(engine: Arc<dyn Engine>) -> Arc<Self> {
        Arc::new(Self {
            session: Mutex::new(TrackingSession::new(engine.clone())),
            broadcaster: MirroringBroadcaster::new(),
            camera_pose: Mutex::new(Pose::identity()),
            engine,
        })
    }

    pub fn engine(&self) -> &Arc<dyn Engine> {
        &self.engine
    }

    /// Camera pose for the current frame, as last set by the camera rig.
    pub fn camera_pose(&self) -> Pose {
        *self.camera_pose.lock()
    }

    pub fn set_camera_pose(&self, pose: Pose) {
        *self.camera_pose.lock() = pose;
    }
}
