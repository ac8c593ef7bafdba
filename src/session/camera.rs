//! Camera-side session driver.
//!
//! The rig owns session startup: it creates the pipeline and announces
//! it (plus the mirroring state) through the broadcaster before any
//! target computes a pose. It also surfaces the per-frame data the host
//! needs to draw the camera background.

use std::sync::Arc;

use tracing::info;

use crate::engine::{Engine, TextureHandle};
use crate::geometry::{Mat4, Pose};

use super::SessionContext;

/// Everything the host needs to render the camera image behind the
/// scene for one frame.
#[derive(Debug, Clone)]
pub struct BackgroundFrame {
    /// Projection matrix matching the camera intrinsics.
    pub projection: Mat4,
    /// Sampling transform for the camera texture, mirror-aware.
    pub texture_matrix: Mat4,
    /// Current camera frame texture, absent until the first frame.
    pub texture: Option<TextureHandle>,
}

pub struct CameraRig {
    ctx: Arc<SessionContext>,
    mirrored: bool,
    started: bool,
}

impl CameraRig {
    pub fn new(ctx: Arc<SessionContext>) -> Self {
        Self {
            ctx,
            mirrored: false,
            started: false,
        }
    }

    /// Rig for a user-facing camera, which delivers mirrored input.
    pub fn user_facing(ctx: Arc<SessionContext>) -> Self {
        Self {
            ctx,
            mirrored: true,
            started: false,
        }
    }

    /// Create the pipeline and announce it to all registered listeners.
    /// Listeners registered before this call are initialized here, in
    /// registration order; later registrants are initialized on
    /// subscription. Calling again is a no-op.
    pub fn start(&mut self) {
        if self.started {
            return;
        }
        let pipeline = self.ctx.session.lock().ensure_pipeline();
        info!(?pipeline, mirrored = self.mirrored, "camera session starting");
        self.ctx.broadcaster.publish(pipeline, self.mirrored);
        self.started = true;
    }

    pub fn is_mirrored(&self) -> bool {
        self.mirrored
    }

    /// Switch mirroring, e.g. when the user swaps between front and
    /// rear cameras. Broadcast to listeners once started.
    pub fn set_mirrored(&mut self, mirrored: bool) {
        self.mirrored = mirrored;
        if self.started {
            self.ctx.broadcaster.set_mirrored(mirrored);
        }
    }

    /// Publish this frame's camera pose for target pose computation.
    pub fn set_pose(&mut self, pose: Pose) {
        self.ctx.set_camera_pose(pose);
    }

    pub fn pose(&self) -> Pose {
        self.ctx.camera_pose()
    }

    /// Per-frame background rendering data for the given viewport.
    /// `None` until the session has started.
    pub fn background_frame(&self, width: u32, height: u32) -> Option<BackgroundFrame> {
        let pipeline = self.ctx.session.lock().pipeline()?;
        let engine = self.ctx.engine();
        Some(BackgroundFrame {
            projection: engine.projection_matrix(pipeline, width, height),
            texture_matrix: engine.frame_texture_matrix(pipeline, width, height, self.mirrored),
            texture: engine.frame_texture(pipeline),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::sim::SimEngine;

    #[test]
    fn start_publishes_pipeline_once() {
        let engine = Arc::new(SimEngine::new());
        let ctx = SessionContext::new(engine.clone());
        let mut rig = CameraRig::new(ctx.clone());

        assert!(ctx.broadcaster.state().is_none());
        rig.start();
        rig.start();

        let state = ctx.broadcaster.state().unwrap();
        assert!(!state.mirrored);
        assert_eq!(engine.live_pipelines(), 1);
    }

    #[test]
    fn background_frame_requires_started_session() {
        let engine = Arc::new(SimEngine::new());
        let ctx = SessionContext::new(engine);
        let mut rig = CameraRig::user_facing(ctx);

        assert!(rig.background_frame(1280, 720).is_none());
        rig.start();

        let frame = rig.background_frame(1280, 720).unwrap();
        assert!(frame.texture.is_some());
        // Mirrored rig flips the texture U axis.
        assert_eq!(frame.texture_matrix[(0, 0)], -1.0);
        assert_ne!(frame.projection, Mat4::identity());
    }
}
