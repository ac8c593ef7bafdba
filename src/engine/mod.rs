//! Interface to the native tracking engine.
//!
//! The engine does the computationally hard work: camera pose solving,
//! face landmark and mesh inference, image target matching and image
//! target training. This crate only orchestrates it, so the whole
//! surface is expressed as the [`Engine`] trait over opaque handles. A
//! production build backs the trait with FFI into the native library;
//! tests and the demo binary use the deterministic [`sim::SimEngine`].
//!
//! Handles returned by the engine are owned by the caller and must be
//! destroyed through the matching `*_destroy` / release call. The
//! session layer (`crate::session`) wraps that ownership so the rest of
//! the crate never touches raw handles directly.

pub mod handle;
pub mod sim;

use std::fmt;

use nalgebra::Vector3;

pub use handle::{
    BufferHandle, FaceLandmarkHandle, FaceMeshHandle, PipelineHandle, TextureHandle, TrackerHandle,
};

use crate::geometry::{Mat4, Pose};

/// Number of identity-shape coefficients the face model solves for.
pub const NUM_IDENTITY_COEFFICIENTS: usize = 50;

/// Number of expression coefficients the face model solves for.
pub const NUM_EXPRESSION_COEFFICIENTS: usize = 29;

/// The tracking modalities the engine supports. One tracker instance
/// exists per modality per pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Modality {
    Face,
    Image,
    Instant,
}

impl fmt::Display for Modality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Modality::Face => write!(f, "face"),
            Modality::Image => write!(f, "image"),
            Modality::Instant => write!(f, "instant"),
        }
    }
}

/// Where a tracking model is sourced from.
#[derive(Debug, Clone, Copy)]
pub enum ModelSource<'a> {
    /// The model bundled with the engine for this modality.
    Default,
    /// Raw model bytes supplied by the caller.
    Memory(&'a [u8]),
}

/// Orientation convention for instant-tracker anchor placement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstantOrientation {
    MinusZAwayFromUser,
    MinusZTowardsUser,
}

/// Which face regions the mesh topology fills with geometry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MeshFill {
    pub mouth: bool,
    pub eye_left: bool,
    pub eye_right: bool,
    pub neck: bool,
}

/// Face mesh topology variants.
#[derive(Debug, Clone, Copy)]
pub enum MeshTopology<'a> {
    /// Simplified full-head model bundled with the engine.
    FullHeadSimplified(MeshFill),
    /// Face-only model bundled with the engine.
    Face(MeshFill),
    /// Topology bytes supplied by the caller.
    Memory(&'a [u8], MeshFill),
}

/// Decoded RGBA preview of a trained image target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreviewImage {
    pub width: u32,
    pub height: u32,
    pub rgba: Vec<u8>,
}

/// Raw trainer output. Both buffers stay owned by the engine until
/// released with [`Engine::buffer_release`].
#[derive(Debug, Clone, Copy)]
pub struct TrainOutput {
    pub target: BufferHandle,
    pub preview: Option<BufferHandle>,
}

/// Capability surface of the native tracking engine.
///
/// All methods are synchronous and expected to be called from the
/// per-frame update thread. Boolean returns mirror the engine's success
/// flags; callers map them onto the crate error taxonomy.
pub trait Engine: Send + Sync {
    // --- Pipeline ---

    fn pipeline_create(&self) -> PipelineHandle;
    fn pipeline_destroy(&self, pipeline: PipelineHandle);

    /// Projection matrix matching the camera intrinsics for the given
    /// viewport size.
    fn projection_matrix(&self, pipeline: PipelineHandle, width: u32, height: u32) -> Mat4;

    /// Current camera frame texture, if a frame has been processed.
    fn frame_texture(&self, pipeline: PipelineHandle) -> Option<TextureHandle>;

    /// Sampling transform for the camera frame texture.
    fn frame_texture_matrix(
        &self,
        pipeline: PipelineHandle,
        width: u32,
        height: u32,
        mirrored: bool,
    ) -> Mat4;

    // --- Trackers ---

    fn tracker_create(&self, pipeline: PipelineHandle, modality: Modality) -> TrackerHandle;
    fn tracker_destroy(&self, tracker: TrackerHandle);

    /// Upper bound on concurrently tracked anchors. Must be set before
    /// the tracker processes its first frame.
    fn tracker_set_max_targets(&self, tracker: TrackerHandle, count: usize);

    /// Load the tracking model. Returns false on failure, leaving the
    /// tracker unusable.
    fn tracker_load_model(&self, tracker: TrackerHandle, model: ModelSource<'_>) -> bool;

    /// Number of anchors the tracker reported this frame.
    fn anchor_count(&self, tracker: TrackerHandle) -> usize;

    /// Stable identity string of the anchor at `index`, if the engine
    /// assigned one. Indices are only meaningful within the current
    /// frame.
    fn anchor_identity(&self, tracker: TrackerHandle, index: usize) -> Option<String>;

    /// World pose of the anchor at `index`, given the current camera
    /// pose and mirroring state.
    fn anchor_pose(
        &self,
        tracker: TrackerHandle,
        index: usize,
        camera_pose: &Pose,
        mirrored: bool,
    ) -> Pose;

    /// Pose of the anchor at `index` relative to the camera.
    fn anchor_pose_camera_relative(
        &self,
        tracker: TrackerHandle,
        index: usize,
        mirrored: bool,
    ) -> Pose;

    // --- Image targets ---

    /// Load a trained target descriptor into an image tracker. Returns
    /// false if the descriptor is rejected.
    fn image_target_load(&self, tracker: TrackerHandle, data: &[u8]) -> bool;

    /// Decoded preview embedded in the trained target, if present.
    fn image_target_preview_rgba(&self, tracker: TrackerHandle, target: usize)
        -> Option<PreviewImage>;

    // --- Instant world tracking ---

    /// Re-anchor the instant tracker at a fixed offset from the camera.
    fn instant_anchor_set_from_camera_offset(
        &self,
        tracker: TrackerHandle,
        offset: Vector3<f32>,
        orientation: InstantOrientation,
    );

    // --- Face coefficients ---

    fn face_anchor_identity_coefficients(
        &self,
        tracker: TrackerHandle,
        index: usize,
        out: &mut [f32; NUM_IDENTITY_COEFFICIENTS],
    );

    fn face_anchor_expression_coefficients(
        &self,
        tracker: TrackerHandle,
        index: usize,
        out: &mut [f32; NUM_EXPRESSION_COEFFICIENTS],
    );

    // --- Face mesh ---

    fn face_mesh_create(&self) -> FaceMeshHandle;
    fn face_mesh_destroy(&self, mesh: FaceMeshHandle);

    /// Load a mesh topology. Returns false if the topology is rejected.
    fn face_mesh_load_topology(&self, mesh: FaceMeshHandle, topology: MeshTopology<'_>) -> bool;

    /// Re-solve the mesh for the given coefficients.
    fn face_mesh_update(
        &self,
        mesh: FaceMeshHandle,
        identity: &[f32; NUM_IDENTITY_COEFFICIENTS],
        expression: &[f32; NUM_EXPRESSION_COEFFICIENTS],
        mirrored: bool,
    );

    /// Flat `[x, y, z, ...]` vertex positions in engine convention.
    fn face_mesh_vertices(&self, mesh: FaceMeshHandle) -> Vec<f32>;

    /// Flat `[x, y, z, ...]` vertex normals in engine convention.
    fn face_mesh_normals(&self, mesh: FaceMeshHandle) -> Vec<f32>;

    /// Flat `[u, v, ...]` texture coordinates. Fixed per topology.
    fn face_mesh_uvs(&self, mesh: FaceMeshHandle) -> Vec<f32>;

    /// Triangle indices. Fixed per topology.
    fn face_mesh_indices(&self, mesh: FaceMeshHandle) -> Vec<u32>;

    // --- Face landmarks ---

    fn face_landmark_create(&self, landmark: u32) -> FaceLandmarkHandle;
    fn face_landmark_destroy(&self, landmark: FaceLandmarkHandle);

    fn face_landmark_update(
        &self,
        landmark: FaceLandmarkHandle,
        identity: &[f32; NUM_IDENTITY_COEFFICIENTS],
        expression: &[f32; NUM_EXPRESSION_COEFFICIENTS],
        mirrored: bool,
    );

    /// Landmark pose relative to the face anchor.
    fn face_landmark_pose(&self, landmark: FaceLandmarkHandle) -> Pose;

    // --- Image training ---

    /// Train an image target from raw source bytes. `None` means the
    /// trainer rejected the image. On success the returned buffers must
    /// each be released exactly once.
    fn train_image_target(
        &self,
        source: &[u8],
        source_is_jpeg: bool,
        max_width: u32,
        max_height: u32,
        want_preview: bool,
    ) -> Option<TrainOutput>;

    /// Copy out the contents of an engine-owned buffer.
    fn buffer_bytes(&self, buffer: BufferHandle) -> Vec<u8>;

    /// Release an engine-owned buffer. Releasing twice is reported by
    /// the engine but must not corrupt state.
    fn buffer_release(&self, buffer: BufferHandle);
}
