//! Deterministic in-memory engine.
//!
//! Stands in for the native tracking library in tests and the demo
//! binary. Tracking output is scripted: the caller decides which anchors
//! each tracker reports via [`SimEngine::set_anchors`], and the engine
//! answers pose/coefficient queries from that script. All handle
//! lifetimes are checked; operations on stale handles are counted and
//! ignored so tests can assert the session layer never double-frees.

use std::collections::HashMap;

use nalgebra::{Perspective3, Vector3};
use parking_lot::Mutex;
use tracing::warn;

use crate::geometry::{Mat4, Pose};

use super::handle::HandleAllocator;
use super::{
    BufferHandle, Engine, FaceLandmarkHandle, FaceMeshHandle, InstantOrientation, MeshTopology,
    Modality, ModelSource, PipelineHandle, PreviewImage, TextureHandle, TrackerHandle, TrainOutput,
    NUM_EXPRESSION_COEFFICIENTS, NUM_IDENTITY_COEFFICIENTS,
};

/// Magic prefix of trained target descriptors produced by the simulator.
pub const TRAINED_TARGET_MAGIC: &[u8; 4] = b"ARTG";

const SIM_FOVY_DEG: f32 = 60.0;
const SIM_ZNEAR: f32 = 0.1;
const SIM_ZFAR: f32 = 100.0;

/// One scripted anchor reported by a simulated tracker.
#[derive(Debug, Clone)]
pub struct SimAnchor {
    /// Identity string reported for this anchor, if any.
    pub identity: Option<String>,
    /// Anchor pose relative to the camera.
    pub camera_relative: Pose,
    /// Scalar folded into the first expression coefficient.
    pub expression: f32,
}

impl SimAnchor {
    pub fn new(camera_relative: Pose) -> Self {
        Self {
            identity: None,
            camera_relative,
            expression: 0.0,
        }
    }

    pub fn identified(identity: impl Into<String>, camera_relative: Pose) -> Self {
        Self {
            identity: Some(identity.into()),
            camera_relative,
            expression: 0.0,
        }
    }

    pub fn with_expression(mut self, expression: f32) -> Self {
        self.expression = expression;
        self
    }
}

#[derive(Debug)]
struct TrackerState {
    modality: Modality,
    max_targets: usize,
    model_loaded: bool,
    target_data: Option<Vec<u8>>,
    anchors: Vec<SimAnchor>,
}

#[derive(Debug, Default)]
struct MeshState {
    topology_loaded: bool,
    expression: f32,
    mirrored: bool,
}

#[derive(Debug)]
struct LandmarkState {
    landmark: u32,
    expression: f32,
}

#[derive(Default)]
struct SimState {
    pipelines: HandleAllocator,
    trackers: HandleAllocator,
    tracker_state: HashMap<TrackerHandle, TrackerState>,
    meshes: HandleAllocator,
    mesh_state: HashMap<FaceMeshHandle, MeshState>,
    landmarks: HandleAllocator,
    landmark_state: HashMap<FaceLandmarkHandle, LandmarkState>,
    textures: HandleAllocator,
    pipeline_textures: HashMap<PipelineHandle, TextureHandle>,
    buffers: HandleAllocator,
    buffer_bytes: HashMap<BufferHandle, Vec<u8>>,
    fail_model_load: Vec<Modality>,
    fail_training: bool,
    stale_operations: usize,
}

impl SimState {
    fn tracker_mut(&mut self, tracker: TrackerHandle) -> Option<&mut TrackerState> {
        if !self.trackers.is_live(tracker.0) {
            self.stale_operations += 1;
            warn!(?tracker, "operation on stale tracker handle");
            return None;
        }
        self.tracker_state.get_mut(&tracker)
    }

    fn tracker(&mut self, tracker: TrackerHandle) -> Option<&TrackerState> {
        if !self.trackers.is_live(tracker.0) {
            self.stale_operations += 1;
            warn!(?tracker, "operation on stale tracker handle");
            return None;
        }
        self.tracker_state.get(&tracker)
    }

    fn anchor(&mut self, tracker: TrackerHandle, index: usize) -> Option<&SimAnchor> {
        let state = self.tracker(tracker)?;
        if index >= effective_count(state) {
            return None;
        }
        state.anchors.get(index)
    }
}

/// Anchors past the configured capacity are not reported.
fn effective_count(state: &TrackerState) -> usize {
    if state.max_targets == 0 {
        state.anchors.len()
    } else {
        state.anchors.len().min(state.max_targets)
    }
}

/// Horizontal mirror applied on both sides of a camera-relative pose.
fn mirrored_pose(pose: &Pose, mirrored: bool) -> Pose {
    if !mirrored {
        return *pose;
    }
    let flip = Mat4::from_diagonal(&nalgebra::Vector4::new(-1.0, 1.0, 1.0, 1.0));
    Pose(flip * pose.0 * flip)
}

/// Scripted stand-in for the native tracking engine.
pub struct SimEngine {
    state: Mutex<SimState>,
}

impl SimEngine {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SimState::default()),
        }
    }

    /// Replace the anchors a tracker reports from now on.
    pub fn set_anchors(&self, tracker: TrackerHandle, anchors: Vec<SimAnchor>) {
        let mut state = self.state.lock();
        if let Some(tracker) = state.tracker_mut(tracker) {
            tracker.anchors = anchors;
        }
    }

    /// Make model loading fail (or succeed again) for a modality.
    pub fn set_model_load_failure(&self, modality: Modality, fail: bool) {
        let mut state = self.state.lock();
        state.fail_model_load.retain(|m| *m != modality);
        if fail {
            state.fail_model_load.push(modality);
        }
    }

    pub fn set_training_failure(&self, fail: bool) {
        self.state.lock().fail_training = fail;
    }

    pub fn live_pipelines(&self) -> usize {
        self.state.lock().pipelines.live_count()
    }

    pub fn live_trackers(&self) -> usize {
        self.state.lock().trackers.live_count()
    }

    pub fn live_buffers(&self) -> usize {
        self.state.lock().buffers.live_count()
    }

    /// Number of operations attempted on stale handles so far.
    pub fn stale_operations(&self) -> usize {
        self.state.lock().stale_operations
    }

    /// Whether a tracker has a model (or trained target) loaded.
    pub fn model_loaded(&self, tracker: TrackerHandle) -> bool {
        let mut state = self.state.lock();
        state.tracker(tracker).is_some_and(|t| t.model_loaded)
    }
}

impl Default for SimEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl Engine for SimEngine {
    fn pipeline_create(&self) -> PipelineHandle {
        PipelineHandle(self.state.lock().pipelines.allocate())
    }

    fn pipeline_destroy(&self, pipeline: PipelineHandle) {
        let mut state = self.state.lock();
        if !state.pipelines.release(pipeline.0) {
            state.stale_operations += 1;
            warn!(?pipeline, "double destroy of pipeline handle");
            return;
        }
        if let Some(texture) = state.pipeline_textures.remove(&pipeline) {
            state.textures.release(texture.0);
        }
    }

    fn projection_matrix(&self, pipeline: PipelineHandle, width: u32, height: u32) -> Mat4 {
        let mut state = self.state.lock();
        if !state.pipelines.is_live(pipeline.0) {
            state.stale_operations += 1;
            return Mat4::identity();
        }
        let aspect = if height == 0 {
            1.0
        } else {
            width as f32 / height as f32
        };
        Perspective3::new(aspect, SIM_FOVY_DEG.to_radians(), SIM_ZNEAR, SIM_ZFAR).to_homogeneous()
    }

    fn frame_texture(&self, pipeline: PipelineHandle) -> Option<TextureHandle> {
        let mut state = self.state.lock();
        if !state.pipelines.is_live(pipeline.0) {
            state.stale_operations += 1;
            return None;
        }
        if let Some(texture) = state.pipeline_textures.get(&pipeline) {
            return Some(*texture);
        }
        let texture = TextureHandle(state.textures.allocate());
        state.pipeline_textures.insert(pipeline, texture);
        Some(texture)
    }

    fn frame_texture_matrix(
        &self,
        pipeline: PipelineHandle,
        _width: u32,
        _height: u32,
        mirrored: bool,
    ) -> Mat4 {
        let mut state = self.state.lock();
        if !state.pipelines.is_live(pipeline.0) {
            state.stale_operations += 1;
            return Mat4::identity();
        }
        let mut m = Mat4::identity();
        if mirrored {
            // Flip U and shift back into [0, 1].
            m[(0, 0)] = -1.0;
            m[(0, 3)] = 1.0;
        }
        m
    }

    fn tracker_create(&self, pipeline: PipelineHandle, modality: Modality) -> TrackerHandle {
        let mut state = self.state.lock();
        if !state.pipelines.is_live(pipeline.0) {
            state.stale_operations += 1;
            warn!(?pipeline, "tracker created against stale pipeline");
        }
        let tracker = TrackerHandle(state.trackers.allocate());
        state.tracker_state.insert(
            tracker,
            TrackerState {
                modality,
                max_targets: 0,
                model_loaded: false,
                target_data: None,
                anchors: Vec::new(),
            },
        );
        tracker
    }

    fn tracker_destroy(&self, tracker: TrackerHandle) {
        let mut state = self.state.lock();
        if state.trackers.release(tracker.0) {
            state.tracker_state.remove(&tracker);
        } else {
            state.stale_operations += 1;
            warn!(?tracker, "double destroy of tracker handle");
        }
    }

    fn tracker_set_max_targets(&self, tracker: TrackerHandle, count: usize) {
        let mut state = self.state.lock();
        if let Some(tracker) = state.tracker_mut(tracker) {
            tracker.max_targets = count;
        }
    }

    fn tracker_load_model(&self, tracker: TrackerHandle, model: ModelSource<'_>) -> bool {
        let mut state = self.state.lock();
        let failing = state
            .fail_model_load
            .iter()
            .any(|m| Some(*m) == state.tracker_state.get(&tracker).map(|t| t.modality));
        let Some(tracker) = state.tracker_mut(tracker) else {
            return false;
        };
        let ok = !failing
            && match model {
                ModelSource::Default => true,
                ModelSource::Memory(bytes) => !bytes.is_empty(),
            };
        tracker.model_loaded = ok;
        ok
    }

    fn anchor_count(&self, tracker: TrackerHandle) -> usize {
        let mut state = self.state.lock();
        state.tracker(tracker).map(effective_count).unwrap_or(0)
    }

    fn anchor_identity(&self, tracker: TrackerHandle, index: usize) -> Option<String> {
        let mut state = self.state.lock();
        state.anchor(tracker, index).and_then(|a| a.identity.clone())
    }

    fn anchor_pose(
        &self,
        tracker: TrackerHandle,
        index: usize,
        camera_pose: &Pose,
        mirrored: bool,
    ) -> Pose {
        let mut state = self.state.lock();
        match state.anchor(tracker, index) {
            Some(anchor) => camera_pose.compose(&mirrored_pose(&anchor.camera_relative, mirrored)),
            None => Pose::identity(),
        }
    }

    fn anchor_pose_camera_relative(
        &self,
        tracker: TrackerHandle,
        index: usize,
        mirrored: bool,
    ) -> Pose {
        let mut state = self.state.lock();
        match state.anchor(tracker, index) {
            Some(anchor) => mirrored_pose(&anchor.camera_relative, mirrored),
            None => Pose::identity(),
        }
    }

    fn image_target_load(&self, tracker: TrackerHandle, data: &[u8]) -> bool {
        let mut state = self.state.lock();
        let Some(tracker) = state.tracker_mut(tracker) else {
            return false;
        };
        if data.len() < TRAINED_TARGET_MAGIC.len() || !data.starts_with(TRAINED_TARGET_MAGIC) {
            return false;
        }
        tracker.target_data = Some(data.to_vec());
        tracker.model_loaded = true;
        true
    }

    fn image_target_preview_rgba(
        &self,
        tracker: TrackerHandle,
        _target: usize,
    ) -> Option<PreviewImage> {
        let mut state = self.state.lock();
        let data = state.tracker(tracker)?.target_data.as_ref()?;
        // Tiny deterministic preview derived from the descriptor bytes.
        let (width, height) = (4u32, 4u32);
        let rgba: Vec<u8> = data
            .iter()
            .cycle()
            .take((width * height * 4) as usize)
            .copied()
            .collect();
        Some(PreviewImage {
            width,
            height,
            rgba,
        })
    }

    fn instant_anchor_set_from_camera_offset(
        &self,
        tracker: TrackerHandle,
        offset: Vector3<f32>,
        _orientation: InstantOrientation,
    ) {
        let mut state = self.state.lock();
        if let Some(tracker) = state.tracker_mut(tracker) {
            let anchor = SimAnchor::new(Pose::from_translation(offset));
            tracker.anchors = vec![anchor];
        }
    }

    fn face_anchor_identity_coefficients(
        &self,
        tracker: TrackerHandle,
        index: usize,
        out: &mut [f32; NUM_IDENTITY_COEFFICIENTS],
    ) {
        let mut state = self.state.lock();
        out.fill(0.0);
        if state.anchor(tracker, index).is_some() {
            out[0] = 1.0 + index as f32;
        }
    }

    fn face_anchor_expression_coefficients(
        &self,
        tracker: TrackerHandle,
        index: usize,
        out: &mut [f32; NUM_EXPRESSION_COEFFICIENTS],
    ) {
        let mut state = self.state.lock();
        out.fill(0.0);
        if let Some(anchor) = state.anchor(tracker, index) {
            out[0] = anchor.expression;
        }
    }

    fn face_mesh_create(&self) -> FaceMeshHandle {
        let mut state = self.state.lock();
        let mesh = FaceMeshHandle(state.meshes.allocate());
        state.mesh_state.insert(mesh, MeshState::default());
        mesh
    }

    fn face_mesh_destroy(&self, mesh: FaceMeshHandle) {
        let mut state = self.state.lock();
        if state.meshes.release(mesh.0) {
            state.mesh_state.remove(&mesh);
        } else {
            state.stale_operations += 1;
            warn!(?mesh, "double destroy of face mesh handle");
        }
    }

    fn face_mesh_load_topology(&self, mesh: FaceMeshHandle, topology: MeshTopology<'_>) -> bool {
        let mut state = self.state.lock();
        if !state.meshes.is_live(mesh.0) {
            state.stale_operations += 1;
            return false;
        }
        let ok = match topology {
            MeshTopology::FullHeadSimplified(_) | MeshTopology::Face(_) => true,
            MeshTopology::Memory(bytes, _) => !bytes.is_empty(),
        };
        if ok {
            if let Some(mesh) = state.mesh_state.get_mut(&mesh) {
                mesh.topology_loaded = true;
            }
        }
        ok
    }

    fn face_mesh_update(
        &self,
        mesh: FaceMeshHandle,
        _identity: &[f32; NUM_IDENTITY_COEFFICIENTS],
        expression: &[f32; NUM_EXPRESSION_COEFFICIENTS],
        mirrored: bool,
    ) {
        let mut state = self.state.lock();
        if let Some(mesh) = state.mesh_state.get_mut(&mesh) {
            mesh.expression = expression[0];
            mesh.mirrored = mirrored;
        }
    }

    fn face_mesh_vertices(&self, mesh: FaceMeshHandle) -> Vec<f32> {
        let state = self.state.lock();
        let Some(mesh) = state.mesh_state.get(&mesh) else {
            return Vec::new();
        };
        if !mesh.topology_loaded {
            return Vec::new();
        }
        // Unit quad opened by the expression scalar; mirroring flips X.
        let s = 1.0 + 0.1 * mesh.expression;
        let x = if mesh.mirrored { -s } else { s };
        vec![
            -x, -s, 0.0, //
            x, -s, 0.0, //
            x, s, 0.0, //
            -x, s, 0.0,
        ]
    }

    fn face_mesh_normals(&self, mesh: FaceMeshHandle) -> Vec<f32> {
        let state = self.state.lock();
        match state.mesh_state.get(&mesh) {
            Some(mesh) if mesh.topology_loaded => {
                vec![0.0, 0.0, 1.0, 0.0, 0.0, 1.0, 0.0, 0.0, 1.0, 0.0, 0.0, 1.0]
            }
            _ => Vec::new(),
        }
    }

    fn face_mesh_uvs(&self, mesh: FaceMeshHandle) -> Vec<f32> {
        let state = self.state.lock();
        match state.mesh_state.get(&mesh) {
            Some(mesh) if mesh.topology_loaded => vec![0.0, 0.0, 1.0, 0.0, 1.0, 1.0, 0.0, 1.0],
            _ => Vec::new(),
        }
    }

    fn face_mesh_indices(&self, mesh: FaceMeshHandle) -> Vec<u32> {
        let state = self.state.lock();
        match state.mesh_state.get(&mesh) {
            Some(mesh) if mesh.topology_loaded => vec![0, 1, 2, 0, 2, 3],
            _ => Vec::new(),
        }
    }

    fn face_landmark_create(&self, landmark: u32) -> FaceLandmarkHandle {
        let mut state = self.state.lock();
        let handle = FaceLandmarkHandle(state.landmarks.allocate());
        state.landmark_state.insert(
            handle,
            LandmarkState {
                landmark,
                expression: 0.0,
            },
        );
        handle
    }

    fn face_landmark_destroy(&self, landmark: FaceLandmarkHandle) {
        let mut state = self.state.lock();
        if state.landmarks.release(landmark.0) {
            state.landmark_state.remove(&landmark);
        } else {
            state.stale_operations += 1;
            warn!(?landmark, "double destroy of face landmark handle");
        }
    }

    fn face_landmark_update(
        &self,
        landmark: FaceLandmarkHandle,
        _identity: &[f32; NUM_IDENTITY_COEFFICIENTS],
        expression: &[f32; NUM_EXPRESSION_COEFFICIENTS],
        _mirrored: bool,
    ) {
        let mut state = self.state.lock();
        if let Some(landmark) = state.landmark_state.get_mut(&landmark) {
            landmark.expression = expression[0];
        }
    }

    fn face_landmark_pose(&self, landmark: FaceLandmarkHandle) -> Pose {
        let state = self.state.lock();
        match state.landmark_state.get(&landmark) {
            Some(landmark) => Pose::from_translation(Vector3::new(
                0.01 * landmark.landmark as f32,
                0.05 * landmark.expression,
                0.0,
            )),
            None => Pose::identity(),
        }
    }

    fn train_image_target(
        &self,
        source: &[u8],
        source_is_jpeg: bool,
        max_width: u32,
        max_height: u32,
        want_preview: bool,
    ) -> Option<TrainOutput> {
        let mut state = self.state.lock();
        if state.fail_training || source.is_empty() {
            return None;
        }

        let mut descriptor = Vec::with_capacity(32 + source.len().min(32));
        descriptor.extend_from_slice(TRAINED_TARGET_MAGIC);
        descriptor.push(source_is_jpeg as u8);
        descriptor.extend_from_slice(&max_width.to_le_bytes());
        descriptor.extend_from_slice(&max_height.to_le_bytes());
        descriptor.extend_from_slice(&(source.len() as u32).to_le_bytes());
        descriptor.extend_from_slice(&source[..source.len().min(32)]);

        let target = BufferHandle(state.buffers.allocate());
        state.buffer_bytes.insert(target, descriptor);

        let preview = want_preview.then(|| {
            let handle = BufferHandle(state.buffers.allocate());
            state.buffer_bytes.insert(handle, source.to_vec());
            handle
        });

        Some(TrainOutput { target, preview })
    }

    fn buffer_bytes(&self, buffer: BufferHandle) -> Vec<u8> {
        let mut state = self.state.lock();
        if !state.buffers.is_live(buffer.0) {
            state.stale_operations += 1;
            warn!(?buffer, "read of released buffer");
            return Vec::new();
        }
        state.buffer_bytes.get(&buffer).cloned().unwrap_or_default()
    }

    fn buffer_release(&self, buffer: BufferHandle) {
        let mut state = self.state.lock();
        if state.buffers.release(buffer.0) {
            state.buffer_bytes.remove(&buffer);
        } else {
            state.stale_operations += 1;
            warn!(?buffer, "double release of buffer");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine_with_tracker(modality: Modality) -> (SimEngine, TrackerHandle) {
        let engine = SimEngine::new();
        let pipeline = engine.pipeline_create();
        let tracker = engine.tracker_create(pipeline, modality);
        (engine, tracker)
    }

    #[test]
    fn anchor_count_respects_capacity() {
        let (engine, tracker) = engine_with_tracker(Modality::Face);
        engine.tracker_set_max_targets(tracker, 2);
        engine.set_anchors(
            tracker,
            vec![
                SimAnchor::new(Pose::identity()),
                SimAnchor::new(Pose::identity()),
                SimAnchor::new(Pose::identity()),
            ],
        );
        assert_eq!(engine.anchor_count(tracker), 2);
    }

    #[test]
    fn stale_tracker_reports_nothing() {
        let (engine, tracker) = engine_with_tracker(Modality::Face);
        engine.set_anchors(tracker, vec![SimAnchor::new(Pose::identity())]);
        engine.tracker_destroy(tracker);
        assert_eq!(engine.anchor_count(tracker), 0);
        assert!(engine.stale_operations() > 0);
    }

    #[test]
    fn double_tracker_destroy_is_counted_not_fatal() {
        let (engine, tracker) = engine_with_tracker(Modality::Image);
        engine.tracker_destroy(tracker);
        engine.tracker_destroy(tracker);
        assert_eq!(engine.live_trackers(), 0);
        assert_eq!(engine.stale_operations(), 1);
    }

    #[test]
    fn training_produces_released_buffers() {
        let engine = SimEngine::new();
        let out = engine
            .train_image_target(b"source image", false, 512, 512, true)
            .unwrap();
        let target = engine.buffer_bytes(out.target);
        assert!(target.starts_with(TRAINED_TARGET_MAGIC));
        assert_eq!(engine.live_buffers(), 2);

        engine.buffer_release(out.target);
        engine.buffer_release(out.preview.unwrap());
        assert_eq!(engine.live_buffers(), 0);
    }

    #[test]
    fn trained_descriptor_loads_into_image_tracker() {
        let (engine, tracker) = engine_with_tracker(Modality::Image);
        let out = engine
            .train_image_target(b"source image", true, 256, 256, false)
            .unwrap();
        let descriptor = engine.buffer_bytes(out.target);
        engine.buffer_release(out.target);

        assert!(engine.image_target_load(tracker, &descriptor));
        assert!(engine.image_target_preview_rgba(tracker, 0).is_some());
        assert!(!engine.image_target_load(tracker, b"not a descriptor"));
    }

    #[test]
    fn mirrored_camera_relative_pose_flips_x() {
        let (engine, tracker) = engine_with_tracker(Modality::Face);
        engine.set_anchors(
            tracker,
            vec![SimAnchor::new(Pose::from_translation(Vector3::new(
                1.0, 2.0, 3.0,
            )))],
        );
        let plain = engine.anchor_pose_camera_relative(tracker, 0, false);
        let mirrored = engine.anchor_pose_camera_relative(tracker, 0, true);
        assert_eq!(plain.translation().x, 1.0);
        assert_eq!(mirrored.translation().x, -1.0);
        assert_eq!(mirrored.translation().y, 2.0);
    }
}
