//! Deformable face mesh driven by a tracked face anchor.
//!
//! The native engine solves the mesh from the anchor's identity and
//! expression coefficients; this component feeds it those coefficients
//! each frame and copies the solved buffers out in host convention.
//! Topology (indices, UVs) is fixed per variant and fetched once;
//! vertices and normals change every solve. While the face is out of
//! view the mesh keeps its last solved shape; before the first sighting
//! it shows the neutral zero-coefficient shape.

use std::sync::Arc;

use nalgebra::Vector3;
use parking_lot::Mutex;

use crate::engine::{
    Engine, FaceMeshHandle, MeshFill, MeshTopology, NUM_EXPRESSION_COEFFICIENTS,
    NUM_IDENTITY_COEFFICIENTS,
};
use crate::error::{Error, Result};
use crate::session::SessionContext;
use crate::targets::FaceTrackingGroup;

/// Which bundled topology the mesh loads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TopologyVariant {
    #[default]
    FullHeadSimplified,
    FaceOnly,
}

/// Host-convention mesh buffers ready for upload.
#[derive(Debug, Clone, Default)]
pub struct MeshData {
    pub vertices: Vec<Vector3<f32>>,
    pub normals: Vec<Vector3<f32>>,
    pub uvs: Vec<[f32; 2]>,
    pub indices: Vec<u32>,
}

pub struct FaceMesh {
    ctx: Arc<SessionContext>,
    group: Arc<Mutex<FaceTrackingGroup>>,
    face_identity: u32,
    variant: TopologyVariant,
    fill: MeshFill,
    handle: Option<FaceMeshHandle>,
    identity: [f32; NUM_IDENTITY_COEFFICIENTS],
    expression: [f32; NUM_EXPRESSION_COEFFICIENTS],
    mesh: MeshData,
    static_data_loaded: bool,
    last_mirrored: Option<bool>,
}

impl FaceMesh {
    pub fn new(
        ctx: Arc<SessionContext>,
        group: Arc<Mutex<FaceTrackingGroup>>,
        face_identity: u32,
        variant: TopologyVariant,
        fill: MeshFill,
    ) -> Self {
        Self {
            ctx,
            group,
            face_identity,
            variant,
            fill,
            handle: None,
            identity: [0.0; NUM_IDENTITY_COEFFICIENTS],
            expression: [0.0; NUM_EXPRESSION_COEFFICIENTS],
            mesh: MeshData::default(),
            static_data_loaded: false,
            last_mirrored: None,
        }
    }

    pub fn mesh(&self) -> &MeshData {
        &self.mesh
    }

    pub fn is_created(&self) -> bool {
        self.handle.is_some()
    }

    /// Per-frame update. Lazily creates the native mesh once face
    /// tracking is up, then re-solves it from the anchor's current
    /// coefficients.
    pub fn update(&mut self) -> Result<()> {
        let (initialized, mirrored, snapshot) = {
            let group = self.group.lock();
            (
                group.is_initialized(),
                group.is_mirrored(),
                group.anchor_snapshot(self.face_identity),
            )
        };
        if !initialized {
            return Ok(());
        }

        let engine = self.ctx.engine().clone();

        let handle = match self.handle {
            Some(handle) => handle,
            None => {
                let handle = engine.face_mesh_create();
                let topology = match self.variant {
                    TopologyVariant::FullHeadSimplified => {
                        MeshTopology::FullHeadSimplified(self.fill)
                    }
                    TopologyVariant::FaceOnly => MeshTopology::Face(self.fill),
                };
                if !engine.face_mesh_load_topology(handle, topology) {
                    engine.face_mesh_destroy(handle);
                    return Err(Error::MeshTopologyLoad);
                }
                self.handle = Some(handle);
                handle
            }
        };

        // Mirroring changes invalidate the fetched topology data and
        // the neutral shape.
        if self.last_mirrored != Some(mirrored) {
            self.last_mirrored = Some(mirrored);
            self.static_data_loaded = false;
            self.identity = [0.0; NUM_IDENTITY_COEFFICIENTS];
            self.expression = [0.0; NUM_EXPRESSION_COEFFICIENTS];
        }

        match snapshot {
            Some(snapshot) => {
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
            // Untracked: keep the last solved shape once one exists.
            None if self.static_data_loaded => return Ok(()),
            None => {}
        }

        engine.face_mesh_update(handle, &self.identity, &self.expression, mirrored);

        self.mesh.vertices = to_host_vec3(&engine.face_mesh_vertices(handle));
        self.mesh.normals = to_host_vec3(&engine.face_mesh_normals(handle));

        if !self.static_data_loaded {
            self.mesh.indices = engine.face_mesh_indices(handle);
            self.mesh.uvs = engine
                .face_mesh_uvs(handle)
                .chunks_exact(2)
                .map(|uv| [uv[0], uv[1]])
                .collect();
            self.static_data_loaded = true;
        }
        Ok(())
    }

    /// Destroy the native mesh. Idempotent; also invoked on drop.
    pub fn dispose(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.ctx.engine().face_mesh_destroy(handle);
        }
        self.mesh = MeshData::default();
        self.static_data_loaded = false;
    }
}

/// Engine buffers are right-handed; the host wants Z negated.
fn to_host_vec3(flat: &[f32]) -> Vec<Vector3<f32>> {
    flat.chunks_exact(3)
        .map(|v| Vector3::new(v[0], v[1], -v[2]))
        .collect()
}

impl Drop for FaceMesh {
    fn drop(&mut self) {
        self.dispose();
    }
}
