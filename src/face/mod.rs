//! Face mesh and landmark components layered on face tracking.

pub mod landmark;
pub mod mesh;

pub use landmark::{FaceLandmark, FaceLandmarkName};
pub use mesh::{FaceMesh, MeshData, TopologyVariant};
