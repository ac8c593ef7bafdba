//! Error taxonomy for the tracking core.
//!
//! Domain errors (model loading, training) are surfaced to the immediate
//! caller and never retried internally. Handle-lifecycle mishaps
//! (double-destroy, lookups on a torn-down session) are absorbed as no-ops
//! by the session layer and never reach this type.

use std::path::PathBuf;

use thiserror::Error;

use crate::engine::Modality;

#[derive(Debug, Error)]
pub enum Error {
    /// The native engine could not load a tracking model. Fatal to that
    /// modality's tracker: the handle is destroyed and tracking stays
    /// unavailable until the caller explicitly re-creates it.
    #[error("failed to load the {0} tracking model")]
    ModelLoad(Modality),

    /// The native face mesh rejected the requested topology.
    #[error("failed to load the face mesh topology")]
    MeshTopologyLoad,

    /// The native trainer reported failure for the given source image
    /// (unsupported format, no trackable features). No output is produced.
    #[error("image training failed")]
    TrainingFailed,

    /// Refused to replace an existing output file. The prior file is left
    /// untouched; pass an explicit overwrite flag to replace it.
    #[error("output file already exists: {}", .0.display())]
    AlreadyExists(PathBuf),

    /// A configuration value was outside the accepted range and could not
    /// be clamped into it.
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
