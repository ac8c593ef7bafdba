//! Image target training.
//!
//! Wraps the native trainer: source image bytes in, packaged target
//! descriptor (and optional embedded preview) out. The trainer hands
//! back engine-owned buffers; they are wrapped in a scope guard so each
//! is released exactly once on every path. Persisting the descriptor is
//! a separate step with an explicit overwrite policy.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::engine::{BufferHandle, Engine};
use crate::error::{Error, Result};

/// File extension for persisted trained targets.
pub const TARGET_EXTENSION: &str = "art";

#[derive(Debug, Clone, Copy)]
pub struct TrainParams {
    /// The trainer downscales the source to fit these bounds.
    pub max_width: u32,
    pub max_height: u32,
    /// Embed a preview image in the descriptor.
    pub want_preview: bool,
}

impl Default for TrainParams {
    fn default() -> Self {
        Self {
            max_width: 512,
            max_height: 512,
            want_preview: true,
        }
    }
}

/// Trained target copied out of the engine. `preview` is present only
/// when requested.
#[derive(Debug, Clone)]
pub struct TrainedImageTarget {
    pub target: Vec<u8>,
    pub preview: Option<Vec<u8>>,
}

/// Releases an engine-owned buffer when the scope ends.
struct ScopedBuffer<'a> {
    engine: &'a dyn Engine,
    handle: Option<BufferHandle>,
}

impl<'a> ScopedBuffer<'a> {
    fn new(engine: &'a dyn Engine, handle: BufferHandle) -> Self {
        Self {
            engine,
            handle: Some(handle),
        }
    }

    fn bytes(&self) -> Vec<u8> {
        match self.handle {
            Some(handle) => self.engine.buffer_bytes(handle),
            None => Vec::new(),
        }
    }
}

impl Drop for ScopedBuffer<'_> {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.engine.buffer_release(handle);
        }
    }
}

/// Train an image target from raw source bytes. Trainer rejection
/// surfaces as [`Error::TrainingFailed`] with nothing written or
/// leaked; recovery is up to the caller.
pub fn train(
    engine: &dyn Engine,
    source: &[u8],
    source_is_jpeg: bool,
    params: &TrainParams,
) -> Result<TrainedImageTarget> {
    debug!(
        source_len = source.len(),
        source_is_jpeg,
        max_width = params.max_width,
        max_height = params.max_height,
        "starting image target training"
    );
    let output = engine
        .train_image_target(
            source,
            source_is_jpeg,
            params.max_width,
            params.max_height,
            params.want_preview,
        )
        .ok_or(Error::TrainingFailed)?;

    let target = ScopedBuffer::new(engine, output.target);
    let preview = output
        .preview
        .map(|handle| ScopedBuffer::new(engine, handle));

    Ok(TrainedImageTarget {
        target: target.bytes(),
        preview: preview.as_ref().map(ScopedBuffer::bytes),
    })
}

/// Persist descriptor bytes. An existing file is only replaced when
/// `allow_overwrite` is set; otherwise it is left byte-for-byte
/// untouched and [`Error::AlreadyExists`] is returned.
pub fn write_target_file(path: &Path, bytes: &[u8], allow_overwrite: bool) -> Result<()> {
    if !allow_overwrite && path.exists() {
        return Err(Error::AlreadyExists(path.to_path_buf()));
    }
    fs::write(path, bytes)?;
    Ok(())
}

/// Train a source image file and persist the descriptor as
/// `<stem>.art` in `out_dir`. Whether the source is JPEG is inferred
/// from its extension. Returns the written path.
pub fn train_file(
    engine: &dyn Engine,
    image_path: &Path,
    out_dir: &Path,
    params: &TrainParams,
    allow_overwrite: bool,
) -> Result<PathBuf> {
    let source = fs::read(image_path)?;
    let trained = train(engine, &source, file_is_jpeg(image_path), params)?;

    let stem = image_path.file_stem().ok_or_else(|| {
        Error::InvalidConfiguration(format!(
            "source image path has no file name: {}",
            image_path.display()
        ))
    })?;
    let out_path = out_dir.join(stem).with_extension(TARGET_EXTENSION);
    write_target_file(&out_path, &trained.target, allow_overwrite)?;
    info!(path = %out_path.display(), "trained image target written");
    Ok(out_path)
}

fn file_is_jpeg(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("jpg") || ext.eq_ignore_ascii_case("jpeg"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::sim::{SimEngine, TRAINED_TARGET_MAGIC};

    #[test]
    fn training_copies_and_releases_buffers() {
        let engine = SimEngine::new();
        let trained = train(&engine, b"image bytes", false, &TrainParams::default()).unwrap();

        assert!(trained.target.starts_with(TRAINED_TARGET_MAGIC));
        assert_eq!(trained.preview.as_deref(), Some(&b"image bytes"[..]));
        assert_eq!(engine.live_buffers(), 0);
        assert_eq!(engine.stale_operations(), 0);
    }

    #[test]
    fn preview_absent_when_not_requested() {
        let engine = SimEngine::new();
        let params = TrainParams {
            want_preview: false,
            ..TrainParams::default()
        };
        let trained = train(&engine, b"image bytes", false, &params).unwrap();
        assert!(trained.preview.is_none());
        assert_eq!(engine.live_buffers(), 0);
    }

    #[test]
    fn trainer_rejection_is_surfaced() {
        let engine = SimEngine::new();
        engine.set_training_failure(true);
        let err = train(&engine, b"image bytes", false, &TrainParams::default()).unwrap_err();
        assert!(matches!(err, Error::TrainingFailed));
        assert_eq!(engine.live_buffers(), 0);
    }

    #[test]
    fn overwrite_refused_leaves_existing_file_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("poster.art");
        fs::write(&path, b"previous descriptor").unwrap();

        let err = write_target_file(&path, b"new descriptor", false).unwrap_err();
        assert!(matches!(err, Error::AlreadyExists(p) if p == path));
        assert_eq!(fs::read(&path).unwrap(), b"previous descriptor");

        write_target_file(&path, b"new descriptor", true).unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"new descriptor");
    }

    #[test]
    fn train_file_writes_descriptor_next_to_stem() {
        let engine = SimEngine::new();
        let dir = tempfile::tempdir().unwrap();
        let image = dir.path().join("poster.jpg");
        fs::write(&image, b"jpeg bytes").unwrap();

        let out = train_file(
            &engine,
            &image,
            dir.path(),
            &TrainParams::default(),
            false,
        )
        .unwrap();

        assert_eq!(out, dir.path().join("poster.art"));
        let descriptor = fs::read(&out).unwrap();
        assert!(descriptor.starts_with(TRAINED_TARGET_MAGIC));
        // The jpeg flag made it through to the trainer.
        assert_eq!(descriptor[TRAINED_TARGET_MAGIC.len()], 1);

        // Training again without overwrite fails; with overwrite it
        // replaces the file.
        let err = train_file(
            &engine,
            &image,
            dir.path(),
            &TrainParams::default(),
            false,
        )
        .unwrap_err();
        assert!(matches!(err, Error::AlreadyExists(_)));
        train_file(&engine, &image, dir.path(), &TrainParams::default(), true).unwrap();
    }

    #[test]
    fn jpeg_detection_is_case_insensitive() {
        assert!(file_is_jpeg(Path::new("a/b/photo.JPG")));
        assert!(file_is_jpeg(Path::new("photo.jpeg")));
        assert!(!file_is_jpeg(Path::new("photo.png")));
        assert!(!file_is_jpeg(Path::new("photo")));
    }
}
