//! Ownership of the native pipeline and per-modality tracker handles.
//!
//! One pipeline exists per running session, created lazily when the
//! first target needs it. Each modality gets at most one tracker,
//! shared by every logical target of that modality and kept alive by an
//! active-target reference count. Teardown order across targets is not
//! guaranteed, so release is idempotent: releasing with no tracker
//! present is a no-op rather than an error.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::engine::{Engine, Modality, ModelSource, PipelineHandle, TrackerHandle};
use crate::error::{Error, Result};

struct TrackerEntry {
    handle: TrackerHandle,
    active: usize,
}

/// Owns the pipeline and tracker handles for one tracking session.
pub struct TrackingSession {
    engine: Arc<dyn Engine>,
    pipeline: Option<PipelineHandle>,
    /// Logical targets declared per modality. Read once when the
    /// modality's tracker is created to size its capacity.
    declared: HashMap<Modality, usize>,
    trackers: HashMap<Modality, TrackerEntry>,
}

impl TrackingSession {
    pub fn new(engine: Arc<dyn Engine>) -> Self {
        Self {
            engine,
            pipeline: None,
            declared: HashMap::new(),
            trackers: HashMap::new(),
        }
    }

    /// Declare a logical target of the given modality. Must happen
    /// before the modality's tracker is created: capacity is fixed at
    /// tracker creation and changing it afterwards requires recreating
    /// the tracker.
    pub fn register_target(&mut self, modality: Modality) {
        let count = self.declared.entry(modality).or_insert(0);
        *count += 1;
        if self.trackers.contains_key(&modality) {
            warn!(
                %modality,
                declared = *count,
                "target declared after tracker creation; capacity unchanged until the tracker is recreated"
            );
        }
    }

    pub fn unregister_target(&mut self, modality: Modality) {
        if let Some(count) = self.declared.get_mut(&modality) {
            *count = count.saturating_sub(1);
        }
    }

    pub fn declared_targets(&self, modality: Modality) -> usize {
        self.declared.get(&modality).copied().unwrap_or(0)
    }

    /// The pipeline handle, creating it on first use.
    pub fn ensure_pipeline(&mut self) -> PipelineHandle {
        if let Some(pipeline) = self.pipeline {
            return pipeline;
        }
        let pipeline = self.engine.pipeline_create();
        info!(?pipeline, "created tracking pipeline");
        self.pipeline = Some(pipeline);
        pipeline
    }

    pub fn pipeline(&self) -> Option<PipelineHandle> {
        self.pipeline
    }

    /// Acquire the modality's tracker, creating it (and the pipeline) if
    /// this is the first active target. Each successful call must be
    /// paired with one `release_tracker`.
    ///
    /// Creation sizes the tracker from the declared target count and
    /// loads the default tracking model; a model-load failure destroys
    /// the fresh handle and is propagated, leaving the tracker uncreated
    /// until the caller retries explicitly.
    pub fn ensure_tracker(&mut self, modality: Modality) -> Result<TrackerHandle> {
        let pipeline = self.ensure_pipeline();

        if let Some(entry) = self.trackers.get_mut(&modality) {
            entry.active += 1;
            return Ok(entry.handle);
        }

        let handle = self.engine.tracker_create(pipeline, modality);

        let declared = self.declared_targets(modality);
        let capacity = if declared < 1 {
            warn!(%modality, "no targets declared at tracker creation, sizing for 1");
            1
        } else {
            declared
        };
        self.engine.tracker_set_max_targets(handle, capacity);

        if !self.engine.tracker_load_model(handle, ModelSource::Default) {
            self.engine.tracker_destroy(handle);
            return Err(Error::ModelLoad(modality));
        }

        info!(%modality, ?handle, capacity, "created tracker");
        self.trackers
            .insert(modality, TrackerEntry { handle, active: 1 });
        Ok(handle)
    }

    /// Drop one active-target reference. The tracker is destroyed when
    /// the last reference goes; surplus releases are no-ops.
    pub fn release_tracker(&mut self, modality: Modality) {
        let Some(entry) = self.trackers.get_mut(&modality) else {
            debug!(%modality, "release with no tracker present, ignoring");
            return;
        };
        entry.active -= 1;
        if entry.active == 0 {
            if let Some(entry) = self.trackers.remove(&modality) {
                self.engine.tracker_destroy(entry.handle);
                info!(%modality, "destroyed tracker after last release");
            }
        }
    }

    /// Current tracker handle for a modality, if one is alive. Targets
    /// resolve the handle through this lookup every frame instead of
    /// caching it, so a session restart cannot leave them with a
    /// dangling handle.
    pub fn tracker(&self, modality: Modality) -> Option<TrackerHandle> {
        self.trackers.get(&modality).map(|entry| entry.handle)
    }

    pub fn active_targets(&self, modality: Modality) -> usize {
        self.trackers.get(&modality).map_or(0, |entry| entry.active)
    }

    /// Destroy all trackers and the pipeline. Safe to call repeatedly.
    pub fn shutdown(&mut self) {
        for (modality, entry) in self.trackers.drain() {
            debug!(%modality, "destroying tracker at shutdown");
            self.engine.tracker_destroy(entry.handle);
        }
        if let Some(pipeline) = self.pipeline.take() {
            info!(?pipeline, "destroyed tracking pipeline");
            self.engine.pipeline_destroy(pipeline);
        }
    }

    pub fn engine(&self) -> &Arc<dyn Engine> {
        &self.engine
    }
}

impl Drop for TrackingSession {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::sim::SimEngine;

    fn session() -> (Arc<SimEngine>, TrackingSession) {
        let engine = Arc::new(SimEngine::new());
        let session = TrackingSession::new(engine.clone());
        (engine, session)
    }

    #[test]
    fn refcount_destroys_on_last_release() {
        let (engine, mut session) = session();
        for _ in 0..3 {
            session.register_target(Modality::Face);
        }

        let h1 = session.ensure_tracker(Modality::Face).unwrap();
        let h2 = session.ensure_tracker(Modality::Face).unwrap();
        let h3 = session.ensure_tracker(Modality::Face).unwrap();
        assert_eq!(h1, h2);
        assert_eq!(h2, h3);
        assert_eq!(engine.live_trackers(), 1);
        assert!(engine.model_loaded(h1));

        session.release_tracker(Modality::Face);
        session.release_tracker(Modality::Face);
        assert_eq!(engine.live_trackers(), 1);

        session.release_tracker(Modality::Face);
        assert_eq!(engine.live_trackers(), 0);

        // Surplus release stays a no-op and never reaches the engine.
        session.release_tracker(Modality::Face);
        assert_eq!(engine.stale_operations(), 0);
    }

    #[test]
    fn model_load_failure_leaves_tracker_uncreated() {
        let (engine, mut session) = session();
        session.register_target(Modality::Face);
        engine.set_model_load_failure(Modality::Face, true);

        let err = session.ensure_tracker(Modality::Face).unwrap_err();
        assert!(matches!(err, Error::ModelLoad(Modality::Face)));
        assert!(session.tracker(Modality::Face).is_none());
        assert_eq!(engine.live_trackers(), 0);

        // An explicit retry after the failure clears succeeds.
        engine.set_model_load_failure(Modality::Face, false);
        assert!(session.ensure_tracker(Modality::Face).is_ok());
    }

    #[test]
    fn capacity_clamps_to_one_without_declared_targets() {
        let (engine, mut session) = session();
        let tracker = session.ensure_tracker(Modality::Face).unwrap();
        // Capacity 1: only the first scripted anchor is reported.
        engine.set_anchors(
            tracker,
            vec![
                crate::engine::sim::SimAnchor::new(crate::geometry::Pose::identity()),
                crate::engine::sim::SimAnchor::new(crate::geometry::Pose::identity()),
            ],
        );
        assert_eq!(engine.anchor_count(tracker), 1);
    }

    #[test]
    fn modalities_are_independent() {
        let (engine, mut session) = session();
        session.register_target(Modality::Face);
        session.register_target(Modality::Instant);

        session.ensure_tracker(Modality::Face).unwrap();
        session.ensure_tracker(Modality::Instant).unwrap();
        assert_eq!(engine.live_trackers(), 2);

        session.release_tracker(Modality::Face);
        assert_eq!(engine.live_trackers(), 1);
        assert!(session.tracker(Modality::Instant).is_some());
        assert!(session.tracker(Modality::Face).is_none());
    }

    #[test]
    fn pipeline_created_once_and_destroyed_at_shutdown() {
        let (engine, mut session) = session();
        let p1 = session.ensure_pipeline();
        let p2 = session.ensure_pipeline();
        assert_eq!(p1, p2);
        assert_eq!(engine.live_pipelines(), 1);

        session.shutdown();
        assert_eq!(engine.live_pipelines(), 0);

        // Shutdown twice must not double-destroy.
        session.shutdown();
        assert_eq!(engine.stale_operations(), 0);
    }

    #[test]
    fn drop_tears_down_outstanding_handles() {
        let engine = Arc::new(SimEngine::new());
        {
            let mut session = TrackingSession::new(engine.clone());
            session.register_target(Modality::Image);
            session.ensure_tracker(Modality::Image).unwrap();
        }
        assert_eq!(engine.live_trackers(), 0);
        assert_eq!(engine.live_pipelines(), 0);
        assert_eq!(engine.stale_operations(), 0);
    }
}
