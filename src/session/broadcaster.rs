//! Pipeline-ready and mirroring fan-out.
//!
//! Targets cannot start until the camera pipeline exists, and they need
//! to know whether camera input is mirrored before computing poses. Both
//! facts become available at an arbitrary point relative to target
//! construction, so the broadcaster replays the current state to late
//! subscribers: a listener is guaranteed exactly one `on_pipeline_ready`
//! regardless of whether it registered before or after the publish.
//!
//! Notification runs synchronously on the caller's thread, in listener
//! registration order. The listener list is snapshotted before
//! iterating, so a listener may subscribe or unsubscribe from within a
//! callback without invalidating the iteration.

use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::engine::PipelineHandle;

/// Callbacks a tracking component registers with the camera.
pub trait CameraListener {
    /// The pipeline exists and trackers may now be created against it.
    fn on_pipeline_ready(&mut self, pipeline: PipelineHandle);

    /// Camera input mirroring changed (also delivered once alongside
    /// `on_pipeline_ready`).
    fn on_mirroring_changed(&mut self, mirrored: bool);
}

/// Shared, lockable listener registration.
pub type SharedListener = Arc<Mutex<dyn CameraListener + Send>>;

/// Token identifying one subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenerId(u64);

/// The camera facts broadcast once per session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MirroringState {
    pub pipeline: PipelineHandle,
    pub mirrored: bool,
}

struct Entry {
    id: ListenerId,
    listener: Weak<Mutex<dyn CameraListener + Send>>,
}

#[derive(Default)]
struct Inner {
    next_id: u64,
    listeners: Vec<Entry>,
    state: Option<MirroringState>,
}

/// Session-scoped broadcaster. Owned by the session context, not by the
/// process, so repeated sessions and tests never share listener state.
#[derive(Default)]
pub struct MirroringBroadcaster {
    inner: Mutex<Inner>,
}

impl MirroringBroadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener. If the pipeline state was already published,
    /// the listener receives it synchronously before this returns.
    pub fn subscribe(&self, listener: &SharedListener) -> ListenerId {
        let (id, replay) = {
            let mut inner = self.inner.lock();
            let id = ListenerId(inner.next_id);
            inner.next_id += 1;
            inner.listeners.push(Entry {
                id,
                listener: Arc::downgrade(listener),
            });
            (id, inner.state)
        };

        if let Some(state) = replay {
            let mut listener = listener.lock();
            listener.on_pipeline_ready(state.pipeline);
            listener.on_mirroring_changed(state.mirrored);
        }
        id
    }

    /// Remove a subscription. Unknown ids are a no-op so teardown paths
    /// may unsubscribe defensively.
    pub fn unsubscribe(&self, id: ListenerId) {
        let mut inner = self.inner.lock();
        inner
            .listeners
            .retain(|entry| entry.id != id && entry.listener.strong_count() > 0);
    }

    /// Publish the pipeline and initial mirroring state, notifying every
    /// registered listener in registration order. Expected once per
    /// session.
    pub fn publish(&self, pipeline: PipelineHandle, mirrored: bool) {
        let snapshot = {
            let mut inner = self.inner.lock();
            if inner.state.is_some() {
                warn!("pipeline state published more than once in this session");
            }
            inner.state = Some(MirroringState { pipeline, mirrored });
            snapshot_listeners(&inner)
        };

        for listener in snapshot {
            if let Some(listener) = listener.upgrade() {
                let mut listener = listener.lock();
                listener.on_pipeline_ready(pipeline);
                listener.on_mirroring_changed(mirrored);
            }
        }
    }

    /// Update mirroring after the initial publish. Listeners are only
    /// notified on an actual change; calls before `publish` are dropped
    /// because mirroring is delivered with the pipeline state.
    pub fn set_mirrored(&self, mirrored: bool) {
        let snapshot = {
            let mut inner = self.inner.lock();
            match inner.state {
                None => {
                    debug!("mirroring update before pipeline publish, ignoring");
                    return;
                }
                Some(state) if state.mirrored == mirrored => return,
                Some(mut state) => {
                    state.mirrored = mirrored;
                    inner.state = Some(state);
                }
            }
            snapshot_listeners(&inner)
        };

        for listener in snapshot {
            if let Some(listener) = listener.upgrade() {
                listener.lock().on_mirroring_changed(mirrored);
            }
        }
    }

    pub fn state(&self) -> Option<MirroringState> {
        self.inner.lock().state
    }
}

fn snapshot_listeners(inner: &Inner) -> Vec<Weak<Mutex<dyn CameraListener + Send>>> {
    inner
        .listeners
        .iter()
        .map(|entry| entry.listener.clone())
        .collect()
}
