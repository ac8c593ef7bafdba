//! Anchor-to-target reconciliation for multi-target trackers.
//!
//! The native tracker reports its current anchors as indices
//! `0..count`, with a stable string identity attached to each. Neither
//! the count nor the identity-to-index mapping is stable across frames,
//! so every tick the registry re-derives which logical target owns
//! which index. Targets that the engine did not report this tick lose
//! their resolved index and count as untracked.
//!
//! Reconciliation is O(anchors x registered targets) per tick, which is
//! fine at the concurrent-face counts cameras actually see.

use std::collections::HashMap;

use tracing::debug;

use crate::engine::{Engine, TrackerHandle};

#[derive(Debug, Default)]
struct SlotState {
    resolved: Option<usize>,
    seen: bool,
}

/// Maps stable logical-target identities to per-frame anchor indices.
#[derive(Debug, Default)]
pub struct MultiTargetRegistry {
    targets: HashMap<u32, SlotState>,
}

impl MultiTargetRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, identity: u32) {
        self.targets.entry(identity).or_default();
    }

    pub fn unregister(&mut self, identity: u32) {
        self.targets.remove(&identity);
    }

    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    /// The anchor index a target resolved to this tick, if it is
    /// currently tracked.
    pub fn resolved(&self, identity: u32) -> Option<usize> {
        self.targets.get(&identity).and_then(|state| state.resolved)
    }

    /// Re-derive the identity-to-index mapping from the tracker's
    /// current anchors. Identities that fail to parse or match no
    /// registered target are skipped: the engine may report anchors for
    /// targets this side has not registered.
    pub fn reconcile(&mut self, engine: &dyn Engine, tracker: TrackerHandle) {
        for state in self.targets.values_mut() {
            state.seen = false;
        }

        let count = engine.anchor_count(tracker);
        for index in 0..count {
            let Some(identity) = engine.anchor_identity(tracker, index) else {
                continue;
            };
            let Ok(id) = identity.parse::<u32>() else {
                debug!(identity = %identity, "anchor identity is not a target id, skipping");
                continue;
            };
            match self.targets.get_mut(&id) {
                Some(state) => {
                    state.resolved = Some(index);
                    state.seen = true;
                }
                None => debug!(identity = id, "anchor for unregistered target, skipping"),
            }
        }

        for state in self.targets.values_mut() {
            if !state.seen {
                state.resolved = None;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::sim::{SimAnchor, SimEngine};
    use crate::engine::Modality;
    use crate::geometry::Pose;

    fn tracker_with_identities(identities: &[&str]) -> (SimEngine, TrackerHandle) {
        let engine = SimEngine::new();
        let pipeline = engine.pipeline_create();
        let tracker = engine.tracker_create(pipeline, Modality::Face);
        engine.set_anchors(
            tracker,
            identities
                .iter()
                .map(|id| SimAnchor::identified(*id, Pose::identity()))
                .collect(),
        );
        (engine, tracker)
    }

    #[test]
    fn resolves_identities_to_reported_indices() {
        let (engine, tracker) = tracker_with_identities(&["2", "0"]);
        let mut registry = MultiTargetRegistry::new();
        registry.register(0);
        registry.register(1);
        registry.register(2);

        registry.reconcile(&engine, tracker);

        assert_eq!(registry.resolved(2), Some(0));
        assert_eq!(registry.resolved(0), Some(1));
        assert_eq!(registry.resolved(1), None);
    }

    #[test]
    fn unreported_target_loses_its_index() {
        let (engine, tracker) = tracker_with_identities(&["0", "1"]);
        let mut registry = MultiTargetRegistry::new();
        registry.register(0);
        registry.register(1);

        registry.reconcile(&engine, tracker);
        assert_eq!(registry.resolved(1), Some(1));

        engine.set_anchors(
            tracker,
            vec![SimAnchor::identified("0", Pose::identity())],
        );
        registry.reconcile(&engine, tracker);

        assert_eq!(registry.resolved(0), Some(0));
        assert_eq!(registry.resolved(1), None);
    }

    #[test]
    fn unknown_and_unparseable_identities_are_ignored() {
        let (engine, tracker) = tracker_with_identities(&["garbage", "7", "1"]);
        let mut registry = MultiTargetRegistry::new();
        registry.register(1);

        registry.reconcile(&engine, tracker);

        assert_eq!(registry.resolved(1), Some(2));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn anchors_without_identity_are_ignored() {
        let engine = SimEngine::new();
        let pipeline = engine.pipeline_create();
        let tracker = engine.tracker_create(pipeline, Modality::Face);
        engine.set_anchors(tracker, vec![SimAnchor::new(Pose::identity())]);

        let mut registry = MultiTargetRegistry::new();
        registry.register(0);
        registry.reconcile(&engine, tracker);

        assert_eq!(registry.resolved(0), None);
    }
}
