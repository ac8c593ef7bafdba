//! Logical tracking targets.
//!
//! A logical target is a user-declared thing to track: a face slot, a
//! trained image, an instant-placement anchor. Targets are driven once
//! per frame by the host's update callback and publish a
//! host-convention transform plus edge-triggered seen / not-seen
//! events.

pub mod face;
pub mod image;
pub mod instant;
pub mod registry;

pub use face::{AnchorSnapshot, FaceAnchor, FaceTrackingGroup};
pub use image::{ImageTarget, PlaneOrientation};
pub use instant::InstantTarget;
pub use registry::MultiTargetRegistry;

/// Initialization phase of a target. Targets leave `Uninitialized` on
/// the first pipeline-ready notification that reaches them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TargetPhase {
    #[default]
    Uninitialized,
    Active,
}

/// Edge produced by a visibility observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VisibilityEvent {
    Seen,
    NotSeen,
}

/// Visibility edge detector.
///
/// `observe` is fed the per-tick tracked flag and reports a transition
/// at most once per actual change, never once per tick while steady.
#[derive(Debug, Default)]
pub struct Visibility {
    visible: bool,
}

impl Visibility {
    pub fn observe(&mut self, tracked: bool) -> Option<VisibilityEvent> {
        match (self.visible, tracked) {
            (false, true) => {
                self.visible = true;
                Some(VisibilityEvent::Seen)
            }
            (true, false) => {
                self.visible = false;
                Some(VisibilityEvent::NotSeen)
            }
            _ => None,
        }
    }

    pub fn is_visible(&self) -> bool {
        self.visible
    }
}

/// User callbacks fired on visibility edges.
#[derive(Default)]
pub struct VisibilityHooks {
    on_seen: Vec<Box<dyn FnMut() + Send>>,
    on_not_seen: Vec<Box<dyn FnMut() + Send>>,
}

impl VisibilityHooks {
    pub fn on_seen(&mut self, hook: impl FnMut() + Send + 'static) {
        self.on_seen.push(Box::new(hook));
    }

    pub fn on_not_seen(&mut self, hook: impl FnMut() + Send + 'static) {
        self.on_not_seen.push(Box::new(hook));
    }

    pub fn fire(&mut self, event: VisibilityEvent) {
        let hooks = match event {
            VisibilityEvent::Seen => &mut self.on_seen,
            VisibilityEvent::NotSeen => &mut self.on_not_seen,
        };
        for hook in hooks {
            hook();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn visibility_reports_edges_only() {
        let mut v = Visibility::default();
        assert_eq!(v.observe(false), None);
        assert_eq!(v.observe(true), Some(VisibilityEvent::Seen));
        assert_eq!(v.observe(true), None);
        assert_eq!(v.observe(false), Some(VisibilityEvent::NotSeen));
        assert_eq!(v.observe(false), None);
    }

    #[test]
    fn hooks_fire_for_matching_edge() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::sync::Arc;

        let seen = Arc::new(AtomicUsize::new(0));
        let lost = Arc::new(AtomicUsize::new(0));

        let mut hooks = VisibilityHooks::default();
        let seen_count = seen.clone();
        hooks.on_seen(move || {
            seen_count.fetch_add(1, Ordering::SeqCst);
        });
        let lost_count = lost.clone();
        hooks.on_not_seen(move || {
            lost_count.fetch_add(1, Ordering::SeqCst);
        });

        hooks.fire(VisibilityEvent::Seen);
        hooks.fire(VisibilityEvent::Seen);
        hooks.fire(VisibilityEvent::NotSeen);

        assert_eq!(seen.load(Ordering::SeqCst), 2);
        assert_eq!(lost.load(Ordering::SeqCst), 1);
    }
}
