//! Progress events for step lifecycle and parallel milestones.
//!
//! Provides an optional, non-intrusive way to observe a run. Sequential
//! steps emit events when they start, retry and finish. A parallel stage
//! reports as one step: a start, 33/66/100% milestones as branches
//! complete, then a single finish. Implement
//! [`ProgressSink`] to forward these to a UI, a log or a job table.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// What happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressKind {
    Started,
    /// A retry attempt is about to run.
    Retrying,
    /// A parallel milestone was crossed.
    Progress,
    Completed,
    Failed,
}

/// One progress notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    /// Step name the event belongs to.
    pub step: String,
    pub kind: ProgressKind,
    /// Percentage for milestone events.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub percent: Option<u8>,
    /// Free-form detail: retry reason, failure message, branch tally.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl ProgressEvent {
    pub fn new(step: impl Into<String>, kind: ProgressKind) -> Self {
        Self {
            step: step.into(),
            kind,
            percent: None,
            detail: None,
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    pub fn with_percent(mut self, percent: u8) -> Self {
        self.percent = Some(percent);
        self
    }
}

/// Receiver for progress events.
///
/// Called from concurrently running branches, so implementations must be
/// `Send + Sync` and should return quickly.
///
/// # Example
///
/// ```
/// use tet_workflow::events::{ProgressEvent, ProgressKind, ProgressSink};
///
/// struct PrintSink;
///
/// impl ProgressSink for PrintSink {
///     fn on_event(&self, event: ProgressEvent) {
///         match event.kind {
///             ProgressKind::Progress => println!("[{}] {:?}%", event.step, event.percent),
///             kind => println!("[{}] {:?}", event.step, kind),
///         }
///     }
/// }
/// ```
pub trait ProgressSink: Send + Sync {
    fn on_event(&self, event: ProgressEvent);
}

/// Emit an event if a sink is present. No-op otherwise.
pub(crate) fn emit(sink: &Option<Arc<dyn ProgressSink>>, event: ProgressEvent) {
    if let Some(ref s) = sink {
        s.on_event(event);
    }
}

/// A [`ProgressSink`] backed by a closure.
///
/// ```
/// use tet_workflow::events::{FnProgressSink, ProgressEvent};
/// use std::sync::Arc;
///
/// let sink = Arc::new(FnProgressSink(|event: ProgressEvent| {
///     eprintln!("{} {:?}", event.step, event.kind);
/// }));
/// ```
pub struct FnProgressSink<F: Fn(ProgressEvent) + Send + Sync>(pub F);

impl<F: Fn(ProgressEvent) + Send + Sync> ProgressSink for FnProgressSink<F> {
    fn on_event(&self, event: ProgressEvent) {
        (self.0)(event);
    }
}

/// Records every event. Handy in tests.
#[derive(Debug, Default)]
pub struct CollectingSink {
    events: Mutex<Vec<ProgressEvent>>,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<ProgressEvent> {
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Events of one kind, in arrival order.
    pub fn of_kind(&self, kind: ProgressKind) -> Vec<ProgressEvent> {
        self.events().into_iter().filter(|e| e.kind == kind).collect()
    }
}

impl ProgressSink for CollectingSink {
    fn on_event(&self, event: ProgressEvent) {
        self.events
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(event);
    }
}

/// Milestones reported while a parallel stage runs.
pub const MILESTONES: [u8; 3] = [33, 66, 100];

/// Tracks branch completions of one parallel stage.
///
/// Each completion reports at most one milestone, the highest one newly
/// crossed. In a 2-branch stage the first completion (50%) reports 33 and
/// the second (100%) reports 100.
#[derive(Debug)]
pub struct MilestoneTracker {
    total: usize,
    done: AtomicUsize,
}

impl MilestoneTracker {
    pub fn new(total: usize) -> Self {
        Self {
            total: total.max(1),
            done: AtomicUsize::new(0),
        }
    }

    /// Record one finished branch; returns the milestone to report, if any.
    pub fn complete_one(&self) -> Option<u8> {
        let done = self.done.fetch_add(1, Ordering::SeqCst) + 1;
        let before = Self::percent(done - 1, self.total);
        let now = Self::percent(done, self.total);
        MILESTONES
            .iter()
            .rev()
            .copied()
            .find(|&m| before < m as usize && now >= m as usize)
    }

    fn percent(done: usize, total: usize) -> usize {
        done.min(total) * 100 / total
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_milestones_three_branches() {
        let tracker = MilestoneTracker::new(3);
        assert_eq!(tracker.complete_one(), Some(33));
        assert_eq!(tracker.complete_one(), Some(66));
        assert_eq!(tracker.complete_one(), Some(100));
        assert_eq!(tracker.complete_one(), None);
    }

    #[test]
    fn test_milestones_two_branches_skip() {
        let tracker = MilestoneTracker::new(2);
        // 50% crosses 33 only
        assert_eq!(tracker.complete_one(), Some(33));
        // 100% crosses 66 and 100; only the highest is reported
        assert_eq!(tracker.complete_one(), Some(100));
    }

    #[test]
    fn test_milestones_many_branches() {
        let tracker = MilestoneTracker::new(10);
        let reported: Vec<u8> = (0..10).filter_map(|_| tracker.complete_one()).collect();
        assert_eq!(reported, vec![33, 66, 100]);
    }

    #[test]
    fn test_collecting_sink() {
        let sink = CollectingSink::new();
        sink.on_event(ProgressEvent::new("initial", ProgressKind::Started));
        sink.on_event(ProgressEvent::new("initial", ProgressKind::Progress).with_percent(33));
        assert_eq!(sink.events().len(), 2);
        assert_eq!(sink.of_kind(ProgressKind::Progress)[0].percent, Some(33));
    }

    #[test]
    fn test_emit_none_is_noop() {
        emit(&None, ProgressEvent::new("s", ProgressKind::Completed));
    }
}
