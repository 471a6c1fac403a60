//! Aggregate progress owned by the single reporter task.
//!
//! [`ProgressReporter`] consumes [`StatusEvent`]s from every node worker.
//! Completion events advance the counter; any other message replaces the
//! text shown for its node. The exit event ends the loop and hands the
//! final [`ProgressState`] back to the caller.

use std::collections::BTreeMap;

use tokio::task::JoinHandle;

use crate::status::{status_channel, StatusEvent, StatusReceiver, StatusSender};
use crate::view::StatusView;

// ---------------------------------------------------------------------------
// ProgressState
// ---------------------------------------------------------------------------

/// Completion counters plus the latest text per node.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProgressState {
    /// Number of regions in the job; fixed at start.
    pub total: usize,
    /// Regions reported complete; never decreases and never exceeds `total`.
    pub completed: usize,
    /// Latest non-completion message per node.
    pub nodes: BTreeMap<String, String>,
}

impl ProgressState {
    pub fn new(total: usize) -> Self {
        Self {
            total,
            completed: 0,
            nodes: BTreeMap::new(),
        }
    }

    /// `completed / total * 100`, or `0.0` for an empty job.
    pub fn percentage(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        self.completed as f64 / self.total as f64 * 100.0
    }

    pub fn is_complete(&self) -> bool {
        self.total > 0 && self.completed == self.total
    }

    /// Fold one event into the state. Returns `true` if the counter moved.
    pub fn apply(&mut self, event: &StatusEvent) -> bool {
        if event.is_completion() {
            if self.completed < self.total {
                self.completed += 1;
                return true;
            }
            tracing::warn!(
                node = %event.node,
                total = self.total,
                "Completion reported beyond job total, ignoring",
            );
            return false;
        }
        self.nodes.insert(event.node.clone(), event.message.clone());
        false
    }
}

// ---------------------------------------------------------------------------
// ProgressReporter
// ---------------------------------------------------------------------------

/// The only consumer of status events.
pub struct ProgressReporter<V> {
    state: ProgressState,
    view: V,
    rx: StatusReceiver,
}

impl<V: StatusView + 'static> ProgressReporter<V> {
    pub fn new(total: usize, view: V, rx: StatusReceiver) -> Self {
        Self {
            state: ProgressState::new(total),
            view,
            rx,
        }
    }

    /// Start a reporter task for a job of `total` regions.
    ///
    /// Returns the sender to clone into every worker and the handle that
    /// resolves to the final state once an exit event arrives.
    pub fn spawn(total: usize, view: V) -> (StatusSender, JoinHandle<ProgressState>) {
        let (tx, rx) = status_channel();
        let reporter = Self::new(total, view, rx);
        (tx, tokio::spawn(reporter.run()))
    }

    /// Consume events until the exit event or until every sender is gone.
    pub async fn run(mut self) -> ProgressState {
        while let Some(delivery) = self.rx.recv().await {
            let event = &delivery.event;

            if event.is_exit() {
                self.view.finished(&self.state);
                delivery.ack();
                return self.state;
            }

            if self.state.apply(event) {
                self.view.progress(&self.state);
            } else if !event.is_completion() {
                self.view.node_status(&event.node, &event.message);
            }
            delivery.ack();
        }

        tracing::debug!("All status senders dropped before exit event");
        self.view.finished(&self.state);
        self.state
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;

    /// View that records what it was asked to display.
    #[derive(Clone, Default)]
    struct RecordingView {
        lines: Arc<Mutex<Vec<(String, String)>>>,
        percents: Arc<Mutex<Vec<f64>>>,
        finished: Arc<Mutex<bool>>,
    }

    impl StatusView for RecordingView {
        fn node_status(&mut self, node: &str, text: &str) {
            self.lines
                .lock()
                .unwrap()
                .push((node.to_string(), text.to_string()));
        }

        fn progress(&mut self, state: &ProgressState) {
            self.percents.lock().unwrap().push(state.percentage());
        }

        fn finished(&mut self, _state: &ProgressState) {
            *self.finished.lock().unwrap() = true;
        }
    }

    #[test]
    fn percentage_tracks_completions() {
        let mut state = ProgressState::new(4);
        assert_eq!(state.percentage(), 0.0);
        assert!(state.apply(&StatusEvent::completed("gpu1", "a")));
        assert_eq!(state.percentage(), 25.0);
        assert!(!state.apply(&StatusEvent::new("gpu1", "rendering")));
        assert_eq!(state.completed, 1);
        assert_eq!(state.nodes["gpu1"], "rendering");
    }

    #[test]
    fn completions_never_exceed_total() {
        let mut state = ProgressState::new(1);
        assert!(state.apply(&StatusEvent::completed("gpu1", "a")));
        assert!(!state.apply(&StatusEvent::completed("gpu1", "a")));
        assert_eq!(state.completed, 1);
        assert!(state.is_complete());
    }

    #[test]
    fn empty_job_reports_zero_percent() {
        let state = ProgressState::new(0);
        assert_eq!(state.percentage(), 0.0);
        assert!(!state.is_complete());
    }

    #[tokio::test]
    async fn reaches_one_hundred_percent_exactly_once() {
        for total in [1usize, 3, 7] {
            let view = RecordingView::default();
            let (tx, handle) = ProgressReporter::spawn(total, view.clone());

            for i in 0..total {
                tx.report("gpu1", format!("rendering {i}")).await;
                tx.completed("gpu1", &format!("region {i}")).await;
            }
            tx.exit().await;

            let state = handle.await.unwrap();
            assert_eq!(state.completed, total);

            let percents = view.percents.lock().unwrap().clone();
            assert_eq!(percents.len(), total);
            assert_eq!(percents.iter().filter(|p| **p == 100.0).count(), 1);
            assert_eq!(*percents.last().unwrap(), 100.0);
            assert!(percents.windows(2).all(|w| w[0] < w[1]));
        }
    }

    #[tokio::test]
    async fn other_messages_replace_node_text() {
        let view = RecordingView::default();
        let (tx, handle) = ProgressReporter::spawn(2, view.clone());

        tx.report("gpu1", "connecting").await;
        tx.report("gpu2", "connecting").await;
        tx.report("gpu1", "staging").await;
        tx.exit().await;

        let state = handle.await.unwrap();
        assert_eq!(state.nodes["gpu1"], "staging");
        assert_eq!(state.nodes["gpu2"], "connecting");
        assert_eq!(state.completed, 0);
        assert_eq!(view.lines.lock().unwrap().len(), 3);
        assert!(*view.finished.lock().unwrap());
    }

    #[tokio::test]
    async fn concurrent_producers_are_all_counted() {
        let (tx, handle) = ProgressReporter::spawn(40, RecordingView::default());

        let producers: Vec<_> = (0..4)
            .map(|n| {
                let tx = tx.clone();
                tokio::spawn(async move {
                    let node = format!("gpu{n}");
                    for i in 0..10 {
                        tx.completed(&node, &format!("region {i}")).await;
                    }
                })
            })
            .collect();
        for p in producers {
            p.await.unwrap();
        }
        tx.exit().await;

        let state = handle.await.unwrap();
        assert!(state.is_complete());
        assert_eq!(state.percentage(), 100.0);
    }

    #[tokio::test]
    async fn loop_ends_when_senders_drop() {
        let (tx, handle) = ProgressReporter::spawn(2, RecordingView::default());
        tx.completed("gpu1", "a").await;
        drop(tx);
        let state = handle.await.unwrap();
        assert_eq!(state.completed, 1);
    }
}
