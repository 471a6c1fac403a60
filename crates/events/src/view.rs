//! Display interface driven by the progress reporter.

use crate::progress::ProgressState;

/// Receives display updates from the [`ProgressReporter`](crate::ProgressReporter).
///
/// Implementations are owned by the reporter task and are only ever called
/// from it, so they need no synchronisation of their own.
pub trait StatusView: Send {
    /// The displayed text for `node` changed.
    fn node_status(&mut self, node: &str, text: &str);

    /// A region completed and the aggregate progress moved.
    fn progress(&mut self, state: &ProgressState);

    /// The reporter consumed the exit event.
    fn finished(&mut self, _state: &ProgressState) {}
}

/// View that writes every update as a structured log line.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingView;

impl StatusView for TracingView {
    fn node_status(&mut self, node: &str, text: &str) {
        tracing::info!(node, "{text}");
    }

    fn progress(&mut self, state: &ProgressState) {
        tracing::info!(
            completed = state.completed,
            total = state.total,
            percent = %format!("{:.1}", state.percentage()),
            "Render progress",
        );
    }

    fn finished(&mut self, state: &ProgressState) {
        tracing::info!(
            completed = state.completed,
            total = state.total,
            "Status reporting finished",
        );
    }
}
