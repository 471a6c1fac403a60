//! Status reporting between node workers and the progress display.
//!
//! - [`StatusEvent`] -- one `(node, message)` status line.
//! - [`StatusSender`] -- cloneable producer handle; each report waits until
//!   the reporter has consumed it.
//! - [`ProgressReporter`] -- the single consumer task that owns all
//!   progress and display state.
//! - [`StatusView`] -- the display interface the reporter drives.

pub mod progress;
pub mod status;
pub mod view;

pub use progress::{ProgressReporter, ProgressState};
pub use status::{status_channel, StatusEvent, StatusReceiver, StatusSender};
pub use view::{StatusView, TracingView};
