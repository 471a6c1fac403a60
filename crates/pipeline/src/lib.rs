//! Distributed region rendering.
//!
//! The [`Coordinator`] splits the frame into regions, feeds them through a
//! shared [`WorkQueue`] to one [`NodeWorker`] per configured node, and
//! composites the retrieved artifacts once every worker has stopped.

pub mod connect;
pub mod coordinator;
pub mod error;
pub mod hook;
pub mod job;
pub mod provision;
pub mod queue;
pub mod render;
pub mod stager;
pub mod worker;

pub use connect::FarmConnector;
pub use coordinator::{Coordinator, RunSummary};
pub use error::PipelineError;
pub use hook::HookSource;
pub use queue::{Dequeued, WorkQueue};
pub use stager::{FileStager, HttpLookup, Mirror, MirrorLookup, StageOutcome};
pub use worker::{NodeReport, NodeState, NodeWorker};
