//! Pure domain logic for the tilefarm distributed renderer.
//!
//! Region partitioning, artifact naming, run configuration, and final
//! image compositing. Nothing in this crate talks to a remote node.

pub mod compositor;
pub mod config;
pub mod error;
pub mod naming;
pub mod region;
pub mod types;
