//! Command execution and file transfer on render nodes.
//!
//! [`NodeSession`] is the capability every node worker talks to: run a
//! shell command and get its output and exit status back, push a file, pull
//! a file. Remote nodes use [`SshSession`] (the system `ssh`/`scp` client
//! over a multiplexed control connection); the local node uses
//! [`LocalSession`]. With the `mock` feature, [`mock`] provides a scripted
//! double for tests.

pub mod local;
#[cfg(any(test, feature = "mock"))]
pub mod mock;
pub mod session;
pub mod shell;
pub mod ssh;
pub mod subprocess;

pub use local::{LocalConnector, LocalSession};
pub use session::{CommandOutput, Connector, NodeSession, SessionError};
pub use ssh::{SshConnector, SshOptions, SshSession};
