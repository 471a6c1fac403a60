/// Node identity of the machine running the coordinator.
///
/// A node configured with this name renders against the local filesystem
/// and never opens a remote session.
pub const LOCAL_NODE: &str = "master";

/// Returns `true` when `node` is the local identity.
pub fn is_local_node(node: &str) -> bool {
    node == LOCAL_NODE
}
