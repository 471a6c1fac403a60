//! Session routing between the local node and remote nodes.

use std::sync::Arc;

use async_trait::async_trait;
use tilefarm_core::types::is_local_node;
use tilefarm_remote::{Connector, LocalConnector, NodeSession, SessionError};

/// Serves the local identity from the local machine and every other node
/// through `remote`.
pub struct FarmConnector {
    local: LocalConnector,
    remote: Arc<dyn Connector>,
}

impl FarmConnector {
    pub fn new(remote: Arc<dyn Connector>) -> Self {
        Self {
            local: LocalConnector,
            remote,
        }
    }
}

#[async_trait]
impl Connector for FarmConnector {
    async fn connect(&self, node: &str) -> Result<Arc<dyn NodeSession>, SessionError> {
        if is_local_node(node) {
            self.local.connect(node).await
        } else {
            tracing::info!(node, "Opening session");
            self.remote.connect(node).await
        }
    }
}
