//! Execution progress reporting

use async_trait::async_trait;

use blueprint_core::NodeId;

/// Lifecycle event emitted while a plan runs.
#[derive(Debug, Clone)]
pub struct ExecEvent {
    pub run_id: String,
    pub node: Option<NodeId>,
    pub kind: Option<String>,
    /// Phase label, e.g. node_started/node_succeeded/run_completed.
    pub phase: String,
    /// Optional human-readable message.
    pub message: Option<String>,
}

impl ExecEvent {
    pub fn new(run_id: impl Into<String>, phase: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            node: None,
            kind: None,
            phase: phase.into(),
            message: None,
        }
    }

    pub fn with_node(mut self, node: NodeId, kind: impl Into<String>) -> Self {
        self.node = Some(node);
        self.kind = Some(kind.into());
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

/// Sink interface for execution progress events.
#[async_trait]
pub trait ExecutionObserver: Send + Sync {
    async fn observe(&self, event: ExecEvent) -> Result<(), String>;
}
