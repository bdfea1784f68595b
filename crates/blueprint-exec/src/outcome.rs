//! Execution outcomes
//!
//! Per-node states, the structured failure value carried by terminal nodes,
//! and the report handed back when a plan finishes.

use std::time::Instant;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use blueprint_core::{NodeId, SourceSpan, Value};

/// Node state in the execution table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeState {
    /// Waiting on dependencies
    Pending,
    /// All dependencies satisfied, queued for dispatch
    Ready,
    /// Driver in flight (or inline evaluation underway)
    Running,
    /// Produced a result value
    Succeeded,
    /// Produced a structured error
    Failed,
    /// Did not complete because the plan was cancelled
    Cancelled,
}

impl NodeState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            NodeState::Succeeded | NodeState::Failed | NodeState::Cancelled
        )
    }
}

/// Why a node failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpErrorKind {
    /// The node's own driver reported a failure
    Operation,
    /// A data or ordering dependency failed first
    Dependency,
    /// The plan was cancelled while this node was pending or running
    Cancelled,
    /// The operation targeted an event-source handle that was closed
    Closed,
}

/// Structured error value attached to a `Failed` (or `Cancelled`) node.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{message}")]
pub struct OpError {
    pub kind: OpErrorKind,
    pub message: String,
}

impl OpError {
    pub fn operation(message: impl Into<String>) -> Self {
        Self {
            kind: OpErrorKind::Operation,
            message: message.into(),
        }
    }

    pub fn dependency(message: impl Into<String>) -> Self {
        Self {
            kind: OpErrorKind::Dependency,
            message: message.into(),
        }
    }

    pub fn cancelled() -> Self {
        Self {
            kind: OpErrorKind::Cancelled,
            message: "plan cancelled".to_string(),
        }
    }

    pub fn closed(message: impl Into<String>) -> Self {
        Self {
            kind: OpErrorKind::Closed,
            message: message.into(),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.kind == OpErrorKind::Cancelled
    }
}

/// Terminal facts about one node.
#[derive(Debug, Clone)]
pub struct NodeRecord {
    pub state: NodeState,
    pub result: Option<Value>,
    pub error: Option<OpError>,
    pub started_at: Option<Instant>,
    pub finished_at: Option<Instant>,
}

impl Default for NodeRecord {
    fn default() -> Self {
        Self {
            state: NodeState::Pending,
            result: None,
            error: None,
            started_at: None,
            finished_at: None,
        }
    }
}

/// Overall outcome of one plan execution.
#[derive(Debug, Clone)]
pub enum ExecutionOutcome {
    /// Every root succeeded
    Completed,
    /// At least one root failed; `node` is the originating failure, and
    /// `dependents` are the nodes that fell over with dependency errors
    /// because of it.
    Failed {
        node: NodeId,
        span: Option<SourceSpan>,
        error: OpError,
        dependents: Vec<NodeId>,
    },
    /// The plan was cancelled before the roots completed
    Cancelled,
}

/// What `Executor::run` hands back.
#[derive(Debug)]
pub struct ExecutionReport {
    pub run_id: String,
    pub outcome: ExecutionOutcome,
    records: Vec<NodeRecord>,
}

impl ExecutionReport {
    pub(crate) fn new(run_id: String, outcome: ExecutionOutcome, records: Vec<NodeRecord>) -> Self {
        Self {
            run_id,
            outcome,
            records,
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self.outcome, ExecutionOutcome::Completed)
    }

    pub fn state(&self, id: NodeId) -> Option<NodeState> {
        self.records.get(id.0 as usize).map(|r| r.state)
    }

    pub fn result(&self, id: NodeId) -> Option<&Value> {
        self.records.get(id.0 as usize)?.result.as_ref()
    }

    pub fn error(&self, id: NodeId) -> Option<&OpError> {
        self.records.get(id.0 as usize)?.error.as_ref()
    }

    /// Start/finish instants, present only for nodes whose driver actually
    /// ran.
    pub fn timing(&self, id: NodeId) -> Option<(Instant, Instant)> {
        let record = self.records.get(id.0 as usize)?;
        Some((record.started_at?, record.finished_at?))
    }

    pub fn records(&self) -> &[NodeRecord] {
        &self.records
    }
}
