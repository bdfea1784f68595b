//! Planning-phase error types

use thiserror::Error;

use crate::node::NodeId;

/// Errors raised while the script is still building the plan.
///
/// These surface to the script host as evaluation errors; nothing has
/// executed yet when one of these is produced.
#[derive(Debug, Clone, Error)]
pub enum ScriptError {
    /// The script tried to branch on (or otherwise observe) a value that
    /// does not exist until execution time.
    #[error("cannot branch on unresolved operation {node}; its value only exists at execution time")]
    DeferredBranch { node: NodeId },

    #[error("{intrinsic}() takes {expected} argument(s) ({got} given)")]
    WrongArity {
        intrinsic: &'static str,
        expected: &'static str,
        got: usize,
    },

    #[error("{intrinsic}() argument '{arg}' must be {expected}, got {got}")]
    BadArgument {
        intrinsic: &'static str,
        arg: &'static str,
        expected: &'static str,
        got: String,
    },

    /// Combinators compose operations, not plain values.
    #[error("{intrinsic}() expects operation handles, got {got}")]
    ExpectedHandle {
        intrinsic: &'static str,
        got: String,
    },

    #[error("unknown intrinsic '{name}'")]
    UnknownIntrinsic { name: String },
}

/// Errors raised by the plan graph itself.
#[derive(Debug, Clone, Error)]
pub enum PlanError {
    #[error("node {node} is not part of this plan")]
    UnknownNode { node: NodeId },

    #[error("ordering edge would make {node} depend on itself")]
    SelfEdge { node: NodeId },

    /// Crossed `after` edges can close a loop; the plan refuses to freeze.
    #[error("plan contains a dependency cycle involving {}", format_nodes(nodes))]
    Cycle { nodes: Vec<NodeId> },
}

fn format_nodes(nodes: &[NodeId]) -> String {
    let ids: Vec<String> = nodes.iter().map(|n| n.to_string()).collect();
    ids.join(", ")
}
