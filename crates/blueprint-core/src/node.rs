//! Plan node catalogue
//!
//! Every intrinsic the script can call allocates exactly one node. The kind
//! tag plus its argument bundle is the whole contract between the planning
//! phase and the executor; argument values may contain `Deferred` references
//! which the plan builder turns into data dependencies.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::value::Value;

/// Identifier of a plan node, assigned monotonically during planning.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct NodeId(pub u64);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "@{}", self.0)
    }
}

/// Source location carried for error reporting. Not executor-visible.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceSpan {
    pub file: String,
    pub line: u32,
    pub column: u32,
}

impl fmt::Display for SourceSpan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.file, self.line, self.column)
    }
}

/// Target stream for console output nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsoleStream {
    Stdout,
    Stderr,
}

/// What kind of long-lived source an `EventSource` node opens.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventSourceSpec {
    TcpConnect { host: Value, port: Value },
    TcpListen { host: Value, port: Value },
    Udp { host: Value, port: Value },
    UnixConnect { path: Value },
    UnixListen { path: Value },
}

impl EventSourceSpec {
    pub fn kind_name(&self) -> &'static str {
        match self {
            EventSourceSpec::TcpConnect { .. } => "tcp_connect",
            EventSourceSpec::TcpListen { .. } => "tcp_listen",
            EventSourceSpec::Udp { .. } => "udp",
            EventSourceSpec::UnixConnect { .. } => "unix_connect",
            EventSourceSpec::UnixListen { .. } => "unix_listen",
        }
    }

    fn values(&self) -> Vec<&Value> {
        match self {
            EventSourceSpec::TcpConnect { host, port }
            | EventSourceSpec::TcpListen { host, port }
            | EventSourceSpec::Udp { host, port } => vec![host, port],
            EventSourceSpec::UnixConnect { path } | EventSourceSpec::UnixListen { path } => {
                vec![path]
            }
        }
    }

    fn map_values(&self, f: &impl Fn(&Value) -> Value) -> Self {
        match self {
            EventSourceSpec::TcpConnect { host, port } => EventSourceSpec::TcpConnect {
                host: f(host),
                port: f(port),
            },
            EventSourceSpec::TcpListen { host, port } => EventSourceSpec::TcpListen {
                host: f(host),
                port: f(port),
            },
            EventSourceSpec::Udp { host, port } => EventSourceSpec::Udp {
                host: f(host),
                port: f(port),
            },
            EventSourceSpec::UnixConnect { path } => {
                EventSourceSpec::UnixConnect { path: f(path) }
            }
            EventSourceSpec::UnixListen { path } => EventSourceSpec::UnixListen { path: f(path) },
        }
    }
}

/// Binary compute operators. Each is its own stable kind tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    FloorDiv,
    Mod,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Concat,
    Contains,
}

impl BinOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            BinOp::Add => "add",
            BinOp::Sub => "sub",
            BinOp::Mul => "mul",
            BinOp::Div => "div",
            BinOp::FloorDiv => "floor_div",
            BinOp::Mod => "mod",
            BinOp::Eq => "eq",
            BinOp::Ne => "ne",
            BinOp::Lt => "lt",
            BinOp::Le => "le",
            BinOp::Gt => "gt",
            BinOp::Ge => "ge",
            BinOp::Concat => "concat",
            BinOp::Contains => "contains",
        }
    }
}

/// Unary compute operators, including coercions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnOp {
    Neg,
    Not,
    ToBool,
    ToInt,
    ToFloat,
    ToStr,
    Len,
}

impl UnOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            UnOp::Neg => "neg",
            UnOp::Not => "not",
            UnOp::ToBool => "bool",
            UnOp::ToInt => "int",
            UnOp::ToFloat => "float",
            UnOp::ToStr => "str",
            UnOp::Len => "len",
        }
    }
}

/// Discriminated kind of a plan node plus its input bundle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    // File I/O
    ReadFile { path: Value },
    WriteFile { path: Value, content: Value },
    AppendFile { path: Value, content: Value },
    DeleteFile { path: Value },
    FileExists { path: Value },
    IsFile { path: Value },
    IsDir { path: Value },
    Mkdir { path: Value, recursive: bool },
    Rmdir { path: Value, recursive: bool },
    ListDir { path: Value },
    CopyFile { src: Value, dst: Value },
    MoveFile { src: Value, dst: Value },
    FileSize { path: Value },

    // Network
    HttpRequest {
        method: Value,
        url: Value,
        headers: Value,
        body: Value,
    },

    // Process
    Exec { argv: Value, cwd: Value, env: Value },
    EnvGet { name: Value, default: Value },

    // Time
    Sleep { seconds: Value },
    Now,

    // JSON
    JsonEncode { value: Value },
    JsonDecode { text: Value },

    // Console
    Print {
        stream: ConsoleStream,
        parts: Vec<Value>,
    },

    // Event sources and operations on their handles
    EventSource { source: EventSourceSpec },
    EventWrite {
        handle: Value,
        data: Value,
        dest: Value,
    },
    EventPoll {
        handles: Value,
        timeout_ms: Value,
    },
    EventClose { handle: Value },

    // Compute
    Binary { op: BinOp, lhs: Value, rhs: Value },
    Unary { op: UnOp, operand: Value },

    // Composition
    Gather { ops: Vec<NodeId> },
    Race { ops: Vec<NodeId> },
    AtLeast { ops: Vec<NodeId>, count: usize },
    AtMost { ops: Vec<NodeId>, count: usize },
    After {
        dependency: NodeId,
        value: NodeId,
    },
}

impl NodeKind {
    /// Stable tag used by plan files, rendering, and logs.
    pub fn name(&self) -> &'static str {
        match self {
            NodeKind::ReadFile { .. } => "read_file",
            NodeKind::WriteFile { .. } => "write_file",
            NodeKind::AppendFile { .. } => "append_file",
            NodeKind::DeleteFile { .. } => "delete_file",
            NodeKind::FileExists { .. } => "file_exists",
            NodeKind::IsFile { .. } => "is_file",
            NodeKind::IsDir { .. } => "is_dir",
            NodeKind::Mkdir { .. } => "mkdir",
            NodeKind::Rmdir { .. } => "rmdir",
            NodeKind::ListDir { .. } => "list_dir",
            NodeKind::CopyFile { .. } => "copy_file",
            NodeKind::MoveFile { .. } => "move_file",
            NodeKind::FileSize { .. } => "file_size",
            NodeKind::HttpRequest { .. } => "http_request",
            NodeKind::Exec { .. } => "exec",
            NodeKind::EnvGet { .. } => "env_get",
            NodeKind::Sleep { .. } => "sleep",
            NodeKind::Now => "now",
            NodeKind::JsonEncode { .. } => "json_encode",
            NodeKind::JsonDecode { .. } => "json_decode",
            NodeKind::Print {
                stream: ConsoleStream::Stdout,
                ..
            } => "stdout",
            NodeKind::Print {
                stream: ConsoleStream::Stderr,
                ..
            } => "stderr",
            NodeKind::EventSource { .. } => "event_source",
            NodeKind::EventWrite { .. } => "event_write",
            NodeKind::EventPoll { .. } => "event_poll",
            NodeKind::EventClose { .. } => "event_source_close",
            NodeKind::Binary { op, .. } => op.as_str(),
            NodeKind::Unary { op, .. } => op.as_str(),
            NodeKind::Gather { .. } => "gather",
            NodeKind::Race { .. } => "race",
            NodeKind::AtLeast { .. } => "at_least",
            NodeKind::AtMost { .. } => "at_most",
            NodeKind::After { .. } => "after",
        }
    }

    /// Every `Value` argument of this kind, for dependency collection.
    pub fn embedded_values(&self) -> Vec<&Value> {
        match self {
            NodeKind::ReadFile { path }
            | NodeKind::DeleteFile { path }
            | NodeKind::FileExists { path }
            | NodeKind::IsFile { path }
            | NodeKind::IsDir { path }
            | NodeKind::Mkdir { path, .. }
            | NodeKind::Rmdir { path, .. }
            | NodeKind::ListDir { path }
            | NodeKind::FileSize { path } => vec![path],
            NodeKind::WriteFile { path, content } | NodeKind::AppendFile { path, content } => {
                vec![path, content]
            }
            NodeKind::CopyFile { src, dst } | NodeKind::MoveFile { src, dst } => vec![src, dst],
            NodeKind::HttpRequest {
                method,
                url,
                headers,
                body,
            } => vec![method, url, headers, body],
            NodeKind::Exec { argv, cwd, env } => vec![argv, cwd, env],
            NodeKind::EnvGet { name, default } => vec![name, default],
            NodeKind::Sleep { seconds } => vec![seconds],
            NodeKind::Now => vec![],
            NodeKind::JsonEncode { value } => vec![value],
            NodeKind::JsonDecode { text } => vec![text],
            NodeKind::Print { parts, .. } => parts.iter().collect(),
            NodeKind::EventSource { source } => source.values(),
            NodeKind::EventWrite { handle, data, dest } => vec![handle, data, dest],
            NodeKind::EventPoll {
                handles,
                timeout_ms,
            } => vec![handles, timeout_ms],
            NodeKind::EventClose { handle } => vec![handle],
            NodeKind::Binary { lhs, rhs, .. } => vec![lhs, rhs],
            NodeKind::Unary { operand, .. } => vec![operand],
            NodeKind::Gather { .. }
            | NodeKind::Race { .. }
            | NodeKind::AtLeast { .. }
            | NodeKind::AtMost { .. }
            | NodeKind::After { .. } => vec![],
        }
    }

    /// Node ids a composition kind waits on directly (not via `Deferred`).
    pub fn listed_nodes(&self) -> Vec<NodeId> {
        match self {
            NodeKind::Gather { ops }
            | NodeKind::Race { ops }
            | NodeKind::AtLeast { ops, .. }
            | NodeKind::AtMost { ops, .. } => ops.clone(),
            NodeKind::After { dependency, value } => vec![*dependency, *value],
            _ => vec![],
        }
    }

    /// Clone this kind with every embedded `Value` passed through `f`.
    ///
    /// The executor uses this to substitute deferred references with the
    /// results of their producing nodes before dispatching a driver.
    pub fn map_values(&self, f: &impl Fn(&Value) -> Value) -> NodeKind {
        match self {
            NodeKind::ReadFile { path } => NodeKind::ReadFile { path: f(path) },
            NodeKind::WriteFile { path, content } => NodeKind::WriteFile {
                path: f(path),
                content: f(content),
            },
            NodeKind::AppendFile { path, content } => NodeKind::AppendFile {
                path: f(path),
                content: f(content),
            },
            NodeKind::DeleteFile { path } => NodeKind::DeleteFile { path: f(path) },
            NodeKind::FileExists { path } => NodeKind::FileExists { path: f(path) },
            NodeKind::IsFile { path } => NodeKind::IsFile { path: f(path) },
            NodeKind::IsDir { path } => NodeKind::IsDir { path: f(path) },
            NodeKind::Mkdir { path, recursive } => NodeKind::Mkdir {
                path: f(path),
                recursive: *recursive,
            },
            NodeKind::Rmdir { path, recursive } => NodeKind::Rmdir {
                path: f(path),
                recursive: *recursive,
            },
            NodeKind::ListDir { path } => NodeKind::ListDir { path: f(path) },
            NodeKind::CopyFile { src, dst } => NodeKind::CopyFile {
                src: f(src),
                dst: f(dst),
            },
            NodeKind::MoveFile { src, dst } => NodeKind::MoveFile {
                src: f(src),
                dst: f(dst),
            },
            NodeKind::FileSize { path } => NodeKind::FileSize { path: f(path) },
            NodeKind::HttpRequest {
                method,
                url,
                headers,
                body,
            } => NodeKind::HttpRequest {
                method: f(method),
                url: f(url),
                headers: f(headers),
                body: f(body),
            },
            NodeKind::Exec { argv, cwd, env } => NodeKind::Exec {
                argv: f(argv),
                cwd: f(cwd),
                env: f(env),
            },
            NodeKind::EnvGet { name, default } => NodeKind::EnvGet {
                name: f(name),
                default: f(default),
            },
            NodeKind::Sleep { seconds } => NodeKind::Sleep {
                seconds: f(seconds),
            },
            NodeKind::Now => NodeKind::Now,
            NodeKind::JsonEncode { value } => NodeKind::JsonEncode { value: f(value) },
            NodeKind::JsonDecode { text } => NodeKind::JsonDecode { text: f(text) },
            NodeKind::Print { stream, parts } => NodeKind::Print {
                stream: *stream,
                parts: parts.iter().map(f).collect(),
            },
            NodeKind::EventSource { source } => NodeKind::EventSource {
                source: source.map_values(f),
            },
            NodeKind::EventWrite { handle, data, dest } => NodeKind::EventWrite {
                handle: f(handle),
                data: f(data),
                dest: f(dest),
            },
            NodeKind::EventPoll {
                handles,
                timeout_ms,
            } => NodeKind::EventPoll {
                handles: f(handles),
                timeout_ms: f(timeout_ms),
            },
            NodeKind::EventClose { handle } => NodeKind::EventClose { handle: f(handle) },
            NodeKind::Binary { op, lhs, rhs } => NodeKind::Binary {
                op: *op,
                lhs: f(lhs),
                rhs: f(rhs),
            },
            NodeKind::Unary { op, operand } => NodeKind::Unary {
                op: *op,
                operand: f(operand),
            },
            other @ (NodeKind::Gather { .. }
            | NodeKind::Race { .. }
            | NodeKind::AtLeast { .. }
            | NodeKind::AtMost { .. }
            | NodeKind::After { .. }) => other.clone(),
        }
    }

    /// Compute kinds never suspend and run inline on the scheduler.
    pub fn is_inline(&self) -> bool {
        matches!(
            self,
            NodeKind::Binary { .. }
                | NodeKind::Unary { .. }
                | NodeKind::JsonEncode { .. }
                | NodeKind::JsonDecode { .. }
                | NodeKind::EnvGet { .. }
                | NodeKind::Now
        )
    }

    /// Composition kinds are settled from their listed ops' states; no
    /// driver runs for them.
    pub fn is_composition(&self) -> bool {
        matches!(
            self,
            NodeKind::Gather { .. }
                | NodeKind::Race { .. }
                | NodeKind::AtLeast { .. }
                | NodeKind::AtMost { .. }
                | NodeKind::After { .. }
        )
    }

    /// Kinds whose effects are observable even when the script discards the
    /// result. These are rooted implicitly so discarding the handle does not
    /// drop the work.
    pub fn has_observable_effects(&self) -> bool {
        matches!(
            self,
            NodeKind::ReadFile { .. }
                | NodeKind::WriteFile { .. }
                | NodeKind::AppendFile { .. }
                | NodeKind::DeleteFile { .. }
                | NodeKind::FileExists { .. }
                | NodeKind::IsFile { .. }
                | NodeKind::IsDir { .. }
                | NodeKind::Mkdir { .. }
                | NodeKind::Rmdir { .. }
                | NodeKind::ListDir { .. }
                | NodeKind::CopyFile { .. }
                | NodeKind::MoveFile { .. }
                | NodeKind::FileSize { .. }
                | NodeKind::HttpRequest { .. }
                | NodeKind::Exec { .. }
                | NodeKind::Sleep { .. }
                | NodeKind::Print { .. }
                | NodeKind::EventSource { .. }
                | NodeKind::EventWrite { .. }
                | NodeKind::EventPoll { .. }
                | NodeKind::EventClose { .. }
        )
    }

    /// Key/value pairs for the text rendering of a plan.
    pub fn summary_fields(&self) -> Vec<(&'static str, String)> {
        fn list(ops: &[NodeId]) -> String {
            let ids: Vec<String> = ops.iter().map(|op| op.to_string()).collect();
            format!("[{}]", ids.join(", "))
        }

        match self {
            NodeKind::ReadFile { path }
            | NodeKind::DeleteFile { path }
            | NodeKind::FileExists { path }
            | NodeKind::IsFile { path }
            | NodeKind::IsDir { path }
            | NodeKind::ListDir { path }
            | NodeKind::FileSize { path } => vec![("path", path.to_string())],
            NodeKind::Mkdir { path, recursive } | NodeKind::Rmdir { path, recursive } => vec![
                ("path", path.to_string()),
                ("recursive", recursive.to_string()),
            ],
            NodeKind::WriteFile { path, content } | NodeKind::AppendFile { path, content } => {
                vec![("path", path.to_string()), ("content", content.to_string())]
            }
            NodeKind::CopyFile { src, dst } | NodeKind::MoveFile { src, dst } => {
                vec![("src", src.to_string()), ("dst", dst.to_string())]
            }
            NodeKind::HttpRequest { method, url, .. } => {
                vec![("method", method.to_string()), ("url", url.to_string())]
            }
            NodeKind::Exec { argv, .. } => vec![("argv", argv.to_string())],
            NodeKind::EnvGet { name, .. } => vec![("name", name.to_string())],
            NodeKind::Sleep { seconds } => vec![("seconds", seconds.to_string())],
            NodeKind::Now => vec![],
            NodeKind::JsonEncode { value } => vec![("value", value.to_string())],
            NodeKind::JsonDecode { text } => vec![("text", text.to_string())],
            NodeKind::Print { parts, .. } => vec![(
                "parts",
                format!(
                    "[{}]",
                    parts
                        .iter()
                        .map(Value::to_string)
                        .collect::<Vec<_>>()
                        .join(", ")
                ),
            )],
            NodeKind::EventSource { source } => {
                let mut fields = vec![("source", source.kind_name().to_string())];
                match source {
                    EventSourceSpec::TcpConnect { host, port }
                    | EventSourceSpec::TcpListen { host, port }
                    | EventSourceSpec::Udp { host, port } => {
                        fields.push(("host", host.to_string()));
                        fields.push(("port", port.to_string()));
                    }
                    EventSourceSpec::UnixConnect { path }
                    | EventSourceSpec::UnixListen { path } => {
                        fields.push(("path", path.to_string()));
                    }
                }
                fields
            }
            NodeKind::EventWrite { handle, data, .. } => {
                vec![("handle", handle.to_string()), ("data", data.to_string())]
            }
            NodeKind::EventPoll {
                handles,
                timeout_ms,
            } => vec![
                ("handles", handles.to_string()),
                ("timeout_ms", timeout_ms.to_string()),
            ],
            NodeKind::EventClose { handle } => vec![("handle", handle.to_string())],
            NodeKind::Binary { lhs, rhs, .. } => {
                vec![("lhs", lhs.to_string()), ("rhs", rhs.to_string())]
            }
            NodeKind::Unary { operand, .. } => vec![("operand", operand.to_string())],
            NodeKind::Gather { ops } | NodeKind::Race { ops } => vec![("ops", list(ops))],
            NodeKind::AtLeast { ops, count } | NodeKind::AtMost { ops, count } => {
                vec![("ops", list(ops)), ("count", count.to_string())]
            }
            NodeKind::After { dependency, value } => vec![
                ("dependency", dependency.to_string()),
                ("value", value.to_string()),
            ],
        }
    }
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let fields = self.summary_fields();
        if fields.is_empty() {
            return write!(f, "{}()", self.name());
        }
        let args: Vec<String> = fields
            .into_iter()
            .map(|(key, value)| format!("{}={}", key, value))
            .collect();
        write!(f, "{}({})", self.name(), args.join(", "))
    }
}

/// A single unit of work in the plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub kind: NodeKind,
    /// Nodes whose results this node consumes.
    pub data_deps: Vec<NodeId>,
    /// Nodes that must succeed before this node starts; values not consumed.
    pub order_deps: Vec<NodeId>,
    pub span: Option<SourceSpan>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_names_are_stable() {
        assert_eq!(
            NodeKind::ReadFile {
                path: Value::String("a".into())
            }
            .name(),
            "read_file"
        );
        assert_eq!(
            NodeKind::Binary {
                op: BinOp::FloorDiv,
                lhs: Value::Int(1),
                rhs: Value::Int(2)
            }
            .name(),
            "floor_div"
        );
        assert_eq!(NodeKind::Gather { ops: vec![] }.name(), "gather");
    }

    #[test]
    fn test_listed_nodes_for_compositions() {
        let kind = NodeKind::AtLeast {
            ops: vec![NodeId(1), NodeId(4)],
            count: 1,
        };
        assert_eq!(kind.listed_nodes(), vec![NodeId(1), NodeId(4)]);

        let after = NodeKind::After {
            dependency: NodeId(0),
            value: NodeId(2),
        };
        assert_eq!(after.listed_nodes(), vec![NodeId(0), NodeId(2)]);
    }

    #[test]
    fn test_map_values_substitutes_nested_arguments() {
        let kind = NodeKind::WriteFile {
            path: Value::Deferred(NodeId(0)),
            content: Value::List(vec![Value::Deferred(NodeId(1))]),
        };
        let resolved = kind.map_values(&|v| v.resolve(&|_| Value::String("x".into())));
        assert_eq!(
            resolved,
            NodeKind::WriteFile {
                path: Value::String("x".into()),
                content: Value::List(vec![Value::String("x".into())]),
            }
        );
    }

    #[test]
    fn test_effect_classification() {
        assert!(NodeKind::Sleep {
            seconds: Value::Int(1)
        }
        .has_observable_effects());
        assert!(!NodeKind::Binary {
            op: BinOp::Add,
            lhs: Value::Int(1),
            rhs: Value::Int(2)
        }
        .has_observable_effects());
        assert!(!NodeKind::Gather { ops: vec![] }.has_observable_effects());
    }
}
