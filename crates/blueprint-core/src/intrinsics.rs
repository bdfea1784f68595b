//! Intrinsic surface
//!
//! The fixed set of script-callable primitives. Each call allocates one plan
//! node and returns a `Deferred`; nothing executes here. The script host
//! binds the flat `__bp_*` names through [`PlanSession::call`]; the typed
//! methods underneath are what the surface standard library re-exports under
//! structured namespaces.
//!
//! Argument shapes are validated at planning time whenever an operand is
//! already materialized; a `Deferred` operand passes through and is validated
//! by the executor after resolution.

use crate::error::{PlanError, ScriptError};
use crate::node::{
    BinOp, ConsoleStream, EventSourceSpec, NodeId, NodeKind, SourceSpan, UnOp,
};
use crate::plan::{Plan, PlanBuilder};
use crate::value::Value;

/// One planning session: wraps the plan builder for the lifetime of a script
/// evaluation and hands out deferred handles.
#[derive(Debug, Default)]
pub struct PlanSession {
    builder: PlanBuilder,
    current_span: Option<SourceSpan>,
}

impl PlanSession {
    pub fn new() -> Self {
        Self::default()
    }

    /// Source location attached to the next allocated node.
    pub fn set_span(&mut self, span: Option<SourceSpan>) {
        self.current_span = span;
    }

    pub fn mark_root(&mut self, value: &Value) {
        self.builder.mark_root(value);
    }

    /// End of planning: validate and seal the plan.
    pub fn freeze(self) -> Result<Plan, PlanError> {
        self.builder.freeze()
    }

    fn push(&mut self, kind: NodeKind) -> Value {
        let span = self.current_span.take();
        self.builder.push(kind, span)
    }

    // ---- file I/O ----------------------------------------------------

    pub fn read_file(&mut self, path: Value) -> Result<Value, ScriptError> {
        expect_string("read_file", "path", &path)?;
        Ok(self.push(NodeKind::ReadFile { path }))
    }

    pub fn write_file(&mut self, path: Value, content: Value) -> Result<Value, ScriptError> {
        expect_string("write_file", "path", &path)?;
        expect_text("write_file", "content", &content)?;
        Ok(self.push(NodeKind::WriteFile { path, content }))
    }

    pub fn append_file(&mut self, path: Value, content: Value) -> Result<Value, ScriptError> {
        expect_string("append_file", "path", &path)?;
        expect_text("append_file", "content", &content)?;
        Ok(self.push(NodeKind::AppendFile { path, content }))
    }

    pub fn delete_file(&mut self, path: Value) -> Result<Value, ScriptError> {
        expect_string("delete_file", "path", &path)?;
        Ok(self.push(NodeKind::DeleteFile { path }))
    }

    pub fn file_exists(&mut self, path: Value) -> Result<Value, ScriptError> {
        expect_string("file_exists", "path", &path)?;
        Ok(self.push(NodeKind::FileExists { path }))
    }

    pub fn is_file(&mut self, path: Value) -> Result<Value, ScriptError> {
        expect_string("is_file", "path", &path)?;
        Ok(self.push(NodeKind::IsFile { path }))
    }

    pub fn is_dir(&mut self, path: Value) -> Result<Value, ScriptError> {
        expect_string("is_dir", "path", &path)?;
        Ok(self.push(NodeKind::IsDir { path }))
    }

    pub fn mkdir(&mut self, path: Value, recursive: bool) -> Result<Value, ScriptError> {
        expect_string("mkdir", "path", &path)?;
        Ok(self.push(NodeKind::Mkdir { path, recursive }))
    }

    pub fn rmdir(&mut self, path: Value, recursive: bool) -> Result<Value, ScriptError> {
        expect_string("rmdir", "path", &path)?;
        Ok(self.push(NodeKind::Rmdir { path, recursive }))
    }

    pub fn list_dir(&mut self, path: Value) -> Result<Value, ScriptError> {
        expect_string("list_dir", "path", &path)?;
        Ok(self.push(NodeKind::ListDir { path }))
    }

    pub fn copy_file(&mut self, src: Value, dst: Value) -> Result<Value, ScriptError> {
        expect_string("copy_file", "src", &src)?;
        expect_string("copy_file", "dst", &dst)?;
        Ok(self.push(NodeKind::CopyFile { src, dst }))
    }

    pub fn move_file(&mut self, src: Value, dst: Value) -> Result<Value, ScriptError> {
        expect_string("move_file", "src", &src)?;
        expect_string("move_file", "dst", &dst)?;
        Ok(self.push(NodeKind::MoveFile { src, dst }))
    }

    pub fn file_size(&mut self, path: Value) -> Result<Value, ScriptError> {
        expect_string("file_size", "path", &path)?;
        Ok(self.push(NodeKind::FileSize { path }))
    }

    // ---- network -----------------------------------------------------

    pub fn http_request(
        &mut self,
        method: Value,
        url: Value,
        body: Value,
        headers: Value,
    ) -> Result<Value, ScriptError> {
        expect_string("http_request", "method", &method)?;
        expect_string("http_request", "url", &url)?;
        expect_map_or_null("http_request", "headers", &headers)?;
        Ok(self.push(NodeKind::HttpRequest {
            method,
            url,
            headers,
            body,
        }))
    }

    // ---- process -----------------------------------------------------

    pub fn exec(&mut self, argv: Value, cwd: Value, env: Value) -> Result<Value, ScriptError> {
        expect_list("exec", "argv", &argv)?;
        expect_string_or_null("exec", "cwd", &cwd)?;
        expect_map_or_null("exec", "env", &env)?;
        Ok(self.push(NodeKind::Exec { argv, cwd, env }))
    }

    pub fn env_get(&mut self, name: Value, default: Value) -> Result<Value, ScriptError> {
        expect_string("env_get", "name", &name)?;
        Ok(self.push(NodeKind::EnvGet { name, default }))
    }

    // ---- time --------------------------------------------------------

    pub fn sleep(&mut self, seconds: Value) -> Result<Value, ScriptError> {
        expect_number("sleep", "seconds", &seconds)?;
        Ok(self.push(NodeKind::Sleep { seconds }))
    }

    pub fn now(&mut self) -> Value {
        self.push(NodeKind::Now)
    }

    // ---- json --------------------------------------------------------

    pub fn json_encode(&mut self, value: Value) -> Value {
        self.push(NodeKind::JsonEncode { value })
    }

    pub fn json_decode(&mut self, text: Value) -> Result<Value, ScriptError> {
        expect_string("json_decode", "text", &text)?;
        Ok(self.push(NodeKind::JsonDecode { text }))
    }

    // ---- console -----------------------------------------------------

    pub fn stdout(&mut self, parts: Vec<Value>) -> Value {
        self.push(NodeKind::Print {
            stream: ConsoleStream::Stdout,
            parts,
        })
    }

    pub fn stderr(&mut self, parts: Vec<Value>) -> Value {
        self.push(NodeKind::Print {
            stream: ConsoleStream::Stderr,
            parts,
        })
    }

    // ---- event sources -----------------------------------------------

    pub fn tcp_connect(&mut self, host: Value, port: Value) -> Result<Value, ScriptError> {
        expect_string("tcp_connect", "host", &host)?;
        expect_int("tcp_connect", "port", &port)?;
        Ok(self.push(NodeKind::EventSource {
            source: EventSourceSpec::TcpConnect { host, port },
        }))
    }

    pub fn tcp_listen(&mut self, host: Value, port: Value) -> Result<Value, ScriptError> {
        expect_string("tcp_listen", "host", &host)?;
        expect_int("tcp_listen", "port", &port)?;
        Ok(self.push(NodeKind::EventSource {
            source: EventSourceSpec::TcpListen { host, port },
        }))
    }

    pub fn udp_bind(&mut self, host: Value, port: Value) -> Result<Value, ScriptError> {
        expect_string("udp", "host", &host)?;
        expect_int("udp", "port", &port)?;
        Ok(self.push(NodeKind::EventSource {
            source: EventSourceSpec::Udp { host, port },
        }))
    }

    pub fn unix_connect(&mut self, path: Value) -> Result<Value, ScriptError> {
        expect_string("unix_connect", "path", &path)?;
        Ok(self.push(NodeKind::EventSource {
            source: EventSourceSpec::UnixConnect { path },
        }))
    }

    pub fn unix_listen(&mut self, path: Value) -> Result<Value, ScriptError> {
        expect_string("unix_listen", "path", &path)?;
        Ok(self.push(NodeKind::EventSource {
            source: EventSourceSpec::UnixListen { path },
        }))
    }

    pub fn event_write(
        &mut self,
        handle: Value,
        data: Value,
        dest: Value,
    ) -> Result<Value, ScriptError> {
        expect_int("event_write", "handle", &handle)?;
        expect_text("event_write", "data", &data)?;
        Ok(self.push(NodeKind::EventWrite { handle, data, dest }))
    }

    pub fn event_poll(&mut self, handles: Value, timeout_ms: Value) -> Result<Value, ScriptError> {
        expect_list("event_poll", "handles", &handles)?;
        expect_int_or_null("event_poll", "timeout_ms", &timeout_ms)?;
        Ok(self.push(NodeKind::EventPoll {
            handles,
            timeout_ms,
        }))
    }

    pub fn event_close(&mut self, handle: Value) -> Result<Value, ScriptError> {
        expect_int("event_close", "handle", &handle)?;
        Ok(self.push(NodeKind::EventClose { handle }))
    }

    // ---- compute -----------------------------------------------------

    pub fn binary(&mut self, op: BinOp, lhs: Value, rhs: Value) -> Value {
        self.push(NodeKind::Binary { op, lhs, rhs })
    }

    pub fn unary(&mut self, op: UnOp, operand: Value) -> Value {
        self.push(NodeKind::Unary { op, operand })
    }

    // ---- composition -------------------------------------------------

    pub fn gather(&mut self, ops: Vec<Value>) -> Result<Value, ScriptError> {
        let ops = expect_handles("gather", ops)?;
        Ok(self.push(NodeKind::Gather { ops }))
    }

    pub fn race(&mut self, ops: Vec<Value>) -> Result<Value, ScriptError> {
        let ops = expect_handles("race", ops)?;
        Ok(self.push(NodeKind::Race { ops }))
    }

    pub fn at_least(&mut self, count: Value, ops: Vec<Value>) -> Result<Value, ScriptError> {
        let count = expect_count("at_least", &count)?;
        let ops = expect_handles("at_least", ops)?;
        Ok(self.push(NodeKind::AtLeast { ops, count }))
    }

    pub fn at_most(&mut self, count: Value, ops: Vec<Value>) -> Result<Value, ScriptError> {
        let count = expect_count("at_most", &count)?;
        let ops = expect_handles("at_most", ops)?;
        Ok(self.push(NodeKind::AtMost { ops, count }))
    }

    /// `after(x, y)`: result is `y`'s result, and `y` will not start until
    /// `x` has succeeded. The ordering edge lands on the underlying `y` node.
    pub fn after(&mut self, dependency: Value, value: Value) -> Result<Value, ScriptError> {
        let dep_id = expect_handle("after", &dependency)?;
        let value_id = expect_handle("after", &value)?;
        if dep_id == value_id {
            return Err(ScriptError::BadArgument {
                intrinsic: "after",
                arg: "value",
                expected: "an operation distinct from the dependency",
                got: value_id.to_string(),
            });
        }
        self.builder
            .add_order_edge(value_id, dep_id)
            .map_err(|_| ScriptError::ExpectedHandle {
                intrinsic: "after",
                got: value_id.to_string(),
            })?;
        Ok(self.push(NodeKind::After {
            dependency: dep_id,
            value: value_id,
        }))
    }

    /// `sequence(ops)`: a plan-time rewrite. Each listed op gains an ordering
    /// edge on its predecessor, then a `gather` collects the results in list
    /// order. There is no dedicated executor path for sequences.
    pub fn sequence(&mut self, ops: Vec<Value>) -> Result<Value, ScriptError> {
        let ids = expect_handles("sequence", ops)?;
        for window in ids.windows(2) {
            if window[0] == window[1] {
                continue;
            }
            self.builder
                .add_order_edge(window[1], window[0])
                .map_err(|_| ScriptError::ExpectedHandle {
                    intrinsic: "sequence",
                    got: window[1].to_string(),
                })?;
        }
        Ok(self.push(NodeKind::Gather { ops: ids }))
    }

    // ---- flat host surface -------------------------------------------

    /// Dispatch one `__bp_*` intrinsic by name. This is the binding surface
    /// the embedded-language host calls; every name returns a `Deferred`.
    pub fn call(
        &mut self,
        name: &str,
        mut args: Vec<Value>,
        span: Option<SourceSpan>,
    ) -> Result<Value, ScriptError> {
        self.set_span(span);

        fn take2(args: &mut Vec<Value>) -> (Value, Value) {
            let b = args.pop().unwrap_or(Value::Null);
            let a = args.pop().unwrap_or(Value::Null);
            (a, b)
        }

        macro_rules! arity {
            ($name:literal, $expected:literal, $n:expr) => {
                if args.len() != $n {
                    return Err(ScriptError::WrongArity {
                        intrinsic: $name,
                        expected: $expected,
                        got: args.len(),
                    });
                }
            };
        }
        macro_rules! arity_range {
            ($name:literal, $expected:literal, $lo:expr, $hi:expr) => {
                if args.len() < $lo || args.len() > $hi {
                    return Err(ScriptError::WrongArity {
                        intrinsic: $name,
                        expected: $expected,
                        got: args.len(),
                    });
                }
            };
        }

        match name {
            "__bp_read_file" => {
                arity!("read_file", "1", 1);
                self.read_file(args.remove(0))
            }
            "__bp_write_file" => {
                arity!("write_file", "2", 2);
                let (path, content) = take2(&mut args);
                self.write_file(path, content)
            }
            "__bp_append_file" => {
                arity!("append_file", "2", 2);
                let (path, content) = take2(&mut args);
                self.append_file(path, content)
            }
            "__bp_delete_file" => {
                arity!("delete_file", "1", 1);
                self.delete_file(args.remove(0))
            }
            "__bp_file_exists" => {
                arity!("file_exists", "1", 1);
                self.file_exists(args.remove(0))
            }
            "__bp_is_file" => {
                arity!("is_file", "1", 1);
                self.is_file(args.remove(0))
            }
            "__bp_is_dir" => {
                arity!("is_dir", "1", 1);
                self.is_dir(args.remove(0))
            }
            "__bp_mkdir" => {
                arity_range!("mkdir", "1 or 2", 1, 2);
                let recursive = optional_flag("mkdir", "recursive", &mut args, 1)?;
                self.mkdir(args.remove(0), recursive)
            }
            "__bp_rmdir" => {
                arity_range!("rmdir", "1 or 2", 1, 2);
                let recursive = optional_flag("rmdir", "recursive", &mut args, 1)?;
                self.rmdir(args.remove(0), recursive)
            }
            "__bp_list_dir" => {
                arity!("list_dir", "1", 1);
                self.list_dir(args.remove(0))
            }
            "__bp_copy_file" => {
                arity!("copy_file", "2", 2);
                let (src, dst) = take2(&mut args);
                self.copy_file(src, dst)
            }
            "__bp_move_file" => {
                arity!("move_file", "2", 2);
                let (src, dst) = take2(&mut args);
                self.move_file(src, dst)
            }
            "__bp_file_size" => {
                arity!("file_size", "1", 1);
                self.file_size(args.remove(0))
            }
            "__bp_http_request" => {
                arity_range!("http_request", "2 to 4", 2, 4);
                let headers = if args.len() > 3 { args.remove(3) } else { Value::Null };
                let body = if args.len() > 2 { args.remove(2) } else { Value::Null };
                let (method, url) = take2(&mut args);
                self.http_request(method, url, body, headers)
            }
            "__bp_exec" => {
                arity_range!("exec", "1 to 3", 1, 3);
                let env = if args.len() > 2 { args.remove(2) } else { Value::Null };
                let cwd = if args.len() > 1 { args.remove(1) } else { Value::Null };
                self.exec(args.remove(0), cwd, env)
            }
            "__bp_env_get" => {
                arity_range!("env_get", "1 or 2", 1, 2);
                let default = if args.len() > 1 { args.remove(1) } else { Value::Null };
                self.env_get(args.remove(0), default)
            }
            "__bp_sleep" => {
                arity!("sleep", "1", 1);
                self.sleep(args.remove(0))
            }
            "__bp_now" => {
                arity!("now", "0", 0);
                Ok(self.now())
            }
            "__bp_json_encode" => {
                arity!("json_encode", "1", 1);
                Ok(self.json_encode(args.remove(0)))
            }
            "__bp_json_decode" => {
                arity!("json_decode", "1", 1);
                self.json_decode(args.remove(0))
            }
            "__bp_stdout" => Ok(self.stdout(args)),
            "__bp_stderr" => Ok(self.stderr(args)),
            "__bp_event_source" => {
                arity!("event_source", "2", 2);
                let (kind, params) = take2(&mut args);
                self.event_source(kind, params)
            }
            "__bp_event_write" => {
                arity_range!("event_write", "2 or 3", 2, 3);
                let dest = if args.len() > 2 { args.remove(2) } else { Value::Null };
                let (handle, data) = take2(&mut args);
                self.event_write(handle, data, dest)
            }
            "__bp_event_poll" => {
                arity_range!("event_poll", "1 or 2", 1, 2);
                let timeout = if args.len() > 1 { args.remove(1) } else { Value::Null };
                self.event_poll(args.remove(0), timeout)
            }
            "__bp_event_source_close" => {
                arity!("event_source_close", "1", 1);
                self.event_close(args.remove(0))
            }
            "__bp_add" | "__bp_sub" | "__bp_mul" | "__bp_div" | "__bp_floor_div" | "__bp_mod"
            | "__bp_eq" | "__bp_ne" | "__bp_lt" | "__bp_le" | "__bp_gt" | "__bp_ge"
            | "__bp_concat" | "__bp_contains" => {
                arity!("binary op", "2", 2);
                let op = match name {
                    "__bp_add" => BinOp::Add,
                    "__bp_sub" => BinOp::Sub,
                    "__bp_mul" => BinOp::Mul,
                    "__bp_div" => BinOp::Div,
                    "__bp_floor_div" => BinOp::FloorDiv,
                    "__bp_mod" => BinOp::Mod,
                    "__bp_eq" => BinOp::Eq,
                    "__bp_ne" => BinOp::Ne,
                    "__bp_lt" => BinOp::Lt,
                    "__bp_le" => BinOp::Le,
                    "__bp_gt" => BinOp::Gt,
                    "__bp_ge" => BinOp::Ge,
                    "__bp_concat" => BinOp::Concat,
                    _ => BinOp::Contains,
                };
                let (lhs, rhs) = take2(&mut args);
                Ok(self.binary(op, lhs, rhs))
            }
            "__bp_neg" | "__bp_not" | "__bp_bool" | "__bp_int" | "__bp_float" | "__bp_str"
            | "__bp_len" => {
                arity!("unary op", "1", 1);
                let op = match name {
                    "__bp_neg" => UnOp::Neg,
                    "__bp_not" => UnOp::Not,
                    "__bp_bool" => UnOp::ToBool,
                    "__bp_int" => UnOp::ToInt,
                    "__bp_float" => UnOp::ToFloat,
                    "__bp_str" => UnOp::ToStr,
                    _ => UnOp::Len,
                };
                Ok(self.unary(op, args.remove(0)))
            }
            "__bp_gather" => {
                arity!("gather", "1", 1);
                let ops = expect_op_list("gather", args.remove(0))?;
                self.gather(ops)
            }
            "__bp_any" | "__bp_race" => {
                arity!("race", "1", 1);
                let ops = expect_op_list("race", args.remove(0))?;
                self.race(ops)
            }
            "__bp_at_least" => {
                arity!("at_least", "2", 2);
                let (count, ops) = take2(&mut args);
                let ops = expect_op_list("at_least", ops)?;
                self.at_least(count, ops)
            }
            "__bp_at_most" => {
                arity!("at_most", "2", 2);
                let (count, ops) = take2(&mut args);
                let ops = expect_op_list("at_most", ops)?;
                self.at_most(count, ops)
            }
            "__bp_after" => {
                arity!("after", "2", 2);
                let (dependency, value) = take2(&mut args);
                self.after(dependency, value)
            }
            "__bp_sequence" => {
                arity!("sequence", "1", 1);
                let ops = expect_op_list("sequence", args.remove(0))?;
                self.sequence(ops)
            }
            other => Err(ScriptError::UnknownIntrinsic {
                name: other.to_string(),
            }),
        }
    }

    /// Generic source constructor backing `__bp_event_source(kind, params)`.
    pub fn event_source(&mut self, kind: Value, params: Value) -> Result<Value, ScriptError> {
        let kind_name = match &kind {
            Value::String(s) => s.clone(),
            other => {
                return Err(ScriptError::BadArgument {
                    intrinsic: "event_source",
                    arg: "kind",
                    expected: "a string",
                    got: other.type_name().to_string(),
                })
            }
        };
        let field = |name: &'static str| -> Result<Value, ScriptError> {
            match &params {
                Value::Map(entries) => entries
                    .get(&crate::value::MapKey::Str(name.to_string()))
                    .cloned()
                    .ok_or(ScriptError::BadArgument {
                        intrinsic: "event_source",
                        arg: "params",
                        expected: "a map with the source's parameters",
                        got: format!("map missing '{}'", name),
                    }),
                Value::Struct(fields) => {
                    fields.get(name).cloned().ok_or(ScriptError::BadArgument {
                        intrinsic: "event_source",
                        arg: "params",
                        expected: "a struct with the source's parameters",
                        got: format!("struct missing '{}'", name),
                    })
                }
                other => Err(ScriptError::BadArgument {
                    intrinsic: "event_source",
                    arg: "params",
                    expected: "a map or struct",
                    got: other.type_name().to_string(),
                }),
            }
        };

        match kind_name.as_str() {
            "tcp_connect" => {
                let (host, port) = (field("host")?, field("port")?);
                self.tcp_connect(host, port)
            }
            "tcp_listen" => {
                let (host, port) = (field("host")?, field("port")?);
                self.tcp_listen(host, port)
            }
            "udp" => {
                let (host, port) = (field("host")?, field("port")?);
                self.udp_bind(host, port)
            }
            "unix_connect" => self.unix_connect(field("path")?),
            "unix_listen" => self.unix_listen(field("path")?),
            other => Err(ScriptError::BadArgument {
                intrinsic: "event_source",
                arg: "kind",
                expected: "tcp_connect, tcp_listen, udp, unix_connect or unix_listen",
                got: other.to_string(),
            }),
        }
    }
}

// ---- materialized-argument validation --------------------------------
//
// Deferred operands always pass; the shape check then happens at execution
// after resolution.

fn bad(
    intrinsic: &'static str,
    arg: &'static str,
    expected: &'static str,
    value: &Value,
) -> ScriptError {
    ScriptError::BadArgument {
        intrinsic,
        arg,
        expected,
        got: value.type_name().to_string(),
    }
}

fn expect_string(intr: &'static str, arg: &'static str, v: &Value) -> Result<(), ScriptError> {
    match v {
        Value::String(_) | Value::Deferred(_) => Ok(()),
        other => Err(bad(intr, arg, "a string", other)),
    }
}

fn expect_text(intr: &'static str, arg: &'static str, v: &Value) -> Result<(), ScriptError> {
    match v {
        Value::String(_) | Value::Bytes(_) | Value::Deferred(_) => Ok(()),
        other => Err(bad(intr, arg, "a string or bytes", other)),
    }
}

fn expect_number(intr: &'static str, arg: &'static str, v: &Value) -> Result<(), ScriptError> {
    match v {
        Value::Int(_) | Value::Float(_) | Value::Deferred(_) => Ok(()),
        other => Err(bad(intr, arg, "a number", other)),
    }
}

fn expect_int(intr: &'static str, arg: &'static str, v: &Value) -> Result<(), ScriptError> {
    match v {
        Value::Int(_) | Value::Deferred(_) => Ok(()),
        other => Err(bad(intr, arg, "an int", other)),
    }
}

fn expect_int_or_null(intr: &'static str, arg: &'static str, v: &Value) -> Result<(), ScriptError> {
    match v {
        Value::Int(_) | Value::Null | Value::Deferred(_) => Ok(()),
        other => Err(bad(intr, arg, "an int or None", other)),
    }
}

fn expect_string_or_null(
    intr: &'static str,
    arg: &'static str,
    v: &Value,
) -> Result<(), ScriptError> {
    match v {
        Value::String(_) | Value::Null | Value::Deferred(_) => Ok(()),
        other => Err(bad(intr, arg, "a string or None", other)),
    }
}

fn expect_map_or_null(intr: &'static str, arg: &'static str, v: &Value) -> Result<(), ScriptError> {
    match v {
        Value::Map(_) | Value::Struct(_) | Value::Null | Value::Deferred(_) => Ok(()),
        other => Err(bad(intr, arg, "a map or None", other)),
    }
}

fn expect_list(intr: &'static str, arg: &'static str, v: &Value) -> Result<(), ScriptError> {
    match v {
        Value::List(_) | Value::Deferred(_) => Ok(()),
        other => Err(bad(intr, arg, "a list", other)),
    }
}

/// Combinator inputs must be operation handles, not plain values.
fn expect_handle(intr: &'static str, v: &Value) -> Result<NodeId, ScriptError> {
    v.as_deferred().ok_or_else(|| ScriptError::ExpectedHandle {
        intrinsic: intr,
        got: v.type_name().to_string(),
    })
}

fn expect_handles(intr: &'static str, ops: Vec<Value>) -> Result<Vec<NodeId>, ScriptError> {
    ops.iter().map(|v| expect_handle(intr, v)).collect()
}

fn expect_op_list(intr: &'static str, v: Value) -> Result<Vec<Value>, ScriptError> {
    match v {
        Value::List(items) => Ok(items),
        other => Err(ScriptError::ExpectedHandle {
            intrinsic: intr,
            got: other.type_name().to_string(),
        }),
    }
}

/// The combinator count must be materialized; a deferred count would make
/// the completion rule unknowable at plan time.
fn expect_count(intr: &'static str, v: &Value) -> Result<usize, ScriptError> {
    match v {
        Value::Int(n) if *n >= 0 => Ok(*n as usize),
        other => Err(ScriptError::BadArgument {
            intrinsic: intr,
            arg: "count",
            expected: "a non-negative int (not deferred)",
            got: other.type_name().to_string(),
        }),
    }
}

/// Optional trailing bool flag (e.g. `mkdir(path, recursive)`).
fn optional_flag(
    intr: &'static str,
    arg: &'static str,
    args: &mut Vec<Value>,
    index: usize,
) -> Result<bool, ScriptError> {
    if args.len() <= index {
        return Ok(false);
    }
    match args.remove(index) {
        Value::Bool(b) => Ok(b),
        Value::Null => Ok(false),
        other => Err(bad(intr, arg, "a bool", &other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_intrinsics_return_fresh_handles() {
        let mut session = PlanSession::new();
        let a = session
            .read_file(Value::String("a.txt".into()))
            .expect("read_file");
        let b = session
            .read_file(Value::String("b.txt".into()))
            .expect("read_file");
        assert_eq!(a.as_deferred(), Some(NodeId(0)));
        assert_eq!(b.as_deferred(), Some(NodeId(1)));
    }

    #[test]
    fn test_deferred_argument_is_accepted_anywhere() {
        let mut session = PlanSession::new();
        let content = session
            .read_file(Value::String("path.txt".into()))
            .expect("read_file");
        // The deferred string result flows into another intrinsic untouched.
        let echoed = session
            .write_file(content.clone(), content)
            .expect("write_file");
        assert!(echoed.is_deferred());
    }

    #[test]
    fn test_materialized_argument_shape_is_checked_at_plan_time() {
        let mut session = PlanSession::new();
        match session.read_file(Value::Int(3)) {
            Err(ScriptError::BadArgument { intrinsic, .. }) => {
                assert_eq!(intrinsic, "read_file");
            }
            other => panic!("expected BadArgument, got {:?}", other),
        }
    }

    #[test]
    fn test_call_checks_arity() {
        let mut session = PlanSession::new();
        match session.call("__bp_sleep", vec![], None) {
            Err(ScriptError::WrongArity { got, .. }) => assert_eq!(got, 0),
            other => panic!("expected WrongArity, got {:?}", other),
        }
    }

    #[test]
    fn test_call_rejects_unknown_names() {
        let mut session = PlanSession::new();
        assert!(matches!(
            session.call("__bp_frobnicate", vec![], None),
            Err(ScriptError::UnknownIntrinsic { .. })
        ));
    }

    #[test]
    fn test_gather_requires_operation_handles() {
        let mut session = PlanSession::new();
        match session.gather(vec![Value::Int(1)]) {
            Err(ScriptError::ExpectedHandle { intrinsic, .. }) => {
                assert_eq!(intrinsic, "gather");
            }
            other => panic!("expected ExpectedHandle, got {:?}", other),
        }
    }

    #[test]
    fn test_after_places_order_edge_on_value_node() {
        let mut session = PlanSession::new();
        let x = session.sleep(Value::Float(0.1)).expect("sleep");
        let y = session
            .read_file(Value::String("out.txt".into()))
            .expect("read_file");
        let after = session.after(x.clone(), y.clone()).expect("after");

        let plan = session.freeze().expect("freeze");
        let y_node = plan.get(y.as_deferred().unwrap()).unwrap();
        assert_eq!(y_node.order_deps, vec![x.as_deferred().unwrap()]);

        let after_node = plan.get(after.as_deferred().unwrap()).unwrap();
        assert_eq!(
            after_node.data_deps,
            vec![x.as_deferred().unwrap(), y.as_deferred().unwrap()]
        );
    }

    #[test]
    fn test_sequence_chains_order_edges_and_gathers() {
        let mut session = PlanSession::new();
        let ops: Vec<Value> = (0..3)
            .map(|_| session.sleep(Value::Float(0.01)).expect("sleep"))
            .collect();
        let seq = session.sequence(ops.clone()).expect("sequence");
        let plan = session.freeze().expect("freeze");

        for pair in ops.windows(2) {
            let later = plan.get(pair[1].as_deferred().unwrap()).unwrap();
            assert_eq!(later.order_deps, vec![pair[0].as_deferred().unwrap()]);
        }
        let seq_node = plan.get(seq.as_deferred().unwrap()).unwrap();
        assert!(matches!(seq_node.kind, NodeKind::Gather { .. }));
    }

    #[test]
    fn test_event_source_dispatch_by_kind() {
        let mut session = PlanSession::new();
        let params = Value::record([
            ("host", Value::String("127.0.0.1".into())),
            ("port", Value::Int(9000)),
        ]);
        let handle = session
            .event_source(Value::String("tcp_listen".into()), params)
            .expect("event_source");
        let plan = session.freeze().expect("freeze");
        let node = plan.get(handle.as_deferred().unwrap()).unwrap();
        assert_eq!(node.kind.name(), "event_source");
    }

    #[test]
    fn test_at_least_count_must_be_materialized() {
        let mut session = PlanSession::new();
        let op = session.sleep(Value::Int(1)).expect("sleep");
        assert!(session.at_least(op.clone(), vec![op]).is_err());
    }

    #[test]
    fn test_variadic_console_intrinsics() {
        let mut session = PlanSession::new();
        let out = session
            .call(
                "__bp_stdout",
                vec![Value::String("a".into()), Value::Int(1)],
                None,
            )
            .expect("stdout");
        assert!(out.is_deferred());
    }
}
