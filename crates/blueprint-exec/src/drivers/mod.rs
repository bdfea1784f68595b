//! Kind drivers
//!
//! One module per operation family. A driver receives the node kind with all
//! deferred arguments already substituted by their producing nodes' results,
//! performs the work, and returns the node's result value or a structured
//! error. Shape checks that were deferred at planning time (because the
//! operand was a `Deferred`) happen here.

pub mod compute;
mod console;
mod event_ops;
mod fs;
mod http;
mod process;
mod time;

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use blueprint_core::{NodeKind, Value};

use crate::config::ExecConfig;
use crate::events::EventTable;
use crate::outcome::OpError;

/// Shared state handed to every spawned driver.
#[derive(Clone)]
pub struct DriverContext {
    pub http: reqwest::Client,
    pub events: Arc<EventTable>,
    pub cancel: CancellationToken,
    pub config: ExecConfig,
}

/// Run one suspending node kind to completion.
///
/// Inline kinds (compute, JSON, `env_get`, `now`) never come through here;
/// the scheduler evaluates them directly via [`compute::eval`].
pub async fn drive(kind: NodeKind, ctx: &DriverContext) -> Result<Value, OpError> {
    match &kind {
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
        | NodeKind::FileSize { .. } => fs::run(kind).await,
        NodeKind::HttpRequest { .. } => http::run(kind, ctx).await,
        NodeKind::Exec { .. } => process::run(kind, ctx).await,
        NodeKind::Sleep { .. } => time::run(kind).await,
        NodeKind::Print { .. } => console::run(kind).await,
        NodeKind::EventSource { .. }
        | NodeKind::EventWrite { .. }
        | NodeKind::EventPoll { .. }
        | NodeKind::EventClose { .. } => event_ops::run(kind, ctx).await,
        other => Err(OpError::operation(format!(
            "kind '{}' has no suspending driver",
            other.name()
        ))),
    }
}

// ---- resolved-argument extraction ------------------------------------

pub(crate) fn want_string(kind: &str, arg: &str, value: &Value) -> Result<String, OpError> {
    match value {
        Value::String(s) => Ok(s.clone()),
        other => Err(OpError::operation(format!(
            "{}: argument '{}' must be a string, got {}",
            kind,
            arg,
            other.type_name()
        ))),
    }
}

pub(crate) fn want_int(kind: &str, arg: &str, value: &Value) -> Result<i64, OpError> {
    match value {
        Value::Int(n) => Ok(*n),
        other => Err(OpError::operation(format!(
            "{}: argument '{}' must be an int, got {}",
            kind,
            arg,
            other.type_name()
        ))),
    }
}

pub(crate) fn want_f64(kind: &str, arg: &str, value: &Value) -> Result<f64, OpError> {
    value.as_f64().ok_or_else(|| {
        OpError::operation(format!(
            "{}: argument '{}' must be a number, got {}",
            kind,
            arg,
            value.type_name()
        ))
    })
}

pub(crate) fn want_bytes(kind: &str, arg: &str, value: &Value) -> Result<Vec<u8>, OpError> {
    match value {
        Value::String(s) => Ok(s.as_bytes().to_vec()),
        Value::Bytes(b) => Ok(b.clone()),
        other => Err(OpError::operation(format!(
            "{}: argument '{}' must be a string or bytes, got {}",
            kind,
            arg,
            other.type_name()
        ))),
    }
}

pub(crate) fn want_port(kind: &str, arg: &str, value: &Value) -> Result<u16, OpError> {
    let port = want_int(kind, arg, value)?;
    u16::try_from(port).map_err(|_| {
        OpError::operation(format!("{}: argument '{}' is not a valid port", kind, arg))
    })
}

pub(crate) fn opt_string(kind: &str, arg: &str, value: &Value) -> Result<Option<String>, OpError> {
    match value {
        Value::Null => Ok(None),
        other => want_string(kind, arg, other).map(Some),
    }
}

/// String-keyed pairs from a map or struct; `Null` yields an empty list.
pub(crate) fn want_pairs(
    kind: &str,
    arg: &str,
    value: &Value,
) -> Result<Vec<(String, Value)>, OpError> {
    match value {
        Value::Null => Ok(Vec::new()),
        Value::Map(entries) => entries
            .iter()
            .map(|(key, v)| match key {
                blueprint_core::MapKey::Str(s) => Ok((s.clone(), v.clone())),
                blueprint_core::MapKey::Int(n) => Ok((n.to_string(), v.clone())),
            })
            .collect(),
        Value::Struct(fields) => Ok(fields.iter().map(|(k, v)| (k.clone(), v.clone())).collect()),
        other => Err(OpError::operation(format!(
            "{}: argument '{}' must be a map, got {}",
            kind,
            arg,
            other.type_name()
        ))),
    }
}
