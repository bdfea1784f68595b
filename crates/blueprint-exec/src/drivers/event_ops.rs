//! Event-source drivers
//!
//! Open/write/poll/close operations over the executor's handle table. A
//! successful `event_source` node resolves to the integer handle; poll
//! timeouts resolve to `Null`, never to a failure.

use tokio::time::Duration;

use blueprint_core::{EventSourceSpec, NodeKind, Value};

use super::{want_bytes, want_int, want_pairs, want_port, want_string, DriverContext};
use crate::events::HandleId;
use crate::outcome::OpError;

pub async fn run(kind: NodeKind, ctx: &DriverContext) -> Result<Value, OpError> {
    match kind {
        NodeKind::EventSource { source } => open(source, ctx).await,
        NodeKind::EventWrite { handle, data, dest } => {
            let handle = want_handle("event_write", &handle)?;
            let bytes = want_bytes("event_write", "data", &data)?;
            let dest = match &dest {
                Value::Null => None,
                other => {
                    let pairs = want_pairs("event_write", "dest", other)?;
                    let host = pairs
                        .iter()
                        .find(|(k, _)| k == "host")
                        .map(|(_, v)| want_string("event_write", "dest.host", v))
                        .transpose()?
                        .ok_or_else(|| {
                            OpError::operation("event_write: dest requires a 'host' field")
                        })?;
                    let port = pairs
                        .iter()
                        .find(|(k, _)| k == "port")
                        .map(|(_, v)| want_port("event_write", "dest.port", v))
                        .transpose()?
                        .ok_or_else(|| {
                            OpError::operation("event_write: dest requires a 'port' field")
                        })?;
                    Some((host, port))
                }
            };
            let sent = ctx.events.write(handle, &bytes, dest).await?;
            Ok(Value::Int(sent as i64))
        }
        NodeKind::EventPoll {
            handles,
            timeout_ms,
        } => {
            let handles = match &handles {
                Value::List(items) => items
                    .iter()
                    .map(|v| want_handle("event_poll", v))
                    .collect::<Result<Vec<_>, _>>()?,
                other => {
                    return Err(OpError::operation(format!(
                        "event_poll: handles must be a list, got {}",
                        other.type_name()
                    )))
                }
            };
            let timeout = match &timeout_ms {
                Value::Null => None,
                other => {
                    let ms = want_int("event_poll", "timeout_ms", other)?;
                    Some(Duration::from_millis(ms.max(0) as u64))
                }
            };
            let polled = ctx.events.poll(&handles, timeout).await?;
            Ok(polled.unwrap_or(Value::Null))
        }
        NodeKind::EventClose { handle } => {
            let handle = want_handle("event_close", &handle)?;
            ctx.events.close(handle).await?;
            Ok(Value::Null)
        }
        other => Err(OpError::operation(format!(
            "not an event kind: {}",
            other.name()
        ))),
    }
}

async fn open(source: EventSourceSpec, ctx: &DriverContext) -> Result<Value, OpError> {
    let handle = match &source {
        EventSourceSpec::TcpConnect { host, port } => {
            let host = want_string("tcp_connect", "host", host)?;
            let port = want_port("tcp_connect", "port", port)?;
            ctx.events.open_tcp_connect(&host, port).await?
        }
        EventSourceSpec::TcpListen { host, port } => {
            let host = want_string("tcp_listen", "host", host)?;
            let port = want_port("tcp_listen", "port", port)?;
            ctx.events.open_tcp_listen(&host, port).await?
        }
        EventSourceSpec::Udp { host, port } => {
            let host = want_string("udp", "host", host)?;
            let port = want_port("udp", "port", port)?;
            ctx.events.open_udp(&host, port).await?
        }
        #[cfg(unix)]
        EventSourceSpec::UnixConnect { path } => {
            let path = want_string("unix_connect", "path", path)?;
            ctx.events.open_unix_connect(&path).await?
        }
        #[cfg(unix)]
        EventSourceSpec::UnixListen { path } => {
            let path = want_string("unix_listen", "path", path)?;
            ctx.events.open_unix_listen(&path).await?
        }
        #[cfg(not(unix))]
        EventSourceSpec::UnixConnect { .. } | EventSourceSpec::UnixListen { .. } => {
            return Err(OpError::operation(
                "unix sockets are not supported on this platform",
            ))
        }
    };
    Ok(Value::Int(handle as i64))
}

fn want_handle(kind: &str, value: &Value) -> Result<HandleId, OpError> {
    let raw = want_int(kind, "handle", value)?;
    HandleId::try_from(raw)
        .map_err(|_| OpError::operation(format!("{}: {} is not a valid handle", kind, raw)))
}
