//! Subprocess driver

use std::process::Stdio;

use tokio::process::Command;

use blueprint_core::{NodeKind, Value};

use super::{opt_string, want_pairs, want_string, DriverContext};
use crate::outcome::OpError;

pub async fn run(kind: NodeKind, ctx: &DriverContext) -> Result<Value, OpError> {
    let NodeKind::Exec { argv, cwd, env } = kind else {
        return Err(OpError::operation("not an exec kind"));
    };

    let argv = match &argv {
        Value::List(items) => items
            .iter()
            .map(|v| want_string("exec", "argv", v))
            .collect::<Result<Vec<_>, _>>()?,
        other => {
            return Err(OpError::operation(format!(
                "exec: argv must be a list of strings, got {}",
                other.type_name()
            )))
        }
    };
    let Some((program, args)) = argv.split_first() else {
        return Err(OpError::operation("exec: argv must not be empty"));
    };

    let mut cmd = Command::new(program);
    cmd.args(args);
    if let Some(dir) = opt_string("exec", "cwd", &cwd)? {
        cmd.current_dir(dir);
    }
    for (key, value) in want_pairs("exec", "env", &env)? {
        let value = match &value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        cmd.env(key, value);
    }
    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());
    cmd.kill_on_drop(true);

    let output = tokio::select! {
        biased;
        _ = ctx.cancel.cancelled() => return Err(OpError::cancelled()),
        result = cmd.output() => result
            .map_err(|e| OpError::operation(format!("spawn {} failed: {}", program, e)))?,
    };

    let cap = ctx.config.max_output_bytes;
    Ok(Value::record([
        ("code", Value::Int(output.status.code().unwrap_or(-1) as i64)),
        ("stdout", Value::String(capped_lossy(&output.stdout, cap))),
        ("stderr", Value::String(capped_lossy(&output.stderr, cap))),
    ]))
}

fn capped_lossy(bytes: &[u8], max_bytes: usize) -> String {
    let slice = if bytes.len() > max_bytes {
        &bytes[..max_bytes]
    } else {
        bytes
    };
    String::from_utf8_lossy(slice).to_string()
}
