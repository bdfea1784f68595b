//! Console driver

use blueprint_core::{ConsoleStream, NodeKind, Value};

use crate::outcome::OpError;

pub async fn run(kind: NodeKind) -> Result<Value, OpError> {
    let NodeKind::Print { stream, parts } = kind else {
        return Err(OpError::operation("not a console kind"));
    };
    let line = parts
        .iter()
        .map(Value::to_string)
        .collect::<Vec<_>>()
        .join(" ");
    match stream {
        ConsoleStream::Stdout => println!("{}", line),
        ConsoleStream::Stderr => eprintln!("{}", line),
    }
    Ok(Value::Null)
}
