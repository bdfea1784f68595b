//! Timer driver

use tokio::time::Duration;

use blueprint_core::{NodeKind, Value};

use super::want_f64;
use crate::outcome::OpError;

pub async fn run(kind: NodeKind) -> Result<Value, OpError> {
    let NodeKind::Sleep { seconds } = kind else {
        return Err(OpError::operation("not a timer kind"));
    };
    let seconds = want_f64("sleep", "seconds", &seconds)?;
    if !seconds.is_finite() || seconds < 0.0 {
        return Err(OpError::operation(format!(
            "sleep: seconds must be a non-negative number, got {}",
            seconds
        )));
    }
    tokio::time::sleep(Duration::from_secs_f64(seconds)).await;
    Ok(Value::Null)
}
