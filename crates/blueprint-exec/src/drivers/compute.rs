//! Inline evaluation
//!
//! Pure kinds run synchronously on the scheduler: arithmetic, comparison,
//! coercion, JSON round-trips, `env_get` and `now`. Semantics are
//! Python-flavoured; floored division and modulo follow the sign of the
//! divisor, `/` is true division, and `len` counts bytes for strings.

use std::cmp::Ordering;
use std::time::{SystemTime, UNIX_EPOCH};

use blueprint_core::{BinOp, MapKey, NodeKind, UnOp, Value};

use crate::outcome::OpError;

pub fn eval(kind: &NodeKind) -> Result<Value, OpError> {
    match kind {
        NodeKind::Binary { op, lhs, rhs } => binary(*op, lhs, rhs),
        NodeKind::Unary { op, operand } => unary(*op, operand),
        NodeKind::JsonEncode { value } => {
            let json = value.to_json().ok_or_else(|| {
                OpError::operation("json_encode: value is not representable as JSON")
            })?;
            serde_json::to_string(&json)
                .map(Value::String)
                .map_err(|e| OpError::operation(format!("json_encode failed: {}", e)))
        }
        NodeKind::JsonDecode { text } => {
            let text = match text {
                Value::String(s) => s,
                other => {
                    return Err(OpError::operation(format!(
                        "json_decode: text must be a string, got {}",
                        other.type_name()
                    )))
                }
            };
            let json: serde_json::Value = serde_json::from_str(text)
                .map_err(|e| OpError::operation(format!("json_decode failed: {}", e)))?;
            Ok(Value::from_json(&json))
        }
        NodeKind::EnvGet { name, default } => {
            let name = match name {
                Value::String(s) => s,
                other => {
                    return Err(OpError::operation(format!(
                        "env_get: name must be a string, got {}",
                        other.type_name()
                    )))
                }
            };
            match std::env::var(name) {
                Ok(value) => Ok(Value::String(value)),
                Err(_) => Ok(default.clone()),
            }
        }
        NodeKind::Now => {
            let now = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map_err(|e| OpError::operation(format!("clock error: {}", e)))?;
            Ok(Value::Float(now.as_secs_f64()))
        }
        other => Err(OpError::operation(format!(
            "kind '{}' is not inline-computable",
            other.name()
        ))),
    }
}

fn type_error(op: &str, lhs: &Value, rhs: &Value) -> OpError {
    OpError::operation(format!(
        "unsupported operand types for {}: {} and {}",
        op,
        lhs.type_name(),
        rhs.type_name()
    ))
}

fn binary(op: BinOp, lhs: &Value, rhs: &Value) -> Result<Value, OpError> {
    match op {
        BinOp::Add => arith(op, lhs, rhs),
        BinOp::Sub => arith(op, lhs, rhs),
        BinOp::Mul => arith(op, lhs, rhs),
        BinOp::Div => {
            let (a, b) = both_f64(op, lhs, rhs)?;
            if b == 0.0 {
                return Err(OpError::operation("division by zero"));
            }
            Ok(Value::Float(a / b))
        }
        BinOp::FloorDiv => match (lhs, rhs) {
            (Value::Int(a), Value::Int(b)) => {
                if *b == 0 {
                    return Err(OpError::operation("division by zero"));
                }
                Ok(Value::Int(floor_div_i64(*a, *b)))
            }
            _ => {
                let (a, b) = both_f64(op, lhs, rhs)?;
                if b == 0.0 {
                    return Err(OpError::operation("division by zero"));
                }
                Ok(Value::Float((a / b).floor()))
            }
        },
        BinOp::Mod => match (lhs, rhs) {
            (Value::Int(a), Value::Int(b)) => {
                if *b == 0 {
                    return Err(OpError::operation("modulo by zero"));
                }
                Ok(Value::Int(floor_mod_i64(*a, *b)))
            }
            _ => {
                let (a, b) = both_f64(op, lhs, rhs)?;
                if b == 0.0 {
                    return Err(OpError::operation("modulo by zero"));
                }
                Ok(Value::Float(a - b * (a / b).floor()))
            }
        },
        BinOp::Eq => Ok(Value::Bool(values_equal(lhs, rhs))),
        BinOp::Ne => Ok(Value::Bool(!values_equal(lhs, rhs))),
        BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge => {
            let ordering = order_values(lhs, rhs)
                .ok_or_else(|| type_error(op_symbol(op), lhs, rhs))?;
            Ok(Value::Bool(match op {
                BinOp::Lt => ordering == Ordering::Less,
                BinOp::Le => ordering != Ordering::Greater,
                BinOp::Gt => ordering == Ordering::Greater,
                _ => ordering != Ordering::Less,
            }))
        }
        BinOp::Concat => match (lhs, rhs) {
            (Value::String(a), Value::String(b)) => Ok(Value::String(format!("{}{}", a, b))),
            (Value::Bytes(a), Value::Bytes(b)) => {
                let mut out = a.clone();
                out.extend_from_slice(b);
                Ok(Value::Bytes(out))
            }
            (Value::List(a), Value::List(b)) => {
                let mut out = a.clone();
                out.extend(b.iter().cloned());
                Ok(Value::List(out))
            }
            _ => Err(type_error("concat", lhs, rhs)),
        },
        BinOp::Contains => contains(lhs, rhs),
    }
}

fn arith(op: BinOp, lhs: &Value, rhs: &Value) -> Result<Value, OpError> {
    match (lhs, rhs) {
        (Value::Int(a), Value::Int(b)) => {
            let result = match op {
                BinOp::Add => a.checked_add(*b),
                BinOp::Sub => a.checked_sub(*b),
                _ => a.checked_mul(*b),
            };
            result
                .map(Value::Int)
                .ok_or_else(|| OpError::operation("integer overflow"))
        }
        _ => {
            let (a, b) = both_f64(op, lhs, rhs)?;
            Ok(Value::Float(match op {
                BinOp::Add => a + b,
                BinOp::Sub => a - b,
                _ => a * b,
            }))
        }
    }
}

fn both_f64(op: BinOp, lhs: &Value, rhs: &Value) -> Result<(f64, f64), OpError> {
    match (lhs.as_f64(), rhs.as_f64()) {
        (Some(a), Some(b)) => Ok((a, b)),
        _ => Err(type_error(op_symbol(op), lhs, rhs)),
    }
}

fn op_symbol(op: BinOp) -> &'static str {
    match op {
        BinOp::Add => "+",
        BinOp::Sub => "-",
        BinOp::Mul => "*",
        BinOp::Div => "/",
        BinOp::FloorDiv => "//",
        BinOp::Mod => "%",
        BinOp::Lt => "<",
        BinOp::Le => "<=",
        BinOp::Gt => ">",
        BinOp::Ge => ">=",
        other => other.as_str(),
    }
}

fn floor_div_i64(a: i64, b: i64) -> i64 {
    let quotient = a / b;
    if a % b != 0 && (a < 0) != (b < 0) {
        quotient - 1
    } else {
        quotient
    }
}

fn floor_mod_i64(a: i64, b: i64) -> i64 {
    let remainder = a % b;
    if remainder != 0 && (remainder < 0) != (b < 0) {
        remainder + b
    } else {
        remainder
    }
}

/// Equality with Int/Float numeric coercion; mismatched types are unequal,
/// never an error.
pub fn values_equal(lhs: &Value, rhs: &Value) -> bool {
    match (lhs, rhs) {
        (Value::Int(a), Value::Float(b)) => (*a as f64) == *b,
        (Value::Float(a), Value::Int(b)) => *a == (*b as f64),
        (Value::List(a), Value::List(b)) => {
            a.len() == b.len() && a.iter().zip(b).all(|(x, y)| values_equal(x, y))
        }
        _ => lhs == rhs,
    }
}

fn order_values(lhs: &Value, rhs: &Value) -> Option<Ordering> {
    match (lhs, rhs) {
        (Value::Int(a), Value::Int(b)) => Some(a.cmp(b)),
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        (Value::Bytes(a), Value::Bytes(b)) => Some(a.cmp(b)),
        (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
        (Value::List(a), Value::List(b)) => {
            for (x, y) in a.iter().zip(b.iter()) {
                match order_values(x, y)? {
                    Ordering::Equal => continue,
                    other => return Some(other),
                }
            }
            Some(a.len().cmp(&b.len()))
        }
        _ => {
            let (a, b) = (lhs.as_f64()?, rhs.as_f64()?);
            a.partial_cmp(&b)
        }
    }
}

fn contains(haystack: &Value, needle: &Value) -> Result<Value, OpError> {
    match haystack {
        Value::String(s) => match needle {
            Value::String(n) => Ok(Value::Bool(s.contains(n.as_str()))),
            _ => Err(type_error("in", haystack, needle)),
        },
        Value::Bytes(b) => match needle {
            Value::Bytes(n) => Ok(Value::Bool(
                n.is_empty() || b.windows(n.len()).any(|w| w == n.as_slice()),
            )),
            _ => Err(type_error("in", haystack, needle)),
        },
        Value::List(items) => Ok(Value::Bool(items.iter().any(|v| values_equal(v, needle)))),
        Value::Map(entries) => {
            let key = match needle {
                Value::String(s) => MapKey::Str(s.clone()),
                Value::Int(n) => MapKey::Int(*n),
                _ => return Err(type_error("in", haystack, needle)),
            };
            Ok(Value::Bool(entries.contains_key(&key)))
        }
        Value::Struct(fields) => match needle {
            Value::String(name) => Ok(Value::Bool(fields.contains_key(name))),
            _ => Err(type_error("in", haystack, needle)),
        },
        _ => Err(type_error("in", haystack, needle)),
    }
}

fn unary(op: UnOp, operand: &Value) -> Result<Value, OpError> {
    match op {
        UnOp::Neg => match operand {
            Value::Int(n) => n
                .checked_neg()
                .map(Value::Int)
                .ok_or_else(|| OpError::operation("integer overflow")),
            Value::Float(f) => Ok(Value::Float(-f)),
            other => Err(OpError::operation(format!(
                "bad operand type for unary -: {}",
                other.type_name()
            ))),
        },
        UnOp::Not => truthiness(operand).map(|b| Value::Bool(!b)),
        UnOp::ToBool => truthiness(operand).map(Value::Bool),
        UnOp::ToInt => match operand {
            Value::Int(n) => Ok(Value::Int(*n)),
            Value::Float(f) => Ok(Value::Int(*f as i64)),
            Value::Bool(b) => Ok(Value::Int(if *b { 1 } else { 0 })),
            Value::String(s) => s.trim().parse::<i64>().map(Value::Int).map_err(|_| {
                OpError::operation(format!("invalid literal for int(): '{}'", s))
            }),
            other => Err(OpError::operation(format!(
                "int() argument must be a string or number, not {}",
                other.type_name()
            ))),
        },
        UnOp::ToFloat => match operand {
            Value::Int(n) => Ok(Value::Float(*n as f64)),
            Value::Float(f) => Ok(Value::Float(*f)),
            Value::Bool(b) => Ok(Value::Float(if *b { 1.0 } else { 0.0 })),
            Value::String(s) => s.trim().parse::<f64>().map(Value::Float).map_err(|_| {
                OpError::operation(format!("could not convert string to float: '{}'", s))
            }),
            other => Err(OpError::operation(format!(
                "float() argument must be a string or number, not {}",
                other.type_name()
            ))),
        },
        UnOp::ToStr => Ok(Value::String(operand.to_string())),
        UnOp::Len => match operand {
            Value::String(s) => Ok(Value::Int(s.len() as i64)),
            Value::Bytes(b) => Ok(Value::Int(b.len() as i64)),
            Value::List(items) => Ok(Value::Int(items.len() as i64)),
            Value::Map(entries) => Ok(Value::Int(entries.len() as i64)),
            Value::Struct(fields) => Ok(Value::Int(fields.len() as i64)),
            other => Err(OpError::operation(format!(
                "object of type {} has no len()",
                other.type_name()
            ))),
        },
    }
}

fn truthiness(value: &Value) -> Result<bool, OpError> {
    value
        .truthy()
        .map_err(|e| OpError::operation(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bin(op: BinOp, lhs: Value, rhs: Value) -> Result<Value, OpError> {
        eval(&NodeKind::Binary { op, lhs, rhs })
    }

    fn un(op: UnOp, operand: Value) -> Result<Value, OpError> {
        eval(&NodeKind::Unary { op, operand })
    }

    #[test]
    fn test_integer_arithmetic() {
        assert_eq!(bin(BinOp::Add, Value::Int(1), Value::Int(2)).unwrap(), Value::Int(3));
        assert_eq!(bin(BinOp::Sub, Value::Int(5), Value::Int(10)).unwrap(), Value::Int(-5));
        assert_eq!(bin(BinOp::Mul, Value::Int(-3), Value::Int(7)).unwrap(), Value::Int(-21));
    }

    #[test]
    fn test_true_division_yields_float() {
        assert_eq!(
            bin(BinOp::Div, Value::Int(10), Value::Int(4)).unwrap(),
            Value::Float(2.5)
        );
        assert!(bin(BinOp::Div, Value::Int(1), Value::Int(0)).is_err());
    }

    #[test]
    fn test_floor_division_follows_divisor_sign() {
        assert_eq!(
            bin(BinOp::FloorDiv, Value::Int(10), Value::Int(3)).unwrap(),
            Value::Int(3)
        );
        assert_eq!(
            bin(BinOp::FloorDiv, Value::Int(-10), Value::Int(3)).unwrap(),
            Value::Int(-4)
        );
        assert_eq!(
            bin(BinOp::FloorDiv, Value::Int(10), Value::Int(-3)).unwrap(),
            Value::Int(-4)
        );
    }

    #[test]
    fn test_modulo_follows_divisor_sign() {
        assert_eq!(
            bin(BinOp::Mod, Value::Int(10), Value::Int(3)).unwrap(),
            Value::Int(1)
        );
        assert_eq!(
            bin(BinOp::Mod, Value::Int(-10), Value::Int(3)).unwrap(),
            Value::Int(2)
        );
        assert_eq!(
            bin(BinOp::Mod, Value::Int(10), Value::Int(-3)).unwrap(),
            Value::Int(-2)
        );
    }

    #[test]
    fn test_mixed_numeric_comparison() {
        assert_eq!(
            bin(BinOp::Lt, Value::Int(1), Value::Float(1.5)).unwrap(),
            Value::Bool(true)
        );
        assert_eq!(
            bin(BinOp::Eq, Value::Int(2), Value::Float(2.0)).unwrap(),
            Value::Bool(true)
        );
    }

    #[test]
    fn test_string_comparison_and_concat() {
        assert_eq!(
            bin(
                BinOp::Lt,
                Value::String("abc".into()),
                Value::String("abd".into())
            )
            .unwrap(),
            Value::Bool(true)
        );
        assert_eq!(
            bin(
                BinOp::Concat,
                Value::String("hello ".into()),
                Value::String("world".into())
            )
            .unwrap(),
            Value::String("hello world".into())
        );
    }

    #[test]
    fn test_contains_over_containers() {
        assert_eq!(
            bin(
                BinOp::Contains,
                Value::String("hello".into()),
                Value::String("ell".into())
            )
            .unwrap(),
            Value::Bool(true)
        );
        assert_eq!(
            bin(
                BinOp::Contains,
                Value::List(vec![Value::Int(1), Value::Int(2)]),
                Value::Float(2.0)
            )
            .unwrap(),
            Value::Bool(true)
        );
        let map = Value::Map(
            [(MapKey::Str("a".into()), Value::Int(1))]
                .into_iter()
                .collect(),
        );
        assert_eq!(
            bin(BinOp::Contains, map, Value::String("a".into())).unwrap(),
            Value::Bool(true)
        );
    }

    #[test]
    fn test_comparing_incompatible_types_is_an_error() {
        assert!(bin(BinOp::Lt, Value::Int(1), Value::String("x".into())).is_err());
    }

    #[test]
    fn test_coercions() {
        assert_eq!(un(UnOp::ToInt, Value::Float(3.9)).unwrap(), Value::Int(3));
        assert_eq!(un(UnOp::ToInt, Value::Float(-3.9)).unwrap(), Value::Int(-3));
        assert_eq!(
            un(UnOp::ToInt, Value::String(" 42 ".into())).unwrap(),
            Value::Int(42)
        );
        assert_eq!(un(UnOp::ToFloat, Value::Int(2)).unwrap(), Value::Float(2.0));
        assert_eq!(
            un(UnOp::ToStr, Value::Bool(true)).unwrap(),
            Value::String("True".into())
        );
        assert_eq!(
            un(UnOp::ToBool, Value::String(String::new())).unwrap(),
            Value::Bool(false)
        );
        assert!(un(UnOp::ToInt, Value::String("nope".into())).is_err());
    }

    #[test]
    fn test_len_and_not() {
        assert_eq!(
            un(UnOp::Len, Value::String("hello".into())).unwrap(),
            Value::Int(5)
        );
        assert_eq!(
            un(UnOp::Len, Value::List(vec![Value::Int(1)])).unwrap(),
            Value::Int(1)
        );
        assert_eq!(un(UnOp::Not, Value::Int(0)).unwrap(), Value::Bool(true));
        assert!(un(UnOp::Len, Value::Int(1)).is_err());
    }

    #[test]
    fn test_json_round_trip() {
        let encoded = eval(&NodeKind::JsonEncode {
            value: Value::List(vec![Value::Int(1), Value::String("two".into())]),
        })
        .unwrap();
        let Value::String(text) = &encoded else {
            panic!("expected string, got {:?}", encoded)
        };
        let decoded = eval(&NodeKind::JsonDecode {
            text: Value::String(text.clone()),
        })
        .unwrap();
        assert_eq!(
            decoded,
            Value::List(vec![Value::Int(1), Value::String("two".into())])
        );
    }

    #[test]
    fn test_json_decode_failure_is_operation_error() {
        assert!(eval(&NodeKind::JsonDecode {
            text: Value::String("{not json".into()),
        })
        .is_err());
    }

    #[test]
    fn test_env_get_falls_back_to_default() {
        let missing = format!("BP_TEST_MISSING_{}", std::process::id());
        let result = eval(&NodeKind::EnvGet {
            name: Value::String(missing),
            default: Value::String("fallback".into()),
        })
        .unwrap();
        assert_eq!(result, Value::String("fallback".into()));
    }

    #[test]
    fn test_now_is_epoch_seconds() {
        let result = eval(&NodeKind::Now).unwrap();
        match result {
            Value::Float(secs) => assert!(secs > 1_600_000_000.0),
            other => panic!("expected float, got {:?}", other),
        }
    }
}
