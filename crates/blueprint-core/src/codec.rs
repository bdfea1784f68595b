//! Plan file codec
//!
//! Versioned binary container for a frozen plan: a 4-byte magic, a little-
//! endian format version, then the bincode-encoded node list. Kind tags stay
//! stable through the serde representation of `NodeKind`.

use thiserror::Error;

use crate::plan::Plan;

const MAGIC: &[u8; 4] = b"BPLN";
const VERSION: u16 = 1;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("not a plan file (bad magic)")]
    BadMagic,

    #[error("unsupported plan file version {0} (expected {VERSION})")]
    UnsupportedVersion(u16),

    #[error("malformed plan payload: {0}")]
    Malformed(String),
}

pub fn encode_plan(plan: &Plan) -> Result<Vec<u8>, CodecError> {
    let payload = bincode::serialize(plan).map_err(|e| CodecError::Malformed(e.to_string()))?;
    let mut out = Vec::with_capacity(6 + payload.len());
    out.extend_from_slice(MAGIC);
    out.extend_from_slice(&VERSION.to_le_bytes());
    out.extend_from_slice(&payload);
    Ok(out)
}

pub fn decode_plan(bytes: &[u8]) -> Result<Plan, CodecError> {
    if bytes.len() < 6 || &bytes[..4] != MAGIC {
        return Err(CodecError::BadMagic);
    }
    let version = u16::from_le_bytes([bytes[4], bytes[5]]);
    if version != VERSION {
        return Err(CodecError::UnsupportedVersion(version));
    }
    bincode::deserialize(&bytes[6..]).map_err(|e| CodecError::Malformed(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::intrinsics::PlanSession;
    use crate::value::Value;

    fn sample_plan() -> Plan {
        let mut session = PlanSession::new();
        let content = session
            .read_file(Value::String("config.json".into()))
            .expect("read_file");
        let decoded = session.json_decode(content).expect("json_decode");
        session.mark_root(&decoded);
        session.freeze().expect("freeze")
    }

    #[test]
    fn test_round_trip_preserves_nodes_and_roots() {
        let plan = sample_plan();
        let bytes = encode_plan(&plan).expect("encode");
        let decoded = decode_plan(&bytes).expect("decode");

        assert_eq!(decoded.len(), plan.len());
        assert_eq!(decoded.roots(), plan.roots());
        for (a, b) in plan.nodes().iter().zip(decoded.nodes()) {
            assert_eq!(a, b);
        }
    }

    #[test]
    fn test_bad_magic_is_rejected() {
        assert!(matches!(
            decode_plan(b"NOPE\x01\x00"),
            Err(CodecError::BadMagic)
        ));
    }

    #[test]
    fn test_future_version_is_rejected() {
        let plan = sample_plan();
        let mut bytes = encode_plan(&plan).expect("encode");
        bytes[4] = 0xFF;
        assert!(matches!(
            decode_plan(&bytes),
            Err(CodecError::UnsupportedVersion(_))
        ));
    }

    #[test]
    fn test_truncated_payload_is_malformed() {
        let plan = sample_plan();
        let bytes = encode_plan(&plan).expect("encode");
        assert!(matches!(
            decode_plan(&bytes[..bytes.len() - 3]),
            Err(CodecError::Malformed(_))
        ));
    }
}
