use pagecask_common::{EngineError, EngineResult};

/// Order-preserving encoding for signed 64-bit keys: flip the sign bit and
/// emit big-endian, so lexicographic byte order equals numeric order.
pub fn encode_i64(value: i64) -> [u8; 8] {
    ((value as u64) ^ (1 << 63)).to_be_bytes()
}

pub fn decode_i64(bytes: &[u8]) -> EngineResult<i64> {
    let arr: [u8; 8] = bytes
        .try_into()
        .map_err(|_| EngineError::invalid(format!("i64 key must be 8 bytes, got {}", bytes.len())))?;
    Ok((u64::from_be_bytes(arr) ^ (1 << 63)) as i64)
}

/// String keys are their UTF-8 bytes; byte order on UTF-8 is already
/// code-point order.
pub fn encode_str(value: &str) -> Vec<u8> {
    value.as_bytes().to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_i64_roundtrip() {
        for v in [i64::MIN, -1_000_000, -1, 0, 1, 42, i64::MAX] {
            assert_eq!(decode_i64(&encode_i64(v)).unwrap(), v);
        }
    }

    #[test]
    fn test_i64_encoding_preserves_order() {
        let values = [i64::MIN, -5_000, -1, 0, 1, 7, 5_000, i64::MAX];
        for pair in values.windows(2) {
            assert!(
                encode_i64(pair[0]) < encode_i64(pair[1]),
                "{} should sort before {}",
                pair[0],
                pair[1]
            );
        }
    }

    #[test]
    fn test_bad_width_rejected() {
        assert!(decode_i64(&[1, 2, 3]).is_err());
    }
}
