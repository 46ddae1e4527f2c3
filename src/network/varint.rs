//! Bitcoin `COMPACTSIZE` variable-length integer encoding.

pub fn encode_compact_size(value: u64) -> Vec<u8> {
    if value < 0xfd {
        vec![value as u8]
    } else if value <= 0xffff {
        let mut out = vec![0xfd];
        out.extend_from_slice(&(value as u16).to_le_bytes());
        out
    } else if value <= 0xffff_ffff {
        let mut out = vec![0xfe];
        out.extend_from_slice(&(value as u32).to_le_bytes());
        out
    } else {
        let mut out = vec![0xff];
        out.extend_from_slice(&value.to_le_bytes());
        out
    }
}

/// Returns `(value, bytes_consumed)`.
pub fn decode_compact_size(data: &[u8]) -> Option<(u64, usize)> {
    let tag = *data.first()?;
    match tag {
        0xfd => {
            let bytes = data.get(1..3)?;
            Some((u16::from_le_bytes(bytes.try_into().ok()?) as u64, 3))
        }
        0xfe => {
            let bytes = data.get(1..5)?;
            Some((u32::from_le_bytes(bytes.try_into().ok()?) as u64, 5))
        }
        0xff => {
            let bytes = data.get(1..9)?;
            Some((u64::from_le_bytes(bytes.try_into().ok()?), 9))
        }
        _ => Some((tag as u64, 1)),
    }
}

/// Differentially encode an ascending list of absolute indices
/// (`idx[i] - idx[i-1] - 1`), as used by `getblocktxn`.
pub fn encode_differential_indices(indices: &[u64]) -> Vec<u8> {
    let mut out = encode_compact_size(indices.len() as u64);
    let mut prev: i128 = -1;
    for &idx in indices {
        let delta = idx as i128 - prev - 1;
        out.extend_from_slice(&encode_compact_size(delta as u64));
        prev = idx as i128;
    }
    out
}

/// Decode a differentially-encoded ascending index list. Rejects overflow
/// past `u16::MAX`.
pub fn decode_differential_indices(data: &[u8]) -> Option<Vec<u16>> {
    let (count, mut offset) = decode_compact_size(data)?;
    let mut out = Vec::with_capacity(count as usize);
    let mut running: i64 = -1;
    for _ in 0..count {
        let (delta, consumed) = decode_compact_size(&data[offset..])?;
        offset += consumed;
        running = running.checked_add(1)?.checked_add(delta as i64)?;
        if running > u16::MAX as i64 {
            return None;
        }
        out.push(running as u16);
    }
    Some(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_small_and_large_values() {
        for v in [0u64, 1, 0xfc, 0xfd, 0xffff, 0x1_0000, u32::MAX as u64, u64::MAX] {
            let enc = encode_compact_size(v);
            let (dec, consumed) = decode_compact_size(&enc).unwrap();
            assert_eq!(dec, v);
            assert_eq!(consumed, enc.len());
        }
    }

    #[test]
    fn differential_indices_round_trip() {
        let indices = vec![2u64, 3, 5, 100];
        let enc = encode_differential_indices(&indices);
        let dec = decode_differential_indices(&enc).unwrap();
        assert_eq!(dec, vec![2u16, 3, 5, 100]);
    }

    #[test]
    fn differential_indices_reject_overflow_past_u16_max() {
        let indices = vec![0u64, u16::MAX as u64 + 1];
        let enc = encode_differential_indices(&indices);
        assert!(decode_differential_indices(&enc).is_none());
    }
}
