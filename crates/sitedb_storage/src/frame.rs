//! Checksummed log frames.
//!
//! ```text
//! +-------+-----------+-----------+----------------+
//! | magic | len (u32) | crc (u32) | payload (len)  |
//! | SDBL  |    LE     |    LE     |                |
//! +-------+-----------+-----------+----------------+
//! ```

use crate::error::{StorageError, StorageResult};

/// Magic bytes opening every frame.
pub const FRAME_MAGIC: [u8; 4] = *b"SDBL";

/// Size of the frame header in bytes.
pub const FRAME_HEADER_LEN: usize = 12;

/// Wraps a payload in a frame.
///
/// # Errors
///
/// Fails if the payload length does not fit in a `u32`.
pub fn encode_frame(payload: &[u8]) -> StorageResult<Vec<u8>> {
    let len = u32::try_from(payload.len())
        .map_err(|_| StorageError::FrameTooLarge { len: payload.len() })?;
    let mut out = Vec::with_capacity(FRAME_HEADER_LEN + payload.len());
    out.extend_from_slice(&FRAME_MAGIC);
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(&compute_crc32(payload).to_le_bytes());
    out.extend_from_slice(payload);
    Ok(out)
}

/// Outcome of scanning a byte buffer for frames.
#[derive(Debug, Default)]
pub struct FrameScan {
    /// Payloads of every intact frame, in order.
    pub payloads: Vec<Vec<u8>>,
    /// Length of the intact prefix of the buffer.
    pub valid_len: u64,
    /// Why scanning stopped early, if it did.
    pub damage: Option<String>,
}

/// Splits a buffer into frames, stopping at the first damaged one.
#[must_use]
pub fn scan_frames(bytes: &[u8]) -> FrameScan {
    let mut scan = FrameScan::default();
    let mut pos = 0usize;

    while pos < bytes.len() {
        let Some(header) = bytes.get(pos..pos + FRAME_HEADER_LEN) else {
            scan.damage = Some(format!("truncated header at offset {pos}"));
            break;
        };
        if header[0..4] != FRAME_MAGIC {
            scan.damage = Some(format!("bad magic at offset {pos}"));
            break;
        }
        let len = u32::from_le_bytes([header[4], header[5], header[6], header[7]]) as usize;
        let crc = u32::from_le_bytes([header[8], header[9], header[10], header[11]]);
        let start = pos + FRAME_HEADER_LEN;
        let Some(payload) = bytes.get(start..start + len) else {
            scan.damage = Some(format!("truncated payload at offset {pos}"));
            break;
        };
        let actual = compute_crc32(payload);
        if actual != crc {
            scan.damage = Some(format!(
                "checksum mismatch at offset {pos}: expected {crc:08x}, got {actual:08x}"
            ));
            break;
        }
        scan.payloads.push(payload.to_vec());
        pos = start + len;
        scan.valid_len = pos as u64;
    }

    scan
}

/// Computes the CRC32 (IEEE) checksum of `data`.
#[must_use]
pub fn compute_crc32(data: &[u8]) -> u32 {
    const CRC32_TABLE: [u32; 256] = {
        let mut table = [0u32; 256];
        let mut i = 0;
        while i < 256 {
            let mut crc = i as u32;
            let mut j = 0;
            while j < 8 {
                if crc & 1 != 0 {
                    crc = (crc >> 1) ^ 0xEDB8_8320;
                } else {
                    crc >>= 1;
                }
                j += 1;
            }
            table[i] = crc;
            i += 1;
        }
        table
    };

    let mut crc = 0xFFFF_FFFF_u32;
    for &byte in data {
        let index = ((crc ^ u32::from(byte)) & 0xFF) as usize;
        crc = (crc >> 8) ^ CRC32_TABLE[index];
    }
    !crc
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crc32_known_value() {
        assert_eq!(compute_crc32(b"123456789"), 0xCBF4_3926);
        assert_eq!(compute_crc32(b""), 0);
    }

    #[test]
    fn scan_reads_back_frames() {
        let mut bytes = encode_frame(b"one").unwrap();
        bytes.extend(encode_frame(b"").unwrap());
        bytes.extend(encode_frame(b"three").unwrap());

        let scan = scan_frames(&bytes);
        assert_eq!(scan.payloads, vec![b"one".to_vec(), vec![], b"three".to_vec()]);
        assert_eq!(scan.valid_len, bytes.len() as u64);
        assert!(scan.damage.is_none());
    }

    #[test]
    fn scan_stops_at_torn_tail() {
        let mut bytes = encode_frame(b"intact").unwrap();
        let intact = bytes.len() as u64;
        let second = encode_frame(b"torn frame").unwrap();
        bytes.extend_from_slice(&second[..second.len() - 3]);

        let scan = scan_frames(&bytes);
        assert_eq!(scan.payloads.len(), 1);
        assert_eq!(scan.valid_len, intact);
        assert!(scan.damage.unwrap().contains("truncated payload"));
    }

    #[test]
    fn scan_detects_bit_flip() {
        let mut bytes = encode_frame(b"payload").unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0x01;

        let scan = scan_frames(&bytes);
        assert!(scan.payloads.is_empty());
        assert_eq!(scan.valid_len, 0);
        assert!(scan.damage.unwrap().contains("checksum mismatch"));
    }
}
