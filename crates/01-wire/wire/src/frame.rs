//! Byte-level framing: start byte, COBS block, CRC trailer.
//!
//! On-wire layout, fixed by the firmware:
//!
//! ```text
//! [start][payload_len][ overhead | stuffed payload | delimiter ][crc_lo][crc_hi]
//! ```
//!
//! `payload_len` counts the unstuffed payload. The COBS block contains no
//! zero byte other than the trailing delimiter, so the receiver finds the
//! block end by scanning for `0x00`. The CRC-16/IBM-3740 is computed over
//! the entire COBS block (overhead byte through delimiter inclusive).

use crc::{Crc, CRC_16_IBM_3740};

use crate::{WireError, WireResult};

/// Frame synchronization byte.
pub const START_BYTE: u8 = 0x81;
/// COBS frame delimiter.
pub const DELIMITER: u8 = 0x00;
/// Maximum unstuffed payload length accepted by the firmware.
pub const MAX_PAYLOAD_LEN: usize = 254;

const CRC16: Crc<u16> = Crc::<u16>::new(&CRC_16_IBM_3740);

/// Wraps an unframed payload into a complete wire frame.
pub fn encode_frame(payload: &[u8]) -> WireResult<Vec<u8>> {
    if payload.is_empty() {
        return Err(WireError::Framing("empty payload"));
    }
    if payload.len() > MAX_PAYLOAD_LEN {
        return Err(WireError::Oversize(payload.len()));
    }

    let mut block = vec![0u8; corncobs::max_encoded_len(payload.len())];
    let block_len = corncobs::encode_buf(payload, &mut block);
    block.truncate(block_len);

    let crc = CRC16.checksum(&block);

    let mut frame = Vec::with_capacity(2 + block.len() + 2);
    frame.push(START_BYTE);
    frame.push(payload.len() as u8);
    frame.extend_from_slice(&block);
    frame.extend_from_slice(&crc.to_le_bytes());
    Ok(frame)
}

/// Incremental frame scanner over a raw serial byte stream.
///
/// Bytes are appended with [`push_bytes`](Self::push_bytes); complete frames
/// come back from [`next_payload`](Self::next_payload) as unframed payload
/// buffers. Garbage between frames is skipped one byte at a time so a single
/// corrupt frame cannot desynchronize the reader permanently.
#[derive(Debug, Default)]
pub struct FrameReader {
    buf: Vec<u8>,
    cursor: usize,
}

impl FrameReader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends freshly read serial bytes.
    pub fn push_bytes(&mut self, bytes: &[u8]) {
        // Reclaim consumed prefix before growing.
        if self.cursor > 0 && self.cursor == self.buf.len() {
            self.buf.clear();
            self.cursor = 0;
        } else if self.cursor > 4096 {
            self.buf.drain(..self.cursor);
            self.cursor = 0;
        }
        self.buf.extend_from_slice(bytes);
    }

    /// Number of buffered, not-yet-consumed bytes.
    pub fn pending(&self) -> usize {
        self.buf.len() - self.cursor
    }

    /// Extracts the next complete frame's payload.
    ///
    /// Returns `Ok(None)` when the buffer holds no complete frame yet. On a
    /// decode error the offending start byte is consumed so the caller can
    /// count the error and continue scanning.
    pub fn next_payload(&mut self) -> WireResult<Option<Vec<u8>>> {
        loop {
            // Hunt for the start byte.
            match self.buf[self.cursor..].iter().position(|&b| b == START_BYTE) {
                Some(offset) => self.cursor += offset,
                None => {
                    self.cursor = self.buf.len();
                    return Ok(None);
                }
            }

            match self.try_decode_at(self.cursor) {
                Ok(Some((payload, consumed))) => {
                    self.cursor += consumed;
                    return Ok(Some(payload));
                }
                Ok(None) => return Ok(None),
                Err(err) => {
                    // Skip the bad start byte and resynchronize on the next
                    // candidate after reporting the error once.
                    self.cursor += 1;
                    return Err(err);
                }
            }
        }
    }

    /// Attempts to decode one frame starting at `start`. Returns the payload
    /// and the number of bytes consumed, or `None` when more bytes are
    /// needed.
    fn try_decode_at(&self, start: usize) -> WireResult<Option<(Vec<u8>, usize)>> {
        let frame = &self.buf[start..];
        if frame.len() < 2 {
            return Ok(None);
        }
        debug_assert_eq!(frame[0], START_BYTE);

        let payload_len = frame[1] as usize;
        if payload_len == 0 || payload_len > MAX_PAYLOAD_LEN {
            return Err(WireError::Framing("payload length out of range"));
        }

        // The COBS block ends at the first zero byte. Bound the scan by the
        // worst-case stuffed length so a corrupted length byte cannot make
        // us wait forever for a delimiter that never comes.
        let max_block = corncobs::max_encoded_len(payload_len);
        let block_region = &frame[2..];
        let delimiter_pos = match block_region
            .iter()
            .take(max_block)
            .position(|&b| b == DELIMITER)
        {
            Some(pos) => pos,
            None => {
                if block_region.len() >= max_block {
                    return Err(WireError::Framing("delimiter not found in frame window"));
                }
                return Ok(None);
            }
        };

        let block_len = delimiter_pos + 1;
        let total = 2 + block_len + 2;
        if frame.len() < total {
            return Ok(None);
        }

        let block = &frame[2..2 + block_len];
        let found_crc = u16::from_le_bytes(
            frame[2 + block_len..total].try_into().expect("len checked"),
        );
        let expected_crc = CRC16.checksum(block);
        if found_crc != expected_crc {
            return Err(WireError::Crc {
                expected: expected_crc,
                found: found_crc,
            });
        }

        let mut payload = vec![0u8; block_len];
        let decoded_len = corncobs::decode_buf(block, &mut payload)
            .map_err(|_| WireError::Framing("cobs unstuffing failed"))?;
        if decoded_len != payload_len {
            return Err(WireError::Truncated {
                needed: payload_len,
                found: decoded_len,
            });
        }
        payload.truncate(decoded_len);
        Ok(Some((payload, total)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_layout_matches_constant_table() {
        let frame = encode_frame(&[9, 1, 2, 0, 51]).expect("encode");
        assert_eq!(frame[0], START_BYTE);
        assert_eq!(frame[1], 5);
        // Single delimiter, located two bytes before the end (CRC trailer).
        let delimiters: Vec<usize> = frame
            .iter()
            .enumerate()
            .filter(|(_, &b)| b == DELIMITER)
            .map(|(i, _)| i)
            .collect();
        assert_eq!(delimiters, vec![frame.len() - 3]);
    }

    #[test]
    fn reader_recovers_payload() {
        let payload = vec![8, 5, 1, 0, 52, 7, 0x34, 0x12];
        let frame = encode_frame(&payload).expect("encode");
        let mut reader = FrameReader::new();
        reader.push_bytes(&frame);
        let decoded = reader.next_payload().expect("decode").expect("complete");
        assert_eq!(decoded, payload);
        assert!(reader.next_payload().expect("no error").is_none());
    }

    #[test]
    fn reader_handles_split_delivery() {
        let payload = vec![2, 5, 1, 0, 1, 0];
        let frame = encode_frame(&payload).expect("encode");
        let mut reader = FrameReader::new();
        let (head, tail) = frame.split_at(3);
        reader.push_bytes(head);
        assert!(reader.next_payload().expect("incomplete").is_none());
        reader.push_bytes(tail);
        assert_eq!(
            reader.next_payload().expect("decode").expect("complete"),
            payload
        );
    }

    #[test]
    fn reader_skips_interframe_noise() {
        let payload = vec![9, 5, 1, 0, 52];
        let frame = encode_frame(&payload).expect("encode");
        let mut reader = FrameReader::new();
        reader.push_bytes(&[0x00, 0x42, 0x10]);
        reader.push_bytes(&frame);
        assert_eq!(
            reader.next_payload().expect("decode").expect("complete"),
            payload
        );
    }

    #[test]
    fn corrupt_crc_is_reported_then_skipped() {
        let payload = vec![2, 5, 1, 0, 1, 1];
        let mut frame = encode_frame(&payload).expect("encode");
        let last = frame.len() - 1;
        frame[last] ^= 0xFF;
        let mut reader = FrameReader::new();
        reader.push_bytes(&frame);

        assert!(matches!(
            reader.next_payload(),
            Err(WireError::Crc { .. })
        ));

        // A healthy frame after the corrupt one still decodes.
        let clean = encode_frame(&payload).expect("encode");
        reader.push_bytes(&clean);
        let mut recovered = None;
        for _ in 0..frame.len() + 1 {
            match reader.next_payload() {
                Ok(Some(p)) => {
                    recovered = Some(p);
                    break;
                }
                Ok(None) => break,
                Err(_) => continue,
            }
        }
        assert_eq!(recovered.as_deref(), Some(payload.as_slice()));
    }

    #[test]
    fn oversize_payload_is_refused() {
        let payload = vec![0u8; MAX_PAYLOAD_LEN + 1];
        assert_eq!(
            encode_frame(&payload),
            Err(WireError::Oversize(MAX_PAYLOAD_LEN + 1))
        );
    }
}
