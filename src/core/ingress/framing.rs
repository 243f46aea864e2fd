//! Binary audio framing and timestamp reordering.
//!
//! Devices may prefix each Opus packet with a 16-byte header:
//!
//! ```text
//! bytes 0..8   reserved
//! bytes 8..12  timestamp (ms, big-endian u32)
//! bytes 12..16 payload length (big-endian u32)
//! bytes 16..   payload
//! ```

use std::collections::BTreeMap;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::debug;

pub const FRAME_HEADER_LEN: usize = 16;

/// Hard upper bound of the reorder buffer
pub const MAX_REORDER_DEPTH: usize = 20;

/// Packets held back for reordering unless configured otherwise; each one
/// delays speech detection by a frame duration.
pub const DEFAULT_REORDER_DEPTH: usize = 2;

/// How inbound binary frames are interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FramingMode {
    /// Header is detected by checking the length field
    #[default]
    Auto,
    Always,
    Never,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FramingError {
    #[error("Frame shorter than header: {0} bytes")]
    TooShort(usize),
    #[error("Declared payload length {declared} does not match actual {actual}")]
    LengthMismatch { declared: usize, actual: usize },
}

/// One inbound audio packet after header stripping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FramedPacket {
    pub timestamp_ms: Option<u32>,
    pub payload: Bytes,
}

fn read_be_u32(bytes: &[u8]) -> u32 {
    u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

fn has_valid_header(data: &[u8]) -> bool {
    data.len() >= FRAME_HEADER_LEN
        && read_be_u32(&data[12..16]) as usize == data.len() - FRAME_HEADER_LEN
}

/// Strip the framing header according to `mode`.
pub fn parse_frame(data: Bytes, mode: FramingMode) -> Result<FramedPacket, FramingError> {
    let framed = match mode {
        FramingMode::Never => false,
        FramingMode::Always => true,
        FramingMode::Auto => has_valid_header(&data),
    };

    if !framed {
        return Ok(FramedPacket {
            timestamp_ms: None,
            payload: data,
        });
    }

    if data.len() < FRAME_HEADER_LEN {
        return Err(FramingError::TooShort(data.len()));
    }
    let timestamp = read_be_u32(&data[8..12]);
    let declared = read_be_u32(&data[12..16]) as usize;
    let actual = data.len() - FRAME_HEADER_LEN;
    if declared != actual {
        return Err(FramingError::LengthMismatch { declared, actual });
    }

    Ok(FramedPacket {
        timestamp_ms: Some(timestamp),
        payload: data.slice(FRAME_HEADER_LEN..),
    })
}

/// Build a framed packet; used by clients and tests.
pub fn encode_frame(timestamp_ms: u32, payload: &[u8]) -> Bytes {
    let mut out = Vec::with_capacity(FRAME_HEADER_LEN + payload.len());
    out.extend_from_slice(&[0u8; 8]);
    out.extend_from_slice(&timestamp_ms.to_be_bytes());
    out.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    out.extend_from_slice(payload);
    Bytes::from(out)
}

/// Small jitter buffer that releases packets in timestamp order.
///
/// Up to `depth` packets are held back so late packets can be slotted in.
/// A packet whose timestamp is not newer than the last released one is
/// dropped. Unframed packets (no timestamp) bypass the buffer.
pub struct ReorderBuffer {
    depth: usize,
    pending: BTreeMap<u32, Bytes>,
    last_delivered: Option<u32>,
    dropped: u64,
}

impl ReorderBuffer {
    pub fn new(depth: usize) -> Self {
        Self {
            depth: depth.min(MAX_REORDER_DEPTH),
            pending: BTreeMap::new(),
            last_delivered: None,
            dropped: 0,
        }
    }

    /// Insert a packet and return the payloads now ready for decoding.
    pub fn push(&mut self, packet: FramedPacket) -> Vec<Bytes> {
        let Some(ts) = packet.timestamp_ms else {
            return vec![packet.payload];
        };

        if self.last_delivered.is_some_and(|last| ts <= last) || self.pending.contains_key(&ts) {
            self.dropped += 1;
            debug!("Dropping late or duplicate audio packet ts={}", ts);
            return Vec::new();
        }

        self.pending.insert(ts, packet.payload);

        let mut ready = Vec::new();
        while self.pending.len() > self.depth {
            if let Some((ts, payload)) = self.pending.pop_first() {
                self.last_delivered = Some(ts);
                ready.push(payload);
            }
        }
        ready
    }

    /// Release everything still buffered, oldest first.
    pub fn flush(&mut self) -> Vec<Bytes> {
        let pending = std::mem::take(&mut self.pending);
        if let Some((ts, _)) = pending.last_key_value() {
            self.last_delivered = Some(*ts);
        }
        pending.into_values().collect()
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn packet(ts: u32, tag: u8) -> FramedPacket {
        FramedPacket {
            timestamp_ms: Some(ts),
            payload: Bytes::from(vec![tag]),
        }
    }

    #[test]
    fn test_parse_framed_packet() {
        let framed = encode_frame(1234, &[9, 8, 7]);
        let packet = parse_frame(framed, FramingMode::Auto).unwrap();
        assert_eq!(packet.timestamp_ms, Some(1234));
        assert_eq!(packet.payload.as_ref(), &[9, 8, 7]);
    }

    #[test]
    fn test_auto_mode_passes_raw_payload() {
        let raw = Bytes::from_static(&[1, 2, 3, 4, 5]);
        let packet = parse_frame(raw.clone(), FramingMode::Auto).unwrap();
        assert_eq!(packet.timestamp_ms, None);
        assert_eq!(packet.payload, raw);
    }

    #[test]
    fn test_always_mode_rejects_bad_length() {
        let mut data = encode_frame(1, &[1, 2, 3]).to_vec();
        data.push(0);
        let err = parse_frame(Bytes::from(data), FramingMode::Always).unwrap_err();
        assert_eq!(
            err,
            FramingError::LengthMismatch {
                declared: 3,
                actual: 4
            }
        );
    }

    #[test]
    fn test_reorder_sorts_within_depth() {
        let mut buffer = ReorderBuffer::new(2);
        assert!(buffer.push(packet(60, 2)).is_empty());
        assert!(buffer.push(packet(0, 1)).is_empty());
        let ready = buffer.push(packet(120, 3));
        assert_eq!(ready, vec![Bytes::from(vec![1u8])]);
        let rest = buffer.flush();
        assert_eq!(rest, vec![Bytes::from(vec![2u8]), Bytes::from(vec![3u8])]);
    }

    #[test]
    fn test_reorder_drops_stale_packets() {
        let mut buffer = ReorderBuffer::new(0);
        assert_eq!(buffer.push(packet(100, 1)).len(), 1);
        assert!(buffer.push(packet(40, 2)).is_empty());
        assert!(buffer.push(packet(100, 3)).is_empty());
        assert_eq!(buffer.dropped(), 2);
        assert_eq!(buffer.push(packet(160, 4)).len(), 1);
    }

    #[test]
    fn test_default_depth_releases_in_order_stream() {
        let mut buffer = ReorderBuffer::new(DEFAULT_REORDER_DEPTH);
        assert!(buffer.push(packet(0, 0)).is_empty());
        assert!(buffer.push(packet(60, 1)).is_empty());
        // from here on every packet releases the oldest one
        for i in 2..10u8 {
            let ready = buffer.push(packet(u32::from(i) * 60, i));
            assert_eq!(ready, vec![Bytes::from(vec![i - 2])]);
        }
        assert_eq!(buffer.len(), DEFAULT_REORDER_DEPTH);
    }

    #[test]
    fn test_depth_is_capped() {
        let buffer = ReorderBuffer::new(500);
        assert_eq!(buffer.depth, MAX_REORDER_DEPTH);
    }
}
