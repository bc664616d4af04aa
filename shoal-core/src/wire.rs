//! Framing: length-prefix (4 bytes LE) + bincode payload.

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::protocol::Frame;

pub const LEN_SIZE: usize = 4;
pub const MAX_FRAME_LEN: u32 = 16 * 1024 * 1024; // 16 MiB

/// Encode a frame: 4 bytes LE length + bincode payload.
pub fn encode_frame(frame: &Frame) -> Result<Vec<u8>, FrameEncodeError> {
    let payload = encode_payload(frame)?;
    Ok(length_prefixed(&payload))
}

/// Prefix `payload` with its length. Used for the encrypted link records too.
pub fn length_prefixed(payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(LEN_SIZE + payload.len());
    out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    out.extend_from_slice(payload);
    out
}

/// Bincode-encode any protocol value, enforcing the frame size limit.
pub fn encode_payload<T: Serialize>(value: &T) -> Result<Vec<u8>, FrameEncodeError> {
    let payload = bincode::serialize(value).map_err(FrameEncodeError::Encode)?;
    if payload.len() > MAX_FRAME_LEN as usize {
        return Err(FrameEncodeError::TooLarge);
    }
    Ok(payload)
}

/// Decode a bincode protocol value.
pub fn decode_payload<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, FrameDecodeError> {
    bincode::deserialize(bytes).map_err(FrameDecodeError::Decode)
}

/// Error encoding a frame (bincode or size limit).
#[derive(Debug, thiserror::Error)]
pub enum FrameEncodeError {
    #[error("encode error: {0}")]
    Encode(#[from] bincode::Error),
    #[error("frame too large")]
    TooLarge,
}

/// Split one length-prefixed record off the front of `bytes`.
/// Returns the record body and the number of bytes consumed.
pub fn split_record(bytes: &[u8]) -> Result<(&[u8], usize), FrameDecodeError> {
    if bytes.len() < LEN_SIZE {
        return Err(FrameDecodeError::NeedMore);
    }
    let len = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
    if len > MAX_FRAME_LEN as usize {
        return Err(FrameDecodeError::TooLarge);
    }
    if bytes.len() < LEN_SIZE + len {
        return Err(FrameDecodeError::NeedMore);
    }
    Ok((&bytes[LEN_SIZE..LEN_SIZE + len], LEN_SIZE + len))
}

/// Decode one frame from the front of `bytes`. Returns the frame and the number of bytes consumed.
/// Call with partial buffer; returns `NeedMore` if not enough bytes yet.
pub fn decode_frame(bytes: &[u8]) -> Result<(Frame, usize), FrameDecodeError> {
    let (body, consumed) = split_record(bytes)?;
    let frame = decode_payload(body)?;
    Ok((frame, consumed))
}

/// Error decoding a frame (need more bytes, too large, or bincode failure).
#[derive(Debug, thiserror::Error)]
pub enum FrameDecodeError {
    #[error("need more bytes")]
    NeedMore,
    #[error("frame too large")]
    TooLarge,
    #[error("decode error: {0}")]
    Decode(#[from] bincode::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{CloseCode, OpenOutcome};

    fn sample_open() -> Frame {
        Frame::Open {
            channel: 4,
            protocol: "shoal/transfer/1".to_string(),
        }
    }

    #[test]
    fn roundtrip_open() {
        let frame = sample_open();
        let bytes = encode_frame(&frame).unwrap();
        let (decoded, n) = decode_frame(&bytes).unwrap();
        assert_eq!(n, bytes.len());
        assert_eq!(decoded, frame);
    }

    #[test]
    fn partial_read_need_more() {
        let bytes = encode_frame(&sample_open()).unwrap();
        assert!(matches!(
            decode_frame(&bytes[..2]),
            Err(FrameDecodeError::NeedMore)
        ));
        assert!(matches!(
            decode_frame(&bytes[..LEN_SIZE]),
            Err(FrameDecodeError::NeedMore)
        ));
    }

    #[test]
    fn oversized_length_rejected() {
        let mut bytes = (MAX_FRAME_LEN + 1).to_le_bytes().to_vec();
        bytes.extend_from_slice(&[0u8; 8]);
        assert!(matches!(
            decode_frame(&bytes),
            Err(FrameDecodeError::TooLarge)
        ));
    }

    #[test]
    fn multiple_frames() {
        let a = sample_open();
        let b = Frame::OpenReply {
            channel: 4,
            outcome: OpenOutcome::RequestDenied,
        };
        let c = Frame::Close {
            channel: 4,
            code: CloseCode::Done,
        };
        let mut buf = Vec::new();
        for f in [&a, &b, &c] {
            buf.extend_from_slice(&encode_frame(f).unwrap());
        }
        let (m1, n1) = decode_frame(&buf).unwrap();
        let (m2, n2) = decode_frame(&buf[n1..]).unwrap();
        let (m3, _) = decode_frame(&buf[n1 + n2..]).unwrap();
        assert_eq!(m1, a);
        assert_eq!(m2, b);
        assert_eq!(m3, c);
    }
}
