use thiserror::Error;

use crate::{Msg, ring::RingBuffer};

/// Frame header: `[type: u8, length: u16 little-endian]`.
pub const HEADER_LEN: usize = 3;
/// Largest payload a single frame can carry.
pub const MAX_PAYLOAD: usize = u16::MAX as usize;
/// Boot images are streamed in `FASTBOOT_DOWNLOAD` chunks of at most this
/// many payload bytes, terminated by one zero-length chunk.
pub const FASTBOOT_CHUNK: usize = 2048;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum WireError {
    #[error("payload of {0} bytes exceeds the {MAX_PAYLOAD}-byte frame limit")]
    Oversize(usize),
}

/// Encodes one frame.
pub fn encode(kind: impl Into<u8>, payload: &[u8]) -> Result<Vec<u8>, WireError> {
    let mut out = Vec::with_capacity(HEADER_LEN + payload.len());
    encode_into(&mut out, kind, payload)?;
    Ok(out)
}

/// Appends one frame to `out`: the 3-byte header followed by exactly
/// `payload.len()` bytes. A frame is never emitted partially encoded.
pub fn encode_into(out: &mut Vec<u8>, kind: impl Into<u8>, payload: &[u8]) -> Result<(), WireError> {
    if payload.len() > MAX_PAYLOAD {
        return Err(WireError::Oversize(payload.len()));
    }
    out.push(kind.into());
    out.extend_from_slice(&(payload.len() as u16).to_le_bytes());
    out.extend_from_slice(payload);
    Ok(())
}

/// Decodes one frame if the ring holds both the header and the full payload;
/// otherwise leaves the ring untouched and reports "need more" as `None`.
///
/// Framing errors are impossible by construction: the length field bounds
/// the payload and an unknown type byte is passed through in [`Msg::kind`].
pub fn try_decode(ring: &mut RingBuffer) -> Option<Msg> {
    let mut hdr = [0u8; HEADER_LEN];
    if ring.peek(&mut hdr) < HEADER_LEN {
        return None;
    }
    let len = u16::from_le_bytes([hdr[1], hdr[2]]) as usize;
    if ring.available() < HEADER_LEN + len {
        return None;
    }

    ring.consume(HEADER_LEN);
    let mut payload = vec![0; len];
    let copied = ring.peek(&mut payload);
    debug_assert_eq!(copied, len);
    ring.consume(len);
    Some(Msg { kind: hdr[0], payload })
}
