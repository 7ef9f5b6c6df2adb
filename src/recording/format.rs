//! Container framing for recorded envelopes
//!
//! A recording is a plain concatenation of framed envelopes. Every frame
//! starts with a five byte header followed by the encoded envelope:
//!
//! | offset | size | content                                   |
//! |--------|------|-------------------------------------------|
//! | 0      | 1    | `0x0D`                                    |
//! | 1      | 1    | `0xA4`                                    |
//! | 2      | 3    | payload length, 24-bit little-endian      |
//! | 5      | n    | encoded [`Envelope`](crate::envelope::Envelope) |
//!
//! The same framing is used for envelopes sent to the live session.

use crate::{ReplayError, Result};
use std::io::{ErrorKind, Read};

pub const FRAME_MAGIC: [u8; 2] = [0x0D, 0xA4];
pub const FRAME_HEADER_SIZE: usize = 5;
/// Largest payload representable by the 24-bit length field
pub const MAX_FRAME_PAYLOAD: usize = 0x00FF_FFFF;

/// Prefix `payload` with the container header.
pub fn frame_envelope(payload: &[u8]) -> Result<Vec<u8>> {
    if payload.len() > MAX_FRAME_PAYLOAD {
        return Err(ReplayError::parse(
            "Envelope framing",
            format!("payload of {} bytes exceeds 24-bit length field", payload.len()),
        ));
    }

    let len = payload.len() as u32;
    let mut framed = Vec::with_capacity(FRAME_HEADER_SIZE + payload.len());
    framed.extend_from_slice(&FRAME_MAGIC);
    framed.extend_from_slice(&len.to_le_bytes()[..3]);
    framed.extend_from_slice(payload);
    Ok(framed)
}

/// Parse a frame header, returning the payload length.
pub fn parse_frame_header(header: &[u8; FRAME_HEADER_SIZE]) -> Result<usize> {
    if header[..2] != FRAME_MAGIC {
        return Err(ReplayError::parse(
            "Envelope framing",
            format!("bad magic {:#04x} {:#04x}", header[0], header[1]),
        ));
    }
    Ok(u32::from_le_bytes([header[2], header[3], header[4], 0]) as usize)
}

/// Read the next frame header from `reader`.
///
/// Returns `Ok(None)` on a clean end of input (no bytes left before the header).
pub fn read_frame_header<R: Read>(reader: &mut R) -> Result<Option<usize>> {
    let mut header = [0u8; FRAME_HEADER_SIZE];
    let mut filled = 0;
    while filled < FRAME_HEADER_SIZE {
        match reader.read(&mut header[filled..]) {
            Ok(0) if filled == 0 => return Ok(None),
            Ok(0) => {
                return Err(ReplayError::parse(
                    "Envelope framing",
                    format!("truncated header ({} of {} bytes)", filled, FRAME_HEADER_SIZE),
                ));
            }
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    parse_frame_header(&header).map(Some)
}

/// Split a framed datagram into its payload.
pub fn unframe(datagram: &[u8]) -> Result<&[u8]> {
    let header: &[u8; FRAME_HEADER_SIZE] = datagram
        .get(..FRAME_HEADER_SIZE)
        .and_then(|h| h.try_into().ok())
        .ok_or_else(|| ReplayError::parse("Envelope framing", "datagram shorter than header"))?;
    let len = parse_frame_header(header)?;
    datagram.get(FRAME_HEADER_SIZE..FRAME_HEADER_SIZE + len).ok_or_else(|| {
        ReplayError::parse(
            "Envelope framing",
            format!("datagram holds {} payload bytes, header claims {}", datagram.len() - 5, len),
        )
    })
}
