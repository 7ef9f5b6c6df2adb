//! Video codec adapter.
//!
//! Compressed payloads are decoded by a [`VideoDecoder`] bound to exactly one
//! [`FormatTag`]. The [`CodecAdapter`] owns at most one such decoder and
//! rebuilds it whenever the incoming format changes; decoders of different
//! formats are different types underneath, so a format switch is always a
//! teardown followed by a fresh construction, never a reconfiguration.
//!
//! ## Failure policy
//!
//! - Unknown fourcc: the payload is dropped ([`DecodeOutcome::Unsupported`]),
//!   logged once per fourcc.
//! - Decoder construction failure: fatal, returned as
//!   [`ReplayError::CodecInit`](crate::ReplayError::CodecInit).
//! - Payload rejected or a frame fails to come out: logged, the adapter
//!   reports [`DecodeOutcome::Failed`] and the pipeline moves on.
//!
//! Errors returned by the frame sink are passed through untouched.

#[cfg(feature = "ffmpeg")]
pub mod ffmpeg;

use std::collections::HashSet;
use std::fmt;
use tracing::{debug, info, trace, warn};

use crate::envelope::ImageReading;
use crate::{ReplayError, Result};

/// Supported compressed video formats
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FormatTag {
    Vp8,
    Vp9,
}

impl FormatTag {
    pub const ALL: [FormatTag; 2] = [FormatTag::Vp8, FormatTag::Vp9];

    /// Parse a fourcc. Returns `None` for formats this crate does not decode.
    pub fn from_fourcc(fourcc: &str) -> Option<Self> {
        match fourcc {
            "VP80" => Some(FormatTag::Vp8),
            "VP90" => Some(FormatTag::Vp9),
            _ => None,
        }
    }

    pub fn fourcc(&self) -> &'static str {
        match self {
            FormatTag::Vp8 => "VP80",
            FormatTag::Vp9 => "VP90",
        }
    }
}

impl fmt::Display for FormatTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.fourcc())
    }
}

/// One image plane with its row stride in bytes
#[derive(Debug, Clone, Copy)]
pub struct Plane<'a> {
    pub data: &'a [u8],
    pub stride: usize,
}

impl<'a> Plane<'a> {
    pub fn new(data: &'a [u8], stride: usize) -> Self {
        Self { data, stride }
    }
}

/// Decoded 4:2:0 planar frame, borrowed from the decoder that produced it
#[derive(Debug, Clone, Copy)]
pub struct RawFrame<'a> {
    pub width: u32,
    pub height: u32,
    pub y: Plane<'a>,
    pub u: Plane<'a>,
    pub v: Plane<'a>,
}

impl RawFrame<'_> {
    /// Width of the chroma planes in samples
    pub fn chroma_width(&self) -> usize {
        (self.width as usize).div_ceil(2)
    }

    /// Height of the chroma planes in rows
    pub fn chroma_height(&self) -> usize {
        (self.height as usize).div_ceil(2)
    }
}

/// A decoder instance bound to one format
pub trait VideoDecoder: Send {
    fn format(&self) -> FormatTag;

    /// Submit one complete compressed payload.
    fn send_payload(&mut self, payload: &[u8]) -> Result<()>;

    /// Fetch the next frame made available by previous payloads.
    ///
    /// Returns `Ok(None)` once the decoder needs more input.
    fn receive_frame(&mut self) -> Result<Option<RawFrame<'_>>>;
}

/// Constructs decoders for a format
pub trait DecoderFactory: Send {
    /// Build a decoder for `format`. `width`/`height` come from the payload
    /// that triggered the construction and are hints only.
    fn create(&mut self, format: FormatTag, width: u32, height: u32)
    -> Result<Box<dyn VideoDecoder>>;
}

/// Factory used when no decoder backend is compiled in
#[derive(Debug, Default, Clone, Copy)]
pub struct UnavailableDecoderFactory;

/// Whether a real decoder backend is compiled in.
pub const fn has_decoder_backend() -> bool {
    cfg!(feature = "ffmpeg")
}

impl DecoderFactory for UnavailableDecoderFactory {
    fn create(&mut self, format: FormatTag, _: u32, _: u32) -> Result<Box<dyn VideoDecoder>> {
        Err(ReplayError::codec_init(
            format.fourcc(),
            "no decoder backend available, rebuild with the `ffmpeg` feature",
        ))
    }
}

/// Decoder state of the adapter
#[derive(Default)]
pub enum CodecSession {
    #[default]
    Idle,
    Active { format: FormatTag, decoder: Box<dyn VideoDecoder> },
}

impl CodecSession {
    /// Format of the live decoder, if any
    pub fn format(&self) -> Option<FormatTag> {
        match self {
            CodecSession::Idle => None,
            CodecSession::Active { format, .. } => Some(*format),
        }
    }
}

impl fmt::Debug for CodecSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CodecSession::Idle => f.write_str("Idle"),
            CodecSession::Active { format, .. } => {
                f.debug_struct("Active").field("format", format).finish_non_exhaustive()
            }
        }
    }
}

/// Result of decoding one payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeOutcome {
    /// The payload was accepted; `frames` frames were handed to the sink.
    Decoded { frames: usize },
    /// The fourcc is not one of the supported formats.
    Unsupported,
    /// The decoder rejected the payload; nothing was emitted.
    Failed,
}

/// Owns the active decoder and rebuilds it on format changes
pub struct CodecAdapter {
    factory: Box<dyn DecoderFactory>,
    session: CodecSession,
    unsupported: HashSet<String>,
    rebuilds: u64,
}

impl CodecAdapter {
    pub fn new(factory: Box<dyn DecoderFactory>) -> Self {
        Self { factory, session: CodecSession::Idle, unsupported: HashSet::new(), rebuilds: 0 }
    }

    pub fn session(&self) -> &CodecSession {
        &self.session
    }

    /// Number of decoder constructions so far
    pub fn rebuilds(&self) -> u64 {
        self.rebuilds
    }

    /// Make sure the live decoder handles `format`.
    ///
    /// Returns `true` when a new decoder was constructed. Any previous decoder
    /// is dropped before the new one is built. On failure the session is left
    /// idle and the error is fatal.
    pub fn ensure_format(&mut self, format: FormatTag, width: u32, height: u32) -> Result<bool> {
        if self.session.format() == Some(format) {
            return Ok(false);
        }

        if let CodecSession::Active { format: previous, .. } =
            std::mem::take(&mut self.session)
        {
            info!(from = %previous, to = %format, "Video format changed, tearing down decoder");
        }

        let decoder = self.factory.create(format, width, height)?;
        self.rebuilds += 1;
        info!(%format, width, height, "Initialized decoder");
        self.session = CodecSession::Active { format, decoder };
        Ok(true)
    }

    /// Decode one payload, handing every produced frame to `on_frame` in the
    /// order the decoder yields them.
    pub fn decode<F>(&mut self, reading: &ImageReading, mut on_frame: F) -> Result<DecodeOutcome>
    where
        F: FnMut(&RawFrame<'_>) -> Result<()>,
    {
        let Some(format) = FormatTag::from_fourcc(&reading.fourcc) else {
            if self.unsupported.insert(reading.fourcc.clone()) {
                warn!(fourcc = %reading.fourcc, "Ignoring video frames with unsupported format");
            }
            return Ok(DecodeOutcome::Unsupported);
        };

        self.ensure_format(format, reading.width, reading.height)?;
        let CodecSession::Active { decoder, .. } = &mut self.session else {
            return Err(ReplayError::codec_init(format.fourcc(), "no decoder after initialization"));
        };

        if let Err(e) = decoder.send_payload(&reading.data) {
            warn!(%format, bytes = reading.data.len(), "Decoding failed for current frame: {}", e);
            return Ok(DecodeOutcome::Failed);
        }

        let mut frames = 0usize;
        loop {
            match decoder.receive_frame() {
                Ok(Some(frame)) => {
                    trace!(%format, width = frame.width, height = frame.height, index = frames, "Decoded frame");
                    on_frame(&frame)?;
                    frames += 1;
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(%format, frames, "Failed to retrieve decoded frame: {}", e);
                    if frames == 0 {
                        return Ok(DecodeOutcome::Failed);
                    }
                    break;
                }
            }
        }

        debug!(%format, bytes = reading.data.len(), frames, "Decoded payload");
        Ok(DecodeOutcome::Decoded { frames })
    }
}
