//! libavcodec-backed VP8/VP9 decoders.

use ffmpeg_next as ffmpeg;
use std::sync::Once;
use tracing::debug;

use super::{DecoderFactory, FormatTag, Plane, RawFrame, VideoDecoder};
use crate::{ReplayError, Result};

static FFMPEG_INIT: Once = Once::new();

/// Builds one libavcodec decoder per format switch
#[derive(Debug, Default)]
pub struct FfmpegDecoderFactory {
    _private: (),
}

impl FfmpegDecoderFactory {
    pub fn new() -> Self {
        FFMPEG_INIT.call_once(|| {
            if let Err(e) = ffmpeg::init() {
                tracing::error!("Failed to initialize FFmpeg: {}", e);
            }
        });
        Self { _private: () }
    }
}

impl DecoderFactory for FfmpegDecoderFactory {
    fn create(
        &mut self,
        format: FormatTag,
        width: u32,
        height: u32,
    ) -> Result<Box<dyn VideoDecoder>> {
        let id = match format {
            FormatTag::Vp8 => ffmpeg::codec::Id::VP8,
            FormatTag::Vp9 => ffmpeg::codec::Id::VP9,
        };
        let codec = ffmpeg::codec::decoder::find(id).ok_or_else(|| {
            ReplayError::codec_init(format.fourcc(), "libavcodec was built without this decoder")
        })?;

        let mut context = ffmpeg::codec::Context::new_with_codec(codec);
        // SAFETY: the context was just allocated and is not shared yet.
        unsafe {
            let raw = context.as_mut_ptr();
            (*raw).width = width as i32;
            (*raw).height = height as i32;
        }

        let decoder = context.decoder().video().map_err(|e| {
            ReplayError::codec_init_with_source(format.fourcc(), "failed to open decoder", Box::new(e))
        })?;
        debug!(%format, width, height, "Opened libavcodec decoder");

        Ok(Box::new(FfmpegDecoder { format, decoder, frame: ffmpeg::frame::Video::empty() }))
    }
}

pub struct FfmpegDecoder {
    format: FormatTag,
    decoder: ffmpeg::decoder::Video,
    frame: ffmpeg::frame::Video,
}

// SAFETY: the decoder and its frame buffer are only accessed through
// `&mut self`, never concurrently.
unsafe impl Send for FfmpegDecoder {}

impl VideoDecoder for FfmpegDecoder {
    fn format(&self) -> FormatTag {
        self.format
    }

    fn send_payload(&mut self, payload: &[u8]) -> Result<()> {
        let packet = ffmpeg::Packet::copy(payload);
        self.decoder.send_packet(&packet).map_err(|e| {
            ReplayError::decode_with_source(self.format.fourcc(), "payload rejected", Box::new(e))
        })
    }

    fn receive_frame(&mut self) -> Result<Option<RawFrame<'_>>> {
        match self.decoder.receive_frame(&mut self.frame) {
            Ok(()) => {}
            Err(ffmpeg::Error::Eof) => return Ok(None),
            Err(ffmpeg::Error::Other { errno }) if errno == ffmpeg::util::error::EAGAIN => {
                return Ok(None);
            }
            Err(e) => {
                return Err(ReplayError::decode_with_source(
                    self.format.fourcc(),
                    "failed to receive frame",
                    Box::new(e),
                ));
            }
        }

        if self.frame.format() != ffmpeg::format::Pixel::YUV420P {
            return Err(ReplayError::decode(
                self.format.fourcc(),
                format!("unsupported pixel format {:?}", self.frame.format()),
            ));
        }

        let frame = &self.frame;
        Ok(Some(RawFrame {
            width: frame.width(),
            height: frame.height(),
            y: Plane::new(frame.data(0), frame.stride(0)),
            u: Plane::new(frame.data(1), frame.stride(1)),
            v: Plane::new(frame.data(2), frame.stride(2)),
        }))
    }
}
