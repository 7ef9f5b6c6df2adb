//! Test utilities: synthetic frames, spy collaborators and recording builders
//!
//! Everything here stands in for an external collaborator of the pipeline
//! (decoder backend, output region, recording, live session) and records what
//! the pipeline did to it, so tests can assert on ordering and counts.

#![cfg(any(test, feature = "test-utils"))]

use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::codec::{DecoderFactory, FormatTag, Plane, RawFrame, VideoDecoder};
use crate::envelope::{Envelope, IMAGE_READING_ID, ImageReading, TimeStamp};
use crate::publish::{HeapAllocator, HeapRegion, OutputRegion, RegionAllocator};
use crate::recording::format::frame_envelope;
use crate::session::LiveSession;
use crate::source::RecordSource;
use crate::{ReplayError, Result};

/// Owned I420 image with configurable plane strides
#[derive(Debug, Clone)]
pub struct PlanarImage {
    width: u32,
    height: u32,
    y: Vec<u8>,
    u: Vec<u8>,
    v: Vec<u8>,
    luma_stride: usize,
    chroma_stride: usize,
}

impl PlanarImage {
    /// Image with every sample set to the given values
    pub fn solid(width: u32, height: u32, luma: u8, u: u8, v: u8) -> Self {
        Self::with_strides(width, height, 0, luma, u, v)
    }

    fn with_strides(width: u32, height: u32, padding: usize, luma: u8, u: u8, v: u8) -> Self {
        let chroma_width = (width as usize).div_ceil(2);
        let chroma_height = (height as usize).div_ceil(2);
        let luma_stride = width as usize + padding;
        let chroma_stride = chroma_width + padding;
        Self {
            width,
            height,
            y: vec![luma; luma_stride * height as usize],
            u: vec![u; chroma_stride * chroma_height],
            v: vec![v; chroma_stride * chroma_height],
            luma_stride,
            chroma_stride,
        }
    }

    /// Same content with `padding` extra bytes at the end of every row
    pub fn with_padding(self, padding: usize) -> Self {
        Self::with_strides(self.width, self.height, padding, self.y[0], self.u[0], self.v[0])
    }

    /// Set one chroma sample (covers a 2x2 block of pixels)
    pub fn set_chroma(&mut self, cx: usize, cy: usize, u: u8, v: u8) {
        self.u[cy * self.chroma_stride + cx] = u;
        self.v[cy * self.chroma_stride + cx] = v;
    }

    pub fn fill_luma(&mut self, luma: u8) {
        self.y.fill(luma);
    }

    pub fn frame(&self) -> RawFrame<'_> {
        RawFrame {
            width: self.width,
            height: self.height,
            y: Plane::new(&self.y, self.luma_stride),
            u: Plane::new(&self.u, self.chroma_stride),
            v: Plane::new(&self.v, self.chroma_stride),
        }
    }
}

/// Decoder lifecycle events
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CodecEvent {
    Created(FormatTag),
    Dropped(FormatTag),
    Submitted { format: FormatTag, len: usize, first_byte: u8 },
}

impl CodecEvent {
    pub fn is_submission(&self) -> bool {
        matches!(self, CodecEvent::Submitted { .. })
    }
}

/// Everything the spies observed, in order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Codec(CodecEvent),
    Published { timestamp: TimeStamp, first_pixel: [u8; 4], at: Instant },
}

/// Shared, ordered event log
#[derive(Debug, Clone, Default)]
pub struct EventLog {
    events: Arc<Mutex<Vec<Event>>>,
}

impl EventLog {
    pub fn push(&self, event: Event) {
        self.events.lock().unwrap().push(event);
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    pub fn codec_events(&self) -> Vec<CodecEvent> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                Event::Codec(codec) => Some(codec),
                _ => None,
            })
            .collect()
    }

    pub fn published_timestamps(&self) -> Vec<TimeStamp> {
        self.publishes().into_iter().map(|(timestamp, _, _)| timestamp).collect()
    }

    /// `(timestamp, first pixel, wall-clock instant)` of every publish
    pub fn publishes(&self) -> Vec<(TimeStamp, [u8; 4], Instant)> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                Event::Published { timestamp, first_pixel, at } => Some((timestamp, first_pixel, at)),
                _ => None,
            })
            .collect()
    }
}

/// Decoder factory producing [`SpyDecoder`]s
///
/// Each payload yields `frames_per_payload` gray frames whose luma is the
/// first payload byte plus the frame index, so frame order is visible in the
/// published pixels.
#[derive(Debug, Clone)]
pub struct SpyDecoderFactory {
    log: EventLog,
    frames_per_payload: usize,
    fail_init: Option<FormatTag>,
    fail_marker: Option<u8>,
    decode_delay: Duration,
}

impl SpyDecoderFactory {
    pub fn new(log: EventLog) -> Self {
        Self { log, frames_per_payload: 1, fail_init: None, fail_marker: None, decode_delay: Duration::ZERO }
    }

    pub fn frames_per_payload(mut self, frames: usize) -> Self {
        self.frames_per_payload = frames;
        self
    }

    pub fn fail_init_for(mut self, format: FormatTag) -> Self {
        self.fail_init = Some(format);
        self
    }

    /// Reject payloads whose first byte is `marker`
    pub fn fail_payloads_starting_with(mut self, marker: u8) -> Self {
        self.fail_marker = Some(marker);
        self
    }

    /// Block for `delay` on every submitted payload
    pub fn decode_delay(mut self, delay: Duration) -> Self {
        self.decode_delay = delay;
        self
    }
}

impl DecoderFactory for SpyDecoderFactory {
    fn create(&mut self, format: FormatTag, width: u32, height: u32) -> Result<Box<dyn VideoDecoder>> {
        if self.fail_init == Some(format) {
            return Err(ReplayError::codec_init(format.fourcc(), "spy configured to fail"));
        }
        self.log.push(Event::Codec(CodecEvent::Created(format)));
        Ok(Box::new(SpyDecoder {
            format,
            log: self.log.clone(),
            frames_per_payload: self.frames_per_payload,
            fail_marker: self.fail_marker,
            decode_delay: self.decode_delay,
            image: PlanarImage::solid(width, height, 0, 128, 128),
            pending: VecDeque::new(),
        }))
    }
}

pub struct SpyDecoder {
    format: FormatTag,
    log: EventLog,
    frames_per_payload: usize,
    fail_marker: Option<u8>,
    decode_delay: Duration,
    image: PlanarImage,
    pending: VecDeque<u8>,
}

impl VideoDecoder for SpyDecoder {
    fn format(&self) -> FormatTag {
        self.format
    }

    fn send_payload(&mut self, payload: &[u8]) -> Result<()> {
        let first = payload.first().copied().unwrap_or(0);
        self.log.push(Event::Codec(CodecEvent::Submitted {
            format: self.format,
            len: payload.len(),
            first_byte: first,
        }));
        if !self.decode_delay.is_zero() {
            std::thread::sleep(self.decode_delay);
        }

        if self.fail_marker == Some(first) {
            return Err(ReplayError::decode(self.format.fourcc(), "corrupt payload"));
        }
        self.pending.extend((0..self.frames_per_payload).map(|i| first.wrapping_add(i as u8)));
        Ok(())
    }

    fn receive_frame(&mut self) -> Result<Option<RawFrame<'_>>> {
        match self.pending.pop_front() {
            Some(luma) => {
                self.image.fill_luma(luma);
                Ok(Some(self.image.frame()))
            }
            None => Ok(None),
        }
    }
}

impl Drop for SpyDecoder {
    fn drop(&mut self) {
        self.log.push(Event::Codec(CodecEvent::Dropped(self.format)));
    }
}

/// Region wrapper that logs every publish
struct LoggingRegion {
    inner: Box<dyn OutputRegion>,
    log: EventLog,
}

impl OutputRegion for LoggingRegion {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn len(&self) -> usize {
        self.inner.len()
    }

    fn write_frame(&mut self, timestamp: TimeStamp, fill: &mut dyn FnMut(&mut [u8])) -> Result<()> {
        let mut first_pixel = [0u8; 4];
        self.inner.write_frame(timestamp, &mut |pixels| {
            fill(pixels);
            let n = pixels.len().min(4);
            first_pixel[..n].copy_from_slice(&pixels[..n]);
        })?;
        self.log.push(Event::Published { timestamp, first_pixel, at: Instant::now() });
        Ok(())
    }

    fn read_frame(&self, read: &mut dyn FnMut(TimeStamp, &[u8])) -> Result<()> {
        self.inner.read_frame(read)
    }
}

/// Heap allocator that remembers every creation request
#[derive(Clone, Default)]
pub struct CountingAllocator {
    inner: HeapAllocator,
    created: Arc<Mutex<Vec<(String, usize)>>>,
    fail: bool,
    log: Option<EventLog>,
}

impl CountingAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocator whose every creation fails
    pub fn failing() -> Self {
        Self { fail: true, ..Self::default() }
    }

    /// Allocator whose regions log publishes into `log`
    pub fn with_log(log: EventLog) -> Self {
        Self { log: Some(log), ..Self::default() }
    }

    pub fn created(&self) -> Vec<(String, usize)> {
        self.created.lock().unwrap().clone()
    }

    pub fn region(&self, index: usize) -> Option<HeapRegion> {
        self.inner.regions().get(index).cloned()
    }
}

impl RegionAllocator for CountingAllocator {
    fn create(&mut self, name: &str, size: usize) -> Result<Box<dyn OutputRegion>> {
        if self.fail {
            return Err(ReplayError::region_create(name, size, "allocator configured to fail"));
        }
        self.created.lock().unwrap().push((name.to_string(), size));
        let region = self.inner.create(name, size)?;
        Ok(match &self.log {
            Some(log) => Box::new(LoggingRegion { inner: region, log: log.clone() }),
            None => region,
        })
    }
}

/// Builds framed recordings in memory
#[derive(Debug, Default)]
pub struct RecordingBuilder {
    data: Vec<u8>,
}

impl RecordingBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn envelope(mut self, envelope: Envelope) -> Self {
        let encoded = envelope.encode().expect("envelope encodes");
        let framed = frame_envelope(&encoded).expect("envelope fits into a frame");
        self.data.extend_from_slice(&framed);
        self
    }

    pub fn envelopes(self, envelopes: impl IntoIterator<Item = Envelope>) -> Self {
        envelopes.into_iter().fold(self, RecordingBuilder::envelope)
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }

    pub fn write_to(self, path: &Path) -> std::io::Result<()> {
        std::fs::write(path, self.data)
    }
}

/// Non-video envelope
pub fn data_envelope(sender: u32, data_type: i32, micros: i64) -> Envelope {
    Envelope::builder(data_type)
        .sender_stamp(sender)
        .sample_time_stamp(TimeStamp::from_micros(micros))
        .payload(micros.to_le_bytes().to_vec())
        .build()
}

/// 16x8 video envelope whose payload starts with `tag`
pub fn video_envelope(sender: u32, fourcc: &str, tag: u8, micros: i64) -> Envelope {
    video_envelope_sized(sender, fourcc, 16, 8, tag, micros)
}

pub fn video_envelope_sized(
    sender: u32,
    fourcc: &str,
    width: u32,
    height: u32,
    tag: u8,
    micros: i64,
) -> Envelope {
    let reading = ImageReading::new(fourcc, width, height, vec![tag; 8]);
    Envelope::builder(IMAGE_READING_ID)
        .sender_stamp(sender)
        .sample_time_stamp(TimeStamp::from_micros(micros))
        .payload(reading.encode().expect("image reading encodes"))
        .build()
}

/// In-memory source with a fixed delay between envelopes
pub struct VecSource {
    records: VecDeque<Envelope>,
    delay: Duration,
}

impl VecSource {
    pub fn new(records: Vec<Envelope>, delay: Duration) -> Self {
        Self { records: records.into(), delay }
    }
}

#[async_trait::async_trait]
impl RecordSource for VecSource {
    fn has_more_data(&self) -> bool {
        !self.records.is_empty()
    }

    async fn next_record(&mut self) -> Result<Option<Envelope>> {
        Ok(self.records.pop_front())
    }

    fn delay(&self) -> Duration {
        self.delay
    }
}

/// Live session that keeps every forwarded envelope
#[derive(Clone)]
pub struct RecordingSession {
    sent: Arc<Mutex<Vec<Envelope>>>,
    running: Arc<AtomicBool>,
    stop_after: Option<usize>,
    fail: bool,
}

impl Default for RecordingSession {
    fn default() -> Self {
        Self {
            sent: Arc::default(),
            running: Arc::new(AtomicBool::new(true)),
            stop_after: None,
            fail: false,
        }
    }
}

impl RecordingSession {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stop running once `count` envelopes were sent
    pub fn stop_after(mut self, count: usize) -> Self {
        self.stop_after = Some(count);
        self
    }

    /// Reject every envelope
    pub fn failing_sends(mut self) -> Self {
        self.fail = true;
        self
    }

    pub fn sent(&self) -> Vec<Envelope> {
        self.sent.lock().unwrap().clone()
    }
}

impl LiveSession for RecordingSession {
    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn send(&mut self, envelope: Envelope) -> Result<()> {
        if self.fail {
            return Err(ReplayError::session("session configured to fail", None));
        }
        let mut sent = self.sent.lock().unwrap();
        sent.push(envelope);
        if self.stop_after.is_some_and(|limit| sent.len() >= limit) {
            self.running.store(false, Ordering::SeqCst);
        }
        Ok(())
    }
}
