//! Frame publishing into a named output region.
//!
//! An output region is a fixed-size pixel area plus a timestamp, guarded by a
//! lock that readers in other processes take too. Every publish is a single
//! critical section:
//!
//! 1. lock the region
//! 2. store the frame's sample timestamp
//! 3. convert the decoded frame into the pixel area
//! 4. unlock
//! 5. wake every waiting reader
//!
//! so a reader holding the lock always sees pixels that belong to the
//! timestamp next to them.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use vpx_replay::publish::{FramePublisher, ShmAllocator};
//!
//! let publisher = FramePublisher::new("video0", Box::new(ShmAllocator));
//! assert!(publisher.dimensions().is_none());
//! // The region is created by the first successful `publish`.
//! ```

pub mod memory;
#[cfg(unix)]
pub mod shm;

pub use memory::{HeapAllocator, HeapRegion};
#[cfg(unix)]
pub use shm::ShmRegion;

use std::time::Duration;
use tracing::{debug, error, info, trace, warn};

use crate::codec::RawFrame;
use crate::convert::{self, BYTES_PER_PIXEL};
use crate::envelope::TimeStamp;
use crate::{ReplayError, Result};

/// Outcome of a bounded wait on a region's update notification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitResult {
    Signaled,
    Timeout,
}

/// Default wait used by observers that poll for frames
pub const DEFAULT_WAIT: Duration = Duration::from_millis(100);

/// Named, lockable pixel area shared with readers
pub trait OutputRegion: Send {
    fn name(&self) -> &str;

    /// Size of the pixel area in bytes
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Lock, store `timestamp`, let `fill` write the pixel area, unlock and
    /// notify all waiters.
    fn write_frame(&mut self, timestamp: TimeStamp, fill: &mut dyn FnMut(&mut [u8])) -> Result<()>;

    /// Read timestamp and pixels under the lock.
    fn read_frame(&self, read: &mut dyn FnMut(TimeStamp, &[u8])) -> Result<()>;
}

/// Creates output regions
pub trait RegionAllocator: Send {
    fn create(&mut self, name: &str, size: usize) -> Result<Box<dyn OutputRegion>>;
}

/// Allocates POSIX shared memory regions
#[derive(Debug, Default, Clone, Copy)]
pub struct ShmAllocator;

impl RegionAllocator for ShmAllocator {
    #[cfg(unix)]
    fn create(&mut self, name: &str, size: usize) -> Result<Box<dyn OutputRegion>> {
        Ok(Box::new(ShmRegion::create(name, size)?))
    }

    #[cfg(not(unix))]
    fn create(&mut self, name: &str, size: usize) -> Result<Box<dyn OutputRegion>> {
        Err(ReplayError::region_create(name, size, "shared memory regions need a unix platform"))
    }
}

/// Receives a consistent copy of each published frame
pub trait PreviewSink: Send {
    fn show(&mut self, timestamp: TimeStamp, width: u32, height: u32, pixels: &[u8]) -> Result<()>;
}

/// Preview that logs frame statistics
#[derive(Debug, Default)]
pub struct LogPreview {
    frames: u64,
}

impl PreviewSink for LogPreview {
    fn show(&mut self, timestamp: TimeStamp, width: u32, height: u32, pixels: &[u8]) -> Result<()> {
        self.frames += 1;
        let pixel_count = (pixels.len() / BYTES_PER_PIXEL).max(1) as u64;
        let mut sums = [0u64; 3];
        for pixel in pixels.chunks_exact(BYTES_PER_PIXEL) {
            sums[0] += pixel[2] as u64;
            sums[1] += pixel[1] as u64;
            sums[2] += pixel[0] as u64;
        }
        debug!(
            frame = self.frames,
            %timestamp,
            width,
            height,
            mean_r = sums[0] / pixel_count,
            mean_g = sums[1] / pixel_count,
            mean_b = sums[2] / pixel_count,
            "Preview"
        );
        Ok(())
    }
}

struct ActiveRegion {
    region: Box<dyn OutputRegion>,
    width: u32,
    height: u32,
}

/// Converts decoded frames into a lazily created output region
pub struct FramePublisher {
    name: String,
    allocator: Box<dyn RegionAllocator>,
    active: Option<ActiveRegion>,
    preview: Option<Box<dyn PreviewSink>>,
    published: u64,
}

impl FramePublisher {
    pub fn new(name: impl Into<String>, allocator: Box<dyn RegionAllocator>) -> Self {
        Self { name: name.into(), allocator, active: None, preview: None, published: 0 }
    }

    /// Attach a preview sink invoked after every publish
    pub fn with_preview(mut self, preview: Box<dyn PreviewSink>) -> Self {
        self.preview = Some(preview);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Frame size the region was created for, once it exists
    pub fn dimensions(&self) -> Option<(u32, u32)> {
        self.active.as_ref().map(|active| (active.width, active.height))
    }

    /// Number of frames published so far
    pub fn published(&self) -> u64 {
        self.published
    }

    /// Publish one decoded frame stamped with `timestamp`.
    pub fn publish(&mut self, frame: &RawFrame<'_>, timestamp: TimeStamp) -> Result<()> {
        let size = convert::packed_len(frame.width, frame.height).ok_or_else(|| {
            ReplayError::frame_geometry(format!(
                "frame {}x{} is too large",
                frame.width, frame.height
            ))
        })?;
        let stride = frame.width as usize * BYTES_PER_PIXEL;
        convert::check_geometry(frame, size, stride)?;

        if self.active.is_none() {
            let region = self.allocator.create(&self.name, size)?;
            info!(
                region = %self.name,
                width = frame.width,
                height = frame.height,
                size,
                "Created output region"
            );
            self.active = Some(ActiveRegion { region, width: frame.width, height: frame.height });
        }
        let Some(active) = self.active.as_mut() else {
            return Err(ReplayError::region_operation(&self.name, "publish without region", None));
        };

        if (active.width, active.height) != (frame.width, frame.height) {
            error!(
                region = %self.name,
                expected_width = active.width,
                expected_height = active.height,
                found_width = frame.width,
                found_height = frame.height,
                "Frame dimensions changed mid-stream"
            );
            return Err(ReplayError::DimensionMismatch {
                expected_width: active.width,
                expected_height: active.height,
                found_width: frame.width,
                found_height: frame.height,
            });
        }

        if active.region.len() < size {
            return Err(ReplayError::region_operation(
                active.region.name(),
                format!("write {} bytes into a {} byte region", size, active.region.len()),
                None,
            ));
        }

        let mut converted = Ok(());
        active.region.write_frame(timestamp, &mut |pixels| {
            converted = convert::i420_to_argb(frame, pixels, stride);
        })?;
        converted?;
        self.published += 1;
        trace!(region = %self.name, %timestamp, frame = self.published, "Published frame");

        if let Some(preview) = self.preview.as_mut() {
            let (width, height) = (active.width, active.height);
            let mut shown = Ok(());
            let read = active.region.read_frame(&mut |stamp, pixels| {
                shown = preview.show(stamp, width, height, &pixels[..size]);
            });
            if let Err(e) = read.and(shown) {
                warn!(region = %self.name, "Preview failed: {}", e);
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{CountingAllocator, PlanarImage};

    struct FailingPreview;

    impl PreviewSink for FailingPreview {
        fn show(&mut self, _: TimeStamp, _: u32, _: u32, _: &[u8]) -> Result<()> {
            Err(ReplayError::frame_geometry("preview window closed"))
        }
    }

    struct CapturePreview(std::sync::Arc<std::sync::Mutex<Vec<TimeStamp>>>);

    impl PreviewSink for CapturePreview {
        fn show(&mut self, timestamp: TimeStamp, _: u32, _: u32, _: &[u8]) -> Result<()> {
            self.0.lock().unwrap().push(timestamp);
            Ok(())
        }
    }

    #[test]
    fn region_is_created_once_with_frame_size() {
        let allocator = CountingAllocator::new();
        let mut publisher = FramePublisher::new("video0", Box::new(allocator.clone()));

        let image = PlanarImage::solid(8, 4, 120, 128, 128);
        for seconds in 0..5 {
            publisher.publish(&image.frame(), TimeStamp::new(seconds, 0)).unwrap();
        }

        assert_eq!(allocator.created(), vec![("video0".to_string(), 8 * 4 * 4)]);
        assert_eq!(publisher.dimensions(), Some((8, 4)));
        assert_eq!(publisher.published(), 5);

        let region = allocator.region(0).unwrap();
        let mut seen = None;
        region
            .read_frame(&mut |ts, pixels| {
                seen = Some((ts, pixels.len(), pixels[0..4].to_vec()));
            })
            .unwrap();
        let (ts, len, first) = seen.unwrap();
        assert_eq!(ts, TimeStamp::new(4, 0));
        assert_eq!(len, 128);
        assert_eq!(first, convert::yuv_to_bgra(120, 128, 128).to_vec());
    }

    #[test]
    fn dimension_change_is_fatal() {
        let allocator = CountingAllocator::new();
        let mut publisher = FramePublisher::new("video0", Box::new(allocator.clone()));

        publisher.publish(&PlanarImage::solid(8, 4, 1, 128, 128).frame(), TimeStamp::default()).unwrap();
        let err = publisher
            .publish(&PlanarImage::solid(16, 4, 1, 128, 128).frame(), TimeStamp::default())
            .unwrap_err();

        assert!(matches!(
            err,
            ReplayError::DimensionMismatch { expected_width: 8, found_width: 16, .. }
        ));
        assert!(err.is_fatal());
        assert_eq!(allocator.created().len(), 1);
    }

    #[test]
    fn invalid_geometry_does_not_create_region() {
        let allocator = CountingAllocator::new();
        let mut publisher = FramePublisher::new("video0", Box::new(allocator.clone()));

        let image = PlanarImage::solid(8, 4, 1, 128, 128);
        let mut frame = image.frame();
        frame.y.data = &frame.y.data[..10];

        let err = publisher.publish(&frame, TimeStamp::default()).unwrap_err();
        assert!(matches!(err, ReplayError::FrameGeometry { .. }));
        assert!(!err.is_fatal());
        assert!(allocator.created().is_empty());
    }

    #[test]
    fn allocation_failure_is_fatal() {
        let allocator = CountingAllocator::failing();
        let mut publisher = FramePublisher::new("video0", Box::new(allocator));

        let err = publisher
            .publish(&PlanarImage::solid(2, 2, 1, 128, 128).frame(), TimeStamp::default())
            .unwrap_err();
        assert!(matches!(err, ReplayError::RegionCreate { .. }));
        assert!(err.is_fatal());
        assert!(publisher.dimensions().is_none());
    }

    #[test]
    fn preview_failures_are_swallowed() {
        let mut publisher = FramePublisher::new("video0", Box::new(CountingAllocator::new()))
            .with_preview(Box::new(FailingPreview));

        publisher.publish(&PlanarImage::solid(2, 2, 1, 128, 128).frame(), TimeStamp::default()).unwrap();
        assert_eq!(publisher.published(), 1);
    }

    #[test]
    fn preview_sees_published_timestamp() {
        let captured = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
        let mut publisher = FramePublisher::new("video0", Box::new(CountingAllocator::new()))
            .with_preview(Box::new(CapturePreview(captured.clone())));

        publisher.publish(&PlanarImage::solid(2, 2, 1, 128, 128).frame(), TimeStamp::new(7, 9)).unwrap();
        assert_eq!(*captured.lock().unwrap(), vec![TimeStamp::new(7, 9)]);
    }

    #[test]
    fn log_preview_accepts_frames() {
        let mut preview = LogPreview::default();
        preview.show(TimeStamp::new(1, 0), 1, 1, &[10, 20, 30, 255]).unwrap();
        assert_eq!(preview.frames, 1);
    }
}
