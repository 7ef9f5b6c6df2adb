//! In-process output region.
//!
//! [`HeapRegion`] follows the same lock/notify protocol as the shared memory
//! region but lives on the heap, so observers inside the same process (tests,
//! embedding applications) can read frames without touching the OS.

use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::Duration;

use super::{OutputRegion, RegionAllocator, WaitResult};
use crate::envelope::TimeStamp;
use crate::{ReplayError, Result};

struct HeapFrame {
    timestamp: TimeStamp,
    generation: u64,
    pixels: Vec<u8>,
}

struct Shared {
    frame: Mutex<HeapFrame>,
    updated: Condvar,
}

/// Heap-backed region; clones share the same pixel area
#[derive(Clone)]
pub struct HeapRegion {
    name: Arc<str>,
    size: usize,
    shared: Arc<Shared>,
}

impl HeapRegion {
    pub fn new(name: &str, size: usize) -> Self {
        let frame = HeapFrame { timestamp: TimeStamp::default(), generation: 0, pixels: vec![0; size] };
        Self {
            name: Arc::from(name),
            size,
            shared: Arc::new(Shared { frame: Mutex::new(frame), updated: Condvar::new() }),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, HeapFrame>> {
        self.shared
            .frame
            .lock()
            .map_err(|_| ReplayError::region_operation(&*self.name, "lock poisoned region", None))
    }

    /// Number of frames written so far
    pub fn generation(&self) -> Result<u64> {
        Ok(self.lock()?.generation)
    }

    /// Block until a frame newer than `seen_generation` is written or
    /// `timeout` passes.
    pub fn wait_for_frame(&self, seen_generation: u64, timeout: Duration) -> Result<WaitResult> {
        let guard = self.lock()?;
        let (_guard, wait) = self
            .shared
            .updated
            .wait_timeout_while(guard, timeout, |frame| frame.generation == seen_generation)
            .map_err(|_| ReplayError::region_operation(&*self.name, "wait on poisoned region", None))?;

        Ok(if wait.timed_out() { WaitResult::Timeout } else { WaitResult::Signaled })
    }
}

impl OutputRegion for HeapRegion {
    fn name(&self) -> &str {
        &self.name
    }

    fn len(&self) -> usize {
        self.size
    }

    fn write_frame(&mut self, timestamp: TimeStamp, fill: &mut dyn FnMut(&mut [u8])) -> Result<()> {
        {
            let mut frame = self.lock()?;
            frame.timestamp = timestamp;
            frame.generation += 1;
            fill(frame.pixels.as_mut_slice());
        }
        self.shared.updated.notify_all();
        Ok(())
    }

    fn read_frame(&self, read: &mut dyn FnMut(TimeStamp, &[u8])) -> Result<()> {
        let frame = self.lock()?;
        read(frame.timestamp, frame.pixels.as_slice());
        Ok(())
    }
}

/// Allocates [`HeapRegion`]s and keeps a handle to each for observers
#[derive(Clone, Default)]
pub struct HeapAllocator {
    regions: Arc<Mutex<Vec<HeapRegion>>>,
}

impl HeapAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Regions created so far, in creation order
    pub fn regions(&self) -> Vec<HeapRegion> {
        self.regions.lock().map(|regions| regions.clone()).unwrap_or_default()
    }
}

impl RegionAllocator for HeapAllocator {
    fn create(&mut self, name: &str, size: usize) -> Result<Box<dyn OutputRegion>> {
        let region = HeapRegion::new(name, size);
        self.regions
            .lock()
            .map_err(|_| ReplayError::region_create(name, size, "allocator state poisoned"))?
            .push(region.clone());
        Ok(Box::new(region))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn write_then_read() {
        let mut region = HeapRegion::new("video0", 8);
        region.write_frame(TimeStamp::new(3, 4), &mut |pixels| pixels.fill(9)).unwrap();

        let mut seen = None;
        region.read_frame(&mut |ts, pixels| seen = Some((ts, pixels.to_vec()))).unwrap();
        assert_eq!(seen, Some((TimeStamp::new(3, 4), vec![9; 8])));
        assert_eq!(region.generation().unwrap(), 1);
    }

    #[test]
    fn wait_times_out_without_writer() {
        let region = HeapRegion::new("video0", 4);
        let result = region.wait_for_frame(0, Duration::from_millis(10)).unwrap();
        assert_eq!(result, WaitResult::Timeout);
    }

    #[test]
    fn waiters_are_woken_by_writes() {
        let region = HeapRegion::new("video0", 4);
        let observer = region.clone();
        let waiter = thread::spawn(move || observer.wait_for_frame(0, Duration::from_secs(5)));

        let mut writer = region;
        thread::sleep(Duration::from_millis(20));
        writer.write_frame(TimeStamp::new(1, 0), &mut |pixels| pixels.fill(1)).unwrap();

        assert_eq!(waiter.join().unwrap().unwrap(), WaitResult::Signaled);
    }

    #[test]
    fn allocator_tracks_regions() {
        let mut allocator = HeapAllocator::new();
        let region = allocator.create("video0", 16).unwrap();
        assert_eq!(region.len(), 16);
        assert_eq!(region.name(), "video0");
        assert_eq!(allocator.regions().len(), 1);
    }
}
