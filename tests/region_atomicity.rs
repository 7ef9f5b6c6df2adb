//! Readers racing the publisher never see pixels from a different frame than
//! the timestamp next to them.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use vpx_replay::codec::{Plane, RawFrame};
use vpx_replay::convert::yuv_to_bgra;
use vpx_replay::publish::{FramePublisher, HeapAllocator, HeapRegion, OutputRegion};
use vpx_replay::TimeStamp;

const WIDTH: u32 = 64;
const HEIGHT: u32 = 48;
const FRAMES: i32 = 200;

/// Luma used for the frame stamped with `seconds`
fn luma_for(seconds: i32) -> u8 {
    16 + (seconds % 200) as u8
}

fn check_consistent(timestamp: TimeStamp, pixels: &[u8]) {
    if timestamp == TimeStamp::default() {
        return;
    }
    let expected = yuv_to_bgra(luma_for(timestamp.seconds), 128, 128);
    assert!(
        pixels.chunks_exact(4).all(|p| p == expected),
        "frame stamped {} holds pixels of another frame",
        timestamp
    );
}

fn publish_frames(publisher: &mut FramePublisher) {
    let y_len = (WIDTH * HEIGHT) as usize;
    let chroma = vec![128u8; y_len / 4];
    for seconds in 1..=FRAMES {
        let y = vec![luma_for(seconds); y_len];
        let frame = RawFrame {
            width: WIDTH,
            height: HEIGHT,
            y: Plane::new(&y, WIDTH as usize),
            u: Plane::new(&chroma, WIDTH as usize / 2),
            v: Plane::new(&chroma, WIDTH as usize / 2),
        };
        publisher.publish(&frame, TimeStamp::new(seconds, 0)).unwrap();
    }
}

#[test]
fn heap_region_readers_see_consistent_frames() {
    let allocator = HeapAllocator::new();
    let mut publisher = FramePublisher::new("video0", Box::new(allocator.clone()));

    // Create the region up front so readers can attach
    publish_frames_once(&mut publisher);
    let region: HeapRegion = allocator.regions().remove(0);

    let done = Arc::new(AtomicBool::new(false));
    let readers: Vec<_> = (0..4)
        .map(|_| {
            let region = region.clone();
            let done = done.clone();
            thread::spawn(move || {
                let mut reads = 0u64;
                loop {
                    region.read_frame(&mut |ts, pixels| check_consistent(ts, pixels)).unwrap();
                    reads += 1;
                    if done.load(Ordering::Acquire) {
                        break reads;
                    }
                }
            })
        })
        .collect();

    publish_frames(&mut publisher);
    done.store(true, Ordering::Release);

    for reader in readers {
        assert!(reader.join().unwrap() > 0);
    }
    assert_eq!(region.generation().unwrap(), FRAMES as u64 + 1);
}

fn publish_frames_once(publisher: &mut FramePublisher) {
    let y = vec![luma_for(0); (WIDTH * HEIGHT) as usize];
    let chroma = vec![128u8; y.len() / 4];
    let frame = RawFrame {
        width: WIDTH,
        height: HEIGHT,
        y: Plane::new(&y, WIDTH as usize),
        u: Plane::new(&chroma, WIDTH as usize / 2),
        v: Plane::new(&chroma, WIDTH as usize / 2),
    };
    publisher.publish(&frame, TimeStamp::default()).unwrap();
}

#[test]
fn heap_region_waiters_are_notified() {
    let allocator = HeapAllocator::new();
    let mut publisher = FramePublisher::new("video0", Box::new(allocator.clone()));
    publish_frames_once(&mut publisher);
    let region = allocator.regions().remove(0);

    let observer = region.clone();
    let waiter = thread::spawn(move || observer.wait_for_frame(1, Duration::from_secs(5)).unwrap());
    thread::sleep(Duration::from_millis(20));
    publish_frames(&mut publisher);

    assert_eq!(waiter.join().unwrap(), vpx_replay::publish::WaitResult::Signaled);
}

#[cfg(unix)]
#[test]
fn shared_memory_readers_see_consistent_frames() {
    use vpx_replay::publish::{ShmAllocator, ShmRegion};

    let name = format!("vpx-replay-it-{}", std::process::id());
    let mut publisher = FramePublisher::new(name.clone(), Box::new(ShmAllocator));
    publish_frames_once(&mut publisher);

    let done = Arc::new(AtomicBool::new(false));
    let readers: Vec<_> = (0..3)
        .map(|_| {
            let region = ShmRegion::attach(&name).unwrap();
            assert_eq!(region.len(), (WIDTH * HEIGHT * 4) as usize);
            let done = done.clone();
            thread::spawn(move || {
                let mut reads = 0u64;
                loop {
                    region.read_frame(&mut |ts, pixels| check_consistent(ts, pixels)).unwrap();
                    reads += 1;
                    if done.load(Ordering::Acquire) {
                        break reads;
                    }
                }
            })
        })
        .collect();

    publish_frames(&mut publisher);
    done.store(true, Ordering::Release);

    for reader in readers {
        assert!(reader.join().unwrap() > 0);
    }

    let observer = ShmRegion::attach(&name).unwrap();
    let mut last = None;
    observer.read_frame(&mut |ts, _| last = Some(ts)).unwrap();
    assert_eq!(last, Some(TimeStamp::new(FRAMES, 0)));
}
