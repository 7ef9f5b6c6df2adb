//! Replay recorded envelope streams into a shared memory video region.
//!
//! `vpx-replay` reads a recording of timestamped envelopes, decodes the VP8
//! and VP9 frames of one sender, converts them to packed 32-bit pixels and
//! publishes every frame into a named memory region that other processes
//! observe. All other envelopes of that sender are forwarded to a live
//! session, and the whole replay follows the recording's original timing.
//!
//! # Architecture
//!
//! ```text
//! RecordSource ──> Pipeline::handle ──┬─> CodecAdapter ─> convert ─> FramePublisher ─> OutputRegion
//!      ^                              ├─> LiveSession (forwarded envelopes)
//!      │                              └─> ignored
//!   Replayer (pacing, cancellation)
//! ```
//!
//! - [`recording`]: `.rec` container reader implementing [`RecordSource`]
//! - [`envelope`]: envelope and image reading wire format
//! - [`codec`]: decoder lifecycle across format changes
//! - [`convert`]: I420 to packed pixel conversion
//! - [`publish`]: output regions and the lock/notify publish protocol
//! - [`pipeline`]: sender selection and per-envelope routing
//! - [`replay`]: the pacing loop
//! - [`session`]: live session for forwarded envelopes
//!
//! ## Example
//!
//! ```rust,no_run
//! use tokio_util::sync::CancellationToken;
//! use vpx_replay::codec::{CodecAdapter, UnavailableDecoderFactory};
//! use vpx_replay::pipeline::{Pipeline, SelectionState};
//! use vpx_replay::publish::{FramePublisher, HeapAllocator};
//! use vpx_replay::recording::Player;
//! use vpx_replay::replay::Replayer;
//! use vpx_replay::session::Od4Session;
//!
//! #[tokio::main]
//! async fn main() -> vpx_replay::Result<()> {
//!     let allocator = HeapAllocator::new();
//!     let pipeline = Pipeline::new(
//!         SelectionState::new(Some(0)),
//!         CodecAdapter::new(Box::new(UnavailableDecoderFactory)),
//!         FramePublisher::new("video0", Box::new(allocator.clone())),
//!     );
//!
//!     let replayer = Replayer::new(
//!         Player::open("drive.rec")?,
//!         Od4Session::open(111)?,
//!         pipeline,
//!         CancellationToken::new(),
//!     );
//!     let summary = replayer.run().await?;
//!     println!("{} frames in {} regions", summary.published_frames, allocator.regions().len());
//!     Ok(())
//! }
//! ```

// Core types and error handling
mod error;
#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub mod envelope;
pub mod recording;
pub mod source;

// Decode path
pub mod codec;
pub mod convert;
pub mod publish;

// Orchestration
pub mod config;
pub mod pipeline;
pub mod replay;
pub mod session;

pub use error::*;

pub use envelope::{Envelope, ImageReading, TimeStamp};
pub use recording::Player;
pub use replay::{ReplaySummary, Replayer, StopReason};
pub use source::RecordSource;
