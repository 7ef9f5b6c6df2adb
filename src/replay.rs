//! Pacing loop
//!
//! [`Replayer`] pulls envelopes from a [`RecordSource`], runs them through the
//! [`Pipeline`] and sleeps so that the output follows the recording's
//! original timing. Time spent decoding counts against the sleep:
//!
//! ```text
//! sleep = recommended_delay - processing_time   (never negative)
//! ```
//!
//! Frames are never dropped to catch up; when processing takes longer than
//! the recorded interval the loop simply continues without sleeping.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use tokio_util::sync::CancellationToken;
//! use vpx_replay::codec::CodecAdapter;
//! use vpx_replay::pipeline::{Pipeline, SelectionState};
//! use vpx_replay::publish::{FramePublisher, ShmAllocator};
//! use vpx_replay::recording::Player;
//! use vpx_replay::replay::Replayer;
//! use vpx_replay::session::Od4Session;
//!
//! # async fn run(factory: Box<dyn vpx_replay::codec::DecoderFactory>) -> vpx_replay::Result<()> {
//! let pipeline = Pipeline::new(
//!     SelectionState::default(),
//!     CodecAdapter::new(factory),
//!     FramePublisher::new("video0", Box::new(ShmAllocator)),
//! );
//! let cancel = CancellationToken::new();
//! let replayer = Replayer::new(Player::open("drive.rec")?, Od4Session::open(111)?, pipeline, cancel);
//! let summary = replayer.run().await?;
//! println!("published {} frames", summary.published_frames);
//! # Ok(())
//! # }
//! ```

use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::Result;
use crate::pipeline::{Disposition, Pipeline};
use crate::session::LiveSession;
use crate::source::RecordSource;

/// Why the pacing loop ended
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum StopReason {
    /// Every envelope of the recording was replayed.
    #[default]
    EndOfRecording,
    /// The live session stopped accepting envelopes.
    SessionClosed,
    /// The cancellation token fired.
    Cancelled,
    /// A fatal error ended the replay.
    Failed,
}

/// Counters collected during one replay
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplaySummary {
    pub records: u64,
    pub decoded_payloads: u64,
    pub published_frames: u64,
    pub forwarded: u64,
    pub forward_errors: u64,
    pub ignored: u64,
    pub skipped: u64,
    /// Sum of all sleeps issued by the loop
    pub slept: Duration,
    pub stop_reason: StopReason,
}

/// Drives a pipeline at the recording's pace
pub struct Replayer<S, L> {
    source: S,
    session: L,
    pipeline: Pipeline,
    cancel: CancellationToken,
}

impl<S, L> Replayer<S, L>
where
    S: RecordSource,
    L: LiveSession,
{
    pub fn new(source: S, session: L, pipeline: Pipeline, cancel: CancellationToken) -> Self {
        Self { source, session, pipeline, cancel }
    }

    /// Token that stops the loop when cancelled
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    pub fn session(&self) -> &L {
        &self.session
    }

    /// Replay until the source is exhausted, the session stops or the token
    /// is cancelled.
    ///
    /// Returns the first fatal error, after cancelling the token.
    pub async fn run(mut self) -> Result<ReplaySummary> {
        info!("Replay started");
        let mut summary = ReplaySummary::default();
        let mut failure = None;

        loop {
            if self.cancel.is_cancelled() {
                summary.stop_reason =
                    if failure.is_some() { StopReason::Failed } else { StopReason::Cancelled };
                break;
            }
            if !self.source.has_more_data() {
                summary.stop_reason = StopReason::EndOfRecording;
                break;
            }
            if !self.session.is_running() {
                info!("Live session stopped, ending replay");
                summary.stop_reason = StopReason::SessionClosed;
                break;
            }

            let envelope = match self.source.next_record().await {
                Ok(Some(envelope)) => envelope,
                Ok(None) => continue,
                Err(e) => {
                    error!("Failed to read recording: {}", e);
                    self.cancel.cancel();
                    failure = Some(e);
                    continue;
                }
            };
            summary.records += 1;

            let started = Instant::now();
            let processing = match self.pipeline.handle(envelope) {
                Ok(disposition) => {
                    let decode_path = disposition.is_decode_path();
                    self.account(disposition, &mut summary);
                    if decode_path { started.elapsed() } else { Duration::ZERO }
                }
                Err(e) if e.is_fatal() => {
                    error!("Fatal error, stopping replay: {}", e);
                    for suggestion in e.recovery_suggestions() {
                        debug!("Suggestion: {}", suggestion);
                    }
                    self.cancel.cancel();
                    failure = Some(e);
                    continue;
                }
                Err(e) => {
                    warn!("Skipping envelope: {}", e);
                    summary.skipped += 1;
                    Duration::ZERO
                }
            };

            let delay = self.source.delay();
            let sleep = delay.saturating_sub(processing);
            trace!(
                delay_us = delay.as_micros() as u64,
                processing_us = processing.as_micros() as u64,
                sleep_us = sleep.as_micros() as u64,
                "Pacing"
            );
            if processing > delay && !delay.is_zero() {
                debug!(
                    delay_us = delay.as_micros() as u64,
                    processing_us = processing.as_micros() as u64,
                    "Processing exceeded recorded interval"
                );
            }

            if !sleep.is_zero() {
                summary.slept += sleep;
                tokio::select! {
                    _ = self.cancel.cancelled() => {
                        debug!("Replay cancelled during pacing sleep");
                    }
                    _ = tokio::time::sleep(sleep) => {}
                }
            }
        }

        info!(
            records = summary.records,
            published = summary.published_frames,
            forwarded = summary.forwarded,
            ignored = summary.ignored,
            skipped = summary.skipped,
            reason = ?summary.stop_reason,
            "Replay finished"
        );

        match failure {
            Some(e) => Err(e),
            None => Ok(summary),
        }
    }

    fn account(&mut self, disposition: Disposition, summary: &mut ReplaySummary) {
        match disposition {
            Disposition::Published { frames } => {
                summary.decoded_payloads += 1;
                summary.published_frames += frames as u64;
            }
            Disposition::Forward(envelope) => match self.session.send(envelope) {
                Ok(()) => summary.forwarded += 1,
                Err(e) => {
                    summary.forward_errors += 1;
                    warn!("Failed to forward envelope: {}", e);
                }
            },
            Disposition::Ignored => summary.ignored += 1,
            Disposition::Skipped(reason) => {
                trace!(?reason, "Skipped video envelope");
                summary.skipped += 1;
            }
        }
    }
}
