//! Routing and the decode-convert-publish pipeline.
//!
//! Every envelope pulled from the recording passes through [`Pipeline::handle`]
//! exactly once. The selector decides what happens to it:
//!
//! | sender         | data type          | route                        |
//! |----------------|--------------------|------------------------------|
//! | other sender   | any                | ignored (or forwarded, see [`ForwardPolicy`]) |
//! | target sender  | `IMAGE_READING_ID` | decoded and published        |
//! | target sender  | anything else      | forwarded to the live session |
//!
//! The target sender is either configured or taken from the first envelope
//! of the recording, whatever its type.

use tracing::{debug, info, trace, warn};

use crate::codec::{CodecAdapter, DecodeOutcome};
use crate::envelope::{Envelope, ImageReading};
use crate::publish::FramePublisher;
use crate::{ReplayError, Result};

/// What happens to envelopes from senders other than the target
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ForwardPolicy {
    /// Only the target sender's non-video envelopes are forwarded.
    #[default]
    TargetOnly,
    /// Non-video envelopes of every sender are forwarded.
    AllSenders,
}

/// Routing decision for one envelope
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Decode,
    Forward,
    Ignore,
}

/// Sender selection, fixed after the first envelope
#[derive(Debug, Clone, Default)]
pub struct SelectionState {
    target: Option<u32>,
}

impl SelectionState {
    pub fn new(target: Option<u32>) -> Self {
        Self { target }
    }

    pub fn target(&self) -> Option<u32> {
        self.target
    }

    /// Route `envelope`, adopting its sender as the target if none is set yet.
    pub fn route(&mut self, envelope: &Envelope, policy: ForwardPolicy) -> Route {
        let target = *self.target.get_or_insert_with(|| {
            info!(sender = envelope.sender_stamp, "Selected sender from first envelope");
            envelope.sender_stamp
        });

        match (envelope.sender_stamp == target, envelope.is_image_reading()) {
            (true, true) => Route::Decode,
            (true, false) => Route::Forward,
            (false, false) if policy == ForwardPolicy::AllSenders => Route::Forward,
            (false, _) => Route::Ignore,
        }
    }
}

/// Why an envelope on the decode path produced nothing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// The payload is not a valid image reading.
    Malformed,
    /// The fourcc is not VP8 or VP9.
    Unsupported,
    /// The decoder rejected the payload.
    DecodeFailed,
}

/// Result of handling one envelope
#[derive(Debug, Clone, PartialEq)]
pub enum Disposition {
    /// Decoded; `frames` frames were published (zero while the decoder buffers).
    Published { frames: usize },
    /// Hand the envelope to the live session.
    Forward(Envelope),
    Ignored,
    Skipped(SkipReason),
}

impl Disposition {
    /// Whether the envelope went through the decoder
    pub fn is_decode_path(&self) -> bool {
        matches!(self, Disposition::Published { .. } | Disposition::Skipped(_))
    }
}

/// Selector, codec adapter and publisher wired together
pub struct Pipeline {
    selection: SelectionState,
    policy: ForwardPolicy,
    codec: CodecAdapter,
    publisher: FramePublisher,
    geometry_skips: u64,
}

impl Pipeline {
    pub fn new(selection: SelectionState, codec: CodecAdapter, publisher: FramePublisher) -> Self {
        Self { selection, policy: ForwardPolicy::default(), codec, publisher, geometry_skips: 0 }
    }

    pub fn with_forward_policy(mut self, policy: ForwardPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn selection(&self) -> &SelectionState {
        &self.selection
    }

    pub fn codec(&self) -> &CodecAdapter {
        &self.codec
    }

    pub fn publisher(&self) -> &FramePublisher {
        &self.publisher
    }

    /// Frames dropped because their geometry was invalid
    pub fn geometry_skips(&self) -> u64 {
        self.geometry_skips
    }

    /// Handle one envelope. Errors returned here are fatal.
    pub fn handle(&mut self, envelope: Envelope) -> Result<Disposition> {
        match self.selection.route(&envelope, self.policy) {
            Route::Ignore => {
                trace!(sender = envelope.sender_stamp, data_type = envelope.data_type, "Ignoring envelope");
                Ok(Disposition::Ignored)
            }
            Route::Forward => Ok(Disposition::Forward(envelope)),
            Route::Decode => self.decode(&envelope),
        }
    }

    fn decode(&mut self, envelope: &Envelope) -> Result<Disposition> {
        let reading = match ImageReading::decode(&envelope.serialized_data) {
            Ok(reading) => reading,
            Err(e) => {
                warn!(sender = envelope.sender_stamp, "Skipping malformed image reading: {}", e);
                return Ok(Disposition::Skipped(SkipReason::Malformed));
            }
        };

        let timestamp = envelope.sample_time_stamp;
        let publisher = &mut self.publisher;
        let geometry_skips = &mut self.geometry_skips;
        let mut published = 0usize;

        let outcome = self.codec.decode(&reading, |frame| {
            match publisher.publish(frame, timestamp) {
                Ok(()) => published += 1,
                Err(ReplayError::FrameGeometry { details }) => {
                    *geometry_skips += 1;
                    warn!(%timestamp, "Skipping frame with invalid geometry: {}", details);
                }
                Err(e) => return Err(e),
            }
            Ok(())
        })?;

        Ok(match outcome {
            DecodeOutcome::Decoded { frames } => {
                debug!(
                    %timestamp,
                    fourcc = %reading.fourcc,
                    bytes = reading.data.len(),
                    frames,
                    published,
                    "Handled video envelope"
                );
                Disposition::Published { frames: published }
            }
            DecodeOutcome::Unsupported => Disposition::Skipped(SkipReason::Unsupported),
            DecodeOutcome::Failed => Disposition::Skipped(SkipReason::DecodeFailed),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::FormatTag;
    use crate::envelope::TimeStamp;
    use crate::test_utils::{
        CountingAllocator, EventLog, SpyDecoderFactory, data_envelope, video_envelope,
    };

    fn pipeline(target: Option<u32>, factory: SpyDecoderFactory) -> (Pipeline, CountingAllocator) {
        let allocator = CountingAllocator::new();
        let pipeline = Pipeline::new(
            SelectionState::new(target),
            CodecAdapter::new(Box::new(factory)),
            FramePublisher::new("video0", Box::new(allocator.clone())),
        );
        (pipeline, allocator)
    }

    #[test]
    fn first_envelope_fixes_the_target() {
        let mut selection = SelectionState::default();
        let policy = ForwardPolicy::TargetOnly;

        assert_eq!(selection.route(&data_envelope(5, 19, 0), policy), Route::Forward);
        assert_eq!(selection.target(), Some(5));
        assert_eq!(selection.route(&video_envelope(7, "VP80", 1, 10), policy), Route::Ignore);
        assert_eq!(selection.route(&data_envelope(7, 19, 20), policy), Route::Ignore);
        assert_eq!(selection.route(&video_envelope(5, "VP80", 1, 30), policy), Route::Decode);
        assert_eq!(selection.target(), Some(5));
    }

    #[test]
    fn video_envelope_can_fix_the_target() {
        let mut selection = SelectionState::default();
        let policy = ForwardPolicy::TargetOnly;

        assert_eq!(selection.route(&video_envelope(7, "VP90", 1, 0), policy), Route::Decode);
        assert_eq!(selection.route(&data_envelope(5, 19, 1), policy), Route::Ignore);
    }

    #[test]
    fn configured_target_wins() {
        let mut selection = SelectionState::new(Some(7));
        let policy = ForwardPolicy::TargetOnly;

        assert_eq!(selection.route(&video_envelope(5, "VP80", 1, 0), policy), Route::Ignore);
        assert_eq!(selection.route(&video_envelope(7, "VP80", 1, 1), policy), Route::Decode);
    }

    #[test]
    fn all_senders_policy_forwards_foreign_data_but_not_video() {
        let mut selection = SelectionState::new(Some(5));
        let policy = ForwardPolicy::AllSenders;

        assert_eq!(selection.route(&data_envelope(7, 19, 0), policy), Route::Forward);
        assert_eq!(selection.route(&video_envelope(7, "VP80", 1, 1), policy), Route::Ignore);
    }

    #[test]
    fn decoded_frames_share_the_envelope_timestamp() {
        let log = EventLog::default();
        let allocator = CountingAllocator::with_log(log.clone());
        let mut pipeline = Pipeline::new(
            SelectionState::new(Some(1)),
            CodecAdapter::new(Box::new(SpyDecoderFactory::new(log.clone()).frames_per_payload(3))),
            FramePublisher::new("video0", Box::new(allocator)),
        );

        let envelope = video_envelope(1, "VP90", 10, 1_500_000);
        assert_eq!(pipeline.handle(envelope).unwrap(), Disposition::Published { frames: 3 });

        let stamps = log.published_timestamps();
        assert_eq!(stamps, vec![TimeStamp::new(1, 500_000); 3]);
    }

    #[test]
    fn forwarded_envelopes_are_returned_unchanged() {
        let (mut pipeline, allocator) = pipeline(None, SpyDecoderFactory::new(EventLog::default()));
        let envelope = data_envelope(3, 19, 42);

        assert_eq!(pipeline.handle(envelope.clone()).unwrap(), Disposition::Forward(envelope));
        assert!(allocator.created().is_empty());
    }

    #[test]
    fn malformed_and_unsupported_payloads_are_skipped() {
        let (mut pipeline, _) = pipeline(Some(1), SpyDecoderFactory::new(EventLog::default()));

        let garbage = Envelope::builder(crate::envelope::IMAGE_READING_ID)
            .sender_stamp(1)
            .payload(vec![0xFF, 0xFF, 0xFF])
            .build();
        assert_eq!(pipeline.handle(garbage).unwrap(), Disposition::Skipped(SkipReason::Malformed));

        let h264 = video_envelope(1, "h264", 1, 0);
        assert_eq!(pipeline.handle(h264).unwrap(), Disposition::Skipped(SkipReason::Unsupported));
        assert_eq!(pipeline.codec().session().format(), None);
    }

    #[test]
    fn decode_failure_continues_with_next_payload() {
        let factory = SpyDecoderFactory::new(EventLog::default()).fail_payloads_starting_with(0xEE);
        let (mut pipeline, _) = pipeline(Some(1), factory);

        let bad = video_envelope(1, "VP80", 0xEE, 0);
        let good = video_envelope(1, "VP80", 0x20, 1);
        assert_eq!(pipeline.handle(bad).unwrap(), Disposition::Skipped(SkipReason::DecodeFailed));
        assert_eq!(pipeline.handle(good).unwrap(), Disposition::Published { frames: 1 });
    }

    #[test]
    fn codec_init_failure_is_fatal() {
        let factory = SpyDecoderFactory::new(EventLog::default()).fail_init_for(FormatTag::Vp8);
        let (mut pipeline, allocator) = pipeline(Some(1), factory);

        let err = pipeline.handle(video_envelope(1, "VP80", 1, 0)).unwrap_err();
        assert!(err.is_fatal());
        assert!(allocator.created().is_empty());
    }

    #[test]
    fn dimension_change_is_fatal() {
        let (mut pipeline, _) = pipeline(Some(1), SpyDecoderFactory::new(EventLog::default()));

        pipeline.handle(video_envelope(1, "VP80", 1, 0)).unwrap();
        let resized = crate::test_utils::video_envelope_sized(1, "VP90", 32, 16, 2, 1);
        let err = pipeline.handle(resized).unwrap_err();
        assert!(matches!(err, ReplayError::DimensionMismatch { .. }));
    }

    #[test]
    fn decode_path_classification() {
        assert!(Disposition::Published { frames: 0 }.is_decode_path());
        assert!(Disposition::Skipped(SkipReason::DecodeFailed).is_decode_path());
        assert!(Disposition::Skipped(SkipReason::Unsupported).is_decode_path());
        assert!(!Disposition::Forward(data_envelope(1, 19, 0)).is_decode_path());
        assert!(!Disposition::Ignored.is_decode_path());
    }
}
