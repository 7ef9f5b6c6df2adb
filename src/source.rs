//! Record source trait for the pacing loop

use std::time::Duration;

use crate::Result;
use crate::envelope::Envelope;

/// Ordered, delay-annotated supply of recorded envelopes
///
/// Sources yield envelopes in the chronological order of the original
/// recording and report, after each read, how long the original recording
/// waited before the following envelope. The pacing loop owns the source and
/// consumes every envelope exactly once.
#[async_trait::async_trait]
pub trait RecordSource: Send + 'static {
    /// Whether another envelope can be read.
    fn has_more_data(&self) -> bool;

    /// Read the next envelope.
    ///
    /// Returns:
    /// - `Ok(Some(envelope))` - next envelope in replay order
    /// - `Ok(None)` - nothing available for this call (the caller re-checks
    ///   [`has_more_data`](Self::has_more_data))
    /// - `Err(e)` - the underlying recording could not be read
    async fn next_record(&mut self) -> Result<Option<Envelope>>;

    /// Recommended delay between the envelope returned last and the next one.
    fn delay(&self) -> Duration;
}
