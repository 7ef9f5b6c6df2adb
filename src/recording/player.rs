//! Indexed player for envelope recordings
//!
//! The player scans the recording once at open time and keeps a small index
//! entry per envelope (file offset, length, sample timestamp). Envelopes are
//! replayed in sample-timestamp order and only read from disk when requested,
//! so memory use does not grow with the size of the recorded video.
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use vpx_replay::recording::Player;
//!
//! fn dump() -> vpx_replay::Result<()> {
//!     let mut player = Player::open("drive.rec")?;
//!     println!("{} envelopes, {:?}", player.total_records(), player.duration());
//!
//!     while let Some(envelope) = player.read_next()? {
//!         println!("type {} from {} (+{:?})", envelope.data_type, envelope.sender_stamp, player.delay());
//!     }
//!     Ok(())
//! }
//! ```
//!
//! Replay never rewinds: once the last envelope has been read the player
//! reports no more data.

use std::fs::File;
use std::io::{BufReader, Cursor, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, trace, warn};

use super::format::{FRAME_HEADER_SIZE, read_frame_header};
use crate::envelope::{Envelope, TimeStamp};
use crate::source::RecordSource;
use crate::{ReplayError, Result};

/// Location and ordering key of one recorded envelope
#[derive(Debug, Clone, Copy)]
struct IndexEntry {
    sample_time_stamp: TimeStamp,
    offset: u64,
    len: usize,
}

/// Replays envelopes from a framed recording
pub struct Player<R> {
    reader: R,
    path: PathBuf,
    index: Vec<IndexEntry>,
    position: usize,
    delay: Duration,
}

impl Player<BufReader<File>> {
    /// Open and index a recording file.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|e| ReplayError::file_error(path.to_path_buf(), e))?;
        Self::with_path(BufReader::new(file), path.to_path_buf())
    }
}

impl Player<Cursor<Vec<u8>>> {
    /// Index an in-memory recording (for testing)
    pub fn from_bytes(data: Vec<u8>) -> Result<Self> {
        Self::with_path(Cursor::new(data), PathBuf::from("<memory>"))
    }
}

impl<R: Read + Seek> Player<R> {
    fn with_path(mut reader: R, path: PathBuf) -> Result<Self> {
        let index = Self::build_index(&mut reader, &path)?;

        if let (Some(first), Some(last)) = (index.first(), index.last()) {
            info!(
                path = %path.display(),
                records = index.len(),
                duration_ms = last.sample_time_stamp.saturating_since(first.sample_time_stamp).as_millis() as u64,
                "Indexed recording"
            );
        } else {
            warn!(path = %path.display(), "Recording contains no envelopes");
        }

        Ok(Self { reader, path, index, position: 0, delay: Duration::ZERO })
    }

    /// Scan the whole recording once. A damaged tail ends the index with a
    /// warning instead of failing the replay.
    fn build_index(reader: &mut R, path: &Path) -> Result<Vec<IndexEntry>> {
        let mut index = Vec::new();
        let mut offset = 0u64;
        let mut payload = Vec::new();

        loop {
            let len = match read_frame_header(reader) {
                Ok(Some(len)) => len,
                Ok(None) => break,
                Err(e) => {
                    warn!(path = %path.display(), offset, "Stopping index at damaged frame: {}", e);
                    break;
                }
            };

            payload.resize(len, 0);
            if let Err(e) = reader.read_exact(&mut payload) {
                warn!(
                    path = %path.display(),
                    offset,
                    len,
                    "Recording ends inside an envelope: {}", e
                );
                break;
            }

            let payload_offset = offset + FRAME_HEADER_SIZE as u64;
            match Envelope::decode(&payload) {
                Ok(envelope) => {
                    trace!(
                        offset,
                        len,
                        data_type = envelope.data_type,
                        sender = envelope.sender_stamp,
                        "Indexed envelope"
                    );
                    index.push(IndexEntry {
                        sample_time_stamp: envelope.sample_time_stamp,
                        offset: payload_offset,
                        len,
                    });
                }
                Err(e) => {
                    warn!(path = %path.display(), offset, "Skipping undecodable envelope: {}", e);
                }
            }

            offset = payload_offset + len as u64;
        }

        // Stable sort keeps recording order for identical sample timestamps
        index.sort_by_key(|entry| entry.sample_time_stamp);
        Ok(index)
    }

    /// Read the next envelope in replay order and update [`delay`](Self::delay).
    pub fn read_next(&mut self) -> Result<Option<Envelope>> {
        let Some(entry) = self.index.get(self.position).copied() else {
            debug!("Reached end of recording");
            return Ok(None);
        };

        self.reader
            .seek(SeekFrom::Start(entry.offset))
            .map_err(|e| ReplayError::file_error(self.path.clone(), e))?;
        let mut payload = vec![0u8; entry.len];
        self.reader
            .read_exact(&mut payload)
            .map_err(|e| ReplayError::file_error(self.path.clone(), e))?;
        let envelope = Envelope::decode(&payload)?;

        self.position += 1;
        self.delay = self
            .index
            .get(self.position)
            .map(|next| next.sample_time_stamp.saturating_since(entry.sample_time_stamp))
            .unwrap_or(Duration::ZERO);

        Ok(Some(envelope))
    }

    /// Delay between the envelope read last and the next one.
    pub fn delay(&self) -> Duration {
        self.delay
    }

    pub fn has_more_data(&self) -> bool {
        self.position < self.index.len()
    }

    /// Number of envelopes in the recording
    pub fn total_records(&self) -> usize {
        self.index.len()
    }

    /// Number of envelopes already replayed
    pub fn current_record(&self) -> usize {
        self.position
    }

    /// Time span between the first and last sample timestamp
    pub fn duration(&self) -> Duration {
        match (self.index.first(), self.index.last()) {
            (Some(first), Some(last)) => {
                last.sample_time_stamp.saturating_since(first.sample_time_stamp)
            }
            _ => Duration::ZERO,
        }
    }
}

#[async_trait::async_trait]
impl<R> RecordSource for Player<R>
where
    R: Read + Seek + Send + 'static,
{
    fn has_more_data(&self) -> bool {
        Player::has_more_data(self)
    }

    async fn next_record(&mut self) -> Result<Option<Envelope>> {
        self.read_next()
    }

    fn delay(&self) -> Duration {
        Player::delay(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::recording::format::frame_envelope;
    use crate::test_utils::RecordingBuilder;

    fn envelope_at(sender: u32, micros: i64) -> Envelope {
        Envelope::builder(19)
            .sender_stamp(sender)
            .sample_time_stamp(TimeStamp::from_micros(micros))
            .payload(vec![sender as u8])
            .build()
    }

    #[test]
    fn replays_in_sample_time_order_with_delays() {
        let data = RecordingBuilder::new()
            .envelope(envelope_at(1, 1_000_000))
            .envelope(envelope_at(3, 1_100_000))
            .envelope(envelope_at(2, 1_040_000))
            .into_bytes();

        let mut player = Player::from_bytes(data).unwrap();
        assert_eq!(player.total_records(), 3);
        assert_eq!(player.duration(), Duration::from_millis(100));

        let first = player.read_next().unwrap().unwrap();
        assert_eq!(first.sender_stamp, 1);
        assert_eq!(player.delay(), Duration::from_millis(40));

        let second = player.read_next().unwrap().unwrap();
        assert_eq!(second.sender_stamp, 2);
        assert_eq!(player.delay(), Duration::from_millis(60));

        let third = player.read_next().unwrap().unwrap();
        assert_eq!(third.sender_stamp, 3);
        assert_eq!(player.delay(), Duration::ZERO);

        assert!(!player.has_more_data());
        assert!(player.read_next().unwrap().is_none());
    }

    #[test]
    fn equal_timestamps_keep_recording_order() {
        let data = RecordingBuilder::new()
            .envelope(envelope_at(9, 500))
            .envelope(envelope_at(8, 500))
            .into_bytes();

        let mut player = Player::from_bytes(data).unwrap();
        assert_eq!(player.read_next().unwrap().unwrap().sender_stamp, 9);
        assert_eq!(player.read_next().unwrap().unwrap().sender_stamp, 8);
    }

    #[test]
    fn truncated_tail_is_ignored() {
        let mut data = RecordingBuilder::new()
            .envelope(envelope_at(1, 0))
            .envelope(envelope_at(2, 10))
            .into_bytes();
        let mut tail = frame_envelope(&envelope_at(3, 20).encode().unwrap()).unwrap();
        tail.truncate(tail.len() - 1);
        data.extend_from_slice(&tail);

        let player = Player::from_bytes(data).unwrap();
        assert_eq!(player.total_records(), 2);
    }

    #[test]
    fn empty_recording_has_no_data() {
        let player = Player::from_bytes(Vec::new()).unwrap();
        assert!(!player.has_more_data());
        assert_eq!(player.duration(), Duration::ZERO);
    }

    #[test]
    fn missing_file_reports_path() {
        let err = Player::open("/nonexistent/drive.rec").err().expect("open should fail");
        match err {
            ReplayError::File { path, .. } => assert_eq!(path, PathBuf::from("/nonexistent/drive.rec")),
            other => panic!("Expected File error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn record_source_contract() {
        let data = RecordingBuilder::new()
            .envelope(envelope_at(1, 0))
            .envelope(envelope_at(1, 33_000))
            .into_bytes();
        let mut source: Box<dyn RecordSource> = Box::new(Player::from_bytes(data).unwrap());

        assert!(source.has_more_data());
        source.next_record().await.unwrap().unwrap();
        assert_eq!(source.delay(), Duration::from_millis(33));
        source.next_record().await.unwrap().unwrap();
        assert!(!source.has_more_data());
    }
}
