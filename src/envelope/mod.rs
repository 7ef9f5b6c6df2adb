//! Envelope and payload types.
//!
//! An [`Envelope`] is the unit of a recording: a typed, sender-tagged,
//! timestamped container whose `serialized_data` holds one encoded message.
//! Video envelopes carry an [`ImageReading`] with a fourcc, the frame size and
//! the compressed bytes.
//!
//! ## Usage Example
//!
//! ```rust
//! use bytes::Bytes;
//! use vpx_replay::envelope::{Envelope, ImageReading, TimeStamp, IMAGE_READING_ID};
//!
//! let reading = ImageReading::new("VP80", 640, 480, Bytes::from_static(&[0x9d, 0x01, 0x2a]));
//! let envelope = Envelope::builder(IMAGE_READING_ID)
//!     .sender_stamp(7)
//!     .sample_time_stamp(TimeStamp::from_micros(1_500_000))
//!     .payload(reading.encode().unwrap())
//!     .build();
//!
//! let decoded = Envelope::decode(&envelope.encode().unwrap()).unwrap();
//! assert_eq!(decoded.sender_stamp, 7);
//! assert_eq!(ImageReading::decode(&decoded.serialized_data).unwrap().width, 640);
//! ```

pub mod wire;

use bytes::Bytes;
use std::fmt;
use std::time::Duration;

use crate::Result;
use wire::{WIRE_LENGTH_DELIMITED, WIRE_VARINT, decode_message, encode_message, tag};

/// Data type identifier of video frame envelopes.
pub const IMAGE_READING_ID: i32 = 1055;

/// Wall-clock timestamp with microsecond resolution.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TimeStamp {
    pub seconds: i32,
    pub microseconds: i32,
}

impl TimeStamp {
    pub fn new(seconds: i32, microseconds: i32) -> Self {
        Self { seconds, microseconds }
    }

    /// Build a timestamp from microseconds since the epoch.
    pub fn from_micros(micros: i64) -> Self {
        Self {
            seconds: micros.div_euclid(1_000_000) as i32,
            microseconds: micros.rem_euclid(1_000_000) as i32,
        }
    }

    pub fn as_micros(&self) -> i64 {
        self.seconds as i64 * 1_000_000 + self.microseconds as i64
    }

    /// Current wall-clock time.
    pub fn now() -> Self {
        let since_epoch =
            std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).unwrap_or_default();
        Self::from_micros(since_epoch.as_micros() as i64)
    }

    /// Non-negative distance from `earlier` to `self`.
    pub fn saturating_since(&self, earlier: TimeStamp) -> Duration {
        let delta = self.as_micros() - earlier.as_micros();
        Duration::from_micros(delta.max(0) as u64)
    }

    fn encode(&self) -> Result<Vec<u8>> {
        encode_message("TimeStamp", |os| {
            os.write_sint32(1, self.seconds)?;
            os.write_sint32(2, self.microseconds)
        })
    }

    fn decode(data: &[u8]) -> Result<Self> {
        let mut ts = TimeStamp::default();
        decode_message(data, "TimeStamp", |field, is| {
            match field {
                f if f == tag(1, WIRE_VARINT) => ts.seconds = is.read_sint32()?,
                f if f == tag(2, WIRE_VARINT) => ts.microseconds = is.read_sint32()?,
                _ => return Ok(false),
            }
            Ok(true)
        })?;
        Ok(ts)
    }
}

impl fmt::Display for TimeStamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:06}", self.seconds, self.microseconds)
    }
}

/// One recorded record.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Envelope {
    pub data_type: i32,
    pub serialized_data: Bytes,
    pub sent: TimeStamp,
    pub received: TimeStamp,
    pub sample_time_stamp: TimeStamp,
    pub sender_stamp: u32,
}

impl Envelope {
    pub fn builder(data_type: i32) -> EnvelopeBuilder {
        EnvelopeBuilder { envelope: Envelope { data_type, ..Default::default() } }
    }

    /// Whether this envelope carries an [`ImageReading`].
    pub fn is_image_reading(&self) -> bool {
        self.data_type == IMAGE_READING_ID
    }

    /// Encode to the wire message (without container framing).
    pub fn encode(&self) -> Result<Vec<u8>> {
        let sent = self.sent.encode()?;
        let received = self.received.encode()?;
        let sample_time_stamp = self.sample_time_stamp.encode()?;
        encode_message("Envelope", |os| {
            os.write_sint32(1, self.data_type)?;
            os.write_bytes(2, &self.serialized_data)?;
            os.write_bytes(3, &sent)?;
            os.write_bytes(4, &received)?;
            os.write_bytes(5, &sample_time_stamp)?;
            os.write_uint32(6, self.sender_stamp)
        })
    }

    /// Decode a wire message. The payload is copied once into a shared buffer.
    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut envelope = Envelope::default();
        let mut stamps: [Option<Vec<u8>>; 3] = Default::default();
        decode_message(data, "Envelope", |field, is| {
            match field {
                f if f == tag(1, WIRE_VARINT) => envelope.data_type = is.read_sint32()?,
                f if f == tag(2, WIRE_LENGTH_DELIMITED) => {
                    envelope.serialized_data = Bytes::from(is.read_bytes()?)
                }
                f if f == tag(3, WIRE_LENGTH_DELIMITED) => stamps[0] = Some(is.read_bytes()?),
                f if f == tag(4, WIRE_LENGTH_DELIMITED) => stamps[1] = Some(is.read_bytes()?),
                f if f == tag(5, WIRE_LENGTH_DELIMITED) => stamps[2] = Some(is.read_bytes()?),
                f if f == tag(6, WIRE_VARINT) => envelope.sender_stamp = is.read_uint32()?,
                _ => return Ok(false),
            }
            Ok(true)
        })?;

        let [sent, received, sample] = stamps;
        if let Some(raw) = sent {
            envelope.sent = TimeStamp::decode(&raw)?;
        }
        if let Some(raw) = received {
            envelope.received = TimeStamp::decode(&raw)?;
        }
        if let Some(raw) = sample {
            envelope.sample_time_stamp = TimeStamp::decode(&raw)?;
        }
        Ok(envelope)
    }
}

/// Builder for [`Envelope`], mostly used by tests and tools.
pub struct EnvelopeBuilder {
    envelope: Envelope,
}

impl EnvelopeBuilder {
    pub fn sender_stamp(mut self, sender_stamp: u32) -> Self {
        self.envelope.sender_stamp = sender_stamp;
        self
    }

    pub fn sample_time_stamp(mut self, ts: TimeStamp) -> Self {
        self.envelope.sample_time_stamp = ts;
        self
    }

    pub fn sent(mut self, ts: TimeStamp) -> Self {
        self.envelope.sent = ts;
        self
    }

    pub fn received(mut self, ts: TimeStamp) -> Self {
        self.envelope.received = ts;
        self
    }

    pub fn payload(mut self, payload: impl Into<Bytes>) -> Self {
        self.envelope.serialized_data = payload.into();
        self
    }

    pub fn build(self) -> Envelope {
        self.envelope
    }
}

/// Compressed video frame carried by an `IMAGE_READING_ID` envelope.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ImageReading {
    pub fourcc: String,
    pub width: u32,
    pub height: u32,
    pub data: Bytes,
}

impl ImageReading {
    pub fn new(fourcc: impl Into<String>, width: u32, height: u32, data: impl Into<Bytes>) -> Self {
        Self { fourcc: fourcc.into(), width, height, data: data.into() }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        encode_message("ImageReading", |os| {
            os.write_string(1, &self.fourcc)?;
            os.write_uint32(2, self.width)?;
            os.write_uint32(3, self.height)?;
            os.write_bytes(4, &self.data)
        })
    }

    /// Decode from an envelope payload.
    pub fn decode(payload: &[u8]) -> Result<Self> {
        let mut reading = ImageReading::default();
        decode_message(payload, "ImageReading", |field, is| {
            match field {
                f if f == tag(1, WIRE_LENGTH_DELIMITED) => reading.fourcc = is.read_string()?,
                f if f == tag(2, WIRE_VARINT) => reading.width = is.read_uint32()?,
                f if f == tag(3, WIRE_VARINT) => reading.height = is.read_uint32()?,
                f if f == tag(4, WIRE_LENGTH_DELIMITED) => reading.data = Bytes::from(is.read_bytes()?),
                _ => return Ok(false),
            }
            Ok(true)
        })?;
        Ok(reading)
    }
}
