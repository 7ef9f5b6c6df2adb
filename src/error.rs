//! Error types for the replay pipeline.
//!
//! All fallible operations in this crate return [`ReplayError`]. Errors are
//! classified by [`ReplayError::is_fatal`]: fatal errors stop the pacing loop,
//! everything else is logged and the pipeline moves on to the next record.
//!
//! ## Error Categories
//!
//! - **File Errors**: recording missing or unreadable
//! - **Parse Errors**: malformed container framing or envelope payloads
//! - **Region Errors**: output region creation or synchronization failures
//! - **Codec Errors**: decoder construction or per-payload decode failures
//! - **Session Errors**: forwarding to the live session failed
//!
//! ## Helper Constructors
//!
//! ```rust
//! use vpx_replay::ReplayError;
//! use std::path::PathBuf;
//!
//! let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "no such file");
//! let file_error = ReplayError::file_error(PathBuf::from("/data/drive.rec"), io_err);
//! assert!(!file_error.is_fatal());
//!
//! let region_error = ReplayError::region_create("video0", 640 * 480 * 4, "permission denied");
//! assert!(region_error.is_fatal());
//! ```

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for replay operations.
pub type Result<T, E = ReplayError> = std::result::Result<T, E>;

/// Main error type for replay operations.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum ReplayError {
    #[error("Recording file error: {path}")]
    File {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Parse error in {context}: {details}")]
    Parse { context: String, details: String },

    #[error("Failed to create output region '{name}' ({size} bytes): {reason}")]
    RegionCreate {
        name: String,
        size: usize,
        reason: String,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("Output region '{name}' operation failed: {operation}")]
    Region {
        name: String,
        operation: String,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error(
        "Frame size {found_width}x{found_height} does not match output region {expected_width}x{expected_height}"
    )]
    DimensionMismatch { expected_width: u32, expected_height: u32, found_width: u32, found_height: u32 },

    #[error("Invalid frame geometry: {details}")]
    FrameGeometry { details: String },

    #[error("Failed to initialize {format} decoder: {reason}")]
    CodecInit {
        format: String,
        reason: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("Failed to decode {format} payload: {reason}")]
    Decode {
        format: String,
        reason: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    #[error("Live session error: {reason}")]
    Session {
        reason: String,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("Invalid configuration: {reason}")]
    Config { reason: String },
}

impl ReplayError {
    /// Returns whether this error must stop the replay.
    pub fn is_fatal(&self) -> bool {
        match self {
            ReplayError::RegionCreate { .. } => true,
            ReplayError::CodecInit { .. } => true,
            ReplayError::DimensionMismatch { .. } => true,
            ReplayError::Region { .. } => true,
            ReplayError::File { .. } => false,
            ReplayError::Parse { .. } => false,
            ReplayError::FrameGeometry { .. } => false,
            ReplayError::Decode { .. } => false,
            ReplayError::Session { .. } => false,
            ReplayError::Config { .. } => false,
        }
    }

    /// Returns suggested recovery actions for this error.
    pub fn recovery_suggestions(&self) -> Vec<&'static str> {
        match self {
            ReplayError::File { .. } => vec![
                "Check the recording path exists and is readable",
                "Verify the file is a framed envelope recording",
            ],
            ReplayError::Parse { .. } => {
                vec!["Verify the recording is not truncated", "Check the recorder version"]
            }
            ReplayError::RegionCreate { .. } => vec![
                "Check that /dev/shm is mounted and writable",
                "Choose a different region name",
                "Remove a stale region left by a crashed process",
            ],
            ReplayError::Region { .. } => {
                vec!["Restart the replay", "Check observers do not hold the region lock"]
            }
            ReplayError::DimensionMismatch { .. } => vec![
                "Replay each resolution segment separately",
                "Filter the recording to a single sender with --id",
            ],
            ReplayError::FrameGeometry { .. } => {
                vec!["Check the decoder output format", "Report the offending recording"]
            }
            ReplayError::CodecInit { .. } => vec![
                "Build with the `ffmpeg` feature enabled",
                "Check libavcodec provides VP8/VP9 decoders",
            ],
            ReplayError::Decode { .. } => vec!["Check the recording for corrupted payloads"],
            ReplayError::Session { .. } => {
                vec!["Check the network interface supports multicast", "Verify the session id"]
            }
            ReplayError::Config { .. } => vec!["Run with --help for usage"],
        }
    }

    /// Helper constructor for file errors with path context.
    pub fn file_error(path: PathBuf, source: std::io::Error) -> Self {
        ReplayError::File { path, source }
    }

    /// Helper constructor for parse errors.
    pub fn parse(context: impl Into<String>, details: impl Into<String>) -> Self {
        ReplayError::Parse { context: context.into(), details: details.into() }
    }

    /// Helper constructor for region creation failures.
    pub fn region_create(name: impl Into<String>, size: usize, reason: impl Into<String>) -> Self {
        ReplayError::RegionCreate { name: name.into(), size, reason: reason.into(), source: None }
    }

    /// Helper constructor for region creation failures caused by an OS error.
    pub fn region_create_io(name: impl Into<String>, size: usize, source: std::io::Error) -> Self {
        ReplayError::RegionCreate {
            name: name.into(),
            size,
            reason: source.to_string(),
            source: Some(source),
        }
    }

    /// Helper constructor for lock/notify failures on an existing region.
    pub fn region_operation(
        name: impl Into<String>,
        operation: impl Into<String>,
        source: Option<std::io::Error>,
    ) -> Self {
        ReplayError::Region { name: name.into(), operation: operation.into(), source }
    }

    /// Helper constructor for geometry errors.
    pub fn frame_geometry(details: impl Into<String>) -> Self {
        ReplayError::FrameGeometry { details: details.into() }
    }

    /// Helper constructor for decoder construction failures.
    pub fn codec_init(format: impl Into<String>, reason: impl Into<String>) -> Self {
        ReplayError::CodecInit { format: format.into(), reason: reason.into(), source: None }
    }

    /// Helper constructor for decoder construction failures with source.
    pub fn codec_init_with_source(
        format: impl Into<String>,
        reason: impl Into<String>,
        source: Box<dyn std::error::Error + Send + Sync>,
    ) -> Self {
        ReplayError::CodecInit { format: format.into(), reason: reason.into(), source: Some(source) }
    }

    /// Helper constructor for per-payload decode failures.
    pub fn decode(format: impl Into<String>, reason: impl Into<String>) -> Self {
        ReplayError::Decode { format: format.into(), reason: reason.into(), source: None }
    }

    /// Helper constructor for per-payload decode failures with source.
    pub fn decode_with_source(
        format: impl Into<String>,
        reason: impl Into<String>,
        source: Box<dyn std::error::Error + Send + Sync>,
    ) -> Self {
        ReplayError::Decode { format: format.into(), reason: reason.into(), source: Some(source) }
    }

    /// Helper constructor for live session failures.
    pub fn session(reason: impl Into<String>, source: Option<std::io::Error>) -> Self {
        ReplayError::Session { reason: reason.into(), source }
    }

    /// Helper constructor for configuration errors.
    pub fn config(reason: impl Into<String>) -> Self {
        ReplayError::Config { reason: reason.into() }
    }
}

impl From<std::io::Error> for ReplayError {
    fn from(err: std::io::Error) -> Self {
        ReplayError::File { path: PathBuf::from("<unknown>"), source: err }
    }
}
