//! Envelope recording support
//!
//! This module reads framed envelope recordings (`.rec` files) and exposes
//! them through the [`RecordSource`](crate::source::RecordSource) interface
//! used by the pacing loop.

pub mod format;
pub mod player;

pub use player::Player;
