//! # Open Music Player
//!
//! Streams audio from yt-dlp / ffmpeg into a realtime voice session at a
//! fixed 20 ms cadence, absorbing decoder jitter with a bounded frame queue
//! and a self-correcting frame clock.
//!
//! The player only depends on the capability traits in [`transport`]; an
//! in-process [`transport::loopback`] implementation is included.

pub mod audio;
pub mod config;
pub mod error;
pub mod sources;
pub mod transport;

pub use audio::{AudioPlayer, PlaybackError, PlayerEvent, PlayerState, PlayerStats, PlayerStatus};
pub use config::{NoSubscriberBehavior, PlayerConfig};
pub use error::{PlayerError, PlayerResult, TransportError};
pub use sources::{AudioResource, ProbeInfo, Prober, ResourceInput, ResourceOptions};
