//! # Audio Module
//!
//! Playback engine: turns an [`AudioResource`](crate::sources::AudioResource)
//! into a steady stream of PCM frames for a realtime voice session.
//!
//! ## Architecture
//!
//! ### [`pipeline`] - Decode Pipeline
//! - Spawns `yt-dlp | ffmpeg` (or ffmpeg alone) as argv command chains
//! - Reassembles the raw s16le output into fixed-size frames
//!
//! ### [`queue`] - Jitter Buffer
//! - Bounded FIFO between the bursty decoder and the steady clock
//! - Carries the "decoder done" flag used to detect the natural end
//!
//! ### [`clock`] - Frame Clock
//! - Monotonic deadline advanced by one frame interval per frame
//! - Damping while the buffer runs low, recovery delay on underruns
//!
//! ### [`player`] - Audio Player
//! - Idle / Buffering / Playing / Paused / AutoPaused state machine
//! - Connection subscriptions and the single published track
//! - State and error [`events`] over channels
//!
//! ## Audio Format
//!
//! - **Sample Rate**: 48kHz
//! - **Bit Depth**: 16-bit signed integers, little endian
//! - **Channels**: Stereo (2 channels)
//! - **Frame**: 20ms = 960 samples per channel = 3840 bytes
//!
//! ## Example Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use open_music_player::audio::AudioPlayer;
//! use open_music_player::config::PlayerConfig;
//! use open_music_player::sources::AudioResource;
//! use open_music_player::transport::loopback::{
//!     LoopbackConnection, LoopbackSourceFactory, LoopbackTrackFactory,
//! };
//!
//! # async fn example() -> anyhow::Result<()> {
//! let player: AudioPlayer = AudioPlayer::new(
//!     PlayerConfig::default(),
//!     Arc::new(LoopbackSourceFactory::default()),
//!     Arc::new(LoopbackTrackFactory),
//! );
//! player.subscribe(Arc::new(LoopbackConnection::ready(1)));
//!
//! // Reproducir un track
//! player.play(Arc::new(AudioResource::from_input("https://youtu.be/dQw4w9WgXcQ")?));
//!
//! // Controlar la reproducción
//! player.pause();
//! player.unpause();
//! player.stop(false);
//! # Ok(())
//! # }
//! ```

pub mod clock;
pub mod events;
pub mod frame;
pub mod pipeline;
pub mod player;
pub mod queue;

pub use events::{PlaybackError, PlayerEvent};
pub use frame::{Frame, FrameFormat};
pub use player::{AudioPlayer, PlayerState, PlayerStats, PlayerStatus};
