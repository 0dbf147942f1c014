//! # Transport capabilities
//!
//! The player never talks to a concrete WebRTC library. It only needs the
//! handful of capabilities below: find out whether a connection has a ready
//! room, publish one outgoing track on it, and push PCM frames into the
//! track's source. Integrations implement these traits; [`loopback`]
//! provides an in-process implementation.

pub mod loopback;

use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;

use crate::audio::frame::Frame;
use crate::error::TransportError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Una conexión de voz a la que el reproductor puede suscribirse.
#[cfg_attr(test, mockall::automock)]
pub trait ConnectionHandle: Send + Sync {
    fn id(&self) -> ConnectionId;

    /// La sala en tiempo real, una vez establecida la sesión.
    fn room(&self) -> Option<Arc<dyn RoomHandle>>;
}

pub trait RoomHandle: Send + Sync {
    fn local_participant(&self) -> Arc<dyn LocalParticipant>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishOptions {
    pub stream: String,
    /// Transmisión discontinua; desactivada para música.
    pub dtx: bool,
}

impl Default for PublishOptions {
    fn default() -> Self {
        Self {
            stream: "music".to_string(),
            dtx: false,
        }
    }
}

#[async_trait]
pub trait LocalParticipant: Send + Sync {
    async fn publish_track(
        &self,
        track: Arc<dyn LocalTrack>,
        options: PublishOptions,
    ) -> Result<(), TransportError>;
}

/// Recibe cada frame a su ritmo; respaldado por la fuente del track publicado.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AudioSink: Send + Sync {
    async fn capture_frame(&self, frame: &Frame) -> Result<(), TransportError>;
}

pub trait LocalTrack: Send + Sync {
    fn name(&self) -> &str;
}

pub trait AudioSourceFactory: Send + Sync {
    fn create_source(&self, sample_rate: u32, channels: u16) -> Arc<dyn AudioSink>;
}

pub trait TrackFactory: Send + Sync {
    fn track_from_source(&self, name: &str, source: Arc<dyn AudioSink>) -> Arc<dyn LocalTrack>;
}
