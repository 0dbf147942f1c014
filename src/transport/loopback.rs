//! In-process transport: rooms that accept any track and sinks that count
//! what they receive. Used by the command-line player and by tests.

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;

use super::{
    AudioSink, AudioSourceFactory, ConnectionHandle, ConnectionId, LocalParticipant, LocalTrack,
    PublishOptions, RoomHandle, TrackFactory,
};
use crate::audio::frame::Frame;
use crate::error::TransportError;

pub struct LoopbackConnection {
    id: ConnectionId,
    room: RwLock<Option<Arc<LoopbackRoom>>>,
}

impl LoopbackConnection {
    /// Conexión cuya sala aún no está establecida.
    pub fn pending(id: u64) -> Self {
        Self {
            id: ConnectionId(id),
            room: RwLock::new(None),
        }
    }

    pub fn ready(id: u64) -> Self {
        let connection = Self::pending(id);
        connection.establish();
        connection
    }

    /// Crea la sala (si hace falta) y la retorna.
    pub fn establish(&self) -> Arc<LoopbackRoom> {
        self.room
            .write()
            .get_or_insert_with(|| Arc::new(LoopbackRoom::default()))
            .clone()
    }

    pub fn disconnect(&self) {
        self.room.write().take();
    }

    pub fn loopback_room(&self) -> Option<Arc<LoopbackRoom>> {
        self.room.read().clone()
    }
}

impl ConnectionHandle for LoopbackConnection {
    fn id(&self) -> ConnectionId {
        self.id
    }

    fn room(&self) -> Option<Arc<dyn RoomHandle>> {
        self.room
            .read()
            .clone()
            .map(|room| room as Arc<dyn RoomHandle>)
    }
}

#[derive(Default)]
pub struct LoopbackRoom {
    participant: Arc<LoopbackParticipant>,
}

impl LoopbackRoom {
    pub fn participant(&self) -> &LoopbackParticipant {
        &self.participant
    }
}

impl RoomHandle for LoopbackRoom {
    fn local_participant(&self) -> Arc<dyn LocalParticipant> {
        self.participant.clone()
    }
}

#[derive(Default)]
pub struct LoopbackParticipant {
    published: Mutex<Vec<(String, PublishOptions)>>,
}

impl LoopbackParticipant {
    pub fn published(&self) -> Vec<(String, PublishOptions)> {
        self.published.lock().clone()
    }
}

#[async_trait]
impl LocalParticipant for LoopbackParticipant {
    async fn publish_track(
        &self,
        track: Arc<dyn LocalTrack>,
        options: PublishOptions,
    ) -> Result<(), TransportError> {
        debug!("📡 Track publicado en loopback: {}", track.name());
        self.published.lock().push((track.name().to_string(), options));
        Ok(())
    }
}

/// Cuenta los frames capturados y guarda la muestra más fuerte.
#[derive(Debug)]
pub struct LoopbackSink {
    sample_rate: u32,
    channels: u16,
    frames: AtomicU64,
    failures: AtomicU64,
    peak: AtomicU64,
    failing: AtomicBool,
}

impl LoopbackSink {
    /// Sink que solo acepta frames con este formato.
    pub fn new(sample_rate: u32, channels: u16) -> Self {
        Self {
            sample_rate,
            channels,
            frames: AtomicU64::new(0),
            failures: AtomicU64::new(0),
            peak: AtomicU64::new(0),
            failing: AtomicBool::new(false),
        }
    }

    pub fn frames_captured(&self) -> u64 {
        self.frames.load(Ordering::Relaxed)
    }

    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    pub fn peak(&self) -> i16 {
        self.peak.load(Ordering::Relaxed) as i16
    }

    /// Hace fallar cada captura siguiente hasta desactivarlo.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::Relaxed);
    }
}

#[async_trait]
impl AudioSink for LoopbackSink {
    async fn capture_frame(&self, frame: &Frame) -> Result<(), TransportError> {
        if self.failing.load(Ordering::Relaxed) {
            self.failures.fetch_add(1, Ordering::Relaxed);
            return Err(TransportError::new("loopback sink rejected frame"));
        }
        if frame.sample_rate() != self.sample_rate || frame.channels() != self.channels {
            self.failures.fetch_add(1, Ordering::Relaxed);
            return Err(TransportError::new(format!(
                "frame is {} Hz/{} ch, source expects {} Hz/{} ch",
                frame.sample_rate(),
                frame.channels(),
                self.sample_rate,
                self.channels
            )));
        }
        let loudest = frame
            .samples()
            .iter()
            .map(|s| s.unsigned_abs())
            .max()
            .unwrap_or(0)
            .min(i16::MAX as u16);
        self.peak.fetch_max(loudest as u64, Ordering::Relaxed);
        self.frames.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

/// Entrega [`LoopbackSink`]s y los recuerda para inspeccionarlos.
#[derive(Default)]
pub struct LoopbackSourceFactory {
    sinks: Mutex<Vec<Arc<LoopbackSink>>>,
}

impl LoopbackSourceFactory {
    pub fn sinks(&self) -> Vec<Arc<LoopbackSink>> {
        self.sinks.lock().clone()
    }
}

impl AudioSourceFactory for LoopbackSourceFactory {
    fn create_source(&self, sample_rate: u32, channels: u16) -> Arc<dyn AudioSink> {
        debug!("Fuente loopback creada: {} Hz, {} canales", sample_rate, channels);
        let sink = Arc::new(LoopbackSink::new(sample_rate, channels));
        self.sinks.lock().push(sink.clone());
        sink
    }
}

pub struct LoopbackTrack {
    name: String,
}

impl LocalTrack for LoopbackTrack {
    fn name(&self) -> &str {
        &self.name
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct LoopbackTrackFactory;

impl TrackFactory for LoopbackTrackFactory {
    fn track_from_source(&self, name: &str, _source: Arc<dyn AudioSink>) -> Arc<dyn LocalTrack> {
        Arc::new(LoopbackTrack {
            name: name.to_string(),
        })
    }
}
