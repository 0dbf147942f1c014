//! # Sources
//!
//! Everything that describes *what* to play: the [`AudioResource`] handed to
//! the player, and the yt-dlp [`probe`](probe::probe) that turns a search
//! term or page URL into something playable plus its metadata.

pub mod cache;
pub mod probe;

use bytes::Bytes;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use tracing::debug;

use crate::error::{PlayerError, PlayerResult};

pub use cache::TtlCache;
pub use probe::{probe, ProbeInfo, Prober};

/// Entrada cruda a partir de la cual se crea un recurso.
///
/// Solo el texto (URL, búsqueda o ruta local) llega al pipeline de
/// decodificación; los bytes en memoria se rechazan al crear el recurso.
#[derive(Debug, Clone)]
pub enum ResourceInput {
    Text(String),
    Bytes(Bytes),
}

impl ResourceInput {
    pub fn kind(&self) -> &'static str {
        match self {
            ResourceInput::Text(_) => "text",
            ResourceInput::Bytes(_) => "bytes",
        }
    }
}

impl From<&str> for ResourceInput {
    fn from(value: &str) -> Self {
        ResourceInput::Text(value.to_string())
    }
}

impl From<String> for ResourceInput {
    fn from(value: String) -> Self {
        ResourceInput::Text(value)
    }
}

impl From<&Path> for ResourceInput {
    fn from(value: &Path) -> Self {
        ResourceInput::Text(value.to_string_lossy().into_owned())
    }
}

impl From<PathBuf> for ResourceInput {
    fn from(value: PathBuf) -> Self {
        ResourceInput::from(value.as_path())
    }
}

impl From<Bytes> for ResourceInput {
    fn from(value: Bytes) -> Self {
        ResourceInput::Bytes(value)
    }
}

impl From<Vec<u8>> for ResourceInput {
    fn from(value: Vec<u8>) -> Self {
        ResourceInput::Bytes(Bytes::from(value))
    }
}

#[derive(Debug, Clone)]
pub struct ResourceOptions<T> {
    pub metadata: T,
    pub volume: f32,
}

impl<T> ResourceOptions<T> {
    pub fn new(metadata: T) -> Self {
        Self {
            metadata,
            volume: 1.0,
        }
    }

    pub fn with_volume(mut self, volume: f32) -> Self {
        self.volume = volume;
        self
    }
}

impl<T: Default> Default for ResourceOptions<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

/// Una entrada reproducible más los metadatos del llamador.
///
/// La entrada no cambia tras la creación. El volumen puede ajustarse en
/// cualquier momento, incluso sonando; el reloj lo lee en cada frame.
#[derive(Debug)]
pub struct AudioResource<T = ()> {
    input: String,
    metadata: T,
    volume: AtomicU32,
    started: AtomicBool,
    ended: AtomicBool,
}

impl<T> AudioResource<T> {
    pub fn create(input: impl Into<ResourceInput>, options: ResourceOptions<T>) -> PlayerResult<Self> {
        let input = match input.into() {
            ResourceInput::Text(text) if !text.trim().is_empty() => text.trim().to_string(),
            ResourceInput::Text(_) => {
                return Err(PlayerError::UnsupportedInputKind { kind: "empty text" })
            }
            other => return Err(PlayerError::UnsupportedInputKind { kind: other.kind() }),
        };

        debug!("Recurso creado para: {}", input);
        Ok(Self {
            input,
            metadata: options.metadata,
            volume: AtomicU32::new(clamp_volume(options.volume).to_bits()),
            started: AtomicBool::new(false),
            ended: AtomicBool::new(false),
        })
    }

    pub fn input(&self) -> &str {
        &self.input
    }

    pub fn metadata(&self) -> &T {
        &self.metadata
    }

    pub fn volume(&self) -> f32 {
        f32::from_bits(self.volume.load(Ordering::Relaxed))
    }

    pub fn set_volume(&self, volume: f32) {
        self.volume
            .store(clamp_volume(volume).to_bits(), Ordering::Relaxed);
    }

    pub fn is_url(&self) -> bool {
        is_url(&self.input)
    }

    pub fn started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    pub fn ended(&self) -> bool {
        self.ended.load(Ordering::Acquire)
    }

    pub(crate) fn mark_started(&self) {
        self.started.store(true, Ordering::Release);
    }

    pub(crate) fn mark_ended(&self) {
        self.ended.store(true, Ordering::Release);
    }
}

impl AudioResource<()> {
    pub fn from_input(input: impl Into<ResourceInput>) -> PlayerResult<Self> {
        Self::create(input, ResourceOptions::new(()))
    }
}

impl AudioResource<ProbeInfo> {
    /// Recurso para un track resuelto, reproducido desde su URL canónica.
    pub fn from_probe(info: ProbeInfo) -> PlayerResult<Self> {
        let url = info.url.clone();
        Self::create(url, ResourceOptions::new(info))
    }
}

fn clamp_volume(volume: f32) -> f32 {
    if volume.is_nan() {
        0.0
    } else {
        volume.clamp(0.0, 1.0)
    }
}

/// Verdadero para URLs `http(s)` absolutas.
pub fn is_url(input: &str) -> bool {
    match url::Url::parse(input) {
        Ok(parsed) => matches!(parsed.scheme(), "http" | "https") && parsed.host_str().is_some(),
        Err(_) => false,
    }
}
