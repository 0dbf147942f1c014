//! Error types for the playback engine.
//!
//! Everything that can go wrong between accepting an input and handing the
//! last frame to the transport ends up as a [`PlayerError`]. Startup
//! failures are reported through the player's event channel; per-frame
//! capture failures are logged where they happen and never propagate.

use std::time::Duration;
use thiserror::Error;

/// Fallo reportado por el transporte (publicación o captura de frames).
#[derive(Debug, Clone, Error)]
#[error("{0}")]
pub struct TransportError(pub String);

impl TransportError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

#[derive(Debug, Error)]
pub enum PlayerError {
    /// El recurso se creó a partir de algo que no es una URL ni una ruta.
    #[error("unsupported input kind: {kind}")]
    UnsupportedInputKind { kind: &'static str },

    #[error("probe failed: {reason}")]
    ProbeFailed { reason: String },

    #[error("could not parse probe output: {reason}")]
    ProbeParseError { reason: String },

    #[error("probe did not finish within {}", human(.timeout))]
    ProbeTimeout { timeout: Duration },

    #[error("failed to spawn `{program}`: {source}")]
    DecodeSpawnError {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("decoder produced no frames within {}", human(.timeout))]
    DecodeTimeout { timeout: Duration },

    /// El decodificador terminó antes de encolar un solo frame.
    #[error("decoder exited without producing audio{}", stderr_suffix(.stderr))]
    DecodeProducedNoData { stderr: Option<String> },

    #[error("decoder stream failed: {source}")]
    DecodeRuntime {
        #[source]
        source: std::io::Error,
    },

    #[error("frame capture failed: {0}")]
    FrameCaptureFailure(#[source] TransportError),

    #[error("could not publish audio track: {0}")]
    TrackPublishFailed(#[source] TransportError),
}

fn human(duration: &Duration) -> humantime::FormattedDuration {
    humantime::format_duration(*duration)
}

fn stderr_suffix(stderr: &Option<String>) -> String {
    match stderr {
        Some(text) if !text.is_empty() => format!(": {}", text),
        _ => String::new(),
    }
}

pub type PlayerResult<T> = Result<T, PlayerError>;
