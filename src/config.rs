use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::audio::clock::ClockSettings;
use crate::audio::frame::FrameFormat;

/// Qué hace el reproductor cuando se va su último oyente en plena reproducción.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NoSubscriberBehavior {
    /// Entra en AutoPaused; solo se reanuda con un unpause explícito.
    #[default]
    Pause,
    /// Sigue enviando frames al sink.
    Play,
    /// Detiene el recurso actual.
    Stop,
}

impl FromStr for NoSubscriberBehavior {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pause" => Ok(Self::Pause),
            "play" => Ok(Self::Play),
            "stop" => Ok(Self::Stop),
            other => anyhow::bail!("Unknown no-subscriber behavior: {}", other),
        }
    }
}

impl fmt::Display for NoSubscriberBehavior {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Pause => "pause",
            Self::Play => "play",
            Self::Stop => "stop",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PlayerConfig {
    // Herramientas externas
    pub ytdlp_path: PathBuf,
    pub ffmpeg_path: PathBuf,

    // Buffer
    pub min_buffer_frames: usize,
    pub max_buffer_frames: usize,
    pub low_buffer_frames: usize,

    // Tiempos
    pub startup_timeout: Duration,
    pub startup_poll_interval: Duration,
    pub underrun_recovery: Duration,
    pub probe_timeout: Duration,

    // Comportamiento
    pub no_subscriber_behavior: NoSubscriberBehavior,
    pub track_name: String,

    // Rendimiento
    pub worker_threads: usize,
}

impl PlayerConfig {
    /// Carga `.env` (si existe) y luego el entorno del proceso.
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Construye la configuración desde cualquier búsqueda de claves, partiendo de los valores por defecto.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::default();
        let get = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        let config = Self {
            ytdlp_path: get("YTDLP_PATH").map_or(defaults.ytdlp_path, PathBuf::from),
            ffmpeg_path: get("FFMPEG_PATH").map_or(defaults.ffmpeg_path, PathBuf::from),

            min_buffer_frames: parse_or(get("MIN_BUFFER_FRAMES"), "MIN_BUFFER_FRAMES", defaults.min_buffer_frames)?,
            max_buffer_frames: parse_or(get("MAX_BUFFER_FRAMES"), "MAX_BUFFER_FRAMES", defaults.max_buffer_frames)?,
            low_buffer_frames: parse_or(get("LOW_BUFFER_FRAMES"), "LOW_BUFFER_FRAMES", defaults.low_buffer_frames)?,

            startup_timeout: duration_or(get("STARTUP_TIMEOUT"), "STARTUP_TIMEOUT", defaults.startup_timeout)?,
            startup_poll_interval: defaults.startup_poll_interval,
            underrun_recovery: duration_or(get("UNDERRUN_RECOVERY"), "UNDERRUN_RECOVERY", defaults.underrun_recovery)?,
            probe_timeout: duration_or(get("PROBE_TIMEOUT"), "PROBE_TIMEOUT", defaults.probe_timeout)?,

            no_subscriber_behavior: match get("NO_SUBSCRIBER_BEHAVIOR") {
                Some(value) => value.parse()?,
                None => defaults.no_subscriber_behavior,
            },
            track_name: get("TRACK_NAME").unwrap_or(defaults.track_name),

            worker_threads: parse_or(get("WORKER_THREADS"), "WORKER_THREADS", defaults.worker_threads)?,
        };

        config.validate()?;
        Ok(config)
    }

    /// Validaciones que detectan configuraciones con las que no se puede reproducir.
    pub fn validate(&self) -> Result<()> {
        if self.min_buffer_frames == 0 {
            anyhow::bail!("Min buffer frames must be greater than 0");
        }

        if self.max_buffer_frames < self.min_buffer_frames {
            anyhow::bail!(
                "Max buffer frames ({}) cannot be below min buffer frames ({})",
                self.max_buffer_frames,
                self.min_buffer_frames
            );
        }

        if self.low_buffer_frames > self.max_buffer_frames {
            anyhow::bail!(
                "Low buffer threshold ({}) cannot exceed max buffer frames ({})",
                self.low_buffer_frames,
                self.max_buffer_frames
            );
        }

        if self.startup_timeout.is_zero() {
            anyhow::bail!("Startup timeout must be greater than 0");
        }

        if self.probe_timeout.is_zero() {
            anyhow::bail!("Probe timeout must be greater than 0");
        }

        if self.track_name.trim().is_empty() {
            anyhow::bail!("Track name cannot be empty");
        }

        if self.worker_threads == 0 {
            anyhow::bail!("Worker threads must be greater than 0");
        }

        Ok(())
    }

    pub fn frame_format(&self) -> FrameFormat {
        FrameFormat::VOICE
    }

    pub fn clock_settings(&self) -> ClockSettings {
        ClockSettings {
            frame_interval: self.frame_format().frame_duration,
            low_buffer_frames: self.low_buffer_frames,
            underrun_recovery: self.underrun_recovery,
        }
    }

    /// Retorna un resumen de la configuración actual para logging.
    pub fn summary(&self) -> String {
        let format = self.frame_format();
        format!(
            "Config Summary:\n  \
            Tools: yt-dlp={}, ffmpeg={}\n  \
            Audio: {} Hz, {} ch, {} frames\n  \
            Buffer: min {} / low {} / max {} frames\n  \
            Timeouts: startup {}, probe {}, underrun recovery {}\n  \
            Behavior: no subscribers → {}, track '{}', {} workers",
            self.ytdlp_path.display(),
            self.ffmpeg_path.display(),
            format.sample_rate,
            format.channels,
            humantime::format_duration(format.frame_duration),
            self.min_buffer_frames,
            self.low_buffer_frames,
            self.max_buffer_frames,
            humantime::format_duration(self.startup_timeout),
            humantime::format_duration(self.probe_timeout),
            humantime::format_duration(self.underrun_recovery),
            self.no_subscriber_behavior,
            self.track_name,
            self.worker_threads
        )
    }
}

fn parse_or<V>(value: Option<String>, key: &str, default: V) -> Result<V>
where
    V: FromStr,
    V::Err: std::error::Error + Send + Sync + 'static,
{
    match value {
        Some(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("Invalid value for {}: {}", key, raw)),
        None => Ok(default),
    }
}

fn duration_or(value: Option<String>, key: &str, default: Duration) -> Result<Duration> {
    match value {
        Some(raw) => humantime::parse_duration(raw.trim())
            .with_context(|| format!("Invalid duration for {}: {}", key, raw)),
        None => Ok(default),
    }
}

/// Valores de configuración por defecto.
///
/// Se usan cuando no se proporcionan variables de entorno.
impl Default for PlayerConfig {
    fn default() -> Self {
        Self {
            ytdlp_path: "yt-dlp".into(),
            ffmpeg_path: "ffmpeg".into(),

            min_buffer_frames: 50,  // 1s
            max_buffer_frames: 500, // 10s
            low_buffer_frames: 10,

            startup_timeout: Duration::from_secs(15),
            startup_poll_interval: Duration::from_millis(10),
            underrun_recovery: Duration::from_millis(50),
            probe_timeout: Duration::from_secs(30),

            no_subscriber_behavior: NoSubscriberBehavior::Pause,
            track_name: "music".to_string(),

            worker_threads: num_cpus::get(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn empty_environment_yields_defaults() {
        let config = PlayerConfig::from_lookup(|_| None).unwrap();
        assert_eq!(config.min_buffer_frames, 50);
        assert_eq!(config.max_buffer_frames, 500);
        assert_eq!(config.startup_poll_interval, Duration::from_millis(10));
        assert_eq!(config.no_subscriber_behavior, NoSubscriberBehavior::Pause);
        assert_eq!(config.clock_settings().frame_interval, Duration::from_millis(20));
    }

    #[test]
    fn reads_values_and_humantime_durations() {
        let config = PlayerConfig::from_lookup(lookup(&[
            ("YTDLP_PATH", "/opt/bin/yt-dlp"),
            ("MIN_BUFFER_FRAMES", "25"),
            ("STARTUP_TIMEOUT", "2s 500ms"),
            ("UNDERRUN_RECOVERY", "80ms"),
            ("NO_SUBSCRIBER_BEHAVIOR", "Stop"),
            ("TRACK_NAME", "radio"),
        ]))
        .unwrap();

        assert_eq!(config.ytdlp_path, PathBuf::from("/opt/bin/yt-dlp"));
        assert_eq!(config.min_buffer_frames, 25);
        assert_eq!(config.startup_timeout, Duration::from_millis(2500));
        assert_eq!(config.clock_settings().underrun_recovery, Duration::from_millis(80));
        assert_eq!(config.no_subscriber_behavior, NoSubscriberBehavior::Stop);
        assert_eq!(config.track_name, "radio");
    }

    #[test]
    fn malformed_values_name_the_variable() {
        let error = PlayerConfig::from_lookup(lookup(&[("STARTUP_TIMEOUT", "soon")])).unwrap_err();
        assert!(error.to_string().contains("STARTUP_TIMEOUT"));

        let error = PlayerConfig::from_lookup(lookup(&[("MAX_BUFFER_FRAMES", "-1")])).unwrap_err();
        assert!(error.to_string().contains("MAX_BUFFER_FRAMES"));

        assert!(PlayerConfig::from_lookup(lookup(&[("NO_SUBSCRIBER_BEHAVIOR", "shrug")])).is_err());
    }

    #[test]
    fn validation_rejects_inconsistent_buffers() {
        let config = PlayerConfig {
            min_buffer_frames: 100,
            max_buffer_frames: 50,
            ..PlayerConfig::default()
        };
        assert!(config.validate().is_err());

        let config = PlayerConfig {
            min_buffer_frames: 0,
            ..PlayerConfig::default()
        };
        assert!(config.validate().is_err());
        assert!(PlayerConfig::default().validate().is_ok());
    }

    #[test]
    fn summary_mentions_key_settings() {
        let summary = PlayerConfig::default().summary();
        assert!(summary.contains("48000 Hz"));
        assert!(summary.contains("20ms"));
        assert!(summary.contains("no subscribers → pause"));
    }
}
