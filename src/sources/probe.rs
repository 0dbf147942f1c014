use async_process::{Command, Stdio};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

use super::{cache::TtlCache, is_url};
use crate::audio::pipeline::{has_search_prefix, CommandSpec};
use crate::error::{PlayerError, PlayerResult};

/// Límite duro para una consulta de metadatos.
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(30);

const STDERR_TAIL: usize = 512;

/// Metadatos resueltos para una entrada.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProbeInfo {
    pub title: String,
    pub duration: Option<Duration>,
    pub thumbnail: Option<String>,
    /// URL canónica de la página; lo que debe recibir el pipeline.
    pub url: String,
    pub is_live: bool,
}

/// Parte del documento de `--dump-json` que nos interesa.
#[derive(Debug, Deserialize)]
struct YtDlpInfo {
    title: Option<String>,
    duration: Option<f64>,
    thumbnail: Option<String>,
    webpage_url: Option<String>,
    original_url: Option<String>,
    url: Option<String>,
    is_live: Option<bool>,
}

/// Término de búsqueda → búsqueda de yt-dlp con un resultado; las URLs y
/// las búsquedas explícitas pasan sin cambios.
pub fn probe_query(input: &str) -> String {
    let input = input.trim();
    if is_url(input) || has_search_prefix(input) {
        input.to_string()
    } else {
        format!("ytsearch1:{}", input)
    }
}

pub fn probe_command(input: &str, tool_path: &Path) -> CommandSpec {
    CommandSpec::new(tool_path.to_string_lossy()).args([
        "--dump-json",
        "--no-playlist",
        "--skip-download",
        "--no-warnings",
        "--",
        probe_query(input).as_str(),
    ])
}

/// Resuelve `input` con el binario de yt-dlp en `tool_path`.
pub async fn probe(input: &str, tool_path: &Path) -> PlayerResult<ProbeInfo> {
    run_probe(&probe_command(input, tool_path), PROBE_TIMEOUT).await
}

/// Ejecuta un comando de consulta ya preparado y lo mata si supera `limit`.
pub async fn run_probe(command: &CommandSpec, limit: Duration) -> PlayerResult<ProbeInfo> {
    debug!("📊 Ejecutando probe: {}", command);

    let child = Command::new(command.program())
        .args(command.arguments())
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| PlayerError::ProbeFailed {
            reason: format!("could not run {}: {}", command.program(), e),
        })?;

    // Al expirar se suelta el future y con él el proceso, que muere.
    let output = match tokio::time::timeout(limit, child.output()).await {
        Ok(result) => result.map_err(|e| PlayerError::ProbeFailed {
            reason: format!("{} I/O error: {}", command.program(), e),
        })?,
        Err(_) => {
            warn!("⏰ Probe excedió {}: {}", humantime::format_duration(limit), command);
            return Err(PlayerError::ProbeTimeout { timeout: limit });
        }
    };

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(PlayerError::ProbeFailed {
            reason: format!("{} exited with {}: {}", command.program(), output.status, tail(&stderr)),
        });
    }

    parse_probe_output(&String::from_utf8_lossy(&output.stdout))
}

/// Parsea la primera línea JSON impresa por `yt-dlp --dump-json`.
pub fn parse_probe_output(stdout: &str) -> PlayerResult<ProbeInfo> {
    let line = stdout
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .ok_or_else(|| PlayerError::ProbeParseError {
            reason: "empty output".to_string(),
        })?;

    let info: YtDlpInfo = serde_json::from_str(line).map_err(|e| PlayerError::ProbeParseError {
        reason: e.to_string(),
    })?;

    let url = info
        .webpage_url
        .or(info.original_url)
        .or(info.url)
        .ok_or_else(|| PlayerError::ProbeParseError {
            reason: "no canonical url in metadata".to_string(),
        })?;

    Ok(ProbeInfo {
        title: info.title.unwrap_or_else(|| "Unknown".to_string()),
        duration: info
            .duration
            .filter(|secs| secs.is_finite() && *secs >= 0.0)
            .map(Duration::from_secs_f64),
        thumbnail: info.thumbnail,
        url,
        is_live: info.is_live.unwrap_or(false),
    })
}

fn tail(text: &str) -> &str {
    let text = text.trim();
    if text.len() <= STDERR_TAIL {
        return text;
    }
    let mut start = text.len() - STDERR_TAIL;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    &text[start..]
}

/// Consultas con cache de resultados, para no relanzar yt-dlp con la misma
/// entrada.
pub struct Prober {
    tool_path: PathBuf,
    timeout: Duration,
    cache: TtlCache<String, ProbeInfo>,
    cache_ttl: Option<Duration>,
}

impl Prober {
    pub fn new(tool_path: impl Into<PathBuf>) -> Self {
        Self {
            tool_path: tool_path.into(),
            timeout: PROBE_TIMEOUT,
            cache: TtlCache::new(256),
            cache_ttl: Some(Duration::from_secs(3600)),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_cache(mut self, capacity: usize, ttl: Option<Duration>) -> Self {
        self.cache = TtlCache::new(capacity);
        self.cache_ttl = ttl;
        self
    }

    pub async fn probe(&self, input: &str) -> PlayerResult<ProbeInfo> {
        let key = input.trim().to_string();
        if let Some(info) = self.cache.get(&key) {
            debug!("📦 Probe en caché: {}", key);
            return Ok(info);
        }

        let info = run_probe(&probe_command(&key, &self.tool_path), self.timeout).await?;
        info!("🔍 Resuelto '{}' → {}", key, info.title);
        self.cache.insert_with_ttl(key, info.clone(), self.cache_ttl);
        Ok(info)
    }

    pub fn cache(&self) -> &TtlCache<String, ProbeInfo> {
        &self.cache
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const SAMPLE: &str = r#"{"id":"dQw4w9WgXcQ","title":"Never Gonna Give You Up","duration":212.0,"thumbnail":"https://i.ytimg.com/vi/dQw4w9WgXcQ/maxresdefault.jpg","webpage_url":"https://www.youtube.com/watch?v=dQw4w9WgXcQ","is_live":false}"#;

    fn sh(script: &str) -> CommandSpec {
        CommandSpec::new("sh").args(["-c", script])
    }

    #[test]
    fn search_terms_become_single_result_searches() {
        assert_eq!(probe_query("lofi hip hop"), "ytsearch1:lofi hip hop");
        assert_eq!(
            probe_query("https://youtu.be/dQw4w9WgXcQ"),
            "https://youtu.be/dQw4w9WgXcQ"
        );
        assert_eq!(probe_query("scsearch3:ambient"), "scsearch3:ambient");
    }

    #[test]
    fn command_is_argv_with_option_terminator() {
        let command = probe_command("--exec rm", Path::new("/usr/bin/yt-dlp"));
        assert_eq!(command.program(), "/usr/bin/yt-dlp");
        let args = command.arguments();
        assert_eq!(args[args.len() - 2], "--");
        assert_eq!(args[args.len() - 1], "ytsearch1:--exec rm");
    }

    #[test]
    fn parses_dump_json_line() {
        let info = parse_probe_output(&format!("\n{}\n", SAMPLE)).unwrap();
        assert_eq!(info.title, "Never Gonna Give You Up");
        assert_eq!(info.duration, Some(Duration::from_secs(212)));
        assert_eq!(info.url, "https://www.youtube.com/watch?v=dQw4w9WgXcQ");
        assert!(!info.is_live);
    }

    #[test]
    fn malformed_or_incomplete_json_is_a_parse_error() {
        assert!(matches!(
            parse_probe_output("WARNING: not json"),
            Err(PlayerError::ProbeParseError { .. })
        ));
        assert!(matches!(
            parse_probe_output(""),
            Err(PlayerError::ProbeParseError { .. })
        ));
        assert!(matches!(
            parse_probe_output(r#"{"title":"no url"}"#),
            Err(PlayerError::ProbeParseError { .. })
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn runs_tool_and_parses_stdout() {
        let command = sh(&format!("echo '{}'", SAMPLE));
        let info = run_probe(&command, Duration::from_secs(5)).await.unwrap();
        assert_eq!(info.title, "Never Gonna Give You Up");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn non_zero_exit_is_probe_failed() {
        let command = sh("echo 'ERROR: Video unavailable' >&2; exit 1");
        match run_probe(&command, Duration::from_secs(5)).await {
            Err(PlayerError::ProbeFailed { reason }) => assert!(reason.contains("Video unavailable")),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn slow_tool_times_out() {
        let command = sh("exec sleep 10");
        let started = std::time::Instant::now();
        let result = run_probe(&command, Duration::from_millis(200)).await;
        assert!(matches!(result, Err(PlayerError::ProbeTimeout { .. })));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn cached_results_skip_the_tool() {
        let prober = Prober::new("/nonexistent/yt-dlp").with_cache(8, None);
        let info = parse_probe_output(SAMPLE).unwrap();
        prober
            .cache()
            .insert_with_ttl("never gonna give you up".to_string(), info.clone(), None);

        assert_eq!(prober.probe("  never gonna give you up ").await.unwrap(), info);
        assert!(matches!(
            prober.probe("something else").await,
            Err(PlayerError::ProbeFailed { .. })
        ));
        assert_eq!(prober.cache().metrics().hits, 1);
    }

    #[tokio::test]
    async fn missing_tool_is_probe_failed() {
        let result = probe("anything", Path::new("/nonexistent/yt-dlp")).await;
        assert!(matches!(result, Err(PlayerError::ProbeFailed { .. })));
    }
}
