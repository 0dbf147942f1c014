//! Decode pipeline: the external processes that turn an input into raw
//! PCM, and the supervisor that chops their output into frames.
//!
//! Inputs hosted on streaming platforms go through `yt-dlp | ffmpeg`;
//! everything else is opened by ffmpeg directly. Commands are always built
//! as argv arrays, never through a shell.

use parking_lot::Mutex;
use regex::Regex;
use std::collections::VecDeque;
use std::fmt;
use std::io;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, LazyLock};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tokio::process::{Child, ChildStdout, Command};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::frame::{FrameAssembler, FrameFormat};
use super::queue::FrameQueue;
use crate::error::{PlayerError, PlayerResult};
use crate::sources::is_url;

const READ_CHUNK: usize = 16 * 1024;
const STDERR_LINES: usize = 20;
const EXIT_GRACE: Duration = Duration::from_secs(2);

static STREAMING_URL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)^(https?://)?([a-z0-9-]+\.)*(youtube\.com|youtu\.be|soundcloud\.com|twitch\.tv|vimeo\.com|bandcamp\.com)(/|$|\?)",
    )
    .expect("streaming url pattern is valid")
});

static SEARCH_PREFIX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(yt|ytm|sc)search\d*:").expect("search prefix pattern is valid")
});

/// Verdadero para entradas como `ytsearch1:artista - canción` o `scsearch:consulta`.
pub fn has_search_prefix(input: &str) -> bool {
    SEARCH_PREFIX.is_match(input)
}

pub fn is_streaming_url(input: &str) -> bool {
    STREAMING_URL.is_match(input)
}

/// Cómo llega una entrada al decodificador.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InputRoute {
    /// ffmpeg abre la entrada directamente.
    Direct,
    /// yt-dlp descarga el medio y lo pasa a ffmpeg por pipe.
    Fetched,
}

pub fn classify(input: &str) -> InputRoute {
    if is_streaming_url(input) || has_search_prefix(input) {
        InputRoute::Fetched
    } else {
        InputRoute::Direct
    }
}

/// Una invocación de programa externo.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    program: String,
    args: Vec<String>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn arguments(&self) -> &[String] {
        &self.args
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

/// Genera la cadena de procesos para una entrada. El último comando debe
/// escribir PCM s16le en el formato pedido por stdout.
pub trait DecodeCommandBuilder: Send + Sync {
    fn build(&self, input: &str, format: FrameFormat) -> Vec<CommandSpec>;
}

/// Planes de comandos yt-dlp + ffmpeg.
#[derive(Debug, Clone)]
pub struct FfmpegCommandBuilder {
    ytdlp_path: String,
    ffmpeg_path: String,
}

impl FfmpegCommandBuilder {
    pub fn new(ytdlp_path: impl Into<String>, ffmpeg_path: impl Into<String>) -> Self {
        Self {
            ytdlp_path: ytdlp_path.into(),
            ffmpeg_path: ffmpeg_path.into(),
        }
    }

    fn ytdlp(&self, input: &str) -> CommandSpec {
        CommandSpec::new(&self.ytdlp_path).args([
            "-f",
            "bestaudio/best",
            "-o",
            "-",
            "--no-playlist",
            "--quiet",
            "--no-warnings",
            "--",
            input,
        ])
    }

    fn ffmpeg(&self, input: &str, reconnect: bool, format: FrameFormat) -> CommandSpec {
        let mut command = CommandSpec::new(&self.ffmpeg_path).args(["-hide_banner", "-loglevel", "error"]);
        if reconnect {
            command = command.args([
                "-reconnect",
                "1",
                "-reconnect_streamed",
                "1",
                "-reconnect_delay_max",
                "5",
            ]);
        }
        command
            .args(["-i", input, "-vn", "-f", "s16le", "-ar"])
            .arg(format.sample_rate.to_string())
            .arg("-ac")
            .arg(format.channels.to_string())
            .arg("pipe:1")
    }
}

impl Default for FfmpegCommandBuilder {
    fn default() -> Self {
        Self::new("yt-dlp", "ffmpeg")
    }
}

impl DecodeCommandBuilder for FfmpegCommandBuilder {
    fn build(&self, input: &str, format: FrameFormat) -> Vec<CommandSpec> {
        match classify(input) {
            InputRoute::Fetched => vec![self.ytdlp(input), self.ffmpeg("pipe:0", false, format)],
            InputRoute::Direct => vec![self.ffmpeg(input, is_url(input), format)],
        }
    }
}

/// Últimas líneas que los procesos del decodificador escribieron en stderr.
#[derive(Debug, Clone, Default)]
struct StderrTail(Arc<Mutex<VecDeque<String>>>);

impl StderrTail {
    fn push(&self, line: String) {
        let mut lines = self.0.lock();
        if lines.len() == STDERR_LINES {
            lines.pop_front();
        }
        lines.push_back(line);
    }

    fn joined(&self) -> Option<String> {
        let lines = self.0.lock();
        if lines.is_empty() {
            None
        } else {
            Some(lines.iter().cloned().collect::<Vec<_>>().join("\n"))
        }
    }
}

pub type FailureCallback = Box<dyn FnOnce(PlayerError) + Send + 'static>;

/// Cadena de procesos de decodificación que alimenta una [`FrameQueue`].
///
/// Cuando la última etapa cierra su stdout la cola queda marcada como
/// terminada y [`DecodePipeline::is_running`] pasa a falso. Soltar o matar
/// el pipeline mata todos los procesos de la cadena.
pub struct DecodePipeline {
    token: CancellationToken,
    running: Arc<AtomicBool>,
    stderr: StderrTail,
    helpers: Vec<JoinHandle<()>>,
}

impl DecodePipeline {
    /// Lanza `commands` como cadena de pipes. Requiere un runtime de tokio.
    /// `on_failure` se ejecuta si falla la lectura de la salida.
    pub fn spawn(
        commands: &[CommandSpec],
        queue: Arc<FrameQueue>,
        format: FrameFormat,
        on_failure: FailureCallback,
    ) -> PlayerResult<Self> {
        if commands.is_empty() {
            return Err(PlayerError::DecodeSpawnError {
                program: String::new(),
                source: io::Error::new(io::ErrorKind::InvalidInput, "empty decode plan"),
            });
        }

        let stderr = StderrTail::default();
        let mut helpers = Vec::new();
        let mut children = Vec::with_capacity(commands.len());
        let mut upstream: Option<ChildStdout> = None;

        for (stage, spec) in commands.iter().enumerate() {
            debug!("🔧 Etapa {} del pipeline: {}", stage, spec);

            let mut child = Command::new(spec.program())
                .args(spec.arguments())
                .stdin(if stage == 0 { Stdio::null() } else { Stdio::piped() })
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .kill_on_drop(true)
                .spawn()
                .map_err(|source| PlayerError::DecodeSpawnError {
                    program: spec.program().to_string(),
                    source,
                })?;

            if let (Some(mut from), Some(mut to)) = (upstream.take(), child.stdin.take()) {
                helpers.push(tokio::spawn(async move {
                    if let Err(e) = tokio::io::copy(&mut from, &mut to).await {
                        debug!("Pipe entre etapas cerrado: {}", e);
                    }
                }));
            }

            if let Some(err) = child.stderr.take() {
                helpers.push(tokio::spawn(collect_stderr(
                    spec.program().to_string(),
                    err,
                    stderr.clone(),
                )));
            }

            upstream = child.stdout.take();
            children.push(child);
        }

        let stdout = upstream.ok_or_else(|| PlayerError::DecodeSpawnError {
            program: commands[commands.len() - 1].program().to_string(),
            source: io::Error::new(io::ErrorKind::BrokenPipe, "decoder stdout unavailable"),
        })?;

        let token = CancellationToken::new();
        let running = Arc::new(AtomicBool::new(true));
        tokio::spawn(supervise(
            children,
            stdout,
            queue,
            format,
            token.clone(),
            running.clone(),
            stderr.clone(),
            on_failure,
        ));

        Ok(Self {
            token,
            running,
            stderr,
            helpers,
        })
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn stderr_tail(&self) -> Option<String> {
        self.stderr.joined()
    }

    /// Termina a la fuerza todos los procesos de la cadena.
    pub fn kill(&self) {
        self.token.cancel();
        for helper in &self.helpers {
            helper.abort();
        }
    }
}

impl Drop for DecodePipeline {
    fn drop(&mut self) {
        self.kill();
    }
}

enum ReadOutcome {
    EndOfStream,
    Cancelled,
    Failed(io::Error),
}

#[allow(clippy::too_many_arguments)]
async fn supervise(
    mut children: Vec<Child>,
    mut stdout: impl AsyncRead + Unpin,
    queue: Arc<FrameQueue>,
    format: FrameFormat,
    token: CancellationToken,
    running: Arc<AtomicBool>,
    stderr: StderrTail,
    on_failure: FailureCallback,
) {
    let mut assembler = FrameAssembler::new(format);
    let mut buf = vec![0u8; READ_CHUNK];
    let mut bytes_read: u64 = 0;

    let outcome = 'read: loop {
        let read = tokio::select! {
            _ = token.cancelled() => break 'read ReadOutcome::Cancelled,
            read = stdout.read(&mut buf) => read,
        };

        match read {
            Ok(0) => break 'read ReadOutcome::EndOfStream,
            Ok(n) => {
                bytes_read += n as u64;
                for frame in assembler.push(&buf[..n]) {
                    tokio::select! {
                        _ = token.cancelled() => break 'read ReadOutcome::Cancelled,
                        _ = queue.push(frame) => {}
                    }
                }
            }
            Err(e) => break 'read ReadOutcome::Failed(e),
        }
    };

    match outcome {
        ReadOutcome::Cancelled => {
            for child in &mut children {
                let _ = child.start_kill();
            }
            running.store(false, Ordering::Release);
            debug!("🛑 Pipeline cancelado tras {} bytes", bytes_read);
        }
        ReadOutcome::EndOfStream => {
            for child in &mut children {
                match tokio::time::timeout(EXIT_GRACE, child.wait()).await {
                    Ok(Ok(status)) if status.success() => {}
                    Ok(Ok(status)) => warn!(
                        "⚠️ Proceso de decodificación terminó con {}: {}",
                        status,
                        stderr.joined().unwrap_or_default()
                    ),
                    Ok(Err(e)) => warn!("⚠️ No se pudo esperar al proceso: {}", e),
                    Err(_) => {
                        let _ = child.start_kill();
                    }
                }
            }
            if !assembler.leftover().is_empty() {
                debug!("Descartando {} bytes finales incompletos", assembler.leftover().len());
            }
            running.store(false, Ordering::Release);
            queue.mark_decoder_done();
            info!("✅ Decodificación completa: {} bytes, {} frames", bytes_read, queue.pushed());
        }
        ReadOutcome::Failed(e) => {
            for child in &mut children {
                let _ = child.start_kill();
            }
            running.store(false, Ordering::Release);
            warn!("❌ Error leyendo la salida del decodificador: {}", e);
            on_failure(PlayerError::DecodeRuntime { source: e });
        }
    }
}

async fn collect_stderr(program: String, stream: impl AsyncRead + Unpin, tail: StderrTail) {
    let mut lines = BufReader::new(stream).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if line.trim().is_empty() {
            continue;
        }
        debug!("[{}] {}", program, line);
        tail.push(line);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::queue::Dequeued;
    use pretty_assertions::assert_eq;

    fn args_of(command: &CommandSpec) -> Vec<&str> {
        command.arguments().iter().map(String::as_str).collect()
    }

    #[test]
    fn streaming_platforms_are_fetched_through_ytdlp() {
        for input in [
            "https://www.youtube.com/watch?v=dQw4w9WgXcQ",
            "https://youtu.be/dQw4w9WgXcQ",
            "https://music.youtube.com/watch?v=abc",
            "https://soundcloud.com/artist/track",
            "ytsearch1:daft punk",
            "scsearch:ambient",
        ] {
            assert_eq!(classify(input), InputRoute::Fetched, "{}", input);
        }
        for input in [
            "https://radio.example.com/stream.mp3",
            "/home/user/music/song.flac",
            "https://notyoutube.com.evil.example/watch",
        ] {
            assert_eq!(classify(input), InputRoute::Direct, "{}", input);
        }
    }

    #[test]
    fn fetched_plan_pipes_ytdlp_into_ffmpeg() {
        let builder = FfmpegCommandBuilder::new("/opt/yt-dlp", "/opt/ffmpeg");
        let plan = builder.build("https://youtu.be/dQw4w9WgXcQ", FrameFormat::VOICE);

        assert_eq!(plan.len(), 2);
        assert_eq!(plan[0].program(), "/opt/yt-dlp");
        assert_eq!(args_of(&plan[0]).last(), Some(&"https://youtu.be/dQw4w9WgXcQ"));
        assert_eq!(plan[1].program(), "/opt/ffmpeg");
        let ffmpeg = args_of(&plan[1]);
        assert!(ffmpeg.windows(2).any(|w| w == ["-i", "pipe:0"]));
        assert!(!ffmpeg.contains(&"-reconnect"));
    }

    #[test]
    fn direct_http_plan_has_reconnect_flags_and_output_format() {
        let plan = FfmpegCommandBuilder::default()
            .build("https://radio.example.com/live.mp3", FrameFormat::VOICE);

        assert_eq!(plan.len(), 1);
        let args = args_of(&plan[0]);
        assert!(args.windows(2).any(|w| w == ["-reconnect", "1"]));
        assert!(args.windows(2).any(|w| w == ["-reconnect_delay_max", "5"]));
        assert!(args.windows(2).any(|w| w == ["-f", "s16le"]));
        assert!(args.windows(2).any(|w| w == ["-ar", "48000"]));
        assert!(args.windows(2).any(|w| w == ["-ac", "2"]));
        assert_eq!(args.last(), Some(&"pipe:1"));
    }

    #[test]
    fn local_files_skip_reconnect_flags() {
        let plan = FfmpegCommandBuilder::default().build("/tmp/song; rm -rf ~.mp3", FrameFormat::VOICE);
        let args = args_of(&plan[0]);
        assert!(!args.contains(&"-reconnect"));
        assert!(args.contains(&"/tmp/song; rm -rf ~.mp3"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn reads_decoder_output_into_frames() {
        let queue = Arc::new(FrameQueue::new(64));
        let format = FrameFormat::VOICE;
        // Diez frames más una cola incompleta.
        let bytes = format.frame_bytes() * 10 + 100;
        let plan = [CommandSpec::new("sh").args(["-c", format!("head -c {} /dev/zero", bytes).as_str()])];

        let pipeline = DecodePipeline::spawn(&plan, queue.clone(), format, Box::new(|_| {})).unwrap();
        tokio::time::timeout(Duration::from_secs(5), async {
            while !queue.is_decoder_done() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("decoder should finish");

        assert!(!pipeline.is_running());
        assert_eq!(queue.len(), 10);
        assert!(matches!(queue.pop(), Dequeued::Frame { .. }));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn two_stage_chain_pipes_stdout_to_stdin() {
        let queue = Arc::new(FrameQueue::new(64));
        let format = FrameFormat::VOICE;
        let plan = [
            CommandSpec::new("sh").args(["-c", format!("head -c {} /dev/zero", format.frame_bytes() * 3).as_str()]),
            CommandSpec::new("cat"),
        ];

        let _pipeline = DecodePipeline::spawn(&plan, queue.clone(), format, Box::new(|_| {})).unwrap();
        tokio::time::timeout(Duration::from_secs(5), async {
            while !queue.is_decoder_done() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("chain should finish");

        assert_eq!(queue.len(), 3);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn kill_stops_a_stalled_decoder() {
        let queue = Arc::new(FrameQueue::new(8));
        let plan = [CommandSpec::new("sh").args(["-c", "exec sleep 30"])];

        let pipeline =
            DecodePipeline::spawn(&plan, queue.clone(), FrameFormat::VOICE, Box::new(|_| {})).unwrap();
        assert!(pipeline.is_running());

        pipeline.kill();
        tokio::time::timeout(Duration::from_secs(5), async {
            while pipeline.is_running() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("pipeline should stop");
        assert!(!queue.is_decoder_done());
    }

    /// Entrega `bytes` ceros una vez y luego falla en cada lectura.
    struct BrokenPipe {
        bytes: usize,
    }

    impl AsyncRead for BrokenPipe {
        fn poll_read(
            mut self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
            buf: &mut tokio::io::ReadBuf<'_>,
        ) -> std::task::Poll<io::Result<()>> {
            if self.bytes == 0 {
                return std::task::Poll::Ready(Err(io::Error::new(
                    io::ErrorKind::ConnectionReset,
                    "decoder pipe reset",
                )));
            }
            let n = self.bytes.min(buf.remaining());
            buf.put_slice(&vec![0u8; n]);
            self.bytes -= n;
            std::task::Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn read_error_reports_a_runtime_failure() {
        let format = FrameFormat::VOICE;
        let queue = Arc::new(FrameQueue::new(16));
        let running = Arc::new(AtomicBool::new(true));
        let (tx, rx) = tokio::sync::oneshot::channel();

        supervise(
            Vec::new(),
            BrokenPipe {
                bytes: format.frame_bytes() * 2,
            },
            queue.clone(),
            format,
            CancellationToken::new(),
            running.clone(),
            StderrTail::default(),
            Box::new(move |error| {
                let _ = tx.send(error);
            }),
        )
        .await;

        match rx.await {
            Ok(PlayerError::DecodeRuntime { source }) => {
                assert_eq!(source.kind(), io::ErrorKind::ConnectionReset)
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(!running.load(Ordering::Acquire));
        assert!(!queue.is_decoder_done());
        assert_eq!(queue.len(), 2);
    }

    #[tokio::test]
    async fn missing_binary_is_a_spawn_error() {
        let queue = Arc::new(FrameQueue::new(8));
        let plan = [CommandSpec::new("/nonexistent/ffmpeg")];
        let result = DecodePipeline::spawn(&plan, queue, FrameFormat::VOICE, Box::new(|_| {}));
        match result {
            Err(PlayerError::DecodeSpawnError { program, .. }) => assert_eq!(program, "/nonexistent/ffmpeg"),
            Err(other) => panic!("unexpected error {:?}", other),
            Ok(_) => panic!("spawn should fail"),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn stderr_is_kept_for_diagnostics() {
        let queue = Arc::new(FrameQueue::new(8));
        let plan = [CommandSpec::new("sh").args(["-c", "echo 'Invalid data found' >&2; exit 1"])];
        let pipeline =
            DecodePipeline::spawn(&plan, queue.clone(), FrameFormat::VOICE, Box::new(|_| {})).unwrap();

        tokio::time::timeout(Duration::from_secs(5), async {
            while !queue.is_decoder_done() || pipeline.stderr_tail().is_none() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("decoder should exit");
        assert_eq!(pipeline.stderr_tail().as_deref(), Some("Invalid data found"));
    }
}
