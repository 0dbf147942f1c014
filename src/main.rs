use anyhow::Result;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use open_music_player::transport::loopback::{
    LoopbackConnection, LoopbackSourceFactory, LoopbackTrackFactory,
};
use open_music_player::{
    AudioPlayer, AudioResource, PlayerConfig, PlayerEvent, PlayerState, ProbeInfo, Prober,
    ResourceOptions,
};

const USAGE: &str = "Uso: open-music-player <url | búsqueda | archivo> | --health-check";

fn main() -> Result<()> {
    // Inicializar logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("open_music_player=debug".parse()?),
        )
        .init();

    info!("🎵 Iniciando Open Music Player v{}", env!("CARGO_PKG_VERSION"));

    // Cargar configuración
    let config = PlayerConfig::from_env()?;
    info!("{}", config.summary());

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(config.worker_threads)
        .enable_all()
        .build()?;

    runtime.block_on(run(config))
}

async fn run(config: PlayerConfig) -> Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();

    // Manejar health check si es necesario
    if args.iter().any(|arg| arg == "--health-check") {
        return health_check(&config).await;
    }

    let query = args.join(" ");
    if query.trim().is_empty() {
        anyhow::bail!(USAGE);
    }

    let resource = Arc::new(resolve(&config, &query).await?);

    let sources = Arc::new(LoopbackSourceFactory::default());
    let player: AudioPlayer<Option<ProbeInfo>> =
        AudioPlayer::new(config, sources.clone(), Arc::new(LoopbackTrackFactory));
    let events = player.events();

    player.subscribe(Arc::new(LoopbackConnection::ready(1)));
    player.play(resource);

    // Manejar shutdown graceful
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);
    let mut progress = tokio::time::interval(Duration::from_secs(5));
    let mut failed = false;

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                info!("⚠️ Señal de shutdown recibida, deteniendo...");
                player.stop(true);
                break;
            }
            event = events.recv_async() => match event {
                Ok(PlayerEvent::StateChange { new: PlayerState::Idle, .. }) | Err(_) => break,
                Ok(PlayerEvent::StateChange { old, new }) => {
                    info!("🔄 {} → {}", old.status(), new.status());
                }
                Ok(PlayerEvent::Error(failure)) => {
                    error!("❌ {} ({})", failure.message, failure.resource.input());
                    failed = true;
                }
            },
            _ = progress.tick() => {
                let stats = player.stats();
                if stats.frames_played > 0 {
                    info!(
                        "📊 {} frames, {} underruns, {} en cola",
                        stats.frames_played, stats.buffer_underruns, stats.queued_frames
                    );
                }
            }
        }
    }

    let captured: u64 = sources.sinks().iter().map(|sink| sink.frames_captured()).sum();
    println!(
        "Frames enviados: {} ({})",
        captured,
        humantime::format_duration(Duration::from_millis(captured * 20))
    );

    if failed {
        anyhow::bail!("La reproducción falló");
    }
    Ok(())
}

/// Los archivos locales se reproducen tal cual; el resto se resuelve antes con yt-dlp.
async fn resolve(config: &PlayerConfig, query: &str) -> Result<AudioResource<Option<ProbeInfo>>> {
    if Path::new(query).exists() {
        info!("📁 Archivo local: {}", query);
        return Ok(AudioResource::create(query, ResourceOptions::new(None))?);
    }

    let prober = Prober::new(&config.ytdlp_path).with_timeout(config.probe_timeout);
    let info = prober.probe(query).await?;
    match info.duration {
        Some(duration) => info!("🎶 {} [{}]", info.title, humantime::format_duration(duration)),
        None if info.is_live => info!("🔴 {} [en vivo]", info.title),
        None => warn!("🎶 {} [duración desconocida]", info.title),
    }
    let url = info.url.clone();
    Ok(AudioResource::create(url, ResourceOptions::new(Some(info)))?)
}

async fn health_check(config: &PlayerConfig) -> Result<()> {
    // Verificar dependencias críticas
    let yt_dlp = async_process::Command::new(&config.ytdlp_path)
        .arg("--version")
        .output()
        .await?;

    let ffmpeg = async_process::Command::new(&config.ffmpeg_path)
        .arg("-version")
        .output()
        .await?;

    if yt_dlp.status.success() && ffmpeg.status.success() {
        println!("OK");
        Ok(())
    } else {
        anyhow::bail!("Dependencias faltantes");
    }
}
