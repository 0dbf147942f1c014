use dashmap::{mapref::entry::Entry, DashMap};
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::clock::{FrameClock, Wake};
use super::events::{EventBus, PlaybackError, PlayerEvent};
use super::frame::FrameFormat;
use super::pipeline::{DecodeCommandBuilder, DecodePipeline, FailureCallback, FfmpegCommandBuilder};
use super::queue::{Dequeued, FrameQueue};
use crate::config::{NoSubscriberBehavior, PlayerConfig};
use crate::error::{PlayerError, PlayerResult, TransportError};
use crate::sources::AudioResource;
use crate::transport::{
    AudioSink, AudioSourceFactory, ConnectionHandle, ConnectionId, LocalTrack, PublishOptions,
    TrackFactory,
};

/// Los fallos de captura se registran la primera vez y luego uno de cada
/// tantos.
const CAPTURE_WARN_EVERY: u64 = 50;

#[derive(Debug)]
pub enum PlayerState<T> {
    Idle,
    Buffering(Arc<AudioResource<T>>),
    Playing(Arc<AudioResource<T>>),
    Paused(Arc<AudioResource<T>>),
    AutoPaused(Arc<AudioResource<T>>),
}

impl<T> PlayerState<T> {
    pub fn status(&self) -> PlayerStatus {
        match self {
            PlayerState::Idle => PlayerStatus::Idle,
            PlayerState::Buffering(_) => PlayerStatus::Buffering,
            PlayerState::Playing(_) => PlayerStatus::Playing,
            PlayerState::Paused(_) => PlayerStatus::Paused,
            PlayerState::AutoPaused(_) => PlayerStatus::AutoPaused,
        }
    }

    pub fn resource(&self) -> Option<&Arc<AudioResource<T>>> {
        match self {
            PlayerState::Idle => None,
            PlayerState::Buffering(r)
            | PlayerState::Playing(r)
            | PlayerState::Paused(r)
            | PlayerState::AutoPaused(r) => Some(r),
        }
    }
}

impl<T> Clone for PlayerState<T> {
    fn clone(&self) -> Self {
        match self {
            PlayerState::Idle => PlayerState::Idle,
            PlayerState::Buffering(r) => PlayerState::Buffering(r.clone()),
            PlayerState::Playing(r) => PlayerState::Playing(r.clone()),
            PlayerState::Paused(r) => PlayerState::Paused(r.clone()),
            PlayerState::AutoPaused(r) => PlayerState::AutoPaused(r.clone()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PlayerStatus {
    Idle,
    Buffering,
    Playing,
    Paused,
    AutoPaused,
}

impl fmt::Display for PlayerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PlayerStatus::Idle => "idle",
            PlayerStatus::Buffering => "buffering",
            PlayerStatus::Playing => "playing",
            PlayerStatus::Paused => "paused",
            PlayerStatus::AutoPaused => "autopaused",
        };
        f.write_str(name)
    }
}

/// Contadores de la sesión actual. Todo en cero mientras está inactivo.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PlayerStats {
    pub frames_played: u64,
    pub buffer_underruns: u64,
    pub capture_failures: u64,
    pub queued_frames: usize,
    pub decoder_running: bool,
}

/// Todo lo que pertenece a la reproducción de un recurso. Se suelta al detener.
struct Session<T> {
    id: u64,
    resource: Arc<AudioResource<T>>,
    token: CancellationToken,
    queue: Arc<FrameQueue>,
    pipeline: Option<DecodePipeline>,
    sink: Option<Arc<dyn AudioSink>>,
    clock: FrameClock,
    starting: bool,
    capture_failures: u64,
}

impl<T> Session<T> {
    fn teardown(self) {
        self.token.cancel();
        if let Some(pipeline) = &self.pipeline {
            pipeline.kill();
        }
        self.queue.clear();
        self.resource.mark_ended();
    }
}

/// El track saliente, publicado una vez y reutilizado por cada recurso.
struct PublishedTrack {
    connection: ConnectionId,
    track: Arc<dyn LocalTrack>,
    source: Arc<dyn AudioSink>,
}

struct Shared<T> {
    config: PlayerConfig,
    format: FrameFormat,
    sources: Arc<dyn AudioSourceFactory>,
    tracks: Arc<dyn TrackFactory>,
    decoder: Arc<dyn DecodeCommandBuilder>,
    state: Mutex<PlayerState<T>>,
    session: Mutex<Option<Session<T>>>,
    subscribers: DashMap<ConnectionId, Arc<dyn ConnectionHandle>>,
    published: tokio::sync::Mutex<Option<PublishedTrack>>,
    track_published: AtomicBool,
    next_session: AtomicU64,
    clock_epoch: AtomicU64,
    events: EventBus<T>,
}

/// Reproduce [`AudioResource`]s en una sesión de voz en tiempo real a un
/// ritmo fijo de 20 ms.
///
/// Clonarlo es barato y todos los clones controlan el mismo reproductor.
/// Las operaciones que pueden lanzar trabajo (`play`, `subscribe`,
/// `unpause`, ...) deben llamarse dentro de un runtime de tokio.
pub struct AudioPlayer<T = ()> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for AudioPlayer<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T: Send + Sync + 'static> AudioPlayer<T> {
    pub fn new(
        config: PlayerConfig,
        sources: Arc<dyn AudioSourceFactory>,
        tracks: Arc<dyn TrackFactory>,
    ) -> Self {
        let decoder = FfmpegCommandBuilder::new(
            config.ytdlp_path.to_string_lossy(),
            config.ffmpeg_path.to_string_lossy(),
        );
        Self::with_decoder(config, sources, tracks, Arc::new(decoder))
    }

    /// Igual que [`AudioPlayer::new`] con un plan de decodificación propio.
    pub fn with_decoder(
        config: PlayerConfig,
        sources: Arc<dyn AudioSourceFactory>,
        tracks: Arc<dyn TrackFactory>,
        decoder: Arc<dyn DecodeCommandBuilder>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                format: config.frame_format(),
                config,
                sources,
                tracks,
                decoder,
                state: Mutex::new(PlayerState::Idle),
                session: Mutex::new(None),
                subscribers: DashMap::new(),
                published: tokio::sync::Mutex::new(None),
                track_published: AtomicBool::new(false),
                next_session: AtomicU64::new(0),
                clock_epoch: AtomicU64::new(0),
                events: EventBus::new(),
            }),
        }
    }

    /// Reproduce `resource`, reemplazando lo que estuviera sonando.
    ///
    /// El reproductor entra en Buffering de inmediato. La decodificación
    /// arranca en la primera conexión suscrita con sala lista, o más tarde
    /// vía [`AudioPlayer::on_connection_ready`].
    pub fn play(&self, resource: Arc<AudioResource<T>>) {
        self.stop(true);

        let id = self.shared.next_session.fetch_add(1, Ordering::Relaxed) + 1;
        info!("🎵 Reproduciendo: {}", resource.input());
        let session = Session {
            id,
            resource: resource.clone(),
            token: CancellationToken::new(),
            queue: Arc::new(FrameQueue::new(self.shared.config.max_buffer_frames)),
            pipeline: None,
            sink: None,
            clock: FrameClock::new(self.shared.config.clock_settings(), Instant::now()),
            starting: false,
            capture_failures: 0,
        };
        let (old, displaced) = {
            let mut state = self.shared.state.lock();
            let displaced = self.shared.session.lock().replace(session);
            let old = std::mem::replace(&mut *state, PlayerState::Buffering(resource.clone()));
            (old, displaced)
        };
        // Otro play concurrente pudo instalar su sesión tras nuestro stop.
        if let Some(displaced) = displaced {
            displaced.teardown();
        }
        self.announce(old, PlayerState::Buffering(resource));

        match self.first_ready_connection() {
            Some(connection) => {
                self.begin_startup(id, connection);
            }
            None => info!("⏳ Esperando una conexión lista para reproducir"),
        }
    }

    /// Playing → Paused. El decodificador sigue llenando la cola.
    pub fn pause(&self) -> bool {
        let paused = self.transition(|state| match state {
            PlayerState::Playing(r) => Some(PlayerState::Paused(r.clone())),
            _ => None,
        });
        if paused {
            info!("⏸️ Reproducción pausada");
        }
        paused
    }

    /// Paused o AutoPaused → Playing.
    pub fn unpause(&self) -> bool {
        let resumed = self.transition(|state| match state {
            PlayerState::Paused(r) | PlayerState::AutoPaused(r) => {
                Some(PlayerState::Playing(r.clone()))
            }
            _ => None,
        });
        if resumed {
            info!("▶️ Reproducción reanudada");
        }
        resumed
    }

    /// Mata el decodificador, descarta el audio en cola y los contadores y
    /// pasa a Idle.
    ///
    /// Sin `force` no hace nada si ya está inactivo. El track publicado se
    /// mantiene para el siguiente recurso.
    pub fn stop(&self, force: bool) -> bool {
        if !force && self.status() == PlayerStatus::Idle {
            return false;
        }
        let stopped = self.end_session(None);
        if stopped {
            info!("⏹️ Reproducción detenida");
        }
        stopped
    }

    /// Agrega una conexión. Retorna false si ya estaba suscrita.
    pub fn subscribe(&self, connection: Arc<dyn ConnectionHandle>) -> bool {
        let id = connection.id();
        match self.shared.subscribers.entry(id) {
            Entry::Occupied(_) => return false,
            Entry::Vacant(slot) => {
                slot.insert(connection.clone());
            }
        }
        debug!("🔗 Conexión suscrita: {}", id);

        if connection.room().is_some() {
            self.on_connection_ready(connection);
        }
        true
    }

    /// Quita una conexión. Retorna false si no estaba suscrita.
    pub fn unsubscribe(&self, id: ConnectionId) -> bool {
        if self.shared.subscribers.remove(&id).is_none() {
            return false;
        }
        debug!("🔌 Conexión desuscrita: {}", id);

        if self.shared.subscribers.is_empty() && self.status() == PlayerStatus::Playing {
            match self.shared.config.no_subscriber_behavior {
                NoSubscriberBehavior::Pause => {
                    if self.transition(|state| match state {
                        PlayerState::Playing(r) => Some(PlayerState::AutoPaused(r.clone())),
                        _ => None,
                    }) {
                        info!("⏸️ Sin oyentes, reproducción en pausa automática");
                    }
                }
                NoSubscriberBehavior::Play => {
                    debug!("Sin oyentes, la reproducción continúa");
                }
                NoSubscriberBehavior::Stop => {
                    info!("Sin oyentes, deteniendo reproducción");
                    self.stop(true);
                }
            }
        }
        true
    }

    /// Avisa que la sala de una conexión suscrita ya está disponible.
    ///
    /// Si el reproductor espera en Buffering, arranca ahí el recurso
    /// pendiente. Retorna si se lanzó un arranque.
    pub fn on_connection_ready(&self, connection: Arc<dyn ConnectionHandle>) -> bool {
        if !self.shared.subscribers.contains_key(&connection.id()) || connection.room().is_none() {
            return false;
        }
        if self.status() != PlayerStatus::Buffering {
            return false;
        }
        let pending = self
            .shared
            .session
            .lock()
            .as_ref()
            .filter(|session| !session.starting)
            .map(|session| session.id);

        match pending {
            Some(id) => self.begin_startup(id, connection),
            None => false,
        }
    }

    pub fn state(&self) -> PlayerState<T> {
        self.shared.state.lock().clone()
    }

    pub fn status(&self) -> PlayerStatus {
        self.shared.state.lock().status()
    }

    pub fn current_resource(&self) -> Option<Arc<AudioResource<T>>> {
        self.shared.state.lock().resource().cloned()
    }

    pub fn stats(&self) -> PlayerStats {
        match self.shared.session.lock().as_ref() {
            Some(session) => PlayerStats {
                frames_played: session.clock.frames_played(),
                buffer_underruns: session.clock.buffer_underruns(),
                capture_failures: session.capture_failures,
                queued_frames: session.queue.len(),
                decoder_running: session
                    .pipeline
                    .as_ref()
                    .is_some_and(DecodePipeline::is_running),
            },
            None => PlayerStats::default(),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.shared.subscribers.len()
    }

    pub fn has_published_track(&self) -> bool {
        self.shared.track_published.load(Ordering::Acquire)
    }

    /// Nombre del track saliente y la conexión donde se publicó.
    pub async fn published_track(&self) -> Option<(String, ConnectionId)> {
        self.shared
            .published
            .lock()
            .await
            .as_ref()
            .map(|published| (published.track.name().to_string(), published.connection))
    }

    /// Nuevo oyente de cambios de estado y errores de reproducción.
    pub fn events(&self) -> flume::Receiver<PlayerEvent<T>> {
        self.shared.events.subscribe()
    }

    /// Punto de cambio de estado. `next` ve el estado actual y retorna el
    /// nuevo, o `None` para dejarlo igual.
    fn transition(&self, next: impl FnOnce(&PlayerState<T>) -> Option<PlayerState<T>>) -> bool {
        let (old, new) = {
            let mut state = self.shared.state.lock();
            let Some(new) = next(&state) else {
                return false;
            };
            let old = std::mem::replace(&mut *state, new.clone());
            (old, new)
        };
        self.announce(old, new);
        true
    }

    /// Emite el cambio ya aplicado y arranca el reloj al entrar en Playing.
    fn announce(&self, old: PlayerState<T>, new: PlayerState<T>) {
        debug!("🔄 Estado: {} → {}", old.status(), new.status());
        let entering_playing =
            new.status() == PlayerStatus::Playing && old.status() != PlayerStatus::Playing;
        self.shared
            .events
            .emit(PlayerEvent::StateChange { old, new });
        if entering_playing {
            self.start_clock();
        }
    }

    fn is_current(&self, session_id: u64) -> bool {
        self.shared
            .session
            .lock()
            .as_ref()
            .is_some_and(|session| session.id == session_id)
    }

    fn first_ready_connection(&self) -> Option<Arc<dyn ConnectionHandle>> {
        self.shared
            .subscribers
            .iter()
            .find(|entry| entry.value().room().is_some())
            .map(|entry| entry.value().clone())
    }

    /// Desmonta la sesión (solo `expected`, si se indica) y pasa a Idle.
    ///
    /// Retirar la sesión y cambiar el estado ocurren bajo los mismos locks
    /// (estado → sesión), así una sesión nueva nunca queda huérfana.
    fn end_session(&self, expected: Option<u64>) -> bool {
        let (session, left) = {
            let mut state = self.shared.state.lock();
            let mut guard = self.shared.session.lock();
            if let Some(id) = expected {
                if guard.as_ref().map(|session| session.id) != Some(id) {
                    return false;
                }
            }
            let session = guard.take();
            drop(guard);
            self.shared.clock_epoch.fetch_add(1, Ordering::SeqCst);

            let left = if matches!(*state, PlayerState::Idle) {
                None
            } else {
                Some(std::mem::replace(&mut *state, PlayerState::Idle))
            };
            (session, left)
        };

        let had_session = session.is_some();
        if let Some(session) = session {
            debug!("Sesión {} finalizada", session.id);
            session.teardown();
        }
        let changed = left.is_some();
        if let Some(old) = left {
            self.announce(old, PlayerState::Idle);
        }
        had_session || changed
    }

    /// Reporta un fallo de `session_id` y la detiene. Las sesiones antiguas
    /// se ignoran.
    fn fail_session(&self, session_id: u64, error: PlayerError) {
        let resource = match self.shared.session.lock().as_ref() {
            Some(session) if session.id == session_id => session.resource.clone(),
            _ => {
                debug!("Error de una sesión antigua ignorado: {}", error);
                return;
            }
        };

        error!("❌ Error reproduciendo {}: {}", resource.input(), error);
        self.shared
            .events
            .emit(PlayerEvent::Error(PlaybackError::new(error, resource)));
        self.end_session(Some(session_id));
    }

    /// Lo que el decodificador invoca si falla la lectura en plena reproducción.
    fn failure_callback(&self, session_id: u64) -> FailureCallback {
        let player = self.clone();
        Box::new(move |error| player.fail_session(session_id, error))
    }

    fn begin_startup(&self, session_id: u64, connection: Arc<dyn ConnectionHandle>) -> bool {
        {
            let mut guard = self.shared.session.lock();
            match guard.as_mut() {
                Some(session) if session.id == session_id && !session.starting => {
                    session.starting = true;
                }
                _ => return false,
            }
        }
        debug!("🚀 Iniciando sesión {} en {}", session_id, connection.id());
        tokio::spawn(self.clone().startup(session_id, connection));
        true
    }

    async fn startup(self, session_id: u64, connection: Arc<dyn ConnectionHandle>) {
        match self.prepare(session_id, connection).await {
            Ok(true) => {
                let playing = self.transition(|state| match state {
                    PlayerState::Buffering(r) if self.is_current(session_id) => {
                        Some(PlayerState::Playing(r.clone()))
                    }
                    _ => None,
                });
                if playing {
                    debug!("Buffer listo: {} frames", self.stats().queued_frames);
                }
            }
            Ok(false) => debug!("Arranque de la sesión {} cancelado", session_id),
            Err(error) => self.fail_session(session_id, error),
        }
    }

    /// Publica el track si hace falta, lanza el decodificador y espera el
    /// buffer inicial. `Ok(false)` significa que la sesión ya no existe.
    async fn prepare(&self, session_id: u64, connection: Arc<dyn ConnectionHandle>) -> PlayerResult<bool> {
        let sink = self.ensure_published(connection.as_ref()).await?;

        let (resource, queue, token) = match self.shared.session.lock().as_ref() {
            Some(session) if session.id == session_id => (
                session.resource.clone(),
                session.queue.clone(),
                session.token.clone(),
            ),
            _ => return Ok(false),
        };

        let plan = self.shared.decoder.build(resource.input(), self.shared.format);
        let pipeline = DecodePipeline::spawn(
            &plan,
            queue.clone(),
            self.shared.format,
            self.failure_callback(session_id),
        )?;

        {
            let mut guard = self.shared.session.lock();
            match guard.as_mut() {
                Some(session) if session.id == session_id => {
                    session.pipeline = Some(pipeline);
                    session.sink = Some(sink);
                }
                // Soltar el pipeline lo mata.
                _ => return Ok(false),
            }
        }

        self.wait_for_buffer(session_id, &queue, &token).await
    }

    async fn ensure_published(&self, connection: &dyn ConnectionHandle) -> PlayerResult<Arc<dyn AudioSink>> {
        let mut published = self.shared.published.lock().await;
        if let Some(track) = published.as_ref() {
            return Ok(track.source.clone());
        }

        let room = connection.room().ok_or_else(|| {
            PlayerError::TrackPublishFailed(TransportError::new(format!(
                "{} has no room",
                connection.id()
            )))
        })?;
        let format = self.shared.format;
        let source = self
            .shared
            .sources
            .create_source(format.sample_rate, format.channels);
        let track = self
            .shared
            .tracks
            .track_from_source(&self.shared.config.track_name, source.clone());

        room.local_participant()
            .publish_track(track.clone(), PublishOptions::default())
            .await
            .map_err(PlayerError::TrackPublishFailed)?;

        info!("📡 Track '{}' publicado en {}", track.name(), connection.id());
        *published = Some(PublishedTrack {
            connection: connection.id(),
            track,
            source: source.clone(),
        });
        self.shared.track_published.store(true, Ordering::Release);
        Ok(source)
    }

    async fn wait_for_buffer(
        &self,
        session_id: u64,
        queue: &FrameQueue,
        token: &CancellationToken,
    ) -> PlayerResult<bool> {
        let config = &self.shared.config;
        let deadline = Instant::now() + config.startup_timeout;

        loop {
            if token.is_cancelled() {
                return Ok(false);
            }

            let buffered = queue.len();
            let done = queue.is_decoder_done();
            if buffered >= config.min_buffer_frames || (done && buffered > 0) {
                return Ok(true);
            }
            if done {
                return Err(PlayerError::DecodeProducedNoData {
                    stderr: self.decoder_stderr(session_id),
                });
            }
            if Instant::now() >= deadline {
                if buffered == 0 {
                    return Err(PlayerError::DecodeTimeout {
                        timeout: config.startup_timeout,
                    });
                }
                warn!(
                    "⚠️ Buffer incompleto tras {}: {}/{} frames, iniciando igualmente",
                    humantime::format_duration(config.startup_timeout),
                    buffered,
                    config.min_buffer_frames
                );
                return Ok(true);
            }

            tokio::select! {
                _ = token.cancelled() => return Ok(false),
                _ = tokio::time::sleep(config.startup_poll_interval) => {}
            }
        }
    }

    fn decoder_stderr(&self, session_id: u64) -> Option<String> {
        self.shared
            .session
            .lock()
            .as_ref()
            .filter(|session| session.id == session_id)
            .and_then(|session| session.pipeline.as_ref())
            .and_then(DecodePipeline::stderr_tail)
    }

    /// Arma una tarea de reloj nueva. Subir la época retira cualquier anterior.
    fn start_clock(&self) {
        let epoch = self.shared.clock_epoch.fetch_add(1, Ordering::SeqCst) + 1;
        let session_id = {
            let mut guard = self.shared.session.lock();
            let Some(session) = guard.as_mut() else {
                return;
            };
            session.clock.resume(Instant::now());
            session.resource.mark_started();
            session.id
        };
        tokio::spawn(self.clone().run_clock(session_id, epoch));
    }

    fn clock_is_live(&self, epoch: u64) -> bool {
        self.shared.clock_epoch.load(Ordering::SeqCst) == epoch
            && self.status() == PlayerStatus::Playing
    }

    async fn run_clock(self, session_id: u64, epoch: u64) {
        let (resource, queue, sink, token) = match self.shared.session.lock().as_ref() {
            Some(session) if session.id == session_id => (
                session.resource.clone(),
                session.queue.clone(),
                session.sink.clone(),
                session.token.clone(),
            ),
            _ => return,
        };

        loop {
            if !self.clock_is_live(epoch) {
                return;
            }

            let wake = match self.shared.session.lock().as_ref() {
                Some(session) if session.id == session_id => session.clock.wake(Instant::now()),
                _ => return,
            };
            match wake {
                Wake::At(at) => {
                    tokio::select! {
                        _ = token.cancelled() => return,
                        _ = tokio::time::sleep_until(at) => {}
                    }
                }
                Wake::Now => tokio::task::yield_now().await,
            }

            if !self.clock_is_live(epoch) {
                return;
            }

            match queue.pop() {
                Dequeued::Frame {
                    frame,
                    remaining,
                    decoder_done,
                } => {
                    let frame = frame.with_volume(resource.volume());
                    let failure = match &sink {
                        Some(sink) => sink.capture_frame(&frame).await.err(),
                        None => None,
                    };

                    let mut guard = self.shared.session.lock();
                    let Some(session) = guard.as_mut().filter(|session| session.id == session_id) else {
                        return;
                    };
                    session.clock.frame_sent(remaining, decoder_done);
                    if let Some(e) = failure {
                        session.capture_failures += 1;
                        let failures = session.capture_failures;
                        if failures == 1 || failures % CAPTURE_WARN_EVERY == 0 {
                            warn!(
                                "⚠️ {} ({} fallos en esta sesión)",
                                PlayerError::FrameCaptureFailure(e),
                                failures
                            );
                        }
                    }
                }
                Dequeued::Drained => {
                    info!(
                        "✅ Reproducción terminada: {} ({} frames)",
                        resource.input(),
                        self.stats().frames_played
                    );
                    self.end_session(Some(session_id));
                    return;
                }
                Dequeued::Starved => {
                    let mut guard = self.shared.session.lock();
                    let Some(session) = guard.as_mut().filter(|session| session.id == session_id) else {
                        return;
                    };
                    session.clock.starved(Instant::now());
                    debug!(
                        "Buffer vacío, reintentando ({} underruns)",
                        session.clock.buffer_underruns()
                    );
                }
            }
        }
    }
}
