use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::sync::Arc;

use super::player::PlayerState;
use crate::error::PlayerError;
use crate::sources::AudioResource;

/// Fallo de reproducción, etiquetado con el recurso que lo causó.
#[derive(Debug)]
pub struct PlaybackError<T> {
    pub message: String,
    pub error: Arc<PlayerError>,
    pub resource: Arc<AudioResource<T>>,
    pub occurred_at: DateTime<Utc>,
}

impl<T> PlaybackError<T> {
    pub fn new(error: PlayerError, resource: Arc<AudioResource<T>>) -> Self {
        Self {
            message: error.to_string(),
            error: Arc::new(error),
            resource,
            occurred_at: Utc::now(),
        }
    }
}

impl<T> Clone for PlaybackError<T> {
    fn clone(&self) -> Self {
        Self {
            message: self.message.clone(),
            error: self.error.clone(),
            resource: self.resource.clone(),
            occurred_at: self.occurred_at,
        }
    }
}

#[derive(Debug)]
pub enum PlayerEvent<T> {
    StateChange {
        old: PlayerState<T>,
        new: PlayerState<T>,
    },
    Error(PlaybackError<T>),
}

impl<T> Clone for PlayerEvent<T> {
    fn clone(&self) -> Self {
        match self {
            PlayerEvent::StateChange { old, new } => PlayerEvent::StateChange {
                old: old.clone(),
                new: new.clone(),
            },
            PlayerEvent::Error(error) => PlayerEvent::Error(error.clone()),
        }
    }
}

/// Reparte los eventos del reproductor entre sus oyentes. Los que soltaron
/// su receptor se descartan en el siguiente envío.
pub(crate) struct EventBus<T> {
    senders: Mutex<Vec<flume::Sender<PlayerEvent<T>>>>,
}

impl<T> EventBus<T> {
    pub fn new() -> Self {
        Self {
            senders: Mutex::new(Vec::new()),
        }
    }

    pub fn subscribe(&self) -> flume::Receiver<PlayerEvent<T>> {
        let (tx, rx) = flume::unbounded();
        self.senders.lock().push(tx);
        rx
    }

    pub fn emit(&self, event: PlayerEvent<T>) {
        self.senders
            .lock()
            .retain(|tx| tx.send(event.clone()).is_ok());
    }

    #[cfg(test)]
    pub fn listener_count(&self) -> usize {
        self.senders.lock().len()
    }
}
