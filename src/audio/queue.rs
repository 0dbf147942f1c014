use parking_lot::Mutex;
use std::collections::VecDeque;
use tokio::sync::Notify;

use super::frame::Frame;

/// Resultado de sacar el siguiente frame del jitter buffer.
#[derive(Debug)]
pub enum Dequeued {
    Frame {
        frame: Frame,
        remaining: usize,
        decoder_done: bool,
    },
    /// Cola vacía y decodificador terminado: fin natural del stream.
    Drained,
    /// Cola vacía con el decodificador todavía en marcha.
    Starved,
}

#[derive(Debug, Default)]
struct QueueInner {
    frames: VecDeque<Frame>,
    decoder_done: bool,
    pushed: u64,
}

/// FIFO acotada de frames decodificados, compartida por el pipeline
/// (único productor) y el reloj de frames (único consumidor).
///
/// Con la cola llena [`FrameQueue::push`] espera a que el reloj libere un
/// hueco, y mientras tanto el pipeline deja de leer del decodificador.
#[derive(Debug)]
pub struct FrameQueue {
    inner: Mutex<QueueInner>,
    space: Notify,
    capacity: usize,
}

impl FrameQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(QueueInner::default()),
            space: Notify::new(),
            capacity: capacity.max(1),
        }
    }

    /// Agrega un frame, esperando mientras la cola esté llena.
    pub async fn push(&self, frame: Frame) {
        let mut frame = Some(frame);
        loop {
            {
                let mut inner = self.inner.lock();
                if inner.frames.len() < self.capacity {
                    if let Some(frame) = frame.take() {
                        inner.frames.push_back(frame);
                        inner.pushed += 1;
                    }
                    return;
                }
            }
            self.space.notified().await;
        }
    }

    /// Agrega sin esperar; devuelve el frame si la cola está llena.
    #[cfg(test)]
    pub fn try_push(&self, frame: Frame) -> Result<(), Frame> {
        let mut inner = self.inner.lock();
        if inner.frames.len() >= self.capacity {
            return Err(frame);
        }
        inner.frames.push_back(frame);
        inner.pushed += 1;
        Ok(())
    }

    pub fn pop(&self) -> Dequeued {
        let mut inner = self.inner.lock();
        match inner.frames.pop_front() {
            Some(frame) => {
                let remaining = inner.frames.len();
                let decoder_done = inner.decoder_done;
                drop(inner);
                self.space.notify_one();
                Dequeued::Frame {
                    frame,
                    remaining,
                    decoder_done,
                }
            }
            None if inner.decoder_done => Dequeued::Drained,
            None => Dequeued::Starved,
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().frames.is_empty()
    }

    /// Total de frames aceptados, incluidos los ya reproducidos.
    pub fn pushed(&self) -> u64 {
        self.inner.lock().pushed
    }

    /// Marca que el decodificador cerró su salida; no llegarán más frames.
    pub fn mark_decoder_done(&self) {
        self.inner.lock().decoder_done = true;
    }

    pub fn is_decoder_done(&self) -> bool {
        self.inner.lock().decoder_done
    }

    pub fn clear(&self) {
        {
            let mut inner = self.inner.lock();
            inner.frames.clear();
            inner.decoder_done = false;
        }
        self.space.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::frame::FrameFormat;
    use pretty_assertions::assert_eq;
    use std::sync::Arc;
    use std::time::Duration;

    fn frame(marker: i16) -> Frame {
        let format = FrameFormat {
            sample_rate: 100,
            channels: 1,
            frame_duration: Duration::from_millis(20),
        };
        Frame::new(vec![marker, marker], format)
    }

    fn marker(dequeued: Dequeued) -> i16 {
        match dequeued {
            Dequeued::Frame { frame, .. } => frame.samples()[0],
            other => panic!("expected a frame, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn pops_in_fifo_order() {
        let queue = FrameQueue::new(8);
        for i in 0..3 {
            queue.push(frame(i)).await;
        }
        assert_eq!(marker(queue.pop()), 0);
        assert_eq!(marker(queue.pop()), 1);
        assert_eq!(marker(queue.pop()), 2);
        assert!(matches!(queue.pop(), Dequeued::Starved));
    }

    #[test]
    fn drained_only_after_decoder_done() {
        let queue = FrameQueue::new(4);
        queue.try_push(frame(1)).unwrap();
        queue.mark_decoder_done();
        assert!(!queue.is_empty());

        match queue.pop() {
            Dequeued::Frame {
                remaining,
                decoder_done,
                ..
            } => {
                assert_eq!(remaining, 0);
                assert!(decoder_done);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(queue.is_empty() && queue.is_decoder_done());
        assert!(matches!(queue.pop(), Dequeued::Drained));
    }

    #[test]
    fn try_push_refuses_beyond_capacity() {
        let queue = FrameQueue::new(2);
        assert!(queue.try_push(frame(1)).is_ok());
        assert!(queue.try_push(frame(2)).is_ok());
        let rejected = queue.try_push(frame(3)).unwrap_err();
        assert_eq!(rejected.samples()[0], 3);
        assert_eq!(queue.len(), 2);
    }

    #[tokio::test]
    async fn full_queue_applies_backpressure_until_pop() {
        let queue = Arc::new(FrameQueue::new(1));
        queue.push(frame(1)).await;

        let producer = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.push(frame(2)).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!producer.is_finished());
        assert_eq!(queue.len(), 1);

        assert_eq!(marker(queue.pop()), 1);
        tokio::time::timeout(Duration::from_secs(1), producer)
            .await
            .expect("producer should resume")
            .unwrap();
        assert_eq!(marker(queue.pop()), 2);
        assert_eq!(queue.pushed(), 2);
    }

    #[test]
    fn clear_resets_frames_and_done_flag() {
        let queue = FrameQueue::new(4);
        queue.try_push(frame(1)).unwrap();
        queue.mark_decoder_done();
        queue.clear();
        assert!(queue.is_empty());
        assert!(!queue.is_decoder_done());
    }
}
