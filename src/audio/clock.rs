use std::time::Duration;
use tokio::time::Instant;

/// Antelación con la que se arma el timer, para entregar el frame a tiempo
/// pese a la granularidad del timer.
pub const TIMER_LEAD: Duration = Duration::from_millis(1);

/// Retardo extra por frame mientras el buffer está bajo.
pub const LOW_BUFFER_DAMPING: Duration = Duration::from_millis(1);

#[derive(Debug, Clone, Copy)]
pub struct ClockSettings {
    pub frame_interval: Duration,
    pub low_buffer_frames: usize,
    pub underrun_recovery: Duration,
}

impl Default for ClockSettings {
    fn default() -> Self {
        Self {
            frame_interval: Duration::from_millis(20),
            low_buffer_frames: 10,
            underrun_recovery: Duration::from_millis(50),
        }
    }
}

/// Cuándo debe volver a correr el bucle de reproducción.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wake {
    /// Armar un timer para este instante.
    At(Instant),
    /// En hora o atrasado: seguir sin timer.
    Now,
}

/// Estado de ritmo de una sesión de reproducción.
///
/// El deadline solo avanza: un intervalo por frame, el amortiguado con el
/// buffer bajo y el retardo de recuperación tras un underrun.
#[derive(Debug, Clone)]
pub struct FrameClock {
    settings: ClockSettings,
    next_frame_time: Instant,
    frames_played: u64,
    buffer_underruns: u64,
}

impl FrameClock {
    pub fn new(settings: ClockSettings, now: Instant) -> Self {
        Self {
            settings,
            next_frame_time: now,
            frames_played: 0,
            buffer_underruns: 0,
        }
    }

    pub fn wake(&self, now: Instant) -> Wake {
        let delay = self.next_frame_time.saturating_duration_since(now);
        if delay > TIMER_LEAD {
            Wake::At(self.next_frame_time - TIMER_LEAD)
        } else {
            Wake::Now
        }
    }

    /// Contabiliza un frame entregado al sink.
    pub fn frame_sent(&mut self, remaining: usize, decoder_done: bool) {
        self.frames_played += 1;
        self.next_frame_time += self.settings.frame_interval;
        if remaining < self.settings.low_buffer_frames && !decoder_done {
            self.next_frame_time += LOW_BUFFER_DAMPING;
            self.buffer_underruns += 1;
        }
    }

    /// La cola estaba vacía con el decodificador aún en marcha.
    pub fn starved(&mut self, now: Instant) {
        self.buffer_underruns += 1;
        self.next_frame_time = self.next_frame_time.max(now) + self.settings.underrun_recovery;
    }

    /// Retoma el ritmo tras una pausa sin retroceder el deadline.
    pub fn resume(&mut self, now: Instant) {
        self.next_frame_time = self.next_frame_time.max(now);
    }

    pub fn next_frame_time(&self) -> Instant {
        self.next_frame_time
    }

    pub fn frames_played(&self) -> u64 {
        self.frames_played
    }

    pub fn buffer_underruns(&self) -> u64 {
        self.buffer_underruns
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const MS: Duration = Duration::from_millis(1);

    #[test]
    fn arms_timer_one_millisecond_early() {
        let start = Instant::now();
        let mut clock = FrameClock::new(ClockSettings::default(), start);
        clock.frame_sent(50, false);

        assert_eq!(clock.wake(start), Wake::At(start + 19 * MS));
    }

    #[test]
    fn behind_schedule_continues_immediately() {
        let start = Instant::now();
        let clock = FrameClock::new(ClockSettings::default(), start);
        assert_eq!(clock.wake(start), Wake::Now);
        assert_eq!(clock.wake(start + 100 * MS), Wake::Now);

        let mut almost = FrameClock::new(ClockSettings::default(), start);
        almost.frame_sent(50, false);
        assert_eq!(almost.wake(start + 19 * MS), Wake::Now);
    }

    #[test]
    fn low_buffer_adds_damping_only_while_decoding() {
        let start = Instant::now();
        let mut clock = FrameClock::new(ClockSettings::default(), start);

        clock.frame_sent(3, false);
        assert_eq!(clock.next_frame_time(), start + 21 * MS);
        assert_eq!(clock.buffer_underruns(), 1);

        clock.frame_sent(2, true);
        assert_eq!(clock.next_frame_time(), start + 41 * MS);
        assert_eq!(clock.buffer_underruns(), 1);
        assert_eq!(clock.frames_played(), 2);
    }

    #[test]
    fn starvation_rearms_within_recovery_delay() {
        let start = Instant::now();
        let mut clock = FrameClock::new(ClockSettings::default(), start);

        let late = start + 500 * MS;
        clock.starved(late);
        assert_eq!(clock.next_frame_time(), late + 50 * MS);
        assert_eq!(clock.wake(late), Wake::At(late + 49 * MS));
        assert_eq!(clock.buffer_underruns(), 1);
    }

    #[test]
    fn deadline_never_moves_backwards() {
        let start = Instant::now();
        let mut clock = FrameClock::new(ClockSettings::default(), start);
        let mut last = clock.next_frame_time();

        let steps: [(usize, bool, u32); 8] = [
            (40, false, 0),
            (2, false, 5),
            (0, true, 10),
            (1, false, 900),
            (30, false, 901),
            (0, false, 3),
            (5, true, 2000),
            (9, false, 2001),
        ];
        for (i, (remaining, done, at)) in steps.into_iter().enumerate() {
            let now = start + at * MS;
            match i % 3 {
                0 => clock.frame_sent(remaining, done),
                1 => clock.starved(now),
                _ => clock.resume(now),
            }
            assert!(clock.next_frame_time() >= last);
            last = clock.next_frame_time();
        }
    }
}
