use bytes::{Buf, BytesMut};
use std::time::Duration;

/// Forma del PCM que se pide al decodificador y que espera el transporte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameFormat {
    pub sample_rate: u32,
    pub channels: u16,
    pub frame_duration: Duration,
}

impl FrameFormat {
    /// 48 kHz estéreo en frames de 20 ms.
    pub const VOICE: FrameFormat = FrameFormat {
        sample_rate: 48_000,
        channels: 2,
        frame_duration: Duration::from_millis(20),
    };

    /// Muestras por canal en un frame (960 para [`FrameFormat::VOICE`]).
    pub fn samples_per_frame(&self) -> usize {
        (self.sample_rate as u128 * self.frame_duration.as_micros() / 1_000_000) as usize
    }

    /// Muestras intercaladas de un frame.
    pub fn samples_per_buffer(&self) -> usize {
        self.samples_per_frame() * self.channels as usize
    }

    /// Tamaño de un frame en bytes s16 little-endian.
    pub fn frame_bytes(&self) -> usize {
        self.samples_per_buffer() * 2
    }
}

impl Default for FrameFormat {
    fn default() -> Self {
        Self::VOICE
    }
}

/// Un trozo de PCM intercalado de duración fija.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    samples: Vec<i16>,
    format: FrameFormat,
}

impl Frame {
    pub fn new(samples: Vec<i16>, format: FrameFormat) -> Self {
        debug_assert_eq!(samples.len(), format.samples_per_buffer());
        Self { samples, format }
    }

    /// Decodifica un frame a partir de bytes s16le.
    pub fn from_le_bytes(bytes: &[u8], format: FrameFormat) -> Self {
        let samples = bytes
            .chunks_exact(2)
            .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
            .collect();
        Self::new(samples, format)
    }

    pub fn samples(&self) -> &[i16] {
        &self.samples
    }

    pub fn sample_rate(&self) -> u32 {
        self.format.sample_rate
    }

    pub fn channels(&self) -> u16 {
        self.format.channels
    }

    /// Escala cada muestra por `volume`; con ganancia 1 retorna el frame tal cual.
    pub fn with_volume(mut self, volume: f32) -> Self {
        if (volume - 1.0).abs() < f32::EPSILON {
            return self;
        }
        let gain = volume.clamp(0.0, 1.0);
        for sample in &mut self.samples {
            *sample = (*sample as f32 * gain).round() as i16;
        }
        self
    }
}

/// Convierte un stream s16le troceado de cualquier forma en frames completos.
///
/// Los bytes que no llenan un frame quedan como sobrante y se completan con
/// el siguiente trozo, así la secuencia de frames depende solo del stream
/// concatenado y nunca de dónde se cortó.
#[derive(Debug)]
pub struct FrameAssembler {
    format: FrameFormat,
    leftover: BytesMut,
}

impl FrameAssembler {
    pub fn new(format: FrameFormat) -> Self {
        Self {
            format,
            leftover: BytesMut::with_capacity(format.frame_bytes() * 2),
        }
    }

    pub fn push(&mut self, chunk: &[u8]) -> Vec<Frame> {
        self.leftover.extend_from_slice(chunk);

        let frame_bytes = self.format.frame_bytes();
        let mut frames = Vec::with_capacity(self.leftover.len() / frame_bytes);
        while self.leftover.len() >= frame_bytes {
            frames.push(Frame::from_le_bytes(&self.leftover[..frame_bytes], self.format));
            self.leftover.advance(frame_bytes);
        }
        frames
    }

    pub fn leftover(&self) -> &[u8] {
        &self.leftover
    }
}
