//! Audio sink contract.
//!
//! A sink accepts raw PCM buffers and drives them out; `play` is a blocking
//! transfer, so the caller's buffer is free for reuse the moment it returns.
//! `close` on a sink that never started is not an error: the sink holds no
//! handle worth leaking, so teardown is idempotent by design.

use thiserror::Error;

/// Errors reported by the sink layer.
#[derive(Debug, Error)]
pub enum SinkError {
    #[error("audio sink is already running")]
    AlreadyRunning,
    #[error("audio sink is not running")]
    NotRunning,
    #[error("empty buffer")]
    EmptyBuffer,
    #[error("unsupported PCM format: {0} bits per sample")]
    UnsupportedFormat(u16),
    #[error("sink init failed: {0}")]
    InitFailed(String),
    #[error("transfer failed: {0}")]
    TransferFailed(String),
}

/// PCM stream geometry a sink is started with.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SinkFormat {
    pub channels: u16,
    pub sample_rate_hz: u32,
    pub bits_per_sample: u16,
}

impl SinkFormat {
    pub fn bytes_per_frame(&self) -> usize {
        usize::from(self.channels) * usize::from(self.bits_per_sample / 8).max(1)
    }
}

/// Capability interface over an audio output peripheral.
pub trait AudioSink {
    /// Bring the output to a ready state for the given stream geometry.
    fn start(&mut self, format: SinkFormat) -> Result<(), SinkError>;

    /// Transfer `pcm` out, blocking until the sink has accepted all of it.
    fn play(&mut self, pcm: &[u8]) -> Result<(), SinkError>;

    /// Drain anything still queued, then tear down. Idempotent.
    fn close(&mut self) -> Result<(), SinkError>;
}

/// Test/simulation sink that records every chunk it is handed.
#[derive(Default)]
pub struct CaptureSink {
    format: Option<SinkFormat>,
    chunks: Vec<Vec<u8>>,
    closes: usize,
}

impl CaptureSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn format(&self) -> Option<SinkFormat> {
        self.format
    }

    pub fn chunks(&self) -> &[Vec<u8>] {
        &self.chunks
    }

    /// Everything played, concatenated in order.
    pub fn bytes(&self) -> Vec<u8> {
        self.chunks.concat()
    }

    pub fn close_count(&self) -> usize {
        self.closes
    }
}

impl AudioSink for CaptureSink {
    fn start(&mut self, format: SinkFormat) -> Result<(), SinkError> {
        if self.format.is_some() {
            return Err(SinkError::AlreadyRunning);
        }
        self.format = Some(format);
        Ok(())
    }

    fn play(&mut self, pcm: &[u8]) -> Result<(), SinkError> {
        if self.format.is_none() {
            return Err(SinkError::NotRunning);
        }
        if pcm.is_empty() {
            return Err(SinkError::EmptyBuffer);
        }
        self.chunks.push(pcm.to_vec());
        Ok(())
    }

    fn close(&mut self) -> Result<(), SinkError> {
        self.format = None;
        self.closes += 1;
        Ok(())
    }
}
