//! CPAL output backend for [`AudioSink`].
//!
//! `start` picks a device and output config, builds the stream, and wires its
//! real-time callback to a bounded [`SampleQueue`]. The callback:
//! - refills a small local buffer from the queue without blocking
//! - applies basic channel mapping (mono↔stereo, best-effort otherwise)
//! - converts `f32` samples to the device sample format, silence on underrun
//!
//! `play` converts PCM bytes to `f32` and pushes them, blocking while the
//! queue is full; `close` drains what is queued before tearing down.

use std::sync::Arc;
use std::time::Duration;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};

use crate::queue::{SampleQueue, samples_for};
use crate::sink::{AudioSink, SinkError, SinkFormat};

/// Frames pulled from the queue per callback refill.
const REFILL_MAX_FRAMES: usize = 4096;

pub struct CpalSink {
    device_hint: Option<String>,
    buffer_seconds: f32,
    running: Option<Running>,
}

struct Running {
    queue: Arc<SampleQueue>,
    _stream: cpal::Stream,
    bits_per_sample: u16,
    samples: Vec<f32>,
}

impl CpalSink {
    /// `device_hint` selects an output device by case-insensitive substring;
    /// `None` means the host default.
    pub fn new(device_hint: Option<String>, buffer_seconds: f32) -> Self {
        Self {
            device_hint,
            buffer_seconds,
            running: None,
        }
    }
}

impl AudioSink for CpalSink {
    fn start(&mut self, format: SinkFormat) -> Result<(), SinkError> {
        if self.running.is_some() {
            return Err(SinkError::AlreadyRunning);
        }
        if !matches!(format.bits_per_sample, 8 | 16) {
            return Err(SinkError::UnsupportedFormat(format.bits_per_sample));
        }

        let host = cpal::default_host();
        let device = pick_device(&host, self.device_hint.as_deref())?;
        let device_name = device
            .description()
            .map(|d| d.to_string())
            .unwrap_or_else(|_| "unknown".into());

        let (rate, config) = pick_output_config(&device, format.sample_rate_hz)?;
        let stream_config: cpal::StreamConfig = config.clone().into();
        if rate != format.sample_rate_hz {
            // No resampler stage in this pipeline.
            tracing::warn!(
                source_rate_hz = format.sample_rate_hz,
                device_rate_hz = rate,
                "device rate differs from source; playback speed will be off"
            );
        }
        tracing::info!(
            device = %device_name,
            rate_hz = rate,
            channels = stream_config.channels,
            "output device ready"
        );

        let queue = Arc::new(SampleQueue::new(
            usize::from(format.channels),
            samples_for(rate, usize::from(format.channels), self.buffer_seconds),
        ));

        let stream = build_output_stream(&device, &stream_config, config.sample_format(), &queue)?;
        stream
            .play()
            .map_err(|e| SinkError::InitFailed(e.to_string()))?;

        self.running = Some(Running {
            queue,
            _stream: stream,
            bits_per_sample: format.bits_per_sample,
            samples: Vec::new(),
        });
        Ok(())
    }

    fn play(&mut self, pcm: &[u8]) -> Result<(), SinkError> {
        let running = self.running.as_mut().ok_or(SinkError::NotRunning)?;
        if pcm.is_empty() {
            return Err(SinkError::EmptyBuffer);
        }
        if running.queue.is_closed() {
            // The error callback closed the queue; fail before converting.
            return Err(SinkError::TransferFailed("output stream closed".into()));
        }
        pcm_to_f32(pcm, running.bits_per_sample, &mut running.samples);
        if !running.queue.push_blocking(&running.samples) {
            return Err(SinkError::TransferFailed("output stream closed".into()));
        }
        Ok(())
    }

    fn close(&mut self) -> Result<(), SinkError> {
        let Some(running) = self.running.take() else {
            return Ok(());
        };
        running.queue.close();
        let deadline = Duration::from_secs_f32(self.buffer_seconds.max(0.5) * 2.0 + 1.0);
        if !running.queue.wait_drained(deadline) {
            tracing::warn!("output queue did not drain before teardown");
        }
        // Let the device swallow its last buffer before the stream drops.
        std::thread::sleep(Duration::from_millis(100));
        Ok(())
    }
}

/// Convert little-endian PCM bytes to interleaved `f32` in `out`.
///
/// Supported depths are checked at `start`; a trailing odd byte on 16-bit
/// input is ignored.
fn pcm_to_f32(pcm: &[u8], bits_per_sample: u16, out: &mut Vec<f32>) {
    out.clear();
    match bits_per_sample {
        16 => {
            out.reserve(pcm.len() / 2);
            for pair in pcm.chunks_exact(2) {
                let v = i16::from_le_bytes([pair[0], pair[1]]);
                out.push(f32::from(v) / 32_768.0);
            }
        }
        8 => {
            out.reserve(pcm.len());
            for &b in pcm {
                out.push((f32::from(b) - 128.0) / 128.0);
            }
        }
        _ => {}
    }
}

/// Pick an output device by substring match, or the host default.
pub fn pick_device(host: &cpal::Host, needle: Option<&str>) -> Result<cpal::Device, SinkError> {
    if let Some(needle) = needle {
        let needle_lc = needle.trim().to_lowercase();
        let mut devices = host
            .output_devices()
            .map_err(|e| SinkError::InitFailed(e.to_string()))?;
        return devices
            .find(|d| {
                d.description()
                    .map(|n| n.name().to_lowercase().contains(&needle_lc))
                    .unwrap_or(false)
            })
            .ok_or_else(|| SinkError::InitFailed(format!("no output device matched: {needle}")));
    }
    host.default_output_device()
        .ok_or_else(|| SinkError::InitFailed("no default output device".into()))
}

/// Print available output devices to stdout (CLI UX, not structured output).
pub fn list_devices(host: &cpal::Host) -> Result<(), SinkError> {
    let devices = host
        .output_devices()
        .map_err(|e| SinkError::InitFailed(e.to_string()))?;
    for (i, d) in devices.enumerate() {
        match d.description() {
            Ok(desc) => println!("#{i}: {desc}"),
            Err(e) => println!("#{i}: <unavailable: {e}>"),
        }
    }
    Ok(())
}

/// Choose the supported config closest to `target_rate`.
fn pick_output_config(
    device: &cpal::Device,
    target_rate: u32,
) -> Result<(u32, cpal::SupportedStreamConfig), SinkError> {
    let ranges = device
        .supported_output_configs()
        .map_err(|e| SinkError::InitFailed(e.to_string()))?;

    let mut best: Option<(u32, cpal::SupportedStreamConfig)> = None;
    for range in ranges {
        let rate = target_rate.clamp(range.min_sample_rate(), range.max_sample_rate());
        let candidate = (rate, range.with_sample_rate(rate));
        let replace = match &best {
            None => true,
            Some((best_rate, _)) => rate.abs_diff(target_rate) < best_rate.abs_diff(target_rate),
        };
        if replace {
            best = Some(candidate);
        }
    }
    best.ok_or_else(|| SinkError::InitFailed("no supported output configs".into()))
}

fn build_output_stream(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    sample_format: cpal::SampleFormat,
    queue: &Arc<SampleQueue>,
) -> Result<cpal::Stream, SinkError> {
    match sample_format {
        cpal::SampleFormat::F32 => build_stream::<f32>(device, config, queue),
        cpal::SampleFormat::I16 => build_stream::<i16>(device, config, queue),
        cpal::SampleFormat::I32 => build_stream::<i32>(device, config, queue),
        cpal::SampleFormat::U16 => build_stream::<u16>(device, config, queue),
        other => Err(SinkError::InitFailed(format!(
            "unsupported sample format: {other:?}"
        ))),
    }
}

/// Type-specialized stream builder for the device sample format.
///
/// The callback drains the queue in bursts and never waits on a lock held
/// across a blocking operation; underruns become silence.
fn build_stream<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    queue: &Arc<SampleQueue>,
) -> Result<cpal::Stream, SinkError>
where
    T: cpal::Sample + cpal::SizedSample + cpal::FromSample<f32>,
{
    let dst_channels = usize::from(config.channels).max(1);
    let src_channels = queue.channels();
    let queue_cb = queue.clone();
    let queue_err = queue.clone();

    let mut local: Vec<f32> = Vec::new();
    let mut pos = 0usize;

    let err_fn = move |err| {
        tracing::warn!("stream error: {err}");
        // Unblock the producer; the sink reports the closed queue on the
        // next play call.
        queue_err.close();
    };

    let stream = device
        .build_output_stream(
            config,
            move |data: &mut [T], _| {
                let frames = data.len() / dst_channels;
                for frame in 0..frames {
                    if pos >= local.len() {
                        pos = 0;
                        if queue_cb.pop_up_to(REFILL_MAX_FRAMES * src_channels, &mut local) == 0 {
                            for slot in &mut data[frame * dst_channels..] {
                                *slot = <T as cpal::Sample>::from_sample::<f32>(0.0);
                            }
                            return;
                        }
                    }
                    for ch in 0..dst_channels {
                        let v = map_sample(&local, pos, src_channels, ch, dst_channels);
                        data[frame * dst_channels + ch] = <T as cpal::Sample>::from_sample::<f32>(v);
                    }
                    pos += src_channels;
                }
            },
            err_fn,
            None,
        )
        .map_err(|e| SinkError::InitFailed(e.to_string()))?;

    Ok(stream)
}

/// One output sample with basic channel mapping.
///
/// mono → any: duplicate channel 0; stereo → mono: average L/R; otherwise
/// clamp to the available source channels.
fn map_sample(
    src: &[f32],
    frame_start: usize,
    src_channels: usize,
    dst_ch: usize,
    dst_channels: usize,
) -> f32 {
    let get = |ch: usize| -> f32 {
        if ch < src_channels && frame_start + ch < src.len() {
            src[frame_start + ch]
        } else {
            0.0
        }
    };
    match (src_channels, dst_channels) {
        (1, _) => get(0),
        (2, 1) => 0.5 * (get(0) + get(1)),
        _ => get(dst_ch.min(src_channels.saturating_sub(1))),
    }
}
