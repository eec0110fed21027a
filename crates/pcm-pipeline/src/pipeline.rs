//! Pipeline orchestrator: storage → codec → sink, one chunk at a time.
//!
//! Pull-based control flow bounds memory to a single reusable chunk buffer.
//! Teardown discipline is the point: resources unwind in reverse-acquisition
//! order on every path, so no failure leaves an open file or a running sink
//! behind. Secondary close failures are logged, never allowed to mask the
//! primary error.

use std::sync::atomic::{AtomicBool, Ordering};

use thiserror::Error;

use crate::config::PlaybackConfig;
use crate::sink::{AudioSink, SinkError, SinkFormat};
use crate::storage::{StorageDriver, StorageError};
use crate::wav::{CodecError, WavCodec};

/// Pipeline failures, attributed to the layer that reported them.
///
/// The orchestrator never reinterprets one layer's error as another's.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error(transparent)]
    Sink(#[from] SinkError),
}

/// Why playback ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PlaybackEnd {
    EndOfStream,
    /// The cooperative stop flag was observed between chunks.
    Stopped,
}

#[derive(Debug)]
pub struct PlaybackStats {
    pub bytes_played: u64,
    pub chunks: u64,
    pub end: PlaybackEnd,
}

/// Play one file end to end.
///
/// Sequence: `open_file` → `codec.open` → `sink.start` → decode/play loop →
/// `sink.close` → `codec.close` → `close_file`. The storage driver itself
/// stays open for subsequent files. A failed `codec.open` has already closed
/// the file inside the codec; every later failure unwinds sink, then codec,
/// then file.
///
/// `stop` is checked between chunks; mid-transfer cancellation is the
/// underlying driver's business, not this loop's.
pub fn play_file<S, A>(
    storage: &mut S,
    codec: &mut WavCodec,
    sink: &mut A,
    name: &str,
    config: &PlaybackConfig,
    stop: Option<&AtomicBool>,
) -> Result<PlaybackStats, PipelineError>
where
    S: StorageDriver + ?Sized,
    A: AudioSink + ?Sized,
{
    let handle = storage.open_file(name)?;

    let meta = match codec.open(storage, handle) {
        Ok(meta) => *meta,
        Err(e) => return Err(e.into()),
    };
    tracing::info!(
        file = name,
        channels = meta.channels,
        rate_hz = meta.sample_rate_hz,
        bits = meta.bits_per_sample,
        payload_bytes = meta.data_size,
        "wav stream ready"
    );

    let format = SinkFormat {
        channels: meta.channels,
        sample_rate_hz: meta.sample_rate_hz,
        bits_per_sample: meta.bits_per_sample,
    };
    if let Err(e) = sink.start(format) {
        release_codec_and_file(storage, codec);
        return Err(e.into());
    }

    let mut buf = vec![0u8; config.chunk_bytes.max(1)];
    let mut stats = PlaybackStats {
        bytes_played: 0,
        chunks: 0,
        end: PlaybackEnd::EndOfStream,
    };

    loop {
        if let Some(stop) = stop {
            if stop.load(Ordering::Relaxed) {
                tracing::info!(file = name, "stop requested");
                stats.end = PlaybackEnd::Stopped;
                break;
            }
        }

        let n = match codec.decode(storage, &mut buf) {
            Ok(n) => n,
            Err(e) => {
                unwind(storage, codec, sink);
                return Err(e.into());
            }
        };
        if n == 0 {
            break;
        }

        if let Err(e) = sink.play(&buf[..n]) {
            unwind(storage, codec, sink);
            return Err(e.into());
        }
        stats.bytes_played += n as u64;
        stats.chunks += 1;
    }

    // Normal teardown, still in reverse-acquisition order. A failing sink
    // close must not strand the codec session or the file handle.
    if let Err(e) = sink.close() {
        release_codec_and_file(storage, codec);
        return Err(e.into());
    }
    let mut handle = codec.close()?;
    storage.close_file(&mut handle)?;

    tracing::info!(
        file = name,
        bytes = stats.bytes_played,
        frames = stats.bytes_played / format.bytes_per_frame() as u64,
        chunks = stats.chunks,
        end = ?stats.end,
        "playback finished"
    );
    Ok(stats)
}

/// Error-path teardown: sink, then codec, then file.
fn unwind<S, A>(storage: &mut S, codec: &mut WavCodec, sink: &mut A)
where
    S: StorageDriver + ?Sized,
    A: AudioSink + ?Sized,
{
    if let Err(e) = sink.close() {
        tracing::warn!(error = %e, "sink close during unwind");
    }
    release_codec_and_file(storage, codec);
}

fn release_codec_and_file<S>(storage: &mut S, codec: &mut WavCodec)
where
    S: StorageDriver + ?Sized,
{
    match codec.close() {
        Ok(mut handle) => {
            if let Err(e) = storage.close_file(&mut handle) {
                tracing::warn!(error = %e, "file close during unwind");
            }
        }
        Err(e) => tracing::warn!(error = %e, "codec close during unwind"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::CaptureSink;
    use crate::storage::MemStorage;
    use std::sync::atomic::AtomicBool;

    fn wav_file(payload: &[u8]) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(44 + payload.len());
        bytes.extend_from_slice(b"RIFF");
        bytes.extend_from_slice(&(36 + payload.len() as u32).to_le_bytes());
        bytes.extend_from_slice(b"WAVE");
        bytes.extend_from_slice(b"fmt ");
        bytes.extend_from_slice(&16u32.to_le_bytes());
        bytes.extend_from_slice(&1u16.to_le_bytes());
        bytes.extend_from_slice(&1u16.to_le_bytes());
        bytes.extend_from_slice(&16_000u32.to_le_bytes());
        bytes.extend_from_slice(&32_000u32.to_le_bytes());
        bytes.extend_from_slice(&2u16.to_le_bytes());
        bytes.extend_from_slice(&16u16.to_le_bytes());
        bytes.extend_from_slice(b"data");
        bytes.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        bytes.extend_from_slice(payload);
        bytes
    }

    fn storage_with(name: &str, bytes: Vec<u8>) -> MemStorage {
        let mut storage = MemStorage::new();
        storage.insert_file(name, bytes);
        storage.open().unwrap();
        storage
    }

    /// Sink that fails on the nth play call; used to exercise unwinding.
    struct FailingSink {
        inner: CaptureSink,
        fail_on_chunk: u64,
        plays: u64,
    }

    impl AudioSink for FailingSink {
        fn start(&mut self, format: SinkFormat) -> Result<(), SinkError> {
            self.inner.start(format)
        }

        fn play(&mut self, pcm: &[u8]) -> Result<(), SinkError> {
            self.plays += 1;
            if self.plays >= self.fail_on_chunk {
                return Err(SinkError::TransferFailed("injected".into()));
            }
            self.inner.play(pcm)
        }

        fn close(&mut self) -> Result<(), SinkError> {
            self.inner.close()
        }
    }

    #[test]
    fn plays_whole_payload_and_releases_everything() {
        let payload: Vec<u8> = (0..100).collect();
        let mut storage = storage_with("track.wav", wav_file(&payload));
        let mut codec = WavCodec::new();
        let mut sink = CaptureSink::new();
        let config = PlaybackConfig {
            chunk_bytes: 16,
            buffer_seconds: 2.0,
        };

        let stats =
            play_file(&mut storage, &mut codec, &mut sink, "track.wav", &config, None).unwrap();

        assert_eq!(stats.bytes_played, 100);
        assert_eq!(stats.chunks, 7); // 6 full chunks + 4-byte tail
        assert_eq!(stats.end, PlaybackEnd::EndOfStream);
        assert_eq!(sink.bytes(), payload);
        assert_eq!(
            sink.format(),
            None, // closed after playback
        );
        assert!(!codec.is_open());
        assert!(!storage.has_open_file());

        // Driver stays open for the next file.
        assert!(storage.info().is_ok());
    }

    #[test]
    fn missing_file_surfaces_storage_error() {
        let mut storage = storage_with("other.wav", wav_file(&[1, 2]));
        let mut codec = WavCodec::new();
        let mut sink = CaptureSink::new();

        let err = play_file(
            &mut storage,
            &mut codec,
            &mut sink,
            "missing.wav",
            &PlaybackConfig::default(),
            None,
        )
        .unwrap_err();
        assert!(matches!(
            err,
            PipelineError::Storage(StorageError::OpenFile { .. })
        ));
        assert!(!storage.has_open_file());
    }

    #[test]
    fn invalid_header_unwinds_without_leaking_the_file() {
        let mut bytes = wav_file(&[1, 2, 3, 4]);
        bytes[0] = b'X';
        let mut storage = storage_with("bad.wav", bytes);
        let mut codec = WavCodec::new();
        let mut sink = CaptureSink::new();

        let err = play_file(
            &mut storage,
            &mut codec,
            &mut sink,
            "bad.wav",
            &PlaybackConfig::default(),
            None,
        )
        .unwrap_err();
        assert!(matches!(
            err,
            PipelineError::Codec(CodecError::InvalidFormat(_))
        ));
        assert!(!codec.is_open());
        assert!(!storage.has_open_file());
        assert!(sink.chunks().is_empty());
    }

    #[test]
    fn sink_failure_mid_loop_unwinds_codec_and_file() {
        let payload: Vec<u8> = (0..64).collect();
        let mut storage = storage_with("track.wav", wav_file(&payload));
        let mut codec = WavCodec::new();
        let mut sink = FailingSink {
            inner: CaptureSink::new(),
            fail_on_chunk: 2,
            plays: 0,
        };
        let config = PlaybackConfig {
            chunk_bytes: 16,
            buffer_seconds: 2.0,
        };

        let err = play_file(
            &mut storage,
            &mut codec,
            &mut sink,
            "track.wav",
            &config,
            None,
        )
        .unwrap_err();
        assert!(matches!(
            err,
            PipelineError::Sink(SinkError::TransferFailed(_))
        ));
        assert!(!codec.is_open());
        assert!(!storage.has_open_file());
        // First chunk made it out before the failure.
        assert_eq!(sink.inner.bytes(), &payload[..16]);
        assert_eq!(sink.inner.close_count(), 1);
    }

    #[test]
    fn unsupported_sink_format_unwinds_codec_and_file() {
        // 8-bit WAV with a sink that only accepts 16-bit.
        struct Sixteen(CaptureSink);
        impl AudioSink for Sixteen {
            fn start(&mut self, format: SinkFormat) -> Result<(), SinkError> {
                if format.bits_per_sample != 16 {
                    return Err(SinkError::UnsupportedFormat(format.bits_per_sample));
                }
                self.0.start(format)
            }
            fn play(&mut self, pcm: &[u8]) -> Result<(), SinkError> {
                self.0.play(pcm)
            }
            fn close(&mut self) -> Result<(), SinkError> {
                self.0.close()
            }
        }

        let mut bytes = wav_file(&[1, 2, 3, 4]);
        bytes[34] = 8; // bits per sample
        let mut storage = storage_with("8bit.wav", bytes);
        let mut codec = WavCodec::new();
        let mut sink = Sixteen(CaptureSink::new());

        let err = play_file(
            &mut storage,
            &mut codec,
            &mut sink,
            "8bit.wav",
            &PlaybackConfig::default(),
            None,
        )
        .unwrap_err();
        assert!(matches!(
            err,
            PipelineError::Sink(SinkError::UnsupportedFormat(8))
        ));
        assert!(!codec.is_open());
        assert!(!storage.has_open_file());
    }

    #[test]
    fn sink_close_failure_still_releases_codec_and_file() {
        /// Sink whose teardown itself fails; playback completes first.
        struct WedgedSink(CaptureSink);
        impl AudioSink for WedgedSink {
            fn start(&mut self, format: SinkFormat) -> Result<(), SinkError> {
                self.0.start(format)
            }
            fn play(&mut self, pcm: &[u8]) -> Result<(), SinkError> {
                self.0.play(pcm)
            }
            fn close(&mut self) -> Result<(), SinkError> {
                let _ = self.0.close();
                Err(SinkError::TransferFailed("device wedged".into()))
            }
        }

        let payload = [1u8, 2, 3, 4];
        let mut storage = storage_with("track.wav", wav_file(&payload));
        let mut codec = WavCodec::new();
        let mut sink = WedgedSink(CaptureSink::new());

        let err = play_file(
            &mut storage,
            &mut codec,
            &mut sink,
            "track.wav",
            &PlaybackConfig::default(),
            None,
        )
        .unwrap_err();

        assert!(matches!(
            err,
            PipelineError::Sink(SinkError::TransferFailed(_))
        ));
        // The whole payload was played before teardown failed, and the
        // codec session and file handle were still released.
        assert_eq!(sink.0.bytes(), payload);
        assert!(!codec.is_open());
        assert!(!storage.has_open_file());
    }

    #[test]
    fn stop_flag_ends_playback_cleanly() {
        let payload: Vec<u8> = (0..64).collect();
        let mut storage = storage_with("track.wav", wav_file(&payload));
        let mut codec = WavCodec::new();
        let mut sink = CaptureSink::new();
        let stop = AtomicBool::new(true);

        let stats = play_file(
            &mut storage,
            &mut codec,
            &mut sink,
            "track.wav",
            &PlaybackConfig::default(),
            Some(&stop),
        )
        .unwrap();

        assert_eq!(stats.end, PlaybackEnd::Stopped);
        assert_eq!(stats.bytes_played, 0);
        assert!(!codec.is_open());
        assert!(!storage.has_open_file());
    }

    #[test]
    fn driver_serves_files_back_to_back() {
        let first: Vec<u8> = (0..10).collect();
        let second: Vec<u8> = (50..60).collect();
        let mut storage = MemStorage::new();
        storage.insert_file("a.wav", wav_file(&first));
        storage.insert_file("b.wav", wav_file(&second));
        storage.open().unwrap();

        let mut codec = WavCodec::new();
        let config = PlaybackConfig::default();

        let mut sink_a = CaptureSink::new();
        play_file(&mut storage, &mut codec, &mut sink_a, "a.wav", &config, None).unwrap();
        let mut sink_b = CaptureSink::new();
        play_file(&mut storage, &mut codec, &mut sink_b, "b.wav", &config, None).unwrap();

        assert_eq!(sink_a.bytes(), first);
        assert_eq!(sink_b.bytes(), second);
    }
}
