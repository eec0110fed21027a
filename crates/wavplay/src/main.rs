//! wavplay — play a PCM WAV file from a directory through the default (or a
//! chosen) output device.
//!
//! ## Pipeline
//! 1. **Storage**: `DirStorage` serves the file as a byte stream behind the
//!    storage-driver contract.
//! 2. **Codec**: `WavCodec` validates the 44-byte header and decodes PCM in
//!    chunks.
//! 3. **Sink**: `CpalSink` queues chunks for the CPAL output callback;
//!    `play` blocks while the queue is full, bounding memory to one chunk.
//!
//! Ctrl-C arms a cooperative stop flag checked between chunks.

mod cli;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result, bail};
use clap::Parser;
use pcm_pipeline::config::PlaybackConfig;
use pcm_pipeline::pipeline::play_file;
use pcm_pipeline::playback::{CpalSink, list_devices};
use pcm_pipeline::storage::{DirStorage, StorageDriver};
use pcm_pipeline::wav::WavCodec;
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    let args = cli::Args::parse();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    if args.list_devices {
        list_devices(&cpal::default_host())?;
        return Ok(());
    }

    let Some(file) = args.file.as_deref() else {
        bail!("no file given (try --list-devices to inspect outputs)");
    };

    let stop = Arc::new(AtomicBool::new(false));
    let stop_signal = stop.clone();
    let _ = ctrlc::set_handler(move || {
        stop_signal.store(true, Ordering::Relaxed);
    });

    let mut storage = DirStorage::new(&args.dir);
    storage
        .open()
        .with_context(|| format!("open storage at {}", args.dir.display()))?;
    let info = storage.info()?;
    tracing::info!(
        block_size = info.block_size,
        num_blocks = info.num_blocks,
        total_bytes = info.total_bytes,
        "storage ready"
    );

    let mut codec = WavCodec::new();
    let mut sink = CpalSink::new(args.device.clone(), args.buffer_seconds);
    let config = PlaybackConfig {
        chunk_bytes: args.chunk_bytes,
        buffer_seconds: args.buffer_seconds,
    };

    let result = play_file(
        &mut storage,
        &mut codec,
        &mut sink,
        file,
        &config,
        Some(stop.as_ref()),
    );

    if let Err(e) = storage.close() {
        tracing::warn!(error = %e, "storage close");
    }

    let stats = result.with_context(|| format!("play {file}"))?;
    tracing::info!(
        bytes = stats.bytes_played,
        chunks = stats.chunks,
        end = ?stats.end,
        "done"
    );
    Ok(())
}
