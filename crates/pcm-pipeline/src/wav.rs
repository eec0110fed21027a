//! WAV/PCM container codec session.
//!
//! Validates the fixed 44-byte RIFF/WAVE header field by field, in file order,
//! then serves sequential or offset-addressed decode calls. Linear PCM needs
//! no transform, so decode is a bounded byte copy from the payload region.
//!
//! One session at a time: a second `open` fails with a distinct error and the
//! first session is left untouched. Any header-validation failure closes the
//! file handle before returning, so a corrupt container never leaks an open
//! file.

use thiserror::Error;

use crate::storage::{FileHandle, StorageDriver};

// All multi-byte header fields are little-endian.
const RIFF_MAGIC: [u8; 4] = *b"RIFF";
const WAVE_FORMAT_ID: [u8; 4] = *b"WAVE";
const FMT_CHUNK_ID: [u8; 4] = *b"fmt ";
const DATA_CHUNK_ID: [u8; 4] = *b"data";

/// Declared `fmt ` chunk size for uncompressed PCM.
const FMT_CHUNK_SIZE_PCM: u32 = 16;
/// Audio format code for integer PCM. Code 3 (IEEE float) is valid WAV but
/// unsupported here and reported as such, not as a malformed file.
const AUDIO_FORMAT_PCM: u16 = 1;

/// Fixed header length; the payload starts right after it.
pub const HEADER_LEN: u64 = 44;

/// Errors reported by the codec layer.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("a codec session is already open")]
    AlreadyOpen,
    #[error("no codec session is open")]
    NoSessionOpen,
    #[error("empty buffer")]
    EmptyBuffer,
    #[error("invalid container format: {0}")]
    InvalidFormat(&'static str),
    #[error("unsupported audio format code {0} (only integer PCM)")]
    UnsupportedFormat(u16),
    #[error("unable to decode")]
    DecodeFailed,
    #[error("range {start}..{end} exceeds payload size {data_size}")]
    OutOfRange { start: u64, end: u64, data_size: u64 },
}

/// Parsed, validated view of the container header.
///
/// Built field by field during validation, immutable afterwards, discarded
/// when the session closes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct WavMetadata {
    /// Declared total file size minus 8, straight from the header.
    pub file_size: u32,
    pub channels: u16,
    pub sample_rate_hz: u32,
    pub bytes_per_sec: u32,
    /// Bytes per multi-channel sample frame.
    pub block_align: u16,
    pub bits_per_sample: u16,
    /// Declared payload length in bytes.
    pub data_size: u32,
}

struct Session {
    handle: FileHandle,
    meta: WavMetadata,
    /// Effective payload length: declared size clamped to what the file
    /// actually holds past the header.
    payload_len: u64,
    payload_pos: u64,
}

/// State machine governing one open-decode cycle.
#[derive(Default)]
pub struct WavCodec {
    session: Option<Session>,
}

impl WavCodec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_open(&self) -> bool {
        self.session.is_some()
    }

    /// Validate the header and enter the `Ready` state.
    ///
    /// Consumes the handle. On success the session keeps it until [`close`];
    /// on any failure the handle is closed here before returning, so the
    /// caller never has to unwind a half-opened file.
    ///
    /// [`close`]: WavCodec::close
    pub fn open<S: StorageDriver + ?Sized>(
        &mut self,
        storage: &mut S,
        handle: FileHandle,
    ) -> Result<&WavMetadata, CodecError> {
        let mut handle = handle;
        if self.session.is_some() {
            close_quietly(storage, &mut handle);
            return Err(CodecError::AlreadyOpen);
        }

        let meta = match validate_header(storage, &mut handle) {
            Ok(meta) => meta,
            Err(e) => {
                close_quietly(storage, &mut handle);
                return Err(e);
            }
        };

        let payload_len = effective_payload_len(storage, &handle, &meta);
        let session = self.session.insert(Session {
            handle,
            meta,
            payload_len,
            payload_pos: 0,
        });
        Ok(&session.meta)
    }

    /// Release the session and hand the file handle back to the caller.
    ///
    /// The codec deliberately does not close the file: ownership of the
    /// handle stays with whoever opened it, so the same file could be handed
    /// to a different codec. Calling this while closed is a reported error,
    /// repeatably, never a crash.
    pub fn close(&mut self) -> Result<FileHandle, CodecError> {
        let session = self.session.take().ok_or(CodecError::NoSessionOpen)?;
        Ok(session.handle)
    }

    /// Copy the next payload bytes into `buf`.
    ///
    /// Returns the byte count actually decoded; `0` means end of stream.
    /// Reads never run past the declared payload, so trailing bytes beyond
    /// `data_size` are not played.
    pub fn decode<S: StorageDriver + ?Sized>(
        &mut self,
        storage: &mut S,
        buf: &mut [u8],
    ) -> Result<usize, CodecError> {
        let session = self.session.as_mut().ok_or(CodecError::NoSessionOpen)?;
        if buf.is_empty() {
            return Err(CodecError::EmptyBuffer);
        }
        read_payload(storage, session, buf)
    }

    /// Seek to `start` within the payload region, then decode as usual.
    ///
    /// Bounds are checked against the declared payload size captured at open
    /// time, before storage is touched.
    pub fn decode_from<S: StorageDriver + ?Sized>(
        &mut self,
        storage: &mut S,
        start: u64,
        buf: &mut [u8],
    ) -> Result<usize, CodecError> {
        let session = self.session.as_mut().ok_or(CodecError::NoSessionOpen)?;
        if buf.is_empty() {
            return Err(CodecError::EmptyBuffer);
        }
        let end = start.saturating_add(buf.len() as u64);
        if end > u64::from(session.meta.data_size) {
            return Err(CodecError::OutOfRange {
                start,
                end,
                data_size: u64::from(session.meta.data_size),
            });
        }
        storage
            .seek(&mut session.handle, HEADER_LEN + start)
            .map_err(|e| {
                tracing::debug!(error = %e, "payload seek failed");
                CodecError::DecodeFailed
            })?;
        session.payload_pos = start;
        read_payload(storage, session, buf)
    }
}

fn read_payload<S: StorageDriver + ?Sized>(
    storage: &mut S,
    session: &mut Session,
    buf: &mut [u8],
) -> Result<usize, CodecError> {
    let remaining = session.payload_len.saturating_sub(session.payload_pos);
    if remaining == 0 {
        return Ok(0);
    }
    let want = (buf.len() as u64).min(remaining) as usize;
    match storage.read(&mut session.handle, &mut buf[..want]) {
        Ok(n) => {
            session.payload_pos += n as u64;
            Ok(n)
        }
        Err(e) => {
            tracing::debug!(error = %e, "payload read failed");
            Err(CodecError::DecodeFailed)
        }
    }
}

/// Close a handle on a failure path, keeping the original error.
fn close_quietly<S: StorageDriver + ?Sized>(storage: &mut S, handle: &mut FileHandle) {
    if let Err(e) = storage.close_file(handle) {
        tracing::warn!(error = %e, "closing file after failed codec open");
    }
}

/// Sequential, order-dependent header validation.
///
/// Each field is read in the exact byte order of the format; the first
/// mismatch short-circuits, so no partial metadata is ever trusted.
fn validate_header<S: StorageDriver + ?Sized>(
    storage: &mut S,
    handle: &mut FileHandle,
) -> Result<WavMetadata, CodecError> {
    expect_tag(storage, handle, &RIFF_MAGIC, "RIFF magic")?;
    let file_size = read_u32(storage, handle)?;
    expect_tag(storage, handle, &WAVE_FORMAT_ID, "WAVE format id")?;
    expect_tag(storage, handle, &FMT_CHUNK_ID, "fmt chunk id")?;

    let fmt_size = read_u32(storage, handle)?;
    if fmt_size != FMT_CHUNK_SIZE_PCM {
        return Err(CodecError::InvalidFormat("fmt chunk size"));
    }
    let format_code = read_u16(storage, handle)?;
    if format_code != AUDIO_FORMAT_PCM {
        return Err(CodecError::UnsupportedFormat(format_code));
    }

    let channels = read_u16(storage, handle)?;
    let sample_rate_hz = read_u32(storage, handle)?;
    let bytes_per_sec = read_u32(storage, handle)?;
    let block_align = read_u16(storage, handle)?;
    let bits_per_sample = read_u16(storage, handle)?;
    if channels == 0 {
        return Err(CodecError::InvalidFormat("zero channel count"));
    }
    if sample_rate_hz == 0 {
        return Err(CodecError::InvalidFormat("zero sample rate"));
    }
    if bytes_per_sec == 0 {
        return Err(CodecError::InvalidFormat("zero bytes per second"));
    }
    if block_align == 0 {
        return Err(CodecError::InvalidFormat("zero block alignment"));
    }
    if bits_per_sample == 0 {
        return Err(CodecError::InvalidFormat("zero bits per sample"));
    }

    expect_tag(storage, handle, &DATA_CHUNK_ID, "data chunk id")?;
    let data_size = read_u32(storage, handle)?;

    Ok(WavMetadata {
        file_size,
        channels,
        sample_rate_hz,
        bytes_per_sec,
        block_align,
        bits_per_sample,
        data_size,
    })
}

/// Declared payload size cross-checked against what the file actually holds.
///
/// A mismatch is a soft warning, not a failure; playback proceeds with the
/// smaller of the two.
fn effective_payload_len<S: StorageDriver + ?Sized>(
    storage: &mut S,
    handle: &FileHandle,
    meta: &WavMetadata,
) -> u64 {
    let declared = u64::from(meta.data_size);
    match storage.file_len(handle) {
        Ok(actual) => {
            let available = actual.saturating_sub(HEADER_LEN);
            if available != declared {
                tracing::warn!(
                    declared_bytes = declared,
                    available_bytes = available,
                    file = handle.name(),
                    "declared payload size disagrees with file length"
                );
            }
            declared.min(available)
        }
        Err(e) => {
            tracing::debug!(error = %e, "file length unavailable; trusting header");
            declared
        }
    }
}

fn fill<S: StorageDriver + ?Sized>(
    storage: &mut S,
    handle: &mut FileHandle,
    buf: &mut [u8],
) -> Result<(), CodecError> {
    match storage.read(handle, buf) {
        Ok(n) if n == buf.len() => Ok(()),
        Ok(_) => Err(CodecError::InvalidFormat("truncated header")),
        Err(e) => {
            tracing::debug!(error = %e, "header read failed");
            Err(CodecError::DecodeFailed)
        }
    }
}

fn expect_tag<S: StorageDriver + ?Sized>(
    storage: &mut S,
    handle: &mut FileHandle,
    expected: &[u8; 4],
    what: &'static str,
) -> Result<(), CodecError> {
    let mut got = [0u8; 4];
    fill(storage, handle, &mut got)?;
    if &got != expected {
        return Err(CodecError::InvalidFormat(what));
    }
    Ok(())
}

fn read_u16<S: StorageDriver + ?Sized>(
    storage: &mut S,
    handle: &mut FileHandle,
) -> Result<u16, CodecError> {
    let mut raw = [0u8; 2];
    fill(storage, handle, &mut raw)?;
    Ok(u16::from_le_bytes(raw))
}

fn read_u32<S: StorageDriver + ?Sized>(
    storage: &mut S,
    handle: &mut FileHandle,
) -> Result<u32, CodecError> {
    let mut raw = [0u8; 4];
    fill(storage, handle, &mut raw)?;
    Ok(u32::from_le_bytes(raw))
}
