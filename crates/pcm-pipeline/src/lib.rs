//! Streaming pipeline that moves PCM audio from block storage to an output sink.
//!
//! Three layers behind narrow contracts:
//! - [`storage`]: a filesystem driver that serves named files as byte streams
//! - [`wav`]: a WAV/PCM container codec session (header validation + chunked decode)
//! - [`sink`] / [`playback`]: an audio sink that accepts raw PCM buffers
//!
//! [`pipeline::play_file`] binds them into a single-consumer loop: one bounded
//! chunk buffer, pull-based decode, blocking playback, ordered teardown on every
//! error path.

pub mod config;
pub mod pipeline;
pub mod playback;
pub mod queue;
pub mod sink;
pub mod storage;
pub mod wav;
