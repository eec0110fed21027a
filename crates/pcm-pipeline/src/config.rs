/// Playback tuning parameters shared by the decode loop and the output sink.
#[derive(Clone, Debug)]
pub struct PlaybackConfig {
    /// Decode chunk size in bytes; also the size of the one reused buffer.
    pub chunk_bytes: usize,
    /// Target sink queue duration used for capacity sizing.
    pub buffer_seconds: f32,
}

impl Default for PlaybackConfig {
    /// Defaults tuned for smooth playback without hoarding memory.
    fn default() -> Self {
        Self {
            chunk_bytes: 4096,
            buffer_seconds: 2.0,
        }
    }
}
