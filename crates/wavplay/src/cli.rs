use std::path::PathBuf;

use clap::Parser;

#[derive(Parser, Debug)]
#[command(name = "wavplay", version)]
pub struct Args {
    /// WAV file to play, relative to --dir
    pub file: Option<String>,

    /// Directory that stands in for the mounted card
    #[arg(long, default_value = ".")]
    pub dir: PathBuf,

    /// Use a specific output device by substring match
    #[arg(long)]
    pub device: Option<String>,

    /// List output devices and exit
    #[arg(long)]
    pub list_devices: bool,

    /// Decode chunk size in bytes (one reused buffer bounds pipeline memory)
    #[arg(long, default_value_t = 4096)]
    pub chunk_bytes: usize,

    /// Sink queue target in seconds
    #[arg(long, default_value_t = 2.0)]
    pub buffer_seconds: f32,
}
