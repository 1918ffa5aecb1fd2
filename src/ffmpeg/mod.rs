// FFmpeg als externer Encoder.

pub mod progress;
pub mod runner;

pub use runner::FfmpegEncoder;
