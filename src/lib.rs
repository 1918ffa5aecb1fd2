//! Orchestrierung von Video-Kompressions-Jobs.
//!
//! Ein Host startet Jobs ueber [`VideoCompressor`], erhaelt Fortschritt pro
//! Job ueber den [`events::ProgressRouter`] und kann jeden laufenden Job ueber
//! seine ID abbrechen. Der eigentliche Encoder sitzt hinter dem
//! [`encoder::Encoder`]-Trait; die Standard-Implementierung ruft ffmpeg auf.
//!
//! Das Binary `video-compressor-backend` stellt dieselben Operationen als
//! NDJSON-Protokoll auf stdin/stdout bereit (siehe [`ipc`]).

pub mod compressor;
pub mod config;
pub mod encoder;
pub mod error;
pub mod events;
pub mod ffmpeg;
pub mod ipc;
pub mod jobs;
pub mod media;

pub use compressor::{CompressListeners, VideoCompressor};
pub use config::Config;
pub use error::{CompressError, ErrorKind, Result};
pub use jobs::request::{CompressionMethod, CompressionOptions, VideoCodec};
