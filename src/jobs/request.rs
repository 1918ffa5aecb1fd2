// Auftrags-Typen: CompressionRequest und die Optionen eines Jobs.
// Die Optionen kommen direkt aus dem IPC-Protokoll (snake_case JSON).

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

pub const DEFAULT_MAX_SIZE: u32 = 640;

#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CompressionMethod {
    #[default]
    #[serde(rename = "auto", alias = "automatic")]
    Auto,
    Manual,
}

#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum VideoCodec {
    #[default]
    H264,
    Hevc,
}

impl VideoCodec {
    pub fn as_str(&self) -> &'static str {
        match self {
            VideoCodec::H264 => "h264",
            VideoCodec::Hevc => "hevc",
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct CompressionOptions {
    #[serde(default)]
    pub compression_method: CompressionMethod,

    pub bitrate: Option<u64>,

    #[serde(default = "default_max_size")]
    pub max_size: u32,

    /// Schwelle in Bytes. Quelle <= Schwelle → keine Kompression, Originalpfad zurueck.
    pub minimum_file_size_for_compress: Option<u64>,

    /// 0 = jedes Update melden, sonst nur Prozentwerte die durch den Divider teilbar sind.
    #[serde(default)]
    pub progress_divider: u32,

    pub video_codec: Option<VideoCodec>,
}

impl Default for CompressionOptions {
    fn default() -> Self {
        Self {
            compression_method: CompressionMethod::Auto,
            bitrate: None,
            max_size: default_max_size(),
            minimum_file_size_for_compress: None,
            progress_divider: 0,
            video_codec: None,
        }
    }
}

fn default_max_size() -> u32 {
    DEFAULT_MAX_SIZE
}

/// Ein einzelner Kompressions-Auftrag. Unveraenderlich nach der Erstellung.
#[derive(Debug, Clone)]
pub struct CompressionRequest {
    pub id: String,
    pub source_path: PathBuf,
    pub options: CompressionOptions,
}

impl CompressionRequest {
    pub fn new(id: impl Into<String>, source_path: impl Into<PathBuf>, options: CompressionOptions) -> Self {
        Self {
            id: id.into(),
            source_path: source_path.into(),
            options,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_options_use_defaults() {
        let opts: CompressionOptions = serde_json::from_str("{}").unwrap();
        assert_eq!(opts, CompressionOptions::default());
        assert_eq!(opts.max_size, 640);
        assert_eq!(opts.compression_method, CompressionMethod::Auto);
        assert_eq!(opts.progress_divider, 0);
    }

    #[test]
    fn manual_options_parse() {
        let opts: CompressionOptions = serde_json::from_str(
            r#"{"compression_method":"manual","bitrate":500000,"video_codec":"hevc","minimum_file_size_for_compress":0}"#,
        )
        .unwrap();
        assert_eq!(opts.compression_method, CompressionMethod::Manual);
        assert_eq!(opts.bitrate, Some(500_000));
        assert_eq!(opts.video_codec, Some(VideoCodec::Hevc));
        assert_eq!(opts.minimum_file_size_for_compress, Some(0));
    }

    #[test]
    fn automatic_alias_accepted() {
        let opts: CompressionOptions =
            serde_json::from_str(r#"{"compression_method":"automatic"}"#).unwrap();
        assert_eq!(opts.compression_method, CompressionMethod::Auto);
    }
}
