// Metadaten einer Videodatei via ffprobe, ohne den Encoder zu starten.
// Basis-Probe (Dauer, Abmessungen) ist Pflicht; Codec/Mime/Bitrate sind
// ein zweiter Best-Effort-Durchlauf und fehlen im Ergebnis, wenn er scheitert.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{Context, Result as AnyResult};
use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::error::{CompressError, Result};

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct MediaMetadata {
    pub size: u64,
    pub width: u32,
    pub height: u32,
    /// Sekunden
    pub duration: f64,
    pub creation_time: Option<String>,
    pub extension: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub codec: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bitrate: Option<u64>,
}

/// Ergebnis der Basis-Probe.
#[derive(Debug, Clone, PartialEq)]
pub struct BaseInfo {
    pub width: u32,
    pub height: u32,
    pub duration_ms: u64,
    pub creation_time: Option<String>,
}

/// Ergebnis des zweiten Durchlaufs (erste Video-Spur).
#[derive(Debug, Clone, PartialEq)]
pub struct VideoTrack {
    pub mime_type: String,
    pub bitrate: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct ProbeOutput {
    #[serde(default)]
    streams: Vec<ProbeStream>,
    format: Option<ProbeFormat>,
}

#[derive(Debug, Deserialize)]
struct ProbeStream {
    codec_type: Option<String>,
    codec_name: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    bit_rate: Option<String>,
    #[serde(default)]
    disposition: HashMap<String, i64>,
}

#[derive(Debug, Deserialize)]
struct ProbeFormat {
    duration: Option<String>,
    #[serde(default)]
    tags: HashMap<String, String>,
}

impl MediaMetadata {
    pub fn assemble(size: u64, extension: String, base: BaseInfo, track: Option<VideoTrack>) -> Self {
        let (codec, mime_type, bitrate) = match track {
            Some(track) => (
                Some(codec_label(&track.mime_type)),
                Some(track.mime_type),
                track.bitrate,
            ),
            None => (None, None, None),
        };
        Self {
            size,
            width: base.width,
            height: base.height,
            duration: base.duration_ms as f64 / 1000.0,
            creation_time: base.creation_time,
            extension,
            codec,
            mime_type,
            bitrate,
        }
    }
}

pub struct MetadataExtractor {
    ffprobe: PathBuf,
}

impl MetadataExtractor {
    pub fn new(ffprobe: impl Into<PathBuf>) -> Self {
        Self {
            ffprobe: ffprobe.into(),
        }
    }

    /// Blockiert fuer die Dauer der beiden ffprobe-Aufrufe.
    pub fn extract(&self, path: &Path) -> Result<MediaMetadata> {
        let unreadable = |e: anyhow::Error| CompressError::UnreadableSource {
            path: path.display().to_string(),
            reason: format!("{e:#}"),
        };

        let size = std::fs::metadata(path)
            .with_context(|| format!("Datei nicht lesbar: {:?}", path))
            .map_err(unreadable)?
            .len();

        let base = self
            .run_probe(
                path,
                "format=duration:format_tags=creation_time:stream=width,height",
            )
            .and_then(|out| parse_base(&out))
            .map_err(unreadable)?;

        let track = match self
            .run_probe(
                path,
                "stream=codec_type,codec_name,bit_rate:stream_disposition=attached_pic",
            )
            .and_then(|out| parse_video_track(&out))
        {
            Ok(Some(track)) => Some(track),
            Ok(None) => {
                debug!("Keine Video-Spur in {:?}", path);
                None
            }
            Err(e) => {
                warn!("Codec-Informationen nicht ermittelbar fuer {:?}: {e:#}", path);
                None
            }
        };

        let extension = path
            .extension()
            .map(|ext| ext.to_string_lossy().to_string())
            .unwrap_or_default();

        Ok(MediaMetadata::assemble(size, extension, base, track))
    }

    fn run_probe(&self, path: &Path, entries: &str) -> AnyResult<Vec<u8>> {
        let output = Command::new(&self.ffprobe)
            .args(["-v", "error", "-print_format", "json", "-show_entries", entries])
            .arg(path.as_os_str())
            .output()
            .with_context(|| format!("ffprobe konnte nicht gestartet werden: {:?}", self.ffprobe))?;

        if !output.status.success() {
            return Err(anyhow::anyhow!(
                "ffprobe beendet mit Exit-Code {}: {}",
                output.status.code().unwrap_or(-1),
                String::from_utf8_lossy(&output.stderr).trim()
            ));
        }
        Ok(output.stdout)
    }
}

/// Parst die Basis-Probe. Fehlende Dauer ist fatal, fehlende Abmessungen
/// (reine Audio-Container) werden als 0 gemeldet.
pub fn parse_base(json: &[u8]) -> AnyResult<BaseInfo> {
    let probe: ProbeOutput = serde_json::from_slice(json).context("ffprobe-JSON ungueltig")?;
    let format = probe.format.context("ffprobe lieferte keinen Container")?;

    let seconds: f64 = format
        .duration
        .as_deref()
        .context("Dauer fehlt im Container")?
        .trim()
        .parse()
        .context("Dauer nicht parsebar")?;
    if !seconds.is_finite() || seconds < 0.0 {
        return Err(anyhow::anyhow!("Ungueltige Dauer: {seconds}"));
    }

    let (width, height) = probe
        .streams
        .iter()
        .find_map(|s| match (s.width, s.height) {
            (Some(w), Some(h)) if w > 0 && h > 0 => Some((w, h)),
            _ => None,
        })
        .unwrap_or((0, 0));

    Ok(BaseInfo {
        width,
        height,
        duration_ms: (seconds * 1000.0).round() as u64,
        creation_time: format.tags.get("creation_time").cloned(),
    })
}

/// Sucht die erste echte Video-Spur (keine Cover-Bilder).
pub fn parse_video_track(json: &[u8]) -> AnyResult<Option<VideoTrack>> {
    let probe: ProbeOutput = serde_json::from_slice(json).context("ffprobe-JSON ungueltig")?;
    let track = probe
        .streams
        .iter()
        .filter(|s| s.codec_type.as_deref() == Some("video"))
        .filter(|s| s.disposition.get("attached_pic").copied().unwrap_or(0) == 0)
        .find_map(|s| {
            s.codec_name.as_deref().map(|name| VideoTrack {
                mime_type: mime_for_codec(name),
                bitrate: s.bit_rate.as_deref().and_then(|b| b.parse().ok()),
            })
        });
    Ok(track)
}

/// ffprobe-Codecname → Mime-Typ.
pub fn mime_for_codec(codec_name: &str) -> String {
    match codec_name {
        "h264" => "video/avc".to_string(),
        "hevc" => "video/hevc".to_string(),
        "mpeg4" => "video/mp4v-es".to_string(),
        "h263" => "video/3gpp".to_string(),
        "vp8" => "video/x-vnd.on2.vp8".to_string(),
        "vp9" => "video/x-vnd.on2.vp9".to_string(),
        "av1" => "video/av01".to_string(),
        other => format!("video/{other}"),
    }
}

/// Mime-Typ → lesbarer Codec-Name (case-sensitive auf dem Mime-Typ).
pub fn codec_label(mime_type: &str) -> String {
    match mime_type {
        "video/hevc" | "video/dolby-vision" => "HEVC".to_string(),
        "video/avc" => "H.264".to_string(),
        "video/mp4v-es" => "MPEG-4".to_string(),
        "video/3gpp" => "H.263".to_string(),
        "video/x-vnd.on2.vp8" => "VP8".to_string(),
        "video/x-vnd.on2.vp9" => "VP9".to_string(),
        "video/av01" => "AV1".to_string(),
        other => other.strip_prefix("video/").unwrap_or(other).to_uppercase(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const BASE_JSON: &str = r#"{
        "programs": [],
        "streams": [
            {"width": 1920, "height": 1080}
        ],
        "format": {
            "duration": "12.345000",
            "tags": {"creation_time": "2024-05-01T10:00:00.000000Z"}
        }
    }"#;

    const TRACKS_JSON: &str = r#"{
        "streams": [
            {"codec_name": "aac", "codec_type": "audio", "bit_rate": "128000", "disposition": {"attached_pic": 0}},
            {"codec_name": "mjpeg", "codec_type": "video", "disposition": {"attached_pic": 1}},
            {"codec_name": "h264", "codec_type": "video", "bit_rate": "4500000", "disposition": {"attached_pic": 0}}
        ]
    }"#;

    #[test]
    fn codec_label_table() {
        assert_eq!(codec_label("video/avc"), "H.264");
        assert_eq!(codec_label("video/hevc"), "HEVC");
        assert_eq!(codec_label("video/dolby-vision"), "HEVC");
        assert_eq!(codec_label("video/mp4v-es"), "MPEG-4");
        assert_eq!(codec_label("video/3gpp"), "H.263");
        assert_eq!(codec_label("video/x-vnd.on2.vp8"), "VP8");
        assert_eq!(codec_label("video/x-vnd.on2.vp9"), "VP9");
        assert_eq!(codec_label("video/av01"), "AV1");
        assert_eq!(codec_label("video/unknownxyz"), "UNKNOWNXYZ");
    }

    #[test]
    fn codec_label_is_case_sensitive() {
        assert_eq!(codec_label("video/AVC"), "AVC");
    }

    #[test]
    fn parses_base_probe() {
        let base = parse_base(BASE_JSON.as_bytes()).unwrap();
        assert_eq!(base.width, 1920);
        assert_eq!(base.height, 1080);
        assert_eq!(base.duration_ms, 12_345);
        assert_eq!(base.creation_time.as_deref(), Some("2024-05-01T10:00:00.000000Z"));
    }

    #[test]
    fn base_probe_without_duration_fails() {
        let json = r#"{"streams": [{"width": 640, "height": 480}], "format": {}}"#;
        assert!(parse_base(json.as_bytes()).is_err());
    }

    #[test]
    fn audio_only_base_has_zero_dimensions() {
        let json = r#"{"streams": [{}], "format": {"duration": "3.0"}}"#;
        let base = parse_base(json.as_bytes()).unwrap();
        assert_eq!((base.width, base.height), (0, 0));
        assert_eq!(base.duration_ms, 3_000);
    }

    #[test]
    fn video_track_skips_cover_art() {
        let track = parse_video_track(TRACKS_JSON.as_bytes()).unwrap().unwrap();
        assert_eq!(track.mime_type, "video/avc");
        assert_eq!(track.bitrate, Some(4_500_000));
    }

    #[test]
    fn no_video_track_is_none() {
        let json = r#"{"streams": [{"codec_name": "aac", "codec_type": "audio"}]}"#;
        assert_eq!(parse_video_track(json.as_bytes()).unwrap(), None);
    }

    #[test]
    fn metadata_with_track_has_codec_and_mime() {
        let base = parse_base(BASE_JSON.as_bytes()).unwrap();
        let track = parse_video_track(TRACKS_JSON.as_bytes()).unwrap();
        let meta = MediaMetadata::assemble(2048, "mp4".into(), base, track);
        assert_eq!(meta.codec.as_deref(), Some("H.264"));
        assert_eq!(meta.mime_type.as_deref(), Some("video/avc"));
        assert_eq!(meta.bitrate, Some(4_500_000));
        assert!((meta.duration - 12.345).abs() < 1e-9);
    }

    #[test]
    fn metadata_without_track_omits_fields() {
        let base = parse_base(BASE_JSON.as_bytes()).unwrap();
        let meta = MediaMetadata::assemble(2048, "m4a".into(), base, None);
        assert_eq!(meta.codec, None);
        assert_eq!(meta.mime_type, None);
        assert_eq!(meta.bitrate, None);

        let json = serde_json::to_value(&meta).unwrap();
        assert!(json.get("codec").is_none());
        assert!(json.get("mime_type").is_none());
        assert_eq!(json["width"], 1920);
    }

    #[test]
    fn missing_file_is_unreadable() {
        let dir = TempDir::new().unwrap();
        let extractor = MetadataExtractor::new("ffprobe");
        let err = extractor.extract(&dir.path().join("missing.mp4")).unwrap_err();
        assert!(matches!(err, CompressError::UnreadableSource { .. }));
    }

    #[test]
    fn failing_probe_is_unreadable() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("clip.mp4");
        std::fs::write(&path, b"kein video").unwrap();
        let extractor = MetadataExtractor::new(dir.path().join("no-such-ffprobe"));
        let err = extractor.extract(&path).unwrap_err();
        assert!(matches!(err, CompressError::UnreadableSource { .. }));
    }
}
