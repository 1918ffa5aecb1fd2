// IPC-Protokoll: Serde-Typen fuer alle Requests und Responses.
// NDJSON ueber stdin/stdout; Push-Events (Fortschritt, Ablauf des
// Hintergrund-Tasks) laufen ueber denselben Ausgabestrom.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ErrorKind;
use crate::events::{ProgressEvent, ProgressKind};
use crate::jobs::background::BackgroundStatus;
use crate::jobs::registry::JobState;
use crate::jobs::request::{CompressionOptions, VideoCodec};
use crate::media::MediaMetadata;

// ---------------------------------------------------------------------------
// Eingehend (vom Host)
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
pub enum Request {
    #[serde(rename = "compress")]
    Compress {
        request_id: String,
        source_path: String,
        #[serde(default)]
        options: CompressionOptions,
    },

    #[serde(rename = "cancel_compression")]
    CancelCompression { job_id: String },

    #[serde(rename = "activate_background_task")]
    ActivateBackgroundTask { request_id: String },

    #[serde(rename = "deactivate_background_task")]
    DeactivateBackgroundTask { request_id: String },

    #[serde(rename = "get_video_metadata")]
    GetVideoMetadata {
        request_id: String,
        source_path: String,
    },

    #[serde(rename = "is_hardware_codec_supported")]
    IsHardwareCodecSupported {
        request_id: String,
        codec: VideoCodec,
    },

    #[serde(rename = "get_optimal_codec")]
    GetOptimalCodec { request_id: String },

    #[serde(rename = "get_status")]
    GetStatus,

    #[serde(rename = "shutdown")]
    Shutdown,
}

// ---------------------------------------------------------------------------
// Ausgehend (zum Host)
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
#[serde(tag = "type")]
pub enum Response {
    /// Enthaelt die Job-ID, mit der der Host abbrechen kann.
    #[serde(rename = "compression_started")]
    CompressionStarted { request_id: String, job_id: String },

    #[serde(rename = "compression_progress")]
    CompressionProgress { job_id: String, progress: f64 },

    #[serde(rename = "download_progress")]
    DownloadProgress { job_id: String, progress: f64 },

    #[serde(rename = "compression_done")]
    CompressionDone {
        request_id: String,
        job_id: String,
        output_path: String,
    },

    #[serde(rename = "compression_error")]
    CompressionError {
        request_id: String,
        job_id: String,
        kind: ErrorKind,
        message: String,
    },

    #[serde(rename = "background_task")]
    BackgroundTask {
        request_id: String,
        status: BackgroundStatus,
    },

    #[serde(rename = "background_task_expired")]
    BackgroundTaskExpired { data: Value },

    #[serde(rename = "video_metadata")]
    VideoMetadata {
        request_id: String,
        metadata: MediaMetadata,
    },

    #[serde(rename = "hardware_codec_supported")]
    HardwareCodecSupported {
        request_id: String,
        codec: VideoCodec,
        supported: bool,
    },

    #[serde(rename = "optimal_codec")]
    OptimalCodec { request_id: String, codec: VideoCodec },

    #[serde(rename = "status_report")]
    StatusReport { jobs: Vec<JobState> },

    #[serde(rename = "request_error")]
    RequestError {
        request_id: String,
        kind: ErrorKind,
        message: String,
    },
}

impl From<ProgressEvent> for Response {
    fn from(event: ProgressEvent) -> Self {
        match event.kind {
            ProgressKind::Compression => Response::CompressionProgress {
                job_id: event.job_id,
                progress: event.value,
            },
            ProgressKind::Download => Response::DownloadProgress {
                job_id: event.job_id,
                progress: event.value,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::request::CompressionMethod;

    #[test]
    fn compress_request_parses_with_defaults() {
        let req: Request = serde_json::from_str(
            r#"{"type":"compress","request_id":"r1","source_path":"/v/in.mov"}"#,
        )
        .unwrap();
        match req {
            Request::Compress { request_id, options, .. } => {
                assert_eq!(request_id, "r1");
                assert_eq!(options, CompressionOptions::default());
            }
            other => panic!("unerwartet: {other:?}"),
        }
    }

    #[test]
    fn compress_request_with_manual_options() {
        let req: Request = serde_json::from_str(
            r#"{"type":"compress","request_id":"r1","source_path":"/v/in.mov",
                "options":{"compression_method":"manual","bitrate":500000}}"#,
        )
        .unwrap();
        let Request::Compress { options, .. } = req else {
            panic!("kein compress");
        };
        assert_eq!(options.compression_method, CompressionMethod::Manual);
        assert_eq!(options.bitrate, Some(500_000));
    }

    #[test]
    fn unit_requests_parse() {
        assert!(matches!(
            serde_json::from_str::<Request>(r#"{"type":"get_status"}"#).unwrap(),
            Request::GetStatus
        ));
        assert!(matches!(
            serde_json::from_str::<Request>(r#"{"type":"is_hardware_codec_supported","request_id":"x","codec":"hevc"}"#).unwrap(),
            Request::IsHardwareCodecSupported { codec: VideoCodec::Hevc, .. }
        ));
    }

    #[test]
    fn progress_event_maps_to_topic() {
        let json = serde_json::to_value(Response::from(ProgressEvent::download("j", 0.5))).unwrap();
        assert_eq!(json["type"], "download_progress");
        assert_eq!(json["job_id"], "j");
        assert_eq!(json["progress"], 0.5);

        let json = serde_json::to_value(Response::from(ProgressEvent::compression("j", 0.25))).unwrap();
        assert_eq!(json["type"], "compression_progress");
    }

    #[test]
    fn error_response_carries_kind() {
        let json = serde_json::to_value(Response::CompressionError {
            request_id: "r".into(),
            job_id: "j".into(),
            kind: ErrorKind::Cancelled,
            message: "Kompression abgebrochen".into(),
        })
        .unwrap();
        assert_eq!(json["type"], "compression_error");
        assert_eq!(json["kind"], "cancelled");
    }
}
