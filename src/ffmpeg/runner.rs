// FFmpeg-Encoder: startet FFmpeg-Prozesse ueber tokio::process::Command und
// liefert Fortschritts- und End-Events ueber einen mpsc channel zurueck.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use anyhow::{Context, Result};
use log::{debug, info, warn};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::encoder::{EncodeJob, EncodeStrategy, Encoder, EncoderEvent};
use crate::events::ProgressKind;
use crate::ffmpeg::progress::{calculate_progress, ProgressParser, ProgressThrottle};
use crate::jobs::request::VideoCodec;
use crate::media::{MediaMetadata, MetadataExtractor};

const COMPRESS_FACTOR: f64 = 0.8;
const MIN_COMPRESS_FACTOR: f64 = 0.8;
const MAX_BITRATE: u64 = 1_669_000;
const AUDIO_BITRATE: &str = "128k";

/// Hardware-Encoder-Suffixe in der Reihenfolge, in der sie probiert werden.
const HW_SUFFIXES: &[&str] = &[
    "videotoolbox",
    "nvenc",
    "qsv",
    "vaapi",
    "amf",
    "v4l2m2m",
    "mediacodec",
];

/// Zielparameter eines Encodes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodePlan {
    /// None = keine Skalierung
    pub scale: Option<(u32, u32)>,
    pub bitrate: u64,
}

/// Skaliert so, dass die laengere Kante <= max_size ist. Nie hochskalieren,
/// Ergebnis immer gerade (Anforderung von yuv420p).
pub fn scaled_dimensions(width: u32, height: u32, max_size: u32) -> Option<(u32, u32)> {
    if width == 0 || height == 0 || max_size == 0 {
        return None;
    }
    let longer = width.max(height);
    if longer <= max_size {
        return None;
    }
    let ratio = max_size as f64 / longer as f64;
    let even = |v: f64| ((v.round() as u32) / 2 * 2).max(2);
    Some((even(width as f64 * ratio), even(height as f64 * ratio)))
}

/// Bitrate fuer den automatischen Modus, abgeleitet von Quell-Bitrate und
/// Aufloesungsverhaeltnis (Referenz: 720p).
pub fn auto_bitrate(source_bitrate: Option<u64>, source: (u32, u32), target: (u32, u32)) -> u64 {
    let (tw, th) = target;
    if tw == 0 || th == 0 {
        return MAX_BITRATE;
    }
    let pixels = tw as f64 * th as f64;
    let min_bitrate = (MIN_COMPRESS_FACTOR * 2_000_000.0 * 1.13 / (1280.0 * 720.0 / pixels)) as u64;

    let Some(original) = source_bitrate else {
        return min_bitrate.min(MAX_BITRATE);
    };
    let (sw, sh) = source;
    let ratio = (sh as f64 / th as f64).min(sw as f64 / tw as f64).max(1.0);
    let remeasured = (original as f64 / ratio * COMPRESS_FACTOR) as u64;

    if original < min_bitrate {
        return remeasured;
    }
    if remeasured > MAX_BITRATE {
        MAX_BITRATE
    } else {
        remeasured.max(min_bitrate)
    }
}

pub fn plan_encode(strategy: &EncodeStrategy, source: &MediaMetadata) -> EncodePlan {
    let scale = scaled_dimensions(source.width, source.height, strategy.max_size());
    let target = scale.unwrap_or((source.width, source.height));
    let bitrate = match strategy {
        EncodeStrategy::Auto { .. } => {
            auto_bitrate(source.bitrate, (source.width, source.height), target)
        }
        EncodeStrategy::Manual { bitrate, .. } => bitrate.or(source.bitrate).unwrap_or(MAX_BITRATE),
    };
    EncodePlan { scale, bitrate }
}

/// Baut die FFmpeg-Argumente fuer einen Kompressions-Job zusammen.
pub fn build_ffmpeg_args(
    input_path: &Path,
    output_path: &Path,
    plan: &EncodePlan,
    codec: VideoCodec,
) -> Vec<String> {
    let mut args: Vec<String> = vec!["-y".into(), "-hide_banner".into(), "-nostats".into()];

    args.push("-i".into());
    args.push(input_path.to_string_lossy().to_string());

    // Erster Video-Stream, Audio optional, Metadaten (creation_time) behalten
    args.extend(["-map", "0:v:0", "-map", "0:a:0?", "-map_metadata", "0"].map(String::from));

    args.push("-c:v".into());
    match codec {
        VideoCodec::H264 => args.push("libx264".into()),
        VideoCodec::Hevc => {
            args.push("libx265".into());
            // Abspielbar in QuickTime/iOS
            args.extend(["-tag:v", "hvc1"].map(String::from));
        }
    }
    args.push("-b:v".into());
    args.push(plan.bitrate.to_string());
    args.push("-maxrate".into());
    args.push(plan.bitrate.to_string());
    args.push("-bufsize".into());
    args.push((plan.bitrate * 2).to_string());

    if let Some((w, h)) = plan.scale {
        args.push("-vf".into());
        args.push(format!("scale={w}:{h}"));
    }

    args.extend(["-pix_fmt", "yuv420p", "-c:a", "aac", "-b:a", AUDIO_BITRATE].map(String::from));
    args.extend(["-movflags", "+faststart"].map(String::from));

    // Strukturiertes Progress-Reporting auf stderr
    args.extend(["-progress", "pipe:2"].map(String::from));

    args.push(output_path.to_string_lossy().to_string());
    args
}

/// Prueft ob die `ffmpeg -encoders` Liste einen Hardware-Encoder fuer den Codec enthaelt.
pub fn hardware_encoders(listing: &str, codec: VideoCodec) -> Vec<String> {
    let prefix = format!("{}_", codec.as_str());
    let listed: Vec<&str> = listing
        .lines()
        .filter_map(|line| line.split_whitespace().nth(1))
        .filter(|name| name.starts_with(&prefix))
        .collect();
    HW_SUFFIXES
        .iter()
        .map(|suffix| format!("{prefix}{suffix}"))
        .filter(|name| listed.contains(&name.as_str()))
        .collect()
}

pub struct FfmpegEncoder {
    ffmpeg: PathBuf,
    metadata: Arc<MetadataExtractor>,
}

impl FfmpegEncoder {
    pub fn new(ffmpeg: impl Into<PathBuf>, metadata: Arc<MetadataExtractor>) -> Self {
        Self {
            ffmpeg: ffmpeg.into(),
            metadata,
        }
    }

    async fn probe_source(&self, path: &Path) -> Result<MediaMetadata> {
        let metadata = Arc::clone(&self.metadata);
        let path = path.to_path_buf();
        let meta = tokio::task::spawn_blocking(move || metadata.extract(&path))
            .await
            .context("Probe-Task abgebrochen")??;
        Ok(meta)
    }

    /// Kurzer Test-Encode gegen eine synthetische Quelle.
    async fn trial_encode(&self, encoder: &str) -> bool {
        let status = Command::new(&self.ffmpeg)
            .args(["-hide_banner", "-loglevel", "error", "-f", "lavfi", "-i"])
            .arg("color=black:s=256x256:d=0.1")
            .args(["-frames:v", "1", "-c:v", encoder, "-f", "null", "-"])
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .status()
            .await;
        matches!(status, Ok(s) if s.success())
    }
}

impl Encoder for FfmpegEncoder {
    fn encode(
        &self,
        job: EncodeJob,
        events: mpsc::Sender<EncoderEvent>,
        cancel: CancellationToken,
    ) -> impl std::future::Future<Output = Result<()>> + Send {
        async move {
            let source = self
                .probe_source(&job.source)
                .await
                .with_context(|| format!("Quelldatei {:?} nicht lesbar", job.source))?;
            let plan = plan_encode(&job.strategy, &source);
            debug!("Job {}: {:?}", job.id, plan);

            let args = build_ffmpeg_args(&job.source, &job.output, &plan, job.codec);
            let total_duration_us = (source.duration * 1_000_000.0) as i64;
            run_ffmpeg(&self.ffmpeg, &job, args, total_duration_us, events, cancel).await
        }
    }

    fn hardware_support(
        &self,
        codec: VideoCodec,
    ) -> impl std::future::Future<Output = Result<bool>> + Send {
        async move {
            let output = Command::new(&self.ffmpeg)
                .args(["-hide_banner", "-encoders"])
                .stdin(Stdio::null())
                .output()
                .await
                .context("FFmpeg konnte nicht gestartet werden")?;
            if !output.status.success() {
                return Err(anyhow::anyhow!(
                    "ffmpeg -encoders beendet mit Exit-Code: {}",
                    output.status.code().unwrap_or(-1)
                ));
            }

            let listing = String::from_utf8_lossy(&output.stdout);
            for candidate in hardware_encoders(&listing, codec) {
                if self.trial_encode(&candidate).await {
                    info!("Hardware-Encoder verfuegbar: {candidate}");
                    return Ok(true);
                }
                debug!("Hardware-Encoder {candidate} gelistet, aber nicht nutzbar");
            }
            Ok(false)
        }
    }
}

async fn remove_partial(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!("Unvollstaendige Ausgabe {:?} nicht entfernt: {e}", path);
        }
    }
}

/// Startet einen FFmpeg-Prozess und sendet Events ueber den Channel.
///
/// * `total_duration_us` – Gesamtdauer der Quelldatei in Mikrosekunden (fuer Prozentberechnung)
/// * `cancel` – Token des Jobs; bei Abbruch wird FFmpeg per 'q' beendet
async fn run_ffmpeg(
    ffmpeg: &Path,
    job: &EncodeJob,
    args: Vec<String>,
    total_duration_us: i64,
    tx: mpsc::Sender<EncoderEvent>,
    cancel: CancellationToken,
) -> Result<()> {
    let mut child = Command::new(ffmpeg)
        .args(&args)
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .context("FFmpeg konnte nicht gestartet werden")?;

    let stderr = child
        .stderr
        .take()
        .context("Konnte stderr von FFmpeg nicht lesen")?;
    let mut stdin = child.stdin.take();

    let mut reader = BufReader::new(stderr).lines();
    let mut parser = ProgressParser::new();
    let mut throttle = ProgressThrottle::new(job.progress_divider);
    // Letzte Nicht-Progress-Zeilen fuer die Fehlermeldung
    let mut last_log_line = String::new();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                // Graceful stop: 'q' an stdin senden
                if let Some(ref mut stdin_handle) = stdin {
                    let _ = stdin_handle.write_all(b"q\n").await;
                    let _ = stdin_handle.flush().await;
                }
                let _ = child.wait().await;
                remove_partial(&job.output).await;
                let _ = tx.send(EncoderEvent::Cancelled { id: job.id.clone() }).await;
                return Ok(());
            }
            line = reader.next_line() => {
                match line {
                    Ok(Some(line)) => {
                        let Some(progress) = parser.feed_line(&line) else {
                            if !line.contains('=') && !line.trim().is_empty() {
                                last_log_line = line;
                            }
                            continue;
                        };
                        if progress.is_done {
                            break;
                        }
                        let fraction = calculate_progress(progress.out_time_us, total_duration_us);
                        if let Some(value) = throttle.accept(fraction) {
                            let _ = tx
                                .send(EncoderEvent::Progress {
                                    id: job.id.clone(),
                                    kind: ProgressKind::Compression,
                                    value,
                                })
                                .await;
                        }
                    }
                    // stderr geschlossen – Prozess beendet
                    Ok(None) => break,
                    Err(e) => {
                        let _ = child.kill().await;
                        remove_partial(&job.output).await;
                        let _ = tx
                            .send(EncoderEvent::Error {
                                id: job.id.clone(),
                                message: format!("Fehler beim Lesen von stderr: {e}"),
                            })
                            .await;
                        return Ok(());
                    }
                }
            }
        }
    }

    let status = child.wait().await?;
    if status.success() {
        let _ = tx
            .send(EncoderEvent::Done {
                id: job.id.clone(),
                output: job.output.clone(),
            })
            .await;
    } else {
        remove_partial(&job.output).await;
        let mut message = format!("FFmpeg beendet mit Exit-Code: {}", status.code().unwrap_or(-1));
        if !last_log_line.is_empty() {
            message.push_str(&format!(" ({})", last_log_line.trim()));
        }
        let _ = tx.send(EncoderEvent::Error { id: job.id.clone(), message }).await;
    }
    Ok(())
}
