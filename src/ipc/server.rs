// IPC-Server: Liest JSON-Requests von stdin, schreibt Responses auf stdout (NDJSON).

use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use log::{debug, warn};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader, BufWriter};
use tokio::sync::{mpsc, oneshot};

use crate::compressor::VideoCompressor;
use crate::encoder::Encoder;
use crate::events::{ProgressEvent, ProgressKind, Subscription};
use crate::ipc::protocol::{Request, Response};
use crate::jobs::background::ExpiryListener;
use crate::jobs::registry::JobGuard;
use crate::jobs::request::CompressionOptions;

/// Liest Requests von stdin und verarbeitet sie.
/// Alle Responses werden ueber `response_tx` gesendet, damit nur ein
/// einziger Writer-Task auf stdout schreibt (keine Race Condition).
pub async fn read_stdin<E: Encoder>(
    compressor: Arc<VideoCompressor<E>>,
    response_tx: mpsc::Sender<Response>,
    shutdown_tx: oneshot::Sender<()>,
) -> Result<()> {
    let reader = BufReader::new(tokio::io::stdin());
    serve(reader, compressor, response_tx).await?;
    let _ = shutdown_tx.send(());
    Ok(())
}

/// Verarbeitet Requests bis `shutdown` oder EOF.
pub async fn serve<R, E>(
    reader: R,
    compressor: Arc<VideoCompressor<E>>,
    response_tx: mpsc::Sender<Response>,
) -> Result<()>
where
    R: AsyncBufRead + Unpin,
    E: Encoder,
{
    let mut lines = reader.lines();

    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let request: Request = match serde_json::from_str(line) {
            Ok(r) => r,
            Err(e) => {
                warn!("Ungueltige JSON-Nachricht: {e}");
                continue;
            }
        };

        if matches!(request, Request::Shutdown) {
            debug!("Shutdown-Request empfangen");
            return Ok(());
        }
        handle_request(request, &compressor, &response_tx).await;
    }

    Ok(())
}

async fn send(tx: &mpsc::Sender<Response>, response: Response) {
    if let Err(e) = tx.send(response).await {
        warn!("Response konnte nicht gesendet werden: {e}");
    }
}

async fn handle_request<E: Encoder>(
    request: Request,
    compressor: &Arc<VideoCompressor<E>>,
    response_tx: &mpsc::Sender<Response>,
) {
    match request {
        Request::Compress {
            request_id,
            source_path,
            options,
        } => {
            let job_id = VideoCompressor::<E>::new_job_id();
            let guard = match compressor.register_job(&job_id) {
                Ok(guard) => guard,
                Err(e) => {
                    send(
                        response_tx,
                        Response::RequestError {
                            request_id,
                            kind: e.kind(),
                            message: e.to_string(),
                        },
                    )
                    .await;
                    return;
                }
            };
            // Erst die ID melden, dann laufen lassen: so kommt kein
            // Fortschritt vor compression_started beim Host an
            send(
                response_tx,
                Response::CompressionStarted {
                    request_id: request_id.clone(),
                    job_id: job_id.clone(),
                },
            )
            .await;

            let compressor = Arc::clone(compressor);
            let tx = response_tx.clone();
            tokio::spawn(async move {
                let response = run_compression(
                    &compressor,
                    &tx,
                    guard,
                    request_id,
                    job_id,
                    source_path,
                    options,
                )
                .await;
                send(&tx, response).await;
            });
        }
        Request::CancelCompression { job_id } => {
            compressor.cancel_compression(&job_id);
        }
        Request::ActivateBackgroundTask { request_id } => {
            let expiry_tx = response_tx.clone();
            let listener: ExpiryListener = Box::new(move |data| {
                if let Err(e) = expiry_tx.try_send(Response::BackgroundTaskExpired { data }) {
                    warn!("Ablauf-Event des Hintergrund-Tasks verloren: {e}");
                }
            });
            let response = match compressor.activate_background_task(Some(listener)).await {
                Ok(status) => Response::BackgroundTask { request_id, status },
                Err(e) => Response::RequestError {
                    request_id,
                    kind: e.kind(),
                    message: e.to_string(),
                },
            };
            send(response_tx, response).await;
        }
        Request::DeactivateBackgroundTask { request_id } => {
            let response = match compressor.deactivate_background_task().await {
                Ok(status) => Response::BackgroundTask { request_id, status },
                Err(e) => Response::RequestError {
                    request_id,
                    kind: e.kind(),
                    message: e.to_string(),
                },
            };
            send(response_tx, response).await;
        }
        Request::GetVideoMetadata {
            request_id,
            source_path,
        } => {
            let compressor = Arc::clone(compressor);
            let tx = response_tx.clone();
            // ffprobe kann dauern – Reader nicht blockieren
            tokio::spawn(async move {
                let response = match compressor.get_video_metadata(Path::new(&source_path)).await {
                    Ok(metadata) => Response::VideoMetadata {
                        request_id,
                        metadata,
                    },
                    Err(e) => Response::RequestError {
                        request_id,
                        kind: e.kind(),
                        message: e.to_string(),
                    },
                };
                send(&tx, response).await;
            });
        }
        Request::IsHardwareCodecSupported { request_id, codec } => {
            let compressor = Arc::clone(compressor);
            let tx = response_tx.clone();
            tokio::spawn(async move {
                let supported = compressor.is_hardware_codec_supported(codec).await;
                send(
                    &tx,
                    Response::HardwareCodecSupported {
                        request_id,
                        codec,
                        supported,
                    },
                )
                .await;
            });
        }
        Request::GetOptimalCodec { request_id } => {
            let compressor = Arc::clone(compressor);
            let tx = response_tx.clone();
            tokio::spawn(async move {
                let codec = compressor.get_optimal_codec().await;
                send(&tx, Response::OptimalCodec { request_id, codec }).await;
            });
        }
        Request::GetStatus => {
            let jobs = compressor.active_jobs();
            send(response_tx, Response::StatusReport { jobs }).await;
        }
        Request::Shutdown => {}
    }
}

/// Fuehrt einen registrierten Job aus und leitet seinen Fortschritt weiter.
/// Fortschritt und Endergebnis laufen ueber denselben Pfad: die terminale
/// Response wird erst gebaut, wenn alle Fortschritts-Events gesendet sind.
async fn run_compression<E: Encoder>(
    compressor: &VideoCompressor<E>,
    tx: &mpsc::Sender<Response>,
    guard: JobGuard,
    request_id: String,
    job_id: String,
    source_path: String,
    options: CompressionOptions,
) -> Response {
    // Router-Callbacks sind synchron, daher ein unbeschraenkter Job-Kanal
    let (progress_tx, mut progress_rx) = mpsc::unbounded_channel::<Response>();
    let subscriptions: Vec<Subscription> = [ProgressKind::Compression, ProgressKind::Download]
        .into_iter()
        .map(|kind| {
            let progress_tx = progress_tx.clone();
            let id = job_id.clone();
            compressor.router().subscribe(&job_id, kind, move |value| {
                let event = ProgressEvent {
                    job_id: id.clone(),
                    kind,
                    value,
                };
                let _ = progress_tx.send(Response::from(event));
            })
        })
        .collect();
    drop(progress_tx);

    let job = compressor.compress_registered(guard, source_path, options);
    tokio::pin!(job);
    let result = loop {
        tokio::select! {
            biased;
            Some(progress) = progress_rx.recv() => send(tx, progress).await,
            result = &mut job => break result,
        }
    };

    // Abmelden, dann den Rest in Reihenfolge nachliefern
    drop(subscriptions);
    while let Ok(progress) = progress_rx.try_recv() {
        send(tx, progress).await;
    }

    match result {
        Ok(path) => Response::CompressionDone {
            request_id,
            job_id,
            output_path: path.to_string_lossy().to_string(),
        },
        Err(e) => Response::CompressionError {
            request_id,
            job_id,
            kind: e.kind(),
            message: e.to_string(),
        },
    }
}

/// Schreibt Response-Events als NDJSON auf stdout.
/// Laeuft als eigener Task. Gibt Fehler zurueck wenn die stdout-Pipe geschlossen wird.
pub async fn write_stdout(rx: mpsc::Receiver<Response>) -> Result<()> {
    write_responses(tokio::io::stdout(), rx).await
}

pub async fn write_responses<W>(writer: W, mut rx: mpsc::Receiver<Response>) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut writer = BufWriter::new(writer);

    while let Some(response) = rx.recv().await {
        let json = match serde_json::to_string(&response) {
            Ok(j) => j,
            Err(e) => {
                warn!("Fehler beim Serialisieren der Response: {e}");
                continue;
            }
        };

        writer.write_all(json.as_bytes()).await?;
        writer.write_all(b"\n").await?;
        writer.flush().await?;
    }

    Ok(())
}
