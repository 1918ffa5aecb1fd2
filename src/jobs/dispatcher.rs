// Dispatcher: nimmt Kompressions-Auftraege an, registriert sie in der
// Cancellation-Registry, startet den Encoder in einem eigenen Task und
// leitet dessen Fortschritt ueber den Progress-Router weiter.
// Das erste terminale Event des Encoders entscheidet ueber das Ergebnis.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Context};
use log::{debug, error, info, warn};
use tokio::sync::{mpsc, Semaphore};

use crate::encoder::{EncodeJob, EncodeStrategy, Encoder, EncoderEvent};
use crate::error::{CompressError, Result};
use crate::events::{ProgressEvent, ProgressRouter};
use crate::jobs::registry::{CancellationRegistry, JobGuard};
use crate::jobs::request::{CompressionOptions, CompressionRequest};

pub struct Dispatcher<E: Encoder> {
    encoder: Arc<E>,
    registry: Arc<CancellationRegistry>,
    router: Arc<ProgressRouter>,
    output_dir: PathBuf,
    slots: Arc<Semaphore>,
}

impl<E: Encoder> Dispatcher<E> {
    /// `max_parallel` begrenzt wie viele Encoder gleichzeitig laufen duerfen.
    pub fn new(
        encoder: Arc<E>,
        registry: Arc<CancellationRegistry>,
        router: Arc<ProgressRouter>,
        output_dir: PathBuf,
        max_parallel: usize,
    ) -> Self {
        Self {
            encoder,
            registry,
            router,
            output_dir,
            slots: Arc::new(Semaphore::new(max_parallel.max(1))),
        }
    }

    pub fn encoder(&self) -> &Arc<E> {
        &self.encoder
    }

    pub fn output_path(&self, id: &str) -> PathBuf {
        self.output_dir.join(format!("{id}.mp4"))
    }

    /// Registriert den Job und fuehrt ihn aus.
    pub async fn submit(&self, request: CompressionRequest) -> Result<PathBuf> {
        let guard = self.registry.register_scoped(&request.id)?;
        self.run(guard, request.source_path, request.options).await
    }

    /// Fuehrt einen bereits registrierten Job aus. Der Eintrag wird auf
    /// allen Pfaden (auch Panik/Drop) ueber den Guard wieder entfernt.
    pub async fn run(
        &self,
        guard: JobGuard,
        source_path: PathBuf,
        options: CompressionOptions,
    ) -> Result<PathBuf> {
        let id = guard.id().to_string();
        let cancel = guard.token();

        if let Some(threshold) = options.minimum_file_size_for_compress {
            if below_threshold(&source_path, threshold).await {
                info!("Job {id}: Quelle <= {threshold} Bytes, keine Kompression");
                return Ok(source_path);
            }
        }

        // Auf freien Slot warten – oder Abbruch
        let _permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                info!("Job {id}: abgebrochen bevor der Encoder startete");
                return Err(CompressError::Cancelled);
            }
            permit = Arc::clone(&self.slots).acquire_owned() => permit
                .context("Encoder-Slots geschlossen")
                .map_err(CompressError::EncodingFailed)?,
        };

        tokio::fs::create_dir_all(&self.output_dir)
            .await
            .with_context(|| format!("Output-Verzeichnis {:?} kann nicht erstellt werden", self.output_dir))
            .map_err(CompressError::EncodingFailed)?;

        let job = EncodeJob {
            id: id.clone(),
            source: source_path,
            output: self.output_path(&id),
            strategy: EncodeStrategy::from_options(&options),
            codec: options.video_codec.unwrap_or_default(),
            progress_divider: options.progress_divider,
        };
        info!("Job {id}: Encoder startet ({:?}, {})", job.strategy, job.codec.as_str());

        // Event-Channel fuer diesen Job-Lauf
        let (event_tx, mut event_rx) = mpsc::channel::<EncoderEvent>(64);
        let encoder = Arc::clone(&self.encoder);
        let task_cancel = cancel.clone();
        let task = tokio::spawn(async move { encoder.encode(job, event_tx, task_cancel).await });
        // Gibt der Aufrufer das Future auf, soll auch der Encoder aufhoeren
        let abandon = cancel.clone().drop_guard();

        let mut outcome: Option<Result<PathBuf>> = None;
        while let Some(event) = event_rx.recv().await {
            match event {
                EncoderEvent::Progress {
                    id: event_id,
                    kind,
                    value,
                } => {
                    if event_id != id {
                        debug!("Job {id}: Event fuer fremden Job {event_id} verworfen");
                        continue;
                    }
                    // Nach einem Abbruch wird kein Fortschritt mehr weitergeleitet
                    if guard.is_cancelled() {
                        continue;
                    }
                    self.router.publish(ProgressEvent {
                        job_id: id.clone(),
                        kind,
                        value,
                    });
                }
                EncoderEvent::Done { output, .. } => {
                    outcome = Some(Ok(output));
                    break;
                }
                EncoderEvent::Cancelled { .. } => {
                    outcome = Some(Err(CompressError::Cancelled));
                    break;
                }
                EncoderEvent::Error { message, .. } => {
                    outcome = Some(Err(CompressError::EncodingFailed(anyhow!(message))));
                    break;
                }
            }
        }
        // Weitere Events des Encoders laufen ins Leere
        drop(event_rx);

        let result = match (outcome, task.await) {
            (Some(outcome), Ok(Err(e))) => {
                warn!("Job {id}: Encoder-Fehler nach terminalem Event ignoriert: {e:#}");
                outcome
            }
            (Some(outcome), _) => outcome,
            (None, Ok(Ok(()))) => Err(CompressError::EncodingFailed(anyhow!(
                "Encoder ohne Ergebnis beendet"
            ))),
            (None, Ok(Err(e))) => Err(CompressError::EncodingFailed(e)),
            (None, Err(e)) => {
                error!("Job {id}: Encoder-Task Panik: {e}");
                Err(CompressError::EncodingFailed(anyhow!("Encoder-Task Panik: {e}")))
            }
        };
        // Ergebnis steht fest: Token bleibt unberuehrt, Status zeigt kein falsches cancelled
        let _ = abandon.disarm();

        match &result {
            Ok(path) => info!("Job {id}: fertig → {}", path.display()),
            Err(CompressError::Cancelled) => info!("Job {id}: abgebrochen"),
            Err(e) => warn!("Job {id}: {e}"),
        }
        result
    }
}

/// Liefert true wenn die Datei hoechstens `threshold` Bytes gross ist.
/// Ist die Groesse nicht lesbar, wird die Schwelle ignoriert.
async fn below_threshold(path: &Path, threshold: u64) -> bool {
    match tokio::fs::metadata(path).await {
        Ok(meta) => meta.len() <= threshold,
        Err(e) => {
            warn!("Dateigroesse von {path:?} nicht lesbar, Schwelle ignoriert: {e}");
            false
        }
    }
}
