// Fassade fuer den Host: alle Operationen der externen Schnittstelle.
// Vergibt Job-IDs, haengt die Fortschritts-Callbacks fuer die Dauer eines
// compress-Aufrufs an den Router und gibt sie auf jedem Pfad wieder frei.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::{info, warn};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::Config;
use crate::encoder::Encoder;
use crate::error::{CompressError, Result};
use crate::events::{ProgressKind, ProgressRouter};
use crate::ffmpeg::FfmpegEncoder;
use crate::jobs::background::{BackgroundStatus, BackgroundTaskManager, ExpiryListener, SighupGrant};
use crate::jobs::dispatcher::Dispatcher;
use crate::jobs::registry::{CancellationRegistry, JobGuard, JobState};
use crate::jobs::request::{CompressionOptions, CompressionRequest, VideoCodec};
use crate::media::{MediaMetadata, MetadataExtractor};

const ROUTER_CAPACITY: usize = 1024;

/// Optionale Callbacks eines compress-Aufrufs.
#[derive(Default)]
pub struct CompressListeners {
    pub on_progress: Option<Box<dyn Fn(f64) + Send + Sync>>,
    /// Nur Encoder, die entfernte Quellen erst herunterladen, melden
    /// `ProgressKind::Download`; der ffmpeg-Encoder tut das nie.
    pub on_download_progress: Option<Box<dyn Fn(f64) + Send + Sync>>,
    /// Erhaelt die Job-ID vor dem Start, z.B. fuer cancel_compression.
    pub on_cancellation_id: Option<Box<dyn FnOnce(&str) + Send>>,
}

pub struct VideoCompressor<E: Encoder> {
    dispatcher: Dispatcher<E>,
    registry: Arc<CancellationRegistry>,
    router: Arc<ProgressRouter>,
    background: BackgroundTaskManager,
    metadata: Arc<MetadataExtractor>,
}

impl VideoCompressor<FfmpegEncoder> {
    pub fn from_config(config: &Config, shutdown_token: CancellationToken) -> Self {
        let metadata = Arc::new(MetadataExtractor::new(&config.ffprobe));
        let encoder = Arc::new(FfmpegEncoder::new(&config.ffmpeg, Arc::clone(&metadata)));
        let background = BackgroundTaskManager::new(Box::new(SighupGrant), config.background_budget());
        Self::new(
            encoder,
            metadata,
            background,
            shutdown_token,
            config.output_dir.clone(),
            config.max_parallel,
        )
    }
}

impl<E: Encoder> VideoCompressor<E> {
    pub fn new(
        encoder: Arc<E>,
        metadata: Arc<MetadataExtractor>,
        background: BackgroundTaskManager,
        shutdown_token: CancellationToken,
        output_dir: PathBuf,
        max_parallel: usize,
    ) -> Self {
        let registry = Arc::new(CancellationRegistry::new(shutdown_token));
        let router = Arc::new(ProgressRouter::new(ROUTER_CAPACITY));
        let dispatcher = Dispatcher::new(
            encoder,
            Arc::clone(&registry),
            Arc::clone(&router),
            output_dir,
            max_parallel,
        );
        Self {
            dispatcher,
            registry,
            router,
            background,
            metadata,
        }
    }

    pub fn new_job_id() -> String {
        Uuid::new_v4().to_string()
    }

    pub fn router(&self) -> &Arc<ProgressRouter> {
        &self.router
    }

    pub async fn compress(
        &self,
        source_path: impl Into<PathBuf>,
        options: CompressionOptions,
        listeners: CompressListeners,
    ) -> Result<PathBuf> {
        let id = Self::new_job_id();

        // Abonnements leben bis zum Ende dieses Aufrufs (Drop = Abmeldung)
        let _progress = listeners
            .on_progress
            .map(|cb| self.router.subscribe(&id, ProgressKind::Compression, cb));
        let _download = listeners
            .on_download_progress
            .map(|cb| self.router.subscribe(&id, ProgressKind::Download, cb));

        // Erst registrieren, dann die ID herausgeben: ein sofortiger Abbruch geht nicht verloren
        let guard = self.register_job(&id)?;
        if let Some(cb) = listeners.on_cancellation_id {
            cb(&id);
        }

        self.compress_registered(guard, source_path, options).await
    }

    /// Traegt eine Job-ID in die Registry ein, ohne den Encoder zu starten.
    pub fn register_job(&self, id: &str) -> Result<JobGuard> {
        self.registry.register_scoped(id)
    }

    pub async fn compress_registered(
        &self,
        guard: JobGuard,
        source_path: impl Into<PathBuf>,
        options: CompressionOptions,
    ) -> Result<PathBuf> {
        self.dispatcher.run(guard, source_path.into(), options).await
    }

    /// Wie `compress`, aber mit einer vom Aufrufer vergebenen ID und ohne Callbacks.
    pub async fn compress_with_id(
        &self,
        id: String,
        source_path: impl Into<PathBuf>,
        options: CompressionOptions,
    ) -> Result<PathBuf> {
        self.dispatcher
            .submit(CompressionRequest::new(id, source_path, options))
            .await
    }

    /// Fire-and-forget; unbekannte IDs werden ignoriert.
    pub fn cancel_compression(&self, job_id: &str) {
        info!("cancelCompression: {job_id}");
        self.registry.cancel(job_id);
    }

    pub async fn activate_background_task(
        &self,
        on_expired: Option<ExpiryListener>,
    ) -> Result<BackgroundStatus> {
        self.background.activate(on_expired)
    }

    pub async fn deactivate_background_task(&self) -> Result<BackgroundStatus> {
        self.background.deactivate()
    }

    /// Vom OS ausgeloester Ablauf des Hintergrund-Tasks.
    pub fn expire_background_task(&self, reason: &str) -> bool {
        self.background.expire(reason)
    }

    pub async fn get_video_metadata(&self, source_path: &Path) -> Result<MediaMetadata> {
        let metadata = Arc::clone(&self.metadata);
        let path = source_path.to_path_buf();
        tokio::task::spawn_blocking(move || metadata.extract(&path))
            .await
            .map_err(|e| CompressError::UnreadableSource {
                path: source_path.display().to_string(),
                reason: format!("Probe-Task abgebrochen: {e}"),
            })?
    }

    /// Probe-Fehler ergeben `false`, nie einen Fehler.
    pub async fn is_hardware_codec_supported(&self, codec: VideoCodec) -> bool {
        match self.dispatcher.encoder().hardware_support(codec).await {
            Ok(supported) => supported,
            Err(e) => {
                warn!("Hardware-Probe fuer {} fehlgeschlagen: {e:#}", codec.as_str());
                false
            }
        }
    }

    pub async fn get_optimal_codec(&self) -> VideoCodec {
        if self.is_hardware_codec_supported(VideoCodec::Hevc).await {
            VideoCodec::Hevc
        } else {
            VideoCodec::H264
        }
    }

    pub fn active_jobs(&self) -> Vec<JobState> {
        self.registry.snapshot()
    }
}
