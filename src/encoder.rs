// Schnittstelle zum externen Encoder.
// Der Encoder laeuft in einem eigenen Task pro Job und meldet Fortschritt
// und genau ein terminales Event ueber den mpsc-Channel an den Dispatcher.

use std::future::Future;
use std::path::PathBuf;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::events::ProgressKind;
use crate::jobs::request::{CompressionMethod, CompressionOptions, VideoCodec};

/// Events die ein Encoder an den Dispatcher sendet.
#[derive(Debug, Clone, PartialEq)]
pub enum EncoderEvent {
    Progress {
        id: String,
        kind: ProgressKind,
        value: f64,
    },
    Done {
        id: String,
        output: PathBuf,
    },
    Error {
        id: String,
        message: String,
    },
    Cancelled {
        id: String,
    },
}

/// Strategie der Parameterwahl.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EncodeStrategy {
    /// Encoder waehlt die Bitrate selbst anhand von `max_size`.
    Auto { max_size: u32 },
    /// Bitrate wird unveraendert durchgereicht.
    Manual { bitrate: Option<u64>, max_size: u32 },
}

impl EncodeStrategy {
    pub fn from_options(options: &CompressionOptions) -> Self {
        match options.compression_method {
            CompressionMethod::Auto => EncodeStrategy::Auto {
                max_size: options.max_size,
            },
            CompressionMethod::Manual => EncodeStrategy::Manual {
                bitrate: options.bitrate,
                max_size: options.max_size,
            },
        }
    }

    pub fn max_size(&self) -> u32 {
        match self {
            EncodeStrategy::Auto { max_size } | EncodeStrategy::Manual { max_size, .. } => *max_size,
        }
    }
}

/// Ein Encoder-Aufruf fuer genau einen Job.
#[derive(Debug, Clone)]
pub struct EncodeJob {
    pub id: String,
    pub source: PathBuf,
    pub output: PathBuf,
    pub strategy: EncodeStrategy,
    pub codec: VideoCodec,
    pub progress_divider: u32,
}

pub trait Encoder: Send + Sync + 'static {
    /// Fuehrt den Job aus. Ein `Err` bedeutet, dass der Encoder gar nicht
    /// laufen konnte; regulaere Ergebnisse kommen als terminales Event.
    fn encode(
        &self,
        job: EncodeJob,
        events: mpsc::Sender<EncoderEvent>,
        cancel: CancellationToken,
    ) -> impl Future<Output = anyhow::Result<()>> + Send;

    /// Prueft ob fuer den Codec ein Hardware-Encoder verfuegbar ist.
    fn hardware_support(&self, codec: VideoCodec) -> impl Future<Output = anyhow::Result<bool>> + Send;
}

/// Skriptbarer Encoder fuer Tests des Dispatchers und der Fassade.
#[cfg(test)]
pub(crate) mod testing {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    use super::*;

    #[derive(Debug, Clone)]
    pub enum Finish {
        Done,
        Fail(String),
        Panic,
        ReturnErr,
        Silent,
    }

    pub struct ScriptedEncoder {
        pub steps: u32,
        pub step_delay: Duration,
        pub honor_cancel: bool,
        pub finish: Finish,
        pub hardware: Option<bool>,
        pub kind: ProgressKind,
        pub calls: AtomicUsize,
        pub last_job: Mutex<Option<EncodeJob>>,
    }

    impl ScriptedEncoder {
        pub fn new(steps: u32, finish: Finish) -> Self {
            Self {
                steps,
                step_delay: Duration::from_millis(2),
                honor_cancel: true,
                finish,
                hardware: Some(false),
                kind: ProgressKind::Compression,
                calls: AtomicUsize::new(0),
                last_job: Mutex::new(None),
            }
        }

        pub fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl Encoder for ScriptedEncoder {
        fn encode(
            &self,
            job: EncodeJob,
            events: mpsc::Sender<EncoderEvent>,
            cancel: CancellationToken,
        ) -> impl Future<Output = anyhow::Result<()>> + Send {
            async move {
                self.calls.fetch_add(1, Ordering::SeqCst);
                *self.last_job.lock().unwrap() = Some(job.clone());

                for step in 1..=self.steps {
                    if self.honor_cancel && cancel.is_cancelled() {
                        let _ = events.send(EncoderEvent::Cancelled { id: job.id.clone() }).await;
                        return Ok(());
                    }
                    tokio::time::sleep(self.step_delay).await;
                    let _ = events
                        .send(EncoderEvent::Progress {
                            id: job.id.clone(),
                            kind: self.kind,
                            value: step as f64 / self.steps as f64,
                        })
                        .await;
                }

                match &self.finish {
                    Finish::Done => {
                        let _ = events
                            .send(EncoderEvent::Done {
                                id: job.id.clone(),
                                output: job.output.clone(),
                            })
                            .await;
                    }
                    Finish::Fail(message) => {
                        let _ = events
                            .send(EncoderEvent::Error {
                                id: job.id.clone(),
                                message: message.clone(),
                            })
                            .await;
                    }
                    Finish::Panic => panic!("Encoder abgestuerzt"),
                    Finish::ReturnErr => return Err(anyhow::anyhow!("ffmpeg nicht gefunden")),
                    Finish::Silent => {}
                }
                Ok(())
            }
        }

        fn hardware_support(&self, _codec: VideoCodec) -> impl Future<Output = anyhow::Result<bool>> + Send {
            let result = self
                .hardware
                .ok_or_else(|| anyhow::anyhow!("Probe fehlgeschlagen"));
            async move { result }
        }
    }
}
