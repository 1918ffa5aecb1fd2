// Einstiegspunkt des Rust-Backends.
// Startet den IPC-Server (stdin/stdout NDJSON).

use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use log::{error, info, warn};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use video_compressor::ipc::{self, protocol::Response};
use video_compressor::{Config, VideoCompressor};

/// Wartezeit fuer laufende Jobs beim Beenden.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

fn init_logging(level: Option<log::LevelFilter>) {
    // stdout gehoert dem Protokoll, Logs gehen nach stderr
    let mut builder = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
    if let Some(level) = level {
        builder.filter_level(level);
    }
    builder
        .target(env_logger::Target::Stderr)
        .format(|buf, record| {
            writeln!(
                buf,
                "{} [{}] {}: {}",
                buf.timestamp_millis(),
                record.level(),
                record.target(),
                record.args()
            )
        })
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::parse();
    init_logging(config.log_level);
    info!(
        "Backend startet (ffmpeg={}, max_parallel={}, output_dir={})",
        config.ffmpeg.display(),
        config.max_parallel,
        config.output_dir.display()
    );

    // Channel fuer Responses (von allen Tasks an den stdout-Writer)
    let (response_tx, response_rx) = mpsc::channel::<Response>(256);

    // Eltern-Token aller Jobs
    let shutdown_token = CancellationToken::new();
    let compressor = Arc::new(VideoCompressor::from_config(&config, shutdown_token.clone()));

    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();

    // stdout-Writer Task: Schreibt Response-Events als NDJSON
    let mut stdout_handle = tokio::spawn(ipc::server::write_stdout(response_rx));
    let stdout_abort = stdout_handle.abort_handle();

    // stdin-Reader Task: Liest Requests und dispatcht sie
    let stdin_handle = tokio::spawn(ipc::server::read_stdin(
        Arc::clone(&compressor),
        response_tx.clone(),
        shutdown_tx,
    ));
    let stdin_abort = stdin_handle.abort_handle();

    let mut writer_done = false;

    // Auf Shutdown warten (entweder via Shutdown-Request, stdin EOF, oder stdout-Fehler)
    tokio::select! {
        _ = shutdown_rx => {
            info!("Shutdown-Signal empfangen, beende...");
        }
        result = stdin_handle => {
            match result {
                Ok(Err(e)) => error!("stdin-Handler Fehler: {e:#}"),
                Err(e) => error!("stdin-Handler Task Fehler: {e}"),
                Ok(Ok(())) => info!("stdin geschlossen, beende..."),
            }
        }
        result = &mut stdout_handle => {
            writer_done = true;
            match result {
                Ok(Err(e)) => error!("stdout-Writer Fehler: {e:#}, beende..."),
                Err(e) => error!("stdout-Writer Task Fehler: {e}, beende..."),
                Ok(Ok(())) => info!("stdout-Writer beendet, beende..."),
            }
        }
    }

    // --- Graceful Shutdown ---

    // 1. Alle laufenden Jobs ueber das Eltern-Token abbrechen
    shutdown_token.cancel();
    stdin_abort.abort();

    // 2. Warten bis die Registry leer ist (Encoder raeumen Teil-Dateien auf)
    let drained = tokio::time::timeout(SHUTDOWN_GRACE, async {
        while !compressor.active_jobs().is_empty() {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await;
    if drained.is_err() {
        warn!(
            "{} Jobs nach Timeout noch aktiv",
            compressor.active_jobs().len()
        );
    }

    if let Err(e) = compressor.deactivate_background_task().await {
        warn!("Hintergrund-Task konnte nicht freigegeben werden: {e}");
    }

    // 3. Senders droppen, damit der Writer die letzten Responses schreibt und endet
    drop(response_tx);
    drop(compressor);

    if !writer_done && tokio::time::timeout(SHUTDOWN_GRACE, stdout_handle).await.is_err() {
        warn!("stdout-Writer Timeout, wird abgebrochen");
        stdout_abort.abort();
    }

    Ok(())
}
