// Fehler-Taxonomie der Orchestrierungs-Schicht.
// Kollaborateure (FFmpeg, ffprobe, OS) liefern anyhow-Fehler, die hier
// an der Kern-Grenze in die festen Varianten uebersetzt werden.

use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CompressError {
    /// Job-ID wird wiederverwendet, solange der erste Job noch aktiv ist.
    #[error("Job-ID bereits aktiv: {0}")]
    DuplicateJob(String),

    /// Basis-Probe (Dauer/Container) der Quelldatei fehlgeschlagen.
    #[error("Quelldatei nicht lesbar ({path}): {reason}")]
    UnreadableSource { path: String, reason: String },

    /// Encoder ist gescheitert; enthaelt die Ursache inkl. Kontext-Kette.
    #[error("Kompression fehlgeschlagen: {0:#}")]
    EncodingFailed(anyhow::Error),

    /// Vom Aufrufer abgebrochen und vom Encoder bestaetigt.
    #[error("Kompression abgebrochen")]
    Cancelled,

    /// Fehler des OS-Kollaborators beim Hintergrund-Task, unveraendert weitergereicht.
    #[error("Hintergrund-Task: {0:#}")]
    BackgroundTask(anyhow::Error),
}

impl CompressError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CompressError::DuplicateJob(_) => ErrorKind::DuplicateJob,
            CompressError::UnreadableSource { .. } => ErrorKind::UnreadableSource,
            CompressError::EncodingFailed(_) => ErrorKind::EncodingFailed,
            CompressError::Cancelled => ErrorKind::Cancelled,
            CompressError::BackgroundTask(_) => ErrorKind::BackgroundTask,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, CompressError::Cancelled)
    }
}

/// Serialisierbare Fehlerart fuer das IPC-Protokoll.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    DuplicateJob,
    UnreadableSource,
    EncodingFailed,
    Cancelled,
    BackgroundTask,
}

pub type Result<T> = std::result::Result<T, CompressError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancelled_is_distinguishable_from_failure() {
        let cancelled = CompressError::Cancelled;
        let failed = CompressError::EncodingFailed(anyhow::anyhow!("exit 1"));
        assert!(cancelled.is_cancelled());
        assert!(!failed.is_cancelled());
        assert_eq!(cancelled.kind(), ErrorKind::Cancelled);
        assert_eq!(failed.kind(), ErrorKind::EncodingFailed);
    }

    #[test]
    fn encoding_failed_keeps_context_chain() {
        let err = anyhow::anyhow!("stderr geschlossen").context("FFmpeg abgestuerzt");
        let msg = CompressError::EncodingFailed(err).to_string();
        assert!(msg.contains("FFmpeg abgestuerzt"));
        assert!(msg.contains("stderr geschlossen"));
    }

    #[test]
    fn kind_serializes_snake_case() {
        let json = serde_json::to_string(&ErrorKind::UnreadableSource).unwrap();
        assert_eq!(json, "\"unreadable_source\"");
    }
}
