// Fortschritts-Events und deren Verteilung an Abonnenten.

pub mod router;

use serde::Serialize;

pub use router::{ProgressRouter, Subscription};

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ProgressKind {
    Compression,
    Download,
}

/// Ein Fortschritts-Update eines Jobs. `value` ist ein Anteil 0.0 – 1.0.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ProgressEvent {
    pub job_id: String,
    pub kind: ProgressKind,
    pub value: f64,
}

impl ProgressEvent {
    pub fn compression(job_id: impl Into<String>, value: f64) -> Self {
        Self {
            job_id: job_id.into(),
            kind: ProgressKind::Compression,
            value,
        }
    }

    pub fn download(job_id: impl Into<String>, value: f64) -> Self {
        Self {
            job_id: job_id.into(),
            kind: ProgressKind::Download,
            value,
        }
    }
}
