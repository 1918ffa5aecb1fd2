// Konfiguration des Backends aus CLI-Argumenten und Umgebungsvariablen.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

/// Video-Compressor Backend – IPC ueber stdin/stdout (NDJSON)
#[derive(Parser, Debug, Clone)]
#[command(name = "video-compressor-backend")]
#[command(author, version, about, long_about = None)]
pub struct Config {
    /// Pfad zum ffmpeg-Binary
    #[arg(long, env = "COMPRESSOR_FFMPEG", default_value = "ffmpeg")]
    pub ffmpeg: PathBuf,

    /// Pfad zum ffprobe-Binary
    #[arg(long, env = "COMPRESSOR_FFPROBE", default_value = "ffprobe")]
    pub ffprobe: PathBuf,

    /// Zielverzeichnis fuer komprimierte Dateien
    #[arg(long, default_value_os_t = default_output_dir())]
    pub output_dir: PathBuf,

    /// Anzahl gleichzeitig laufender Encoder
    #[arg(long, default_value_t = 1, value_parser = parse_max_parallel)]
    pub max_parallel: usize,

    /// Ausfuehrungsbudget eines Hintergrund-Tasks in Sekunden
    #[arg(long)]
    pub background_budget_secs: Option<u64>,

    /// Log-Level (ueberschreibt RUST_LOG)
    #[arg(long)]
    pub log_level: Option<log::LevelFilter>,
}

fn default_output_dir() -> PathBuf {
    std::env::temp_dir().join("video-compressor")
}

fn parse_max_parallel(s: &str) -> Result<usize, String> {
    match s.parse::<usize>() {
        Ok(0) => Err("muss mindestens 1 sein".to_string()),
        Ok(n) => Ok(n),
        Err(e) => Err(format!("keine Zahl: {e}")),
    }
}

impl Config {
    pub fn background_budget(&self) -> Option<Duration> {
        self.background_budget_secs.map(Duration::from_secs)
    }
}
