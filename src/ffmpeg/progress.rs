// Parst FFmpeg -progress pipe:2 Ausgabe (key=value Format auf stderr).
// Sammelt Bloecke bis "progress=continue" oder "progress=end" und drosselt
// die Weitergabe gemaess progress_divider.

use std::collections::HashMap;

/// Strukturierter Fortschritt aus einem FFmpeg -progress Block.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FfmpegProgress {
    pub out_time_us: i64,
    pub is_done: bool,
}

/// Sammelt key=value Zeilen und produziert FfmpegProgress wenn ein Block komplett ist.
#[derive(Default)]
pub struct ProgressParser {
    current_block: HashMap<String, String>,
}

impl ProgressParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fuettert eine einzelne Zeile aus stderr.
    /// Gibt Some(FfmpegProgress) zurueck wenn ein Block abgeschlossen ist.
    pub fn feed_line(&mut self, line: &str) -> Option<FfmpegProgress> {
        let (key, value) = line.trim().split_once('=')?;
        let (key, value) = (key.trim(), value.trim());

        if key == "progress" {
            let progress = FfmpegProgress {
                out_time_us: self.out_time_us(),
                is_done: value == "end",
            };
            self.current_block.clear();
            return Some(progress);
        }

        self.current_block.insert(key.to_string(), value.to_string());
        None
    }

    fn parse<T: std::str::FromStr>(&self, key: &str) -> Option<T> {
        self.current_block.get(key).and_then(|v| v.parse().ok())
    }

    /// Aeltere FFmpeg-Versionen liefern nur out_time_ms (trotz Name in µs).
    fn out_time_us(&self) -> i64 {
        self.parse("out_time_us")
            .or_else(|| self.parse("out_time_ms"))
            .unwrap_or(0)
    }
}

/// Berechnet den Fortschritt (0.0 – 1.0) anhand der aktuellen
/// und der Gesamt-Dauer.
pub fn calculate_progress(current_time_us: i64, total_duration_us: i64) -> f64 {
    if total_duration_us <= 0 {
        return 0.0;
    }
    (current_time_us as f64 / total_duration_us as f64).clamp(0.0, 1.0)
}

/// Drosselt Fortschritts-Updates auf ganze Prozent.
/// divider 0 → jede Aenderung, sonst nur Prozentwerte die durch divider teilbar sind.
pub struct ProgressThrottle {
    divider: u32,
    last_percent: Option<u32>,
}

impl ProgressThrottle {
    pub fn new(divider: u32) -> Self {
        Self {
            divider,
            last_percent: None,
        }
    }

    /// Gibt den zu meldenden Anteil zurueck oder None wenn gedrosselt.
    pub fn accept(&mut self, fraction: f64) -> Option<f64> {
        // Epsilon gegen 0.29 * 100 = 28.999…
        let percent = (fraction.clamp(0.0, 1.0) * 100.0 + 1e-9).floor() as u32;
        if self.last_percent == Some(percent) {
            return None;
        }
        if self.divider != 0 && percent % self.divider != 0 {
            return None;
        }
        self.last_percent = Some(percent);
        Some(percent as f64 / 100.0)
    }
}
