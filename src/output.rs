// Result dispatch: accepted fixes fan out to pluggable sinks (JSON feed
// over a broadcast channel, CSV on disk).

use std::io::Write;

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::warn;

use crate::solver::Fix;

/// Wire record for one fix. Field order is stable and part of the output
/// contract; do not reorder.
#[derive(Debug, Serialize)]
pub struct FixRecord {
    pub icao24: String,
    /// Transmission time, canonical timebase (s).
    pub t0: f64,
    pub lat: f64,
    pub lon: f64,
    /// Geometric altitude (m).
    pub alt: f64,
    /// Row-major 3x3 ECEF covariance (m^2).
    pub covariance: [[f64; 3]; 3],
    pub n_receivers: usize,
    /// (receiver id, tick, timing residual s) per contributor.
    pub receivers: Vec<(usize, u64, f64)>,
    pub chi2_dof: f64,
    /// Wall-clock estimate, ISO 8601 UTC.
    pub time: String,
}

impl FixRecord {
    pub fn from_fix(fix: &Fix) -> Self {
        let time = chrono::DateTime::from_timestamp(
            fix.wall as i64,
            ((fix.wall.fract()) * 1e9) as u32,
        )
        .map(|dt| dt.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string())
        .unwrap_or_default();

        FixRecord {
            icao24: format!("{:06x}", fix.icao24),
            t0: fix.t0,
            lat: fix.lat,
            lon: fix.lon,
            alt: fix.alt,
            covariance: fix.covariance,
            n_receivers: fix.contributions.len(),
            receivers: fix
                .contributions
                .iter()
                .map(|c| (c.receiver, c.tick, c.residual))
                .collect(),
            chi2_dof: fix.chi2_dof,
            time,
        }
    }
}

pub trait OutputSink: Send {
    fn publish(&mut self, fix: &Fix);
}

/// Newline-delimited JSON over a broadcast channel; network writers
/// subscribe and forward to their peers.
pub struct JsonFeed {
    tx: broadcast::Sender<Vec<u8>>,
}

impl JsonFeed {
    pub fn new(tx: broadcast::Sender<Vec<u8>>) -> Self {
        JsonFeed { tx }
    }
}

impl OutputSink for JsonFeed {
    fn publish(&mut self, fix: &Fix) {
        let record = FixRecord::from_fix(fix);
        match serde_json::to_vec(&record) {
            Ok(mut line) => {
                line.push(b'\n');
                // No subscribers is fine; the feed just goes nowhere.
                let _ = self.tx.send(line);
            }
            Err(e) => warn!("failed to serialize fix: {e}"),
        }
    }
}

/// Append-only CSV file, one row per fix.
pub struct CsvOutput {
    writer: std::io::BufWriter<std::fs::File>,
}

impl CsvOutput {
    pub fn create(path: &str) -> std::io::Result<Self> {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        Ok(CsvOutput { writer: std::io::BufWriter::new(file) })
    }
}

impl OutputSink for CsvOutput {
    fn publish(&mut self, fix: &Fix) {
        let r = writeln!(
            self.writer,
            "{:.6},{:06x},{:.6},{:.6},{:.1},{},{:.2}",
            fix.t0,
            fix.icao24,
            fix.lat,
            fix.lon,
            fix.alt,
            fix.contributions.len(),
            fix.chi2_dof,
        )
        .and_then(|_| self.writer.flush());
        if let Err(e) = r {
            warn!("csv output write failed: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::solver::Contribution;

    fn fix() -> Fix {
        Fix {
            icao24: 0x4840d6,
            position: [4_000_000.0, 100_000.0, 4_900_000.0],
            lat: 50.5,
            lon: 1.43,
            alt: 11_500.0,
            covariance: [[100.0, 0.0, 0.0], [0.0, 150.0, 0.0], [0.0, 0.0, 900.0]],
            chi2_dof: 1.7,
            t0: 1234.5,
            wall: 1_700_000_000.25,
            contributions: vec![
                Contribution { receiver: 1, tick: 12_000_000, residual: 1.2e-8 },
                Contribution { receiver: 2, tick: 13_000_000, residual: -0.8e-8 },
                Contribution { receiver: 5, tick: 14_000_000, residual: 0.1e-8 },
            ],
        }
    }

    #[test]
    fn record_field_order_is_stable() {
        let json = serde_json::to_string(&FixRecord::from_fix(&fix())).unwrap();
        let keys: Vec<usize> = [
            "\"icao24\"",
            "\"t0\"",
            "\"lat\"",
            "\"lon\"",
            "\"alt\"",
            "\"covariance\"",
            "\"n_receivers\"",
            "\"receivers\"",
            "\"chi2_dof\"",
            "\"time\"",
        ]
        .iter()
        .map(|k| json.find(k).expect(k))
        .collect();
        assert!(keys.windows(2).all(|w| w[0] < w[1]), "field order drifted: {json}");
    }

    #[test]
    fn record_contents() {
        let record = FixRecord::from_fix(&fix());
        assert_eq!(record.icao24, "4840d6");
        assert_eq!(record.n_receivers, 3);
        assert_eq!(record.receivers[2].0, 5);
        assert!(record.time.starts_with("2023-11-"));
    }

    #[test]
    fn json_feed_delivers_lines() {
        let (tx, mut rx) = broadcast::channel(4);
        let mut feed = JsonFeed::new(tx);
        feed.publish(&fix());
        let line = rx.try_recv().unwrap();
        assert!(line.ends_with(b"\n"));
        let parsed: serde_json::Value = serde_json::from_slice(&line).unwrap();
        assert_eq!(parsed["icao24"], "4840d6");
    }
}
