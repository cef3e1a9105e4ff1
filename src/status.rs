// Read-only status snapshots for dashboards: sync.json (pair quality per
// receiver) and coverage.json (per-receiver bounding boxes). Written
// atomically to the work dir and served over HTTP by the main binary.

use std::collections::HashMap;
use std::path::Path;

use serde_json::{json, Map, Value};
use tracing::warn;

use crate::clock::pair::ClockPair;

/// Per-receiver coverage extent, grown from decoded ADS-B sightings.
#[derive(Debug, Clone, Copy)]
pub struct BoundingBox {
    pub lat_min: f64,
    pub lat_max: f64,
    pub lon_min: f64,
    pub lon_max: f64,
    pub positions: u64,
}

impl BoundingBox {
    pub fn seed(lat: f64, lon: f64) -> Self {
        BoundingBox { lat_min: lat, lat_max: lat, lon_min: lon, lon_max: lon, positions: 1 }
    }

    pub fn grow(&mut self, lat: f64, lon: f64) {
        self.lat_min = self.lat_min.min(lat);
        self.lat_max = self.lat_max.max(lat);
        self.lon_min = self.lon_min.min(lon);
        self.lon_max = self.lon_max.max(lon);
        self.positions += 1;
    }
}

/// sync.json: receiver -> { peers: { peer: [n_obs, jitter_ns, rate_ppm] } }.
pub fn sync_snapshot<'a>(
    pairs: impl Iterator<Item = &'a ClockPair>,
    names: &HashMap<usize, String>,
) -> Value {
    let mut per_user: Map<String, Value> = Map::new();

    let mut insert = |from: usize, to: usize, pair: &ClockPair, rate_sign: f64| {
        let (Some(from_name), Some(to_name)) = (names.get(&from), names.get(&to)) else {
            return;
        };
        let entry = per_user
            .entry(from_name.clone())
            .or_insert_with(|| json!({ "peers": {} }));
        entry["peers"][to_name.as_str()] = json!([
            pair.accepted,
            (pair.jitter() * 1e9).round(),
            (rate_sign * pair.rate_ppm() * 100.0).round() / 100.0,
        ]);
    };

    for pair in pairs {
        if pair.accepted == 0 {
            continue;
        }
        insert(pair.base, pair.peer, pair, 1.0);
        insert(pair.peer, pair.base, pair, -1.0);
    }

    Value::Object(per_user)
}

fn round4(v: f64) -> f64 {
    (v * 1e4).round() / 1e4
}

/// coverage.json: receiver -> bounding box of decoded positions.
pub fn coverage_snapshot(
    coverage: &HashMap<usize, BoundingBox>,
    names: &HashMap<usize, String>,
) -> Value {
    let mut out = Map::new();
    for (uid, bbox) in coverage {
        let Some(name) = names.get(uid) else { continue };
        out.insert(
            name.clone(),
            json!({
                "lat_min": round4(bbox.lat_min),
                "lat_max": round4(bbox.lat_max),
                "lon_min": round4(bbox.lon_min),
                "lon_max": round4(bbox.lon_max),
                "positions": bbox.positions,
            }),
        );
    }
    Value::Object(out)
}

/// Write via a temp file and rename so dashboard readers never see a
/// partial document.
pub fn write_json_atomic(dir: &Path, name: &str, value: &Value) {
    let tmp = dir.join(format!("{name}.tmp"));
    let path = dir.join(name);
    let body = match serde_json::to_string(value) {
        Ok(s) => s,
        Err(e) => {
            warn!("failed to serialize {name}: {e}");
            return;
        }
    };
    if let Err(e) = std::fs::write(&tmp, body) {
        warn!("failed to write {}: {e}", tmp.display());
        return;
    }
    if let Err(e) = std::fs::rename(&tmp, &path) {
        let _ = std::fs::remove_file(&tmp);
        warn!("failed to rename {} -> {}: {e}", tmp.display(), path.display());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::pair::PairObservation;

    fn names() -> HashMap<usize, String> {
        HashMap::from([(1, "alpha".into()), (2, "bravo".into())])
    }

    fn converged_pair() -> ClockPair {
        let mut pair = ClockPair::new(1, 2, 0.0);
        for i in 0..10 {
            let t = i as f64;
            pair.update(&PairObservation { z: 1e-3 + 2e-6 * t, var: 1e-14, t_base: t }, t);
        }
        pair
    }

    #[test]
    fn sync_snapshot_is_symmetric() {
        let pair = converged_pair();
        let snap = sync_snapshot([&pair].into_iter(), &names());

        let fwd = &snap["alpha"]["peers"]["bravo"];
        let rev = &snap["bravo"]["peers"]["alpha"];
        assert_eq!(fwd[0], rev[0]);
        // Rate flips sign in the reverse direction.
        let f = fwd[2].as_f64().unwrap();
        let r = rev[2].as_f64().unwrap();
        assert!((f + r).abs() < 1e-9);
        assert!((f - 2.0).abs() < 0.1, "rate ppm {f}");
    }

    #[test]
    fn coverage_snapshot_rounds_and_names() {
        let mut bbox = BoundingBox::seed(47.123456, 8.654321);
        bbox.grow(48.0, 7.9);
        let coverage = HashMap::from([(1usize, bbox)]);
        let snap = coverage_snapshot(&coverage, &names());
        assert_eq!(snap["alpha"]["positions"], 2);
        assert_eq!(snap["alpha"]["lat_max"], 48.0);
        assert!(snap.get("bravo").is_none());
    }

    #[test]
    fn atomic_write_creates_file() {
        let dir = std::env::temp_dir().join("mlatd-status-test");
        std::fs::create_dir_all(&dir).unwrap();
        write_json_atomic(&dir, "sync.json", &json!({"ok": true}));
        let body = std::fs::read_to_string(dir.join("sync.json")).unwrap();
        assert!(body.contains("ok"));
        let _ = std::fs::remove_dir_all(&dir);
    }
}
