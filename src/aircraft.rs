// Per-aircraft smoothing: a 3-D constant-velocity Kalman filter over
// accepted position fixes. Supplies initial guesses back to the solver and
// gates fixes that disagree with recent history.

use std::collections::HashMap;

use nalgebra::{Matrix3, Matrix3x6, Matrix6, Matrix6x3, Vector3, Vector6};

use crate::constants::{AIRCRAFT_GATE, AIRCRAFT_TIMEOUT, FTOM};

/// Process noise: white acceleration, 1-sigma (m/s^2).
const ACCEL_SIGMA: f64 = 5.0;

/// Velocity prior when a track is seeded (m/s).
const INITIAL_VELOCITY_SIGMA: f64 = 200.0;

/// Consecutive gated fixes before the track restarts from scratch.
const MAX_OUTLIERS: usize = 3;

pub struct AircraftTrack {
    pub icao24: u32,
    mean: Vector6<f64>,
    cov: Matrix6<f64>,
    initialized: bool,
    outliers: usize,
    pub last_update: f64,
    pub fixes: u64,

    /// Most recent Mode S altitude, for the solver's equality constraint.
    altitude_ft: Option<f64>,
    altitude_wall: f64,
    pub last_seen: f64,
}

impl AircraftTrack {
    fn new(icao24: u32, now: f64) -> Self {
        AircraftTrack {
            icao24,
            mean: Vector6::zeros(),
            cov: Matrix6::zeros(),
            initialized: false,
            outliers: 0,
            last_update: 0.0,
            fixes: 0,
            altitude_ft: None,
            altitude_wall: 0.0,
            last_seen: now,
        }
    }

    fn seed(&mut self, position: [f64; 3], position_cov: &Matrix3<f64>, t: f64) {
        self.mean = Vector6::new(position[0], position[1], position[2], 0.0, 0.0, 0.0);
        let mut cov = Matrix6::zeros();
        for i in 0..3 {
            for j in 0..3 {
                // Inflated so the first few fixes dominate the prior.
                cov[(i, j)] = position_cov[(i, j)] * 4.0;
            }
            cov[(i + 3, i + 3)] = INITIAL_VELOCITY_SIGMA * INITIAL_VELOCITY_SIGMA;
        }
        self.cov = cov;
        self.initialized = true;
        self.outliers = 0;
        self.last_update = t;
    }

    /// Fold in a solver fix. Returns false when the fix fails the
    /// Mahalanobis gate against the track history.
    pub fn update(&mut self, position: [f64; 3], position_cov: &Matrix3<f64>, t: f64) -> bool {
        if !self.initialized || t - self.last_update > AIRCRAFT_TIMEOUT {
            self.seed(position, position_cov, t);
            self.fixes += 1;
            return true;
        }
        let dt = t - self.last_update;
        if dt < 0.0 {
            return false;
        }

        let (mean_pred, cov_pred) = self.predict(dt);

        let h = measurement_matrix();
        let z = Vector3::new(position[0], position[1], position[2]);
        let y = z - h * mean_pred;
        let s = h * cov_pred * h.transpose() + position_cov;
        let Some(s_inv) = s.try_inverse() else {
            return false;
        };

        let d2 = (y.transpose() * s_inv * y)[(0, 0)];
        if d2.sqrt() > AIRCRAFT_GATE {
            self.outliers += 1;
            if self.outliers >= MAX_OUTLIERS {
                // Aircraft genuinely moved on; start over from this fix.
                self.seed(position, position_cov, t);
                self.fixes += 1;
                return true;
            }
            return false;
        }
        self.outliers = 0;

        let k: Matrix6x3<f64> = cov_pred * h.transpose() * s_inv;
        self.mean = mean_pred + k * y;
        self.cov = (Matrix6::identity() - k * h) * cov_pred;
        self.last_update = t;
        self.fixes += 1;
        true
    }

    fn predict(&self, dt: f64) -> (Vector6<f64>, Matrix6<f64>) {
        let mut f = Matrix6::identity();
        for i in 0..3 {
            f[(i, i + 3)] = dt;
        }

        // Discrete white-acceleration noise.
        let q_pp = 0.25 * dt.powi(4);
        let q_pv = 0.5 * dt.powi(3);
        let q_vv = dt.powi(2);
        let mut q = Matrix6::zeros();
        for i in 0..3 {
            q[(i, i)] = q_pp;
            q[(i, i + 3)] = q_pv;
            q[(i + 3, i)] = q_pv;
            q[(i + 3, i + 3)] = q_vv;
        }
        q *= ACCEL_SIGMA * ACCEL_SIGMA * dt;

        (f * self.mean, f * self.cov * f.transpose() + q)
    }

    /// Extrapolated position at time t, while the track is fresh.
    pub fn predicted_position(&self, t: f64) -> Option<[f64; 3]> {
        if !self.initialized || t < self.last_update || t - self.last_update > AIRCRAFT_TIMEOUT {
            return None;
        }
        let dt = t - self.last_update;
        Some([
            self.mean[0] + self.mean[3] * dt,
            self.mean[1] + self.mean[4] * dt,
            self.mean[2] + self.mean[5] * dt,
        ])
    }

    pub fn velocity(&self) -> Option<[f64; 3]> {
        self.initialized
            .then(|| [self.mean[3], self.mean[4], self.mean[5]])
    }
}

#[inline]
fn measurement_matrix() -> Matrix3x6<f64> {
    let mut h = Matrix3x6::zeros();
    for i in 0..3 {
        h[(i, i)] = 1.0;
    }
    h
}

/// Arena of tracks keyed by icao24.
#[derive(Default)]
pub struct AircraftTracker {
    tracks: HashMap<u32, AircraftTrack>,
    pub rejected_fixes: u64,
}

impl AircraftTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Note any Mode S sighting, keeping the altitude fresh for the solver.
    pub fn note_arrival(&mut self, icao24: u32, altitude_ft: Option<i32>, wall: f64) {
        let track = self
            .tracks
            .entry(icao24)
            .or_insert_with(|| AircraftTrack::new(icao24, wall));
        track.last_seen = wall;
        if let Some(alt) = altitude_ft {
            track.altitude_ft = Some(alt as f64);
            track.altitude_wall = wall;
        }
    }

    /// Altitude constraint for the solver: the freshest Mode S altitude,
    /// in metres, if recent enough to still mean anything.
    pub fn recent_altitude(&self, icao24: u32, wall: f64) -> Option<f64> {
        let track = self.tracks.get(&icao24)?;
        let alt = track.altitude_ft?;
        (wall - track.altitude_wall < 45.0).then_some(alt * FTOM)
    }

    /// Initial guess for the solver from the track history.
    pub fn initial_guess(&self, icao24: u32, t: f64) -> Option<[f64; 3]> {
        self.tracks.get(&icao24)?.predicted_position(t)
    }

    /// Fold a fix into the track. Returns false when gated as inconsistent.
    pub fn accept_fix(&mut self, icao24: u32, position: [f64; 3], cov: &Matrix3<f64>, t: f64) -> bool {
        let track = self
            .tracks
            .entry(icao24)
            .or_insert_with(|| AircraftTrack::new(icao24, t));
        track.last_seen = t;
        let ok = track.update(position, cov, t);
        if !ok {
            self.rejected_fixes += 1;
        }
        ok
    }

    pub fn prune(&mut self, now: f64) {
        self.tracks
            .retain(|_, t| now - t.last_seen <= AIRCRAFT_TIMEOUT);
    }

    pub fn len(&self) -> usize {
        self.tracks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    pub fn get(&self, icao24: u32) -> Option<&AircraftTrack> {
        self.tracks.get(&icao24)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_cov() -> Matrix3<f64> {
        Matrix3::identity() * 100.0 // (10 m)^2
    }

    #[test]
    fn track_learns_velocity() {
        let mut track = AircraftTrack::new(1, 0.0);
        // 200 m/s due +x.
        for i in 0..20 {
            let t = i as f64;
            assert!(track.update([200.0 * t, 0.0, 10_000.0], &small_cov(), t));
        }
        let v = track.velocity().unwrap();
        assert!((v[0] - 200.0).abs() < 10.0, "vx {}", v[0]);
        assert!(v[1].abs() < 10.0);

        let p = track.predicted_position(21.0).unwrap();
        assert!((p[0] - 4200.0).abs() < 100.0, "px {}", p[0]);
    }

    #[test]
    fn gate_rejects_teleports() {
        let mut track = AircraftTrack::new(1, 0.0);
        for i in 0..10 {
            let t = i as f64;
            track.update([200.0 * t, 0.0, 10_000.0], &small_cov(), t);
        }
        // 50 km sideways in one second is not an aircraft.
        assert!(!track.update([2000.0, 50_000.0, 10_000.0], &small_cov(), 10.0));
        // But persistent disagreement eventually reseeds.
        assert!(!track.update([2000.0, 50_000.0, 10_000.0], &small_cov(), 10.5));
        assert!(track.update([2000.0, 50_000.0, 10_000.0], &small_cov(), 11.0));
    }

    #[test]
    fn stale_track_reseeds() {
        let mut track = AircraftTrack::new(1, 0.0);
        track.update([0.0, 0.0, 10_000.0], &small_cov(), 0.0);
        // Far beyond the timeout: no gating, fresh seed.
        assert!(track.update([500_000.0, 0.0, 10_000.0], &small_cov(), 100.0));
    }

    #[test]
    fn tracker_altitude_freshness() {
        let mut tracker = AircraftTracker::new();
        tracker.note_arrival(1, Some(10_000), 1000.0);
        let alt = tracker.recent_altitude(1, 1010.0).unwrap();
        assert!((alt - 10_000.0 * FTOM).abs() < 0.1);
        assert!(tracker.recent_altitude(1, 1050.0).is_none());
        assert!(tracker.recent_altitude(2, 1000.0).is_none());
    }

    #[test]
    fn tracker_prunes_silent_aircraft() {
        let mut tracker = AircraftTracker::new();
        tracker.note_arrival(1, None, 1000.0);
        tracker.note_arrival(2, None, 1020.0);
        tracker.prune(1040.0);
        assert_eq!(tracker.len(), 1);
        assert!(tracker.get(2).is_some());
    }
}
