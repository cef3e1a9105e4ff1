// Relative clock model for one unordered receiver pair.
//
// State is x = [delta, rdot]: the instantaneous offset between the two
// session timebases (t_peer ~ t_base + delta) and the relative rate.
// Updated from geometry-corrected joint DF17 observations; the observation
// is independent of the unknown transmission time.

use std::collections::VecDeque;

use nalgebra::{Matrix2, Vector2};

use crate::constants::{
    PAIR_BOOTSTRAP_OBS, PAIR_BOOTSTRAP_WINDOW, PAIR_INNOVATION_GATE,
    PAIR_MAX_CONSECUTIVE_REJECTS, PAIR_NOISE_FLOOR, PAIR_PUBLISH_MIN_OBS, PAIR_Q_OFFSET,
    PAIR_Q_RATE,
};

/// Innovations retained for the robust jitter estimate.
const JITTER_WINDOW: usize = 32;

/// Observations deviating from the tracked offset by more than this are
/// geometry contradictions (mispaired sync points), not measurements. The
/// offset itself may legitimately be huge; its jumps may not.
const MAX_PLAUSIBLE_JUMP: f64 = 1.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairState {
    /// Wide prior, not yet trusted by the graph.
    Bootstrap,
    /// Converged; eligible for publication.
    Tracking,
}

/// One geometry-corrected joint observation.
#[derive(Debug, Clone, Copy)]
pub struct PairObservation {
    /// (t_peer - tau_peer) - (t_base - tau_base), seconds.
    pub z: f64,
    /// Measurement variance: receiver jitters plus geometric dilution.
    pub var: f64,
    /// Observation epoch on the base receiver's clock (s), for Delta-t.
    pub t_base: f64,
}

#[derive(Debug)]
pub struct ClockPair {
    pub base: usize,
    pub peer: usize,

    x: Vector2<f64>,
    p: Matrix2<f64>,

    state: PairState,
    seeded: bool,
    last_t_base: f64,

    pub accepted: usize,
    pub updated_wall: f64,
    bootstrap_started: f64,
    bootstrap_accepted: usize,
    consecutive_rejects: usize,
    pub resets: usize,

    innovations: VecDeque<f64>,
    jitter: f64,
}

impl ClockPair {
    pub fn new(base: usize, peer: usize, now: f64) -> Self {
        assert!(base < peer, "pair must be ordered");
        ClockPair {
            base,
            peer,
            x: Vector2::zeros(),
            p: bootstrap_prior(),
            state: PairState::Bootstrap,
            seeded: false,
            last_t_base: 0.0,
            accepted: 0,
            updated_wall: now,
            bootstrap_started: now,
            bootstrap_accepted: 0,
            consecutive_rejects: 0,
            resets: 0,
            innovations: VecDeque::with_capacity(JITTER_WINDOW),
            jitter: PAIR_NOISE_FLOOR.sqrt(),
        }
    }

    /// Discard all state and return to bootstrap.
    pub fn reset(&mut self, now: f64) {
        self.x = Vector2::zeros();
        self.p = bootstrap_prior();
        self.state = PairState::Bootstrap;
        self.seeded = false;
        self.accepted = 0;
        self.bootstrap_started = now;
        self.bootstrap_accepted = 0;
        self.consecutive_rejects = 0;
        self.resets += 1;
        self.innovations.clear();
        self.jitter = PAIR_NOISE_FLOOR.sqrt();
    }

    /// Feed one observation. Returns true when it was accepted.
    pub fn update(&mut self, obs: &PairObservation, wall: f64) -> bool {
        let r = obs.var.max(PAIR_NOISE_FLOOR);

        if !self.seeded {
            // First observation after (re)start seeds the offset outright;
            // the rate keeps its wide prior until Delta-t accumulates.
            self.x = Vector2::new(obs.z, 0.0);
            self.p[(0, 0)] = r;
            self.p[(0, 1)] = 0.0;
            self.p[(1, 0)] = 0.0;
            self.seeded = true;
            self.last_t_base = obs.t_base;
            self.note_accepted(0.0, wall);
            return true;
        }

        let dt = obs.t_base - self.last_t_base;
        if dt < 0.0 {
            // Out-of-order delivery across receivers; skip rather than run
            // the filter backward.
            return false;
        }
        self.predict(dt);

        let y = obs.z - self.x[0];
        if y.abs() > MAX_PLAUSIBLE_JUMP {
            // A second of apparent jump cannot come from oscillators we
            // have been tracking; something upstream mispaired the
            // observation. Start over.
            self.reset(wall);
            return false;
        }
        let s = self.p[(0, 0)] + r;
        if y.abs() > PAIR_INNOVATION_GATE * s.sqrt() {
            self.consecutive_rejects += 1;
            if self.consecutive_rejects >= PAIR_MAX_CONSECUTIVE_REJECTS {
                self.reset(wall);
            }
            return false;
        }

        let k = Vector2::new(self.p[(0, 0)] / s, self.p[(1, 0)] / s);
        self.x += k * y;
        // P <- (I - K H) P with H = [1, 0].
        let ph = Vector2::new(self.p[(0, 0)], self.p[(0, 1)]);
        self.p -= k * ph.transpose();

        self.last_t_base = obs.t_base;
        self.note_accepted(y, wall);
        true
    }

    fn predict(&mut self, dt: f64) {
        let f = Matrix2::new(1.0, dt, 0.0, 1.0);
        let q = Matrix2::new(
            PAIR_Q_OFFSET * PAIR_Q_OFFSET * dt,
            0.0,
            0.0,
            PAIR_Q_RATE * PAIR_Q_RATE * dt,
        );
        self.x[0] += self.x[1] * dt;
        self.p = f * self.p * f.transpose() + q;
    }

    fn note_accepted(&mut self, innovation: f64, wall: f64) {
        self.consecutive_rejects = 0;
        self.accepted += 1;
        self.updated_wall = wall;

        if self.innovations.len() == JITTER_WINDOW {
            self.innovations.pop_front();
        }
        self.innovations.push_back(innovation);
        self.jitter = robust_sigma(&self.innovations).max(PAIR_NOISE_FLOOR.sqrt());

        if self.state == PairState::Bootstrap {
            if wall - self.bootstrap_started > PAIR_BOOTSTRAP_WINDOW {
                self.bootstrap_started = wall;
                self.bootstrap_accepted = 0;
            }
            self.bootstrap_accepted += 1;
            if self.bootstrap_accepted >= PAIR_BOOTSTRAP_OBS {
                self.state = PairState::Tracking;
            }
        }
    }

    /// Offset at a given base-clock epoch, extrapolated by the rate.
    #[inline]
    pub fn offset_at(&self, t_base: f64) -> f64 {
        self.x[0] + self.x[1] * (t_base - self.last_t_base)
    }

    /// Map a base-clock time onto the peer's clock.
    #[inline]
    pub fn predict_peer(&self, t_base: f64) -> f64 {
        t_base + self.offset_at(t_base)
    }

    /// Map a peer-clock time onto the base's clock.
    #[inline]
    pub fn predict_base(&self, t_peer: f64) -> f64 {
        (t_peer - self.x[0] + self.x[1] * self.last_t_base) / (1.0 + self.x[1])
    }

    pub fn state(&self) -> PairState {
        self.state
    }

    pub fn offset(&self) -> f64 {
        self.x[0]
    }

    pub fn rate(&self) -> f64 {
        self.x[1]
    }

    pub fn rate_ppm(&self) -> f64 {
        self.x[1] * 1e6
    }

    /// Filter standard deviation of the offset estimate (s).
    pub fn sigma(&self) -> f64 {
        self.p[(0, 0)].max(0.0).sqrt()
    }

    /// Filter standard deviation of the rate estimate (dimensionless).
    pub fn rate_sigma(&self) -> f64 {
        self.p[(1, 1)].max(0.0).sqrt()
    }

    /// Robust jitter of accepted innovations (s); the graph edge weight.
    pub fn jitter(&self) -> f64 {
        self.jitter
    }

    /// Ready for the clock graph?
    pub fn publishable(&self) -> bool {
        self.state == PairState::Tracking && self.accepted >= PAIR_PUBLISH_MIN_OBS
    }

    pub fn last_t_base(&self) -> f64 {
        self.last_t_base
    }
}

fn bootstrap_prior() -> Matrix2<f64> {
    Matrix2::new(1.0, 0.0, 0.0, 1e-6)
}

/// 1.4826 * MAD: a consistent robust sigma under Gaussian noise.
fn robust_sigma(samples: &VecDeque<f64>) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }
    let mut v: Vec<f64> = samples.iter().copied().collect();
    let med = median(&mut v);
    let mut dev: Vec<f64> = samples.iter().map(|s| (s - med).abs()).collect();
    1.4826 * median(&mut dev)
}

fn median(v: &mut [f64]) -> f64 {
    v.sort_by(|a, b| a.partial_cmp(b).unwrap());
    let n = v.len();
    if n % 2 == 1 {
        v[n / 2]
    } else {
        0.5 * (v[n / 2 - 1] + v[n / 2])
    }
}
