// Clock synchronization: opportunistic pairing of DF17 sightings into
// per-receiver-pair observations, the pair Kalman filters, and the
// translation graph built over them.

pub mod graph;
pub mod pair;

use std::collections::HashMap;

use tracing::debug;

use crate::constants::{C_AIR, MAX_RANGE, MIN_NUC, PAIR_IDLE_TIMEOUT, SYNC_PAIRING_WINDOW};
use crate::decoder::AdsbDecoder;
use crate::geodesy;
use crate::session::Arrival;

use pair::{ClockPair, PairObservation};

/// What the sync engine needs to know about a receiver.
#[derive(Debug, Clone, Copy)]
pub struct SyncReceiver {
    pub uid: usize,
    pub position: [f64; 3],
    /// Single-reading jitter (s) from the clock spec.
    pub jitter: f64,
}

/// One receiver's delay-corrected observation of a reference transmission.
#[derive(Debug, Clone, Copy)]
struct Sighting {
    receiver: usize,
    /// Arrival time in the receiver's session timebase (s).
    t: f64,
    /// Propagation delay transmitter -> antenna (s).
    tau: f64,
    wall: f64,
}

enum PointState {
    /// Known not to yield a reference position; remembered so repeated
    /// copies of the frame are dropped cheaply.
    Invalid,
    Resolved {
        position: [f64; 3],
        latlon: (f64, f64),
        nuc: u8,
        sightings: Vec<Sighting>,
    },
}

struct SyncPoint {
    state: PointState,
    created: f64,
}

/// Tracks all pair filters and the sync-point cache keyed by payload.
pub struct SyncTracker {
    pairs: HashMap<(usize, usize), ClockPair>,
    points: HashMap<Vec<u8>, SyncPoint>,
    decoder: AdsbDecoder,

    pub observations: u64,
    pub range_exceeded: u64,
}

impl SyncTracker {
    pub fn new() -> Self {
        SyncTracker {
            pairs: HashMap::new(),
            points: HashMap::new(),
            decoder: AdsbDecoder::new(),
            observations: 0,
            range_exceeded: 0,
        }
    }

    /// Feed a DF17/18 arrival. `t` is the arrival time in the receiver's
    /// session timebase (s). Updates every pair filter this sighting
    /// completes an observation for. Returns the decoded reference
    /// position when this receiver's sighting was usable.
    pub fn on_reference_frame(
        &mut self,
        arrival: &Arrival,
        t: f64,
        receivers: &HashMap<usize, SyncReceiver>,
    ) -> Option<(f64, f64)> {
        let rx = *receivers.get(&arrival.receiver)?;

        if !self.points.contains_key(&arrival.payload) {
            // First copy of this frame anywhere: try to resolve it to a
            // reference position. Each unique payload feeds the CPR
            // assembler exactly once.
            let state = match self.decoder.decode_adsb(&arrival.payload, arrival.wall) {
                Some(s) if s.nuc >= MIN_NUC => PointState::Resolved {
                    position: geodesy::llh_to_ecef(s.lat, s.lon, s.alt_m),
                    latlon: (s.lat, s.lon),
                    nuc: s.nuc,
                    sightings: Vec::new(),
                },
                _ => PointState::Invalid,
            };
            self.points.insert(
                arrival.payload.clone(),
                SyncPoint { state, created: arrival.wall },
            );
        }

        let point = self.points.get_mut(&arrival.payload).expect("just inserted");
        let PointState::Resolved { position, latlon, nuc, sightings } = &mut point.state else {
            return None;
        };
        let position = *position;
        let latlon = *latlon;
        let nuc = *nuc;

        if sightings.iter().any(|s| s.receiver == rx.uid) {
            return None; // duplicate report from the same receiver
        }

        let range = geodesy::distance(position, rx.position);
        if range > MAX_RANGE {
            self.range_exceeded += 1;
            return None;
        }

        let own = Sighting {
            receiver: rx.uid,
            t,
            tau: range / C_AIR,
            wall: arrival.wall,
        };

        for other in sightings.iter() {
            if (own.wall - other.wall).abs() > SYNC_PAIRING_WINDOW {
                continue;
            }
            let Some(other_rx) = receivers.get(&other.receiver) else {
                continue;
            };

            let sigma_pos = nuc_position_sigma(nuc);
            let obs = build_observation(&own, rx.position, other, other_rx.position,
                                        position, sigma_pos, rx.jitter, other_rx.jitter);

            let (base, peer) = ordered(rx.uid, other.receiver);
            let pair = self
                .pairs
                .entry((base, peer))
                .or_insert_with(|| ClockPair::new(base, peer, arrival.wall));
            if pair.update(&obs, arrival.wall) {
                self.observations += 1;
            } else {
                debug!(base, peer, z = obs.z, "pair observation rejected");
            }
        }

        sightings.push(own);
        Some(latlon)
    }

    /// Drop stale sync points and idle pairs.
    pub fn cleanup(&mut self, now: f64) {
        self.points
            .retain(|_, p| now - p.created <= 2.0 * SYNC_PAIRING_WINDOW);
        self.pairs
            .retain(|_, p| now - p.updated_wall <= PAIR_IDLE_TIMEOUT);
        self.decoder.prune(now);
    }

    /// Reset all pair state touching a receiver (clock reset, BadTick).
    pub fn receiver_reset(&mut self, uid: usize, now: f64) {
        for ((base, peer), pair) in self.pairs.iter_mut() {
            if *base == uid || *peer == uid {
                pair.reset(now);
            }
        }
    }

    /// Remove all pair state touching a receiver (disconnect, death).
    pub fn receiver_drop(&mut self, uid: usize) {
        self.pairs.retain(|(base, peer), _| *base != uid && *peer != uid);
    }

    pub fn pairs(&self) -> impl Iterator<Item = &ClockPair> {
        self.pairs.values()
    }

    pub fn pair(&self, a: usize, b: usize) -> Option<&ClockPair> {
        self.pairs.get(&ordered(a, b))
    }

    pub fn num_pairs(&self) -> usize {
        self.pairs.len()
    }

    pub fn num_publishable(&self) -> usize {
        self.pairs.values().filter(|p| p.publishable()).count()
    }
}

impl Default for SyncTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[inline]
fn ordered(a: usize, b: usize) -> (usize, usize) {
    if a < b { (a, b) } else { (b, a) }
}

/// Build the pair observation with base < peer ordering:
/// z = (t_peer - tau_peer) - (t_base - tau_base).
#[allow(clippy::too_many_arguments)]
fn build_observation(
    own: &Sighting,
    own_pos: [f64; 3],
    other: &Sighting,
    other_pos: [f64; 3],
    tx_pos: [f64; 3],
    sigma_pos: f64,
    own_jitter: f64,
    other_jitter: f64,
) -> PairObservation {
    let own_corr = own.t - own.tau;
    let other_corr = other.t - other.tau;

    let (base_corr, peer_corr) = if own.receiver < other.receiver {
        (own_corr, other_corr)
    } else {
        (other_corr, own_corr)
    };

    // Reference-position error projects onto the delay difference through
    // the difference of the two line-of-sight unit vectors.
    let u_own = unit_from(tx_pos, own_pos);
    let u_other = unit_from(tx_pos, other_pos);
    let du = [
        u_own[0] - u_other[0],
        u_own[1] - u_other[1],
        u_own[2] - u_other[2],
    ];
    let g = (du[0] * du[0] + du[1] * du[1] + du[2] * du[2]).sqrt();
    let geom_var = (sigma_pos * g / C_AIR).powi(2);

    PairObservation {
        z: peer_corr - base_corr,
        var: own_jitter * own_jitter + other_jitter * other_jitter + geom_var,
        t_base: base_corr,
    }
}

#[inline]
fn unit_from(from: [f64; 3], to: [f64; 3]) -> [f64; 3] {
    let d = [to[0] - from[0], to[1] - from[1], to[2] - from[2]];
    let n = (d[0] * d[0] + d[1] * d[1] + d[2] * d[2]).sqrt().max(1e-9);
    [d[0] / n, d[1] / n, d[2] / n]
}

/// Horizontal position uncertainty implied by NUCp (m).
fn nuc_position_sigma(nuc: u8) -> f64 {
    match nuc {
        9.. => 75.0,
        8 => 185.0,
        7 => 370.0,
        6 => 926.0,
        _ => 1852.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn observation_is_transmission_time_invariant() {
        // Two receivers at different ranges from the same transmitter:
        // after delay correction, z depends only on the clock offsets.
        let tx = [4_000_000.0, 0.0, 5_000_000.0];
        let p_a = [4_010_000.0, 0.0, 5_000_000.0];
        let p_b = [4_000_000.0, 30_000.0, 5_000_000.0];

        let tau_a = geodesy::distance(tx, p_a) / C_AIR;
        let tau_b = geodesy::distance(tx, p_b) / C_AIR;

        let offset_b = 0.25; // b's clock runs 0.25 s ahead of a's
        for t0 in [0.0, 1.0, 7.5] {
            let a = Sighting { receiver: 1, t: t0 + tau_a, tau: tau_a, wall: 0.0 };
            let b = Sighting { receiver: 2, t: t0 + tau_b + offset_b, tau: tau_b, wall: 0.0 };
            let obs = build_observation(&a, p_a, &b, p_b, tx, 100.0, 0.0, 0.0);
            assert!((obs.z - offset_b).abs() < 1e-12, "t0={t0} z={}", obs.z);
        }
    }

    #[test]
    fn observation_ordering_is_canonical() {
        let tx = [4_000_000.0, 0.0, 5_000_000.0];
        let p_a = [4_010_000.0, 0.0, 5_000_000.0];
        let p_b = [4_000_000.0, 30_000.0, 5_000_000.0];
        let tau_a = geodesy::distance(tx, p_a) / C_AIR;
        let tau_b = geodesy::distance(tx, p_b) / C_AIR;

        let a = Sighting { receiver: 1, t: 10.0 + tau_a, tau: tau_a, wall: 0.0 };
        let b = Sighting { receiver: 2, t: 10.3 + tau_b, tau: tau_b, wall: 0.0 };

        // Whichever receiver reports second, z is peer-minus-base.
        let from_a = build_observation(&a, p_a, &b, p_b, tx, 100.0, 0.0, 0.0);
        let from_b = build_observation(&b, p_b, &a, p_a, tx, 100.0, 0.0, 0.0);
        assert!((from_a.z - from_b.z).abs() < 1e-15);
        assert!((from_a.z - 0.3).abs() < 1e-12);
    }

    #[test]
    fn nuc_sigma_is_monotone() {
        assert!(nuc_position_sigma(9) < nuc_position_sigma(8));
        assert!(nuc_position_sigma(8) < nuc_position_sigma(6));
        assert!(nuc_position_sigma(5) > nuc_position_sigma(6));
    }
}
