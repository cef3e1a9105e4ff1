// Coordinator: single owner of all cross-receiver state. Network tasks
// feed it events over a channel; everything it mutates (receiver registry,
// clock graph, correlator, tracks) is touched only from its loop, so
// readers never observe a half-updated edge. Solver work leaves the loop
// as immutable snapshots when the queue backs up.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use nalgebra::Matrix3;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};

use crate::aircraft::AircraftTracker;
use crate::clock::graph::ClockGraph;
use crate::clock::{SyncReceiver, SyncTracker};
use crate::constants::{
    FTOM, RECEIVER_SILENCE_TIMEOUT, SOLVER_QUEUE_CAP, SOLVER_QUEUE_HIGH_WATER, STATUS_INTERVAL,
};
use crate::correlator::{Correlator, Group};
use crate::errors::CoreError;
use crate::geodesy;
use crate::output::OutputSink;
use crate::session::{ClockSpec, Liveness, Session};
use crate::solver::{self, Fix, SolverMeasurement};
use crate::status::{self, BoundingBox};

/// Sustained BadTick count that drops a receiver.
const MAX_BAD_TICKS: u64 = 10;

/// Inline solves per loop tick; the rest go to the blocking pool.
const INLINE_SOLVES_PER_TICK: usize = 4;

/// Current Unix wall time (s).
pub fn wall_now() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

/// A connected receiver.
pub struct Receiver {
    pub uid: usize,
    pub user: String,
    /// Surveyed antenna position, ECEF (m).
    pub position: [f64; 3],
    pub position_llh: [f64; 3],
    pub session: Session,
}

/// Events from the network layer.
pub enum Event {
    Connect {
        user: String,
        lat: f64,
        lon: f64,
        alt: f64,
        clock: ClockSpec,
        reply: oneshot::Sender<std::result::Result<usize, String>>,
    },
    Message {
        uid: usize,
        tick: u64,
        payload: Vec<u8>,
        signal: Option<f64>,
    },
    Disconnect {
        uid: usize,
    },
}

/// A closed group frozen into solver inputs; owns everything the solver
/// needs so it can run off-loop.
struct PreparedGroup {
    icao24: u32,
    measurements: Vec<SolverMeasurement>,
    altitude: Option<f64>,
    guess: Option<[f64; 3]>,
    wall: f64,
}

#[derive(Debug, Default)]
pub struct Stats {
    pub messages: u64,
    pub bad_messages: u64,
    pub bad_ticks: u64,
    pub no_sync_path: u64,
    pub groups_solved: u64,
    pub fixes: u64,
    pub gated_fixes: u64,
    pub shed_groups: u64,
    pub solver_failures: HashMap<&'static str, u64>,
}

impl Stats {
    fn count_failure(&mut self, err: &CoreError) {
        let key = match err {
            CoreError::BadTick { .. } => "bad_tick",
            CoreError::BadMessage => "bad_message",
            CoreError::NoSyncPath { .. } => "no_sync_path",
            CoreError::PoorGeometry { .. } => "poor_geometry",
            CoreError::NotConverged { .. } => "not_converged",
            CoreError::HighResidual { .. } => "high_residual",
            CoreError::OutOfBounds { .. } => "out_of_bounds",
            CoreError::ResourceExhausted { .. } => "resource_exhausted",
        };
        *self.solver_failures.entry(key).or_default() += 1;
    }
}

pub struct Coordinator {
    receivers: HashMap<usize, Receiver>,
    usernames: HashMap<String, usize>,
    sync_info: HashMap<usize, SyncReceiver>,
    next_uid: usize,

    sync: SyncTracker,
    graph: ClockGraph,
    anchor: Option<usize>,

    correlator: Correlator,
    aircraft: AircraftTracker,
    coverage: HashMap<usize, BoundingBox>,

    outputs: Vec<Box<dyn OutputSink>>,
    pending_solves: Vec<PreparedGroup>,

    work_dir: Option<PathBuf>,
    pub stats: Stats,
}

impl Coordinator {
    pub fn new(work_dir: Option<PathBuf>) -> Self {
        Coordinator {
            receivers: HashMap::new(),
            usernames: HashMap::new(),
            sync_info: HashMap::new(),
            next_uid: 1,
            sync: SyncTracker::new(),
            graph: ClockGraph::new(),
            anchor: None,
            correlator: Correlator::new(),
            aircraft: AircraftTracker::new(),
            coverage: HashMap::new(),
            outputs: Vec::new(),
            pending_solves: Vec::new(),
            work_dir,
            stats: Stats::default(),
        }
    }

    pub fn add_output(&mut self, sink: Box<dyn OutputSink>) {
        self.outputs.push(sink);
    }

    /// Register a receiver from a completed handshake. One session per
    /// user name.
    pub fn connect_receiver(
        &mut self,
        user: &str,
        lat: f64,
        lon: f64,
        alt: f64,
        clock: ClockSpec,
        now: f64,
    ) -> std::result::Result<usize, String> {
        if self.usernames.contains_key(user) {
            return Err(format!("user {user} is already connected"));
        }

        let uid = self.next_uid;
        self.next_uid += 1;

        let position = geodesy::llh_to_ecef(lat, lon, alt);
        let mut session = Session::new(uid, clock, now);
        session.liveness = Liveness::Syncing;

        self.receivers.insert(
            uid,
            Receiver {
                uid,
                user: user.to_string(),
                position,
                position_llh: [lat, lon, alt],
                session,
            },
        );
        self.usernames.insert(user.to_string(), uid);
        self.sync_info.insert(
            uid,
            SyncReceiver { uid, position, jitter: clock.jitter },
        );

        info!(uid, user, lat, lon, alt, "receiver connected");
        Ok(uid)
    }

    /// Remove a receiver and every trace of it: pair state, graph edges,
    /// open-group contributions.
    pub fn disconnect_receiver(&mut self, uid: usize) {
        let Some(mut receiver) = self.receivers.remove(&uid) else {
            return;
        };
        receiver.session.liveness = Liveness::Dead;
        self.usernames.remove(&receiver.user);
        self.sync_info.remove(&uid);
        self.coverage.remove(&uid);
        self.sync.receiver_drop(uid);
        self.correlator.receiver_drop(uid);
        self.rebuild_graph();
        info!(uid, user = receiver.user, "receiver disconnected");
    }

    /// Ingest one message record from a receiver.
    pub fn ingest(
        &mut self,
        uid: usize,
        tick_raw: u64,
        payload: &[u8],
        signal: Option<f64>,
        now: f64,
    ) {
        self.stats.messages += 1;

        let Some(receiver) = self.receivers.get_mut(&uid) else {
            return;
        };

        let arrival = match receiver.session.on_message(tick_raw, payload, signal, now) {
            Ok(a) => a,
            Err(CoreError::BadTick { receiver: r, delta }) => {
                self.stats.bad_ticks += 1;
                debug!(uid = r, delta, "tick went backward, resetting pair state");
                self.sync.receiver_reset(uid, now);
                if receiver.session.bad_ticks >= MAX_BAD_TICKS {
                    info!(uid, "dropping receiver after sustained bad ticks");
                    self.disconnect_receiver(uid);
                }
                return;
            }
            Err(e) => {
                self.stats.bad_messages += 1;
                debug!(uid, "message dropped: {e}");
                return;
            }
        };

        let t = receiver.session.tick_seconds(arrival.tick);
        let jitter = receiver.session.clock.jitter;

        self.aircraft
            .note_arrival(arrival.icao24, arrival.altitude_ft, now);

        // DF17/18 drive clock sync when they resolve to a position.
        if arrival.df == 17 || arrival.df == 18 {
            if let Some((lat, lon)) = self.sync.on_reference_frame(&arrival, t, &self.sync_info) {
                self.coverage
                    .entry(uid)
                    .and_modify(|b| b.grow(lat, lon))
                    .or_insert_with(|| BoundingBox::seed(lat, lon));
            }
        }

        // Every Mode S arrival is an MLAT candidate once its receiver can
        // reach the anchor timebase.
        let Some(anchor) = self.anchor else {
            return;
        };
        match self.graph.translate(t, uid, anchor) {
            Ok(tr) => {
                self.correlator.insert(
                    arrival.icao24,
                    &arrival.payload,
                    uid,
                    arrival.tick,
                    tr.t,
                    tr.variance + jitter * jitter,
                    arrival.altitude_ft,
                    now,
                );
            }
            Err(_) => {
                self.stats.no_sync_path += 1;
            }
        }
    }

    /// Rebuild the translation graph and anchor from current pair state,
    /// and refresh receiver liveness off it.
    pub fn rebuild_graph(&mut self) {
        self.graph.rebuild(self.sync.pairs());
        self.anchor = self.graph.anchor();
        for receiver in self.receivers.values_mut() {
            receiver.session.liveness = if self.graph.contains(receiver.uid) {
                Liveness::Synced
            } else {
                Liveness::Syncing
            };
        }
    }

    /// Close mature groups and queue them for solving. Sheds the weakest
    /// pending work above the queue cap.
    pub fn sweep_groups(&mut self, now: f64) {
        for group in self.correlator.close_ready(now) {
            if let Some(prep) = self.prepare_group(group, now) {
                self.pending_solves.push(prep);
            }
        }

        if self.pending_solves.len() > SOLVER_QUEUE_CAP {
            // Most receivers first; the tail is the cheapest to lose.
            self.pending_solves
                .sort_by(|a, b| b.measurements.len().cmp(&a.measurements.len()));
            let overflow = self.pending_solves.len() - SOLVER_QUEUE_CAP;
            self.pending_solves.truncate(SOLVER_QUEUE_CAP);
            self.stats.shed_groups += overflow as u64;
        }
    }

    fn prepare_group(&mut self, group: Group, now: f64) -> Option<PreparedGroup> {
        let mut measurements = Vec::with_capacity(group.members.len());
        for member in &group.members {
            let Some(receiver) = self.receivers.get(&member.receiver) else {
                continue; // receiver died while the group was open
            };
            measurements.push(SolverMeasurement {
                receiver: member.receiver,
                position: receiver.position,
                t: member.t_anchor,
                variance: member.variance,
                tick: member.tick,
            });
        }
        if measurements.len() < crate::constants::GROUP_MIN_RECEIVERS {
            return None;
        }

        let altitude = group
            .altitude_ft
            .map(|a| a as f64 * FTOM)
            .or_else(|| self.aircraft.recent_altitude(group.icao24, now));

        Some(PreparedGroup {
            icao24: group.icao24,
            measurements,
            altitude,
            guess: self.aircraft.initial_guess(group.icao24, group.anchor_time),
            wall: group.created_wall,
        })
    }

    fn solve_prepared(prep: &PreparedGroup) -> crate::errors::Result<Fix> {
        solver::solve(
            prep.icao24,
            &prep.measurements,
            prep.altitude,
            prep.guess,
            prep.wall,
        )
    }

    /// Fold a solver outcome back into tracker state and outputs.
    fn complete_solve(&mut self, result: crate::errors::Result<Fix>) {
        self.stats.groups_solved += 1;
        match result {
            Ok(fix) => {
                let cov = Matrix3::from_fn(|r, c| fix.covariance[r][c]);
                if self
                    .aircraft
                    .accept_fix(fix.icao24, fix.position, &cov, fix.t0)
                {
                    self.stats.fixes += 1;
                    for sink in self.outputs.iter_mut() {
                        sink.publish(&fix);
                    }
                } else {
                    self.stats.gated_fixes += 1;
                    debug!(
                        icao24 = format_args!("{:06x}", fix.icao24),
                        "fix gated by track history"
                    );
                }
            }
            Err(e) => {
                self.stats.count_failure(&e);
                debug!("solve failed: {e}");
            }
        }
    }

    /// Run all queued solves on the caller's thread. The async loop uses
    /// this for the under-high-water path; tests use it directly.
    pub fn drain_solves_inline(&mut self) {
        while let Some(prep) = self.pending_solves.pop() {
            let result = Self::solve_prepared(&prep);
            self.complete_solve(result);
        }
    }

    /// Periodic eviction: stale sync state, silent receivers, dead tracks.
    pub fn housekeeping(&mut self, now: f64) {
        self.sync.cleanup(now);
        self.aircraft.prune(now);

        let silent: Vec<usize> = self
            .receivers
            .values()
            .filter(|r| now - r.session.last_seen() > RECEIVER_SILENCE_TIMEOUT)
            .map(|r| r.uid)
            .collect();
        for uid in silent {
            info!(uid, "dropping receiver after silence timeout");
            self.disconnect_receiver(uid);
        }
    }

    /// Write sync.json / coverage.json and log a status line.
    pub fn write_status(&mut self) {
        let names: HashMap<usize, String> = self
            .receivers
            .values()
            .map(|r| (r.uid, r.user.clone()))
            .collect();

        if let Some(dir) = &self.work_dir {
            status::write_json_atomic(dir, "sync.json", &status::sync_snapshot(self.sync.pairs(), &names));
            status::write_json_atomic(dir, "coverage.json", &status::coverage_snapshot(&self.coverage, &names));
        }

        info!(
            receivers = self.receivers.len(),
            pairs = self.sync.num_pairs(),
            synced_pairs = self.sync.num_publishable(),
            aircraft = self.aircraft.len(),
            fixes = self.stats.fixes,
            "status"
        );
    }

    pub fn receiver_count(&self) -> usize {
        self.receivers.len()
    }

    pub fn receiver(&self, uid: usize) -> Option<&Receiver> {
        self.receivers.get(&uid)
    }

    pub fn anchor(&self) -> Option<usize> {
        self.anchor
    }

    pub fn synced_pairs(&self) -> usize {
        self.sync.num_publishable()
    }

    fn handle_event(&mut self, event: Event, now: f64) {
        match event {
            Event::Connect { user, lat, lon, alt, clock, reply } => {
                let result = self.connect_receiver(&user, lat, lon, alt, clock, now);
                let _ = reply.send(result);
            }
            Event::Message { uid, tick, payload, signal } => {
                self.ingest(uid, tick, &payload, signal, now);
            }
            Event::Disconnect { uid } => {
                self.disconnect_receiver(uid);
            }
        }
    }

    /// Cooperative event loop: network events, solver completions and the
    /// periodic sweep all interleave here.
    pub async fn run(mut self, mut events: mpsc::Receiver<Event>) {
        let (done_tx, mut done_rx) = mpsc::unbounded_channel::<crate::errors::Result<Fix>>();

        let mut tick = tokio::time::interval(Duration::from_millis(100));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        let mut last_housekeeping = wall_now();
        let mut last_status = wall_now();
        let mut last_rebuild = wall_now();

        loop {
            tokio::select! {
                event = events.recv() => {
                    match event {
                        Some(e) => self.handle_event(e, wall_now()),
                        None => {
                            info!("event channel closed, coordinator stopping");
                            break;
                        }
                    }
                }
                Some(result) = done_rx.recv() => {
                    self.complete_solve(result);
                }
                _ = tick.tick() => {
                    let now = wall_now();

                    if now - last_rebuild >= 1.0 {
                        last_rebuild = now;
                        self.rebuild_graph();
                    }

                    self.sweep_groups(now);
                    let mut inline_budget = INLINE_SOLVES_PER_TICK;
                    while let Some(prep) = self.pending_solves.pop() {
                        if inline_budget > 0
                            && self.pending_solves.len() < SOLVER_QUEUE_HIGH_WATER
                        {
                            inline_budget -= 1;
                            let result = Self::solve_prepared(&prep);
                            self.complete_solve(result);
                        } else {
                            // Queue backed up: ship the snapshot to the
                            // blocking pool and keep the loop responsive.
                            let tx = done_tx.clone();
                            tokio::task::spawn_blocking(move || {
                                let _ = tx.send(Coordinator::solve_prepared(&prep));
                            });
                        }
                    }

                    if now - last_housekeeping >= 10.0 {
                        last_housekeeping = now;
                        self.housekeeping(now);
                    }
                    if now - last_status >= STATUS_INTERVAL {
                        last_status = now;
                        self.write_status();
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn clock() -> ClockSpec {
        ClockSpec::new(12e6, 48, 250e-9).unwrap()
    }

    #[test]
    fn connect_is_unique_per_user() {
        let mut c = Coordinator::new(None);
        let uid = c.connect_receiver("alpha", 47.0, 8.0, 500.0, clock(), 0.0).unwrap();
        assert_eq!(uid, 1);
        assert!(c.connect_receiver("alpha", 47.0, 8.0, 500.0, clock(), 0.0).is_err());

        c.disconnect_receiver(uid);
        assert_eq!(c.receiver_count(), 0);
        let uid2 = c.connect_receiver("alpha", 47.0, 8.0, 500.0, clock(), 0.0).unwrap();
        assert_eq!(uid2, 2);
    }

    #[test]
    fn receiver_position_is_ecef() {
        let mut c = Coordinator::new(None);
        let uid = c.connect_receiver("alpha", 0.0, 0.0, 0.0, clock(), 0.0).unwrap();
        let r = c.receiver(uid).unwrap();
        assert!((r.position[0] - geodesy::WGS84_A).abs() < 1e-6);
    }

    #[test]
    fn silent_receivers_are_reaped() {
        let mut c = Coordinator::new(None);
        c.connect_receiver("alpha", 47.0, 8.0, 500.0, clock(), 1000.0).unwrap();
        c.connect_receiver("bravo", 47.1, 8.1, 400.0, clock(), 1000.0).unwrap();

        c.housekeeping(1010.0);
        assert_eq!(c.receiver_count(), 2);
        c.housekeeping(1000.0 + RECEIVER_SILENCE_TIMEOUT + 1.0);
        assert_eq!(c.receiver_count(), 0);
    }

    #[test]
    fn garbage_messages_are_counted_not_fatal() {
        let mut c = Coordinator::new(None);
        let uid = c.connect_receiver("alpha", 47.0, 8.0, 500.0, clock(), 1000.0).unwrap();
        c.ingest(uid, 1000, &[0xff; 14], None, 1000.0);
        assert_eq!(c.stats.bad_messages, 1);
        assert_eq!(c.receiver_count(), 1);
    }

    #[test]
    fn sustained_bad_ticks_drop_the_receiver() {
        let mut c = Coordinator::new(None);
        let uid = c.connect_receiver("alpha", 47.0, 8.0, 500.0, clock(), 1000.0).unwrap();

        const FRAME: [u8; 14] = [
            0x8d, 0x40, 0x62, 0x1d, 0x58, 0xc3, 0x82, 0xd6, 0x90, 0xc8, 0xac, 0x28, 0x63, 0xa7,
        ];
        let mut now = 1000.0;
        let mut high = 10_000_000u64;
        for _ in 0..MAX_BAD_TICKS {
            now += 0.1;
            c.ingest(uid, high, &FRAME, None, now);
            now += 0.1;
            // Always jump backward: every other message is a bad tick.
            c.ingest(uid, high - 1_000_000, &FRAME, None, now);
            high += 10_000_000;
        }
        assert!(c.stats.bad_ticks >= MAX_BAD_TICKS);
        assert_eq!(c.receiver_count(), 0);
    }
}
