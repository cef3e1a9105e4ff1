// Per-receiver session: tick un-wrapping, arrival classification and a
// bounded history ring. No numerics happen here; the session is a
// classifier and buffer in front of the sync and MLAT pipelines.

use std::collections::VecDeque;

use crate::constants::{SESSION_GAP_RESET, SESSION_HISTORY, SESSION_RATE_LIMIT};
use crate::decoder;
use crate::errors::{CoreError, Result};

/// Receiver liveness, driven by the coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    Connecting,
    Syncing,
    Synced,
    Dead,
}

/// Immutable clock parameters from the handshake.
#[derive(Debug, Clone, Copy)]
pub struct ClockSpec {
    /// Tick frequency in Hz (typically 12 MHz).
    pub freq: f64,
    /// Hardware counter width; ticks wrap modulo 2^wrap_bits.
    pub wrap_bits: u8,
    /// Single-reading timing noise floor (s).
    pub jitter: f64,
}

impl ClockSpec {
    pub fn new(freq: f64, wrap_bits: u8, jitter: f64) -> Result<Self> {
        if !(wrap_bits == 24 || wrap_bits == 48) || !(freq > 0.0) {
            return Err(CoreError::BadMessage);
        }
        Ok(ClockSpec { freq, wrap_bits, jitter })
    }

    #[inline]
    pub fn wrap(&self) -> u64 {
        1u64 << self.wrap_bits
    }
}

/// One classified message arrival.
#[derive(Debug, Clone)]
pub struct Arrival {
    pub receiver: usize,
    /// Unwrapped, monotone hardware tick.
    pub tick: u64,
    pub payload: Vec<u8>,
    pub icao24: u32,
    pub df: u8,
    pub altitude_ft: Option<i32>,
    pub signal: Option<f64>,
    pub wall: f64,
}

/// Ingest state for one connected receiver.
pub struct Session {
    pub receiver: usize,
    pub clock: ClockSpec,
    pub liveness: Liveness,

    epoch: u64,
    last_raw: Option<u64>,
    last_tick: u64,
    last_wall: f64,
    started_wall: f64,

    history: VecDeque<Arrival>,

    rate_window_start: f64,
    rate_count: usize,

    pub dropped_rate: u64,
    pub dropped_bad: u64,
    pub bad_ticks: u64,
}

impl Session {
    pub fn new(receiver: usize, clock: ClockSpec, now: f64) -> Self {
        Session {
            receiver,
            clock,
            liveness: Liveness::Connecting,
            epoch: 0,
            last_raw: None,
            last_tick: 0,
            last_wall: now,
            started_wall: now,
            history: VecDeque::with_capacity(SESSION_HISTORY),
            rate_window_start: now,
            rate_count: 0,
            dropped_rate: 0,
            dropped_bad: 0,
            bad_ticks: 0,
        }
    }

    /// Ingest one (raw tick, payload) record.
    ///
    /// Unwraps the tick into the monotone session timebase, classifies the
    /// payload and appends the arrival to the history ring. `BadTick`
    /// means the hardware counter moved backward past the wrap threshold;
    /// the session re-anchors its unwrapper and the caller is expected to
    /// discard this receiver's pair state.
    pub fn on_message(
        &mut self,
        raw: u64,
        payload: &[u8],
        signal: Option<f64>,
        wall: f64,
    ) -> Result<Arrival> {
        if wall - self.rate_window_start >= 1.0 {
            self.rate_window_start = wall;
            self.rate_count = 0;
        }
        self.rate_count += 1;
        if self.rate_count > SESSION_RATE_LIMIT {
            self.dropped_rate += 1;
            return Err(CoreError::ResourceExhausted { what: "session rate limit" });
        }

        // A long silence means buffering or a restart on the client side;
        // the raw counter can no longer be related to the previous one.
        if self.last_raw.is_some() && wall - self.last_wall > SESSION_GAP_RESET {
            self.resync();
        }

        let tick = self.unwrap_tick(raw, wall)?;
        self.last_wall = wall;

        let frame = match decoder::decode_modes(payload) {
            Ok(f) => f,
            Err(e) => {
                self.dropped_bad += 1;
                return Err(e);
            }
        };

        let arrival = Arrival {
            receiver: self.receiver,
            tick,
            payload: payload.to_vec(),
            icao24: frame.icao24,
            df: frame.df,
            altitude_ft: frame.altitude_ft,
            signal,
            wall,
        };

        if self.history.len() == SESSION_HISTORY {
            self.history.pop_front();
        }
        self.history.push_back(arrival.clone());

        Ok(arrival)
    }

    fn unwrap_tick(&mut self, raw: u64, _wall: f64) -> Result<u64> {
        let wrap = self.clock.wrap();
        let raw = raw & (wrap - 1);

        let tick = match self.last_raw {
            None => {
                // First message after connect or resync: continue strictly
                // after whatever the session has already emitted.
                self.epoch = self.last_tick.saturating_add(1);
                self.epoch + raw
            }
            Some(last_raw) if raw >= last_raw => self.epoch + raw,
            Some(last_raw) => {
                if last_raw - raw > wrap / 2 {
                    // Counter wrapped.
                    self.epoch += wrap;
                    self.epoch + raw
                } else {
                    // Counter went backward: hardware reset.
                    self.bad_ticks += 1;
                    let delta = last_raw - raw;
                    self.resync();
                    return Err(CoreError::BadTick { receiver: self.receiver, delta });
                }
            }
        };

        self.last_raw = Some(raw);
        self.last_tick = tick;
        Ok(tick)
    }

    /// Forget the raw-counter relationship; the next message re-anchors.
    fn resync(&mut self) {
        self.last_raw = None;
    }

    /// Tick in seconds of the session timebase.
    #[inline]
    pub fn tick_seconds(&self, tick: u64) -> f64 {
        tick as f64 / self.clock.freq
    }

    /// Coarse wall-time to tick mapping. Only good enough for cold-start
    /// sanity checks; never used for solving.
    pub fn epoch_ticks(&self, t_wall: f64) -> u64 {
        ((t_wall - self.started_wall).max(0.0) * self.clock.freq) as u64
    }

    pub fn history(&self) -> impl Iterator<Item = &Arrival> {
        self.history.iter()
    }

    pub fn last_seen(&self) -> f64 {
        self.last_wall
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // A clean DF17 frame so classification succeeds.
    const FRAME: [u8; 14] = [
        0x8d, 0x40, 0x62, 0x1d, 0x58, 0xc3, 0x82, 0xd6, 0x90, 0xc8, 0xac, 0x28, 0x63, 0xa7,
    ];

    fn session() -> Session {
        Session::new(1, ClockSpec::new(12e6, 24, 500e-9).unwrap(), 1000.0)
    }

    #[test]
    fn clock_spec_validation() {
        assert!(ClockSpec::new(12e6, 24, 0.0).is_ok());
        assert!(ClockSpec::new(12e6, 48, 0.0).is_ok());
        assert!(ClockSpec::new(12e6, 32, 0.0).is_err());
        assert!(ClockSpec::new(0.0, 24, 0.0).is_err());
    }

    #[test]
    fn ticks_unwrap_across_wrap() {
        let mut s = session();
        let a = s.on_message(0xfffff0, &FRAME, None, 1000.0).unwrap();
        let b = s.on_message(0x000010, &FRAME, None, 1000.1).unwrap();
        assert!(b.tick > a.tick);
        assert_eq!(b.tick - a.tick, 0x20);
    }

    #[test]
    fn backward_tick_is_bad() {
        let mut s = session();
        s.on_message(1_000_000, &FRAME, None, 1000.0).unwrap();
        let err = s.on_message(900_000, &FRAME, None, 1000.1).unwrap_err();
        assert!(matches!(err, CoreError::BadTick { receiver: 1, .. }));
        // Next message re-anchors and stays monotone.
        let a = s.on_message(900_100, &FRAME, None, 1000.2).unwrap();
        assert!(a.tick > 1_000_000);
    }

    #[test]
    fn gap_resets_unwrapper() {
        let mut s = session();
        let a = s.on_message(5_000_000, &FRAME, None, 1000.0).unwrap();
        // 2 s of silence, counter restarted low: not BadTick, just re-anchored.
        let b = s.on_message(100, &FRAME, None, 1002.5).unwrap();
        assert!(b.tick > a.tick);
    }

    #[test]
    fn rate_limit_sheds_excess() {
        let mut s = session();
        let mut shed = 0;
        for i in 0..(SESSION_RATE_LIMIT + 10) {
            let r = s.on_message(i as u64 * 1000, &FRAME, None, 1000.0);
            if matches!(r, Err(CoreError::ResourceExhausted { .. })) {
                shed += 1;
            }
        }
        assert_eq!(shed, 10);
        assert_eq!(s.dropped_rate, 10);
        // Window rolls over and traffic flows again.
        assert!(s.on_message(u64::MAX & 0xffffff, &FRAME, None, 1001.5).is_ok());
    }

    #[test]
    fn history_is_bounded() {
        let mut s = session();
        for i in 0..(SESSION_HISTORY as u64 + 50) {
            let _ = s.on_message(i * 1000, &FRAME, None, 1000.0 + i as f64 * 0.001);
        }
        assert_eq!(s.history().count(), SESSION_HISTORY);
    }

    #[test]
    fn epoch_ticks_tracks_wall_time() {
        let s = session();
        assert_eq!(s.epoch_ticks(1000.0), 0);
        assert_eq!(s.epoch_ticks(1001.0), 12_000_000);
        // Before session start clamps to zero.
        assert_eq!(s.epoch_ticks(999.0), 0);
    }

    #[test]
    fn bad_payload_counted() {
        let mut s = session();
        assert!(matches!(
            s.on_message(1000, &[0u8; 14], None, 1000.0),
            Err(CoreError::BadMessage)
        ));
        assert_eq!(s.dropped_bad, 1);
    }
}
