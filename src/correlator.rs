// Arrival correlator: clusters copies of the same Mode S transmission
// heard by different receivers, keyed by aircraft address and windowed in
// the canonical (anchor receiver) timebase.

use std::collections::HashMap;

use tracing::debug;

use crate::constants::{CORRELATION_WINDOW, GROUP_CLOSE_DELAY, GROUP_MIN_RECEIVERS};

/// One receiver's copy within a group.
#[derive(Debug, Clone)]
pub struct GroupMember {
    pub receiver: usize,
    /// Unwrapped session tick.
    pub tick: u64,
    /// Arrival time in the canonical timebase (s).
    pub t_anchor: f64,
    /// Timing variance for this member (s^2).
    pub variance: f64,
}

/// Copies of one transmission, awaiting closure.
#[derive(Debug, Clone)]
pub struct Group {
    pub icao24: u32,
    pub payload: Vec<u8>,
    /// Canonical-timebase time of the first copy.
    pub anchor_time: f64,
    pub created_wall: f64,
    /// Altitude decoded from the payload, if the format carries one.
    pub altitude_ft: Option<i32>,
    pub members: Vec<GroupMember>,
}

impl Group {
    pub fn distinct_receivers(&self) -> usize {
        self.members.len()
    }
}

/// Open groups per aircraft; more than this and the oldest is shed.
const MAX_OPEN_PER_AIRCRAFT: usize = 32;

#[derive(Default)]
pub struct Correlator {
    open: HashMap<u32, Vec<Group>>,
    pub discarded_small: u64,
    pub shed: u64,
}

impl Correlator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert one arrival already translated into the canonical timebase.
    /// Joins an existing group when the anchor-frame time is within the
    /// correlation window and the payload matches; otherwise opens a group.
    #[allow(clippy::too_many_arguments)]
    pub fn insert(
        &mut self,
        icao24: u32,
        payload: &[u8],
        receiver: usize,
        tick: u64,
        t_anchor: f64,
        variance: f64,
        altitude_ft: Option<i32>,
        wall: f64,
    ) {
        let groups = self.open.entry(icao24).or_default();

        for group in groups.iter_mut() {
            if (t_anchor - group.anchor_time).abs() > CORRELATION_WINDOW {
                continue;
            }
            if !payloads_match(payload, &group.payload) {
                continue;
            }
            if group.members.iter().any(|m| m.receiver == receiver) {
                return; // duplicate copy from the same receiver
            }
            group.members.push(GroupMember { receiver, tick, t_anchor, variance });
            if group.altitude_ft.is_none() {
                group.altitude_ft = altitude_ft;
            }
            return;
        }

        if groups.len() >= MAX_OPEN_PER_AIRCRAFT {
            // Shed the oldest open group rather than grow without bound.
            groups.remove(0);
            self.shed += 1;
        }

        groups.push(Group {
            icao24,
            payload: payload.to_vec(),
            anchor_time: t_anchor,
            created_wall: wall,
            altitude_ft,
            members: vec![GroupMember { receiver, tick, t_anchor, variance }],
        });
    }

    /// Close out groups past the close delay. Groups heard by enough
    /// distinct receivers are returned for solving; the rest are dropped.
    pub fn close_ready(&mut self, now: f64) -> Vec<Group> {
        let mut ready = Vec::new();
        for groups in self.open.values_mut() {
            let mut i = 0;
            while i < groups.len() {
                if now - groups[i].created_wall > GROUP_CLOSE_DELAY {
                    let group = groups.remove(i);
                    if group.distinct_receivers() >= GROUP_MIN_RECEIVERS {
                        ready.push(group);
                    } else {
                        self.discarded_small += 1;
                        debug!(
                            icao24 = format_args!("{:06x}", group.icao24),
                            receivers = group.distinct_receivers(),
                            "group discarded below receiver minimum"
                        );
                    }
                } else {
                    i += 1;
                }
            }
        }
        self.open.retain(|_, groups| !groups.is_empty());
        ready
    }

    /// Remove a disconnected receiver's contributions; groups stay open
    /// and remain usable with what is left.
    pub fn receiver_drop(&mut self, uid: usize) {
        for groups in self.open.values_mut() {
            for group in groups.iter_mut() {
                group.members.retain(|m| m.receiver != uid);
            }
        }
    }

    pub fn open_groups(&self) -> usize {
        self.open.values().map(Vec::len).sum()
    }
}

/// Long frames must match exactly; short frames tolerate one flipped bit
/// of reception noise.
fn payloads_match(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    match a.len() {
        14 => a == b,
        7 => hamming(a, b) <= 1,
        _ => false,
    }
}

fn hamming(a: &[u8], b: &[u8]) -> u32 {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| (x ^ y).count_ones())
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    const LONG: [u8; 14] = [
        0x8d, 0x40, 0x62, 0x1d, 0x58, 0xc3, 0x82, 0xd6, 0x90, 0xc8, 0xac, 0x28, 0x63, 0xa7,
    ];
    const SHORT: [u8; 7] = [0x20, 0x00, 0x1c, 0x38, 0x48, 0x40, 0xd6];

    fn insert_copy(c: &mut Correlator, icao: u32, payload: &[u8], rx: usize, t: f64, wall: f64) {
        c.insert(icao, payload, rx, (t * 12e6) as u64, t, 1e-13, None, wall);
    }

    #[test]
    fn copies_within_window_share_a_group() {
        let mut c = Correlator::new();
        insert_copy(&mut c, 1, &LONG, 1, 100.0000, 0.0);
        insert_copy(&mut c, 1, &LONG, 2, 100.0005, 0.0);
        insert_copy(&mut c, 1, &LONG, 3, 100.0012, 0.0);
        assert_eq!(c.open_groups(), 1);

        let ready = c.close_ready(GROUP_CLOSE_DELAY + 0.1);
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].distinct_receivers(), 3);
    }

    #[test]
    fn different_aircraft_never_share_a_group() {
        let mut c = Correlator::new();
        insert_copy(&mut c, 0x111111, &LONG, 1, 100.0, 0.0);
        insert_copy(&mut c, 0x222222, &LONG, 2, 100.0, 0.0);
        assert_eq!(c.open_groups(), 2);
    }

    #[test]
    fn window_separates_retransmissions() {
        let mut c = Correlator::new();
        insert_copy(&mut c, 1, &LONG, 1, 100.000, 0.0);
        insert_copy(&mut c, 1, &LONG, 2, 100.010, 0.0); // 10 ms later
        assert_eq!(c.open_groups(), 2);
    }

    #[test]
    fn short_frame_tolerates_one_bit() {
        let mut c = Correlator::new();
        let mut one_bit = SHORT;
        one_bit[4] ^= 0x01;

        insert_copy(&mut c, 1, &SHORT, 1, 100.0, 0.0);
        insert_copy(&mut c, 1, &one_bit, 2, 100.0002, 0.0);
        assert_eq!(c.open_groups(), 1);
    }

    #[test]
    fn noisy_copy_forms_its_own_group() {
        let mut c = Correlator::new();
        let mut noisy = SHORT;
        noisy[4] ^= 0x0f; // Hamming distance 4

        insert_copy(&mut c, 1, &SHORT, 1, 100.0000, 0.0);
        insert_copy(&mut c, 1, &SHORT, 2, 100.0003, 0.0);
        insert_copy(&mut c, 1, &SHORT, 3, 100.0005, 0.0);
        insert_copy(&mut c, 1, &noisy, 4, 100.0006, 0.0);
        insert_copy(&mut c, 1, &SHORT, 5, 100.0008, 0.0);
        assert_eq!(c.open_groups(), 2);

        let ready = c.close_ready(GROUP_CLOSE_DELAY + 0.1);
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].distinct_receivers(), 4);
        assert_eq!(c.discarded_small, 1);
    }

    #[test]
    fn long_frames_must_match_exactly() {
        let mut c = Correlator::new();
        let mut flipped = LONG;
        flipped[5] ^= 0x01;
        insert_copy(&mut c, 1, &LONG, 1, 100.0, 0.0);
        insert_copy(&mut c, 1, &flipped, 2, 100.0002, 0.0);
        assert_eq!(c.open_groups(), 2);
    }

    #[test]
    fn disconnect_keeps_group_usable() {
        let mut c = Correlator::new();
        insert_copy(&mut c, 1, &LONG, 1, 100.0000, 0.0);
        insert_copy(&mut c, 1, &LONG, 2, 100.0002, 0.0);
        insert_copy(&mut c, 1, &LONG, 3, 100.0004, 0.0);
        insert_copy(&mut c, 1, &LONG, 4, 100.0006, 0.0);

        c.receiver_drop(4);
        let ready = c.close_ready(GROUP_CLOSE_DELAY + 0.1);
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].distinct_receivers(), 3);
        assert!(ready[0].members.iter().all(|m| m.receiver != 4));
    }

    #[test]
    fn duplicate_copies_from_one_receiver_are_ignored() {
        let mut c = Correlator::new();
        insert_copy(&mut c, 1, &LONG, 1, 100.0000, 0.0);
        insert_copy(&mut c, 1, &LONG, 1, 100.0001, 0.0);
        assert_eq!(c.open_groups(), 1);
        let ready = c.close_ready(GROUP_CLOSE_DELAY + 0.1);
        assert!(ready.is_empty());
        assert_eq!(c.discarded_small, 1);
    }
}
