// Narrow Mode S reference decoder. The core only needs three things from
// a frame: the downlink format, the 24-bit address, and (when present) an
// altitude; plus globally-decoded DF17 airborne positions to drive clock
// sync. Everything else in the transponder zoo is ignored.

use std::collections::HashMap;

use crate::constants::FTOM;
use crate::errors::CoreError;

/// How long an unpaired CPR frame is kept waiting for its counterpart (s).
const CPR_PAIR_WINDOW: f64 = 10.0;

/// A classified Mode S frame: what the correlator needs to key and
/// constrain a group.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ModeSFrame {
    pub df: u8,
    pub icao24: u32,
    /// Barometric altitude in feet, when the format carries one.
    pub altitude_ft: Option<i32>,
}

/// A DF17/18 airborne position with a known global position, used as a
/// clock-sync reference.
#[derive(Debug, Clone, Copy)]
pub struct AdsbSighting {
    pub icao24: u32,
    pub lat: f64,
    pub lon: f64,
    /// Geometric-ish altitude in metres (barometric, treated as ellipsoid).
    pub alt_m: f64,
    pub nuc: u8,
}

/// Classify a 7- or 14-byte Mode S frame.
///
/// For AP-protected formats the address is the CRC residual; for extended
/// squitters the CRC must check out or the frame is rejected.
pub fn decode_modes(payload: &[u8]) -> Result<ModeSFrame, CoreError> {
    match payload.len() {
        7 => {
            let df = payload[0] >> 3;
            match df {
                0 | 4 => Ok(ModeSFrame {
                    df,
                    icao24: crc_residual(payload),
                    altitude_ft: decode_ac13(ac13_field(payload)),
                }),
                5 => Ok(ModeSFrame {
                    df,
                    icao24: crc_residual(payload),
                    altitude_ft: None,
                }),
                11 => Ok(ModeSFrame {
                    df,
                    icao24: address_field(payload),
                    altitude_ft: None,
                }),
                _ => Err(CoreError::BadMessage),
            }
        }
        14 => {
            let df = payload[0] >> 3;
            match df {
                16 | 20 => Ok(ModeSFrame {
                    df,
                    icao24: crc_residual(payload),
                    altitude_ft: decode_ac13(ac13_field(payload)),
                }),
                21 => Ok(ModeSFrame {
                    df,
                    icao24: crc_residual(payload),
                    altitude_ft: None,
                }),
                17 | 18 => {
                    if crc_residual(payload) != 0 {
                        return Err(CoreError::BadMessage);
                    }
                    Ok(ModeSFrame {
                        df,
                        icao24: address_field(payload),
                        altitude_ft: extended_squitter_altitude(payload),
                    })
                }
                _ => Err(CoreError::BadMessage),
            }
        }
        _ => Err(CoreError::BadMessage),
    }
}

/// Stateful ADS-B position decoder.
///
/// CPR airborne positions are globally unambiguous only as an even/odd
/// frame pair, so the decoder keeps the most recent frame of each parity
/// per aircraft and emits a sighting when the counterpart arrives within
/// the pairing window.
#[derive(Default)]
pub struct AdsbDecoder {
    pending: HashMap<u32, CprPending>,
}

#[derive(Default, Clone, Copy)]
struct CprPending {
    even: Option<CprFrame>,
    odd: Option<CprFrame>,
}

#[derive(Clone, Copy)]
struct CprFrame {
    lat: u32,
    lon: u32,
    alt_ft: i32,
    nuc: u8,
    wall: f64,
}

impl AdsbDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a frame; returns a sighting when this frame's position is
    /// globally resolvable. Anything undecodable is silently None.
    pub fn decode_adsb(&mut self, payload: &[u8], wall: f64) -> Option<AdsbSighting> {
        if payload.len() != 14 {
            return None;
        }
        let df = payload[0] >> 3;
        if df != 17 && df != 18 {
            return None;
        }
        if crc_residual(payload) != 0 {
            return None;
        }

        let me = &payload[4..11];
        let typecode = me[0] >> 3;
        // Airborne position with barometric altitude.
        if !(9..=18).contains(&typecode) {
            return None;
        }

        let icao24 = address_field(payload);
        let alt_ft = decode_ac12(ac12_field(me))?;
        let odd = (me[2] >> 2) & 1 == 1;
        let lat = (((me[2] & 0x03) as u32) << 15) | ((me[3] as u32) << 7) | ((me[4] as u32) >> 1);
        let lon = (((me[4] & 0x01) as u32) << 16) | ((me[5] as u32) << 8) | me[6] as u32;
        let nuc = 18 - typecode;

        let frame = CprFrame { lat, lon, alt_ft, nuc, wall };
        let pending = self.pending.entry(icao24).or_default();

        let counterpart = if odd { pending.even } else { pending.odd };
        if odd {
            pending.odd = Some(frame);
        } else {
            pending.even = Some(frame);
        }

        let other = counterpart.filter(|c| (wall - c.wall).abs() <= CPR_PAIR_WINDOW)?;
        let (even, odd_frame) = if odd { (other, frame) } else { (frame, other) };

        let (lat_e, lon_e, lat_o, lon_o) =
            cpr_global(even.lat, even.lon, odd_frame.lat, odd_frame.lon)?;
        let (rlat, rlon) = if odd { (lat_o, lon_o) } else { (lat_e, lon_e) };

        // Positions at exactly 0/0 or beyond the CPR-safe band are almost
        // always corrupted frames that survived the CRC.
        if rlat == 0.0 || rlon == 0.0 || rlat.abs() > 85.0 {
            return None;
        }

        Some(AdsbSighting {
            icao24,
            lat: rlat,
            lon: rlon,
            alt_m: alt_ft as f64 * FTOM,
            nuc: nuc.min(even.nuc).min(odd_frame.nuc),
        })
    }

    /// Drop pending frames older than the pairing window.
    pub fn prune(&mut self, now: f64) {
        self.pending.retain(|_, p| {
            if p.even.is_some_and(|f| now - f.wall > CPR_PAIR_WINDOW) {
                p.even = None;
            }
            if p.odd.is_some_and(|f| now - f.wall > CPR_PAIR_WINDOW) {
                p.odd = None;
            }
            p.even.is_some() || p.odd.is_some()
        });
    }
}

#[inline]
fn address_field(payload: &[u8]) -> u32 {
    ((payload[1] as u32) << 16) | ((payload[2] as u32) << 8) | payload[3] as u32
}

#[inline]
fn ac13_field(payload: &[u8]) -> u16 {
    (((payload[2] & 0x1f) as u16) << 8) | payload[3] as u16
}

#[inline]
fn ac12_field(me: &[u8]) -> u16 {
    ((me[1] as u16) << 4) | ((me[2] as u16) >> 4)
}

fn extended_squitter_altitude(payload: &[u8]) -> Option<i32> {
    let me = &payload[4..11];
    let typecode = me[0] >> 3;
    if (9..=18).contains(&typecode) {
        decode_ac12(ac12_field(me))
    } else {
        None
    }
}

/// Decode a 13-bit Mode S altitude field (Annex 10 3.1.2.6.5.4 ordering).
/// Returns feet, or None for no-data / metric / illegal codes.
pub fn decode_ac13(ac13: u16) -> Option<i32> {
    let ac13 = ac13 & 0x1fff;
    if ac13 == 0 || ac13 & 0x0040 != 0 {
        return None; // no data, or M bit (metric) set
    }
    if ac13 & 0x0010 != 0 {
        // Q bit: 25 ft increments.
        let n = ((ac13 & 0x1f80) >> 2) | ((ac13 & 0x0020) >> 1) | (ac13 & 0x000f);
        return Some(n as i32 * 25 - 1000);
    }
    gillham(ac13)
}

/// Decode a 12-bit extended-squitter altitude (AC13 with the M bit removed).
pub fn decode_ac12(ac12: u16) -> Option<i32> {
    decode_ac13(((ac12 & 0x0fc0) << 1) | (ac12 & 0x003f))
}

/// Gillham (mode C) gray-code altitude, 100 ft increments.
fn gillham(ac13: u16) -> Option<i32> {
    if ac13 & 0x1500 == 0 {
        return None; // illegal C bits
    }

    let mut h: i32 = 0;
    if ac13 & 0x1000 != 0 {
        h ^= 7; // C1
    }
    if ac13 & 0x0400 != 0 {
        h ^= 3; // C2
    }
    if ac13 & 0x0100 != 0 {
        h ^= 1; // C4
    }
    if h & 5 != 0 {
        h ^= 5;
    }
    if h > 5 {
        return None;
    }

    let mut f: i32 = 0;
    if ac13 & 0x0010 != 0 {
        f ^= 0x1ff; // D1
    }
    if ac13 & 0x0004 != 0 {
        f ^= 0x0ff; // D2
    }
    if ac13 & 0x0001 != 0 {
        f ^= 0x07f; // D4
    }
    if ac13 & 0x0800 != 0 {
        f ^= 0x03f; // A1
    }
    if ac13 & 0x0200 != 0 {
        f ^= 0x01f; // A2
    }
    if ac13 & 0x0080 != 0 {
        f ^= 0x00f; // A4
    }
    if ac13 & 0x0020 != 0 {
        f ^= 0x007; // B1
    }
    if ac13 & 0x0008 != 0 {
        f ^= 0x003; // B2
    }
    if ac13 & 0x0002 != 0 {
        f ^= 0x001; // B4
    }

    if f & 1 != 0 {
        h = 6 - h;
    }

    let alt = 500 * f + 100 * h - 1300;
    if alt < -1200 {
        return None;
    }
    Some(alt)
}

// --- Mode S CRC (polynomial 0xfff409) ---------------------------------

const CRC_TABLE: [u32; 256] = crc_table();

const fn crc_table() -> [u32; 256] {
    let mut table = [0u32; 256];
    let mut i = 0;
    while i < 256 {
        let mut c = (i as u32) << 16;
        let mut bit = 0;
        while bit < 8 {
            c = if c & 0x80_0000 != 0 {
                (c << 1) ^ 0xfff409
            } else {
                c << 1
            };
            bit += 1;
        }
        table[i] = c & 0xff_ffff;
        i += 1;
    }
    table
}

/// CRC residual: the checksum over the data bytes XORed with the parity
/// field. Zero for a clean extended squitter; the transmitter address for
/// AP-protected formats.
pub fn crc_residual(payload: &[u8]) -> u32 {
    let n = payload.len();
    let mut rem = CRC_TABLE[payload[0] as usize];
    for &b in &payload[1..n - 3] {
        rem = ((rem & 0xffff) << 8) ^ CRC_TABLE[(b ^ (rem >> 16) as u8) as usize];
    }
    rem ^ ((payload[n - 3] as u32) << 16)
        ^ ((payload[n - 2] as u32) << 8)
        ^ payload[n - 1] as u32
}

// --- CPR global decode ------------------------------------------------

/// Number of longitude zones at a latitude (Doc 9871 NL function).
pub fn cpr_nl(lat: f64) -> i32 {
    let lat = lat.abs();
    if lat >= 87.0 {
        return if lat > 87.0 { 1 } else { 2 };
    }
    if lat < 1e-9 {
        return 59;
    }
    let nz = 15.0;
    let a = 1.0 - (std::f64::consts::PI / (2.0 * nz)).cos();
    let b = (std::f64::consts::PI / 180.0 * lat).cos().powi(2);
    let nl = (2.0 * std::f64::consts::PI) / (1.0 - a / b).acos();
    nl.floor() as i32
}

#[inline]
fn cpr_mod(a: i32, b: i32) -> i32 {
    ((a % b) + b) % b
}

/// Globally unambiguous airborne CPR decode for an even/odd frame pair.
/// Returns (even_lat, even_lon, odd_lat, odd_lon) in degrees, or None when
/// the frames straddle a latitude-zone boundary.
pub fn cpr_global(lat_e: u32, lon_e: u32, lat_o: u32, lon_o: u32) -> Option<(f64, f64, f64, f64)> {
    const SCALE: f64 = 131072.0; // 2^17

    let j = ((59.0 * lat_e as f64 - 60.0 * lat_o as f64) / SCALE + 0.5).floor() as i32;
    let mut rlat_e = (360.0 / 60.0) * (cpr_mod(j, 60) as f64 + lat_e as f64 / SCALE);
    let mut rlat_o = (360.0 / 59.0) * (cpr_mod(j, 59) as f64 + lat_o as f64 / SCALE);
    if rlat_e >= 270.0 {
        rlat_e -= 360.0;
    }
    if rlat_o >= 270.0 {
        rlat_o -= 360.0;
    }
    if !(-90.0..=90.0).contains(&rlat_e) || !(-90.0..=90.0).contains(&rlat_o) {
        return None;
    }

    let nl = cpr_nl(rlat_e);
    if nl != cpr_nl(rlat_o) {
        return None;
    }

    let n_e = nl.max(1);
    let n_o = (nl - 1).max(1);
    let m = ((lon_e as f64 * (nl - 1) as f64 - lon_o as f64 * nl as f64) / SCALE + 0.5).floor()
        as i32;

    let mut rlon_e = (360.0 / n_e as f64) * (cpr_mod(m, n_e) as f64 + lon_e as f64 / SCALE);
    let mut rlon_o = (360.0 / n_o as f64) * (cpr_mod(m, n_o) as f64 + lon_o as f64 / SCALE);
    rlon_e -= ((rlon_e + 180.0) / 360.0).floor() * 360.0;
    rlon_o -= ((rlon_o + 180.0) / 360.0).floor() * 360.0;

    Some((rlat_e, rlon_e, rlat_o, rlon_o))
}
