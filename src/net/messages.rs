//! Wire types for the receiver protocol: newline-delimited JSON over TCP.
//!
//! A client sends one handshake line, then a stream of timestamped
//! message records:
//!
//! - Handshake: `{ "user", "lat", "lon", "alt" [, "freq", "wrap_bits", "jitter_ns"] }`
//! - Record: `{ "t": <tick>, "m": "<hex payload>" [, "s": <signal dBFS>] }`
//!
//! The server answers the handshake with `{ "ok": <uid> }` or
//! `{ "deny": "<reason>" }`.

use serde::{Deserialize, Serialize};

#[derive(Debug, Deserialize)]
pub struct Handshake {
    pub user: String,
    /// Surveyed antenna position.
    pub lat: f64,
    pub lon: f64,
    pub alt: f64,
    /// Hardware timestamp frequency (Hz).
    #[serde(default = "default_freq")]
    pub freq: f64,
    /// Hardware counter width; ticks wrap modulo 2^wrap_bits.
    #[serde(default = "default_wrap_bits")]
    pub wrap_bits: u8,
    /// Single-reading timing noise (ns).
    #[serde(default = "default_jitter_ns")]
    pub jitter_ns: f64,
}

fn default_freq() -> f64 {
    12e6
}

fn default_wrap_bits() -> u8 {
    48
}

fn default_jitter_ns() -> f64 {
    500.0
}

#[derive(Debug, Serialize)]
pub struct HandshakeAck {
    pub ok: usize,
}

#[derive(Debug, Serialize)]
pub struct HandshakeDeny {
    pub deny: String,
}

#[derive(Debug, Deserialize)]
pub struct InputRecord {
    /// Raw hardware tick.
    pub t: u64,
    /// Hex-encoded Mode S payload (7 or 14 bytes).
    pub m: String,
    /// Signal level (dBFS), if the receiver reports one.
    #[serde(default)]
    pub s: Option<f64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handshake_defaults() {
        let hs: Handshake =
            serde_json::from_str(r#"{"user":"alpha","lat":47.0,"lon":8.0,"alt":500.0}"#).unwrap();
        assert_eq!(hs.freq, 12e6);
        assert_eq!(hs.wrap_bits, 48);
        assert_eq!(hs.jitter_ns, 500.0);
    }

    #[test]
    fn record_parses_with_optional_signal() {
        let r: InputRecord = serde_json::from_str(r#"{"t":123456,"m":"8d4840d6"}"#).unwrap();
        assert_eq!(r.t, 123456);
        assert!(r.s.is_none());

        let r: InputRecord =
            serde_json::from_str(r#"{"t":1,"m":"00","s":-12.5}"#).unwrap();
        assert_eq!(r.s, Some(-12.5));
    }
}
