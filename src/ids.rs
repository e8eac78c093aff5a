//! Monotonic id and timestamp generation.
//!
//! Platform timestamps are decimal strings `"<secs>.<microsecs>"`, unique and
//! monotonic within a single emulator process. A single atomic counter of
//! microseconds-since-epoch, bumped past `now` on every collision, gives us
//! both properties without a lock.

use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

static LAST_MICROS: AtomicI64 = AtomicI64::new(0);

fn now_micros() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_micros() as i64
}

/// Generate the next monotonic timestamp, formatted `"<secs>.<microsecs>"`.
pub fn next_ts() -> String {
    let micros = loop {
        let now = now_micros();
        let last = LAST_MICROS.load(Ordering::SeqCst);
        let candidate = if now > last { now } else { last + 1 };
        if LAST_MICROS
            .compare_exchange(last, candidate, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            break candidate;
        }
    };
    format_ts(micros)
}

fn format_ts(micros: i64) -> String {
    let secs = micros / 1_000_000;
    let rem = micros % 1_000_000;
    format!("{secs}.{rem:06}")
}

/// Generate a fresh id with the given prefix, e.g. `"T"` -> `"T_<uuid>"`.
pub fn fresh_id(prefix: &str) -> String {
    format!("{prefix}_{}", uuid::Uuid::new_v4().simple())
}

/// Generate a fresh `trigger_id`.
pub fn trigger_id() -> String {
    fresh_id("T")
}

/// Generate a fresh envelope id.
pub fn envelope_id() -> String {
    fresh_id("E")
}

/// Generate a fresh view id.
pub fn view_id() -> String {
    fresh_id("V")
}

/// Generate a fresh connection id.
pub fn connection_id() -> String {
    fresh_id("CONN")
}

/// Generate a fresh file id.
pub fn file_id() -> String {
    fresh_id("F")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timestamps_are_monotonic() {
        let mut prev = next_ts();
        for _ in 0..200 {
            let ts = next_ts();
            assert!(ts.as_str() > prev.as_str(), "{ts} should exceed {prev}");
            prev = ts;
        }
    }

    #[test]
    fn timestamp_has_expected_shape() {
        let ts = next_ts();
        let (secs, micros) = ts.split_once('.').expect("dotted timestamp");
        assert!(secs.parse::<i64>().is_ok());
        assert_eq!(micros.len(), 6);
    }
}
