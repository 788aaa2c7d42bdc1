//! Access-time source for catalog entries.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::warn;

static LAST_TICK: AtomicU64 = AtomicU64::new(0);

/// Microseconds since the Unix epoch, strictly increasing across calls within the process.
///
/// Wall-clock based so values persisted by an earlier process still sort before new ones; a
/// clock stepping backwards never produces a smaller value than one already handed out.
pub fn now_micros() -> u64 {
    let wall = wall_micros();
    let mut last = LAST_TICK.load(Ordering::Relaxed);
    loop {
        let next = wall.max(last.saturating_add(1));
        match LAST_TICK.compare_exchange_weak(last, next, Ordering::AcqRel, Ordering::Relaxed) {
            Ok(_) => return next,
            Err(actual) => last = actual,
        }
    }
}

/// Raise the clock floor, e.g. to the newest access time found in a reopened catalog.
pub fn observe(tick: u64) {
    LAST_TICK.fetch_max(tick, Ordering::AcqRel);
}

fn wall_micros() -> u64 {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(delta) => delta.as_micros() as u64,
        Err(err) => {
            warn!("system clock error: {err}");
            0
        }
    }
}
