//! Tracks wall-clock time since program start, for the elapsed-time
//! prefix on every log line (`[  12.345s]`).

use std::sync::OnceLock;
use std::time::Instant;

static START_TIME: OnceLock<Instant> = OnceLock::new();

/// Records the start time. Call once at the very beginning of `main()`.
pub fn init() {
    START_TIME.get_or_init(Instant::now);
}

pub fn elapsed_secs() -> f64 {
    START_TIME.get().map(|start| start.elapsed().as_secs_f64()).unwrap_or(0.0)
}

/// A `tracing_subscriber` timer that prints seconds elapsed since
/// [`init`] instead of a wall-clock timestamp.
pub struct ElapsedTimer;

impl tracing_subscriber::fmt::time::FormatTime for ElapsedTimer {
    fn format_time(&self, w: &mut tracing_subscriber::fmt::format::Writer<'_>) -> std::fmt::Result {
        write!(w, "{:>8.3}s", elapsed_secs())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn elapsed_secs_is_zero_before_init() {
        // START_TIME may already be set by another test in this binary;
        // just assert it never goes negative or panics.
        assert!(elapsed_secs() >= 0.0);
    }
}
