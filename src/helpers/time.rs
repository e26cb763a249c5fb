use anyhow::{bail, Result};
use nix::time::{clock_gettime, ClockId};
use time::{macros::format_description, OffsetDateTime, UtcOffset};

/// Returns the monotonic timestamp in nanoseconds.
pub(crate) fn monotonic_timestamp() -> Result<u64> {
    let monotonic = clock_gettime(ClockId::CLOCK_MONOTONIC)?;

    let ts = monotonic.tv_sec() * 1000000000 + monotonic.tv_nsec();
    if ts < 0 {
        bail!("Monotonic timestamp is negative: {ts}");
    }

    Ok(ts as u64)
}

fn timespec_to_ns(ts: nix::sys::time::TimeSpec) -> u64 {
    (ts.tv_sec() * 1000000000 + ts.tv_nsec()) as u64
}

/// Computes the offset turning monotonic timestamps into wall-clock ones.
///
/// Both clocks are sampled ten times using (wall, mono, wall') triples; the
/// triple with the smallest wall' - wall window gives the best bound on when
/// the monotonic sample was taken, and the offset is derived from the window
/// midpoint.
pub(crate) fn monotonic_clock_offset() -> Result<u64> {
    let mut best_delta = u64::MAX;
    let mut offset = 0;

    for _ in 0..10 {
        let wall1 = timespec_to_ns(clock_gettime(ClockId::CLOCK_REALTIME)?);
        let mono = timespec_to_ns(clock_gettime(ClockId::CLOCK_MONOTONIC)?);
        let wall2 = timespec_to_ns(clock_gettime(ClockId::CLOCK_REALTIME)?);

        let delta = wall2.saturating_sub(wall1);
        if delta < best_delta {
            best_delta = delta;
            offset = (wall1 + wall2) / 2 - mono;
        }
    }

    Ok(offset)
}

/// Format a wall-clock timestamp (in nanoseconds) as HH:MM:SS.mmm, using the
/// local timezone when one is provided.
pub(crate) fn ts_to_str(ts: u64, utc_offset: Option<UtcOffset>) -> String {
    let dt = match OffsetDateTime::from_unix_timestamp_nanos(ts as i128) {
        Ok(dt) => match utc_offset {
            Some(offset) => dt.to_offset(offset),
            None => dt,
        },
        Err(_) => return "??:??:??.???".to_string(),
    };

    dt.format(format_description!(
        "[hour]:[minute]:[second].[subsecond digits:3]"
    ))
    .unwrap_or_else(|_| "??:??:??.???".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timestamp_format() {
        // 1970-01-01 01:02:03.456 UTC.
        let ts = 3723u64 * 1000000000 + 456000000;
        assert_eq!(ts_to_str(ts, None), "01:02:03.456");
    }

    #[test]
    fn clock_offset() {
        // The offset converts monotonic to wall-clock time; adding it to a
        // fresh monotonic timestamp has to land within a second of the wall
        // clock.
        let offset = monotonic_clock_offset().unwrap();
        let mono = monotonic_timestamp().unwrap();
        let wall = timespec_to_ns(clock_gettime(ClockId::CLOCK_REALTIME).unwrap());

        assert!(offset + mono <= wall + 1000000000);
        assert!(offset + mono + 1000000000 >= wall);
    }
}
