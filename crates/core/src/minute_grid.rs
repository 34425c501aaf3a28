//! Canonical 10,080-slot week grid.
//!
//! `slot = day_of_week * 1440 + hour * 60 + minute`, Monday = day 0, all in
//! UTC. Slot arithmetic is modular; curves indexed by slot wrap at week
//! boundaries. Occurrences of a slot are minute boundaries.

use chrono::{DateTime, Datelike, Duration, Timelike, Utc};

pub const MINUTES_PER_HOUR: usize = 60;
pub const MINUTES_PER_DAY: usize = 1_440;
pub const MINUTES_PER_WEEK: usize = 10_080;

const DAY_NAMES: [&str; 7] = ["Mon", "Tue", "Wed", "Thu", "Fri", "Sat", "Sun"];

/// Convert a UTC instant to its minute slot.
pub fn datetime_to_slot(t: DateTime<Utc>) -> usize {
    let day = t.weekday().num_days_from_monday() as usize;
    day * MINUTES_PER_DAY + t.hour() as usize * MINUTES_PER_HOUR + t.minute() as usize
}

/// Monday 00:00:00 UTC of the week containing `t` — the reference week.
pub fn week_start_of(t: DateTime<Utc>) -> DateTime<Utc> {
    let days_back = t.weekday().num_days_from_monday() as i64;
    let monday = t.date_naive() - Duration::days(days_back);
    monday.and_hms_opt(0, 0, 0).unwrap().and_utc()
}

/// Instant of `slot` within the week starting at `reference_week_start`.
pub fn slot_to_datetime(slot: usize, reference_week_start: DateTime<Utc>) -> DateTime<Utc> {
    reference_week_start + Duration::minutes((slot % MINUTES_PER_WEEK) as i64)
}

/// Earliest minute-boundary instant `>= t` whose slot equals `slot`.
pub fn next_occurrence_after(slot: usize, t: DateTime<Utc>) -> DateTime<Utc> {
    let candidate = slot_to_datetime(slot, week_start_of(t));
    if candidate < t {
        candidate + Duration::days(7)
    } else {
        candidate
    }
}

/// Closed interval `[slot - radius, slot + radius]` modulo the week.
/// Radii covering the whole grid collapse to every slot once.
pub fn neighborhood(slot: usize, radius: usize) -> Vec<usize> {
    if 2 * radius + 1 >= MINUTES_PER_WEEK {
        return (0..MINUTES_PER_WEEK).collect();
    }
    let start = (slot + MINUTES_PER_WEEK - radius) % MINUTES_PER_WEEK;
    (0..=2 * radius)
        .map(|i| (start + i) % MINUTES_PER_WEEK)
        .collect()
}

/// Human-readable `Day HH:MM` label for diagnostics and peak summaries.
pub fn slot_to_readable(slot: usize) -> String {
    let slot = slot % MINUTES_PER_WEEK;
    let day = slot / MINUTES_PER_DAY;
    let in_day = slot % MINUTES_PER_DAY;
    format!(
        "{} {:02}:{:02}",
        DAY_NAMES[day],
        in_day / MINUTES_PER_HOUR,
        in_day % MINUTES_PER_HOUR
    )
}
