use crate::limits::{MAX_DURATION_MINUTES, MAX_INTERVALS_PER_DAY};
use crate::model::*;

use super::conflict::conflicts_with_ledger;
use super::EngineError;

// ── Slot generation ───────────────────────────────────────────────

/// Reject windows that are not internally consistent: every interval must
/// lie within the day with `end > start`, intervals must not overlap each
/// other, and the cursor step must be positive.
pub(crate) fn validate_window(window: &AvailabilityWindow) -> Result<(), EngineError> {
    if window.day_of_week > 6 {
        return Err(EngineError::Configuration(format!(
            "day_of_week {} out of range 0..=6",
            window.day_of_week
        )));
    }
    if window.slot_minutes == 0 || window.slot_minutes > MAX_DURATION_MINUTES {
        return Err(EngineError::Configuration(format!(
            "slot granularity {} out of range",
            window.slot_minutes
        )));
    }
    if window.intervals.len() > MAX_INTERVALS_PER_DAY {
        return Err(EngineError::LimitExceeded("too many intervals in availability window"));
    }
    for span in &window.intervals {
        if span.start < 0 || span.end > MINUTES_PER_DAY || span.end <= span.start {
            return Err(EngineError::Configuration(format!(
                "malformed availability interval [{}, {})",
                span.start, span.end
            )));
        }
    }
    let mut sorted = window.intervals.clone();
    sorted.sort_by_key(|s| s.start);
    for pair in sorted.windows(2) {
        if pair[0].overlaps(&pair[1]) {
            return Err(EngineError::Configuration(format!(
                "availability intervals {} and {} overlap",
                pair[0], pair[1]
            )));
        }
    }
    Ok(())
}

/// Bookable slots for one day.
///
/// For each configured interval (in configured order) a cursor walks from
/// `interval.start` in steps of `slot_minutes`. Each position yields the
/// candidate `[cursor, cursor + duration)`, emitted when it fits inside the
/// interval and no occupying booking on the ledger overlaps it. Granularity
/// and duration are independent: a 60-minute service on a 30-minute grid
/// produces overlapping candidates.
pub fn compute_slots(
    window: &AvailabilityWindow,
    duration_minutes: u32,
    ledger: &DayLedger,
) -> Result<Vec<Span>, EngineError> {
    if !window.is_open || window.intervals.is_empty() {
        return Ok(Vec::new());
    }
    validate_window(window)?;
    if duration_minutes == 0 || duration_minutes > MAX_DURATION_MINUTES {
        return Err(EngineError::Configuration(format!(
            "service duration {duration_minutes} out of range"
        )));
    }

    let duration = duration_minutes as Minutes;
    let step = window.slot_minutes as Minutes;
    let mut slots = Vec::new();

    for interval in &window.intervals {
        let mut cursor = interval.start;
        while cursor + duration <= interval.end {
            let candidate = Span::new(cursor, cursor + duration);
            if !conflicts_with_ledger(ledger, &candidate, None) {
                slots.push(candidate);
            }
            cursor += step;
        }
    }

    Ok(slots)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use ulid::Ulid;

    const H: Minutes = 60;

    fn date() -> NaiveDate {
        // A Monday.
        NaiveDate::from_ymd_opt(2026, 10, 19).unwrap()
    }

    fn window(intervals: Vec<Span>, slot_minutes: u32) -> AvailabilityWindow {
        AvailabilityWindow {
            day_of_week: 1,
            is_open: true,
            intervals,
            slot_minutes,
        }
    }

    fn ledger(entries: &[(Minutes, Minutes, BookingStatus)]) -> DayLedger {
        let mut ledger = DayLedger::new(date());
        for &(start, end, status) in entries {
            ledger.insert(Booking {
                id: Ulid::new(),
                contact_id: Ulid::new(),
                service_id: Ulid::new(),
                date: date(),
                span: Span::new(start, end),
                status,
                reminder_sent: false,
            });
        }
        ledger
    }

    #[test]
    fn full_day_empty_ledger() {
        let w = window(vec![Span::new(9 * H, 17 * H)], 30);
        let slots = compute_slots(&w, 30, &ledger(&[])).unwrap();
        assert_eq!(slots.len(), 16);
        assert_eq!(slots[0].to_string(), "09:00-09:30");
        assert_eq!(slots[15].to_string(), "16:30-17:00");
    }

    #[test]
    fn booked_slot_excluded_exactly() {
        let w = window(vec![Span::new(9 * H, 17 * H)], 30);
        let l = ledger(&[(10 * H, 10 * H + 30, BookingStatus::Confirmed)]);
        let slots = compute_slots(&w, 30, &l).unwrap();
        assert_eq!(slots.len(), 15);
        assert!(!slots.contains(&Span::new(10 * H, 10 * H + 30)));
        assert!(slots.contains(&Span::new(9 * H + 30, 10 * H)));
        assert!(slots.contains(&Span::new(10 * H + 30, 11 * H)));
    }

    #[test]
    fn cancelled_bookings_do_not_block() {
        let w = window(vec![Span::new(9 * H, 17 * H)], 30);
        let l = ledger(&[
            (10 * H, 10 * H + 30, BookingStatus::Cancelled),
            (11 * H, 11 * H + 30, BookingStatus::NoShow),
        ]);
        assert_eq!(compute_slots(&w, 30, &l).unwrap().len(), 16);
    }

    #[test]
    fn granularity_independent_of_duration() {
        let w = window(vec![Span::new(9 * H, 12 * H)], 30);
        let slots = compute_slots(&w, 60, &ledger(&[])).unwrap();
        let rendered: Vec<_> = slots.iter().map(|s| s.to_string()).collect();
        assert_eq!(
            rendered,
            vec!["09:00-10:00", "09:30-10:30", "10:00-11:00", "10:30-11:30", "11:00-12:00"]
        );
    }

    #[test]
    fn long_service_blocked_by_partial_overlap() {
        let w = window(vec![Span::new(9 * H, 12 * H)], 30);
        let l = ledger(&[(10 * H + 15, 10 * H + 45, BookingStatus::Confirmed)]);
        let slots = compute_slots(&w, 60, &l).unwrap();
        let rendered: Vec<_> = slots.iter().map(|s| s.to_string()).collect();
        assert_eq!(rendered, vec!["09:00-10:00", "11:00-12:00"]);
    }

    #[test]
    fn uneven_tail_is_dropped() {
        let w = window(vec![Span::new(9 * H, 10 * H + 20)], 30);
        let slots = compute_slots(&w, 30, &ledger(&[])).unwrap();
        assert_eq!(slots.last().unwrap().to_string(), "09:30-10:00");
        assert_eq!(slots.len(), 2);
    }

    #[test]
    fn intervals_keep_configured_order() {
        let w = window(vec![Span::new(14 * H, 15 * H), Span::new(9 * H, 10 * H)], 30);
        let slots = compute_slots(&w, 30, &ledger(&[])).unwrap();
        let starts: Vec<_> = slots.iter().map(|s| s.start).collect();
        assert_eq!(starts, vec![14 * H, 14 * H + 30, 9 * H, 9 * H + 30]);
    }

    #[test]
    fn closed_or_empty_window_has_no_slots() {
        let mut w = window(vec![Span::new(9 * H, 17 * H)], 30);
        w.is_open = false;
        assert!(compute_slots(&w, 30, &ledger(&[])).unwrap().is_empty());
        let w = window(vec![], 30);
        assert!(compute_slots(&w, 30, &ledger(&[])).unwrap().is_empty());
    }

    #[test]
    fn service_longer_than_interval() {
        let w = window(vec![Span::new(9 * H, 9 * H + 30)], 15);
        assert!(compute_slots(&w, 45, &ledger(&[])).unwrap().is_empty());
    }

    #[test]
    fn malformed_window_fails_fast() {
        let w = window(vec![Span { start: 17 * H, end: 9 * H }], 30);
        assert!(matches!(
            compute_slots(&w, 30, &ledger(&[])),
            Err(EngineError::Configuration(_))
        ));

        let w = window(vec![Span::new(9 * H, 17 * H)], 0);
        assert!(matches!(
            compute_slots(&w, 30, &ledger(&[])),
            Err(EngineError::Configuration(_))
        ));

        let w = window(vec![Span::new(9 * H, 12 * H), Span::new(11 * H, 13 * H)], 30);
        assert!(matches!(validate_window(&w), Err(EngineError::Configuration(_))));
    }

    #[test]
    fn adjacent_intervals_are_valid() {
        let w = window(vec![Span::new(9 * H, 12 * H), Span::new(12 * H, 13 * H)], 30);
        assert!(validate_window(&w).is_ok());
    }

    #[test]
    fn every_slot_passes_conflict_check() {
        let w = window(vec![Span::new(8 * H, 12 * H), Span::new(13 * H, 18 * H)], 15);
        let l = ledger(&[
            (8 * H + 40, 9 * H + 10, BookingStatus::Confirmed),
            (13 * H, 14 * H, BookingStatus::Completed),
            (16 * H + 5, 16 * H + 20, BookingStatus::Confirmed),
        ]);
        for duration in [15, 30, 45, 90] {
            for slot in compute_slots(&w, duration, &l).unwrap() {
                assert!(!conflicts_with_ledger(&l, &slot, None), "{slot} conflicts");
                assert_eq!(slot.duration(), duration as Minutes);
            }
        }
    }
}
