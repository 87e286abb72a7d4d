use ulid::Ulid;

use crate::limits::MAX_DURATION_MINUTES;
use crate::model::*;

use super::EngineError;

/// Half-open overlap: back-to-back intervals (`a.end == b.start`) do not conflict.
pub fn overlaps(a: &Span, b: &Span) -> bool {
    a.start < b.end && a.end > b.start
}

/// First occupying booking on the ledger that overlaps `candidate`.
/// `exclude` skips one booking id (the booking being rescheduled).
pub fn find_conflict(ledger: &DayLedger, candidate: &Span, exclude: Option<Ulid>) -> Option<Ulid> {
    ledger
        .overlapping(candidate)
        .filter(|b| b.status.occupies() && Some(b.id) != exclude)
        .find(|b| overlaps(&b.span, candidate))
        .map(|b| b.id)
}

pub fn conflicts_with_ledger(ledger: &DayLedger, candidate: &Span, exclude: Option<Ulid>) -> bool {
    find_conflict(ledger, candidate, exclude).is_some()
}

pub(crate) fn check_no_conflict(
    ledger: &DayLedger,
    candidate: &Span,
    exclude: Option<Ulid>,
) -> Result<(), EngineError> {
    match find_conflict(ledger, candidate, exclude) {
        Some(id) => {
            metrics::counter!(crate::observability::BOOKING_CONFLICTS_TOTAL).increment(1);
            Err(EngineError::Conflict(id))
        }
        None => Ok(()),
    }
}

/// Interval a booking of `duration_minutes` starting at `start` occupies.
/// Bookings may not cross midnight.
pub(crate) fn booking_span(start: TimeOfDay, duration_minutes: u32) -> Result<Span, EngineError> {
    if duration_minutes == 0 || duration_minutes > MAX_DURATION_MINUTES {
        return Err(EngineError::InvalidInput(format!(
            "service duration {duration_minutes} out of range"
        )));
    }
    let end = start.minutes() + duration_minutes as Minutes;
    if end > MINUTES_PER_DAY {
        return Err(EngineError::InvalidInput(format!(
            "booking starting at {start} for {duration_minutes} minutes crosses midnight"
        )));
    }
    Ok(Span::new(start.minutes(), end))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn ledger(entries: &[(Minutes, Minutes, BookingStatus)]) -> (DayLedger, Vec<Ulid>) {
        let date = NaiveDate::from_ymd_opt(2026, 10, 19).unwrap();
        let mut ledger = DayLedger::new(date);
        let mut ids = Vec::new();
        for &(start, end, status) in entries {
            let id = Ulid::new();
            ids.push(id);
            ledger.insert(Booking {
                id,
                contact_id: Ulid::new(),
                service_id: Ulid::new(),
                date,
                span: Span::new(start, end),
                status,
                reminder_sent: false,
            });
        }
        (ledger, ids)
    }

    #[test]
    fn overlap_predicate() {
        let a = Span::new(600, 630);
        assert!(overlaps(&a, &Span::new(629, 700)));
        assert!(!overlaps(&a, &Span::new(630, 700)));
        assert!(!overlaps(&Span::new(630, 700), &a));
        assert!(overlaps(&a, &a));
    }

    #[test]
    fn only_occupying_statuses_conflict() {
        let (l, _) = ledger(&[
            (600, 630, BookingStatus::Cancelled),
            (600, 630, BookingStatus::NoShow),
        ]);
        assert!(!conflicts_with_ledger(&l, &Span::new(600, 630), None));

        let (l, ids) = ledger(&[(600, 630, BookingStatus::Completed)]);
        assert_eq!(find_conflict(&l, &Span::new(615, 645), None), Some(ids[0]));
    }

    #[test]
    fn exclusion_skips_self_only() {
        let (l, ids) = ledger(&[
            (600, 630, BookingStatus::Confirmed),
            (630, 660, BookingStatus::Confirmed),
        ]);
        // Moving booking 0 onto its own interval is fine.
        assert!(!conflicts_with_ledger(&l, &Span::new(600, 630), Some(ids[0])));
        // Moving booking 0 so it overlaps booking 1 is not.
        assert_eq!(find_conflict(&l, &Span::new(615, 645), Some(ids[0])), Some(ids[1]));
    }

    #[test]
    fn back_to_back_is_legal() {
        let (l, _) = ledger(&[(600, 630, BookingStatus::Confirmed)]);
        assert!(!conflicts_with_ledger(&l, &Span::new(630, 660), None));
        assert!(!conflicts_with_ledger(&l, &Span::new(570, 600), None));
    }

    #[test]
    fn booking_span_bounds() {
        let t = |s: &str| s.parse::<TimeOfDay>().unwrap();
        assert_eq!(booking_span(t("09:00"), 45).unwrap(), Span::new(540, 585));
        assert_eq!(booking_span(t("23:30"), 30).unwrap(), Span::new(1410, 1440));
        assert!(matches!(booking_span(t("23:45"), 30), Err(EngineError::InvalidInput(_))));
        assert!(matches!(booking_span(t("09:00"), 0), Err(EngineError::InvalidInput(_))));
    }
}
