//! Reminder eligibility rules. Pure functions of the item, its contact,
//! the pause flag, the tenant's automation config and `now`.
//!
//! Gating order is fixed: contactability, then the pause flag, then timing.

use chrono::{Duration, NaiveDateTime};

use crate::model::*;

/// Why an item was not due. Only used for logging and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    NotContactable,
    Paused,
    NotConfirmed,
    AlreadySent,
    TooEarly,
    /// The appointment already started; late reminders are not sent.
    Stale,
    Closed,
    NotYetDue,
    MaxReached,
    Cooldown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Due,
    Skip(SkipReason),
}

impl Verdict {
    pub fn is_due(self) -> bool {
        matches!(self, Verdict::Due)
    }
}

fn gate(contact: Option<&Contact>, paused: bool) -> Option<SkipReason> {
    if contact.and_then(Contact::deliverable_email).is_none() {
        return Some(SkipReason::NotContactable);
    }
    if paused {
        return Some(SkipReason::Paused);
    }
    None
}

/// Due iff not yet sent and `start - lead <= now <= start`.
pub fn booking_timing(booking: &Booking, now: NaiveDateTime, lead_minutes: u32) -> Verdict {
    if booking.status != BookingStatus::Confirmed {
        return Verdict::Skip(SkipReason::NotConfirmed);
    }
    if booking.reminder_sent {
        return Verdict::Skip(SkipReason::AlreadySent);
    }
    let start = booking.starts_at();
    if now < start - Duration::minutes(lead_minutes as i64) {
        return Verdict::Skip(SkipReason::TooEarly);
    }
    if now > start {
        return Verdict::Skip(SkipReason::Stale);
    }
    Verdict::Due
}

/// Due iff open, past `due_at`, under the cap and outside the cooldown.
pub fn form_timing(
    item: &PendingReminderItem,
    now: NaiveDateTime,
    cooldown_hours: u32,
    max_reminders: u32,
) -> Verdict {
    if !item.status.is_open() {
        return Verdict::Skip(SkipReason::Closed);
    }
    if item.due_at > now {
        return Verdict::Skip(SkipReason::NotYetDue);
    }
    if item.reminder_count >= max_reminders {
        return Verdict::Skip(SkipReason::MaxReached);
    }
    if let Some(last) = item.last_reminder_at
        && now - last < Duration::hours(cooldown_hours as i64)
    {
        return Verdict::Skip(SkipReason::Cooldown);
    }
    Verdict::Due
}

pub fn evaluate_booking(
    booking: &Booking,
    contact: Option<&Contact>,
    paused: bool,
    now: NaiveDateTime,
    config: &AutomationConfig,
) -> Verdict {
    if let Some(reason) = gate(contact, paused) {
        return Verdict::Skip(reason);
    }
    booking_timing(booking, now, config.booking_reminder_lead_minutes)
}

/// Effective cap for an item: its own override, else the tenant's.
pub fn form_max(item: &PendingReminderItem, config: &AutomationConfig) -> u32 {
    item.max_reminders.unwrap_or(config.form_reminder_max)
}

pub fn evaluate_form(
    item: &PendingReminderItem,
    contact: Option<&Contact>,
    paused: bool,
    now: NaiveDateTime,
    config: &AutomationConfig,
) -> Verdict {
    if let Some(reason) = gate(contact, paused) {
        return Verdict::Skip(reason);
    }
    form_timing(
        item,
        now,
        config.form_reminder_cooldown_hours,
        form_max(item, config),
    )
}

/// A booking whose reminder is due now, with the address to send it to.
#[derive(Debug, Clone)]
pub struct DueBookingReminder {
    pub booking: Booking,
    pub contact: Contact,
    pub target: String,
}

/// A form item whose reminder is due now.
#[derive(Debug, Clone)]
pub struct DueFormReminder {
    pub item: PendingReminderItem,
    pub max_reminders: u32,
    pub contact: Contact,
    pub target: String,
}
