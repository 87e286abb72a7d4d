use std::collections::VecDeque;
use std::fmt;
use std::str::FromStr;

use chrono::{Datelike, NaiveDate, NaiveDateTime, NaiveTime};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::limits::MAX_MESSAGES_PER_CONVERSATION;

/// Minutes since local midnight. The only time-of-day unit.
pub type Minutes = i32;

pub const MINUTES_PER_DAY: Minutes = 24 * 60;

/// Addresses on this domain are placeholders created for contacts without email.
pub const PLACEHOLDER_EMAIL_DOMAIN: &str = "@no-email.local";

// ── Time of day ──────────────────────────────────────────────────

/// Wall-clock time of day. Parsed once from `"HH:MM"`, formatted back only at the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TimeOfDay(Minutes);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("malformed time of day {0:?} (expected HH:MM)")]
pub struct TimeParseError(pub String);

impl TimeOfDay {
    /// `24:00` is accepted as the end of the day.
    pub fn from_minutes(minutes: Minutes) -> Option<Self> {
        (0..=MINUTES_PER_DAY).contains(&minutes).then_some(Self(minutes))
    }

    pub fn minutes(self) -> Minutes {
        self.0
    }
}

impl FromStr for TimeOfDay {
    type Err = TimeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || TimeParseError(s.to_string());
        let (h, m) = s.trim().split_once(':').ok_or_else(err)?;
        let digits = |part: &str| !part.is_empty() && part.bytes().all(|b| b.is_ascii_digit());
        if !digits(h) || h.len() > 2 || !digits(m) || m.len() != 2 {
            return Err(err());
        }
        let hours: Minutes = h.parse().map_err(|_| err())?;
        let minutes: Minutes = m.parse().map_err(|_| err())?;
        if minutes > 59 || hours > 24 || (hours == 24 && minutes != 0) {
            return Err(err());
        }
        Ok(Self(hours * 60 + minutes))
    }
}

impl fmt::Display for TimeOfDay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}:{:02}", self.0 / 60, self.0 % 60)
    }
}

// ── Spans ────────────────────────────────────────────────────────

/// Half-open interval `[start, end)` in minutes since midnight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Span {
    pub start: Minutes,
    pub end: Minutes,
}

impl Span {
    pub fn new(start: Minutes, end: Minutes) -> Self {
        debug_assert!(start < end, "Span start must be before end");
        Self { start, end }
    }

    /// Build a span from two times of day. `None` unless `end > start`.
    pub fn between(start: TimeOfDay, end: TimeOfDay) -> Option<Self> {
        (end > start).then(|| Self::new(start.minutes(), end.minutes()))
    }

    pub fn duration(&self) -> Minutes {
        self.end - self.start
    }

    pub fn overlaps(&self, other: &Span) -> bool {
        self.start < other.end && self.end > other.start
    }

    pub fn start_time(&self) -> TimeOfDay {
        TimeOfDay(self.start)
    }

    pub fn end_time(&self) -> TimeOfDay {
        TimeOfDay(self.end)
    }
}

impl fmt::Display for Span {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.start_time(), self.end_time())
    }
}

/// A bookable interval as returned by the slot query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Slot {
    pub span: Span,
    pub available: bool,
}

// ── Availability & services ──────────────────────────────────────

/// Recurring open hours for one weekday. At most one per (tenant, day).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AvailabilityWindow {
    /// 0 = Sunday … 6 = Saturday.
    pub day_of_week: u8,
    pub is_open: bool,
    /// Open intervals, in the order the owner configured them.
    pub intervals: Vec<Span>,
    /// Cursor step for slot generation; independent of service duration.
    pub slot_minutes: u32,
}

pub const DEFAULT_SLOT_MINUTES: u32 = 30;

pub fn day_of_week(date: NaiveDate) -> u8 {
    date.weekday().num_days_from_sunday() as u8
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceDefinition {
    pub id: Ulid,
    pub name: String,
    pub duration_minutes: u32,
    /// Recorded for display; not applied to slot length or conflicts.
    pub buffer_minutes: u32,
}

// ── Bookings ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BookingStatus {
    Confirmed,
    Completed,
    NoShow,
    Cancelled,
}

impl BookingStatus {
    /// Only these statuses hold their interval on the ledger.
    pub fn occupies(self) -> bool {
        matches!(self, BookingStatus::Confirmed | BookingStatus::Completed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BookingStatus::Confirmed => "confirmed",
            BookingStatus::Completed => "completed",
            BookingStatus::NoShow => "no-show",
            BookingStatus::Cancelled => "cancelled",
        }
    }
}

impl FromStr for BookingStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "confirmed" => Ok(BookingStatus::Confirmed),
            "completed" => Ok(BookingStatus::Completed),
            "no-show" | "no_show" => Ok(BookingStatus::NoShow),
            "cancelled" | "canceled" => Ok(BookingStatus::Cancelled),
            other => Err(format!("unknown booking status: {other}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Booking {
    pub id: Ulid,
    pub contact_id: Ulid,
    pub service_id: Ulid,
    pub date: NaiveDate,
    pub span: Span,
    pub status: BookingStatus,
    pub reminder_sent: bool,
}

impl Booking {
    /// Appointment start on the naive local wall clock.
    pub fn starts_at(&self) -> NaiveDateTime {
        self.date.and_time(NaiveTime::MIN) + chrono::Duration::minutes(self.span.start as i64)
    }
}

/// All bookings of one tenant on one calendar day, sorted by `span.start`.
#[derive(Debug, Clone)]
pub struct DayLedger {
    pub date: NaiveDate,
    pub bookings: Vec<Booking>,
}

impl DayLedger {
    pub fn new(date: NaiveDate) -> Self {
        Self {
            date,
            bookings: Vec::new(),
        }
    }

    /// Insert booking maintaining sort order by span.start.
    pub fn insert(&mut self, booking: Booking) {
        let pos = self
            .bookings
            .partition_point(|b| b.span.start <= booking.span.start);
        self.bookings.insert(pos, booking);
    }

    pub fn remove(&mut self, id: Ulid) -> Option<Booking> {
        let pos = self.bookings.iter().position(|b| b.id == id)?;
        Some(self.bookings.remove(pos))
    }

    pub fn get(&self, id: Ulid) -> Option<&Booking> {
        self.bookings.iter().find(|b| b.id == id)
    }

    pub fn get_mut(&mut self, id: Ulid) -> Option<&mut Booking> {
        self.bookings.iter_mut().find(|b| b.id == id)
    }

    /// Bookings (of any status) whose span overlaps the query.
    pub fn overlapping(&self, query: &Span) -> impl Iterator<Item = &Booking> {
        let right_bound = self.bookings.partition_point(|b| b.span.start < query.end);
        self.bookings[..right_bound]
            .iter()
            .filter(move |b| b.span.end > query.start)
    }
}

// ── Form reminders ───────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FormStatus {
    Pending,
    Overdue,
    Completed,
}

impl FormStatus {
    pub fn is_open(self) -> bool {
        !matches!(self, FormStatus::Completed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            FormStatus::Pending => "pending",
            FormStatus::Overdue => "overdue",
            FormStatus::Completed => "completed",
        }
    }
}

/// A form the contact still has to fill in; reminded with cooldown and cap.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingReminderItem {
    pub id: Ulid,
    pub contact_id: Ulid,
    /// Set when the item was issued for a booking from a form template.
    pub booking_id: Option<Ulid>,
    pub template_id: Option<Ulid>,
    pub due_at: NaiveDateTime,
    pub status: FormStatus,
    pub reminder_count: u32,
    pub last_reminder_at: Option<NaiveDateTime>,
    /// Per-item cap; the tenant's `form_reminder_max` applies when absent.
    pub max_reminders: Option<u32>,
    pub completed_at: Option<NaiveDateTime>,
}

impl PendingReminderItem {
    pub fn new(id: Ulid, contact_id: Ulid, due_at: NaiveDateTime) -> Self {
        Self {
            id,
            contact_id,
            booking_id: None,
            template_id: None,
            due_at,
            status: FormStatus::Pending,
            reminder_count: 0,
            last_reminder_at: None,
            max_reminders: None,
            completed_at: None,
        }
    }
}

/// A form every booking of `service_id` has to fill in, due
/// `due_in_hours` after the booking is made.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FormTemplate {
    pub id: Ulid,
    pub service_id: Ulid,
    pub name: String,
    pub due_in_hours: u32,
    pub active: bool,
}

impl FormTemplate {
    /// The pending item this template issues for a new booking.
    pub fn issue(&self, booking: &Booking, now: NaiveDateTime) -> PendingReminderItem {
        PendingReminderItem {
            booking_id: Some(booking.id),
            template_id: Some(self.id),
            ..PendingReminderItem::new(
                Ulid::new(),
                booking.contact_id,
                now + chrono::Duration::hours(i64::from(self.due_in_hours)),
            )
        }
    }
}

// ── Tenant settings ──────────────────────────────────────────────

pub const DEFAULT_BOOKING_REMINDER_LEAD_MINUTES: u32 = 60;
pub const DEFAULT_FORM_REMINDER_COOLDOWN_HOURS: u32 = 12;
pub const DEFAULT_FORM_REMINDER_MAX: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AutomationConfig {
    pub booking_reminder_lead_minutes: u32,
    pub form_reminder_cooldown_hours: u32,
    pub form_reminder_max: u32,
}

impl Default for AutomationConfig {
    fn default() -> Self {
        Self {
            booking_reminder_lead_minutes: DEFAULT_BOOKING_REMINDER_LEAD_MINUTES,
            form_reminder_cooldown_hours: DEFAULT_FORM_REMINDER_COOLDOWN_HOURS,
            form_reminder_max: DEFAULT_FORM_REMINDER_MAX,
        }
    }
}

impl AutomationConfig {
    /// Zero means "unset" and falls back to the default for that field.
    pub fn with_defaults(self) -> Self {
        let d = Self::default();
        let or_default = |v: u32, def: u32| if v == 0 { def } else { v };
        Self {
            booking_reminder_lead_minutes: or_default(
                self.booking_reminder_lead_minutes,
                d.booking_reminder_lead_minutes,
            ),
            form_reminder_cooldown_hours: or_default(
                self.form_reminder_cooldown_hours,
                d.form_reminder_cooldown_hours,
            ),
            form_reminder_max: or_default(self.form_reminder_max, d.form_reminder_max),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TenantSettings {
    pub active: bool,
    /// Whether an email integration is connected; automation needs one to send.
    pub email_channel: bool,
    pub automation: AutomationConfig,
}

impl Default for TenantSettings {
    fn default() -> Self {
        Self {
            active: true,
            email_channel: false,
            automation: AutomationConfig::default(),
        }
    }
}

// ── Contacts & conversations ─────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Contact {
    pub id: Ulid,
    pub name: Option<String>,
    pub email: Option<String>,
}

impl Contact {
    /// A usable delivery address: present, non-empty, not a placeholder.
    pub fn deliverable_email(&self) -> Option<&str> {
        self.email
            .as_deref()
            .map(str::trim)
            .filter(|e| !e.is_empty() && !e.ends_with(PLACEHOLDER_EMAIL_DOMAIN))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Channel {
    Email,
}

impl Channel {
    pub fn as_str(self) -> &'static str {
        match self {
            Channel::Email => "email",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub at: NaiveDateTime,
    pub channel: Channel,
    pub content: String,
}

/// Per-contact thread. Holds the automation pause flag and the outbound log.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Conversation {
    pub paused: bool,
    pub last_message_at: Option<NaiveDateTime>,
    pub messages: VecDeque<OutboundMessage>,
}

impl Conversation {
    pub fn record_outbound(&mut self, message: OutboundMessage) {
        self.last_message_at = Some(message.at);
        if self.messages.len() >= MAX_MESSAGES_PER_CONVERSATION {
            self.messages.pop_front();
        }
        self.messages.push_back(message);
    }
}

// ── WAL events ───────────────────────────────────────────────────

/// Flat event types. This is the WAL record format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Event {
    SettingsUpdated {
        settings: TenantSettings,
    },
    AvailabilitySet {
        window: AvailabilityWindow,
    },
    ServiceDefined {
        service: ServiceDefinition,
    },
    FormTemplateDefined {
        template: FormTemplate,
    },
    ContactUpserted {
        contact: Contact,
    },
    PauseSet {
        contact_id: Ulid,
        paused: bool,
    },
    BookingCreated {
        booking: Booking,
    },
    BookingRescheduled {
        id: Ulid,
        from: NaiveDate,
        date: NaiveDate,
        span: Span,
    },
    BookingStatusChanged {
        id: Ulid,
        date: NaiveDate,
        status: BookingStatus,
    },
    BookingReminded {
        id: Ulid,
        date: NaiveDate,
        contact_id: Ulid,
        message: OutboundMessage,
    },
    FormItemCreated {
        item: PendingReminderItem,
    },
    FormItemsOverdue {
        ids: Vec<Ulid>,
    },
    FormReminded {
        id: Ulid,
        contact_id: Ulid,
        message: OutboundMessage,
    },
    FormItemCompleted {
        id: Ulid,
        at: NaiveDateTime,
    },
    /// Compaction only: restores a conversation's outbound log.
    ConversationRestored {
        contact_id: Ulid,
        paused: bool,
        last_message_at: Option<NaiveDateTime>,
        messages: Vec<OutboundMessage>,
    },
}
