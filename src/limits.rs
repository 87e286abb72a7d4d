//! Hard limits. Everything that grows with client input is capped here.

pub const MAX_TENANTS: usize = 1024;
pub const MAX_TENANT_NAME_LEN: usize = 128;

pub const MAX_INTERVALS_PER_DAY: usize = 48;
pub const MAX_BOOKINGS_PER_DAY: usize = 2_000;
pub const MAX_SERVICES_PER_TENANT: usize = 10_000;
pub const MAX_CONTACTS_PER_TENANT: usize = 1_000_000;
pub const MAX_FORM_ITEMS_PER_TENANT: usize = 1_000_000;
pub const MAX_FORM_TEMPLATES_PER_TENANT: usize = 1_000;

/// Outbound messages kept per conversation; oldest are dropped first.
pub const MAX_MESSAGES_PER_CONVERSATION: usize = 200;

pub const MAX_NAME_LEN: usize = 256;
pub const MAX_EMAIL_LEN: usize = 320;

/// Upper bound for service durations and slot granularity (one day).
pub const MAX_DURATION_MINUTES: u32 = 24 * 60;

/// Reminder lead time is capped at one week.
pub const MAX_REMINDER_LEAD_MINUTES: u32 = 7 * 24 * 60;
pub const MAX_FORM_REMINDERS: u32 = 100;

/// A post-booking form is due at most 90 days after the booking is made.
pub const MAX_FORM_DUE_HOURS: u32 = 90 * 24;
