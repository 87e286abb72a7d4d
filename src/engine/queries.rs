use chrono::{Duration, NaiveDate, NaiveDateTime};
use ulid::Ulid;

use crate::model::*;
use crate::reminder::{self, DueBookingReminder, DueFormReminder, Verdict};

use super::conflict::conflicts_with_ledger;
use super::slots::compute_slots;
use super::{Engine, EngineError};

impl Engine {
    pub async fn settings(&self) -> TenantSettings {
        *self.settings.read().await
    }

    pub fn window(&self, day_of_week: u8) -> Option<AvailabilityWindow> {
        self.windows.get(&day_of_week).map(|e| e.value().clone())
    }

    pub fn service(&self, id: Ulid) -> Option<ServiceDefinition> {
        self.services.get(&id).map(|e| e.value().clone())
    }

    pub fn contact(&self, id: Ulid) -> Option<Contact> {
        self.contacts.get(&id).map(|e| e.value().clone())
    }

    pub fn form_template(&self, id: Ulid) -> Option<FormTemplate> {
        self.form_templates.get(&id).map(|e| e.value().clone())
    }

    /// Active templates of a service, in id order.
    pub fn form_templates_for(&self, service_id: Ulid) -> Vec<FormTemplate> {
        let mut templates: Vec<_> = self
            .form_templates
            .iter()
            .filter(|e| e.service_id == service_id && e.active)
            .map(|e| e.value().clone())
            .collect();
        templates.sort_by_key(|t| t.id);
        templates
    }

    /// Form items issued for a booking, in due order.
    pub async fn forms_for_booking(&self, booking_id: Ulid) -> Vec<PendingReminderItem> {
        let items: Vec<_> = self.forms.iter().map(|e| e.value().clone()).collect();
        let mut linked = Vec::new();
        for item in items {
            let guard = item.read().await;
            if guard.booking_id == Some(booking_id) {
                linked.push(guard.clone());
            }
        }
        linked.sort_by_key(|i| (i.due_at, i.id));
        linked
    }

    /// Free slots for `service_id` on `date`, in window order. No window
    /// for the weekday means no slots.
    pub async fn available_slots(&self, service_id: Ulid, date: NaiveDate) -> Result<Vec<Slot>, EngineError> {
        let service = self.service(service_id).ok_or(EngineError::NotFound(service_id))?;
        let Some(window) = self.window(day_of_week(date)) else {
            return Ok(Vec::new());
        };
        let spans = match self.existing_ledger(date) {
            Some(ledger) => compute_slots(&window, service.duration_minutes, &*ledger.read().await)?,
            None => compute_slots(&window, service.duration_minutes, &DayLedger::new(date))?,
        };
        Ok(spans
            .into_iter()
            .map(|span| Slot {
                span,
                available: true,
            })
            .collect())
    }

    /// Whether `span` on `date` is free of occupying bookings, ignoring `exclude`.
    pub async fn is_slot_available(&self, date: NaiveDate, span: Span, exclude: Option<Ulid>) -> bool {
        match self.existing_ledger(date) {
            Some(ledger) => !conflicts_with_ledger(&*ledger.read().await, &span, exclude),
            None => true,
        }
    }

    /// All bookings on `date` in start order, any status.
    pub async fn bookings_on(&self, date: NaiveDate) -> Vec<Booking> {
        match self.existing_ledger(date) {
            Some(ledger) => ledger.read().await.bookings.clone(),
            None => Vec::new(),
        }
    }

    pub async fn booking(&self, id: Ulid) -> Option<Booking> {
        let date = self.booking_date(id).ok()?;
        let ledger = self.existing_ledger(date)?;
        let guard = ledger.read().await;
        guard.get(id).cloned()
    }

    pub async fn is_automation_paused(&self, contact_id: Ulid) -> bool {
        match self.conversations.get(&contact_id).map(|e| e.value().clone()) {
            Some(conv) => conv.read().await.paused,
            None => false,
        }
    }

    pub async fn conversation(&self, contact_id: Ulid) -> Option<Conversation> {
        let conv = self.conversations.get(&contact_id).map(|e| e.value().clone())?;
        let guard = conv.read().await;
        Some(guard.clone())
    }

    pub async fn form_item(&self, id: Ulid) -> Option<PendingReminderItem> {
        let item = self.form_entry(id)?;
        let guard = item.read().await;
        Some(guard.clone())
    }

    /// Confirmed bookings whose reminder is due at `now`. Only days that can
    /// hold a due appointment (`now` through `now + lead`) are scanned.
    pub async fn due_booking_reminders(
        &self,
        now: NaiveDateTime,
        config: &AutomationConfig,
    ) -> Vec<DueBookingReminder> {
        let horizon = now + Duration::minutes(config.booking_reminder_lead_minutes as i64);
        let mut due = Vec::new();
        let mut date = now.date();
        while date <= horizon.date() {
            if let Some(ledger) = self.existing_ledger(date) {
                let bookings: Vec<Booking> = ledger
                    .read()
                    .await
                    .bookings
                    .iter()
                    .filter(|b| b.status == BookingStatus::Confirmed && !b.reminder_sent)
                    .cloned()
                    .collect();
                for booking in bookings {
                    let contact = self.contact(booking.contact_id);
                    let paused = self.is_automation_paused(booking.contact_id).await;
                    match reminder::evaluate_booking(&booking, contact.as_ref(), paused, now, config) {
                        Verdict::Due => {
                            let Some(contact) = contact else { continue };
                            let Some(target) = contact.deliverable_email().map(str::to_string) else {
                                continue;
                            };
                            due.push(DueBookingReminder {
                                booking,
                                contact,
                                target,
                            });
                        }
                        Verdict::Skip(reason) => {
                            tracing::trace!(tenant = %self.tenant, booking = %booking.id, ?reason, "booking reminder skipped");
                        }
                    }
                }
            }
            let Some(next) = date.succ_opt() else { break };
            date = next;
        }
        due
    }

    /// Open form items whose reminder is due at `now`.
    pub async fn due_form_reminders(
        &self,
        now: NaiveDateTime,
        config: &AutomationConfig,
    ) -> Vec<DueFormReminder> {
        let items: Vec<_> = self.forms.iter().map(|e| e.value().clone()).collect();
        let mut snapshot = Vec::with_capacity(items.len());
        for item in items {
            let guard = item.read().await;
            if guard.status.is_open() && guard.due_at <= now {
                snapshot.push(guard.clone());
            }
        }
        snapshot.sort_by_key(|i| (i.due_at, i.id));

        let mut due = Vec::new();
        for item in snapshot {
            let contact = self.contact(item.contact_id);
            let paused = self.is_automation_paused(item.contact_id).await;
            match reminder::evaluate_form(&item, contact.as_ref(), paused, now, config) {
                Verdict::Due => {
                    let Some(contact) = contact else { continue };
                    let Some(target) = contact.deliverable_email().map(str::to_string) else {
                        continue;
                    };
                    due.push(DueFormReminder {
                        max_reminders: reminder::form_max(&item, config),
                        item,
                        contact,
                        target,
                    });
                }
                Verdict::Skip(reason) => {
                    tracing::trace!(tenant = %self.tenant, form = %item.id, ?reason, "form reminder skipped");
                }
            }
        }
        due
    }
}
