use std::sync::Arc;

use chrono::{NaiveDate, NaiveDateTime};
use tokio::sync::{oneshot, RwLock};
use ulid::Ulid;

use crate::automation::local_now;
use crate::limits::*;
use crate::model::*;

use super::conflict::{booking_span, check_no_conflict};
use super::slots::validate_window;
use super::{
    apply_reschedule, apply_to_conversation, apply_to_form, apply_to_ledger, Engine, EngineError,
    WalCommand,
};

/// Reschedules retry when the booking moved to another day between the
/// index lookup and acquiring the ledger lock.
const RESCHEDULE_ATTEMPTS: usize = 3;

impl Engine {
    // ── Tenant configuration ─────────────────────────────

    pub async fn update_settings(&self, settings: TenantSettings) -> Result<(), EngineError> {
        let settings = TenantSettings {
            automation: settings.automation.with_defaults(),
            ..settings
        };
        if settings.automation.booking_reminder_lead_minutes > MAX_REMINDER_LEAD_MINUTES {
            return Err(EngineError::LimitExceeded("reminder lead time too long"));
        }
        if settings.automation.form_reminder_max > MAX_FORM_REMINDERS {
            return Err(EngineError::LimitExceeded("too many form reminders"));
        }
        let _gate = self.write_gate.read().await;
        let mut guard = self.settings.write().await;
        self.wal_append(&Event::SettingsUpdated { settings }).await?;
        *guard = settings;
        Ok(())
    }

    /// Replace the open hours for one weekday.
    pub async fn set_availability(&self, window: AvailabilityWindow) -> Result<(), EngineError> {
        validate_window(&window)?;
        let _gate = self.write_gate.read().await;
        let event = Event::AvailabilitySet {
            window: window.clone(),
        };
        self.wal_append(&event).await?;
        self.windows.insert(window.day_of_week, window);
        Ok(())
    }

    pub async fn define_service(&self, service: ServiceDefinition) -> Result<(), EngineError> {
        if service.duration_minutes == 0 || service.duration_minutes > MAX_DURATION_MINUTES {
            return Err(EngineError::InvalidInput(format!(
                "service duration {} out of range",
                service.duration_minutes
            )));
        }
        if service.buffer_minutes > MAX_DURATION_MINUTES {
            return Err(EngineError::InvalidInput("buffer too long".into()));
        }
        if service.name.len() > MAX_NAME_LEN {
            return Err(EngineError::LimitExceeded("service name too long"));
        }
        if !self.services.contains_key(&service.id)
            && self.services.len() >= MAX_SERVICES_PER_TENANT
        {
            return Err(EngineError::LimitExceeded("too many services"));
        }
        let _gate = self.write_gate.read().await;
        let event = Event::ServiceDefined {
            service: service.clone(),
        };
        self.wal_append(&event).await?;
        self.services.insert(service.id, service);
        Ok(())
    }

    /// Attach a post-booking form to a service. Later bookings of that
    /// service each get a pending item for it.
    pub async fn define_form_template(&self, template: FormTemplate) -> Result<(), EngineError> {
        if !self.services.contains_key(&template.service_id) {
            return Err(EngineError::NotFound(template.service_id));
        }
        if template.name.len() > MAX_NAME_LEN {
            return Err(EngineError::LimitExceeded("form name too long"));
        }
        if template.due_in_hours > MAX_FORM_DUE_HOURS {
            return Err(EngineError::InvalidInput(format!(
                "form due in {} hours is too far out",
                template.due_in_hours
            )));
        }
        if !self.form_templates.contains_key(&template.id)
            && self.form_templates.len() >= MAX_FORM_TEMPLATES_PER_TENANT
        {
            return Err(EngineError::LimitExceeded("too many form templates"));
        }
        let _gate = self.write_gate.read().await;
        let event = Event::FormTemplateDefined {
            template: template.clone(),
        };
        self.wal_append(&event).await?;
        self.form_templates.insert(template.id, template);
        Ok(())
    }

    pub async fn upsert_contact(&self, contact: Contact) -> Result<(), EngineError> {
        if contact.name.as_ref().is_some_and(|n| n.len() > MAX_NAME_LEN) {
            return Err(EngineError::LimitExceeded("contact name too long"));
        }
        if contact.email.as_ref().is_some_and(|e| e.len() > MAX_EMAIL_LEN) {
            return Err(EngineError::LimitExceeded("contact email too long"));
        }
        if !self.contacts.contains_key(&contact.id)
            && self.contacts.len() >= MAX_CONTACTS_PER_TENANT
        {
            return Err(EngineError::LimitExceeded("too many contacts"));
        }
        let _gate = self.write_gate.read().await;
        let event = Event::ContactUpserted {
            contact: contact.clone(),
        };
        self.wal_append(&event).await?;
        self.contacts.insert(contact.id, contact);
        Ok(())
    }

    /// Staff takeover: a paused conversation receives no automated messages.
    pub async fn set_automation_paused(&self, contact_id: Ulid, paused: bool) -> Result<(), EngineError> {
        if !self.contacts.contains_key(&contact_id) {
            return Err(EngineError::NotFound(contact_id));
        }
        let _gate = self.write_gate.read().await;
        let conv = self.conversation_entry(contact_id);
        let mut guard = conv.write().await;
        let event = Event::PauseSet { contact_id, paused };
        self.wal_append(&event).await?;
        apply_to_conversation(&mut guard, &event);
        Ok(())
    }

    // ── Bookings ─────────────────────────────────────────

    /// Book `service_id` at `date`/`start`. The conflict check and the
    /// insert happen under the same ledger write lock.
    pub async fn create_booking(
        &self,
        id: Ulid,
        contact_id: Ulid,
        service_id: Ulid,
        date: NaiveDate,
        start: TimeOfDay,
    ) -> Result<Booking, EngineError> {
        self.create_booking_at(id, contact_id, service_id, date, start, local_now())
            .await
    }

    /// As `create_booking`, with `now` as the moment the booking is made.
    /// Each active form template of the service issues a pending item due
    /// relative to `now`.
    pub async fn create_booking_at(
        &self,
        id: Ulid,
        contact_id: Ulid,
        service_id: Ulid,
        date: NaiveDate,
        start: TimeOfDay,
        now: NaiveDateTime,
    ) -> Result<Booking, EngineError> {
        if !self.contacts.contains_key(&contact_id) {
            return Err(EngineError::NotFound(contact_id));
        }
        let duration = self
            .services
            .get(&service_id)
            .map(|s| s.duration_minutes)
            .ok_or(EngineError::NotFound(service_id))?;
        let span = booking_span(start, duration)?;
        if self.booking_dates.contains_key(&id) {
            return Err(EngineError::AlreadyExists(id));
        }

        let _gate = self.write_gate.read().await;
        let ledger = self.ledger_entry(date);
        let mut guard = ledger.write().await;
        if guard.bookings.len() >= MAX_BOOKINGS_PER_DAY {
            return Err(EngineError::LimitExceeded("too many bookings on this day"));
        }
        check_no_conflict(&guard, &span, None)?;

        let booking = Booking {
            id,
            contact_id,
            service_id,
            date,
            span,
            status: BookingStatus::Confirmed,
            reminder_sent: false,
        };
        let event = Event::BookingCreated {
            booking: booking.clone(),
        };
        self.wal_append(&event).await?;
        apply_to_ledger(&mut guard, &event);
        self.booking_dates.insert(id, date);
        metrics::counter!(crate::observability::BOOKINGS_CREATED_TOTAL).increment(1);

        for template in self.form_templates_for(service_id) {
            if self.forms.len() >= MAX_FORM_ITEMS_PER_TENANT {
                tracing::warn!(tenant = %self.tenant, booking = %id, "form item limit reached, post-booking forms skipped");
                break;
            }
            let item = template.issue(&booking, now);
            let event = Event::FormItemCreated { item: item.clone() };
            self.wal_append(&event).await?;
            self.forms.insert(item.id, Arc::new(RwLock::new(item)));
        }
        Ok(booking)
    }

    /// Move a confirmed booking. Its own old interval never conflicts with
    /// the new one, and the reminder flag resets.
    pub async fn reschedule_booking(
        &self,
        id: Ulid,
        date: NaiveDate,
        start: TimeOfDay,
    ) -> Result<Booking, EngineError> {
        let _gate = self.write_gate.read().await;
        for _ in 0..RESCHEDULE_ATTEMPTS {
            let from = self.booking_date(id)?;
            // Acquire both day locks in date order to prevent deadlocks.
            let (source_arc, target_arc) = (self.ledger_entry(from), self.ledger_entry(date));
            let (mut source, mut target) = if from == date {
                (source_arc.write_owned().await, None)
            } else if from < date {
                let s = source_arc.write_owned().await;
                let t = target_arc.write_owned().await;
                (s, Some(t))
            } else {
                let t = target_arc.write_owned().await;
                let s = source_arc.write_owned().await;
                (s, Some(t))
            };

            let Some(current) = source.get(id).cloned() else {
                continue;
            };
            if current.status != BookingStatus::Confirmed {
                return Err(EngineError::InvalidInput(format!(
                    "cannot reschedule a {} booking",
                    current.status.as_str()
                )));
            }
            let duration = self
                .services
                .get(&current.service_id)
                .map(|s| s.duration_minutes)
                .unwrap_or(current.span.duration() as u32);
            let span = booking_span(start, duration)?;
            {
                let dest = target.as_deref().unwrap_or(&*source);
                if target.is_some() && dest.bookings.len() >= MAX_BOOKINGS_PER_DAY {
                    return Err(EngineError::LimitExceeded("too many bookings on this day"));
                }
                check_no_conflict(dest, &span, Some(id))?;
            }

            let event = Event::BookingRescheduled { id, from, date, span };
            self.wal_append(&event).await?;
            apply_reschedule(&mut source, target.as_deref_mut(), id, date, span);
            self.booking_dates.insert(id, date);

            let ledger = target.as_deref().unwrap_or(&*source);
            return ledger.get(id).cloned().ok_or(EngineError::NotFound(id));
        }
        Err(EngineError::NotFound(id))
    }

    /// Change a booking's status. Moving back into an occupying status
    /// re-checks the ledger, since the interval may have been taken meanwhile.
    pub async fn set_booking_status(&self, id: Ulid, status: BookingStatus) -> Result<Booking, EngineError> {
        let _gate = self.write_gate.read().await;
        let date = self.booking_date(id)?;
        let ledger = self.ledger_entry(date);
        let mut guard = ledger.write().await;
        let current = guard.get(id).cloned().ok_or(EngineError::NotFound(id))?;
        if current.status == status {
            return Ok(current);
        }
        if status.occupies() && !current.status.occupies() {
            check_no_conflict(&guard, &current.span, Some(id))?;
        }
        let event = Event::BookingStatusChanged { id, date, status };
        self.wal_append(&event).await?;
        apply_to_ledger(&mut guard, &event);
        guard.get(id).cloned().ok_or(EngineError::NotFound(id))
    }

    pub async fn cancel_booking(&self, id: Ulid) -> Result<Booking, EngineError> {
        self.set_booking_status(id, BookingStatus::Cancelled).await
    }

    /// Record a sent booking reminder and its outbound message. `evaluated`
    /// is the booking as it was when the reminder went out. Returns `false`
    /// and writes nothing if the booking was already reminded, is no longer
    /// confirmed, or has moved to another date or time since.
    pub async fn mark_booking_reminded(
        &self,
        evaluated: &Booking,
        message: OutboundMessage,
    ) -> Result<bool, EngineError> {
        let id = evaluated.id;
        let _gate = self.write_gate.read().await;
        let date = self.booking_date(id)?;
        let ledger = self.ledger_entry(date);
        let mut guard = ledger.write().await;
        let booking = guard.get(id).ok_or(EngineError::NotFound(id))?;
        if booking.reminder_sent || booking.status != BookingStatus::Confirmed {
            return Ok(false);
        }
        if booking.date != evaluated.date || booking.span != evaluated.span {
            return Ok(false);
        }
        let contact_id = booking.contact_id;
        let conv_arc = self.conversation_entry(contact_id);
        let mut conv = conv_arc.write().await;

        let event = Event::BookingReminded {
            id,
            date,
            contact_id,
            message,
        };
        self.wal_append(&event).await?;
        apply_to_ledger(&mut guard, &event);
        apply_to_conversation(&mut conv, &event);
        Ok(true)
    }

    // ── Form reminders ───────────────────────────────────

    pub async fn create_form_item(&self, item: PendingReminderItem) -> Result<(), EngineError> {
        if !self.contacts.contains_key(&item.contact_id) {
            return Err(EngineError::NotFound(item.contact_id));
        }
        if self.forms.contains_key(&item.id) {
            return Err(EngineError::AlreadyExists(item.id));
        }
        if self.forms.len() >= MAX_FORM_ITEMS_PER_TENANT {
            return Err(EngineError::LimitExceeded("too many form items"));
        }
        if item.max_reminders.is_some_and(|m| m > MAX_FORM_REMINDERS) {
            return Err(EngineError::LimitExceeded("too many form reminders"));
        }
        let item = PendingReminderItem {
            status: FormStatus::Pending,
            reminder_count: 0,
            last_reminder_at: None,
            completed_at: None,
            ..item
        };
        let _gate = self.write_gate.read().await;
        let event = Event::FormItemCreated { item: item.clone() };
        self.wal_append(&event).await?;
        self.forms.insert(item.id, Arc::new(RwLock::new(item)));
        Ok(())
    }

    /// Completing an already completed item is a no-op.
    pub async fn complete_form_item(&self, id: Ulid, at: NaiveDateTime) -> Result<(), EngineError> {
        let _gate = self.write_gate.read().await;
        let item = self.form_entry(id).ok_or(EngineError::NotFound(id))?;
        let mut guard = item.write().await;
        if guard.status == FormStatus::Completed {
            return Ok(());
        }
        let event = Event::FormItemCompleted { id, at };
        self.wal_append(&event).await?;
        apply_to_form(&mut guard, &event);
        Ok(())
    }

    /// Flip every `pending` item whose `due_at` has passed to `overdue`.
    /// Returns the number of items that changed.
    pub async fn sweep_overdue(&self, now: NaiveDateTime) -> Result<usize, EngineError> {
        let _gate = self.write_gate.read().await;
        let mut items: Vec<_> = self.forms.iter().map(|e| (*e.key(), e.value().clone())).collect();
        items.sort_by_key(|(id, _)| *id);

        let mut candidates = Vec::new();
        for (_, item) in items {
            let guard = item.read().await;
            if guard.status == FormStatus::Pending && guard.due_at < now {
                drop(guard);
                candidates.push(item);
            }
        }
        // Re-check under the write lock; the item may have completed meanwhile.
        let mut guards = Vec::with_capacity(candidates.len());
        for item in candidates {
            let guard = item.write_owned().await;
            if guard.status == FormStatus::Pending && guard.due_at < now {
                guards.push(guard);
            }
        }
        if guards.is_empty() {
            return Ok(0);
        }
        let event = Event::FormItemsOverdue {
            ids: guards.iter().map(|g| g.id).collect(),
        };
        self.wal_append(&event).await?;
        for guard in &mut guards {
            apply_to_form(guard, &event);
        }
        Ok(guards.len())
    }

    /// Record a sent form reminder. Only applies if the item still has the
    /// `reminder_count` the caller evaluated, is open, and is under `max`.
    pub async fn record_form_reminder(
        &self,
        id: Ulid,
        seen_count: u32,
        max: u32,
        message: OutboundMessage,
    ) -> Result<bool, EngineError> {
        let _gate = self.write_gate.read().await;
        let item = self.form_entry(id).ok_or(EngineError::NotFound(id))?;
        let mut guard = item.write().await;
        if !guard.status.is_open() || guard.reminder_count != seen_count || guard.reminder_count >= max {
            return Ok(false);
        }
        let contact_id = guard.contact_id;
        let conv_arc = self.conversation_entry(contact_id);
        let mut conv = conv_arc.write().await;

        let event = Event::FormReminded {
            id,
            contact_id,
            message,
        };
        self.wal_append(&event).await?;
        apply_to_form(&mut guard, &event);
        apply_to_conversation(&mut conv, &event);
        Ok(true)
    }

    // ── WAL maintenance ──────────────────────────────────

    /// Rewrite the WAL with only the events needed to recreate current state.
    pub async fn compact_wal(&self) -> Result<(), EngineError> {
        let _gate = self.write_gate.write().await;
        let mut events = Vec::new();

        events.push(Event::SettingsUpdated {
            settings: *self.settings.read().await,
        });
        let mut windows: Vec<_> = self.windows.iter().map(|e| e.value().clone()).collect();
        windows.sort_by_key(|w| w.day_of_week);
        events.extend(windows.into_iter().map(|window| Event::AvailabilitySet { window }));
        events.extend(self.services.iter().map(|e| Event::ServiceDefined {
            service: e.value().clone(),
        }));
        events.extend(self.form_templates.iter().map(|e| Event::FormTemplateDefined {
            template: e.value().clone(),
        }));
        events.extend(self.contacts.iter().map(|e| Event::ContactUpserted {
            contact: e.value().clone(),
        }));

        let ledgers: Vec<_> = self.ledgers.iter().map(|e| e.value().clone()).collect();
        for ledger in ledgers {
            let guard = ledger.read().await;
            events.extend(guard.bookings.iter().map(|b| Event::BookingCreated { booking: b.clone() }));
        }

        let forms: Vec<_> = self.forms.iter().map(|e| e.value().clone()).collect();
        for item in forms {
            events.push(Event::FormItemCreated {
                item: item.read().await.clone(),
            });
        }

        let conversations: Vec<_> = self
            .conversations
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect();
        for (contact_id, conv) in conversations {
            let guard = conv.read().await;
            if !guard.paused && guard.messages.is_empty() {
                continue;
            }
            events.push(Event::ConversationRestored {
                contact_id,
                paused: guard.paused,
                last_message_at: guard.last_message_at,
                messages: guard.messages.iter().cloned().collect(),
            });
        }

        let count = events.len();
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Compact { events, response: tx })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))?;
        tracing::debug!(tenant = %self.tenant, events = count, "WAL compacted");
        Ok(())
    }

    pub async fn wal_appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self
            .wal_tx
            .send(WalCommand::AppendsSinceCompact { response: tx })
            .await
            .is_err()
        {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}
