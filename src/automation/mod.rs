//! The reminder cycle: one pass over every tenant that sweeps overdue forms
//! and sends due booking and form reminders.
//!
//! Per item the order is dispatch, then the conditional mark. Passes over
//! the same tenant never overlap. A failed dispatch leaves the item
//! untouched so the next cycle retries it. A failure in one tenant never
//! stops the others.


use std::sync::Arc;
use std::time::Instant;

use chrono::NaiveDateTime;
use dashmap::DashMap;
use serde_json::json;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::engine::Engine;
use crate::model::*;
use crate::notify::{DispatchError, Dispatcher, Notification, NotificationKind};
use crate::observability;
use crate::opslog::{OpsLevel, OpsLogEntry, OpsLogger, OpsSource};
use crate::reminder::{DueBookingReminder, DueFormReminder};
use crate::tenant::TenantManager;

/// Outcome counters for one cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub tenants: usize,
    /// Form items moved from pending to overdue.
    pub swept: usize,
    pub booking_reminders: usize,
    pub form_reminders: usize,
    /// Dispatch failures; the items stay eligible.
    pub failures: usize,
    /// Store errors (sweep or mark) logged and skipped.
    pub tenant_errors: usize,
}

/// Current time on the local wall clock, matching how bookings are stored.
pub fn local_now() -> NaiveDateTime {
    chrono::Local::now().naive_local()
}

pub struct AutomationCycle {
    tenants: Arc<TenantManager>,
    dispatcher: Arc<dyn Dispatcher>,
    ops_log: Arc<dyn OpsLogger>,
    /// Held for a tenant's whole pass, so overlapping runs never evaluate
    /// the same item before the other has marked it.
    tenant_locks: DashMap<String, Arc<Mutex<()>>>,
}

impl AutomationCycle {
    pub fn new(
        tenants: Arc<TenantManager>,
        dispatcher: Arc<dyn Dispatcher>,
        ops_log: Arc<dyn OpsLogger>,
    ) -> Self {
        Self {
            tenants,
            dispatcher,
            ops_log,
            tenant_locks: DashMap::new(),
        }
    }

    pub async fn run(&self) -> CycleReport {
        self.run_at(local_now()).await
    }

    /// One full pass with an explicit `now`.
    pub async fn run_at(&self, now: NaiveDateTime) -> CycleReport {
        let started = Instant::now();
        let mut report = CycleReport::default();

        for (name, engine) in self.tenants.tenants() {
            report.tenants += 1;
            let lock = self.tenant_locks.entry(name.clone()).or_default().clone();
            let _pass = lock.lock().await;
            self.run_tenant(&name, &engine, now, &mut report).await;
        }

        metrics::counter!(observability::AUTOMATION_CYCLES_TOTAL).increment(1);
        metrics::histogram!(observability::AUTOMATION_CYCLE_DURATION_SECONDS)
            .record(started.elapsed().as_secs_f64());
        if report.booking_reminders + report.form_reminders + report.failures + report.tenant_errors > 0 {
            info!(
                tenants = report.tenants,
                swept = report.swept,
                booking_reminders = report.booking_reminders,
                form_reminders = report.form_reminders,
                failures = report.failures,
                tenant_errors = report.tenant_errors,
                "automation cycle finished"
            );
        } else {
            debug!(tenants = report.tenants, swept = report.swept, "automation cycle finished");
        }
        report
    }

    async fn run_tenant(&self, tenant: &str, engine: &Engine, now: NaiveDateTime, report: &mut CycleReport) {
        // The sweep is independent of whether the tenant can send.
        match engine.sweep_overdue(now).await {
            Ok(n) => report.swept += n,
            Err(e) => {
                report.tenant_errors += 1;
                error!(tenant, error = %e, "overdue sweep failed");
            }
        }

        let settings = engine.settings().await;
        if !settings.active || !settings.email_channel {
            debug!(tenant, active = settings.active, email = settings.email_channel, "tenant cannot send reminders");
            return;
        }
        let config = settings.automation.with_defaults();

        for due in engine.due_booking_reminders(now, &config).await {
            self.send_booking_reminder(tenant, engine, now, due, report).await;
        }
        for due in engine.due_form_reminders(now, &config).await {
            self.send_form_reminder(tenant, engine, now, due, report).await;
        }
    }

    async fn send_booking_reminder(
        &self,
        tenant: &str,
        engine: &Engine,
        now: NaiveDateTime,
        due: DueBookingReminder,
        report: &mut CycleReport,
    ) {
        let booking = &due.booking;
        let service = engine
            .service(booking.service_id)
            .map(|s| s.name)
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| "appointment".to_string());
        let when = format!("{} at {}", booking.date.format("%Y-%m-%d"), booking.span.start_time());
        let notification = Notification {
            tenant: tenant.to_string(),
            kind: NotificationKind::BookingReminder {
                booking_id: booking.id,
                contact_id: due.contact.id,
            },
            channel: Channel::Email,
            target: due.target.clone(),
            subject: format!("Reminder: {service} on {when}"),
            body: format!(
                "Hi {}, this is a reminder of your {service} on {when}.",
                due.contact.name.as_deref().unwrap_or("there")
            ),
        };
        if let Err(e) = self.dispatcher.send(&notification).await {
            self.dispatch_failed(tenant, &notification, e, report).await;
            return;
        }

        let message = OutboundMessage {
            at: now,
            channel: Channel::Email,
            content: format!("Booking reminder sent for {service} on {when}."),
        };
        match engine.mark_booking_reminded(booking, message).await {
            Ok(true) => {
                report.booking_reminders += 1;
                metrics::counter!(observability::REMINDERS_SENT_TOTAL, "kind" => "booking").increment(1);
                self.ops(OpsLogEntry {
                    tenant: tenant.to_string(),
                    level: OpsLevel::Info,
                    source: OpsSource::Automation,
                    message: "Booking reminder sent".into(),
                    meta: json!({
                        "bookingId": booking.id.to_string(),
                        "contactId": due.contact.id.to_string(),
                        "channel": Channel::Email.as_str(),
                    }),
                })
                .await;
            }
            Ok(false) => {
                debug!(tenant, booking = %booking.id, "booking changed before the reminder was recorded");
                self.not_recorded(tenant, &notification, "booking changed while the reminder was sent")
                    .await;
            }
            Err(e) => {
                report.tenant_errors += 1;
                error!(tenant, booking = %booking.id, error = %e, "failed to record booking reminder");
                self.not_recorded(tenant, &notification, &e.to_string()).await;
            }
        }
    }

    async fn send_form_reminder(
        &self,
        tenant: &str,
        engine: &Engine,
        now: NaiveDateTime,
        due: DueFormReminder,
        report: &mut CycleReport,
    ) {
        let item = &due.item;
        let form = item
            .template_id
            .and_then(|id| engine.form_template(id))
            .map(|t| t.name)
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| "form".to_string());
        let notification = Notification {
            tenant: tenant.to_string(),
            kind: NotificationKind::FormReminder {
                item_id: item.id,
                contact_id: due.contact.id,
            },
            channel: Channel::Email,
            target: due.target.clone(),
            subject: format!("Reminder: complete your {form}"),
            body: format!(
                "Hi {}, please complete your pending {form} (reference {}).",
                due.contact.name.as_deref().unwrap_or("there"),
                item.id
            ),
        };
        if let Err(e) = self.dispatcher.send(&notification).await {
            self.dispatch_failed(tenant, &notification, e, report).await;
            return;
        }

        let message = OutboundMessage {
            at: now,
            channel: Channel::Email,
            content: format!("Form reminder sent for {form}."),
        };
        match engine
            .record_form_reminder(item.id, item.reminder_count, due.max_reminders, message)
            .await
        {
            Ok(true) => {
                report.form_reminders += 1;
                metrics::counter!(observability::REMINDERS_SENT_TOTAL, "kind" => "form").increment(1);
                self.ops(OpsLogEntry {
                    tenant: tenant.to_string(),
                    level: OpsLevel::Info,
                    source: OpsSource::Automation,
                    message: "Form reminder sent".into(),
                    meta: json!({
                        "formSubmissionId": item.id.to_string(),
                        "contactId": due.contact.id.to_string(),
                        "channel": Channel::Email.as_str(),
                    }),
                })
                .await;
            }
            Ok(false) => {
                debug!(tenant, form = %item.id, "form changed before the reminder was recorded");
                self.not_recorded(tenant, &notification, "form changed while the reminder was sent")
                    .await;
            }
            Err(e) => {
                report.tenant_errors += 1;
                error!(tenant, form = %item.id, error = %e, "failed to record form reminder");
                self.not_recorded(tenant, &notification, &e.to_string()).await;
            }
        }
    }

    async fn dispatch_failed(
        &self,
        tenant: &str,
        notification: &Notification,
        err: DispatchError,
        report: &mut CycleReport,
    ) {
        report.failures += 1;
        let action = notification.kind.action();
        let channel = notification.channel.as_str();
        metrics::counter!(observability::DISPATCH_FAILURES_TOTAL, "action" => action).increment(1);
        warn!(tenant, action, error = %err, "reminder dispatch failed");
        self.ops(OpsLogEntry {
            tenant: tenant.to_string(),
            level: OpsLevel::Error,
            source: OpsSource::Integration,
            message: format!("Failed to send {channel} for {action}"),
            meta: json!({
                "channel": channel,
                "action": action,
                "contactId": notification.kind.contact_id().to_string(),
                "error": err.to_string(),
            }),
        })
        .await;
    }

    /// The reminder went out but the item was not marked.
    async fn not_recorded(&self, tenant: &str, notification: &Notification, reason: &str) {
        let action = notification.kind.action();
        self.ops(OpsLogEntry {
            tenant: tenant.to_string(),
            level: OpsLevel::Warn,
            source: OpsSource::Automation,
            message: format!("Reminder sent but not recorded for {action}"),
            meta: json!({
                "action": action,
                "contactId": notification.kind.contact_id().to_string(),
                "reason": reason,
            }),
        })
        .await;
    }

    /// Ops log failures are reported but never abort the cycle.
    async fn ops(&self, entry: OpsLogEntry) {
        let tenant = entry.tenant.clone();
        if let Err(e) = self.ops_log.log(entry).await {
            warn!(tenant = %tenant, error = %e, "ops log write failed");
        }
    }
}
