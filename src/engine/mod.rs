mod conflict;
mod error;
mod mutations;
mod queries;
mod slots;

pub use conflict::{conflicts_with_ledger, find_conflict, overlaps};
pub use error::EngineError;
pub use slots::compute_slots;

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::NaiveDate;
use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, RwLock};
use ulid::Ulid;

use crate::model::*;
use crate::wal::Wal;

pub type SharedDayLedger = Arc<RwLock<DayLedger>>;
pub type SharedFormItem = Arc<RwLock<PendingReminderItem>>;
pub type SharedConversation = Arc<RwLock<Conversation>>;

// ── Group-commit WAL channel ─────────────────────────────

pub(super) enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        events: Vec<Event>,
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

/// Background task that owns the WAL and batches appends for group commit.
/// 1. Block until the first Append arrives.
/// 2. Buffer it (no fsync).
/// 3. Drain all immediately available Appends (the batch window).
/// 4. Single flush_sync for the whole batch.
/// 5. Respond to all senders with the shared result.
async fn wal_writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { event, response } => {
                let mut batch = vec![(event, response)];
                let mut pending = None;

                loop {
                    match rx.try_recv() {
                        Ok(WalCommand::Append { event, response }) => {
                            batch.push((event, response));
                        }
                        Ok(other) => {
                            pending = Some(other);
                            break;
                        }
                        Err(_) => break,
                    }
                }

                commit_batch(&mut wal, &mut batch);
                if let Some(other) = pending {
                    handle_non_append(&mut wal, other);
                }
            }
            other => handle_non_append(&mut wal, other),
        }
    }
}

fn commit_batch(wal: &mut Wal, batch: &mut Vec<(Event, oneshot::Sender<io::Result<()>>)>) {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();
    let result = flush_batch(wal, batch);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());
    if let Err(e) = &result {
        tracing::error!(error = %e, batch = batch.len(), "WAL flush failed");
    }
    for (_, tx) in batch.drain(..) {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

fn flush_batch(wal: &mut Wal, batch: &[(Event, oneshot::Sender<io::Result<()>>)]) -> io::Result<()> {
    let mut append_err: Option<io::Error> = None;
    for (event, _) in batch {
        if let Err(e) = wal.append_buffered(event) {
            append_err = Some(e);
            break;
        }
    }
    // Flush even after an append error so partial bytes do not leak into the next batch.
    let flush_err = wal.flush_sync().err();
    match (append_err, flush_err) {
        (Some(e), _) | (None, Some(e)) => Err(e),
        (None, None) => Ok(()),
    }
}

fn handle_non_append(wal: &mut Wal, cmd: WalCommand) {
    match cmd {
        WalCommand::Compact { events, response } => {
            let result = Wal::write_compact_file(wal.path(), &events)
                .and_then(|()| wal.swap_compact_file());
            let _ = response.send(result);
        }
        WalCommand::AppendsSinceCompact { response } => {
            let _ = response.send(wal.appends_since_compact());
        }
        WalCommand::Append { event, response } => {
            let mut batch = vec![(event, response)];
            commit_batch(wal, &mut batch);
        }
    }
}

/// One tenant's scheduling state. Every mutation is appended to the WAL
/// before it becomes visible in memory.
///
/// Lock order when more than one is held: day ledgers (ascending date),
/// then the form item, then the conversation.
pub struct Engine {
    pub tenant: String,
    pub(super) wal_tx: mpsc::Sender<WalCommand>,
    pub(super) settings: RwLock<TenantSettings>,
    pub(super) windows: DashMap<u8, AvailabilityWindow>,
    pub(super) services: DashMap<Ulid, ServiceDefinition>,
    pub(super) form_templates: DashMap<Ulid, FormTemplate>,
    pub(super) contacts: DashMap<Ulid, Contact>,
    pub(super) conversations: DashMap<Ulid, SharedConversation>,
    pub(super) ledgers: DashMap<NaiveDate, SharedDayLedger>,
    /// Reverse lookup: booking id → date of the ledger holding it.
    pub(super) booking_dates: DashMap<Ulid, NaiveDate>,
    pub(super) forms: DashMap<Ulid, SharedFormItem>,
    /// Mutations hold it shared; compaction holds it exclusively so no event
    /// lands between the snapshot and the file swap.
    pub(super) write_gate: RwLock<()>,
}

// ── In-memory appliers (caller holds the lock) ───────────

pub(super) fn apply_to_ledger(ledger: &mut DayLedger, event: &Event) {
    match event {
        Event::BookingCreated { booking } => ledger.insert(booking.clone()),
        Event::BookingStatusChanged { id, status, .. } => {
            if let Some(b) = ledger.get_mut(*id) {
                b.status = *status;
            }
        }
        Event::BookingReminded { id, .. } => {
            if let Some(b) = ledger.get_mut(*id) {
                b.reminder_sent = true;
            }
        }
        _ => {}
    }
}

/// Move a booking to a new interval, possibly on another day. A moved
/// booking gets a fresh reminder.
pub(super) fn apply_reschedule(
    source: &mut DayLedger,
    target: Option<&mut DayLedger>,
    id: Ulid,
    date: NaiveDate,
    span: Span,
) {
    let Some(mut booking) = source.remove(id) else {
        return;
    };
    booking.date = date;
    booking.span = span;
    booking.reminder_sent = false;
    match target {
        Some(t) => t.insert(booking),
        None => source.insert(booking),
    }
}

pub(super) fn apply_to_form(item: &mut PendingReminderItem, event: &Event) {
    match event {
        Event::FormItemsOverdue { .. } => {
            if item.status == FormStatus::Pending {
                item.status = FormStatus::Overdue;
            }
        }
        Event::FormReminded { message, .. } => {
            item.reminder_count += 1;
            item.last_reminder_at = Some(message.at);
        }
        Event::FormItemCompleted { at, .. } => {
            item.status = FormStatus::Completed;
            item.completed_at = Some(*at);
        }
        _ => {}
    }
}

pub(super) fn apply_to_conversation(conv: &mut Conversation, event: &Event) {
    match event {
        Event::PauseSet { paused, .. } => conv.paused = *paused,
        Event::BookingReminded { message, .. } | Event::FormReminded { message, .. } => {
            conv.record_outbound(message.clone());
        }
        Event::ConversationRestored {
            paused,
            last_message_at,
            messages,
            ..
        } => {
            conv.paused = *paused;
            conv.messages = messages.iter().cloned().collect();
            conv.last_message_at = *last_message_at;
        }
        _ => {}
    }
}

impl Engine {
    pub fn new(tenant: impl Into<String>, wal_path: PathBuf) -> io::Result<Self> {
        let events = Wal::recover(&wal_path)?;
        let wal = Wal::open(&wal_path)?;
        let (wal_tx, wal_rx) = mpsc::channel(4096);
        tokio::spawn(wal_writer_loop(wal, wal_rx));

        let engine = Self {
            tenant: tenant.into(),
            wal_tx,
            settings: RwLock::new(TenantSettings::default()),
            windows: DashMap::new(),
            services: DashMap::new(),
            form_templates: DashMap::new(),
            contacts: DashMap::new(),
            conversations: DashMap::new(),
            ledgers: DashMap::new(),
            booking_dates: DashMap::new(),
            forms: DashMap::new(),
            write_gate: RwLock::new(()),
        };

        for event in &events {
            engine.replay_event(event);
        }
        if !events.is_empty() {
            tracing::info!(tenant = %engine.tenant, events = events.len(), "replayed WAL");
        }

        Ok(engine)
    }

    /// Replay runs before the engine is shared, so every try_write succeeds.
    /// Never use blocking_write here: this may run inside an async context
    /// (lazy tenant creation).
    fn replay_event(&self, event: &Event) {
        match event {
            Event::SettingsUpdated { settings } => {
                if let Ok(mut guard) = self.settings.try_write() {
                    *guard = *settings;
                }
            }
            Event::AvailabilitySet { window } => {
                self.windows.insert(window.day_of_week, window.clone());
            }
            Event::ServiceDefined { service } => {
                self.services.insert(service.id, service.clone());
            }
            Event::FormTemplateDefined { template } => {
                self.form_templates.insert(template.id, template.clone());
            }
            Event::ContactUpserted { contact } => {
                self.contacts.insert(contact.id, contact.clone());
            }
            Event::PauseSet { contact_id, .. } | Event::ConversationRestored { contact_id, .. } => {
                self.replay_conversation(*contact_id, event);
            }
            Event::BookingCreated { booking } => {
                self.booking_dates.insert(booking.id, booking.date);
                self.replay_ledger(booking.date, event);
            }
            Event::BookingStatusChanged { date, .. } => self.replay_ledger(*date, event),
            Event::BookingReminded { date, contact_id, .. } => {
                self.replay_ledger(*date, event);
                self.replay_conversation(*contact_id, event);
            }
            Event::BookingRescheduled { id, from, date, span } => {
                let source_arc = self.ledger_entry(*from);
                let Ok(mut source) = source_arc.try_write() else {
                    return;
                };
                if from == date {
                    apply_reschedule(&mut source, None, *id, *date, *span);
                } else {
                    let target_arc = self.ledger_entry(*date);
                    let Ok(mut target) = target_arc.try_write() else {
                        return;
                    };
                    apply_reschedule(&mut source, Some(&mut target), *id, *date, *span);
                }
                self.booking_dates.insert(*id, *date);
            }
            Event::FormItemCreated { item } => {
                self.forms.insert(item.id, Arc::new(RwLock::new(item.clone())));
            }
            Event::FormItemsOverdue { ids } => {
                for id in ids {
                    self.replay_form(*id, event);
                }
            }
            Event::FormReminded { id, contact_id, .. } => {
                self.replay_form(*id, event);
                self.replay_conversation(*contact_id, event);
            }
            Event::FormItemCompleted { id, .. } => self.replay_form(*id, event),
        }
    }

    fn replay_ledger(&self, date: NaiveDate, event: &Event) {
        let ledger = self.ledger_entry(date);
        if let Ok(mut guard) = ledger.try_write() {
            apply_to_ledger(&mut guard, event);
        }
    }

    fn replay_form(&self, id: Ulid, event: &Event) {
        if let Some(item) = self.form_entry(id)
            && let Ok(mut guard) = item.try_write()
        {
            apply_to_form(&mut guard, event);
        }
    }

    fn replay_conversation(&self, contact_id: Ulid, event: &Event) {
        let conv = self.conversation_entry(contact_id);
        if let Ok(mut guard) = conv.try_write() {
            apply_to_conversation(&mut guard, event);
        }
    }

    /// Write event to WAL via the background group-commit writer.
    pub(super) async fn wal_append(&self, event: &Event) -> Result<(), EngineError> {
        let (tx, rx) = oneshot::channel();
        self.wal_tx
            .send(WalCommand::Append {
                event: event.clone(),
                response: tx,
            })
            .await
            .map_err(|_| EngineError::WalError("WAL writer shut down".into()))?;
        rx.await
            .map_err(|_| EngineError::WalError("WAL writer dropped response".into()))?
            .map_err(|e| EngineError::WalError(e.to_string()))
    }

    /// Ledger for `date`, created empty on first use.
    pub(super) fn ledger_entry(&self, date: NaiveDate) -> SharedDayLedger {
        self.ledgers
            .entry(date)
            .or_insert_with(|| Arc::new(RwLock::new(DayLedger::new(date))))
            .clone()
    }

    pub(super) fn existing_ledger(&self, date: NaiveDate) -> Option<SharedDayLedger> {
        self.ledgers.get(&date).map(|e| e.value().clone())
    }

    /// Conversation for a contact, created on first use.
    pub(super) fn conversation_entry(&self, contact_id: Ulid) -> SharedConversation {
        self.conversations
            .entry(contact_id)
            .or_default()
            .clone()
    }

    pub(super) fn form_entry(&self, id: Ulid) -> Option<SharedFormItem> {
        self.forms.get(&id).map(|e| e.value().clone())
    }

    pub(super) fn booking_date(&self, id: Ulid) -> Result<NaiveDate, EngineError> {
        self.booking_dates
            .get(&id)
            .map(|e| *e.value())
            .ok_or(EngineError::NotFound(id))
    }
}
