use async_trait::async_trait;
use tokio::sync::broadcast;
use ulid::Ulid;

use crate::model::Channel;

const CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationKind {
    BookingReminder { booking_id: Ulid, contact_id: Ulid },
    FormReminder { item_id: Ulid, contact_id: Ulid },
}

impl NotificationKind {
    /// Action name used in ops log metadata.
    pub fn action(&self) -> &'static str {
        match self {
            NotificationKind::BookingReminder { .. } => "booking.reminder",
            NotificationKind::FormReminder { .. } => "form.reminder",
        }
    }

    pub fn contact_id(&self) -> Ulid {
        match self {
            NotificationKind::BookingReminder { contact_id, .. }
            | NotificationKind::FormReminder { contact_id, .. } => *contact_id,
        }
    }
}

/// One outbound reminder, ready to hand to a delivery channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub tenant: String,
    pub kind: NotificationKind,
    pub channel: Channel,
    /// Delivery address.
    pub target: String,
    pub subject: String,
    pub body: String,
}

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("no delivery worker is listening")]
    NoReceivers,
    #[error("delivery failed: {0}")]
    Failed(String),
}

/// Outbound delivery seam. Implementations must not retry internally; a
/// failed reminder stays eligible and is retried on the next cycle.
#[async_trait]
pub trait Dispatcher: Send + Sync {
    async fn send(&self, notification: &Notification) -> Result<(), DispatchError>;
}

/// In-process hub: fans notifications out to subscribed delivery workers.
/// Sending with no subscriber fails, so nothing is marked as sent.
pub struct BroadcastDispatcher {
    tx: broadcast::Sender<Notification>,
}

impl BroadcastDispatcher {
    pub fn new() -> Self {
        Self {
            tx: broadcast::channel(CHANNEL_CAPACITY).0,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.tx.subscribe()
    }
}

impl Default for BroadcastDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Dispatcher for BroadcastDispatcher {
    async fn send(&self, notification: &Notification) -> Result<(), DispatchError> {
        self.tx
            .send(notification.clone())
            .map(|_| ())
            .map_err(|_| DispatchError::NoReceivers)
    }
}

/// Delivery worker that records each notification in the process log.
/// Used when no external mail transport is wired in.
pub async fn log_deliveries(mut rx: broadcast::Receiver<Notification>) {
    loop {
        match rx.recv().await {
            Ok(n) => tracing::info!(
                tenant = %n.tenant,
                action = n.kind.action(),
                contact = %n.kind.contact_id(),
                channel = n.channel.as_str(),
                to = %n.target,
                subject = %n.subject,
                "notification delivered"
            ),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "delivery worker lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
