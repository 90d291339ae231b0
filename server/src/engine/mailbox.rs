use thiserror::Error;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::events::Outbound;

/// Default queued outbound items per session (slow-client protection).
pub const DEFAULT_MAILBOX_CAPACITY: usize = 256;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DeliveryError {
    #[error("mailbox is full")]
    Full,
    #[error("mailbox is closed")]
    Closed,
    #[error("mailbox did not accept the item before the deadline")]
    TimedOut,
}

/// Producer side of a session's bounded outbound queue. Cloned into the hub
/// and into history loaders; closing it from any clone stops the consumer.
#[derive(Debug, Clone)]
pub struct Mailbox {
    tx: mpsc::Sender<Outbound>,
    closed: CancellationToken,
}

/// Consumer side, owned by the session's write pump.
#[derive(Debug)]
pub struct MailboxReceiver {
    rx: mpsc::Receiver<Outbound>,
    closed: CancellationToken,
}

/// Create a mailbox holding at most `capacity` undelivered items.
pub fn mailbox(capacity: usize) -> (Mailbox, MailboxReceiver) {
    let (tx, rx) = mpsc::channel(capacity);
    let closed = CancellationToken::new();
    (
        Mailbox {
            tx,
            closed: closed.clone(),
        },
        MailboxReceiver { rx, closed },
    )
}

impl Mailbox {
    /// Enqueue without waiting.
    pub fn try_deliver(&self, item: impl Into<Outbound>) -> Result<(), DeliveryError> {
        if self.closed.is_cancelled() {
            return Err(DeliveryError::Closed);
        }
        self.tx.try_send(item.into()).map_err(|e| match e {
            TrySendError::Full(_) => DeliveryError::Full,
            TrySendError::Closed(_) => DeliveryError::Closed,
        })
    }

    /// Enqueue, waiting for space until `deadline`.
    pub async fn deliver_until(
        &self,
        item: impl Into<Outbound>,
        deadline: Instant,
    ) -> Result<(), DeliveryError> {
        let item = item.into();
        tokio::select! {
            _ = self.closed.cancelled() => Err(DeliveryError::Closed),
            result = tokio::time::timeout_at(deadline, self.tx.send(item)) => match result {
                Ok(Ok(())) => Ok(()),
                Ok(Err(_)) => Err(DeliveryError::Closed),
                Err(_) => Err(DeliveryError::TimedOut),
            },
        }
    }

    /// Signal the consumer to stop. Idempotent.
    pub fn close(&self) {
        self.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled() || self.tx.is_closed()
    }

    pub fn capacity(&self) -> usize {
        self.tx.max_capacity()
    }
}

impl MailboxReceiver {
    /// Next queued item, or `None` once the mailbox has been closed.
    /// Items still queued at close time are discarded.
    pub async fn recv(&mut self) -> Option<Outbound> {
        tokio::select! {
            biased;
            _ = self.closed.cancelled() => None,
            item = self.rx.recv() => item,
        }
    }

    /// Take an already-queued item without waiting.
    pub fn try_recv(&mut self) -> Option<Outbound> {
        if self.closed.is_cancelled() {
            return None;
        }
        self.rx.try_recv().ok()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }
}
