use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use thiserror::Error;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::events::{ChatMessage, ClientEvent, ControlEvent, MessageId, SessionId};
use super::hub::{ChannelSlot, Delivery, HubError, HubHandle, MemberHandle};
use super::mailbox::{self, DEFAULT_MAILBOX_CAPACITY, Mailbox, MailboxReceiver};
use super::store::{DEFAULT_HISTORY_LIMIT, MessageStore, StoreError};
use super::transport::{CLOSE_NORMAL, Frame, TransportError, is_expected_close};
use super::validation::{self, DEFAULT_MAX_MESSAGE_LENGTH, ProtocolError};

/// Tunables for a session's pumps.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub mailbox_capacity: usize,
    /// Messages replayed on join.
    pub history_limit: usize,
    pub history_timeout: Duration,
    pub save_timeout: Duration,
    pub write_timeout: Duration,
    /// Idle interval between liveness pings. Must stay below the peer's idle timeout.
    pub ping_interval: Duration,
    pub max_message_length: usize,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            mailbox_capacity: DEFAULT_MAILBOX_CAPACITY,
            history_limit: DEFAULT_HISTORY_LIMIT,
            history_timeout: Duration::from_secs(5),
            save_timeout: Duration::from_secs(5),
            write_timeout: Duration::from_secs(10),
            ping_interval: Duration::from_secs(54),
            max_message_length: DEFAULT_MAX_MESSAGE_LENGTH,
        }
    }
}

/// Who is on the other end of a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user_id: String,
    pub display_name: String,
}

impl Identity {
    pub fn new(user_id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            display_name: display_name.into(),
        }
    }

    /// Fallback identity for connections that present none.
    pub fn anonymous(connected_at: DateTime<Utc>) -> Self {
        let id = format!("anon-{}", connected_at.timestamp_millis());
        Self {
            user_id: id.clone(),
            display_name: id,
        }
    }
}

#[derive(Debug, Error)]
enum EventError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Hub(#[from] HubError),
}

/// One connected client: a read pump driving hub commands and a write pump
/// draining the mailbox to the transport.
pub struct ClientSession<S: MessageStore> {
    reader: ReadPump<S>,
    outbox: MailboxReceiver,
}

impl<S: MessageStore> ClientSession<S> {
    pub fn new(identity: Identity, hub: HubHandle, store: Arc<S>, settings: SessionSettings) -> Self {
        let (mailbox, outbox) = mailbox::mailbox(settings.mailbox_capacity);
        Self {
            reader: ReadPump {
                id: Uuid::new_v4(),
                identity,
                hub,
                store,
                settings,
                mailbox,
                channel: ChannelSlot::default(),
                shutdown: CancellationToken::new(),
                join_seq: 0,
                history: None,
            },
            outbox,
        }
    }

    pub fn id(&self) -> SessionId {
        self.reader.id
    }

    /// Run both pumps until the connection is done. The write pump gets its own
    /// task; the read pump runs on the caller's.
    pub async fn run<R, W>(self, reader: R, writer: W)
    where
        R: Stream<Item = Result<Frame, TransportError>> + Unpin + Send,
        W: Sink<Frame, Error = TransportError> + Unpin + Send + 'static,
    {
        let Self {
            reader: mut pump,
            outbox,
        } = self;

        info!(
            session_id = %pump.id,
            user_id = %pump.identity.user_id,
            nickname = %pump.identity.display_name,
            "session started"
        );

        let writer_task = tokio::spawn(write_pump(
            pump.id,
            writer,
            outbox,
            pump.settings.write_timeout,
            pump.settings.ping_interval,
            pump.shutdown.clone(),
        ));

        pump.run(reader).await;

        if let Err(e) = writer_task.await {
            error!(session_id = %pump.id, error = %e, "write pump panicked");
        }
        info!(session_id = %pump.id, "session ended");
    }
}

struct ReadPump<S: MessageStore> {
    id: SessionId,
    identity: Identity,
    hub: HubHandle,
    store: Arc<S>,
    settings: SessionSettings,
    mailbox: Mailbox,
    channel: ChannelSlot,
    /// Cancelled by whichever pump stops first.
    shutdown: CancellationToken,
    join_seq: u64,
    /// Cancels the history loader of the current join.
    history: Option<CancellationToken>,
}

impl<S: MessageStore> ReadPump<S> {
    async fn run<R>(&mut self, mut reader: R)
    where
        R: Stream<Item = Result<Frame, TransportError>> + Unpin,
    {
        loop {
            let frame = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                frame = reader.next() => frame,
            };

            match frame {
                None => {
                    debug!(session_id = %self.id, "transport stream ended");
                    break;
                }
                Some(Err(e)) => {
                    warn!(session_id = %self.id, error = %e, "error reading from transport");
                    break;
                }
                Some(Ok(Frame::Close(code))) => {
                    if is_expected_close(code) {
                        debug!(session_id = %self.id, ?code, "peer closed connection");
                    } else {
                        warn!(session_id = %self.id, ?code, "peer closed connection unexpectedly");
                    }
                    break;
                }
                Some(Ok(Frame::Text(text))) => match self.handle_frame(&text).await {
                    Ok(()) => {}
                    Err(EventError::Protocol(e)) => {
                        warn!(session_id = %self.id, error = %e, "ignoring invalid event");
                    }
                    Err(EventError::Store(e)) => {
                        warn!(session_id = %self.id, error = %e, "message not persisted, not broadcast");
                    }
                    Err(EventError::Hub(e)) => {
                        error!(session_id = %self.id, error = %e, "hub unavailable");
                        break;
                    }
                },
                Some(Ok(Frame::Ping(_) | Frame::Pong(_))) => {}
            }
        }

        self.cleanup().await;
    }

    async fn handle_frame(&mut self, text: &str) -> Result<(), EventError> {
        match ClientEvent::parse(text)? {
            ClientEvent::Join { channel } => self.join(channel).await,
            ClientEvent::Message { msg } => self.message(msg).await,
            ClientEvent::Leave { .. } => self.leave().await,
        }
    }

    async fn join(&mut self, channel: Option<String>) -> Result<(), EventError> {
        let channel = channel.ok_or(ProtocolError::MissingChannel)?;
        validation::validate_channel_name(&channel)?;

        self.cancel_history();
        // Re-joining the current channel keeps the membership.
        if let Some(previous) = self.channel.set(Some(channel.clone()))
            && previous != channel
        {
            self.hub.leave(self.id, previous).await?;
        }

        self.join_seq += 1;
        let join_seq = self.join_seq;
        self.hub
            .join(self.member(), channel.clone(), Delivery::AfterHistory { join_seq })
            .await?;

        self.acknowledge(ControlEvent::Joined {
            channel: channel.clone(),
            user: self.identity.display_name.clone(),
        });
        self.spawn_history_loader(channel, join_seq);
        Ok(())
    }

    async fn message(&mut self, text: Option<String>) -> Result<(), EventError> {
        let channel = self.channel.get().ok_or(ProtocolError::NotInChannel)?;
        let text = text.unwrap_or_default();
        validation::validate_message(&text, self.settings.max_message_length)?;

        let message = ChatMessage::new(&self.identity.display_name, &channel, text);

        // Nothing is fanned out until the store has it.
        let timeout = self.settings.save_timeout;
        tokio::time::timeout(timeout, self.store.save(&message))
            .await
            .map_err(|_| StoreError::Timeout(timeout))??;

        self.hub.broadcast(message).await?;
        Ok(())
    }

    async fn leave(&mut self) -> Result<(), EventError> {
        let channel = self.channel.set(None).ok_or(ProtocolError::NotInChannel)?;
        self.cancel_history();
        self.hub.leave(self.id, channel.clone()).await?;

        self.acknowledge(ControlEvent::Leave {
            channel,
            user: self.identity.display_name.clone(),
        });
        Ok(())
    }

    /// Terminal cleanup: runs exactly once, on every exit path.
    async fn cleanup(&mut self) {
        self.cancel_history();
        if let Some(channel) = self.channel.set(None)
            && let Err(e) = self.hub.leave(self.id, channel).await
        {
            debug!(session_id = %self.id, error = %e, "could not leave channel on disconnect");
        }
        self.shutdown.cancel();
        info!(session_id = %self.id, "read pump stopped");
    }

    fn member(&self) -> MemberHandle {
        MemberHandle {
            id: self.id,
            name: self.identity.display_name.clone(),
            mailbox: self.mailbox.clone(),
            channel: self.channel.clone(),
        }
    }

    fn acknowledge(&self, event: ControlEvent) {
        if let Err(e) = self.mailbox.try_deliver(event) {
            warn!(session_id = %self.id, error = %e, "dropping acknowledgement");
        }
    }

    fn cancel_history(&mut self) {
        if let Some(token) = self.history.take() {
            token.cancel();
        }
    }

    fn spawn_history_loader(&mut self, channel: String, join_seq: u64) {
        let cancel = CancellationToken::new();
        self.history = Some(cancel.clone());

        let session_id = self.id;
        let store = self.store.clone();
        let mailbox = self.mailbox.clone();
        let hub = self.hub.clone();
        let limit = self.settings.history_limit;
        let timeout = self.settings.history_timeout;

        tokio::spawn(async move {
            let delivered =
                load_history(session_id, store.as_ref(), &mailbox, &channel, limit, timeout, &cancel)
                    .await;
            debug!(%session_id, %channel, count = delivered.len(), "history delivered");
            if let Err(e) = hub
                .history_loaded(session_id, channel, join_seq, delivered)
                .await
            {
                debug!(%session_id, error = %e, "could not report history");
            }
        });
    }
}

/// Enqueue the channel's recent messages into the session's own mailbox.
/// Gives up (without retrying) once `timeout` has passed. Returns the ids that
/// were enqueued.
async fn load_history<S: MessageStore>(
    session_id: SessionId,
    store: &S,
    mailbox: &Mailbox,
    channel: &str,
    limit: usize,
    timeout: Duration,
    cancel: &CancellationToken,
) -> HashSet<MessageId> {
    let mut delivered = HashSet::new();
    if limit == 0 {
        return delivered;
    }
    let deadline = Instant::now() + timeout;

    let messages = tokio::select! {
        _ = cancel.cancelled() => return delivered,
        result = tokio::time::timeout_at(deadline, store.recent_by_channel(channel, limit)) => {
            match result {
                Ok(Ok(messages)) => messages,
                Ok(Err(e)) => {
                    warn!(%session_id, %channel, error = %e, "error loading history");
                    return delivered;
                }
                Err(_) => {
                    warn!(%session_id, %channel, "history lookup timed out");
                    return delivered;
                }
            }
        }
    };

    for message in messages {
        if cancel.is_cancelled() {
            break;
        }
        let id = message.id;
        if let Err(e) = mailbox.deliver_until(message, deadline).await {
            warn!(%session_id, %channel, error = %e, "history load aborted");
            break;
        }
        delivered.insert(id);
    }
    delivered
}

async fn send_frame<W>(writer: &mut W, frame: Frame, timeout: Duration) -> Result<(), TransportError>
where
    W: Sink<Frame, Error = TransportError> + Unpin,
{
    match tokio::time::timeout(timeout, writer.send(frame)).await {
        Ok(result) => result,
        Err(_) => Err(TransportError::WriteTimeout(timeout)),
    }
}

/// Sole writer of the transport. Stops on write failure, mailbox closure, or
/// when the read pump goes away, and closes the transport once on the way out.
async fn write_pump<W>(
    session_id: SessionId,
    mut writer: W,
    mut outbox: MailboxReceiver,
    write_timeout: Duration,
    ping_interval: Duration,
    shutdown: CancellationToken,
) where
    W: Sink<Frame, Error = TransportError> + Unpin,
{
    let mut ticker = tokio::time::interval_at(Instant::now() + ping_interval, ping_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let graceful = loop {
        tokio::select! {
            _ = shutdown.cancelled() => break true,
            item = outbox.recv() => {
                let Some(item) = item else {
                    debug!(%session_id, "mailbox closed");
                    break true;
                };
                let text = match item.to_json() {
                    Ok(text) => text,
                    Err(e) => {
                        error!(%session_id, error = %e, "failed to serialize outbound item");
                        continue;
                    }
                };
                if let Err(e) = send_frame(&mut writer, Frame::Text(text), write_timeout).await {
                    warn!(%session_id, error = %e, "error writing to transport");
                    break false;
                }
                ticker.reset();
            }
            _ = ticker.tick() => {
                if let Err(e) = send_frame(&mut writer, Frame::Ping(Vec::new()), write_timeout).await {
                    warn!(%session_id, error = %e, "error sending ping");
                    break false;
                }
            }
        }
    };

    if graceful
        && let Err(e) = send_frame(&mut writer, Frame::Close(Some(CLOSE_NORMAL)), write_timeout).await
    {
        debug!(%session_id, error = %e, "could not send close frame");
    }
    match tokio::time::timeout(write_timeout, writer.close()).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => debug!(%session_id, error = %e, "error closing transport"),
        Err(_) => debug!(%session_id, "timed out closing transport"),
    }

    shutdown.cancel();
    info!(%session_id, "write pump stopped");
}
