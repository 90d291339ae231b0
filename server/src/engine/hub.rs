use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};

use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::events::{ChatMessage, ControlEvent, MessageId, Outbound, SessionId};
use super::mailbox::Mailbox;

/// Default depth of the hub's inbound command queue.
pub const DEFAULT_COMMAND_QUEUE_CAPACITY: usize = 1024;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum HubError {
    #[error("hub is no longer running")]
    Stopped,
}

/// A session's current channel. Written by the session when it switches and by
/// the hub when membership actually changes.
#[derive(Debug, Clone, Default)]
pub struct ChannelSlot(Arc<Mutex<Option<String>>>);

impl ChannelSlot {
    pub fn get(&self) -> Option<String> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Replace the current channel, returning the previous one.
    pub fn set(&self, channel: Option<String>) -> Option<String> {
        let mut slot = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        std::mem::replace(&mut *slot, channel)
    }

    /// Clear the slot only if it still names `channel`; a session that has
    /// already moved on keeps its newer value.
    fn clear_if(&self, channel: &str) {
        let mut slot = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.as_deref() == Some(channel) {
            *slot = None;
        }
    }
}

/// What the hub needs to reach a session.
#[derive(Debug, Clone)]
pub struct MemberHandle {
    pub id: SessionId,
    pub name: String,
    pub mailbox: Mailbox,
    pub channel: ChannelSlot,
}

/// How fan-out reaches a freshly joined member.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Deliver straight to the mailbox.
    Live,
    /// Buffer fan-out until the history loader for this join reports in.
    AfterHistory { join_seq: u64 },
}

#[derive(Debug)]
enum HubCommand {
    Join {
        member: MemberHandle,
        channel: String,
        delivery: Delivery,
    },
    Leave {
        session_id: SessionId,
        channel: String,
    },
    Broadcast {
        message: ChatMessage,
    },
    HistoryLoaded {
        session_id: SessionId,
        channel: String,
        join_seq: u64,
        delivered: HashSet<MessageId>,
    },
    ListChannels {
        reply: oneshot::Sender<Vec<String>>,
    },
    ListMembers {
        channel: String,
        reply: oneshot::Sender<Option<Vec<String>>>,
    },
    Shutdown,
}

/// Cheap, cloneable submitter of hub commands. Every operation is queued and
/// processed in arrival order by the single hub task.
#[derive(Debug, Clone)]
pub struct HubHandle {
    commands: mpsc::Sender<HubCommand>,
}

impl HubHandle {
    async fn submit(&self, command: HubCommand) -> Result<(), HubError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| HubError::Stopped)
    }

    /// Join `channel`, implicitly leaving any other channel first.
    pub async fn join(
        &self,
        member: MemberHandle,
        channel: impl Into<String>,
        delivery: Delivery,
    ) -> Result<(), HubError> {
        self.submit(HubCommand::Join {
            member,
            channel: channel.into(),
            delivery,
        })
        .await
    }

    /// Leave `channel`. A no-op if the session is not a member.
    pub async fn leave(
        &self,
        session_id: SessionId,
        channel: impl Into<String>,
    ) -> Result<(), HubError> {
        self.submit(HubCommand::Leave {
            session_id,
            channel: channel.into(),
        })
        .await
    }

    /// Fan a persisted message out to every member of its channel.
    pub async fn broadcast(&self, message: ChatMessage) -> Result<(), HubError> {
        self.submit(HubCommand::Broadcast { message }).await
    }

    /// Report that history for join `join_seq` has been enqueued (or given up
    /// on). `delivered` holds the ids that reached the mailbox.
    pub async fn history_loaded(
        &self,
        session_id: SessionId,
        channel: impl Into<String>,
        join_seq: u64,
        delivered: HashSet<MessageId>,
    ) -> Result<(), HubError> {
        self.submit(HubCommand::HistoryLoaded {
            session_id,
            channel: channel.into(),
            join_seq,
            delivered,
        })
        .await
    }

    /// Names of all channels with at least one member, sorted.
    pub async fn list_channels(&self) -> Result<Vec<String>, HubError> {
        let (reply, rx) = oneshot::channel();
        self.submit(HubCommand::ListChannels { reply }).await?;
        rx.await.map_err(|_| HubError::Stopped)
    }

    /// Display names of a channel's members, sorted. `None` if the channel does not exist.
    pub async fn list_members(
        &self,
        channel: impl Into<String>,
    ) -> Result<Option<Vec<String>>, HubError> {
        let (reply, rx) = oneshot::channel();
        self.submit(HubCommand::ListMembers {
            channel: channel.into(),
            reply,
        })
        .await?;
        rx.await.map_err(|_| HubError::Stopped)
    }

    /// Stop the hub: every member's mailbox is closed and later commands
    /// fail with [`HubError::Stopped`].
    pub async fn shutdown(&self) -> Result<(), HubError> {
        self.submit(HubCommand::Shutdown).await
    }
}

struct Member {
    handle: MemberHandle,
    join_seq: Option<u64>,
    /// Fan-out held back while history is still loading.
    backlog: Option<Vec<Outbound>>,
}

impl Member {
    /// Deliver or buffer one item. Returns false if the member cannot keep up.
    fn offer(&mut self, item: &Outbound) -> bool {
        match &mut self.backlog {
            Some(backlog) => {
                if self.handle.mailbox.is_closed()
                    || backlog.len() >= self.handle.mailbox.capacity()
                {
                    return false;
                }
                backlog.push(item.clone());
                true
            }
            None => match self.handle.mailbox.try_deliver(item.clone()) {
                Ok(()) => true,
                Err(e) => {
                    debug!(session_id = %self.handle.id, error = %e, "delivery failed");
                    false
                }
            },
        }
    }
}

/// The channel registry. Owned by exactly one task; all access goes through
/// a [`HubHandle`].
pub struct Hub {
    commands: mpsc::Receiver<HubCommand>,
    /// Channel name -> members. A channel exists only while it has members.
    channels: HashMap<String, HashMap<SessionId, Member>>,
    /// Reverse lookup: session -> the one channel it is in.
    locations: HashMap<SessionId, String>,
}

impl Hub {
    /// Start the hub loop. It runs until shut down or until every handle has
    /// been dropped.
    pub fn spawn(queue_capacity: usize) -> (HubHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(queue_capacity);
        let hub = Hub {
            commands: rx,
            channels: HashMap::new(),
            locations: HashMap::new(),
        };
        (HubHandle { commands: tx }, tokio::spawn(hub.run()))
    }

    async fn run(mut self) {
        info!("hub started");
        while let Some(command) = self.commands.recv().await {
            if matches!(command, HubCommand::Shutdown) {
                break;
            }
            self.handle(command);
        }
        self.close_all();
        info!("hub stopped");
    }

    fn handle(&mut self, command: HubCommand) {
        match command {
            HubCommand::Join {
                member,
                channel,
                delivery,
            } => self.join(member, channel, delivery),
            HubCommand::Leave {
                session_id,
                channel,
            } => self.leave(session_id, &channel),
            HubCommand::Broadcast { message } => self.broadcast(message),
            HubCommand::HistoryLoaded {
                session_id,
                channel,
                join_seq,
                delivered,
            } => self.history_loaded(session_id, &channel, join_seq, &delivered),
            HubCommand::ListChannels { reply } => {
                let mut names: Vec<String> = self.channels.keys().cloned().collect();
                names.sort();
                let _ = reply.send(names);
            }
            HubCommand::ListMembers { channel, reply } => {
                let members = self.channels.get(&channel).map(|members| {
                    let mut names: Vec<String> =
                        members.values().map(|m| m.handle.name.clone()).collect();
                    names.sort();
                    names
                });
                let _ = reply.send(members);
            }
            HubCommand::Shutdown => {}
        }
    }

    fn join(&mut self, member: MemberHandle, channel: String, delivery: Delivery) {
        let session_id = member.id;

        if let Some(previous) = self.locations.get(&session_id).cloned()
            && previous != channel
        {
            self.leave(session_id, &previous);
        }

        let rejoin = self
            .channels
            .get(&channel)
            .is_some_and(|members| members.contains_key(&session_id));
        if !rejoin {
            let notice: Outbound = ControlEvent::user_joined(&channel, &member.name).into();
            self.fan_out(&channel, &notice, Some(session_id));
        }

        let (join_seq, backlog) = match delivery {
            Delivery::Live => (None, None),
            Delivery::AfterHistory { join_seq } => (Some(join_seq), Some(Vec::new())),
        };

        member.channel.set(Some(channel.clone()));
        info!(%session_id, nickname = %member.name, %channel, "joined channel");

        self.channels.entry(channel.clone()).or_default().insert(
            session_id,
            Member {
                handle: member,
                join_seq,
                backlog,
            },
        );
        self.locations.insert(session_id, channel);
    }

    fn leave(&mut self, session_id: SessionId, channel: &str) {
        let Some(member) = self.remove_member(channel, session_id) else {
            debug!(%session_id, %channel, "leave ignored, not a member");
            return;
        };

        member.handle.channel.clear_if(channel);
        info!(%session_id, nickname = %member.handle.name, %channel, "left channel");

        let notice: Outbound = ControlEvent::user_left(channel, &member.handle.name).into();
        self.fan_out(channel, &notice, None);
    }

    fn broadcast(&mut self, message: ChatMessage) {
        if !self.channels.contains_key(&message.channel) {
            warn!(channel = %message.channel, id = %message.id, "dropping broadcast to unknown channel");
            return;
        }
        let channel = message.channel.clone();
        self.fan_out(&channel, &Outbound::Chat(message), None);
    }

    fn history_loaded(
        &mut self,
        session_id: SessionId,
        channel: &str,
        join_seq: u64,
        delivered: &HashSet<MessageId>,
    ) {
        let Some(member) = self
            .channels
            .get_mut(channel)
            .and_then(|members| members.get_mut(&session_id))
        else {
            debug!(%session_id, %channel, "history report for departed member");
            return;
        };
        if member.join_seq != Some(join_seq) {
            debug!(%session_id, %channel, join_seq, "stale history report");
            return;
        }
        let Some(backlog) = member.backlog.take() else {
            return;
        };

        let mut keeping_up = true;
        for item in backlog {
            if item.message_id().is_some_and(|id| delivered.contains(&id)) {
                continue;
            }
            if member.handle.mailbox.try_deliver(item).is_err() {
                keeping_up = false;
                break;
            }
        }

        if !keeping_up {
            self.evict(channel, session_id);
        }
    }

    /// Deliver `item` to every member of `channel` except `exclude`. Members whose
    /// mailbox cannot take it are evicted as part of the same delivery.
    fn fan_out(&mut self, channel: &str, item: &Outbound, exclude: Option<SessionId>) {
        let Some(members) = self.channels.get_mut(channel) else {
            return;
        };

        let mut dead = Vec::new();
        for (id, member) in members.iter_mut() {
            if Some(*id) == exclude {
                continue;
            }
            if !member.offer(item) {
                dead.push(*id);
            }
        }

        for id in dead {
            self.evict(channel, id);
        }
    }

    fn evict(&mut self, channel: &str, session_id: SessionId) {
        let Some(member) = self.remove_member(channel, session_id) else {
            return;
        };
        member.handle.channel.clear_if(channel);
        member.handle.mailbox.close();
        warn!(%session_id, nickname = %member.handle.name, %channel, "evicted slow session");
    }

    /// Remove a member, dropping the channel if that emptied it.
    fn remove_member(&mut self, channel: &str, session_id: SessionId) -> Option<Member> {
        let members = self.channels.get_mut(channel)?;
        let member = members.remove(&session_id)?;
        if members.is_empty() {
            self.channels.remove(channel);
            debug!(%channel, "channel removed");
        }
        if self.locations.get(&session_id).is_some_and(|c| c == channel) {
            self.locations.remove(&session_id);
        }
        Some(member)
    }

    fn close_all(&mut self) {
        for (channel, members) in self.channels.drain() {
            for member in members.into_values() {
                member.handle.channel.clear_if(&channel);
                member.handle.mailbox.close();
            }
        }
        self.locations.clear();
    }
}

#[cfg(test)]
mod tests {
    use uuid::Uuid;

    use super::*;
    use crate::engine::mailbox::{MailboxReceiver, mailbox};

    fn member(name: &str, capacity: usize) -> (MemberHandle, MailboxReceiver) {
        let (mailbox, rx) = mailbox(capacity);
        (
            MemberHandle {
                id: Uuid::new_v4(),
                name: name.to_string(),
                mailbox,
                channel: ChannelSlot::default(),
            },
            rx,
        )
    }

    fn drain(rx: &mut MailboxReceiver) -> Vec<Outbound> {
        let mut items = Vec::new();
        while let Some(item) = rx.try_recv() {
            items.push(item);
        }
        items
    }

    /// Round-trip through the loop so every earlier command has been processed.
    async fn settle(hub: &HubHandle) {
        hub.list_channels().await.unwrap();
    }

    #[tokio::test]
    async fn test_join_announces_to_other_members_only() {
        let (hub, _task) = Hub::spawn(16);
        let (alice, mut alice_rx) = member("alice", 8);
        let (bob, mut bob_rx) = member("bob", 8);

        hub.join(alice.clone(), "general", Delivery::Live).await.unwrap();
        hub.join(bob.clone(), "general", Delivery::Live).await.unwrap();
        settle(&hub).await;

        assert_eq!(
            drain(&mut alice_rx),
            vec![Outbound::from(ControlEvent::user_joined("general", "bob"))]
        );
        assert!(drain(&mut bob_rx).is_empty());
        assert_eq!(alice.channel.get().as_deref(), Some("general"));
        assert_eq!(
            hub.list_members("general").await.unwrap(),
            Some(vec!["alice".to_string(), "bob".to_string()])
        );
    }

    #[tokio::test]
    async fn test_join_elsewhere_leaves_previous_channel() {
        let (hub, _task) = Hub::spawn(16);
        let (alice, _alice_rx) = member("alice", 8);
        let (bob, mut bob_rx) = member("bob", 8);

        hub.join(bob.clone(), "general", Delivery::Live).await.unwrap();
        hub.join(alice.clone(), "general", Delivery::Live).await.unwrap();
        hub.join(alice.clone(), "random", Delivery::Live).await.unwrap();
        settle(&hub).await;

        assert_eq!(
            hub.list_members("general").await.unwrap(),
            Some(vec!["bob".to_string()])
        );
        assert_eq!(
            hub.list_members("random").await.unwrap(),
            Some(vec!["alice".to_string()])
        );
        assert_eq!(alice.channel.get().as_deref(), Some("random"));
        assert_eq!(
            drain(&mut bob_rx),
            vec![
                Outbound::from(ControlEvent::user_joined("general", "alice")),
                Outbound::from(ControlEvent::user_left("general", "alice")),
            ]
        );
    }

    #[tokio::test]
    async fn test_last_leave_removes_channel() {
        let (hub, _task) = Hub::spawn(16);
        let (alice, _rx) = member("alice", 8);

        hub.join(alice.clone(), "general", Delivery::Live).await.unwrap();
        assert_eq!(hub.list_channels().await.unwrap(), vec!["general".to_string()]);

        hub.leave(alice.id, "general").await.unwrap();
        assert!(hub.list_channels().await.unwrap().is_empty());
        assert_eq!(hub.list_members("general").await.unwrap(), None);
        assert_eq!(alice.channel.get(), None);
    }

    #[tokio::test]
    async fn test_leave_when_not_a_member_is_a_no_op() {
        let (hub, _task) = Hub::spawn(16);
        let (alice, mut alice_rx) = member("alice", 8);
        let (bob, _bob_rx) = member("bob", 8);

        hub.join(alice.clone(), "general", Delivery::Live).await.unwrap();
        hub.leave(bob.id, "general").await.unwrap();
        hub.leave(bob.id, "nowhere").await.unwrap();
        settle(&hub).await;

        assert!(drain(&mut alice_rx).is_empty());
        assert_eq!(hub.list_channels().await.unwrap(), vec!["general".to_string()]);
    }

    #[tokio::test]
    async fn test_leave_does_not_clobber_newer_channel_slot() {
        let (hub, _task) = Hub::spawn(16);
        let (alice, _rx) = member("alice", 8);

        hub.join(alice.clone(), "general", Delivery::Live).await.unwrap();
        settle(&hub).await;
        alice.channel.set(Some("random".into()));
        hub.leave(alice.id, "general").await.unwrap();
        settle(&hub).await;

        assert_eq!(alice.channel.get().as_deref(), Some("random"));
    }

    #[tokio::test]
    async fn test_broadcast_reaches_every_member() {
        let (hub, _task) = Hub::spawn(16);
        let (alice, mut alice_rx) = member("alice", 8);
        let (bob, mut bob_rx) = member("bob", 8);

        hub.join(alice.clone(), "general", Delivery::Live).await.unwrap();
        hub.join(bob.clone(), "general", Delivery::Live).await.unwrap();
        settle(&hub).await;
        drain(&mut alice_rx);

        let message = ChatMessage::new("alice", "general", "hi".into());
        hub.broadcast(message.clone()).await.unwrap();
        settle(&hub).await;

        assert_eq!(drain(&mut alice_rx), vec![Outbound::from(message.clone())]);
        assert_eq!(drain(&mut bob_rx), vec![Outbound::from(message)]);
    }

    #[tokio::test]
    async fn test_broadcast_to_unknown_channel_is_dropped() {
        let (hub, _task) = Hub::spawn(16);
        let (alice, mut alice_rx) = member("alice", 8);
        hub.join(alice.clone(), "general", Delivery::Live).await.unwrap();

        hub.broadcast(ChatMessage::new("alice", "random", "lost".into()))
            .await
            .unwrap();
        settle(&hub).await;

        assert!(drain(&mut alice_rx).is_empty());
        assert_eq!(hub.list_channels().await.unwrap(), vec!["general".to_string()]);
    }

    #[tokio::test]
    async fn test_full_mailbox_evicts_member() {
        let (hub, _task) = Hub::spawn(16);
        let (alice, mut alice_rx) = member("alice", 8);
        let (slow, mut slow_rx) = member("slow", 1);

        hub.join(slow.clone(), "general", Delivery::Live).await.unwrap();
        hub.join(alice.clone(), "general", Delivery::Live).await.unwrap();
        settle(&hub).await;
        // "alice joined" filled the slow member's only slot.
        assert!(slow.mailbox.try_deliver(ControlEvent::user_left("x", "y")).is_err());

        let message = ChatMessage::new("alice", "general", "hi".into());
        hub.broadcast(message.clone()).await.unwrap();
        settle(&hub).await;

        assert_eq!(drain(&mut alice_rx), vec![Outbound::from(message)]);
        assert_eq!(
            hub.list_members("general").await.unwrap(),
            Some(vec!["alice".to_string()])
        );
        assert!(slow.mailbox.is_closed());
        assert_eq!(slow.channel.get(), None);
        assert_eq!(slow_rx.recv().await, None);
    }

    #[tokio::test]
    async fn test_eviction_of_sole_member_removes_channel() {
        let (hub, _task) = Hub::spawn(16);
        let (alice, alice_rx) = member("alice", 8);
        hub.join(alice.clone(), "general", Delivery::Live).await.unwrap();
        drop(alice_rx);

        hub.broadcast(ChatMessage::new("alice", "general", "hi".into()))
            .await
            .unwrap();
        assert!(hub.list_channels().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_history_catch_up_buffers_live_fan_out() {
        let (hub, _task) = Hub::spawn(16);
        let (alice, _alice_rx) = member("alice", 8);
        let (bob, mut bob_rx) = member("bob", 8);

        hub.join(alice.clone(), "general", Delivery::Live).await.unwrap();
        hub.join(bob.clone(), "general", Delivery::AfterHistory { join_seq: 1 })
            .await
            .unwrap();
        let live = ChatMessage::new("alice", "general", "live".into());
        hub.broadcast(live.clone()).await.unwrap();
        settle(&hub).await;
        assert!(drain(&mut bob_rx).is_empty());

        let old = ChatMessage::new("alice", "general", "old".into());
        bob.mailbox.try_deliver(old.clone()).unwrap();
        hub.history_loaded(bob.id, "general", 1, HashSet::from([old.id]))
            .await
            .unwrap();
        settle(&hub).await;

        assert_eq!(
            drain(&mut bob_rx),
            vec![Outbound::from(old), Outbound::from(live)]
        );
    }

    #[tokio::test]
    async fn test_history_catch_up_drops_duplicates() {
        let (hub, _task) = Hub::spawn(16);
        let (alice, _alice_rx) = member("alice", 8);
        let (bob, mut bob_rx) = member("bob", 8);

        hub.join(alice.clone(), "general", Delivery::Live).await.unwrap();
        hub.join(bob.clone(), "general", Delivery::AfterHistory { join_seq: 1 })
            .await
            .unwrap();
        let message = ChatMessage::new("alice", "general", "both".into());
        hub.broadcast(message.clone()).await.unwrap();
        settle(&hub).await;

        // The loader's query already saw the message.
        bob.mailbox.try_deliver(message.clone()).unwrap();
        hub.history_loaded(bob.id, "general", 1, HashSet::from([message.id]))
            .await
            .unwrap();
        settle(&hub).await;

        assert_eq!(drain(&mut bob_rx), vec![Outbound::from(message)]);
    }

    #[tokio::test]
    async fn test_stale_history_report_is_ignored() {
        let (hub, _task) = Hub::spawn(16);
        let (alice, _alice_rx) = member("alice", 8);
        let (bob, mut bob_rx) = member("bob", 8);

        hub.join(alice.clone(), "general", Delivery::Live).await.unwrap();
        hub.join(bob.clone(), "general", Delivery::AfterHistory { join_seq: 2 })
            .await
            .unwrap();
        hub.broadcast(ChatMessage::new("alice", "general", "held".into()))
            .await
            .unwrap();
        hub.history_loaded(bob.id, "general", 1, HashSet::new())
            .await
            .unwrap();
        settle(&hub).await;

        assert!(drain(&mut bob_rx).is_empty());
    }

    #[tokio::test]
    async fn test_hub_stop_closes_mailboxes() {
        let (hub, task) = Hub::spawn(16);
        let (alice, mut alice_rx) = member("alice", 8);
        hub.join(alice.clone(), "general", Delivery::Live).await.unwrap();
        settle(&hub).await;

        drop(hub);
        task.await.unwrap();

        assert_eq!(alice_rx.recv().await, None);
        assert_eq!(alice.channel.get(), None);
    }

    #[tokio::test]
    async fn test_shutdown_with_live_handles() {
        let (hub, task) = Hub::spawn(16);
        let (alice, mut alice_rx) = member("alice", 8);
        hub.join(alice, "general", Delivery::Live).await.unwrap();

        let other = hub.clone();
        hub.shutdown().await.unwrap();
        task.await.unwrap();

        assert_eq!(alice_rx.recv().await, None);
        assert_eq!(other.list_channels().await, Err(HubError::Stopped));
    }
}
