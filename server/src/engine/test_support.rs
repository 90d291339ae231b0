//! In-process transports and stores for exercising sessions without sockets.

use std::sync::Arc;
use std::time::Duration;

use futures_util::SinkExt;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::PollSender;

use super::events::ChatMessage;
use super::hub::HubHandle;
use super::session::{ClientSession, Identity, SessionSettings};
use super::store::{MemoryStore, MessageStore, StoreError};
use super::transport::{Frame, TransportError};

const WAIT: Duration = Duration::from_secs(2);

/// A store whose every operation fails.
pub struct FailingStore;

impl MessageStore for FailingStore {
    async fn save(&self, _message: &ChatMessage) -> Result<(), StoreError> {
        Err(StoreError::Unavailable("disk on fire".into()))
    }

    async fn recent_by_channel(
        &self,
        _channel: &str,
        _limit: usize,
    ) -> Result<Vec<ChatMessage>, StoreError> {
        Err(StoreError::Unavailable("disk on fire".into()))
    }
}

/// A store whose history lookups never complete. Saves go to an in-memory
/// store unless `stall_saves` is set, in which case they never complete either.
pub struct StallingStore {
    inner: MemoryStore,
    stall_saves: bool,
}

impl StallingStore {
    pub fn new(stall_saves: bool) -> Self {
        Self {
            inner: MemoryStore::new(),
            stall_saves,
        }
    }

    pub fn saved(&self) -> usize {
        self.inner.len()
    }
}

impl MessageStore for StallingStore {
    async fn save(&self, message: &ChatMessage) -> Result<(), StoreError> {
        if self.stall_saves {
            std::future::pending::<()>().await;
        }
        self.inner.save(message).await
    }

    async fn recent_by_channel(
        &self,
        _channel: &str,
        _limit: usize,
    ) -> Result<Vec<ChatMessage>, StoreError> {
        std::future::pending().await
    }
}

/// The client end of a session running over channels. The outbound side holds
/// a single frame, so a client that stops reading stalls its write pump.
pub struct TestClient {
    inbound: Option<mpsc::UnboundedSender<Result<Frame, TransportError>>>,
    outbound: mpsc::Receiver<Frame>,
    task: Option<JoinHandle<()>>,
}

/// Start a session for `name` and return its client end.
pub fn connect<S: MessageStore>(
    name: &str,
    hub: &HubHandle,
    store: &Arc<S>,
    settings: SessionSettings,
) -> TestClient {
    let (inbound, mut inbound_rx) = mpsc::unbounded_channel();
    let (outbound_tx, outbound) = mpsc::channel(1);

    let reader = futures_util::stream::poll_fn(move |cx| inbound_rx.poll_recv(cx));
    let writer = PollSender::new(outbound_tx).sink_map_err(|_| TransportError::Closed);

    let session = ClientSession::new(
        Identity::new(name, name),
        hub.clone(),
        store.clone(),
        settings,
    );
    let task = tokio::spawn(session.run(reader, writer));

    TestClient {
        inbound: Some(inbound),
        outbound,
        task: Some(task),
    }
}

impl TestClient {
    pub fn send(&self, value: Value) {
        self.send_text(&value.to_string());
    }

    pub fn send_text(&self, text: &str) {
        self.send_frame(Frame::Text(text.to_string()));
    }

    pub fn send_frame(&self, frame: Frame) {
        if let Some(tx) = &self.inbound {
            let _ = tx.send(Ok(frame));
        }
    }

    /// Fail the read side as a broken socket would.
    pub fn send_error(&self) {
        if let Some(tx) = &self.inbound {
            let _ = tx.send(Err(TransportError::Io("connection reset".into())));
        }
    }

    /// End the inbound stream (EOF).
    pub fn disconnect(&mut self) {
        self.inbound = None;
    }

    pub async fn next_frame(&mut self) -> Option<Frame> {
        self.outbound.recv().await
    }

    /// Next text frame as JSON, skipping pings.
    pub async fn next_json(&mut self) -> Value {
        let next = async {
            loop {
                match self.outbound.recv().await {
                    Some(Frame::Text(text)) => {
                        return serde_json::from_str::<Value>(&text).expect("outbound JSON");
                    }
                    Some(Frame::Ping(_) | Frame::Pong(_)) => continue,
                    other => panic!("expected a text frame, got {other:?}"),
                }
            }
        };
        tokio::time::timeout(WAIT, next)
            .await
            .expect("timed out waiting for a frame")
    }

    /// Next chat message, skipping control objects.
    pub async fn next_chat(&mut self) -> Value {
        loop {
            let value = self.next_json().await;
            if value.get("type").is_none() {
                return value;
            }
        }
    }

    /// Assert nothing arrives for a short while.
    pub async fn expect_silence(&mut self) {
        let quiet = tokio::time::timeout(Duration::from_millis(100), self.outbound.recv()).await;
        assert!(quiet.is_err(), "unexpected frame: {quiet:?}");
    }

    /// Everything written until the transport is closed.
    pub async fn closing_frames(&mut self) -> Vec<Frame> {
        let collect = async {
            let mut frames = Vec::new();
            while let Some(frame) = self.outbound.recv().await {
                frames.push(frame);
            }
            frames
        };
        tokio::time::timeout(WAIT, collect)
            .await
            .expect("transport was not closed")
    }

    /// Wait for both pumps to stop.
    pub async fn finished(&mut self) {
        if let Some(task) = self.task.take() {
            tokio::time::timeout(WAIT, task)
                .await
                .expect("session did not end")
                .expect("session panicked");
        }
    }
}
