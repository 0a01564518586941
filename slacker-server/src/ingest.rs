//! Event feed client.
//!
//! Holds one websocket connection to the event feed, reconnecting with
//! exponential backoff, and hands each decoded event to an [`EventHandler`]
//! on its own task. A handler that errors or panics only loses its own event.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::SplitSink;
use futures_util::{FutureExt, SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use slacker_core::{ParseError, RepoRef};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::retry::RetryPolicy;

type FeedStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// One frame from the feed.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Envelope {
    pub event: String,
    pub repo: String,
    #[serde(default)]
    pub payload: Value,
}

/// An envelope whose repository has been validated.
#[derive(Debug, Clone, PartialEq)]
pub struct IncomingEvent {
    pub kind: String,
    pub repo: RepoRef,
    pub payload: Value,
}

impl TryFrom<Envelope> for IncomingEvent {
    type Error = ParseError;

    fn try_from(envelope: Envelope) -> Result<Self, Self::Error> {
        Ok(Self {
            kind: envelope.event,
            repo: RepoRef::parse(&envelope.repo)?,
            payload: envelope.payload,
        })
    }
}

#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: IncomingEvent) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum IngestorState {
    Disconnected,
    Connecting,
    Connected,
    ShuttingDown,
}

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("gave up connecting to {url} after {attempts} attempts: {last_error}")]
    ConnectFailed {
        url: String,
        attempts: u32,
        last_error: String,
    },
}

#[derive(Debug, Clone)]
pub struct IngestConfig {
    pub url: String,
    pub reconnect: RetryPolicy,
    pub handshake_timeout: Duration,
    pub ping_interval: Duration,
    /// A connection with no inbound frames for this long is treated as dead.
    pub idle_timeout: Duration,
}

impl IngestConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            reconnect: RetryPolicy::new(10, Duration::from_secs(1), Duration::from_secs(120)),
            handshake_timeout: Duration::from_secs(10),
            ping_interval: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(60),
        }
    }
}

enum ReadOutcome {
    Cancelled,
    ClosedNormally,
    Lost(String),
}

pub struct EventIngestor {
    config: IngestConfig,
    handler: Arc<dyn EventHandler>,
    state: watch::Sender<IngestorState>,
}

impl EventIngestor {
    pub fn new(config: IngestConfig, handler: Arc<dyn EventHandler>) -> Self {
        let (state, _) = watch::channel(IngestorState::Disconnected);
        Self {
            config,
            handler,
            state,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<IngestorState> {
        self.state.subscribe()
    }

    fn set_state(&self, state: IngestorState) {
        self.state.send_replace(state);
    }

    /// Run until cancelled, until the feed closes the connection normally, or
    /// until reconnection attempts are exhausted (an error).
    pub async fn run(&self, cancel: CancellationToken) -> Result<(), IngestError> {
        info!("Starting event ingestor for {}", self.config.url);
        loop {
            let Some(ws) = self.connect_with_backoff(&cancel).await? else {
                self.set_state(IngestorState::ShuttingDown);
                return Ok(());
            };

            match self.read_until_closed(ws, &cancel).await {
                ReadOutcome::Cancelled => {
                    info!("Event ingestor shutting down");
                    self.set_state(IngestorState::ShuttingDown);
                    return Ok(());
                }
                ReadOutcome::ClosedNormally => {
                    info!("Event feed closed the connection normally");
                    self.set_state(IngestorState::Disconnected);
                    return Ok(());
                }
                ReadOutcome::Lost(reason) => {
                    warn!("Lost connection to event feed, reconnecting: {}", reason);
                    self.set_state(IngestorState::Disconnected);
                }
            }
        }
    }

    /// `Ok(None)` means cancellation arrived first.
    async fn connect_with_backoff(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Option<FeedStream>, IngestError> {
        let policy = self.config.reconnect;
        let mut last_error = String::new();

        for attempt in 0..policy.attempts {
            if attempt > 0 {
                let delay = policy.delay(attempt - 1);
                info!("Reconnecting in {:?}", delay);
                tokio::select! {
                    _ = cancel.cancelled() => return Ok(None),
                    _ = tokio::time::sleep(delay) => {}
                }
            }

            self.set_state(IngestorState::Connecting);
            debug!(
                "Connecting to {} (attempt {}/{})",
                self.config.url,
                attempt + 1,
                policy.attempts
            );
            let handshake =
                tokio::time::timeout(self.config.handshake_timeout, connect_async(self.config.url.as_str()));

            tokio::select! {
                _ = cancel.cancelled() => return Ok(None),
                result = handshake => match result {
                    Ok(Ok((ws, _response))) => {
                        info!("Connected to event feed");
                        self.set_state(IngestorState::Connected);
                        return Ok(Some(ws));
                    }
                    Ok(Err(e)) => {
                        warn!("Failed to connect to event feed: {}", e);
                        last_error = e.to_string();
                    }
                    Err(_) => {
                        warn!("Handshake with event feed timed out");
                        last_error = format!("handshake timed out after {:?}", self.config.handshake_timeout);
                    }
                },
            }
            self.set_state(IngestorState::Disconnected);
        }

        error!(
            "Giving up on event feed after {} attempts",
            policy.attempts
        );
        Err(IngestError::ConnectFailed {
            url: self.config.url.clone(),
            attempts: policy.attempts,
            last_error,
        })
    }

    async fn read_until_closed(&self, ws: FeedStream, cancel: &CancellationToken) -> ReadOutcome {
        let (sink, mut stream) = ws.split();
        let connection = cancel.child_token();
        let keepalive = tokio::spawn(keepalive(sink, self.config.ping_interval, connection.clone()));

        let outcome = loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => break ReadOutcome::Cancelled,
                next = tokio::time::timeout(self.config.idle_timeout, stream.next()) => next,
            };

            let message = match next {
                Err(_) => break ReadOutcome::Lost(format!("no frames for {:?}", self.config.idle_timeout)),
                Ok(None) => break ReadOutcome::Lost("stream ended without a close frame".to_string()),
                Ok(Some(Err(e))) => break ReadOutcome::Lost(e.to_string()),
                Ok(Some(Ok(message))) => message,
            };

            match message {
                Message::Text(text) => self.dispatch_frame(text.as_bytes()),
                Message::Binary(data) => self.dispatch_frame(&data),
                Message::Ping(_) | Message::Pong(_) => debug!("Keepalive frame from event feed"),
                Message::Close(frame) => {
                    break match frame {
                        Some(frame) if frame.code == CloseCode::Normal => ReadOutcome::ClosedNormally,
                        other => ReadOutcome::Lost(format!("closed by peer: {:?}", other)),
                    };
                }
                Message::Frame(_) => {}
            }
        };

        connection.cancel();
        match tokio::time::timeout(Duration::from_secs(5), keepalive).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!("Keepalive task failed: {}", e),
            Err(_) => warn!("Keepalive task did not stop in time"),
        }
        outcome
    }

    fn dispatch_frame(&self, frame: &[u8]) {
        let envelope: Envelope = match serde_json::from_slice(frame) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!("Ignoring undecodable frame: {}", e);
                return;
            }
        };
        match IncomingEvent::try_from(envelope) {
            Ok(event) => {
                dispatch(self.handler.clone(), event);
            }
            Err(e) => warn!("Ignoring event: {}", e),
        }
    }
}

/// Send pings until the connection is torn down, then try to close politely.
async fn keepalive(
    mut sink: SplitSink<FeedStream, Message>,
    interval: Duration,
    connection: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = connection.cancelled() => {
                let close = Message::Close(Some(CloseFrame {
                    code: CloseCode::Normal,
                    reason: "client closing".into(),
                }));
                if let Err(e) = sink.send(close).await {
                    debug!("Could not send close frame: {}", e);
                }
                return;
            }
            _ = ticker.tick() => {
                if let Err(e) = sink.send(Message::Ping(Vec::new())).await {
                    debug!("Ping failed, stopping keepalive: {}", e);
                    return;
                }
            }
        }
    }
}

/// Run `handler` on its own task, tagged with a fresh correlation id.
pub fn dispatch(handler: Arc<dyn EventHandler>, event: IncomingEvent) -> JoinHandle<()> {
    let correlation_id = Uuid::new_v4();
    let span = info_span!(
        "event",
        kind = %event.kind,
        repo = %event.repo,
        correlation_id = %correlation_id
    );

    tokio::spawn(
        async move {
            let kind = event.kind.clone();
            debug!("Dispatching {} event", kind);
            match AssertUnwindSafe(handler.handle(event)).catch_unwind().await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!("Failed to process {} event: {:#}", kind, e),
                Err(panic) => error!("Panic while processing {} event: {}", kind, panic_message(&*panic)),
            }
        }
        .instrument(span),
    )
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
