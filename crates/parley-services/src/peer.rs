//! Peer role: registers with the directory server, keeps a local copy of the
//! directory, and sends chat messages directly with the server as fallback.
//!
//! Requests to the server (`reg:`, `dereg:`, forwarded `MSG:`) are serialized:
//! each one waits for its `resp:` before the next goes out.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::{broadcast, mpsc, Mutex, RwLock};

use parley_core::config::{ClientConfig, DispatchConfig};
use parley_core::protocol::{chat_line, split_chat_line, valid_nickname, Command, Reply};
use parley_core::snapshot::{DirectorySnapshot, Presence};
use parley_core::wire::Envelope;

use crate::channel::{ChannelError, Delivery, ReliableChannel};
use crate::directory::{Registration, RouteOutcome};
use crate::dispatch::{Dispatcher, Handler};

/// Something the front end should show.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerEvent {
    Message { from: String, text: String },
    DirectoryChanged(DirectorySnapshot),
}

#[derive(Debug, thiserror::Error)]
pub enum PeerError {
    #[error("directory server {0} is unreachable")]
    ServerUnreachable(SocketAddr),

    #[error("nickname {0:?} is already online")]
    NameTaken(String),

    #[error("invalid nickname: {0:?}")]
    InvalidNickname(String),

    #[error("nickname {0:?} is not registered")]
    UnknownNickname(String),

    #[error("no such recipient: {0:?}")]
    UnknownRecipient(String),

    #[error("nickname {0:?} is registered by another peer")]
    NotOwner(String),

    #[error("not registered; use `reg <nickname>` first")]
    NotRegistered,

    #[error("unexpected reply from server: {0:?}")]
    UnexpectedReply(Reply),

    #[error(transparent)]
    Channel(#[from] ChannelError),
}

struct PeerState {
    channel: Arc<ReliableChannel>,
    server: SocketAddr,
    reply_timeout: Duration,
    nickname: RwLock<Option<String>>,
    view: RwLock<DirectorySnapshot>,
    replies_tx: mpsc::Sender<Reply>,
    /// Held for the whole request/reply exchange.
    replies: Mutex<mpsc::Receiver<Reply>>,
    events: mpsc::UnboundedSender<PeerEvent>,
}

/// Front-end handle to a running peer. Cheap to clone.
#[derive(Clone)]
pub struct PeerNode {
    state: Arc<PeerState>,
}

/// Inbound side of a peer, run by its dispatcher.
pub struct PeerHandler {
    state: Arc<PeerState>,
}

impl PeerNode {
    pub fn new(
        channel: Arc<ReliableChannel>,
        server: SocketAddr,
        config: &ClientConfig,
    ) -> (Self, PeerHandler, mpsc::UnboundedReceiver<PeerEvent>) {
        let (replies_tx, replies_rx) = mpsc::channel(8);
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let state = Arc::new(PeerState {
            channel,
            server,
            reply_timeout: config.reply_timeout(),
            nickname: RwLock::new(None),
            view: RwLock::new(DirectorySnapshot::default()),
            replies_tx,
            replies: Mutex::new(replies_rx),
            events: events_tx,
        });

        (
            Self {
                state: state.clone(),
            },
            PeerHandler { state },
            events_rx,
        )
    }

    /// Build a peer and the dispatcher that serves it. Spawn `Dispatcher::run`
    /// before issuing requests.
    pub fn start(
        channel: Arc<ReliableChannel>,
        server: SocketAddr,
        client: &ClientConfig,
        dispatch: DispatchConfig,
        shutdown: broadcast::Receiver<()>,
    ) -> (Self, Dispatcher, mpsc::UnboundedReceiver<PeerEvent>) {
        let (node, handler, events) = Self::new(channel.clone(), server, client);
        let dispatcher = Dispatcher::new(channel, Arc::new(handler), dispatch, shutdown);
        (node, dispatcher, events)
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.state.channel.local_addr()
    }

    pub fn server(&self) -> SocketAddr {
        self.state.server
    }

    /// Nickname this peer is currently registered under.
    pub async fn nickname(&self) -> Option<String> {
        self.state.nickname.read().await.clone()
    }

    /// Latest directory snapshot, with local offline marks applied.
    pub async fn directory(&self) -> DirectorySnapshot {
        self.state.view.read().await.clone()
    }

    // ── Requests ──────────────────────────────────────────────────────────────

    pub async fn register(&self, nickname: &str) -> Result<Registration, PeerError> {
        if !valid_nickname(nickname) {
            return Err(PeerError::InvalidNickname(nickname.to_string()));
        }

        let registration = match self.request(Command::Register, json!(nickname)).await? {
            Reply::Registered => Registration::Registered,
            Reply::Reactivated => Registration::Reactivated,
            Reply::NameTaken { nickname } => return Err(PeerError::NameTaken(nickname)),
            Reply::InvalidNickname { nickname } => {
                return Err(PeerError::InvalidNickname(nickname))
            }
            other => return Err(PeerError::UnexpectedReply(other)),
        };

        *self.state.nickname.write().await = Some(nickname.to_string());
        tracing::info!(nickname, ?registration, "registered with directory");
        Ok(registration)
    }

    pub async fn deregister(&self, nickname: &str) -> Result<(), PeerError> {
        match self.request(Command::Deregister, json!(nickname)).await? {
            Reply::Deregistered => {}
            Reply::UnknownNickname { nickname } => return Err(PeerError::UnknownNickname(nickname)),
            Reply::NotOwner { nickname } => return Err(PeerError::NotOwner(nickname)),
            other => return Err(PeerError::UnexpectedReply(other)),
        }

        // The server does not broadcast to offline nicknames, so our own
        // view would otherwise keep showing us online.
        self.state
            .view
            .write()
            .await
            .set_presence(nickname, Presence::Offline);

        let mut own = self.state.nickname.write().await;
        if own.as_deref() == Some(nickname) {
            *own = None;
        }
        tracing::info!(nickname, "deregistered");
        Ok(())
    }

    /// Send `text` to `target`.
    ///
    /// Online targets get a direct send. If that times out the target is
    /// marked offline locally and the message goes to the server, which
    /// delivers or queues it. Offline targets go straight to the server.
    pub async fn send_message(&self, target: &str, text: &str) -> Result<RouteOutcome, PeerError> {
        let sender = self.nickname().await.ok_or(PeerError::NotRegistered)?;
        let payload = json!(chat_line(&sender, text));

        let entry = self.state.view.read().await.get(target).cloned();
        let Some(entry) = entry else {
            return Err(PeerError::UnknownRecipient(target.to_string()));
        };

        if entry.presence == Presence::Online {
            let command = Command::message(target).to_string();
            match self
                .state
                .channel
                .send(&command, payload.clone(), entry.endpoint)
                .await?
            {
                Delivery::Delivered { .. } => return Ok(RouteOutcome::Delivered),
                Delivery::TimedOut { attempts } => {
                    tracing::warn!(
                        recipient = target,
                        endpoint = %entry.endpoint,
                        attempts,
                        "direct send failed, forwarding to server"
                    );
                    self.state
                        .view
                        .write()
                        .await
                        .set_presence(target, Presence::Offline);
                }
            }
        }

        match self.request(Command::message(target), payload).await? {
            Reply::Delivered { .. } => Ok(RouteOutcome::Delivered),
            Reply::Queued { .. } => Ok(RouteOutcome::Queued),
            Reply::NoSuchRecipient { recipient } => Err(PeerError::UnknownRecipient(recipient)),
            other => Err(PeerError::UnexpectedReply(other)),
        }
    }

    async fn request(&self, command: Command, payload: Value) -> Result<Reply, PeerError> {
        let server = self.state.server;
        let mut replies = self.state.replies.lock().await;

        // Late replies to an earlier, abandoned request.
        while let Ok(stale) = replies.try_recv() {
            tracing::debug!(?stale, "discarding stale reply");
        }

        let delivery = self
            .state
            .channel
            .send(&command.to_string(), payload, server)
            .await?;
        if !delivery.is_delivered() {
            return Err(PeerError::ServerUnreachable(server));
        }

        match tokio::time::timeout(self.state.reply_timeout, replies.recv()).await {
            Ok(Some(reply)) => Ok(reply),
            Ok(None) | Err(_) => {
                tracing::warn!(%server, %command, "no reply from server");
                Err(PeerError::ServerUnreachable(server))
            }
        }
    }
}

// ── Inbound ───────────────────────────────────────────────────────────────────

impl PeerHandler {
    async fn on_update(&self, payload: Value, source: SocketAddr) {
        if source != self.state.server {
            tracing::warn!(%source, "ignoring directory update from non-server");
            return;
        }
        let snapshot: DirectorySnapshot = match serde_json::from_value(payload) {
            Ok(s) => s,
            Err(e) => {
                tracing::warn!(error = %e, "malformed directory update");
                return;
            }
        };

        {
            let mut view = self.state.view.write().await;
            if !view.is_superseded_by(&snapshot) {
                tracing::debug!(
                    epoch = snapshot.epoch,
                    current = view.version,
                    received = snapshot.version,
                    "stale directory update ignored"
                );
                return;
            }
            *view = snapshot.clone();
        }

        tracing::debug!(version = snapshot.version, entries = snapshot.entries.len(), "directory updated");
        let _ = self.state.events.send(PeerEvent::DirectoryChanged(snapshot));
    }

    async fn on_message(&self, to: String, payload: Value, source: SocketAddr) {
        let Some(line) = payload.as_str() else {
            tracing::warn!(%source, "chat payload is not a string");
            return;
        };

        let own = self.state.nickname.read().await.clone();
        if own.as_deref() != Some(to.as_str()) {
            tracing::debug!(%source, addressed_to = %to, "message for another nickname");
        }

        let (from, text) = split_chat_line(line).unwrap_or(("?", line));
        let _ = self.state.events.send(PeerEvent::Message {
            from: from.to_string(),
            text: text.to_string(),
        });
    }

    fn on_reply(&self, payload: Value, source: SocketAddr) {
        if source != self.state.server {
            tracing::warn!(%source, "ignoring reply from non-server");
            return;
        }
        match serde_json::from_value::<Reply>(payload) {
            Ok(reply) => {
                if let Err(e) = self.state.replies_tx.try_send(reply) {
                    tracing::warn!(error = %e, "reply queue full, dropping reply");
                }
            }
            Err(e) => tracing::warn!(error = %e, "malformed reply"),
        }
    }
}

#[async_trait]
impl Handler for PeerHandler {
    async fn handle(&self, envelope: Envelope, source: SocketAddr) {
        match Command::parse(&envelope.command) {
            Ok(Command::Update) => self.on_update(envelope.payload, source).await,
            Ok(Command::Message { to }) => self.on_message(to, envelope.payload, source).await,
            Ok(Command::Reply) => self.on_reply(envelope.payload, source),
            Ok(Command::Register | Command::Deregister) => {
                tracing::debug!(%source, command = %envelope.command, "peer ignores server-bound command");
            }
            Err(e) => tracing::debug!(%source, error = %e, "ignoring unknown command"),
        }
    }
}
