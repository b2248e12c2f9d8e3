//! Directory: the server's authoritative nickname → (endpoint, presence) map
//! together with the offline mailbox.
//!
//! Both live behind one async mutex. Every operation reads and mutates under
//! the lock, captures the snapshot to broadcast while still holding it, and
//! releases it before any network send.
//!
//! Per-nickname lifecycle: unregistered → online ⇄ offline. Entries are never
//! removed.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;

use futures::future::join_all;
use serde_json::Value;
use tokio::sync::Mutex;

use parley_core::protocol::{valid_nickname, Command};
use parley_core::snapshot::{DirectorySnapshot, EntryView, Presence};

use crate::channel::{ChannelError, Delivery, ReliableChannel};
use crate::mailbox::Mailbox;

/// One registered nickname.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryEntry {
    pub nickname: String,
    /// Source address of the most recent registration.
    pub endpoint: SocketAddr,
    pub presence: Presence,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    /// First registration of this nickname.
    Registered,
    /// The nickname was offline and is online again.
    Reactivated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteOutcome {
    Delivered,
    Queued,
}

/// Result of one mailbox drain.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrainReport {
    pub delivered: usize,
    /// Messages left in the mailbox because a delivery failed.
    pub requeued: usize,
}

#[derive(Debug, thiserror::Error)]
pub enum DirectoryError {
    #[error("nickname {0:?} is already online")]
    NameTaken(String),

    #[error("nickname {0:?} is not registered")]
    UnknownNickname(String),

    #[error("no such recipient: {0:?}")]
    UnknownRecipient(String),

    #[error("nickname {0:?} is registered at another endpoint")]
    NotOwner(String),

    #[error("invalid nickname: {0:?}")]
    InvalidNickname(String),

    #[error("failed to encode directory snapshot: {0}")]
    Encode(#[from] serde_json::Error),

    #[error(transparent)]
    Channel(#[from] ChannelError),
}

#[derive(Debug, Default)]
struct DirectoryState {
    entries: BTreeMap<String, DirectoryEntry>,
    mailbox: Mailbox,
    epoch: u64,
    version: u64,
}

impl DirectoryState {
    fn snapshot(&self) -> DirectorySnapshot {
        DirectorySnapshot {
            epoch: self.epoch,
            version: self.version,
            entries: self
                .entries
                .iter()
                .map(|(nickname, e)| {
                    (
                        nickname.clone(),
                        EntryView {
                            endpoint: e.endpoint,
                            presence: e.presence,
                        },
                    )
                })
                .collect(),
        }
    }

    /// Record a mutation and return the snapshot that describes it.
    fn bump(&mut self) -> DirectorySnapshot {
        self.version += 1;
        self.snapshot()
    }

    fn set_offline(&mut self, nickname: &str) -> bool {
        match self.entries.get_mut(nickname) {
            Some(entry) if entry.presence == Presence::Online => {
                entry.presence = Presence::Offline;
                true
            }
            _ => false,
        }
    }
}

/// Work `register` finishes after releasing the lock.
enum AfterRegister {
    Broadcast(DirectorySnapshot),
    Drain,
    /// An earlier drain still owns the mailbox.
    Refresh,
}

pub struct Directory {
    channel: Arc<ReliableChannel>,
    state: Mutex<DirectoryState>,
}

impl Directory {
    pub fn new(channel: Arc<ReliableChannel>) -> Self {
        Self {
            channel,
            state: Mutex::new(DirectoryState {
                epoch: rand::random(),
                ..DirectoryState::default()
            }),
        }
    }

    // ── Queries ───────────────────────────────────────────────────────────────

    pub async fn snapshot(&self) -> DirectorySnapshot {
        self.state.lock().await.snapshot()
    }

    pub async fn lookup(&self, nickname: &str) -> Option<DirectoryEntry> {
        self.state.lock().await.entries.get(nickname).cloned()
    }

    /// Messages waiting in `nickname`'s mailbox.
    pub async fn queued_for(&self, nickname: &str) -> usize {
        self.state.lock().await.mailbox.len(nickname)
    }

    // ── Registration ──────────────────────────────────────────────────────────

    /// Register `nickname` at `endpoint`.
    ///
    /// A reactivated nickname gets its mailbox drained before the new
    /// snapshot goes out, so queued messages reach it ahead of the update.
    pub async fn register(
        &self,
        nickname: &str,
        endpoint: SocketAddr,
    ) -> Result<Registration, DirectoryError> {
        if !valid_nickname(nickname) {
            return Err(DirectoryError::InvalidNickname(nickname.to_string()));
        }

        let (registration, next) = {
            let mut state = self.state.lock().await;
            match state.entries.get_mut(nickname) {
                Some(entry) if entry.presence == Presence::Online => {
                    return Err(DirectoryError::NameTaken(nickname.to_string()));
                }
                Some(entry) => {
                    entry.presence = Presence::Online;
                    entry.endpoint = endpoint;
                    state.bump();
                    // Marked before the lock is released: a message routed
                    // from here on queues behind the mailbox. A drain that
                    // is still running from an earlier registration keeps
                    // going and follows the new endpoint.
                    let next = if state.mailbox.start_draining(nickname) {
                        AfterRegister::Drain
                    } else {
                        AfterRegister::Refresh
                    };
                    (Registration::Reactivated, next)
                }
                None => {
                    state.entries.insert(
                        nickname.to_string(),
                        DirectoryEntry {
                            nickname: nickname.to_string(),
                            endpoint,
                            presence: Presence::Online,
                        },
                    );
                    (Registration::Registered, AfterRegister::Broadcast(state.bump()))
                }
            }
        };

        tracing::info!(nickname, %endpoint, ?registration, "nickname online");

        let snapshot = match next {
            AfterRegister::Broadcast(snapshot) => snapshot,
            AfterRegister::Refresh => self.snapshot().await,
            AfterRegister::Drain => {
                let report = self.run_drain(nickname).await;
                if report.delivered > 0 || report.requeued > 0 {
                    tracing::info!(
                        nickname,
                        delivered = report.delivered,
                        requeued = report.requeued,
                        "mailbox drained"
                    );
                }
                self.snapshot().await
            }
        };

        self.broadcast(&snapshot).await?;
        Ok(registration)
    }

    /// Mark `nickname` offline. Deregistering an offline nickname succeeds
    /// without a new broadcast.
    pub async fn deregister(&self, nickname: &str) -> Result<(), DirectoryError> {
        self.mark_offline(nickname, None).await
    }

    /// Like `deregister`, on behalf of `requester`, which must be the
    /// endpoint the nickname is registered at.
    pub async fn deregister_from(
        &self,
        nickname: &str,
        requester: SocketAddr,
    ) -> Result<(), DirectoryError> {
        self.mark_offline(nickname, Some(requester)).await
    }

    async fn mark_offline(
        &self,
        nickname: &str,
        requester: Option<SocketAddr>,
    ) -> Result<(), DirectoryError> {
        let snapshot = {
            let mut state = self.state.lock().await;
            let Some(entry) = state.entries.get(nickname) else {
                return Err(DirectoryError::UnknownNickname(nickname.to_string()));
            };
            if requester.is_some_and(|r| r != entry.endpoint) {
                return Err(DirectoryError::NotOwner(nickname.to_string()));
            }
            state.set_offline(nickname).then(|| state.bump())
        };

        if let Some(snapshot) = snapshot {
            tracing::info!(nickname, "nickname offline");
            self.broadcast(&snapshot).await?;
        }
        Ok(())
    }

    // ── Broadcast ─────────────────────────────────────────────────────────────

    /// Send the current snapshot to every online nickname.
    ///
    /// Per-recipient failures are logged and leave presence untouched.
    /// Returns how many recipients acknowledged.
    pub async fn broadcast_snapshot(&self) -> Result<usize, DirectoryError> {
        let snapshot = self.snapshot().await;
        self.broadcast(&snapshot).await
    }

    async fn broadcast(&self, snapshot: &DirectorySnapshot) -> Result<usize, DirectoryError> {
        let payload = serde_json::to_value(snapshot)?;
        let command = Command::Update.to_string();

        let sends = snapshot.online().map(|(nickname, entry)| {
            let payload = payload.clone();
            let command = command.as_str();
            async move {
                let result = self.channel.send(command, payload, entry.endpoint).await;
                (nickname, entry.endpoint, result)
            }
        });

        let mut acknowledged = 0;
        for (nickname, endpoint, result) in join_all(sends).await {
            match result {
                Ok(Delivery::Delivered { .. }) => acknowledged += 1,
                Ok(Delivery::TimedOut { attempts }) => {
                    tracing::warn!(nickname, %endpoint, attempts, "snapshot not acknowledged");
                }
                Err(e) => {
                    tracing::warn!(nickname, %endpoint, error = %e, "snapshot send failed");
                }
            }
        }

        tracing::debug!(
            version = snapshot.version,
            acknowledged,
            "directory snapshot broadcast"
        );
        Ok(acknowledged)
    }

    // ── Routing ───────────────────────────────────────────────────────────────

    /// Deliver a chat payload to `target`, or queue it.
    ///
    /// An offline or currently draining target is queued without a delivery
    /// attempt. A failed direct delivery marks the target offline, queues the
    /// payload and broadcasts the change.
    pub async fn route_message(
        &self,
        target: &str,
        payload: Value,
    ) -> Result<RouteOutcome, DirectoryError> {
        loop {
            let endpoint = {
                let mut state = self.state.lock().await;
                let Some(entry) = state.entries.get(target) else {
                    return Err(DirectoryError::UnknownRecipient(target.to_string()));
                };

                if entry.presence == Presence::Offline || state.mailbox.is_draining(target) {
                    state.mailbox.enqueue(target, payload);
                    tracing::debug!(recipient = target, queued = state.mailbox.len(target), "message queued");
                    return Ok(RouteOutcome::Queued);
                }
                entry.endpoint
            };

            let command = Command::message(target).to_string();
            let attempts = match self.channel.send(&command, payload.clone(), endpoint).await? {
                Delivery::Delivered { .. } => return Ok(RouteOutcome::Delivered),
                Delivery::TimedOut { attempts } => attempts,
            };

            let snapshot = {
                let mut state = self.state.lock().await;
                if state.entries.get(target).is_some_and(|e| e.endpoint != endpoint) {
                    tracing::debug!(recipient = target, %endpoint, "recipient re-registered during delivery, rerouting");
                    continue;
                }
                tracing::warn!(recipient = target, %endpoint, attempts, "direct delivery failed, queueing");
                state.mailbox.enqueue(target, payload);
                state.set_offline(target).then(|| state.bump())
            };
            if let Some(snapshot) = snapshot {
                self.broadcast(&snapshot).await?;
            }
            return Ok(RouteOutcome::Queued);
        }
    }

    /// Deliver `nickname`'s queued messages in order.
    ///
    /// Stops at the first failure: the undelivered message goes back to the
    /// head of the queue and the nickname is marked offline. The caller is
    /// expected to broadcast afterwards. Does nothing if the nickname is
    /// offline or a drain is already running.
    pub async fn drain(&self, nickname: &str) -> DrainReport {
        {
            let mut state = self.state.lock().await;
            let online = state
                .entries
                .get(nickname)
                .is_some_and(|e| e.presence == Presence::Online);
            if !online || !state.mailbox.start_draining(nickname) {
                return DrainReport::default();
            }
        }
        self.run_drain(nickname).await
    }

    /// Drain loop for a mailbox the caller has already marked as draining.
    async fn run_drain(&self, nickname: &str) -> DrainReport {
        let command = Command::message(nickname).to_string();
        let mut report = DrainReport::default();

        loop {
            let (payload, endpoint) = {
                let mut state = self.state.lock().await;
                let endpoint = match state.entries.get(nickname) {
                    Some(entry) if entry.presence == Presence::Online => entry.endpoint,
                    _ => {
                        state.mailbox.stop_draining(nickname);
                        report.requeued = state.mailbox.len(nickname);
                        return report;
                    }
                };
                match state.mailbox.next_for_drain(nickname) {
                    Some(payload) => (payload, endpoint),
                    None => return report,
                }
            };

            let delivered = match self.channel.send(&command, payload.clone(), endpoint).await {
                Ok(delivery) => delivery.is_delivered(),
                Err(e) => {
                    tracing::warn!(nickname, error = %e, "mailbox delivery failed");
                    false
                }
            };

            if delivered {
                report.delivered += 1;
                continue;
            }

            let mut state = self.state.lock().await;
            state.mailbox.requeue_front(nickname, payload);
            if state.entries.get(nickname).is_some_and(|e| e.endpoint != endpoint) {
                tracing::debug!(nickname, %endpoint, "recipient re-registered during drain, following");
                state.mailbox.start_draining(nickname);
                continue;
            }
            if state.set_offline(nickname) {
                state.bump();
            }
            report.requeued = state.mailbox.len(nickname);
            tracing::warn!(
                nickname,
                %endpoint,
                delivered = report.delivered,
                requeued = report.requeued,
                "mailbox drain interrupted"
            );
            return report;
        }
    }
}
