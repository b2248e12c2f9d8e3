//! Directory server role: turns inbound requests into directory operations
//! and answers each with a `resp:` envelope.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::broadcast;

use parley_core::config::DispatchConfig;
use parley_core::protocol::{Command, Reply};
use parley_core::wire::Envelope;

use crate::channel::{Delivery, ReliableChannel};
use crate::directory::{Directory, DirectoryError, Registration, RouteOutcome};
use crate::dispatch::{Dispatcher, Handler};

pub struct ServerHandler {
    directory: Arc<Directory>,
    channel: Arc<ReliableChannel>,
}

impl ServerHandler {
    pub fn new(directory: Arc<Directory>, channel: Arc<ReliableChannel>) -> Self {
        Self { directory, channel }
    }

    async fn register(&self, nickname: &str, source: SocketAddr) -> Option<Reply> {
        match self.directory.register(nickname, source).await {
            Ok(Registration::Registered) => Some(Reply::Registered),
            Ok(Registration::Reactivated) => Some(Reply::Reactivated),
            Err(DirectoryError::NameTaken(nickname)) => Some(Reply::NameTaken { nickname }),
            Err(DirectoryError::InvalidNickname(nickname)) => {
                Some(Reply::InvalidNickname { nickname })
            }
            Err(e) => {
                tracing::warn!(nickname, %source, error = %e, "registration failed");
                None
            }
        }
    }

    async fn deregister(&self, nickname: &str, source: SocketAddr) -> Option<Reply> {
        match self.directory.deregister_from(nickname, source).await {
            Ok(()) => Some(Reply::Deregistered),
            Err(DirectoryError::UnknownNickname(nickname)) => {
                Some(Reply::UnknownNickname { nickname })
            }
            Err(DirectoryError::NotOwner(nickname)) => {
                tracing::warn!(nickname, %source, "deregistration from foreign endpoint refused");
                Some(Reply::NotOwner { nickname })
            }
            Err(e) => {
                tracing::warn!(nickname, %source, error = %e, "deregistration failed");
                None
            }
        }
    }

    async fn forward(&self, recipient: String, payload: Value) -> Option<Reply> {
        match self.directory.route_message(&recipient, payload).await {
            Ok(RouteOutcome::Delivered) => Some(Reply::Delivered { recipient }),
            Ok(RouteOutcome::Queued) => Some(Reply::Queued { recipient }),
            Err(DirectoryError::UnknownRecipient(recipient)) => {
                Some(Reply::NoSuchRecipient { recipient })
            }
            Err(e) => {
                tracing::warn!(%recipient, error = %e, "message routing failed");
                None
            }
        }
    }

    async fn reply(&self, reply: Reply, destination: SocketAddr) {
        let payload = match serde_json::to_value(&reply) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::warn!(error = %e, "failed to encode reply");
                return;
            }
        };

        match self
            .channel
            .send(&Command::Reply.to_string(), payload, destination)
            .await
        {
            Ok(Delivery::Delivered { .. }) => {}
            Ok(Delivery::TimedOut { attempts }) => {
                tracing::warn!(%destination, attempts, ?reply, "reply not acknowledged");
            }
            Err(e) => tracing::warn!(%destination, error = %e, "reply send failed"),
        }
    }
}

#[async_trait]
impl Handler for ServerHandler {
    async fn handle(&self, envelope: Envelope, source: SocketAddr) {
        let command = match Command::parse(&envelope.command) {
            Ok(command) => command,
            Err(e) => {
                tracing::debug!(%source, error = %e, "ignoring unknown command");
                return;
            }
        };

        let reply = match command {
            Command::Register => match nickname_payload(&envelope, source) {
                Some(nickname) => self.register(nickname, source).await,
                None => return,
            },
            Command::Deregister => match nickname_payload(&envelope, source) {
                Some(nickname) => self.deregister(nickname, source).await,
                None => return,
            },
            Command::Message { to } => self.forward(to, envelope.payload).await,
            Command::Update | Command::Reply => {
                tracing::debug!(%source, command = %envelope.command, "server ignores peer-bound command");
                None
            }
        };

        if let Some(reply) = reply {
            self.reply(reply, source).await;
        }
    }
}

fn nickname_payload(envelope: &Envelope, source: SocketAddr) -> Option<&str> {
    let nickname = envelope.payload.as_str();
    if nickname.is_none() {
        tracing::debug!(%source, payload = %envelope.payload, "nickname payload is not a string");
    }
    nickname
}

/// Wire a directory server onto `channel`. Spawn `Dispatcher::run` to serve.
pub fn server(
    channel: Arc<ReliableChannel>,
    config: DispatchConfig,
    shutdown: broadcast::Receiver<()>,
) -> (Arc<Directory>, Dispatcher) {
    let directory = Arc::new(Directory::new(channel.clone()));
    let handler = Arc::new(ServerHandler::new(directory.clone(), channel.clone()));
    let dispatcher = Dispatcher::new(channel, handler, config, shutdown);
    (directory, dispatcher)
}
