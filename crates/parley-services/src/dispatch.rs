//! Dispatcher: the per-node control loop.
//!
//! Owns the only receive loop on a channel and hands each verified envelope
//! to a fixed pool of handler workers through a bounded queue. The loop never
//! waits on a handler, so ACKs for the node's own sends keep flowing. An
//! envelope is only ACKed once a queue slot has been reserved for it; when
//! the queue is full it is left unacknowledged and the sender retransmits.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;

use parley_core::config::DispatchConfig;
use parley_core::wire::Envelope;

use crate::channel::{ChannelError, ReliableChannel};

/// Application logic for one node role.
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    /// Process one inbound envelope. May send on the channel and wait for ACKs.
    async fn handle(&self, envelope: Envelope, source: SocketAddr);
}

type Inbound = (Envelope, SocketAddr);

pub struct Dispatcher {
    channel: Arc<ReliableChannel>,
    handler: Arc<dyn Handler>,
    config: DispatchConfig,
    shutdown: broadcast::Receiver<()>,
}

impl Dispatcher {
    pub fn new(
        channel: Arc<ReliableChannel>,
        handler: Arc<dyn Handler>,
        config: DispatchConfig,
        shutdown: broadcast::Receiver<()>,
    ) -> Self {
        Self {
            channel,
            handler,
            config,
            shutdown,
        }
    }

    /// Run until shutdown is signalled or the channel is closed. In-flight
    /// handlers are cancelled on exit.
    pub async fn run(mut self) {
        let (queue_tx, queue_rx) = mpsc::channel::<Inbound>(self.config.queue_depth.max(1));
        let queue_rx = Arc::new(Mutex::new(queue_rx));

        let workers: Vec<JoinHandle<()>> = (0..self.config.workers.max(1))
            .map(|id| tokio::spawn(worker(id, queue_rx.clone(), self.handler.clone())))
            .collect();

        tracing::info!(
            addr = %self.channel.local_addr(),
            workers = workers.len(),
            queue_depth = self.config.queue_depth,
            "dispatcher started"
        );

        loop {
            tokio::select! {
                _ = self.shutdown.recv() => {
                    tracing::info!("dispatcher shutting down");
                    break;
                }

                received = self.channel.receive_unacknowledged() => match received {
                    Ok((envelope, source)) => match queue_tx.try_reserve() {
                        Ok(slot) => {
                            self.channel.accept(&envelope, source).await;
                            slot.send((envelope, source));
                        }
                        Err(mpsc::error::TrySendError::Full(())) => {
                            tracing::warn!(
                                %source,
                                sequence = envelope.sequence,
                                command = %envelope.command,
                                "handler queue full, leaving envelope unacknowledged"
                            );
                        }
                        Err(mpsc::error::TrySendError::Closed(())) => break,
                    },
                    Err(ChannelError::Closed) => {
                        tracing::info!("channel closed, dispatcher stopping");
                        break;
                    }
                    Err(e) => tracing::warn!(error = %e, "receive failed"),
                },
            }
        }

        self.channel.close();
        drop(queue_tx);
        for w in workers {
            w.abort();
        }
    }
}

async fn worker(id: usize, queue: Arc<Mutex<mpsc::Receiver<Inbound>>>, handler: Arc<dyn Handler>) {
    loop {
        let next = queue.lock().await.recv().await;
        let Some((envelope, source)) = next else {
            tracing::trace!(worker = id, "queue closed");
            return;
        };
        tracing::trace!(worker = id, %source, command = %envelope.command, "handling envelope");
        handler.handle(envelope, source).await;
    }
}
