//! Reliable channel: stop-and-wait delivery over an unreliable datagram
//! endpoint.
//!
//! `send` transmits one envelope and waits for the matching `ACK:<sequence>`,
//! retransmitting the identical datagram after every `ack_timeout` until
//! `max_attempts` transmissions have gone out. At most one envelope per
//! destination is unacknowledged at any time; concurrent sends to the same
//! destination queue on a per-destination lane.
//!
//! `receive` is the only reader of the socket. It verifies digests, emits
//! ACKs, routes inbound ACKs to the waiting `send`, and suppresses
//! retransmissions of the envelope it last accepted from each source.
//! A `send` therefore only completes while some task is driving `receive`
//! (the node's dispatcher). A caller that may have to refuse an envelope
//! uses `receive_unacknowledged` and `accept` instead, so that nothing is
//! ACKed before it has somewhere to go.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use serde_json::Value;
use tokio::net::UdpSocket;
use tokio::sync::{oneshot, Mutex};

use parley_core::config::TransportConfig;
use parley_core::wire::{self, Envelope, Unit, WireError};

use crate::transport::Datagram;

/// Outcome of a reliable send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// The destination acknowledged after `attempts` transmissions.
    Delivered { attempts: u32 },
    /// No acknowledgment after `attempts` transmissions.
    TimedOut { attempts: u32 },
}

impl Delivery {
    pub fn is_delivered(&self) -> bool {
        matches!(self, Delivery::Delivered { .. })
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("channel I/O failed: {0}")]
    Io(#[from] io::Error),

    #[error(transparent)]
    Wire(#[from] WireError),

    #[error("channel closed")]
    Closed,
}

struct PendingAck {
    sequence: u64,
    notify: oneshot::Sender<()>,
}

pub struct ReliableChannel {
    socket: Arc<dyn Datagram>,
    local_addr: SocketAddr,
    config: TransportConfig,
    next_sequence: AtomicU64,
    /// destination -> the one envelope awaiting its ACK.
    pending: DashMap<SocketAddr, PendingAck>,
    /// destination -> stop-and-wait lane.
    lanes: DashMap<SocketAddr, Arc<Mutex<()>>>,
    /// source -> sequence of the last envelope handed to the caller.
    last_accepted: DashMap<SocketAddr, u64>,
    closed: AtomicBool,
}

impl std::fmt::Debug for ReliableChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ReliableChannel({})", self.local_addr)
    }
}

impl ReliableChannel {
    /// Bind a UDP socket and wrap it.
    pub async fn bind(addr: SocketAddr, config: TransportConfig) -> Result<Self, ChannelError> {
        let socket = UdpSocket::bind(addr).await?;
        Self::new(Arc::new(socket), config)
    }

    /// Wrap an already-bound datagram endpoint.
    pub fn new(socket: Arc<dyn Datagram>, config: TransportConfig) -> Result<Self, ChannelError> {
        let local_addr = socket.local_addr()?;
        // Random start so a restarted node does not reuse the sequence its
        // peers last accepted from this address.
        let first_sequence = u64::from(rand::random::<u32>());

        Ok(Self {
            socket,
            local_addr,
            config,
            next_sequence: AtomicU64::new(first_sequence),
            pending: DashMap::new(),
            lanes: DashMap::new(),
            last_accepted: DashMap::new(),
            closed: AtomicBool::new(false),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    /// Stop the channel. `receive` returns `Closed` within one poll interval,
    /// new sends are refused; sends already in their retry loop run to the end.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Deliver `payload` under `command` to `destination`.
    ///
    /// Suspends the caller for up to `ack_timeout × max_attempts`.
    /// `Err` is reserved for local failures (encoding, closed channel);
    /// an unreachable destination is `Ok(Delivery::TimedOut)`.
    pub async fn send(
        &self,
        command: &str,
        payload: Value,
        destination: SocketAddr,
    ) -> Result<Delivery, ChannelError> {
        if self.is_closed() {
            return Err(ChannelError::Closed);
        }

        let lane = self.lanes.entry(destination).or_default().clone();
        let _turn = lane.lock().await;

        let sequence = self.next_sequence.fetch_add(1, Ordering::Relaxed);
        let datagram = Envelope::new(sequence, command, payload).encode()?;

        let (notify, mut acked) = oneshot::channel();
        self.pending.insert(destination, PendingAck { sequence, notify });

        let delivery = self
            .transmit_until_acked(&datagram, destination, sequence, &mut acked)
            .await;

        self.pending
            .remove_if(&destination, |_, p| p.sequence == sequence);

        match delivery {
            Delivery::Delivered { attempts } => {
                tracing::debug!(%destination, sequence, command, attempts, "envelope delivered");
            }
            Delivery::TimedOut { attempts } => {
                tracing::warn!(%destination, sequence, command, attempts, "no acknowledgment, giving up");
            }
        }
        Ok(delivery)
    }

    async fn transmit_until_acked(
        &self,
        datagram: &[u8],
        destination: SocketAddr,
        sequence: u64,
        acked: &mut oneshot::Receiver<()>,
    ) -> Delivery {
        let max_attempts = self.config.max_attempts.max(1);

        for attempt in 1..=max_attempts {
            if let Err(e) = self.socket.send_to(datagram, destination).await {
                // Counts as a lost transmission.
                tracing::warn!(%destination, sequence, attempt, error = %e, "send_to failed");
            }

            match tokio::time::timeout(self.config.ack_timeout(), &mut *acked).await {
                Ok(Ok(())) => return Delivery::Delivered { attempts: attempt },
                Ok(Err(_)) => {
                    tracing::warn!(%destination, sequence, "pending ACK slot lost");
                    return Delivery::TimedOut { attempts: attempt };
                }
                Err(_) => {
                    tracing::trace!(%destination, sequence, attempt, "ACK timeout");
                }
            }
        }

        Delivery::TimedOut {
            attempts: max_attempts,
        }
    }

    /// Wait for the next verified data envelope and acknowledge it.
    ///
    /// Corrupt and malformed datagrams are dropped without an ACK so the
    /// sender retransmits. ACKs are consumed here. A retransmission of the
    /// envelope last accepted from the same source is re-ACKed but not
    /// returned again. Only returns `Err` once the channel is closed.
    pub async fn receive(&self) -> Result<(Envelope, SocketAddr), ChannelError> {
        let (envelope, source) = self.receive_unacknowledged().await?;
        self.accept(&envelope, source).await;
        Ok((envelope, source))
    }

    /// Like `receive`, but the envelope is neither ACKed nor recorded as
    /// accepted. Pass it to `accept` once it has been taken on; an envelope
    /// that is dropped instead is retransmitted by its sender.
    pub async fn receive_unacknowledged(&self) -> Result<(Envelope, SocketAddr), ChannelError> {
        let mut buf = vec![0u8; self.config.max_datagram_bytes];

        loop {
            if self.is_closed() {
                return Err(ChannelError::Closed);
            }

            let received = tokio::time::timeout(
                self.config.poll_interval(),
                self.socket.recv_from(&mut buf),
            )
            .await;

            let (len, source) = match received {
                Err(_) => continue,
                Ok(Err(e)) => {
                    tracing::warn!(error = %e, "recv_from failed");
                    continue;
                }
                Ok(Ok(r)) => r,
            };

            match wire::decode(&buf[..len]) {
                Ok(Unit::Ack(sequence)) => self.on_ack(source, sequence),
                Ok(Unit::Data(envelope)) => {
                    if self.is_duplicate(source, envelope.sequence) {
                        self.acknowledge(envelope.sequence, source).await;
                        tracing::debug!(
                            %source,
                            sequence = envelope.sequence,
                            "duplicate envelope re-acknowledged, not delivered"
                        );
                        continue;
                    }

                    tracing::trace!(%source, sequence = envelope.sequence, command = %envelope.command, "envelope received");
                    return Ok((envelope, source));
                }
                Err(WireError::IntegrityMismatch { .. }) => {
                    tracing::debug!(%source, len, "integrity digest mismatch, discarding");
                }
                Err(e) => {
                    tracing::debug!(%source, len, error = %e, "malformed datagram, discarding");
                }
            }
        }
    }

    /// Take responsibility for an envelope from `receive_unacknowledged`:
    /// later retransmissions of it are suppressed and the sender is ACKed.
    pub async fn accept(&self, envelope: &Envelope, source: SocketAddr) {
        self.last_accepted.insert(source, envelope.sequence);
        self.acknowledge(envelope.sequence, source).await;
    }

    async fn acknowledge(&self, sequence: u64, source: SocketAddr) {
        if let Err(e) = self.socket.send_to(&wire::encode_ack(sequence), source).await {
            tracing::warn!(%source, sequence, error = %e, "failed to send ACK");
        }
    }

    fn on_ack(&self, source: SocketAddr, sequence: Option<u64>) {
        let acked = self
            .pending
            .remove_if(&source, |_, p| sequence.map_or(true, |s| s == p.sequence));

        match acked {
            Some((_, pending)) => {
                let _ = pending.notify.send(());
            }
            None => {
                tracing::trace!(%source, ?sequence, "stale or unexpected ACK");
            }
        }
    }

    fn is_duplicate(&self, source: SocketAddr, sequence: u64) -> bool {
        self.last_accepted
            .get(&source)
            .is_some_and(|last| *last == sequence)
    }
}
