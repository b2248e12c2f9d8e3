//! Parley integration test harness.
//!
//! Tests run a directory server and several peers inside one process, wired
//! together over `SimNetwork` so loss, corruption, delay and crashed nodes can
//! be injected. Timeouts are exercised on tokio's paused clock:
//!
//!   cargo test --test integration
//!
//! `udp.rs` repeats the basic flow over real loopback sockets.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::sync::{broadcast, mpsc};

use parley_core::config::{ClientConfig, DispatchConfig, TransportConfig};
use parley_core::snapshot::DirectorySnapshot;
use parley_core::wire::{self, Unit};
use parley_services::{
    server, Directory, Fate, PeerEvent, PeerNode, ReliableChannel, SimNetwork, UnitKind,
};

mod failures;
mod mailbox;
mod scenario;
mod udp;

// ── Harness ───────────────────────────────────────────────────────────────────

pub const SERVER_PORT: u16 = 50000;

/// How long a helper waits for an event before failing the test.
pub const EVENT_TIMEOUT: Duration = Duration::from_secs(30);

pub fn addr(port: u16) -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], port))
}

/// A directory server on a simulated network. Peers are added with `peer`.
pub struct Cluster {
    pub net: SimNetwork,
    pub directory: Arc<Directory>,
    shutdown: broadcast::Sender<()>,
}

impl Cluster {
    pub fn start() -> Result<Self> {
        let net = SimNetwork::new();
        let (shutdown, shutdown_rx) = broadcast::channel(1);

        let socket = net.bind(addr(SERVER_PORT)).context("bind server")?;
        let channel = Arc::new(ReliableChannel::new(Arc::new(socket), TransportConfig::default())?);
        let (directory, dispatcher) = server(channel, DispatchConfig::default(), shutdown_rx);
        tokio::spawn(dispatcher.run());

        Ok(Self {
            net,
            directory,
            shutdown,
        })
    }

    pub fn server_addr(&self) -> SocketAddr {
        addr(SERVER_PORT)
    }

    pub fn peer(&self, port: u16) -> Result<Peer> {
        let socket = self.net.bind(addr(port)).with_context(|| format!("bind peer {port}"))?;
        let channel = Arc::new(ReliableChannel::new(Arc::new(socket), TransportConfig::default())?);

        // Peer handlers never wait on the network; one worker keeps the
        // event order identical to the arrival order.
        let dispatch = DispatchConfig {
            workers: 1,
            ..DispatchConfig::default()
        };
        let (node, dispatcher, events) = PeerNode::start(
            channel,
            self.server_addr(),
            &ClientConfig::default(),
            dispatch,
            self.shutdown.subscribe(),
        );
        tokio::spawn(dispatcher.run());
        Ok(Peer { node, events })
    }

    /// Commands of the data units the network delivered from `from` to `to`,
    /// in send order.
    pub fn delivered_commands(&self, from: SocketAddr, to: SocketAddr) -> Vec<(String, serde_json::Value)> {
        self.net
            .transmissions()
            .into_iter()
            .filter(|t| t.from == from && t.to == to && t.kind == UnitKind::Data && t.fate == Fate::Delivered)
            .filter_map(|t| match wire::decode(&t.bytes) {
                Ok(Unit::Data(envelope)) => Some((envelope.command, envelope.payload)),
                _ => None,
            })
            .collect()
    }
}

pub struct Peer {
    pub node: PeerNode,
    pub events: mpsc::UnboundedReceiver<PeerEvent>,
}

impl Peer {
    pub async fn next_event(&mut self) -> Result<PeerEvent> {
        match tokio::time::timeout(EVENT_TIMEOUT, self.events.recv()).await {
            Ok(Some(event)) => Ok(event),
            Ok(None) => bail!("peer event stream closed"),
            Err(_) => bail!("no peer event within {EVENT_TIMEOUT:?}"),
        }
    }

    /// Next chat message, skipping directory updates.
    pub async fn next_message(&mut self) -> Result<(String, String)> {
        loop {
            if let PeerEvent::Message { from, text } = self.next_event().await? {
                return Ok((from, text));
            }
        }
    }

    /// Next directory update, skipping chat messages.
    pub async fn next_snapshot(&mut self) -> Result<DirectorySnapshot> {
        loop {
            if let PeerEvent::DirectoryChanged(snapshot) = self.next_event().await? {
                return Ok(snapshot);
            }
        }
    }

    /// Events already delivered, without waiting.
    pub fn pending_events(&mut self) -> Vec<PeerEvent> {
        std::iter::from_fn(|| self.events.try_recv().ok()).collect()
    }
}

/// Let in-flight handlers finish.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}

/// Nicknames in a snapshot with their presence, in name order.
pub fn presences(snapshot: &DirectorySnapshot) -> Vec<(String, parley_core::Presence)> {
    snapshot
        .entries
        .iter()
        .map(|(n, e)| (n.clone(), e.presence))
        .collect()
}

// ── Tests ─────────────────────────────────────────────────────────────────────

/// Server and peers come up and the registrant sees itself in the directory.
#[tokio::test(start_paused = true)]
async fn test_cluster_boots() -> Result<()> {
    let cluster = Cluster::start()?;
    let mut alice = cluster.peer(51000)?;

    alice.node.register("alice").await?;
    let snapshot = alice.next_snapshot().await?;

    assert_eq!(snapshot.get("alice").map(|e| e.endpoint), Some(addr(51000)));
    assert_eq!(cluster.directory.snapshot().await, snapshot);
    Ok(())
}
