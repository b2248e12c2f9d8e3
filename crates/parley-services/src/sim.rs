//! Simulated datagram network: in-memory, with fault injection.
//!
//! Every socket bound on a [`SimNetwork`] can reach every other one. Faults are
//! applied per datagram at send time:
//!
//!   - [`FaultRule`]s drop or corrupt the next N matching datagrams
//!   - `set_down` makes an address unreachable (a crashed or partitioned node)
//!   - `set_delay` holds every datagram for a fixed time before delivery
//!
//! All datagrams are recorded so tests can count transmissions and ACKs.

use std::collections::HashSet;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use tokio::sync::mpsc;

use parley_core::wire::ACK;

use crate::transport::Datagram;

/// Whether a datagram carried data or an acknowledgment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitKind {
    Data,
    Ack,
}

impl UnitKind {
    fn of(datagram: &[u8]) -> Self {
        if datagram.starts_with(ACK.as_bytes()) {
            UnitKind::Ack
        } else {
            UnitKind::Data
        }
    }
}

/// What the network did with a datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fate {
    Delivered,
    Dropped,
    Corrupted,
}

/// One datagram handed to the network.
#[derive(Debug, Clone)]
pub struct Transmission {
    pub from: SocketAddr,
    pub to: SocketAddr,
    pub kind: UnitKind,
    pub fate: Fate,
    pub bytes: Bytes,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Action {
    Drop,
    Corrupt,
}

/// Drop or corrupt the next `remaining` datagrams matching the filters.
#[derive(Debug, Clone)]
pub struct FaultRule {
    action: Action,
    remaining: usize,
    from: Option<SocketAddr>,
    to: Option<SocketAddr>,
    kind: Option<UnitKind>,
}

impl FaultRule {
    pub fn drop(count: usize) -> Self {
        Self::new(Action::Drop, count)
    }

    /// Flip one bit in the middle of each matching datagram.
    pub fn corrupt(count: usize) -> Self {
        Self::new(Action::Corrupt, count)
    }

    fn new(action: Action, remaining: usize) -> Self {
        Self {
            action,
            remaining,
            from: None,
            to: None,
            kind: None,
        }
    }

    pub fn from(mut self, addr: SocketAddr) -> Self {
        self.from = Some(addr);
        self
    }

    pub fn to(mut self, addr: SocketAddr) -> Self {
        self.to = Some(addr);
        self
    }

    pub fn only(mut self, kind: UnitKind) -> Self {
        self.kind = Some(kind);
        self
    }

    fn matches(&self, from: SocketAddr, to: SocketAddr, kind: UnitKind) -> bool {
        self.remaining > 0
            && self.from.map_or(true, |f| f == from)
            && self.to.map_or(true, |t| t == to)
            && self.kind.map_or(true, |k| k == kind)
    }
}

type Inbox = mpsc::UnboundedSender<(Bytes, SocketAddr)>;

#[derive(Default)]
struct Inner {
    sockets: DashMap<SocketAddr, Inbox>,
    down: Mutex<HashSet<SocketAddr>>,
    rules: Mutex<Vec<FaultRule>>,
    delay: Mutex<Option<Duration>>,
    log: Mutex<Vec<Transmission>>,
    next_port: AtomicU16,
}

/// Handle to a shared in-memory network. Cheap to clone.
#[derive(Clone, Default)]
pub struct SimNetwork {
    inner: Arc<Inner>,
}

impl SimNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a socket. Port 0 picks a free port on the given host.
    pub fn bind(&self, addr: SocketAddr) -> io::Result<SimSocket> {
        let mut addr = addr;
        if addr.port() == 0 {
            let port = 40000 + self.inner.next_port.fetch_add(1, Ordering::Relaxed);
            addr.set_port(port);
        }

        let (tx, rx) = mpsc::unbounded_channel();
        match self.inner.sockets.entry(addr) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                return Err(io::Error::new(
                    io::ErrorKind::AddrInUse,
                    format!("{addr} already bound"),
                ))
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(tx);
            }
        }

        Ok(SimSocket {
            addr,
            network: self.clone(),
            rx: tokio::sync::Mutex::new(rx),
        })
    }

    pub fn inject(&self, rule: FaultRule) {
        lock(&self.inner.rules).push(rule);
    }

    /// Remove all pending fault rules.
    pub fn clear_faults(&self) {
        lock(&self.inner.rules).clear();
    }

    /// An address that is down neither sends nor receives anything.
    pub fn set_down(&self, addr: SocketAddr, down: bool) {
        let mut set = lock(&self.inner.down);
        if down {
            set.insert(addr);
        } else {
            set.remove(&addr);
        }
    }

    pub fn set_delay(&self, delay: Option<Duration>) {
        *lock(&self.inner.delay) = delay;
    }

    /// Every datagram handed to the network so far, in send order.
    pub fn transmissions(&self) -> Vec<Transmission> {
        lock(&self.inner.log).clone()
    }

    /// Count datagrams of `kind` sent from `from` to `to`, whatever their fate.
    pub fn count(&self, from: SocketAddr, to: SocketAddr, kind: UnitKind) -> usize {
        lock(&self.inner.log)
            .iter()
            .filter(|t| t.from == from && t.to == to && t.kind == kind)
            .count()
    }

    fn transmit(&self, from: SocketAddr, to: SocketAddr, buf: &[u8]) {
        let kind = UnitKind::of(buf);
        let mut bytes = buf.to_vec();

        let fate = if self.is_down(from) || self.is_down(to) {
            Fate::Dropped
        } else {
            match self.take_fault(from, to, kind) {
                Some(Action::Drop) => Fate::Dropped,
                Some(Action::Corrupt) => {
                    if let Some(byte) = bytes.get_mut(buf.len() / 2) {
                        *byte ^= 0b0000_0100;
                    }
                    Fate::Corrupted
                }
                None => Fate::Delivered,
            }
        };

        let bytes = Bytes::from(bytes);
        lock(&self.inner.log).push(Transmission {
            from,
            to,
            kind,
            fate,
            bytes: bytes.clone(),
        });

        if fate == Fate::Dropped {
            tracing::trace!(%from, %to, ?kind, "sim: datagram dropped");
            return;
        }

        let inbox = match self.inner.sockets.get(&to) {
            Some(tx) => tx.clone(),
            None => {
                tracing::trace!(%to, "sim: no socket bound, datagram lost");
                return;
            }
        };

        match *lock(&self.inner.delay) {
            Some(delay) => {
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ = inbox.send((bytes, from));
                });
            }
            None => {
                let _ = inbox.send((bytes, from));
            }
        }
    }

    fn is_down(&self, addr: SocketAddr) -> bool {
        lock(&self.inner.down).contains(&addr)
    }

    fn take_fault(&self, from: SocketAddr, to: SocketAddr, kind: UnitKind) -> Option<Action> {
        let mut rules = lock(&self.inner.rules);
        let rule = rules.iter_mut().find(|r| r.matches(from, to, kind))?;
        rule.remaining -= 1;
        let action = rule.action;
        rules.retain(|r| r.remaining > 0);
        Some(action)
    }

    fn unbind(&self, addr: SocketAddr) {
        self.inner.sockets.remove(&addr);
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// A socket bound on a [`SimNetwork`]. Unbinds on drop.
pub struct SimSocket {
    addr: SocketAddr,
    network: SimNetwork,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<(Bytes, SocketAddr)>>,
}

#[async_trait]
impl Datagram for SimSocket {
    async fn send_to(&self, buf: &[u8], target: SocketAddr) -> io::Result<usize> {
        self.network.transmit(self.addr, target, buf);
        Ok(buf.len())
    }

    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        let mut rx = self.rx.lock().await;
        match rx.recv().await {
            Some((bytes, from)) => {
                let len = bytes.len().min(buf.len());
                buf[..len].copy_from_slice(&bytes[..len]);
                Ok((len, from))
            }
            None => Err(io::Error::new(io::ErrorKind::BrokenPipe, "socket unbound")),
        }
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        Ok(self.addr)
    }
}

impl Drop for SimSocket {
    fn drop(&mut self) {
        self.network.unbind(self.addr);
    }
}
