//! Mailbox: per-nickname FIFO of payloads awaiting delivery.
//!
//! Owned by the directory and only touched under its lock. While a queue is
//! draining, new messages for that nickname must be appended here rather than
//! sent directly, otherwise they would overtake the queued ones.

use std::collections::{HashMap, HashSet, VecDeque};

use serde_json::Value;

#[derive(Debug, Default)]
pub struct Mailbox {
    queues: HashMap<String, VecDeque<Value>>,
    draining: HashSet<String>,
}

impl Mailbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&mut self, nickname: &str, payload: Value) {
        self.queues
            .entry(nickname.to_string())
            .or_default()
            .push_back(payload);
    }

    /// Messages waiting for `nickname`.
    pub fn len(&self, nickname: &str) -> usize {
        self.queues.get(nickname).map(VecDeque::len).unwrap_or(0)
    }

    /// Messages waiting across all nicknames.
    pub fn total(&self) -> usize {
        self.queues.values().map(VecDeque::len).sum()
    }

    /// Queued payloads for `nickname`, oldest first.
    pub fn pending(&self, nickname: &str) -> impl Iterator<Item = &Value> {
        self.queues.get(nickname).into_iter().flatten()
    }

    pub fn is_draining(&self, nickname: &str) -> bool {
        self.draining.contains(nickname)
    }

    /// Mark `nickname` as draining. False if a drain is already running.
    pub fn start_draining(&mut self, nickname: &str) -> bool {
        self.draining.insert(nickname.to_string())
    }

    /// Pop the oldest payload for a drain in progress. When the queue is
    /// empty the drain is finished and the draining mark is cleared.
    pub fn next_for_drain(&mut self, nickname: &str) -> Option<Value> {
        let next = self.queues.get_mut(nickname).and_then(VecDeque::pop_front);
        if next.is_none() {
            self.queues.remove(nickname);
            self.draining.remove(nickname);
        }
        next
    }

    /// Put a payload that could not be delivered back at the head of the
    /// queue and end the drain.
    pub fn requeue_front(&mut self, nickname: &str, payload: Value) {
        self.queues
            .entry(nickname.to_string())
            .or_default()
            .push_front(payload);
        self.draining.remove(nickname);
    }

    pub fn stop_draining(&mut self, nickname: &str) {
        self.draining.remove(nickname);
    }
}
