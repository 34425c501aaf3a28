//! Durable event-log transport seam.
//!
//! Inbound events arrive over a partitioned log keyed by universal ID.
//! The broker itself is external; the pipeline consumes through the
//! `LogConsumer` trait. `MemoryEventLog` is the in-process implementation
//! used by tests, mock adapters, and the single-node server.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Mutex;

use sf_core::{Result, TimingError};

#[derive(Debug, Clone)]
pub struct LogMessage {
    pub key: Option<String>,
    pub payload: Vec<u8>,
    pub partition: u32,
    pub offset: u64,
}

pub trait LogConsumer: Send + Sync {
    fn partition_count(&self) -> u32;

    /// Next uncommitted-unpolled message of a partition, advancing the
    /// poll cursor. Polling is at-least-once: a crashed worker re-polls
    /// from the committed offset on restart.
    fn poll(&self, partition: u32) -> Result<Option<LogMessage>>;

    /// Mark everything up to and including `offset` as processed.
    fn commit(&self, partition: u32, offset: u64) -> Result<()>;
}

#[derive(Default)]
struct PartitionState {
    messages: Vec<(Option<String>, Vec<u8>)>,
    cursor: usize,
    committed: Option<u64>,
}

pub struct MemoryEventLog {
    partitions: Vec<Mutex<PartitionState>>,
}

impl MemoryEventLog {
    pub fn new(partition_count: u32) -> Self {
        let partitions = (0..partition_count.max(1))
            .map(|_| Mutex::new(PartitionState::default()))
            .collect();
        Self { partitions }
    }

    /// Publish keyed by routing key; the same key always lands on the same
    /// partition, preserving per-recipient order.
    pub fn publish(&self, key: Option<&str>, payload: &[u8]) -> (u32, u64) {
        let partition = match key {
            Some(k) => {
                let mut hasher = DefaultHasher::new();
                k.hash(&mut hasher);
                (hasher.finish() % self.partitions.len() as u64) as u32
            }
            None => 0,
        };
        let offset = self.publish_to(partition, key, payload);
        (partition, offset)
    }

    pub fn publish_to(&self, partition: u32, key: Option<&str>, payload: &[u8]) -> u64 {
        let mut state = self.partitions[partition as usize].lock().unwrap();
        state
            .messages
            .push((key.map(str::to_string), payload.to_vec()));
        (state.messages.len() - 1) as u64
    }

    pub fn committed(&self, partition: u32) -> Option<u64> {
        self.partitions[partition as usize].lock().unwrap().committed
    }

    pub fn backlog(&self, partition: u32) -> usize {
        let state = self.partitions[partition as usize].lock().unwrap();
        state.messages.len() - state.cursor
    }
}

impl LogConsumer for MemoryEventLog {
    fn partition_count(&self) -> u32 {
        self.partitions.len() as u32
    }

    fn poll(&self, partition: u32) -> Result<Option<LogMessage>> {
        let state = self
            .partitions
            .get(partition as usize)
            .ok_or_else(|| TimingError::InvalidInput(format!("no partition {}", partition)))?;
        let mut state = state.lock().unwrap();
        if state.cursor >= state.messages.len() {
            return Ok(None);
        }
        let offset = state.cursor as u64;
        let (key, payload) = state.messages[state.cursor].clone();
        state.cursor += 1;
        Ok(Some(LogMessage {
            key,
            payload,
            partition,
            offset,
        }))
    }

    fn commit(&self, partition: u32, offset: u64) -> Result<()> {
        let state = self
            .partitions
            .get(partition as usize)
            .ok_or_else(|| TimingError::InvalidInput(format!("no partition {}", partition)))?;
        let mut state = state.lock().unwrap();
        // Commits are monotone.
        if state.committed.map(|c| offset > c).unwrap_or(true) {
            state.committed = Some(offset);
        }
        Ok(())
    }
}
