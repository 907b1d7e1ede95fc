//! In-process broker for tests and demo mode
//!
//! [`MemoryBroker`] keeps every topic as a fixed set of partitions, routes
//! messages by hashing their key, and tracks consumer groups with a read
//! position and a committed offset per partition. A group that loses all
//! of its members resumes from its committed offsets when a new member
//! subscribes, so uncommitted messages are redelivered the same way Kafka
//! redelivers them after a crash.
//!
//! Failures can be injected to exercise the error paths of the pipeline:
//! failed deliveries, failed subscriptions, failed commits and arbitrary
//! consume-time errors.
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use visitstream::broker::{Broker, BrokerConsumer, BrokerProducer, MemoryBroker, PollOutcome};
//!
//! # #[tokio::main]
//! # async fn main() {
//! let broker = MemoryBroker::new(2);
//! let producer = broker.producer().unwrap();
//! producer.send("visits", "10.0.0.1", b"payload").await.unwrap();
//!
//! let mut consumer = broker.consumer("group", true).unwrap();
//! consumer.subscribe("visits").unwrap();
//! match consumer.poll(Duration::from_millis(50)).await {
//!     PollOutcome::Message(m) => assert_eq!(m.payload.as_deref(), Some(&b"payload"[..])),
//!     other => panic!("unexpected poll outcome: {:?}", other),
//! }
//! # }
//! ```

use async_trait::async_trait;
use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, VecDeque};
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

use super::{
    Broker, BrokerConsumer, BrokerError, BrokerProducer, ConsumedMessage, Delivery, PollOutcome,
};

const DEFAULT_PARTITIONS: usize = 3;

#[derive(Debug, Clone)]
struct Record {
    key: Vec<u8>,
    payload: Vec<u8>,
}

#[derive(Debug, Default)]
struct GroupState {
    positions: Vec<i64>,
    committed: Vec<i64>,
    members: usize,
    commit_attempts: usize,
}

#[derive(Debug, Default)]
struct State {
    topics: HashMap<String, Vec<Vec<Record>>>,
    groups: HashMap<(String, String), GroupState>,
    failing_deliveries: usize,
    failing_subscriptions: usize,
    failing_commits: bool,
    injected: VecDeque<PollOutcome>,
}

impl State {
    fn topic_mut(&mut self, topic: &str, partitions: usize) -> &mut Vec<Vec<Record>> {
        self.topics
            .entry(topic.to_string())
            .or_insert_with(|| vec![Vec::new(); partitions])
    }
}

/// In-process broker shared by producers and consumers through cheap clones.
#[derive(Debug, Clone)]
pub struct MemoryBroker {
    partitions: usize,
    state: Arc<Mutex<State>>,
    notify: Arc<Notify>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new(DEFAULT_PARTITIONS)
    }
}

impl MemoryBroker {
    /// Creates a broker whose topics have `partitions` partitions (at least one).
    pub fn new(partitions: usize) -> Self {
        Self {
            partitions: partitions.max(1),
            state: Arc::new(Mutex::new(State::default())),
            notify: Arc::new(Notify::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Partition a key is routed to.
    pub fn partition_for(&self, key: &str) -> i32 {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() % self.partitions as u64) as i32
    }

    /// Makes the next `count` sends fail with `BrokerError::Delivery`.
    pub fn fail_next_deliveries(&self, count: usize) {
        self.lock().failing_deliveries = count;
    }

    /// Makes the next `count` subscriptions fail.
    pub fn fail_next_subscriptions(&self, count: usize) {
        self.lock().failing_subscriptions = count;
    }

    /// Makes every commit fail while `failing` is true.
    pub fn fail_commits(&self, failing: bool) {
        self.lock().failing_commits = failing;
    }

    /// Queues an error for the next poll of any consumer.
    pub fn inject_error(&self, error: BrokerError) {
        self.inject(PollOutcome::Error(error));
    }

    /// Queues a client event the loop should skip, such as a rebalance notice.
    pub fn inject_ignored(&self, event: &str) {
        self.inject(PollOutcome::Ignored(event.to_string()));
    }

    fn inject(&self, outcome: PollOutcome) {
        self.lock().injected.push_back(outcome);
        self.notify.notify_waiters();
    }

    /// Number of messages stored in `topic` across all partitions.
    pub fn message_count(&self, topic: &str) -> usize {
        self.lock()
            .topics
            .get(topic)
            .map(|partitions| partitions.iter().map(Vec::len).sum())
            .unwrap_or(0)
    }

    /// Number of commit attempts made by `group` on `topic`.
    pub fn commit_attempts(&self, group: &str, topic: &str) -> usize {
        self.lock()
            .groups
            .get(&(group.to_string(), topic.to_string()))
            .map(|g| g.commit_attempts)
            .unwrap_or(0)
    }

    /// Sum of committed offsets of `group` on `topic`.
    pub fn committed_messages(&self, group: &str, topic: &str) -> i64 {
        self.lock()
            .groups
            .get(&(group.to_string(), topic.to_string()))
            .map(|g| g.committed.iter().sum())
            .unwrap_or(0)
    }
}

impl Broker for MemoryBroker {
    fn producer(&self) -> Result<Arc<dyn BrokerProducer>, BrokerError> {
        Ok(Arc::new(MemoryProducer {
            broker: self.clone(),
        }))
    }

    fn consumer(
        &self,
        group_id: &str,
        manual_commit: bool,
    ) -> Result<Box<dyn BrokerConsumer>, BrokerError> {
        Ok(Box::new(MemoryConsumer {
            broker: self.clone(),
            group_id: group_id.to_string(),
            manual_commit,
            topic: None,
            next_partition: 0,
        }))
    }
}

/// Producer half of [`MemoryBroker`]; confirms a message once it is stored.
pub struct MemoryProducer {
    broker: MemoryBroker,
}

#[async_trait]
impl BrokerProducer for MemoryProducer {
    async fn send(&self, topic: &str, key: &str, payload: &[u8]) -> Result<Delivery, BrokerError> {
        let partition = self.broker.partition_for(key);
        let delivery = {
            let mut state = self.broker.lock();
            if state.failing_deliveries > 0 {
                state.failing_deliveries -= 1;
                return Err(BrokerError::Delivery(
                    "broker rejected the message".to_string(),
                ));
            }

            let log = &mut state.topic_mut(topic, self.broker.partitions)[partition as usize];
            log.push(Record {
                key: key.as_bytes().to_vec(),
                payload: payload.to_vec(),
            });
            Delivery {
                partition,
                offset: (log.len() - 1) as i64,
            }
        };

        self.broker.notify.notify_waiters();
        Ok(delivery)
    }
}

/// Consumer half of [`MemoryBroker`], owned by one loop.
pub struct MemoryConsumer {
    broker: MemoryBroker,
    group_id: String,
    manual_commit: bool,
    topic: Option<String>,
    next_partition: usize,
}

impl MemoryConsumer {
    fn group_key(&self, topic: &str) -> (String, String) {
        (self.group_id.clone(), topic.to_string())
    }

    fn try_take(&mut self, topic: &str) -> Option<PollOutcome> {
        let key = self.group_key(topic);
        let mut guard = self.broker.lock();
        let state = &mut *guard;

        if let Some(outcome) = state.injected.pop_front() {
            return Some(outcome);
        }

        let log = state.topics.get(topic)?;
        let group = state.groups.get_mut(&key)?;
        let partitions = log.len();

        for i in 0..partitions {
            let p = (self.next_partition + i) % partitions;
            let position = group.positions[p];
            if let Some(record) = log[p].get(position as usize) {
                group.positions[p] += 1;
                if !self.manual_commit {
                    group.committed[p] = group.positions[p];
                }
                self.next_partition = (p + 1) % partitions;
                return Some(PollOutcome::Message(ConsumedMessage {
                    topic: topic.to_string(),
                    partition: p as i32,
                    offset: position,
                    key: Some(record.key.clone()),
                    payload: Some(record.payload.clone()),
                }));
            }
        }

        None
    }
}

#[async_trait]
impl BrokerConsumer for MemoryConsumer {
    fn subscribe(&mut self, topic: &str) -> Result<(), BrokerError> {
        let key = self.group_key(topic);
        let mut state = self.broker.lock();
        if state.failing_subscriptions > 0 {
            state.failing_subscriptions -= 1;
            return Err(BrokerError::Subscription(format!(
                "group {} could not join {}",
                self.group_id, topic
            )));
        }

        let partitions = state.topic_mut(topic, self.broker.partitions).len();
        let group = state.groups.entry(key).or_insert_with(|| GroupState {
            positions: vec![0; partitions],
            committed: vec![0; partitions],
            ..GroupState::default()
        });
        if group.members == 0 {
            group.positions = group.committed.clone();
        }
        group.members += 1;

        self.topic = Some(topic.to_string());
        Ok(())
    }

    async fn poll(&mut self, timeout: Duration) -> PollOutcome {
        let Some(topic) = self.topic.clone() else {
            tokio::time::sleep(timeout).await;
            return PollOutcome::Ignored("consumer is not subscribed".to_string());
        };

        let deadline = Instant::now() + timeout;
        let notify = Arc::clone(&self.broker.notify);
        loop {
            let notified = notify.notified();
            if let Some(outcome) = self.try_take(&topic) {
                return outcome;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return PollOutcome::Empty;
            }
        }
    }

    async fn commit(&mut self, offsets: &[(i32, i64)]) -> Result<(), BrokerError> {
        let Some(topic) = self.topic.clone() else {
            return Err(BrokerError::Commit("consumer is not subscribed".to_string()));
        };
        let key = self.group_key(&topic);
        let mut state = self.broker.lock();
        let failing = state.failing_commits;
        let group = state
            .groups
            .get_mut(&key)
            .ok_or_else(|| BrokerError::Commit("unknown consumer group".to_string()))?;

        group.commit_attempts += 1;
        if failing {
            return Err(BrokerError::Commit("coordinator not available".to_string()));
        }
        for &(partition, next) in offsets {
            let slot = usize::try_from(partition)
                .ok()
                .and_then(|p| group.committed.get_mut(p))
                .ok_or_else(|| {
                    BrokerError::Commit(format!("unknown partition {}", partition))
                })?;
            *slot = next;
        }
        Ok(())
    }

    fn close(&mut self) {
        if let Some(topic) = self.topic.take() {
            let key = self.group_key(&topic);
            if let Some(group) = self.broker.lock().groups.get_mut(&key) {
                group.members = group.members.saturating_sub(1);
            }
        }
    }
}
