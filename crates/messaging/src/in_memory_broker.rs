//! In-memory broker for tests/dev.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tracing::debug;

use crate::broker::{Broker, BrokerError, Consumer, Delivery, DeliveryTag, QueueSpec};

/// In-process broker with queue semantics.
///
/// - Each message goes to exactly one consumer of its queue
/// - Unacked deliveries are redelivered when their consumer is dropped, nacked with
///   requeue, or the connection is lost
/// - Exclusive queues are deleted on [`InMemoryBroker::disconnect`]
/// - Cloning shares the same broker
#[derive(Debug, Clone, Default)]
pub struct InMemoryBroker {
    shared: Arc<Shared>,
}

#[derive(Debug, Default)]
struct Shared {
    state: Mutex<State>,
    available: Condvar,
}

#[derive(Debug)]
struct State {
    connected: bool,
    /// Bumped on every disconnect; consumers opened in an older epoch are dead.
    epoch: u64,
    queues: HashMap<String, QueueState>,
    next_tag: u64,
    next_consumer: u64,
    next_exclusive: u64,
}

impl Default for State {
    fn default() -> Self {
        Self {
            connected: true,
            epoch: 0,
            queues: HashMap::new(),
            next_tag: 1,
            next_consumer: 1,
            next_exclusive: 1,
        }
    }
}

#[derive(Debug, Default)]
struct QueueState {
    exclusive: bool,
    ready: VecDeque<Stored>,
    /// tag -> (consumer id, message)
    unacked: HashMap<u64, (u64, Stored)>,
}

#[derive(Debug, Clone)]
struct Stored {
    body: Vec<u8>,
    redelivered: bool,
}

impl QueueState {
    fn requeue_where(&mut self, mut owned: impl FnMut(u64) -> bool) -> usize {
        let mut tags: Vec<u64> = self
            .unacked
            .iter()
            .filter(|(_, (consumer, _))| owned(*consumer))
            .map(|(tag, _)| *tag)
            .collect();
        tags.sort_unstable();

        // Front of the queue, oldest first.
        for tag in tags.iter().rev() {
            if let Some((_, mut msg)) = self.unacked.remove(tag) {
                msg.redelivered = true;
                self.ready.push_front(msg);
            }
        }
        tags.len()
    }
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, State>, BrokerError> {
        self.shared.state.lock().map_err(|_| BrokerError::Poisoned)
    }

    fn lock_connected(&self) -> Result<MutexGuard<'_, State>, BrokerError> {
        let state = self.lock()?;
        if !state.connected {
            return Err(BrokerError::Connection("broker unreachable".to_string()));
        }
        Ok(state)
    }

    /// Simulate losing the connection: exclusive queues vanish, every unacked delivery
    /// is requeued, open consumers fail, and all operations error until
    /// [`InMemoryBroker::reconnect`].
    pub fn disconnect(&self) {
        if let Ok(mut state) = self.lock() {
            state.connected = false;
            state.epoch += 1;
            state.queues.retain(|_, q| !q.exclusive);
            for queue in state.queues.values_mut() {
                queue.requeue_where(|_| true);
            }
        }
        self.shared.available.notify_all();
    }

    /// Make the broker reachable again after [`InMemoryBroker::disconnect`].
    pub fn reconnect(&self) {
        if let Ok(mut state) = self.lock() {
            state.connected = true;
        }
        self.shared.available.notify_all();
    }

    pub fn queue_exists(&self, queue: &str) -> bool {
        self.lock()
            .map(|s| s.queues.contains_key(queue))
            .unwrap_or(false)
    }

    /// Messages waiting to be delivered.
    pub fn ready_count(&self, queue: &str) -> usize {
        self.lock()
            .ok()
            .and_then(|s| s.queues.get(queue).map(|q| q.ready.len()))
            .unwrap_or(0)
    }

    /// Messages delivered but not yet acknowledged.
    pub fn unacked_count(&self, queue: &str) -> usize {
        self.lock()
            .ok()
            .and_then(|s| s.queues.get(queue).map(|q| q.unacked.len()))
            .unwrap_or(0)
    }
}

impl Broker for InMemoryBroker {
    fn declare_queue(&self, spec: &QueueSpec) -> Result<String, BrokerError> {
        let mut state = self.lock_connected()?;
        let name = match spec {
            QueueSpec::Durable { name } => {
                state.queues.entry(name.clone()).or_default();
                name.clone()
            }
            QueueSpec::Exclusive => {
                let name = format!("amq.gen-{}", state.next_exclusive);
                state.next_exclusive += 1;
                state.queues.insert(
                    name.clone(),
                    QueueState {
                        exclusive: true,
                        ..QueueState::default()
                    },
                );
                name
            }
        };
        Ok(name)
    }

    fn delete_queue(&self, queue: &str) -> Result<(), BrokerError> {
        let mut state = self.lock_connected()?;
        state.queues.remove(queue);
        drop(state);
        self.shared.available.notify_all();
        Ok(())
    }

    fn publish(&self, queue: &str, body: Vec<u8>) -> Result<(), BrokerError> {
        let mut state = self.lock_connected()?;
        match state.queues.get_mut(queue) {
            Some(q) => q.ready.push_back(Stored {
                body,
                redelivered: false,
            }),
            None => {
                debug!(queue, "unroutable publish dropped");
                return Ok(());
            }
        }
        drop(state);
        self.shared.available.notify_all();
        Ok(())
    }

    fn consume(&self, queue: &str) -> Result<Box<dyn Consumer>, BrokerError> {
        let mut state = self.lock_connected()?;
        if !state.queues.contains_key(queue) {
            return Err(BrokerError::QueueNotFound(queue.to_string()));
        }
        let id = state.next_consumer;
        state.next_consumer += 1;
        let epoch = state.epoch;

        Ok(Box::new(InMemoryConsumer {
            broker: self.clone(),
            queue: queue.to_string(),
            id,
            epoch,
        }))
    }
}

/// Consumer handle for [`InMemoryBroker`]. Dropping it requeues its unacked deliveries.
#[derive(Debug)]
pub struct InMemoryConsumer {
    broker: InMemoryBroker,
    queue: String,
    id: u64,
    epoch: u64,
}

impl InMemoryConsumer {
    fn check_live(&self, state: &State) -> Result<(), BrokerError> {
        if !state.connected || state.epoch != self.epoch {
            return Err(BrokerError::Connection("connection lost".to_string()));
        }
        if !state.queues.contains_key(&self.queue) {
            return Err(BrokerError::QueueNotFound(self.queue.clone()));
        }
        Ok(())
    }

    fn parse_tag(tag: &DeliveryTag) -> Result<u64, BrokerError> {
        tag.0
            .parse()
            .map_err(|_| BrokerError::UnknownDelivery(tag.clone()))
    }
}

impl Consumer for InMemoryConsumer {
    fn queue(&self) -> &str {
        &self.queue
    }

    fn recv_timeout(&mut self, timeout: Duration) -> Result<Option<Delivery>, BrokerError> {
        let deadline = Instant::now() + timeout;
        let mut state = self.broker.lock()?;

        loop {
            self.check_live(&state)?;

            let tag = state.next_tag;
            if let Some(q) = state.queues.get_mut(&self.queue) {
                if let Some(msg) = q.ready.pop_front() {
                    let delivery = Delivery {
                        tag: DeliveryTag(tag.to_string()),
                        body: msg.body.clone(),
                        redelivered: msg.redelivered,
                    };
                    q.unacked.insert(tag, (self.id, msg));
                    state.next_tag += 1;
                    return Ok(Some(delivery));
                }
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            let (guard, _) = self
                .broker
                .shared
                .available
                .wait_timeout(state, deadline - now)
                .map_err(|_| BrokerError::Poisoned)?;
            state = guard;
        }
    }

    fn ack(&mut self, tag: &DeliveryTag) -> Result<(), BrokerError> {
        let tag_num = Self::parse_tag(tag)?;
        let mut state = self.broker.lock()?;
        self.check_live(&state)?;

        let q = state
            .queues
            .get_mut(&self.queue)
            .ok_or_else(|| BrokerError::QueueNotFound(self.queue.clone()))?;
        match q.unacked.remove(&tag_num) {
            Some(_) => Ok(()),
            None => Err(BrokerError::UnknownDelivery(tag.clone())),
        }
    }

    fn nack(&mut self, tag: &DeliveryTag, requeue: bool) -> Result<(), BrokerError> {
        let tag_num = Self::parse_tag(tag)?;
        let mut state = self.broker.lock()?;
        self.check_live(&state)?;

        let q = state
            .queues
            .get_mut(&self.queue)
            .ok_or_else(|| BrokerError::QueueNotFound(self.queue.clone()))?;
        let (_, mut msg) = q
            .unacked
            .remove(&tag_num)
            .ok_or_else(|| BrokerError::UnknownDelivery(tag.clone()))?;
        if requeue {
            msg.redelivered = true;
            q.ready.push_back(msg);
        }
        drop(state);
        self.broker.shared.available.notify_all();
        Ok(())
    }
}

impl Drop for InMemoryConsumer {
    fn drop(&mut self) {
        let requeued = match self.broker.lock() {
            Ok(mut state) => {
                let id = self.id;
                state
                    .queues
                    .get_mut(&self.queue)
                    .map(|q| q.requeue_where(|consumer| consumer == id))
                    .unwrap_or(0)
            }
            Err(_) => 0,
        };
        if requeued > 0 {
            debug!(queue = %self.queue, requeued, "consumer dropped with unacked deliveries");
            self.broker.shared.available.notify_all();
        }
    }
}
