use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use tracing::{debug, info, warn};

use courier_messaging::{BrokerError, Consumer, Delivery};

use crate::reconnect::ReconnectPolicy;

/// What to tell the broker once a delivery has been handled.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Disposition {
    /// Processing finished (or the message was deliberately dropped).
    Ack,
    /// Processing could not finish; make the message available again.
    Requeue,
}

/// Per-delivery logic run inside a consumption loop.
///
/// Handlers must be idempotent: the broker delivers at-least-once.
pub trait DeliveryHandler: Send + 'static {
    fn handle(&mut self, delivery: &Delivery) -> Disposition;

    /// Called whenever a receive tick elapses with nothing delivered.
    fn on_idle(&mut self) {}
}

/// Handle to control and join a background loop.
///
/// Dropping the handle without calling [`WorkerHandle::shutdown`] also stops the loop,
/// but does not wait for it.
#[derive(Debug)]
pub struct WorkerHandle {
    name: String,
    shutdown: mpsc::Sender<()>,
    join: Option<thread::JoinHandle<()>>,
}

impl WorkerHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Request graceful shutdown and wait for the loop to stop.
    pub fn shutdown(mut self) {
        self.stop_and_join();
    }

    /// Block until the loop exits on its own.
    pub fn join(mut self) {
        if let Some(j) = self.join.take() {
            let _ = j.join();
        }
    }

    fn stop_and_join(&mut self) {
        let _ = self.shutdown.send(());
        if let Some(j) = self.join.take() {
            let _ = j.join();
        }
    }
}

/// A set of identical loops draining the same queue (bounded concurrency).
#[derive(Debug, Default)]
pub struct WorkerGroup {
    handles: Vec<WorkerHandle>,
}

impl WorkerGroup {
    pub fn push(&mut self, handle: WorkerHandle) {
        self.handles.push(handle);
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Stop every loop and wait for all of them.
    pub fn shutdown(self) {
        for h in &self.handles {
            let _ = h.shutdown.send(());
        }
        for h in self.handles {
            h.join();
        }
    }

    /// Block until every loop exits on its own.
    pub fn join(self) {
        for h in self.handles {
            h.join();
        }
    }
}

/// Generic consumption loop.
///
/// - Opens a consumer through `open` (retried with backoff until it succeeds)
/// - Blocks on receive with a short tick so shutdown requests are observed
/// - Acks or requeues each delivery according to the handler's [`Disposition`]
/// - On connection loss, drops the consumer (the broker redelivers its unacked
///   messages) and reopens it
pub struct ConsumerLoop<O, H> {
    name: String,
    tick: Duration,
    reconnect: ReconnectPolicy,
    open: O,
    handler: H,
}

impl<O, H> ConsumerLoop<O, H>
where
    O: FnMut() -> Result<Box<dyn Consumer>, BrokerError> + Send + 'static,
    H: DeliveryHandler,
{
    pub fn new(name: impl Into<String>, open: O, handler: H) -> Self {
        Self {
            name: name.into(),
            tick: Duration::from_millis(100),
            reconnect: ReconnectPolicy::default(),
            open,
            handler,
        }
    }

    pub fn with_tick(mut self, tick: Duration) -> Self {
        self.tick = tick;
        self
    }

    pub fn with_reconnect(mut self, policy: ReconnectPolicy) -> Self {
        self.reconnect = policy;
        self
    }

    /// Spawn the loop on a named thread.
    pub fn spawn(self) -> std::io::Result<WorkerHandle> {
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
        let name = self.name.clone();

        let join = thread::Builder::new()
            .name(name.clone())
            .spawn(move || self.run(shutdown_rx))?;

        Ok(WorkerHandle {
            name,
            shutdown: shutdown_tx,
            join: Some(join),
        })
    }

    fn run(mut self, shutdown_rx: mpsc::Receiver<()>) {
        info!(worker = %self.name, "consumer loop started");
        let mut backoff = self.reconnect.backoff();

        'connect: loop {
            if shutdown_requested(&shutdown_rx) {
                break;
            }

            let mut consumer = match (self.open)() {
                Ok(c) => {
                    if backoff.failures() > 0 {
                        info!(worker = %self.name, queue = c.queue(), failures = backoff.failures(), "consumer re-established");
                    }
                    backoff.connected();
                    c
                }
                Err(err) => {
                    let delay = backoff.failed();
                    warn!(worker = %self.name, error = %err, failures = backoff.failures(), ?delay, "failed to open consumer; backing off");
                    if wait_or_shutdown(&shutdown_rx, delay) {
                        break;
                    }
                    continue;
                }
            };

            loop {
                if shutdown_requested(&shutdown_rx) {
                    break 'connect;
                }

                let delivery = match consumer.recv_timeout(self.tick) {
                    Ok(Some(d)) => d,
                    Ok(None) => {
                        self.handler.on_idle();
                        continue;
                    }
                    Err(err) => {
                        let delay = backoff.failed();
                        warn!(worker = %self.name, queue = consumer.queue(), error = %err, ?delay, "receive failed; reconnecting");
                        if wait_or_shutdown(&shutdown_rx, delay) {
                            break 'connect;
                        }
                        continue 'connect;
                    }
                };

                let settled = match self.handler.handle(&delivery) {
                    Disposition::Ack => consumer.ack(&delivery.tag),
                    Disposition::Requeue => consumer.nack(&delivery.tag, true),
                };

                if let Err(err) = settled {
                    warn!(worker = %self.name, tag = %delivery.tag, error = %err, "failed to settle delivery");
                    if err.is_connection_loss() {
                        if wait_or_shutdown(&shutdown_rx, backoff.failed()) {
                            break 'connect;
                        }
                        continue 'connect;
                    }
                } else {
                    debug!(worker = %self.name, tag = %delivery.tag, "delivery settled");
                }
            }
        }

        info!(worker = %self.name, "consumer loop stopped");
    }
}

/// `true` when shutdown was requested or the handle was dropped.
fn shutdown_requested(rx: &mpsc::Receiver<()>) -> bool {
    !matches!(rx.try_recv(), Err(mpsc::TryRecvError::Empty))
}

/// Sleep for `delay` unless shutdown arrives first; returns `true` on shutdown.
fn wait_or_shutdown(rx: &mpsc::Receiver<()>, delay: Duration) -> bool {
    !matches!(rx.recv_timeout(delay), Err(mpsc::RecvTimeoutError::Timeout))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    use courier_messaging::{Broker, InMemoryBroker, QueueSpec};

    struct Collect(Arc<Mutex<Vec<Vec<u8>>>>);

    impl DeliveryHandler for Collect {
        fn handle(&mut self, delivery: &Delivery) -> Disposition {
            self.0.lock().unwrap().push(delivery.body.clone());
            Disposition::Ack
        }
    }

    fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
        for _ in 0..200 {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(10));
        }
        false
    }

    #[test]
    fn loop_survives_connection_loss() {
        let broker = InMemoryBroker::new();
        broker.declare_queue(&QueueSpec::durable("work")).unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let b = broker.clone();
        let handle = ConsumerLoop::new("test-loop", move || b.consume("work"), Collect(seen.clone()))
            .with_tick(Duration::from_millis(10))
            .with_reconnect(ReconnectPolicy::fixed(Duration::from_millis(10)))
            .spawn()
            .unwrap();

        broker.publish("work", b"before".to_vec()).unwrap();
        assert!(wait_until(|| seen.lock().unwrap().len() == 1));

        broker.disconnect();
        thread::sleep(Duration::from_millis(50));
        broker.reconnect();

        broker.publish("work", b"after".to_vec()).unwrap();
        assert!(wait_until(|| seen.lock().unwrap().len() == 2));

        handle.shutdown();
        assert_eq!(broker.unacked_count("work"), 0);
    }

    #[test]
    fn dropping_handle_stops_loop() {
        let broker = InMemoryBroker::new();
        broker.declare_queue(&QueueSpec::durable("work")).unwrap();

        let b = broker.clone();
        let handle = ConsumerLoop::new("short-lived", move || b.consume("work"), Collect(Arc::default()))
            .with_tick(Duration::from_millis(10))
            .spawn()
            .unwrap();
        let join = {
            let mut h = handle;
            h.join.take().unwrap()
        };

        join.join().unwrap();
    }
}
