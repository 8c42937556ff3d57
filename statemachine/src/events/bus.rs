//! Event bus merging many publishers into many subscribers
//!
//! Each attached publisher gets a fan-in task that forwards into one shared
//! queue. The bus loop pulls one event at a time from that queue, acknowledges
//! it to its publisher, and spawns one task per subscriber.

use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::publisher::{Envelope, Publisher};
use super::{EventBusError, EventBusResult};

/// Capacity of the shared queue between fan-in tasks and the bus loop
const QUEUE_CAPACITY: usize = 64;

/// Consumer of bus events
#[async_trait]
pub trait Subscriber<E>: Send + Sync {
    /// Name used in logs
    fn name(&self) -> &str;

    async fn consume_event(&self, event: Arc<E>) -> anyhow::Result<()>;
}

/// Shared reference to an EventBus
pub type SharedEventBus<E> = Arc<EventBus<E>>;

pub struct EventBus<E> {
    queue_tx: mpsc::Sender<Envelope<E>>,
    queue_rx: Mutex<Option<mpsc::Receiver<Envelope<E>>>>,
    subscribers: RwLock<Vec<Arc<dyn Subscriber<E>>>>,
}

impl<E: Send + Sync + 'static> EventBus<E> {
    pub fn new() -> Self {
        let (queue_tx, queue_rx) = mpsc::channel(QUEUE_CAPACITY);
        Self {
            queue_tx,
            queue_rx: Mutex::new(Some(queue_rx)),
            subscribers: RwLock::new(Vec::new()),
        }
    }

    /// Create a shared reference to this event bus
    pub fn shared(self) -> SharedEventBus<E> {
        Arc::new(self)
    }

    /// Register a subscriber for every subsequent event
    pub fn subscribe(&self, subscriber: Arc<dyn Subscriber<E>>) {
        info!(subscriber = subscriber.name(), "Subscriber registered");
        self.subscribers
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .push(subscriber);
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .len()
    }

    /// Start forwarding a publisher's events into the bus.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn add_publisher(&self, publisher: &Publisher<E>) -> EventBusResult<()> {
        let mut rx = publisher.take_receiver()?;
        let queue = self.queue_tx.clone();
        let name = publisher.name().to_string();

        tokio::spawn(async move {
            while let Some(envelope) = rx.recv().await {
                if queue.send(envelope).await.is_err() {
                    break;
                }
            }
            debug!(publisher = %name, "Fan-in task finished");
        });

        debug!(publisher = publisher.name(), "Publisher attached");
        Ok(())
    }

    /// Run the dispatch loop until `cancel` fires.
    pub async fn run(&self, cancel: CancellationToken) -> EventBusResult<()> {
        let mut rx = self
            .queue_rx
            .lock()
            .await
            .take()
            .ok_or(EventBusError::AlreadyRunning)?;

        info!("Event bus running");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                envelope = rx.recv() => {
                    let Some(Envelope { event, ack }) = envelope else { break };
                    let _ = ack.send(());
                    self.dispatch(event);
                }
            }
        }

        // allow a later run to resume from the same queue
        *self.queue_rx.lock().await = Some(rx);
        info!("Event bus stopped");
        Ok(())
    }

    /// Run the dispatch loop on its own task
    pub fn spawn(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<EventBusResult<()>> {
        let bus = Arc::clone(self);
        tokio::spawn(async move { bus.run(cancel).await })
    }

    fn dispatch(&self, event: Arc<E>) {
        let subscribers = self
            .subscribers
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .clone();

        for subscriber in subscribers {
            let event = Arc::clone(&event);
            tokio::spawn(async move {
                if let Err(e) = subscriber.consume_event(event).await {
                    warn!(subscriber = subscriber.name(), error = %format!("{e:#}"), "Subscriber failed");
                }
            });
        }
    }
}

impl<E: Send + Sync + 'static> Default for EventBus<E> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    struct Recorder {
        name: String,
        seen: mpsc::UnboundedSender<(String, u32)>,
    }

    #[async_trait]
    impl Subscriber<u32> for Recorder {
        fn name(&self) -> &str {
            &self.name
        }

        async fn consume_event(&self, event: Arc<u32>) -> anyhow::Result<()> {
            let _ = self.seen.send((self.name.clone(), *event));
            Ok(())
        }
    }

    struct Failing;

    #[async_trait]
    impl Subscriber<u32> for Failing {
        fn name(&self) -> &str {
            "failing"
        }

        async fn consume_event(&self, _event: Arc<u32>) -> anyhow::Result<()> {
            anyhow::bail!("always fails")
        }
    }

    fn recorder(name: &str) -> (Arc<Recorder>, mpsc::UnboundedReceiver<(String, u32)>) {
        let (seen, rx) = mpsc::unbounded_channel();
        (
            Arc::new(Recorder {
                name: name.to_string(),
                seen,
            }),
            rx,
        )
    }

    #[tokio::test]
    async fn test_publish_waits_for_bus() {
        let bus = EventBus::<u32>::new().shared();
        let publisher = Publisher::new("db-1");
        bus.add_publisher(&publisher).unwrap();

        // no loop running yet: the publisher is held back
        let pending = tokio::time::timeout(Duration::from_millis(50), publisher.publish_event(1)).await;
        assert!(pending.is_err());

        let cancel = CancellationToken::new();
        let handle = bus.spawn(cancel.clone());
        publisher.publish_event(2).await.unwrap();

        cancel.cancel();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_every_subscriber_receives_every_event() {
        let bus = EventBus::<u32>::new().shared();
        let (a, mut a_rx) = recorder("a");
        let (b, mut b_rx) = recorder("b");
        bus.subscribe(a);
        bus.subscribe(b);
        assert_eq!(bus.subscriber_count(), 2);

        let publisher = Publisher::new("db-1");
        bus.add_publisher(&publisher).unwrap();
        let cancel = CancellationToken::new();
        let handle = bus.spawn(cancel.clone());

        for n in 1..=3 {
            publisher.publish_event(n).await.unwrap();
        }

        let mut from_a = Vec::new();
        let mut from_b = Vec::new();
        for _ in 0..3 {
            from_a.push(a_rx.recv().await.unwrap().1);
            from_b.push(b_rx.recv().await.unwrap().1);
        }
        // current-thread runtime runs spawned tasks in order
        assert_eq!(from_a, vec![1, 2, 3]);
        assert_eq!(from_b, vec![1, 2, 3]);

        cancel.cancel();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_failing_subscriber_does_not_block_others() {
        let bus = EventBus::<u32>::new().shared();
        let (ok, mut ok_rx) = recorder("ok");
        bus.subscribe(Arc::new(Failing));
        bus.subscribe(ok);

        let publisher = Publisher::new("db-1");
        bus.add_publisher(&publisher).unwrap();
        let cancel = CancellationToken::new();
        let handle = bus.spawn(cancel.clone());

        publisher.publish_event(7).await.unwrap();
        publisher.publish_event(8).await.unwrap();

        assert_eq!(ok_rx.recv().await.unwrap().1, 7);
        assert_eq!(ok_rx.recv().await.unwrap().1, 8);

        cancel.cancel();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_publishers_merge_into_one_bus() {
        let bus = EventBus::<u32>::new().shared();
        let (rec, mut rx) = recorder("rec");
        bus.subscribe(rec);

        let first = Publisher::new("db-1");
        let second = Publisher::new("db-2");
        bus.add_publisher(&first).unwrap();
        bus.add_publisher(&second).unwrap();
        let cancel = CancellationToken::new();
        let handle = bus.spawn(cancel.clone());

        first.publish_event(1).await.unwrap();
        second.publish_event(2).await.unwrap();

        let mut got = vec![rx.recv().await.unwrap().1, rx.recv().await.unwrap().1];
        got.sort_unstable();
        assert_eq!(got, vec![1, 2]);

        cancel.cancel();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_publisher_attaches_once() {
        let first = EventBus::<u32>::new();
        let second = EventBus::<u32>::new();
        let publisher = Publisher::new("db-1");

        first.add_publisher(&publisher).unwrap();
        assert!(matches!(
            second.add_publisher(&publisher),
            Err(EventBusError::AlreadyAttached(name)) if name == "db-1"
        ));
    }

    #[tokio::test]
    async fn test_run_twice_concurrently_is_rejected() {
        let bus = EventBus::<u32>::new().shared();
        let cancel = CancellationToken::new();
        let handle = bus.spawn(cancel.clone());
        tokio::task::yield_now().await;

        assert!(matches!(
            bus.run(cancel.clone()).await,
            Err(EventBusError::AlreadyRunning)
        ));

        cancel.cancel();
        handle.await.unwrap().unwrap();
    }
}
