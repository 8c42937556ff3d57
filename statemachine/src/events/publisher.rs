//! Event publishers

use std::sync::{Arc, Mutex};

use tokio::sync::{mpsc, oneshot};

use super::{EventBusError, EventBusResult};

/// An event in flight, acknowledged once the bus loop has taken it.
pub(crate) struct Envelope<E> {
    pub(crate) event: Arc<E>,
    pub(crate) ack: oneshot::Sender<()>,
}

/// Single delivery channel owned by one event source.
pub struct Publisher<E> {
    name: String,
    tx: mpsc::Sender<Envelope<E>>,
    rx: Mutex<Option<mpsc::Receiver<Envelope<E>>>>,
}

impl<E: Send + Sync + 'static> Publisher<E> {
    pub fn new(name: impl Into<String>) -> Self {
        let (tx, rx) = mpsc::channel(1);
        Self {
            name: name.into(),
            tx,
            rx: Mutex::new(Some(rx)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Hand `event` to the bus, waiting until the bus loop has received it.
    pub async fn publish_event(&self, event: E) -> EventBusResult<()> {
        let (ack, acked) = oneshot::channel();
        self.tx
            .send(Envelope {
                event: Arc::new(event),
                ack,
            })
            .await
            .map_err(|_| EventBusError::ChannelClosed)?;
        acked.await.map_err(|_| EventBusError::ChannelClosed)
    }

    /// Receiving end, claimed by the bus this publisher is attached to.
    pub(crate) fn take_receiver(&self) -> EventBusResult<mpsc::Receiver<Envelope<E>>> {
        self.rx
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .take()
            .ok_or_else(|| EventBusError::AlreadyAttached(self.name.clone()))
    }
}

impl<E> std::fmt::Debug for Publisher<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Publisher").field("name", &self.name).finish()
    }
}
