//! In-process broker backed by tokio channels.
//!
//! Queues live in a shared `DashMap`; each queue is a bounded mpsc channel
//! whose receiver is shared behind a `Mutex` so several worker sockets can
//! split a queue's traffic. Prefetch windows are `Semaphore` permits held
//! by unacknowledged deliveries, and request/reply pairs travel as an
//! embedded `oneshot` responder. Suitable for single-process deployments
//! and tests; an unacknowledged delivery that is dropped only releases its
//! permit -- redelivery is a real transport's concern.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::{mpsc, oneshot, watch, Mutex, Semaphore};
use tracing::debug;

use super::{
    AckHandle, Broker, BrokerContext, InboundRequest, PushSocket, ReplySocket, RequestSocket,
    WorkDelivery, WorkerSocket,
};
use crate::error::OrchestratorError;

/// Bounded depth of every in-process queue.
const QUEUE_DEPTH: usize = 256;

/// URL scheme this transport serves.
const URL_SCHEME: &str = "mem://";

/// One enqueued payload, optionally carrying a reply channel.
struct QueueItem {
    payload: Vec<u8>,
    responder: Option<oneshot::Sender<Vec<u8>>>,
}

/// Producer/consumer ends of a single named queue.
#[derive(Clone)]
struct QueueHandle {
    tx: mpsc::Sender<QueueItem>,
    rx: Arc<Mutex<mpsc::Receiver<QueueItem>>>,
}

/// The in-process broker. Cloning shares the queue table, so every
/// context connected to the same broker instance sees the same queues.
#[derive(Clone)]
pub struct MemoryBroker {
    queues: Arc<DashMap<String, QueueHandle>>,
}

impl MemoryBroker {
    /// Creates an empty broker.
    #[must_use]
    pub fn new() -> Self {
        Self {
            queues: Arc::new(DashMap::new()),
        }
    }

    fn queue(&self, name: &str) -> QueueHandle {
        self.queues
            .entry(name.to_string())
            .or_insert_with(|| {
                let (tx, rx) = mpsc::channel(QUEUE_DEPTH);
                QueueHandle {
                    tx,
                    rx: Arc::new(Mutex::new(rx)),
                }
            })
            .clone()
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn connect(&self, url: &str) -> Result<Arc<dyn BrokerContext>, OrchestratorError> {
        if !url.starts_with(URL_SCHEME) {
            return Err(OrchestratorError::connection(format!(
                "unsupported broker url: {url}"
            )));
        }
        let (closed, _) = watch::channel(false);
        debug!(url, "in-process broker context opened");
        Ok(Arc::new(MemoryContext {
            broker: self.clone(),
            closed,
        }))
    }
}

/// A connection to the in-process broker. Closing it flips a watch flag
/// observed by every socket opened from this context.
struct MemoryContext {
    broker: MemoryBroker,
    closed: watch::Sender<bool>,
}

impl std::fmt::Debug for MemoryContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryContext").finish_non_exhaustive()
    }
}

#[async_trait]
impl BrokerContext for MemoryContext {
    async fn request(&self, queue: &str) -> Result<Box<dyn RequestSocket>, OrchestratorError> {
        let handle = self.broker.queue(queue);
        Ok(Box::new(MemoryRequestSocket {
            tx: handle.tx,
            closed: self.closed.subscribe(),
        }))
    }

    async fn reply(&self, queue: &str) -> Result<Box<dyn ReplySocket>, OrchestratorError> {
        let handle = self.broker.queue(queue);
        Ok(Box::new(MemoryReplySocket {
            rx: handle.rx,
            closed: self.closed.subscribe(),
        }))
    }

    async fn push(&self, queue: &str) -> Result<Box<dyn PushSocket>, OrchestratorError> {
        let handle = self.broker.queue(queue);
        Ok(Box::new(MemoryPushSocket {
            tx: handle.tx,
            closed: self.closed.subscribe(),
        }))
    }

    async fn worker_pull(
        &self,
        queue: &str,
        prefetch: u16,
    ) -> Result<Box<dyn WorkerSocket>, OrchestratorError> {
        let handle = self.broker.queue(queue);
        let window = usize::from(prefetch.max(1));
        Ok(Box::new(MemoryWorkerSocket {
            rx: handle.rx,
            permits: Arc::new(Semaphore::new(window)),
            closed: self.closed.subscribe(),
        }))
    }

    async fn close(&self) {
        // The in-process transport completes the close synchronously.
        let _ = self.closed.send(true);
        debug!("in-process broker context closed");
    }
}

struct MemoryRequestSocket {
    tx: mpsc::Sender<QueueItem>,
    closed: watch::Receiver<bool>,
}

#[async_trait]
impl RequestSocket for MemoryRequestSocket {
    async fn send(&mut self, payload: Vec<u8>) -> Result<Vec<u8>, OrchestratorError> {
        if *self.closed.borrow() {
            return Err(OrchestratorError::BrokerClosed);
        }
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(QueueItem {
                payload,
                responder: Some(reply_tx),
            })
            .await
            .map_err(|_| OrchestratorError::BrokerClosed)?;

        tokio::select! {
            reply = reply_rx => reply.map_err(|_| OrchestratorError::BrokerClosed),
            _ = self.closed.changed() => Err(OrchestratorError::BrokerClosed),
        }
    }
}

struct MemoryReplySocket {
    rx: Arc<Mutex<mpsc::Receiver<QueueItem>>>,
    closed: watch::Receiver<bool>,
}

#[async_trait]
impl ReplySocket for MemoryReplySocket {
    async fn next(&mut self) -> Option<InboundRequest> {
        loop {
            if *self.closed.borrow() {
                return None;
            }
            let rx = Arc::clone(&self.rx);
            let item = tokio::select! {
                item = async move { rx.lock().await.recv().await } => item?,
                _ = self.closed.changed() => return None,
            };
            match item.responder {
                Some(responder) => return Some(InboundRequest::new(item.payload, responder)),
                None => {
                    debug!("dropping plain push delivered to a reply socket");
                }
            }
        }
    }
}

struct MemoryPushSocket {
    tx: mpsc::Sender<QueueItem>,
    closed: watch::Receiver<bool>,
}

#[async_trait]
impl PushSocket for MemoryPushSocket {
    async fn send(&self, payload: Vec<u8>) -> Result<(), OrchestratorError> {
        if *self.closed.borrow() {
            return Err(OrchestratorError::BrokerClosed);
        }
        self.tx
            .send(QueueItem {
                payload,
                responder: None,
            })
            .await
            .map_err(|_| OrchestratorError::BrokerClosed)
    }
}

struct MemoryWorkerSocket {
    rx: Arc<Mutex<mpsc::Receiver<QueueItem>>>,
    permits: Arc<Semaphore>,
    closed: watch::Receiver<bool>,
}

#[async_trait]
impl WorkerSocket for MemoryWorkerSocket {
    async fn next(&mut self) -> Option<WorkDelivery> {
        // One permit per unacknowledged delivery: the prefetch window.
        let permit = tokio::select! {
            permit = Arc::clone(&self.permits).acquire_owned() => permit.ok()?,
            _ = self.closed.changed() => return None,
        };

        loop {
            if *self.closed.borrow() {
                return None;
            }
            let rx = Arc::clone(&self.rx);
            let item = tokio::select! {
                item = async move { rx.lock().await.recv().await } => item?,
                _ = self.closed.changed() => return None,
            };
            if item.responder.is_some() {
                debug!("dropping request/reply item delivered to a worker socket");
                continue;
            }
            let ack = AckHandle::new(Box::new(move || drop(permit)));
            return Some(WorkDelivery {
                payload: item.payload,
                ack,
            });
        }
    }
}
