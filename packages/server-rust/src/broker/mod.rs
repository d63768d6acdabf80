//! Broker abstraction: the narrow interface the coordinator and module
//! clients consume.
//!
//! The transport itself (wire encoding, redelivery, broker topology) is an
//! external collaborator; everything here is the socket surface the rest
//! of the crate is written against. Four socket kinds cover the protocol:
//! request/reply for the registration handshake, push for forwarding
//! messages into queues, and worker-pull (with acks bounded by a prefetch
//! window) for consuming them.

pub mod memory;

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::oneshot;

use crate::error::OrchestratorError;

pub use memory::MemoryBroker;

/// Connection factory for a broker transport.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Connects to the broker at `url`.
    ///
    /// # Errors
    ///
    /// Returns [`OrchestratorError::Connection`] when the broker is
    /// unreachable or the URL is not one this transport serves.
    async fn connect(&self, url: &str) -> Result<Arc<dyn BrokerContext>, OrchestratorError>;
}

/// An established broker connection from which sockets are opened.
///
/// Sockets opened from the same context share its lifetime: closing the
/// context ends every socket's delivery stream (the streams are infinite
/// and not restartable otherwise).
#[async_trait]
pub trait BrokerContext: Send + Sync + std::fmt::Debug {
    /// Opens a request socket: send one payload, await the paired reply.
    async fn request(&self, queue: &str) -> Result<Box<dyn RequestSocket>, OrchestratorError>;

    /// Opens a reply socket serving requests arriving on `queue`.
    async fn reply(&self, queue: &str) -> Result<Box<dyn ReplySocket>, OrchestratorError>;

    /// Opens a push socket writing into `queue`.
    async fn push(&self, queue: &str) -> Result<Box<dyn PushSocket>, OrchestratorError>;

    /// Opens a worker socket consuming `queue` with at most `prefetch`
    /// unacknowledged deliveries at a time.
    async fn worker_pull(
        &self,
        queue: &str,
        prefetch: u16,
    ) -> Result<Box<dyn WorkerSocket>, OrchestratorError>;

    /// Closes the connection and ends every socket stream opened from it.
    /// Resolves once the transport has acknowledged the close.
    async fn close(&self);
}

/// Request side of the request/reply pair.
#[async_trait]
pub trait RequestSocket: Send {
    /// Sends a request payload and awaits the reply.
    ///
    /// # Errors
    ///
    /// Returns [`OrchestratorError::BrokerClosed`] when the context is
    /// closed before a reply arrives.
    async fn send(&mut self, payload: Vec<u8>) -> Result<Vec<u8>, OrchestratorError>;
}

/// Reply side of the request/reply pair: a stream of inbound requests.
#[async_trait]
pub trait ReplySocket: Send {
    /// Next inbound request, or `None` once the context is closed.
    async fn next(&mut self) -> Option<InboundRequest>;
}

/// Fire-and-forget producer into a queue.
#[async_trait]
pub trait PushSocket: Send + Sync {
    /// Enqueues a payload.
    ///
    /// # Errors
    ///
    /// Returns [`OrchestratorError::BrokerClosed`] when the context has
    /// been closed.
    async fn send(&self, payload: Vec<u8>) -> Result<(), OrchestratorError>;
}

/// Consumer of a work queue with prefetch-bounded acknowledgement.
#[async_trait]
pub trait WorkerSocket: Send {
    /// Next delivery, or `None` once the context is closed. Blocks while
    /// the prefetch window is exhausted (all permits held by
    /// unacknowledged deliveries).
    async fn next(&mut self) -> Option<WorkDelivery>;
}

/// A request awaiting an answer on a reply socket.
pub struct InboundRequest {
    /// Raw request payload.
    pub payload: Vec<u8>,
    responder: oneshot::Sender<Vec<u8>>,
}

impl InboundRequest {
    /// Pairs a payload with the channel its answer travels back on.
    #[must_use]
    pub fn new(payload: Vec<u8>, responder: oneshot::Sender<Vec<u8>>) -> Self {
        Self { payload, responder }
    }

    /// Sends the reply. A requester that gave up in the meantime is not an
    /// error; the reply is simply dropped.
    pub fn respond(self, payload: Vec<u8>) {
        let _ = self.responder.send(payload);
    }
}

impl fmt::Debug for InboundRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InboundRequest")
            .field("payload_len", &self.payload.len())
            .finish_non_exhaustive()
    }
}

/// A single delivery from a work queue.
#[derive(Debug)]
pub struct WorkDelivery {
    /// Raw message payload.
    pub payload: Vec<u8>,
    /// Acknowledgement handle; holds one prefetch permit until acked or
    /// dropped.
    pub ack: AckHandle,
}

/// Acknowledges a work delivery, releasing its prefetch permit.
///
/// Dropping the handle without calling [`AckHandle::ack`] also releases
/// the permit; whether the transport redelivers an unacked message is the
/// transport's concern, not modeled here.
pub struct AckHandle {
    release: Option<Box<dyn FnOnce() + Send>>,
}

impl AckHandle {
    /// Wraps a transport-specific release action.
    #[must_use]
    pub fn new(release: Box<dyn FnOnce() + Send>) -> Self {
        Self {
            release: Some(release),
        }
    }

    /// Acknowledges the delivery.
    pub fn ack(mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl Drop for AckHandle {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl fmt::Debug for AckHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AckHandle").finish_non_exhaustive()
    }
}
