//! Bundle transport contract consumed by the receive pipeline and send composer.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Why a receive call returned.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeliveryResult {
    /// A payload is available in transport storage.
    PayloadPresent,
    /// The configured receive timeout elapsed.
    TimedOut,
    /// The receive was cancelled.
    Interrupted,
}

/// Handle to an object held in transport-managed storage.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct StorageObject(pub u64);

/// One inbound unit handed over by the transport.
///
/// Must be given back through [`Transport::release`] exactly once.
#[derive(Debug)]
pub struct Delivery {
    /// Transport-assigned identifier used to release the delivery.
    pub id: String,
    /// Receive result discriminant.
    pub result: DeliveryResult,
    /// Source endpoint identifier, for example `ipn:42.7`.
    pub source_eid: String,
    /// Payload length in bytes.
    pub length: u32,
    /// Storage object holding the payload, when one is present.
    pub item: Option<StorageObject>,
}

impl Delivery {
    /// Creates a delivery that carries no payload.
    #[must_use]
    pub fn without_payload(result: DeliveryResult) -> Self {
        Self {
            id: String::new(),
            result,
            source_eid: String::new(),
            length: 0,
            item: None,
        }
    }

    /// Returns true when the delivery carries a payload.
    #[must_use]
    pub fn has_payload(&self) -> bool {
        self.result == DeliveryResult::PayloadPresent
    }
}

/// Bundle priority class.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Priority {
    /// Lowest priority.
    Bulk,
    /// Normal priority.
    #[default]
    Standard,
    /// Highest priority.
    Expedited,
}

/// Custody transfer request attached to a send.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CustodyPolicy {
    /// No custody transfer.
    #[default]
    NotRequested,
    /// Custody transfer if the source supports it.
    SourceOptional,
    /// Custody transfer required.
    SourceRequired,
}

/// Parameters of one transport send.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SendRequest {
    /// Transmission profile identifier.
    pub profile_id: u32,
    /// Destination endpoint identifier.
    pub dest_eid: String,
    /// Priority class.
    pub priority: Priority,
    /// Custody policy.
    pub custody: CustodyPolicy,
    /// Storage object holding the payload.
    pub payload: StorageObject,
    /// Payload length in bytes.
    pub length: u32,
}

/// Non-fatal outcome of a send.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SendStatus {
    /// The transport took ownership of the payload.
    Accepted,
    /// The transport declined the payload; the caller still owns it.
    NotSent,
}

/// Transport failures.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Transport is not reachable.
    #[error("could not attach to transport: {0}")]
    Attach(String),
    /// Topic could not be opened.
    #[error("could not open topic {topic}: {reason}")]
    Open {
        /// Topic identifier.
        topic: u32,
        /// Failure detail.
        reason: String,
    },
    /// Receive failed.
    #[error("could not receive delivery: {0}")]
    Receive(String),
    /// Payload could not be read from storage.
    #[error("could not read payload: {0}")]
    Read(String),
    /// Storage insert or free failed.
    #[error("transport storage error: {0}")]
    Storage(String),
    /// Send failed inside the transport; its state is indeterminate.
    #[error("system failure from send: {0}")]
    Send(String),
}

/// Bundle transport session.
///
/// A session is bound to one topic for its whole lifetime.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Blocks until a delivery arrives, the receive times out, or `cancel` fires.
    async fn receive(&self, cancel: &CancellationToken) -> Result<Delivery, TransportError>;

    /// Copies the delivery payload out of transport storage.
    fn read_payload(&self, delivery: &Delivery) -> Result<Vec<u8>, TransportError>;

    /// Gives a delivery back to the transport.
    fn release(&self, delivery: Delivery);

    /// Inserts bytes into transport storage.
    fn insert(&self, bytes: &[u8]) -> Result<StorageObject, TransportError>;

    /// Frees a storage object that was never handed to [`Transport::send`].
    fn free(&self, object: StorageObject) -> Result<(), TransportError>;

    /// Hands a stored payload to the transport for delivery.
    fn send(&self, request: &SendRequest) -> Result<SendStatus, TransportError>;
}
