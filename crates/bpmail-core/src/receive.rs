//! Receive pipeline: one delivery from transport to standard output.
//!
//! ```text
//! receive -> [no payload] -> done
//!         -> read -> inflate -> parse -> [invalid, relaxed] -> emit raw -> done
//!                                     -> [verify?] -> strip Return-Path -> emit CRLF -> done
//! ```
//!
//! The delivery is released exactly once whatever the outcome.

use std::io::Write;

use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::codec::{self, CodecError};
use crate::message::{MailMessage, MessageError};
use crate::transport::{Delivery, DeliveryResult, Transport, TransportError};
use crate::verify::{NodeResolver, SenderVerifier, VerifyError, parse_node_number};

/// Receive policy switches.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct ReceiveOptions {
    /// Pass unparseable payloads through unmodified instead of failing.
    pub allow_invalid_mime: bool,
}

/// Successful pipeline outcome.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ReceiveOutcome {
    /// The delivery carried no payload; nothing was written.
    NoPayload(DeliveryResult),
    /// The decompressed bytes were not a mail message and were written verbatim.
    PassedThrough {
        /// Bytes written.
        bytes: usize,
    },
    /// A sanitized message was written.
    Emitted {
        /// Bytes written.
        bytes: usize,
        /// Routing headers removed.
        stripped_headers: usize,
    },
}

/// Pipeline failures; each one is fatal for the delivery.
#[derive(Debug, Error)]
pub enum ReceiveError {
    /// Transport failure.
    #[error(transparent)]
    Transport(#[from] TransportError),
    /// Payload could not be decompressed.
    #[error("decompression failed: {0}")]
    Decompress(#[from] CodecError),
    /// Payload is not a mail message and the policy is strict.
    #[error(transparent)]
    Parse(MessageError),
    /// Sender verification failed.
    #[error("sender verification failed: {0}")]
    Verify(#[from] VerifyError),
    /// Output could not be written or flushed.
    #[error("could not write data to stdout: {0}")]
    Emit(#[source] std::io::Error),
}

/// Receive-side session context: transport, optional verifier and policy.
pub struct ReceivePipeline<T, R> {
    transport: T,
    verifier: Option<SenderVerifier<R>>,
    options: ReceiveOptions,
}

impl<T: Transport, R: NodeResolver> ReceivePipeline<T, R> {
    /// Creates a pipeline; `verifier == None` disables sender verification.
    pub fn new(transport: T, verifier: Option<SenderVerifier<R>>, options: ReceiveOptions) -> Self {
        Self {
            transport,
            verifier,
            options,
        }
    }

    /// Returns the underlying transport.
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Receives and processes exactly one delivery, writing the result to `out`.
    pub async fn run(
        &self,
        cancel: &CancellationToken,
        out: &mut impl Write,
    ) -> Result<ReceiveOutcome, ReceiveError> {
        let delivery = self.transport.receive(cancel).await?;
        let outcome = self.process(&delivery, out).await;
        self.transport.release(delivery);
        outcome
    }

    async fn process(
        &self,
        delivery: &Delivery,
        out: &mut impl Write,
    ) -> Result<ReceiveOutcome, ReceiveError> {
        if !delivery.has_payload() {
            tracing::debug!(result = ?delivery.result, "delivery carries no payload");
            return Ok(ReceiveOutcome::NoPayload(delivery.result));
        }

        let compressed = self.transport.read_payload(delivery)?;
        let decompressed = codec::inflate(&compressed)?;
        drop(compressed);
        tracing::info!(
            source = %delivery.source_eid,
            bytes = decompressed.len(),
            "received payload"
        );

        let mut message = match MailMessage::parse(&decompressed) {
            Ok(message) => message,
            Err(err) if self.options.allow_invalid_mime => {
                tracing::warn!(error = %err, "passing unparseable payload through");
                emit(out, &decompressed)?;
                return Ok(ReceiveOutcome::PassedThrough {
                    bytes: decompressed.len(),
                });
            }
            Err(err) => return Err(ReceiveError::Parse(err)),
        };
        drop(decompressed);

        if let Some(verifier) = &self.verifier {
            // A bad source identity is reported before any From header problem.
            parse_node_number(&delivery.source_eid)?;
            let senders = message
                .sender_addresses()
                .map_err(|err| VerifyError::AddressExtraction(err.to_string()))?;
            verifier
                .verify(&delivery.source_eid, &senders)
                .await?
                .into_result()?;
        }

        let stripped_headers = message.strip_routing_headers();
        let serialized = message.to_crlf_bytes();
        emit(out, &serialized)?;
        Ok(ReceiveOutcome::Emitted {
            bytes: serialized.len(),
            stripped_headers,
        })
    }
}

fn emit(out: &mut impl Write, bytes: &[u8]) -> Result<(), ReceiveError> {
    out.write_all(bytes).map_err(ReceiveError::Emit)?;
    out.flush().map_err(ReceiveError::Emit)
}
