//! Send composer: compress content, stage it in transport storage and send.

use std::io::BufRead;

use thiserror::Error;

use crate::codec::{self, CodecError};
use crate::transport::{
    CustodyPolicy, Priority, SendRequest, SendStatus, StorageObject, Transport, TransportError,
};

/// Byte that terminates content read from standard input.
pub const CONTENT_SENTINEL: u8 = 0;

/// Send failures.
#[derive(Debug, Error)]
pub enum SendError {
    /// Input was empty.
    #[error("error or nothing to read from stdin; nothing to send")]
    NothingToSend,
    /// Input could not be read.
    #[error("could not read content: {0}")]
    Read(#[source] std::io::Error),
    /// Content does not fit the transport's 32-bit length field.
    #[error("content too large to send ({0} bytes)")]
    ContentTooLarge(usize),
    /// Compression failed.
    #[error("compression failed: {0}")]
    Compress(#[from] CodecError),
    /// Transport declined the payload; the staged object was freed.
    #[error("could not send payload")]
    NotSent,
    /// Transport failure.
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// Fixed delivery parameters of one send.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SendParams {
    /// Transmission profile identifier.
    pub profile_id: u32,
    /// Destination endpoint identifier.
    pub dest_eid: String,
    /// Priority class.
    pub priority: Priority,
    /// Custody policy.
    pub custody: CustodyPolicy,
}

impl SendParams {
    /// Standard-priority, no-custody parameters.
    #[must_use]
    pub fn new(profile_id: u32, dest_eid: impl Into<String>) -> Self {
        Self {
            profile_id,
            dest_eid: dest_eid.into(),
            priority: Priority::Standard,
            custody: CustodyPolicy::NotRequested,
        }
    }
}

/// Record of an accepted send.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SendReceipt {
    /// Storage object handed to the transport.
    pub object: StorageObject,
    /// Uncompressed content length.
    pub content_len: usize,
    /// Compressed payload length.
    pub payload_len: u32,
}

/// Reads content up to end of input or the first [`CONTENT_SENTINEL`].
///
/// The sentinel itself is not part of the content.
pub fn read_content(reader: &mut impl BufRead) -> Result<Vec<u8>, SendError> {
    let mut content = Vec::new();
    reader
        .read_until(CONTENT_SENTINEL, &mut content)
        .map_err(SendError::Read)?;
    if content.last() == Some(&CONTENT_SENTINEL) {
        content.pop();
    }
    if content.is_empty() {
        return Err(SendError::NothingToSend);
    }
    Ok(content)
}

/// Checks that `len` fits the transport length field.
pub fn wire_length(len: usize) -> Result<u32, SendError> {
    u32::try_from(len).map_err(|_| SendError::ContentTooLarge(len))
}

/// Send-side session context.
pub struct SendComposer<T> {
    transport: T,
}

impl<T: Transport> SendComposer<T> {
    /// Creates a composer over `transport`.
    pub fn new(transport: T) -> Self {
        Self { transport }
    }

    /// Returns the underlying transport.
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Compresses `content` and sends it with `params`.
    ///
    /// When the transport declines the payload the staged storage object is
    /// freed again. After a hard transport failure nothing is rolled back.
    pub fn send(&self, content: &[u8], params: &SendParams) -> Result<SendReceipt, SendError> {
        if content.is_empty() {
            return Err(SendError::NothingToSend);
        }
        wire_length(content.len())?;

        let compressed = codec::deflate(content)?;
        let payload_len = wire_length(compressed.len())?;
        let object = self.transport.insert(&compressed)?;
        drop(compressed);

        let request = SendRequest {
            profile_id: params.profile_id,
            dest_eid: params.dest_eid.clone(),
            priority: params.priority,
            custody: params.custody,
            payload: object,
            length: payload_len,
        };
        match self.transport.send(&request)? {
            SendStatus::Accepted => {
                tracing::info!(
                    dest = %params.dest_eid,
                    profile = params.profile_id,
                    content_len = content.len(),
                    payload_len,
                    "payload sent"
                );
                Ok(SendReceipt {
                    object,
                    content_len: content.len(),
                    payload_len,
                })
            }
            SendStatus::NotSent => {
                if let Err(err) = self.transport.free(object) {
                    tracing::error!(error = %err, "could not free unsent payload");
                }
                Err(SendError::NotSent)
            }
        }
    }
}
