//! Core pipeline primitives for mail carried over a bundle transport.
//!
//! The transport and the naming-system resolver are consumed through the
//! [`transport::Transport`] and [`verify::NodeResolver`] traits so the
//! pipeline can run against in-memory collaborators in tests.

pub mod codec;
pub mod message;
pub mod numeric;
pub mod receive;
pub mod send;
pub mod transport;
pub mod verify;

pub use codec::{CodecError, deflate, inflate};
pub use message::{MailMessage, MessageError, ROUTING_HEADER};
pub use numeric::parse_auto_radix;
pub use receive::{ReceiveError, ReceiveOptions, ReceiveOutcome, ReceivePipeline};
pub use send::{SendComposer, SendError, SendParams, SendReceipt, read_content};
pub use transport::{
    CustodyPolicy, Delivery, DeliveryResult, Priority, SendRequest, SendStatus, StorageObject,
    Transport, TransportError,
};
pub use verify::{
    IPN_RECORD_TYPE, IPN_SCHEME, NodeResolver, ResolveError, SenderVerifier, VerificationOutcome,
    VerifyError, parse_node_number,
};
