//! Sender verification against node records published in the naming system.
//!
//! A message is trusted only when every sender domain publishes a node
//! record whose first eight bytes, big-endian, equal the node number of the
//! endpoint the delivery came from.

use async_trait::async_trait;
use futures::future::join_all;
use thiserror::Error;
use url::Host;

use crate::numeric::parse_auto_radix;

/// URI scheme prefix required on source endpoint identifiers.
pub const IPN_SCHEME: &str = "ipn:";

/// Private resource record type carrying a node number.
pub const IPN_RECORD_TYPE: u16 = 264;

/// Verification failures. None of them are retried.
#[derive(Debug, Error)]
pub enum VerifyError {
    /// Source identifier is not `ipn:<node>.<service>`.
    #[error("malformed source identifier `{0}`")]
    MalformedIdentifier(String),
    /// Message has no sender address to verify.
    #[error("message has no sender address")]
    NoSenderAddress,
    /// Sender address list could not be extracted from the message.
    #[error("could not extract sender addresses: {0}")]
    AddressExtraction(String),
    /// Sender address has no usable domain.
    #[error("invalid sender address `{0}`")]
    InvalidAddress(String),
    /// A sender domain is not bound to the source node.
    #[error("sender `{address}` is not authorized for node {node_number}")]
    Mismatch {
        /// Offending address.
        address: String,
        /// Node number of the source endpoint.
        node_number: u64,
    },
}

/// Naming-system lookup failures.
#[derive(Debug, Error)]
pub enum ResolveError {
    /// Query could not be issued.
    #[error("failed to enqueue query: {0}")]
    Enqueue(String),
    /// Query settled with a failure status.
    #[error("lookup failed: {0}")]
    Lookup(String),
}

/// Naming-system query primitive.
#[async_trait]
pub trait NodeResolver: Send + Sync {
    /// Returns the raw payload of every node record in the answer for `domain`.
    async fn node_records(&self, domain: &str) -> Result<Vec<Vec<u8>>, ResolveError>;
}

/// Result of checking one sender address.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct AddressCheck {
    /// Address as it appeared in the message.
    pub address: String,
    /// ASCII domain that was queried.
    pub domain: String,
    /// Whether a node record matched.
    pub matched: bool,
}

/// Aggregated verification result.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct VerificationOutcome {
    /// Node number parsed from the source identifier.
    pub node_number: u64,
    /// Per-address results, in message order.
    pub checks: Vec<AddressCheck>,
}

impl VerificationOutcome {
    /// Returns true when every address matched.
    #[must_use]
    pub fn is_verified(&self) -> bool {
        self.checks.iter().all(|check| check.matched)
    }

    /// Converts a failed outcome into [`VerifyError::Mismatch`] for the first
    /// unmatched address.
    pub fn into_result(self) -> Result<Self, VerifyError> {
        match self.checks.iter().find(|check| !check.matched) {
            Some(check) => Err(VerifyError::Mismatch {
                address: check.address.clone(),
                node_number: self.node_number,
            }),
            None => Ok(self),
        }
    }
}

/// Checks sender addresses against the node records of their domains.
pub struct SenderVerifier<R> {
    resolver: R,
}

impl<R: NodeResolver> SenderVerifier<R> {
    /// Creates a verifier backed by `resolver`.
    pub fn new(resolver: R) -> Self {
        Self { resolver }
    }

    /// Returns the backing resolver.
    pub fn resolver(&self) -> &R {
        &self.resolver
    }

    /// Verifies `addresses` against the node encoded in `source_eid`.
    ///
    /// One query is issued per address; all of them are awaited before the
    /// answers are inspected. A failed lookup counts as a mismatch.
    pub async fn verify(
        &self,
        source_eid: &str,
        addresses: &[String],
    ) -> Result<VerificationOutcome, VerifyError> {
        let node_number = parse_node_number(source_eid)?;
        if addresses.is_empty() {
            return Err(VerifyError::NoSenderAddress);
        }
        let domains = addresses
            .iter()
            .map(|address| address_domain(address))
            .collect::<Result<Vec<_>, _>>()?;

        let answers = join_all(
            domains
                .iter()
                .map(|domain| self.resolver.node_records(domain)),
        )
        .await;

        let checks = addresses
            .iter()
            .zip(domains)
            .zip(answers)
            .map(|((address, domain), answer)| {
                let matched = match answer {
                    Ok(records) => records_match(node_number, &records),
                    Err(err) => {
                        tracing::warn!(%domain, error = %err, "node record lookup failed");
                        false
                    }
                };
                tracing::debug!(%address, %domain, node_number, matched, "checked sender");
                AddressCheck {
                    address: address.clone(),
                    domain,
                    matched,
                }
            })
            .collect();

        Ok(VerificationOutcome {
            node_number,
            checks,
        })
    }
}

/// Parses the node number out of an `ipn:<node>.<service>` identifier.
pub fn parse_node_number(source_eid: &str) -> Result<u64, VerifyError> {
    let malformed = || VerifyError::MalformedIdentifier(source_eid.to_owned());
    let rest = source_eid.strip_prefix(IPN_SCHEME).ok_or_else(malformed)?;
    let node = rest.split_once('.').map_or(rest, |(node, _)| node);
    parse_auto_radix(node).ok_or_else(malformed)
}

/// Returns the IDNA ASCII form of the domain of `address`.
pub fn address_domain(address: &str) -> Result<String, VerifyError> {
    let invalid = || VerifyError::InvalidAddress(address.to_owned());
    let (_, domain) = address.rsplit_once('@').ok_or_else(invalid)?;
    if domain.is_empty() {
        return Err(invalid());
    }
    match Host::parse(domain) {
        Ok(Host::Domain(ascii)) => Ok(ascii),
        Ok(Host::Ipv4(_) | Host::Ipv6(_)) | Err(_) => Err(invalid()),
    }
}

/// Decodes the node number carried by a node record payload.
///
/// Payloads shorter than eight bytes carry no node number.
#[must_use]
pub fn record_node_number(record: &[u8]) -> Option<u64> {
    let bytes: [u8; 8] = record.get(..8)?.try_into().ok()?;
    Some(u64::from_be_bytes(bytes))
}

fn records_match(node_number: u64, records: &[Vec<u8>]) -> bool {
    records
        .iter()
        .any(|record| record_node_number(record) == Some(node_number))
}
