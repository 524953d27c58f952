use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use bpmail_core::receive::{ReceiveError, ReceiveOptions, ReceiveOutcome, ReceivePipeline};
use bpmail_core::send::{SendComposer, SendError, SendParams};
use bpmail_core::transport::{
    CustodyPolicy, Delivery, DeliveryResult, Priority, SendRequest, SendStatus, StorageObject,
    Transport, TransportError,
};
use bpmail_core::verify::{NodeResolver, ResolveError, SenderVerifier, VerifyError};
use bpmail_core::{deflate, inflate};
use tokio_util::sync::CancellationToken;

#[derive(Clone, Copy)]
enum SendBehavior {
    Accept,
    Decline,
    Fail,
}

struct MemoryState {
    pending: VecDeque<(DeliveryResult, String, Vec<u8>)>,
    objects: HashMap<u64, Vec<u8>>,
    next_object: u64,
    released: Vec<String>,
    freed: Vec<StorageObject>,
    sent: Vec<SendRequest>,
}

struct MemoryTransport {
    state: Mutex<MemoryState>,
    send_behavior: SendBehavior,
}

impl MemoryTransport {
    fn new(send_behavior: SendBehavior) -> Self {
        Self {
            state: Mutex::new(MemoryState {
                pending: VecDeque::new(),
                objects: HashMap::new(),
                next_object: 1,
                released: Vec::new(),
                freed: Vec::new(),
                sent: Vec::new(),
            }),
            send_behavior,
        }
    }

    fn with_delivery(source_eid: &str, payload: Vec<u8>) -> Self {
        let transport = Self::new(SendBehavior::Accept);
        transport.push(DeliveryResult::PayloadPresent, source_eid, payload);
        transport
    }

    fn push(&self, result: DeliveryResult, source_eid: &str, payload: Vec<u8>) {
        self.state
            .lock()
            .expect("state")
            .pending
            .push_back((result, source_eid.to_owned(), payload));
    }

    fn released(&self) -> Vec<String> {
        self.state.lock().expect("state").released.clone()
    }

    fn object_count(&self) -> usize {
        self.state.lock().expect("state").objects.len()
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn receive(&self, cancel: &CancellationToken) -> Result<Delivery, TransportError> {
        let next = self.state.lock().expect("state").pending.pop_front();
        let Some((result, source_eid, payload)) = next else {
            cancel.cancelled().await;
            return Ok(Delivery::without_payload(DeliveryResult::Interrupted));
        };
        let object = self.insert(&payload)?;
        Ok(Delivery {
            id: format!("delivery-{}", object.0),
            result,
            source_eid,
            length: u32::try_from(payload.len()).expect("length"),
            item: Some(object),
        })
    }

    fn read_payload(&self, delivery: &Delivery) -> Result<Vec<u8>, TransportError> {
        let object = delivery
            .item
            .ok_or_else(|| TransportError::Read("no payload".to_owned()))?;
        self.state
            .lock()
            .expect("state")
            .objects
            .get(&object.0)
            .cloned()
            .ok_or_else(|| TransportError::Read("missing object".to_owned()))
    }

    fn release(&self, delivery: Delivery) {
        let mut state = self.state.lock().expect("state");
        if let Some(object) = delivery.item {
            state.objects.remove(&object.0);
        }
        state.released.push(delivery.id);
    }

    fn insert(&self, bytes: &[u8]) -> Result<StorageObject, TransportError> {
        let mut state = self.state.lock().expect("state");
        let id = state.next_object;
        state.next_object += 1;
        state.objects.insert(id, bytes.to_vec());
        Ok(StorageObject(id))
    }

    fn free(&self, object: StorageObject) -> Result<(), TransportError> {
        let mut state = self.state.lock().expect("state");
        state.objects.remove(&object.0);
        state.freed.push(object);
        Ok(())
    }

    fn send(&self, request: &SendRequest) -> Result<SendStatus, TransportError> {
        match self.send_behavior {
            SendBehavior::Accept => {
                self.state
                    .lock()
                    .expect("state")
                    .sent
                    .push(request.clone());
                Ok(SendStatus::Accepted)
            }
            SendBehavior::Decline => Ok(SendStatus::NotSent),
            SendBehavior::Fail => Err(TransportError::Send("engine down".to_owned())),
        }
    }
}

#[derive(Default)]
struct StubResolver {
    records: HashMap<String, Vec<Vec<u8>>>,
    queries: AtomicUsize,
}

impl StubResolver {
    fn with(mut self, domain: &str, nodes: &[u64]) -> Self {
        self.records.insert(
            domain.to_owned(),
            nodes.iter().map(|n| n.to_be_bytes().to_vec()).collect(),
        );
        self
    }

    fn with_raw(mut self, domain: &str, record: &[u8]) -> Self {
        self.records
            .entry(domain.to_owned())
            .or_default()
            .push(record.to_vec());
        self
    }
}

#[async_trait]
impl NodeResolver for StubResolver {
    async fn node_records(&self, domain: &str) -> Result<Vec<Vec<u8>>, ResolveError> {
        self.queries.fetch_add(1, Ordering::SeqCst);
        self.records
            .get(domain)
            .cloned()
            .ok_or_else(|| ResolveError::Lookup(format!("NXDOMAIN {domain}")))
    }
}

const VALID_MESSAGE: &[u8] = b"Return-Path: <relay@example.com>\n\
From: Alice <alice@example.com>\n\
To: bob@example.org\n\
Return-Path: <other@example.com>\n\
Subject: status\n\
\n\
all good\n";

const SANITIZED_MESSAGE: &[u8] = b"From: Alice <alice@example.com>\r\n\
To: bob@example.org\r\n\
Subject: status\r\n\
\r\n\
all good\r\n";

fn strict() -> ReceiveOptions {
    ReceiveOptions::default()
}

async fn run_once<R: NodeResolver>(
    pipeline: &ReceivePipeline<MemoryTransport, R>,
) -> (Result<ReceiveOutcome, ReceiveError>, Vec<u8>) {
    let mut out = Vec::new();
    let result = pipeline.run(&CancellationToken::new(), &mut out).await;
    (result, out)
}

#[tokio::test]
async fn delivery_without_payload_succeeds_silently() {
    let transport = MemoryTransport::new(SendBehavior::Accept);
    transport.push(DeliveryResult::TimedOut, "", Vec::new());
    let pipeline = ReceivePipeline::<_, StubResolver>::new(transport, None, strict());

    let (result, out) = run_once(&pipeline).await;
    assert_eq!(
        result.expect("outcome"),
        ReceiveOutcome::NoPayload(DeliveryResult::TimedOut)
    );
    assert!(out.is_empty());
    assert_eq!(pipeline.transport().released().len(), 1);
}

#[tokio::test]
async fn cancelled_receive_returns_interrupted() {
    let transport = MemoryTransport::new(SendBehavior::Accept);
    let pipeline = ReceivePipeline::<_, StubResolver>::new(transport, None, strict());
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        trigger.cancel();
    });

    let mut out = Vec::new();
    let outcome = pipeline.run(&cancel, &mut out).await.expect("outcome");
    assert_eq!(outcome, ReceiveOutcome::NoPayload(DeliveryResult::Interrupted));
    assert!(out.is_empty());
    assert_eq!(pipeline.transport().released().len(), 1);
}

#[tokio::test]
async fn invalid_mail_passes_through_when_allowed() {
    let raw = b"this is not a mail message\n".to_vec();
    let transport = MemoryTransport::with_delivery("ipn:42.7", deflate(&raw).expect("deflate"));
    let pipeline = ReceivePipeline::new(
        transport,
        Some(SenderVerifier::new(StubResolver::default())),
        ReceiveOptions {
            allow_invalid_mime: true,
        },
    );

    let (result, out) = run_once(&pipeline).await;
    assert_eq!(
        result.expect("outcome"),
        ReceiveOutcome::PassedThrough { bytes: raw.len() }
    );
    assert_eq!(out, raw);
    assert_eq!(pipeline.transport().released().len(), 1);
    assert_eq!(pipeline.transport().object_count(), 0);
}

#[tokio::test]
async fn invalid_mail_fails_under_strict_policy() {
    let raw = b"this is not a mail message\n".to_vec();
    let transport = MemoryTransport::with_delivery("ipn:42.7", deflate(&raw).expect("deflate"));
    let pipeline = ReceivePipeline::<_, StubResolver>::new(transport, None, strict());

    let (result, out) = run_once(&pipeline).await;
    assert!(matches!(result, Err(ReceiveError::Parse(_))));
    assert!(out.is_empty());
    assert_eq!(pipeline.transport().released().len(), 1);
}

#[tokio::test]
async fn corrupt_payload_is_a_decompression_failure() {
    let transport = MemoryTransport::with_delivery("ipn:42.7", b"not zlib at all".to_vec());
    let pipeline = ReceivePipeline::<_, StubResolver>::new(transport, None, strict());

    let (result, out) = run_once(&pipeline).await;
    assert!(matches!(result, Err(ReceiveError::Decompress(_))));
    assert!(out.is_empty());
    assert_eq!(pipeline.transport().released().len(), 1);
}

#[tokio::test]
async fn verified_message_is_sanitized_and_emitted() {
    let transport =
        MemoryTransport::with_delivery("ipn:42.7", deflate(VALID_MESSAGE).expect("deflate"));
    let resolver = StubResolver::default().with("example.com", &[41, 42]);
    let pipeline = ReceivePipeline::new(
        transport,
        Some(SenderVerifier::new(resolver)),
        strict(),
    );

    let (result, out) = run_once(&pipeline).await;
    assert_eq!(
        result.expect("outcome"),
        ReceiveOutcome::Emitted {
            bytes: SANITIZED_MESSAGE.len(),
            stripped_headers: 2,
        }
    );
    assert_eq!(out, SANITIZED_MESSAGE);
    assert_eq!(pipeline.transport().released().len(), 1);
}

#[tokio::test]
async fn unverified_sender_fails_and_writes_nothing() {
    let transport =
        MemoryTransport::with_delivery("ipn:43.7", deflate(VALID_MESSAGE).expect("deflate"));
    let resolver = StubResolver::default().with("example.com", &[42]);
    let pipeline = ReceivePipeline::new(
        transport,
        Some(SenderVerifier::new(resolver)),
        strict(),
    );

    let (result, out) = run_once(&pipeline).await;
    assert!(matches!(
        result,
        Err(ReceiveError::Verify(VerifyError::Mismatch { node_number: 43, .. }))
    ));
    assert!(out.is_empty());
    assert_eq!(pipeline.transport().released().len(), 1);
}

#[tokio::test]
async fn disabled_verification_skips_lookups() {
    let transport =
        MemoryTransport::with_delivery("dtn://not-ipn", deflate(VALID_MESSAGE).expect("deflate"));
    let pipeline = ReceivePipeline::<_, StubResolver>::new(transport, None, strict());

    let (result, out) = run_once(&pipeline).await;
    assert!(matches!(result, Ok(ReceiveOutcome::Emitted { .. })));
    assert_eq!(out, SANITIZED_MESSAGE);
}

#[tokio::test]
async fn every_sender_must_match() {
    let resolver = StubResolver::default()
        .with("example.com", &[42])
        .with("example.net", &[1, 2, 3]);
    let verifier = SenderVerifier::new(resolver);
    let senders = vec!["a@example.com".to_owned(), "b@example.net".to_owned()];

    let outcome = verifier.verify("ipn:42.1", &senders).await.expect("outcome");
    assert!(!outcome.is_verified());
    assert!(outcome.checks[0].matched);
    assert!(!outcome.checks[1].matched);
    assert!(matches!(
        outcome.into_result(),
        Err(VerifyError::Mismatch { address, .. }) if address == "b@example.net"
    ));

    let outcome = verifier
        .verify("ipn:2.1", &["b@example.net".to_owned()])
        .await
        .expect("outcome");
    assert!(outcome.is_verified());
}

#[tokio::test]
async fn unresolvable_domain_and_short_records_do_not_match() {
    let resolver = StubResolver::default().with_raw("short.example", &[0, 0, 0, 42]);
    let verifier = SenderVerifier::new(resolver);

    for sender in ["a@short.example", "a@missing.example"] {
        let outcome = verifier
            .verify("ipn:42.1", &[sender.to_owned()])
            .await
            .expect("outcome");
        assert!(!outcome.is_verified(), "{sender} must not verify");
    }
}

#[tokio::test]
async fn malformed_identifier_never_reaches_resolver() {
    let verifier = SenderVerifier::new(StubResolver::default().with("example.com", &[42]));
    let senders = vec!["a@example.com".to_owned()];

    for eid in ["dtn://node/mail", "ipn:.7", "ipn:x.7"] {
        let err = verifier.verify(eid, &senders).await.expect_err("malformed");
        assert!(matches!(err, VerifyError::MalformedIdentifier(_)));
    }
    assert_eq!(verifier.resolver().queries.load(Ordering::SeqCst), 0);

    let err = verifier.verify("ipn:42.7", &[]).await.expect_err("empty");
    assert!(matches!(err, VerifyError::NoSenderAddress));
    assert_eq!(verifier.resolver().queries.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn malformed_source_fails_delivery_without_queries() {
    let transport =
        MemoryTransport::with_delivery("dtn://node/mail", deflate(VALID_MESSAGE).expect("deflate"));
    let pipeline = ReceivePipeline::new(
        transport,
        Some(SenderVerifier::new(StubResolver::default())),
        strict(),
    );

    let (result, out) = run_once(&pipeline).await;
    assert!(matches!(
        result,
        Err(ReceiveError::Verify(VerifyError::MalformedIdentifier(_)))
    ));
    assert!(out.is_empty());
    assert_eq!(pipeline.transport().released().len(), 1);
}

#[tokio::test]
async fn malformed_source_is_reported_before_bad_from_header() {
    let raw = b"From: not an address\nTo: x@example.org\n\nbody\n";
    let transport =
        MemoryTransport::with_delivery("dtn://node/mail", deflate(raw).expect("deflate"));
    let resolver = StubResolver::default();
    let pipeline = ReceivePipeline::new(transport, Some(SenderVerifier::new(resolver)), strict());

    let (result, out) = run_once(&pipeline).await;
    assert!(
        matches!(
            result,
            Err(ReceiveError::Verify(VerifyError::MalformedIdentifier(_)))
        ),
        "{result:?}"
    );
    assert!(out.is_empty());
    assert_eq!(pipeline.transport().released().len(), 1);
}

#[tokio::test]
async fn message_without_from_fails_verification() {
    let raw = b"To: bob@example.org\nSubject: anonymous\n\nbody\n";
    let transport = MemoryTransport::with_delivery("ipn:42.7", deflate(raw).expect("deflate"));
    let pipeline = ReceivePipeline::new(
        transport,
        Some(SenderVerifier::new(StubResolver::default())),
        strict(),
    );

    let (result, _) = run_once(&pipeline).await;
    assert!(matches!(
        result,
        Err(ReceiveError::Verify(VerifyError::NoSenderAddress))
    ));
}

#[test]
fn accepted_send_stages_compressed_payload() {
    let composer = SendComposer::new(MemoryTransport::new(SendBehavior::Accept));
    let content = b"From: a@example.com\r\n\r\nhello\r\n";

    let receipt = composer
        .send(content, &SendParams::new(1, "ipn:1.129"))
        .expect("receipt");
    assert_eq!(receipt.content_len, content.len());

    let state = composer.transport().state.lock().expect("state");
    let stored = state.objects.get(&receipt.object.0).expect("stored object");
    assert_eq!(inflate(stored).expect("inflate"), content.to_vec());
    assert_eq!(state.sent.len(), 1);
    let request = &state.sent[0];
    assert_eq!(request.profile_id, 1);
    assert_eq!(request.dest_eid, "ipn:1.129");
    assert_eq!(request.priority, Priority::Standard);
    assert_eq!(request.custody, CustodyPolicy::NotRequested);
    assert_eq!(request.length, receipt.payload_len);
}

#[test]
fn declined_send_frees_staged_object() {
    let composer = SendComposer::new(MemoryTransport::new(SendBehavior::Decline));
    let err = composer
        .send(b"blah", &SendParams::new(34, "ipn:1.129"))
        .expect_err("declined");
    assert!(matches!(err, SendError::NotSent));

    let state = composer.transport().state.lock().expect("state");
    assert!(state.objects.is_empty());
    assert_eq!(state.freed.len(), 1);
}

#[test]
fn hard_send_failure_is_not_rolled_back() {
    let composer = SendComposer::new(MemoryTransport::new(SendBehavior::Fail));
    let err = composer
        .send(b"blah", &SendParams::new(1, "ipn:1.129"))
        .expect_err("failed");
    assert!(matches!(err, SendError::Transport(TransportError::Send(_))));

    let state = composer.transport().state.lock().expect("state");
    assert_eq!(state.objects.len(), 1);
    assert!(state.freed.is_empty());
}

#[test]
fn empty_content_creates_no_storage_object() {
    let composer = SendComposer::new(MemoryTransport::new(SendBehavior::Accept));
    let err = composer
        .send(b"", &SendParams::new(1, "ipn:1.129"))
        .expect_err("empty");
    assert!(matches!(err, SendError::NothingToSend));
    assert_eq!(composer.transport().object_count(), 0);
}

#[test]
fn round_trip_forces_buffer_doubling() {
    let body: Vec<u8> = (0..200_000_u32).flat_map(|i| i.to_le_bytes()).collect();
    let compressed = deflate(&body).expect("deflate");
    assert_eq!(inflate(&compressed).expect("inflate"), body);
}
