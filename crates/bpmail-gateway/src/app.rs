//! Wiring between the command line, the configuration and the core pipelines.

use std::io::BufRead;
use std::path::PathBuf;

use bpmail_core::{
    ReceiveError, ReceiveOptions, ReceiveOutcome, ReceivePipeline, SendComposer, SendError,
    SendParams, SendReceipt, SenderVerifier, TransportError, parse_auto_radix, read_content,
};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::config::{ConfigError, GatewayConfig};
use crate::resolver::{DnsNodeResolver, ResolverSetupError};
use crate::spool::SpoolTransport;

/// Topic used when `-t` is not given.
pub const DEFAULT_TOPIC_ID: u32 = 25;

/// Gateway runtime errors.
#[derive(Debug, Error)]
pub enum AppError {
    /// Configuration could not be loaded.
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// Resolver could not be set up.
    #[error("could not initialize resolver: {0}")]
    Resolver(#[from] ResolverSetupError),
    /// Transport session could not be established.
    #[error(transparent)]
    Transport(#[from] TransportError),
    /// Receive pipeline failed.
    #[error(transparent)]
    Receive(#[from] ReceiveError),
    /// Send composer failed.
    #[error(transparent)]
    Send(#[from] SendError),
}

/// Receiver invocation.
#[derive(Clone, Debug)]
pub struct ReceiverArgs {
    /// Configuration file.
    pub config: PathBuf,
    /// Topic to receive on.
    pub topic_id: u32,
    /// Pass unparseable payloads through.
    pub allow_invalid_mime: bool,
    /// Verify senders against node records.
    pub verify_senders: bool,
    /// Resolver server override.
    pub servers: Option<String>,
}

/// Sender invocation.
#[derive(Clone, Debug)]
pub struct SenderArgs {
    /// Configuration file.
    pub config: PathBuf,
    /// Topic the transport session is opened on.
    pub topic_id: u32,
    /// Transmission profile.
    pub profile_id: u32,
    /// Destination endpoint identifier.
    pub dest_eid: String,
}

/// Receives one delivery and writes the result to stdout.
///
/// An interrupt (ctrl-c) cancels a pending receive.
pub async fn run_receiver(args: ReceiverArgs) -> Result<ReceiveOutcome, AppError> {
    let config = GatewayConfig::from_toml_file(&args.config)?;
    let verifier = if args.verify_senders {
        let resolver = DnsNodeResolver::from_settings(&config.resolver, args.servers.as_deref())?;
        Some(SenderVerifier::new(resolver))
    } else {
        None
    };
    let transport = SpoolTransport::open(&config, args.topic_id)?;
    let pipeline = ReceivePipeline::new(
        transport,
        verifier,
        ReceiveOptions {
            allow_invalid_mime: args.allow_invalid_mime,
        },
    );

    let cancel = CancellationToken::new();
    let interrupt = tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                cancel.cancel();
            }
        }
    });

    let mut stdout = std::io::stdout();
    let outcome = pipeline.run(&cancel, &mut stdout).await;
    interrupt.abort();

    let outcome = outcome?;
    tracing::debug!(?outcome, topic_id = args.topic_id, "receive finished");
    Ok(outcome)
}

/// Attaches to the transport, reads content from `input` and sends it.
pub fn run_sender(args: SenderArgs, input: &mut impl BufRead) -> Result<SendReceipt, AppError> {
    let config = GatewayConfig::from_toml_file(&args.config)?;
    if config.profile(args.profile_id).is_none() {
        tracing::warn!(profile = args.profile_id, "profile is not configured");
    }
    let transport = SpoolTransport::open(&config, args.topic_id)?;
    let content = read_content(input)?;
    let composer = SendComposer::new(transport);
    Ok(composer.send(&content, &SendParams::new(args.profile_id, args.dest_eid))?)
}

/// Parses a topic identifier argument.
pub fn parse_topic_id(input: &str) -> Result<u32, String> {
    parse_u32_arg(input, "topic_id")
}

/// Parses a profile identifier argument.
pub fn parse_profile_id(input: &str) -> Result<u32, String> {
    parse_u32_arg(input, "profile_id")
}

/// Parses an unsigned argument with base auto-detection, bounded to `u32`.
fn parse_u32_arg(input: &str, field: &str) -> Result<u32, String> {
    let value =
        parse_auto_radix(input).ok_or_else(|| format!("strtoul: invalid number `{input}`"))?;
    u32::try_from(value).map_err(|_| format!("{field} out of range"))
}
