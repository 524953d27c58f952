//! Receive one mail message from the bundle transport.

use std::path::PathBuf;

use clap::Parser;

use bpmail_gateway::app::{ReceiverArgs, parse_topic_id, run_receiver};
use bpmail_gateway::logging::init_tracing;

/// bpmailrecv CLI.
#[derive(Debug, Parser)]
#[command(name = "bpmailrecv")]
#[command(about = "Receive one mail message over the bundle transport and write it to stdout")]
struct Cli {
    /// Write payloads that are not mail messages to stdout unmodified.
    #[arg(long)]
    allow_invalid_mime: bool,
    /// Do not verify senders against published node records.
    #[arg(long)]
    no_verify_ipn: bool,
    /// Comma-separated resolver servers, `addr[:port]` or `[v6addr]:port`.
    #[arg(short = 's', value_name = "SERVERS", conflicts_with = "no_verify_ipn")]
    servers: Option<String>,
    /// Transport topic.
    #[arg(
        short = 't',
        value_name = "TOPIC_ID",
        default_value = "25",
        value_parser = parse_topic_id
    )]
    topic_id: u32,
    /// TOML config file path.
    #[arg(long, default_value = "bpmail.toml")]
    config: PathBuf,
}

#[tokio::main(flavor = "multi_thread")]
async fn main() {
    let cli = Cli::parse();
    init_tracing();

    let result = run_receiver(ReceiverArgs {
        config: cli.config,
        topic_id: cli.topic_id,
        allow_invalid_mime: cli.allow_invalid_mime,
        verify_senders: !cli.no_verify_ipn,
        servers: cli.servers,
    })
    .await;

    if let Err(err) = result {
        eprintln!("{err}");
        std::process::exit(1);
    }
}
