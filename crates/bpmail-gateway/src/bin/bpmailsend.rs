//! Send stdin as a mail payload over the bundle transport.

use std::path::PathBuf;

use clap::Parser;

use bpmail_gateway::app::{SenderArgs, parse_profile_id, parse_topic_id, run_sender};
use bpmail_gateway::logging::init_tracing;

/// bpmailsend CLI.
#[derive(Debug, Parser)]
#[command(name = "bpmailsend")]
#[command(about = "Compress stdin and send it over the bundle transport")]
struct Cli {
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
    /// Transmission profile.
    #[arg(value_parser = parse_profile_id)]
    profile_id: u32,
    /// Destination endpoint identifier.
    dest_eid: String,
}

fn main() {
    let cli = Cli::parse();
    init_tracing();

    let result = run_sender(
        SenderArgs {
            config: cli.config,
            topic_id: cli.topic_id,
            profile_id: cli.profile_id,
            dest_eid: cli.dest_eid,
        },
        &mut std::io::stdin().lock(),
    );

    if let Err(err) = result {
        eprintln!("{err}");
        std::process::exit(1);
    }
}
