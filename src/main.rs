use std::path::PathBuf;

use clap::{Parser, Subcommand};

use myndhyve_relay::args::CommonArgs;
use myndhyve_relay::envelope::ChannelKind;
use myndhyve_relay::{commands, logging};

// ── CLI ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Parser)]
#[command(
    name = "myndhyve-relay",
    version,
    about = "MyndHyve relay agent — bridge local messaging platforms to the cloud"
)]
struct Cli {
    #[command(flatten)]
    common: CommonArgs,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Manage the relay agent
    Relay {
        #[command(subcommand)]
        command: RelayCommands,
    },
    /// Developer tools
    Dev {
        #[command(subcommand)]
        command: DevCommands,
    },
}

#[derive(Debug, Subcommand)]
enum RelayCommands {
    /// Register this machine and obtain a device token
    Setup {
        /// Channel to bridge (whatsapp, signal, imessage)
        #[arg(long, default_value = "imessage")]
        channel: String,
        /// Label shown for this device in the cloud console
        #[arg(long)]
        label: Option<String>,
    },
    /// Run the relay (foreground unless --daemon)
    Start {
        /// Detach and run in the background
        #[arg(long)]
        daemon: bool,
        /// Internal: marks the re-executed daemon child
        #[arg(long, hide = true)]
        foreground: bool,
    },
    /// Stop the background daemon
    Stop,
    /// Show configuration and daemon liveness
    Status,
}

#[derive(Debug, Subcommand)]
enum DevCommands {
    /// Run environment diagnostics
    Doctor,
    /// Check cloud reachability
    Ping,
    /// Envelope tools
    Envelope {
        #[command(subcommand)]
        command: EnvelopeCommands,
    },
    /// Webhook fixtures
    Webhook {
        #[command(subcommand)]
        command: WebhookCommands,
    },
}

#[derive(Debug, Subcommand)]
enum EnvelopeCommands {
    /// Print a synthetic ingress envelope
    Create {
        /// Channel tag
        #[arg(long, default_value = "imessage")]
        channel: String,
        /// Message text
        #[arg(long, default_value = "Hello from the test harness")]
        text: String,
        #[arg(long)]
        peer_id: Option<String>,
        #[arg(long)]
        conversation_id: Option<String>,
        #[arg(long)]
        group: bool,
        #[arg(long)]
        group_name: Option<String>,
    },
    /// Validate an envelope JSON file
    Validate { file: PathBuf },
}

#[derive(Debug, Subcommand)]
enum WebhookCommands {
    /// Print a synthetic platform webhook payload
    Test {
        channel: String,
        #[arg(default_value = "message")]
        event: String,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    logging::init(cli.common.verbose);

    let code = match cli.command {
        Commands::Relay { command } => match command {
            RelayCommands::Setup { channel, label } => match channel.parse::<ChannelKind>() {
                Ok(channel) => commands::relay_setup(&cli.common, channel, label).await,
                Err(_) => {
                    eprintln!("unknown channel: {channel}");
                    commands::EXIT_USAGE
                }
            },
            RelayCommands::Start { daemon, foreground } => {
                commands::relay_start(&cli.common, daemon, foreground).await
            }
            RelayCommands::Stop => commands::relay_stop(&cli.common),
            RelayCommands::Status => commands::relay_status(&cli.common),
        },
        Commands::Dev { command } => match command {
            DevCommands::Doctor => commands::dev_doctor(&cli.common).await,
            DevCommands::Ping => commands::dev_ping(&cli.common).await,
            DevCommands::Envelope { command } => match command {
                EnvelopeCommands::Create {
                    channel,
                    text,
                    peer_id,
                    conversation_id,
                    group,
                    group_name,
                } => commands::dev_envelope_create(
                    &cli.common,
                    &channel,
                    text,
                    peer_id,
                    conversation_id,
                    group,
                    group_name,
                ),
                EnvelopeCommands::Validate { file } => {
                    commands::dev_envelope_validate(&cli.common, &file)
                }
            },
            DevCommands::Webhook { command } => match command {
                WebhookCommands::Test { channel, event } => {
                    commands::dev_webhook_test(&cli.common, &channel, &event)
                }
            },
        },
    };

    std::process::exit(code);
}
