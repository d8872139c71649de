use clap::{Parser, Subcommand, ValueEnum};
use uartlink::runtime::DEFAULT_RELAY_URL;

#[derive(Parser)]
#[command(
    name = "uartlink",
    about = "Talk to a UART-style wireless peripheral",
    version
)]
pub struct Cli {
    /// Increase log verbosity (-v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Transport selection; `auto` probes platform capability
    #[arg(long, value_enum, default_value_t = TransportMode::Auto, global = true)]
    pub transport: TransportMode,

    /// Relay bridge endpoint (relay transport only)
    #[arg(long, default_value = DEFAULT_RELAY_URL, global = true)]
    pub relay_url: String,

    /// Liveness watchdog in milliseconds; values at or below 100 disable it
    #[arg(long, global = true)]
    pub liveness_timeout_ms: Option<u64>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum TransportMode {
    Auto,
    Relay,
    Native,
}

#[derive(Subcommand)]
pub enum Command {
    /// Discover nearby peripherals and list them
    Scan {
        /// How long to listen for discovery results
        #[arg(long, default_value_t = 5)]
        seconds: u64,
    },
    /// Connect and send a single command string
    Send {
        /// Peripheral id; defaults to the first one discovered
        #[arg(long)]
        id: Option<String>,
        /// Command text (a newline is appended on the wire)
        message: String,
    },
    /// Connect and print every inbound report
    Monitor {
        /// Peripheral id; defaults to the first one discovered
        #[arg(long)]
        id: Option<String>,
        /// Stop after this many seconds; runs until Ctrl-C when omitted
        #[arg(long)]
        seconds: Option<u64>,
    },
}
