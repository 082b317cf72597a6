//! CLI command definitions

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "rpcbus")]
#[command(about = "Talk to an rpcbus broker from the command line", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Broker WebSocket URL
    #[arg(long, env = "RPCBUS_URL", default_value = "ws://127.0.0.1:8080/ws", global = true)]
    pub url: String,

    /// Label announced to the broker
    #[arg(long, env = "RPCBUS_LABEL", default_value = "rpcbus-cli", global = true)]
    pub label: String,

    /// Seconds to wait for the connection
    #[arg(long, default_value_t = 10, global = true)]
    pub connect_timeout: u64,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Make a call on a mod channel
    ///
    /// Examples:
    ///   rpcbus call chat say '{"text": "hi"}'
    ///   rpcbus call jobs poke
    Call {
        /// Channel id
        channel: String,

        /// Event name
        event: String,

        /// JSON argument
        #[arg(value_parser = parse_json)]
        arg: Option<serde_json::Value>,
    },

    /// Print every call made on the given channels until interrupted
    Listen {
        /// Channel ids
        #[arg(required = true)]
        channels: Vec<String>,
    },

    /// Print a signal's value every time it changes until interrupted
    Watch {
        /// Signal id
        signal: String,
    },

    /// Offer a value for a signal until interrupted
    ///
    /// The value only takes effect if no other peer owns the signal.
    Transmit {
        /// Signal id
        signal: String,

        /// JSON value
        #[arg(value_parser = parse_json)]
        value: serde_json::Value,
    },
}

fn parse_json(s: &str) -> Result<serde_json::Value, String> {
    serde_json::from_str(s).map_err(|e| format!("Invalid JSON: {}", e))
}
