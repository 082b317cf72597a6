//! rpcbus CLI entry point

mod cli;

use crate::cli::{Cli, Commands};
use anyhow::{bail, Context, Result};
use clap::Parser;
use rpcbus::client::ConnectionState;
use rpcbus::{Client, ScopeConfig, SignalValue, WebsocketClient, WebsocketConfig};
use serde_json::Value;
use std::time::Duration;
use tokio::signal;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    let client = Client::new(ScopeConfig::new().label(cli.label.clone()));
    let uplink = WebsocketClient::connect(client.clone(), WebsocketConfig::new(cli.url.clone()));
    wait_connected(&client, Duration::from_secs(cli.connect_timeout))
        .await
        .with_context(|| format!("Could not connect to {}", cli.url))?;

    let result = match cli.command {
        Commands::Call {
            channel,
            event,
            arg,
        } => call(&client, &channel, &event, arg.as_ref()),
        Commands::Listen { channels } => listen(&client, channels).await,
        Commands::Watch { signal } => watch(&client, &signal).await,
        Commands::Transmit { signal, value } => transmit(&client, &signal, value).await,
    };

    flush(&client);
    uplink.shutdown().await;
    result
}

async fn wait_connected(client: &Client, timeout: Duration) -> Result<()> {
    let mut state = client.state_receiver();
    tokio::time::timeout(
        timeout,
        state.wait_for(|state| *state == ConnectionState::Connected),
    )
    .await
    .context("Timed out")?
    .context("Client dropped")?;
    Ok(())
}

fn flush(client: &Client) {
    if let Some(session) = client.session() {
        session.flush();
    }
}

fn call(client: &Client, channel: &str, event: &str, arg: Option<&Value>) -> Result<()> {
    if channel.is_empty() {
        bail!("Channel id must not be empty");
    }
    client.call(channel, event, arg)?;
    info!(channel, event, "Call sent");
    Ok(())
}

async fn listen(client: &Client, channels: Vec<String>) -> Result<()> {
    let subscriptions: Vec<_> = channels
        .into_iter()
        .map(|channel| {
            let name = channel.clone();
            client.subscribe(&channel, move |event, arg| match arg {
                Some(arg) => println!("{} {} {}", name, event, arg),
                None => println!("{} {}", name, event),
            })
        })
        .collect();

    eprintln!("Listening on {} channel(s), Ctrl+C to stop", subscriptions.len());
    signal::ctrl_c().await?;

    for subscription in subscriptions {
        subscription.unsubscribe();
    }
    Ok(())
}

async fn watch(client: &Client, id: &str) -> Result<()> {
    let signal = client.signal(id);
    let request = signal.request();
    let mut values = signal.watch();
    print_value(id, &values.borrow_and_update());

    loop {
        tokio::select! {
            changed = values.changed() => {
                if changed.is_err() {
                    break;
                }
                print_value(id, &values.borrow_and_update());
            }
            _ = signal::ctrl_c() => break,
        }
    }

    request.release();
    Ok(())
}

async fn transmit(client: &Client, id: &str, value: Value) -> Result<()> {
    let signal = client.signal(id);
    signal.transmit(Some(value));
    flush(client);

    eprintln!("Transmitting {}, Ctrl+C to stop", id);
    signal::ctrl_c().await?;

    if !signal.is_holding() {
        eprintln!("{} was owned by another peer", id);
    }
    signal.transmit(None);
    Ok(())
}

fn print_value(id: &str, value: &SignalValue) {
    match value.as_value() {
        Some(value) => println!("{} {}", id, value),
        None => println!("{} <invalid>", id),
    }
}
