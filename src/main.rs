//! hubsocket CLI - call methods on a hub from the command line.
//!
//! This is the main binary entry point. See the `hubsocket` library for the
//! client itself.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use hubsocket::{method_handler, ClientConfig, DisconnectReason, HubConnection};
use serde_json::{json, Value};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "hubsocket")]
#[command(about = "Talk to a SignalR-style JSON hub over WebSocket", long_about = None)]
#[command(version)]
struct Cli {
    /// Hub URL (overrides config file and HUBSOCKET_URL)
    #[arg(long, global = true)]
    url: Option<String>,
    /// Config file (defaults to HUBSOCKET_CONFIG or the platform config dir)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Log every frame sent and received
    #[arg(long, global = true)]
    debug: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Invoke a hub method and print its result as JSON
    Invoke {
        /// Hub method name
        method: String,
        /// Arguments; anything that is not valid JSON is sent as a string
        args: Vec<String>,
    },
    /// Send a hub method without waiting for a result
    Send {
        /// Hub method name
        method: String,
        /// Arguments; anything that is not valid JSON is sent as a string
        args: Vec<String>,
    },
    /// Print server-to-client invocations of the given methods until Ctrl-C
    Listen {
        /// Client method names to subscribe to
        #[arg(required = true)]
        methods: Vec<String>,
    },
}

/// JSON value of a command-line argument, or the raw text as a JSON string.
fn parse_arg(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

fn parse_args(raw: &[String]) -> Vec<Value> {
    raw.iter().map(|arg| parse_arg(arg)).collect()
}

async fn connect(cli: &Cli) -> Result<HubConnection> {
    let mut config = ClientConfig::load(cli.config.as_deref())?;
    if let Some(url) = &cli.url {
        config.url.clone_from(url);
    }
    if cli.debug {
        config.debug = true;
    }

    let url = config.url.clone();
    let connection = config.into_builder()?.build();
    connection
        .start()
        .await
        .with_context(|| format!("Failed to connect to {url}"))?;
    Ok(connection)
}

async fn listen(connection: &HubConnection, methods: &[String]) -> Result<()> {
    for method in methods {
        let name = method.clone();
        connection.on(
            method,
            method_handler(move |args| {
                println!("{}", json!({ "method": name, "arguments": args }));
                Ok(Value::Null)
            }),
        );
    }
    connection.on_reconnecting(|error| {
        log::warn!("Connection lost ({}), reconnecting", error.unwrap_or("no reason"));
    });
    connection.on_reconnected(|| log::info!("Reconnected"));

    let (done_tx, mut done_rx) = tokio::sync::mpsc::unbounded_channel();
    connection.on_disconnected(move |reason| {
        let _ = done_tx.send(reason.clone());
    });

    log::info!("Listening for {} (Ctrl-C to stop)", methods.join(", "));
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result.context("Failed to listen for Ctrl-C")?;
            connection.stop().await?;
            Ok(())
        }
        Some(reason) = done_rx.recv() => match reason {
            DisconnectReason::Stopped => Ok(()),
            DisconnectReason::RetriesExhausted { error } | DisconnectReason::ServerClosed { error } => {
                anyhow::bail!(
                    "Connection closed: {}",
                    error.unwrap_or_else(|| "no reason given".to_string())
                )
            }
        },
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.debug { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .format_timestamp_secs()
        .init();

    let connection = connect(&cli).await?;

    let result = match &cli.command {
        Commands::Invoke { method, args } => {
            let value = connection.invoke(method, parse_args(args)).await;
            value
                .with_context(|| format!("Invocation of '{method}' failed"))
                .and_then(|value| {
                    println!("{}", serde_json::to_string_pretty(&value)?);
                    Ok(())
                })
        }
        Commands::Send { method, args } => connection
            .send(method, parse_args(args))
            .await
            .with_context(|| format!("Sending '{method}' failed")),
        Commands::Listen { methods } => listen(&connection, methods).await,
    };

    connection.stop().await?;
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_arg_json_values() {
        assert_eq!(parse_arg("42"), json!(42));
        assert_eq!(parse_arg("true"), json!(true));
        assert_eq!(parse_arg(r#"{"a":[1,2]}"#), json!({"a": [1, 2]}));
        assert_eq!(parse_arg(r#""quoted""#), json!("quoted"));
    }

    #[test]
    fn test_parse_arg_falls_back_to_string() {
        assert_eq!(parse_arg("hello"), json!("hello"));
        assert_eq!(parse_arg("{broken"), json!("{broken"));
    }

    #[test]
    fn test_cli_parses_global_flags_after_subcommand() {
        let cli = Cli::parse_from(["hubsocket", "invoke", "Echo", "hi", "--url", "ws://x/hub"]);
        assert_eq!(cli.url.as_deref(), Some("ws://x/hub"));
        match cli.command {
            Commands::Invoke { method, args } => {
                assert_eq!(method, "Echo");
                assert_eq!(args, vec!["hi".to_string()]);
            }
            _ => panic!("expected invoke"),
        }
    }
}
