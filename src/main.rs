//! jvm-agent-ipc
//!
//! `serve` runs the monitoring agent on the configured endpoint until Ctrl-C.
//! `send` issues a single request to a running agent and prints the outcome.

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use jvm_agent_ipc::agent::Agent;
use jvm_agent_ipc::config::AgentConfig;
use jvm_agent_ipc::properties::ProviderRegistry;
use jvm_agent_ipc::protocol::{DeliveryMode, Request, RequestQueue, ResponseType};
use jvm_agent_ipc::transport::ClientTransport;
use jvm_agent_ipc::EndpointName;

#[derive(Parser, Debug)]
#[command(name = "jvm-agent-ipc")]
#[command(about = "Command channel for the JVM monitoring agent")]
struct Args {
    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the agent
    Serve {
        /// Agent configuration file
        #[arg(long)]
        config: PathBuf,
    },
    /// Send one request to an agent
    Send {
        /// IPC properties file
        #[arg(long)]
        properties: PathBuf,

        /// Endpoint the agent listens on
        #[arg(long)]
        endpoint: EndpointName,

        #[arg(long)]
        receiver: String,

        #[arg(long)]
        action: String,

        /// Request parameter as key=value (repeatable)
        #[arg(long = "param", value_parser = parse_param)]
        params: Vec<(String, String)>,

        /// Do not wait for a response
        #[arg(long)]
        no_response: bool,

        /// Give up waiting after this many seconds
        #[arg(long, default_value_t = 30)]
        timeout_seconds: u64,
    },
}

fn parse_param(raw: &str) -> Result<(String, String), String> {
    raw.split_once('=')
        .filter(|(key, _)| !key.is_empty())
        .map(|(key, value)| (key.to_string(), value.to_string()))
        .ok_or_else(|| format!("expected key=value, got '{raw}'"))
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let args = Args::parse();

    // Logs go to stderr so `send` output stays clean on stdout
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    match args.command {
        Command::Serve { config } => serve(&config).await,
        Command::Send {
            properties,
            endpoint,
            receiver,
            action,
            params,
            no_response,
            timeout_seconds,
        } => {
            let mut request = Request::new(endpoint, receiver, action);
            for (key, value) in params {
                request.set_parameter(key, value);
            }
            if no_response {
                request = request.with_mode(DeliveryMode::NoResponseExpected);
            }
            send(&properties, request, Duration::from_secs(timeout_seconds)).await
        }
    }
}

async fn serve(config_path: &std::path::Path) -> Result<ExitCode> {
    let config = AgentConfig::load(config_path).context("Failed to load configuration")?;
    let properties = config
        .ipc_properties(&ProviderRegistry::builtin())
        .context("Failed to resolve IPC properties")?;

    let agent = Agent::new(&config)?;
    let server = agent.start(&properties).await.context("Failed to start listener")?;

    tokio::signal::ctrl_c()
        .await
        .context("Failed to wait for Ctrl-C")?;
    info!("Shutting down");
    server.close().await;
    Ok(ExitCode::SUCCESS)
}

async fn send(properties_path: &std::path::Path, request: Request, timeout: Duration) -> Result<ExitCode> {
    let properties = ProviderRegistry::builtin()
        .load(properties_path)
        .context("Failed to resolve IPC properties")?;
    let destination = request.destination().clone();
    let queue = RequestQueue::new(ClientTransport::new(properties));

    let outcome = match tokio::time::timeout(timeout, queue.submit(request)).await {
        Ok(outcome) => outcome,
        Err(_) => {
            warn!(endpoint = %destination, "No response in time, closing channel");
            queue.close_channel(&destination);
            anyhow::bail!("timed out after {}s", timeout.as_secs());
        }
    };
    queue.shutdown().await;

    match outcome {
        None => {
            println!("sent");
            Ok(ExitCode::SUCCESS)
        }
        Some(response) => {
            println!("{response}");
            Ok(if response.response_type() == ResponseType::Ok {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            })
        }
    }
}
