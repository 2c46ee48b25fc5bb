//! `gerrit-ssh`: run Gerrit ssh commands and follow the event feed.
//!
//! Connection settings come from a TOML file (`--config`, default
//! `gerrit-ssh.toml`) and can be overridden per flag.

use std::collections::BTreeMap;
use std::path::PathBuf;

use anyhow::{Context, Result, anyhow};
use clap::{Parser, Subcommand};
use gerrit_ssh::core::record::FeedItem;
use gerrit_ssh::io::config::{ClientConfig, load_config};
use gerrit_ssh::{GerritClient, GerritError, ReviewInput, exit_codes, logging};
use tokio_util::sync::CancellationToken;
use tracing::warn;

#[derive(Parser)]
#[command(
    name = "gerrit-ssh",
    version,
    about = "Gerrit ssh commands and event feed over OpenSSH"
)]
struct Cli {
    /// TOML config file; missing files fall back to defaults.
    #[arg(long, global = true, default_value = "gerrit-ssh.toml")]
    config: PathBuf,
    #[arg(long, global = true)]
    host: Option<String>,
    #[arg(long, global = true)]
    port: Option<u16>,
    #[arg(long, global = true)]
    user: Option<String>,
    /// Private key loaded into the agent before connecting.
    #[arg(long, global = true)]
    key_file: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print the server version.
    Version,
    /// Run a change query and print one JSON record per line.
    Query {
        /// Extra output field, e.g. `current-patch-set`. Repeatable.
        #[arg(long = "field")]
        fields: Vec<String>,
        /// Query terms.
        #[arg(required = true, num_args = 1..)]
        terms: Vec<String>,
    },
    /// Post a review on a commit sha or `change,patchset`.
    Review {
        revision: String,
        #[arg(short, long)]
        message: String,
        /// Label vote as `NAME=VALUE`, e.g. `Code-Review=+1`. Repeatable.
        #[arg(long = "label", value_parser = parse_label)]
        labels: Vec<(String, i32)>,
        #[arg(long)]
        project: Option<String>,
        #[arg(long)]
        notify: Option<String>,
        #[arg(long)]
        tag: Option<String>,
    },
    /// Follow `stream-events`, printing one JSON record per line.
    StreamEvents,
}

fn parse_label(raw: &str) -> Result<(String, i32), String> {
    let (name, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected NAME=VALUE, got {raw:?}"))?;
    if name.is_empty() {
        return Err(format!("empty label name in {raw:?}"));
    }
    let value = value
        .trim_start_matches('+')
        .parse::<i32>()
        .map_err(|err| format!("label value in {raw:?}: {err}"))?;
    Ok((name.to_string(), value))
}

#[tokio::main]
async fn main() {
    logging::init();
    let code = match run(Cli::parse()).await {
        Ok(()) => exit_codes::OK,
        Err(err) => {
            eprintln!("{:#}", err);
            err.downcast_ref::<GerritError>()
                .map(exit_codes::for_error)
                .unwrap_or(exit_codes::INVALID)
        }
    };
    std::process::exit(code);
}

async fn run(cli: Cli) -> Result<()> {
    let config = resolve_config(&cli)?;

    let shutdown = CancellationToken::new();
    let on_signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupted, shutting down");
            on_signal.cancel();
        }
    });

    let client = GerritClient::connect(config, shutdown.clone()).await?;
    let result = run_command(&client, cli.command, &shutdown).await;
    client.close().await.context("stop ssh-agent")?;
    result
}

fn resolve_config(cli: &Cli) -> Result<ClientConfig> {
    let mut config = load_config(&cli.config)?;
    if let Some(host) = &cli.host {
        config.host = host.clone();
    }
    if let Some(port) = cli.port {
        config.port = port;
    }
    if let Some(user) = &cli.user {
        config.user = user.clone();
    }
    if let Some(key_file) = &cli.key_file {
        config.key_file = Some(key_file.clone());
    }
    config
        .validate_target()
        .with_context(|| format!("incomplete connection settings in {}", cli.config.display()))?;
    Ok(config)
}

async fn run_command(
    client: &GerritClient,
    command: Command,
    shutdown: &CancellationToken,
) -> Result<()> {
    match command {
        Command::Version => {
            println!("{}", client.version().await?);
        }
        Command::Query { fields, terms } => {
            for record in client.query(&terms.join(" "), &fields).await? {
                println!("{record}");
            }
        }
        Command::Review {
            revision,
            message,
            labels,
            project,
            notify,
            tag,
        } => {
            let input = ReviewInput {
                message,
                labels: labels.into_iter().collect::<BTreeMap<_, _>>(),
                comments: None,
                notify,
                tag,
            };
            let output = client.review(&revision, project.as_deref(), &input).await?;
            if !output.is_empty() {
                println!("{output}");
            }
        }
        Command::StreamEvents => {
            let mut feed = client.event_stream();
            while let Some(item) = feed.next().await {
                match item? {
                    FeedItem::Resync => eprintln!("resync: events may have been missed"),
                    FeedItem::Record(record) => println!("{}", record.value()),
                }
            }
            if !shutdown.is_cancelled() {
                return Err(anyhow!("event stream ended unexpectedly"));
            }
        }
    }
    Ok(())
}
