// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! meshbus main entry point - operator CLI.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand, ValueEnum};
use colored::Colorize;

use meshbus::config::{self, CliOptions};
use meshbus::evidence::{EvidenceKind, EvidenceRecorder};
use meshbus::message::write_message;
use meshbus::router::Completion;
use meshbus::telemetry::{init_telemetry, TelemetryConfig};
use meshbus::{Address, Bus, BusConfig, Message, MessageType, Tier, TierOwner, TmuxHost};

/// meshbus version string.
const VERSION: &str = env!("CARGO_PKG_VERSION");

/// meshbus - route messages between AI agent sessions.
#[derive(Parser)]
#[command(name = "meshbus")]
#[command(author, version, about = "Filesystem message bus for AI agent sessions", long_about = None)]
struct Cli {
    /// Bus root directory
    #[arg(long, env = "MESHBUS_ROOT", global = true)]
    root: Option<PathBuf>,

    /// Participant used when a domain has no entry point or participants
    #[arg(long, env = "MESHBUS_FALLBACK", global = true)]
    fallback_participant: Option<String>,

    /// Session name template ({domain}, {participant})
    #[arg(long, env = "MESHBUS_SESSION_TEMPLATE", global = true)]
    session_template: Option<String>,

    /// Quiet window before a session counts as idle (ms)
    #[arg(long, global = true)]
    idle_window_ms: Option<u64>,

    /// Upper bound on waiting for idle (ms)
    #[arg(long, global = true)]
    idle_timeout_ms: Option<u64>,

    /// Do not start log consumers
    #[arg(long, global = true)]
    no_consumers: bool,

    /// Show info-level logs
    #[arg(short = 'v', long, global = true)]
    verbose: bool,

    /// Show debug output
    #[arg(long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Output format for read commands.
#[derive(Debug, Clone, Copy, ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the bus until Ctrl-C
    Start,

    /// Write a message into the shared log or an outbox
    Send {
        /// Sender address (`name` or `domain/participant`)
        #[arg(long)]
        from: String,
        /// Destination address (`name`, `domain` or `domain/participant`)
        #[arg(long)]
        to: String,
        /// Message type
        #[arg(short = 't', long = "type", default_value = "task")]
        kind: String,
        /// Body text (reads --file when absent)
        #[arg(short, long)]
        body: Option<String>,
        /// Read the body from a file
        #[arg(long, conflicts_with = "body")]
        file: Option<PathBuf>,
        /// Write into this owner's outbox instead of the shared log
        #[arg(long)]
        outbox: Option<String>,
        /// Extra header field, `key=value` (repeatable)
        #[arg(long = "field", value_name = "KEY=VALUE")]
        fields: Vec<String>,
    },

    /// Inspect the evidence log
    Evidence {
        #[command(subcommand)]
        action: EvidenceAction,
    },

    /// Show an owner's state record
    State {
        domain: String,
        participant: Option<String>,
    },

    /// Start a domain workflow
    Workflow {
        domain: String,
        /// Handoff order; defaults to the domain config
        participants: Vec<String>,
    },

    /// Complete an owner's active message
    Complete {
        /// `domain` or `domain/participant`
        owner: String,
        file: String,
        /// Output handed to the next workflow participant
        #[arg(long)]
        output: Option<String>,
    },

    /// Mark an owner's active message failed
    Fail {
        owner: String,
        file: String,
        #[arg(long, default_value = "marked failed by operator")]
        reason: String,
    },

    /// Reset a participant's session and re-inject its latest prompt
    Replay { owner: String },

    /// Move completed messages to the archive tier
    Archive { owner: String },

    /// List an owner's queue tiers
    Queue { owner: String },

    /// Show the resolved configuration
    Config,

    /// Show version information
    Version,
}

#[derive(Subcommand)]
enum EvidenceAction {
    /// Show the most recent records
    Tail {
        #[arg(short = 'n', long, default_value_t = 20)]
        count: usize,
        /// Filter by kind (e.g. domain-not-found)
        #[arg(long)]
        kind: Option<String>,
        #[arg(long)]
        domain: Option<String>,
        #[arg(short, long, value_enum, default_value = "text")]
        format: OutputFormat,
    },
    /// Counts by kind and domain
    Summary {
        #[arg(short, long, value_enum, default_value = "text")]
        format: OutputFormat,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let _guard = init_telemetry(&TelemetryConfig::for_cli(cli.verbose, cli.debug))?;

    let cli_options = CliOptions {
        root: cli.root,
        fallback_participant: cli.fallback_participant,
        session_template: cli.session_template,
        idle_window_ms: cli.idle_window_ms,
        idle_timeout_ms: cli.idle_timeout_ms,
        no_consumers: cli.no_consumers,
    };
    let cwd = std::env::current_dir()?;
    let config = config::load_config(&cwd, cli_options)?;

    handle_command(cli.command, config, &cwd).await
}

async fn handle_command(command: Commands, config: BusConfig, cwd: &Path) -> anyhow::Result<()> {
    match command {
        Commands::Start => run_bus(config).await?,
        Commands::Send {
            from,
            to,
            kind,
            body,
            file,
            outbox,
            fields,
        } => {
            let body = match (body, file) {
                (Some(body), _) => body,
                (None, Some(path)) => std::fs::read_to_string(&path)
                    .with_context(|| format!("reading {}", path.display()))?,
                (None, None) => bail!("either --body or --file is required"),
            };
            let mut message = Message::new(
                MessageType::from(kind.as_str()),
                &Address::parse(&from)?,
                &Address::parse(&to)?,
                body,
            );
            for field in fields {
                let Some((key, value)) = field.split_once('=') else {
                    bail!("field `{}` is not key=value", field);
                };
                message = message.with_field(key.trim(), value.trim());
            }

            let paths = config.paths();
            paths.ensure_base_dirs()?;
            let dir = match outbox {
                Some(owner) => {
                    let owner = parse_owner(&owner)?;
                    paths.ensure_owner_dirs(&owner)?;
                    paths.tier_dir(&owner, Tier::Outbox)
                }
                None => paths.log_dir(),
            };
            let path = write_message(&dir, &message)?;
            println!("{} {}", "Wrote".green(), path.display());
        }
        Commands::Evidence { action } => handle_evidence(action, &config)?,
        Commands::State {
            domain,
            participant,
        } => {
            let owner = match participant {
                Some(p) => TierOwner::participant(domain, p),
                None => TierOwner::domain(domain),
            };
            let bus = open_bus(config)?;
            let state = bus.context().state.read(&owner)?;
            println!("{}", serde_json::to_string_pretty(&state)?);
        }
        Commands::Workflow {
            domain,
            participants,
        } => {
            let bus = open_bus(config)?;
            let list = (!participants.is_empty()).then_some(participants);
            let workflow = bus.router().start_workflow(&domain, list).await?;
            println!(
                "{} {}: {}",
                "Workflow started".green(),
                domain.bright_white(),
                workflow.participants.join(" -> ")
            );
        }
        Commands::Complete {
            owner,
            file,
            output,
        } => {
            let bus = open_bus(config)?;
            let owner = parse_owner(&owner)?;
            let done = bus
                .router()
                .complete_with_output(&owner, &file, output.as_deref())
                .await?;
            print_completion(&done);
            bus.delivery().wait_settled(bus.context().config.delivery.idle_timeout()).await;
        }
        Commands::Fail {
            owner,
            file,
            reason,
        } => {
            let bus = open_bus(config)?;
            let done = bus.router().fail(&parse_owner(&owner)?, &file, &reason).await?;
            print_completion(&done);
        }
        Commands::Replay { owner } => {
            let bus = open_bus(config)?;
            match bus.router().replay_latest_prompt(&parse_owner(&owner)?).await? {
                Some(path) => println!("{} {}", "Replayed".green(), path.display()),
                None => println!("{}", "No prompt to replay".yellow()),
            }
            bus.delivery().wait_settled(bus.context().config.delivery.idle_timeout()).await;
        }
        Commands::Archive { owner } => {
            let bus = open_bus(config)?;
            let moved = bus.router().archive_completed(&parse_owner(&owner)?).await?;
            println!("{} {} message(s)", "Archived".green(), moved);
        }
        Commands::Queue { owner } => {
            let owner = parse_owner(&owner)?;
            let paths = config.paths();
            println!("{}", owner.to_string().bright_blue().bold());
            for tier in Tier::ALL {
                let files = paths.list_tier(&owner, tier)?;
                println!("  {:<9} {}", tier.to_string().cyan(), files.len());
                for file in files {
                    println!("    {}", file);
                }
            }
        }
        Commands::Config => {
            let sources = config::config_sources(cwd)?;
            if sources.is_empty() {
                println!("{}", "No config files; using defaults".dimmed());
            }
            for source in sources {
                println!("{} {}", "Loaded".dimmed(), source.display());
            }
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
        Commands::Version => {
            println!("meshbus {}", VERSION);
        }
    }
    Ok(())
}

async fn run_bus(config: BusConfig) -> anyhow::Result<()> {
    let root = config.root.clone();
    let mut bus = open_bus(config)?;
    bus.start().await?;
    println!(
        "{} {} ({} consumer(s))",
        "meshbus running on".green(),
        root.display(),
        bus.consumers().len()
    );

    tokio::signal::ctrl_c().await?;
    bus.stop();
    println!("{}", "Stopped".yellow());
    Ok(())
}

fn open_bus(config: BusConfig) -> anyhow::Result<Bus> {
    let host = Arc::new(TmuxHost::new(
        config.tmux_binary.clone(),
        config.delivery.settle_delay(),
    ));
    Ok(Bus::new(config, host)?)
}

/// `domain` or `domain/participant`.
fn parse_owner(raw: &str) -> anyhow::Result<TierOwner> {
    let address = Address::parse(raw)?;
    Ok(match address.domain {
        Some(domain) => TierOwner::participant(domain, address.name),
        None => TierOwner::domain(address.name),
    })
}

fn print_completion(done: &Completion) {
    match done {
        Completion::Completed(path) => println!("{} {}", "Moved to".green(), path.display()),
        Completion::AlreadyComplete => println!("{}", "Already complete".yellow()),
    }
}

fn handle_evidence(action: EvidenceAction, config: &BusConfig) -> anyhow::Result<()> {
    let recorder = EvidenceRecorder::open(config.paths().evidence_path(), config.evidence_max_lines)?;
    match action {
        EvidenceAction::Tail {
            count,
            kind,
            domain,
            format,
        } => {
            let kind = kind
                .map(|k| serde_json::from_value::<EvidenceKind>(serde_json::Value::String(k)))
                .transpose()
                .context("unknown evidence kind")?;
            let records = recorder.tail(count, kind, domain.as_deref())?;
            match format {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&records)?),
                OutputFormat::Text => {
                    if records.is_empty() {
                        println!("{}", "No evidence recorded".dimmed());
                    }
                    for record in records {
                        let place = [
                            record.context.domain.as_deref(),
                            record.context.participant.as_deref(),
                        ]
                        .into_iter()
                        .flatten()
                        .collect::<Vec<_>>()
                        .join("/");
                        println!(
                            "{} {} {} {}",
                            record.ts.format("%Y-%m-%d %H:%M:%S").to_string().dimmed(),
                            record.kind.to_string().red(),
                            place.bright_white(),
                            record.description
                        );
                    }
                }
            }
        }
        EvidenceAction::Summary { format } => {
            let summary = recorder.summary()?;
            match format {
                OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&summary)?),
                OutputFormat::Text => {
                    println!("{} {}", "Evidence records:".bright_blue().bold(), summary.total);
                    for (kind, n) in &summary.by_kind {
                        println!("  {:<20} {}", kind.to_string().red(), n);
                    }
                    if !summary.by_domain.is_empty() {
                        println!("{}", "By domain:".bright_blue());
                        for (domain, n) in &summary.by_domain {
                            println!("  {:<20} {}", domain, n);
                        }
                    }
                }
            }
        }
    }
    Ok(())
}
