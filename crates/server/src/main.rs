//! haul binary.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use figment::Figment;
use figment::providers::{Env, Format, Toml};
use haul_core::config::AppConfig;
use haul_core::{AccessStatus, JobStatus, Subject, SubjectKind};
use haul_metadata::models::{JobFilter, LogFilter};
use haul_metadata::repos::LogRepo;
use haul_metadata::{MetadataStore, SqliteStore};
use haul_server::delivery::JsonLinesDelivery;
use haul_server::fetcher::CommandFetcher;
use haul_server::logs::{LogBroadcaster, LogEvent, PersistLayer, spawn_log_writer};
use haul_server::{AccessGate, AdmissionOutcome, AppState, JobLedger, Request};
use serde::Deserialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// haul - deduplicating media fetch service
/// How long shutdown waits for queued log events to be written.
const LOG_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Parser, Debug)]
#[command(name = "haul")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, env = "HAUL_CONFIG", default_value = "config/haul.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Apply pending schema migrations and exit.
    Migrate,
    /// Read requests as JSON lines on stdin and write replies as JSON lines on stdout.
    Serve {
        /// Write a metrics snapshot to this file on shutdown.
        #[arg(long)]
        metrics_out: Option<PathBuf>,
    },
    /// Manage user and group access.
    Access {
        #[command(subcommand)]
        command: AccessCommand,
    },
    /// List ledger jobs, newest first.
    Jobs {
        #[arg(long)]
        status: Option<JobStatus>,
        #[arg(long)]
        requester: Option<i64>,
        #[arg(long, default_value_t = JobFilter::DEFAULT_LIMIT)]
        limit: u32,
        #[arg(long, default_value_t = 0)]
        offset: u32,
    },
    /// Show ledger statistics.
    Stats,
    /// List persisted log events, newest first.
    Logs {
        #[arg(long)]
        level: Option<String>,
        #[arg(long)]
        search: Option<String>,
        #[arg(long, default_value_t = LogFilter::DEFAULT_LIMIT)]
        limit: u32,
        #[arg(long, default_value_t = 0)]
        offset: u32,
    },
}

#[derive(Subcommand, Debug)]
enum AccessCommand {
    /// List subjects of a kind.
    List {
        kind: SubjectKind,
        #[arg(long)]
        status: Option<AccessStatus>,
    },
    Approve {
        kind: SubjectKind,
        id: i64,
    },
    Reject {
        kind: SubjectKind,
        id: i64,
    },
    /// Delete a subject; its next contact starts over as pending.
    Remove {
        kind: SubjectKind,
        id: i64,
    },
    /// Approve a subject directly, creating it if needed.
    Grant {
        kind: SubjectKind,
        id: i64,
        #[arg(long, default_value = "")]
        label: String,
    },
}

/// One line of `serve` input.
#[derive(Deserialize, Debug)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Inbound {
    Message(Request),
    MembershipChange {
        group_id: i64,
        #[serde(default)]
        title: String,
    },
}

fn load_config(path: &std::path::Path) -> Result<AppConfig> {
    // Runs before tracing is initialised; the file is optional.
    let mut figment = Figment::new();
    if path.exists() {
        figment = figment.merge(Toml::file(path));
    }

    let config: AppConfig = figment
        .merge(Env::prefixed("HAUL_").split("__"))
        .extract()
        .context("failed to load configuration")?;
    config.validate().context("invalid configuration")?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = load_config(&args.config)?;

    // Replies go to stdout, so human-readable logs go to stderr.
    let broadcaster = Arc::new(LogBroadcaster::new(config.logs.subscriber_capacity));
    let (log_tx, log_rx) = mpsc::unbounded_channel::<LogEvent>();
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(PersistLayer::new(broadcaster.clone(), Some(log_tx)))
        .init();

    let db_path = config.metadata.database_path();

    if let Command::Migrate = args.command {
        let store = SqliteStore::open(&db_path, config.metadata.busy_timeout_secs)
            .await
            .context("failed to open database")?;
        let applied = store.migrate().await.context("schema migration failed")?;
        let version = store.schema_version().await?;
        println!("applied {applied} migration(s), schema version {version}");
        return Ok(());
    }

    let store: Arc<dyn MetadataStore> = haul_metadata::from_config(&config.metadata)
        .await
        .context("failed to open metadata store")?;

    match args.command {
        Command::Migrate => Ok(()),
        Command::Serve { metrics_out } => {
            let writer_shutdown = CancellationToken::new();
            let writer = if config.logs.persist {
                Some(spawn_log_writer(
                    store.clone(),
                    log_rx,
                    writer_shutdown.clone(),
                ))
            } else {
                drop(log_rx);
                None
            };
            let result = serve(config, store, broadcaster, metrics_out).await;
            writer_shutdown.cancel();
            if let Some(writer) = writer
                && tokio::time::timeout(LOG_DRAIN_TIMEOUT, writer).await.is_err()
            {
                tracing::warn!(timeout = ?LOG_DRAIN_TIMEOUT, "Log writer did not drain in time");
            }
            result
        }
        Command::Access { command } => access(AccessGate::new(store), command).await,
        Command::Jobs {
            status,
            requester,
            limit,
            offset,
        } => {
            let filter = JobFilter {
                status,
                requester_id: requester,
                limit,
                offset,
            };
            let (rows, total) = JobLedger::new(store).list(&filter).await?;
            for job in &rows {
                println!(
                    "{}\t{}\t{}\t{}\t{}\t{}",
                    job.id,
                    job.created_at,
                    job.status,
                    job.requester_id,
                    job.url,
                    if job.error_text.is_empty() {
                        &job.result_name
                    } else {
                        &job.error_text
                    }
                );
            }
            println!("{} of {total} job(s)", rows.len());
            Ok(())
        }
        Command::Stats => {
            let stats = JobLedger::new(store).stats().await?;
            println!("total:      {}", stats.total);
            println!("succeeded:  {}", stats.succeeded);
            println!("failed:     {}", stats.failed);
            println!("requesters: {}", stats.active_requesters);
            println!("last 30 days:");
            for day in &stats.daily {
                println!("  {}  {}", day.day, day.count);
            }
            println!("top domains:");
            for domain in &stats.top_domains {
                println!("  {}  {}", domain.domain, domain.count);
            }
            Ok(())
        }
        Command::Logs {
            level,
            search,
            limit,
            offset,
        } => {
            let filter = LogFilter {
                level,
                search,
                limit,
                offset,
            };
            let (rows, total) = store.list_logs(&filter).await?;
            for log in &rows {
                println!(
                    "{}\t{}\t{}\t{}",
                    log.created_at, log.level, log.message, log.fields_json
                );
            }
            println!("{} of {total} log event(s)", rows.len());
            Ok(())
        }
    }
}

async fn access(gate: AccessGate, command: AccessCommand) -> Result<()> {
    match command {
        AccessCommand::List { kind, status } => {
            for row in gate.list(kind, status).await? {
                println!("{}\t{}\t{}\t{}", row.id, row.status, row.added_at, row.label);
            }
        }
        AccessCommand::Approve { kind, id } => gate.approve(Subject::new(kind, id)).await?,
        AccessCommand::Reject { kind, id } => gate.reject(Subject::new(kind, id)).await?,
        AccessCommand::Remove { kind, id } => gate.remove(Subject::new(kind, id)).await?,
        AccessCommand::Grant { kind, id, label } => {
            gate.grant(Subject::new(kind, id), &label).await?
        }
    }
    Ok(())
}

async fn serve(
    config: AppConfig,
    store: Arc<dyn MetadataStore>,
    broadcaster: Arc<LogBroadcaster>,
    metrics_out: Option<PathBuf>,
) -> Result<()> {
    haul_server::metrics::register_metrics();
    tracing::info!("haul v{}", env!("CARGO_PKG_VERSION"));

    let fetcher = Arc::new(CommandFetcher::new(&config.fetcher));
    let delivery = Arc::new(JsonLinesDelivery::new(tokio::io::stdout()));
    let state = AppState::new(config, store, fetcher, delivery, broadcaster)
        .await
        .context("failed to initialize application state")?;

    let shutdown = CancellationToken::new();
    let background = state.spawn_background_tasks(shutdown.clone());

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut tasks = JoinSet::new();
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                tracing::info!("Shutdown requested, cancelling in-flight requests");
                shutdown.cancel();
                break;
            }
            line = lines.next_line() => {
                let Some(line) = line.context("failed to read stdin")? else {
                    tracing::info!("Input closed, waiting for in-flight requests");
                    break;
                };
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<Inbound>(&line) {
                    Ok(Inbound::Message(request)) => {
                        let admission = state.admission.clone();
                        let cancel = shutdown.child_token();
                        tasks.spawn(async move {
                            match admission.handle(&request, &cancel).await {
                                AdmissionOutcome::Ignored => {
                                    tracing::debug!(message_id = request.message_id, "No filter matched");
                                }
                                AdmissionOutcome::Denied(subject) => {
                                    tracing::info!(subject = %subject, "Request denied");
                                }
                                AdmissionOutcome::Delivered { job_id, result } => {
                                    tracing::info!(job_id = ?job_id, file = %result.artifact_path.display(), "Request delivered");
                                }
                                AdmissionOutcome::Failed { job_id, error } => {
                                    tracing::warn!(job_id = ?job_id, code = error.code(), error = %error, "Request failed");
                                }
                            }
                        });
                    }
                    Ok(Inbound::MembershipChange { group_id, title }) => {
                        if let Err(e) = state.admission.on_membership_change(group_id, &title).await {
                            tracing::warn!(group_id, error = %e, "Failed to register group");
                        }
                    }
                    Err(e) => tracing::warn!(error = %e, "Ignoring malformed input line"),
                }
            }
            Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                if let Err(e) = joined {
                    tracing::error!(error = %e, "Request task failed");
                }
            }
        }
    }

    while let Some(joined) = tasks.join_next().await {
        if let Err(e) = joined {
            tracing::error!(error = %e, "Request task failed");
        }
    }

    shutdown.cancel();
    for handle in background {
        if let Err(e) = handle.await {
            tracing::error!(error = %e, "Background task failed");
        }
    }

    if let Some(path) = metrics_out {
        let text = haul_server::metrics::encode_metrics().context("failed to encode metrics")?;
        tokio::fs::write(&path, text)
            .await
            .with_context(|| format!("failed to write metrics to {}", path.display()))?;
    }

    tracing::info!("Shutdown complete");
    Ok(())
}
