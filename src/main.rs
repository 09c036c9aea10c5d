//! Issue tracker CLI - runs the control plane or works on the issue store directly.

use app_issue_tracker::agents::ProcessRegistry;
use app_issue_tracker::app::App;
use app_issue_tracker::cli::{Cli, Commands, IssueCommands};
use app_issue_tracker::commands::issues::{
    self, CreateIssueRequest, IssueChanged, IssueList, IssueShow, UpdateIssueRequest, cli_reporter,
};
use app_issue_tracker::commands::{self, CommandResult};
use app_issue_tracker::config::{Paths, ServerConfig, parse_origins};
use app_issue_tracker::events::EventHub;
use app_issue_tracker::lifecycle::Lifecycle;
use app_issue_tracker::processor::ProcessorState;
use app_issue_tracker::storage::IssueStore;
use app_issue_tracker::storage::artifacts::ArtifactPayload;
use base64::Engine;
use clap::Parser;
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

fn main() {
    let cli = Cli::parse();
    let human = cli.human_readable;

    // Held until exit so buffered file logs are flushed
    let _log_guard = init_logging(cli.log_json, cli.log_dir.as_deref());

    if let Err(e) = run_command(cli, human) {
        if human {
            eprintln!("Error: {}", e);
        } else {
            eprintln!("{}", serde_json::json!({ "error": e.to_string() }));
        }
        process::exit(1);
    }
}

/// Install the stderr subscriber and, with `--log-dir`, a daily-rotated JSON file.
fn init_logging(json: bool, log_dir: Option<&Path>) -> Option<WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let (file_layer, guard) = match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "issue-tracker.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (
                Some(fmt::layer().json().with_ansi(false).with_writer(writer)),
                Some(guard),
            )
        }
        None => (None, None),
    };

    let registry = tracing_subscriber::registry().with(filter).with(file_layer);
    let installed = if json {
        registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .try_init()
    } else {
        registry
            .with(fmt::layer().with_writer(std::io::stderr))
            .try_init()
    };
    if let Err(e) = installed {
        eprintln!("Failed to initialize logging: {}", e);
    }

    guard
}

fn run_command(cli: Cli, human: bool) -> Result<(), app_issue_tracker::Error> {
    let paths = Paths::resolve(cli.scenario_root.as_deref(), cli.data_dir.as_deref())?;

    match cli.command {
        Commands::Serve {
            port,
            host,
            allowed_origins,
            processor_active,
            concurrent_slots,
            refresh_interval,
            max_issues,
        } => {
            if concurrent_slots == 0 || refresh_interval == 0 {
                return Err(app_issue_tracker::Error::InvalidInput(
                    "--concurrent-slots and --refresh-interval must be at least 1".to_string(),
                ));
            }
            let mut config = ServerConfig::new(paths);
            config.port = port;
            config.host = host;
            config.allowed_origins = parse_origins(&allowed_origins);
            config.processor = ProcessorState {
                active: processor_active,
                concurrent_slots,
                refresh_interval,
                max_issues,
                ..ProcessorState::default()
            };
            // Fail before starting a runtime when the port is missing
            config.listen_addr()?;
            run_server(config)?;
        }

        Commands::Issue { command } => {
            let lifecycle = offline_lifecycle(&paths.data_dir)?;
            match command {
                IssueCommands::Create {
                    title,
                    description,
                    issue_type,
                    priority,
                    app_id,
                    error_message,
                    reporter_name,
                    reporter_email,
                    tags,
                    attachments,
                } => {
                    let request = CreateIssueRequest {
                        title,
                        description,
                        issue_type,
                        priority,
                        app_id,
                        error_message,
                        reporter: cli_reporter(reporter_name, reporter_email),
                        tags,
                        artifacts: read_attachments(&attachments)?,
                        ..CreateIssueRequest::default()
                    };
                    let issue = issues::create(&lifecycle, &request)?;
                    output(&IssueShow { issue }, human);
                }
                IssueCommands::List { status, limit } => {
                    let found = issues::list(lifecycle.store(), status.as_deref(), limit)?;
                    output(&IssueList::new(found), human);
                }
                IssueCommands::Show { id } => {
                    let (issue, _) = lifecycle.store().load(&id)?;
                    output(&IssueShow { issue }, human);
                }
                IssueCommands::Move { id, status } => {
                    let request = UpdateIssueRequest {
                        status: Some(status),
                        ..UpdateIssueRequest::default()
                    };
                    let issue = issues::update(&lifecycle, &id, &request)?;
                    output(
                        &IssueChanged {
                            id: issue.id,
                            action: "moved",
                            status: issue.status,
                        },
                        human,
                    );
                }
                IssueCommands::Delete { id } => {
                    let issue = issues::delete(&lifecycle, &id)?;
                    output(
                        &IssueChanged {
                            id: issue.id,
                            action: "deleted",
                            status: issue.status,
                        },
                        human,
                    );
                }
            }
        }

        Commands::RateLimit => {
            let lifecycle = offline_lifecycle(&paths.data_dir)?;
            output(&commands::agents::rate_limit_status(&lifecycle)?, human);
        }

        Commands::Transcript { path, max } => {
            output(
                &commands::agents::transcript(&paths.scenario_root, &path, max)?,
                human,
            );
        }
    }

    Ok(())
}

/// Lifecycle for commands that run without the server: no events, no agents.
fn offline_lifecycle(data_dir: &Path) -> Result<Lifecycle, app_issue_tracker::Error> {
    let store = IssueStore::open(data_dir)?;
    Ok(Lifecycle::new(
        Arc::new(store),
        EventHub::noop(),
        ProcessRegistry::new(),
    ))
}

/// Read files given with `--attach` as base64 artifacts.
fn read_attachments(files: &[PathBuf]) -> Result<Vec<ArtifactPayload>, app_issue_tracker::Error> {
    files
        .iter()
        .map(|file| {
            let bytes = std::fs::read(file)?;
            let name = file
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            Ok(ArtifactPayload {
                name,
                category: "attachment".to_string(),
                content: base64::engine::general_purpose::STANDARD.encode(bytes),
                encoding: "base64".to_string(),
                ..ArtifactPayload::default()
            })
        })
        .collect()
}

/// Run the server on a multi-threaded runtime until shutdown.
fn run_server(config: ServerConfig) -> Result<(), app_issue_tracker::Error> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| app_issue_tracker::Error::Other(format!("Failed to create runtime: {}", e)))?
        .block_on(async { App::build(config)?.serve().await })
}

/// Print output in JSON or human-readable format.
fn output<T: CommandResult>(result: &T, human: bool) {
    if human {
        println!("{}", result.to_human());
    } else {
        println!("{}", result.to_json());
    }
}
