//! procward - cross-platform process inspection and termination
//!
//! Thin CLI over [`pw_core::ProcessController`]: every subcommand maps to one
//! provider operation or report. Payloads go to stdout, logs to stderr.

use clap::{Args, Parser, Subcommand};
use pw_common::{Error, OutputFormat, Result};
use pw_config::{load_config, ProcwardConfig};
use pw_core::collect::{ToolConfig, ToolRunner};
use pw_core::exit_codes::ExitCode;
use pw_core::logging::{
    event_names, generate_run_id, get_host_id, init_logging, LogConfig, LogContext, LogLevel,
    Stage,
};
use pw_core::provider::{
    validate_pid, KillOptions, ListOptions, MatchMode, Operation, OperationOutput,
    ProcessProvider, SortKey,
};
use pw_core::integration::JsonlAuditSink;
use pw_core::{log_event, ProcessController};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Find, inspect and terminate processes on Unix and Windows
#[derive(Parser)]
#[command(name = "procward")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[command(flatten)]
    global: GlobalOpts,
}

/// Global options available to all commands
#[derive(Args, Debug)]
struct GlobalOpts {
    /// Configuration file (JSON or TOML)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Output format
    #[arg(long, short = 'f', global = true, default_value = "json")]
    format: OutputFormat,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Only log errors
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Append kill audit events as JSON lines to this file
    #[arg(long, global = true)]
    audit_log: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Detect the platform, tools and capabilities
    Detect {
        /// Ignore the cached snapshot
        #[arg(long)]
        refresh: bool,
    },

    /// Show merged capability flags
    Capabilities,

    /// List processes
    List(ListArgs),

    /// Show one process
    Info { pid: u64 },

    /// Check whether a process exists
    Exists { pid: u64 },

    /// Kill a process by pid
    Kill(KillArgs),

    /// Kill every process matching a name
    KillName(KillNameArgs),

    /// Kill a process and all of its descendants
    KillTree { pid: u64 },

    /// Stop a service
    KillService {
        name: String,
        /// Stop without waiting for a graceful shutdown
        #[arg(long)]
        force: bool,
    },

    /// Send a signal (Unix) or the closest equivalent (Windows)
    Signal { pid: u64, signal: String },

    /// Self-test and judge recorded error rate and latency
    Health,

    /// Per-operation statistics and recommendations
    Stats,

    /// Show the resolved configuration
    Config {
        /// Print the built-in defaults instead
        #[arg(long)]
        print_default: bool,
    },
}

impl Commands {
    fn stage(&self) -> Stage {
        match self {
            Commands::Detect { .. } | Commands::Capabilities => Stage::Detect,
            Commands::List(_) | Commands::Info { .. } | Commands::Exists { .. } => Stage::Inspect,
            Commands::Kill(_)
            | Commands::KillName(_)
            | Commands::KillTree { .. }
            | Commands::KillService { .. }
            | Commands::Signal { .. } => Stage::Kill,
            Commands::Health | Commands::Stats => Stage::Health,
            Commands::Config { .. } => Stage::Init,
        }
    }
}

#[derive(Args, Debug)]
struct ListArgs {
    /// Case-insensitive substring of name or command
    #[arg(long)]
    filter: Option<String>,

    /// pid, name, cpu or memory
    #[arg(long, default_value = "pid")]
    sort: String,

    #[arg(long)]
    limit: Option<usize>,
}

#[derive(Args, Debug)]
struct KillArgs {
    pid: u64,

    /// Skip graceful termination
    #[arg(long)]
    force: bool,

    /// Walk graceful to forceful termination
    #[arg(long)]
    escalate: bool,

    /// Signal to send (name or number)
    #[arg(long)]
    signal: Option<String>,

    /// Kill descendants first
    #[arg(long)]
    children: bool,

    /// How long to wait for the process to exit
    #[arg(long)]
    timeout_ms: Option<u64>,
}

#[derive(Args, Debug)]
struct KillNameArgs {
    pattern: String,

    /// Treat the pattern as a case-insensitive regular expression
    #[arg(long)]
    regex: bool,

    /// Match against the full command line too
    #[arg(long)]
    command: bool,

    /// Refuse if more processes than this match
    #[arg(long)]
    max: Option<usize>,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let cli_level = if cli.global.quiet {
        Some(LogLevel::Error)
    } else if cli.global.verbose > 0 {
        Some(LogLevel::Warn.louder(cli.global.verbose))
    } else {
        None
    };
    init_logging(&LogConfig::from_env(cli_level, None));

    let ctx = LogContext::new(generate_run_id(), get_host_id());
    log_event!(ctx, INFO, event_names::RUN_STARTED, Stage::Init, "procward started");

    let exit_code = match run(&cli, &ctx).await {
        Ok(code) => code,
        Err(e) => {
            report_error(&cli.global, &e);
            ExitCode::from(&e)
        }
    };

    let stage = cli.command.stage();
    let code = exit_code.as_i32();
    let summary = format!("procward finished: {}", exit_code.code_name());
    if exit_code == ExitCode::InternalError {
        log_event!(ctx, ERROR, event_names::INTERNAL_ERROR, stage, summary, exit_code = code);
    } else if exit_code.is_error() {
        log_event!(ctx, WARN, event_names::RUN_FINISHED, stage, summary, exit_code = code);
    } else {
        log_event!(ctx, INFO, event_names::RUN_FINISHED, stage, summary, exit_code = code);
    }
    std::process::exit(exit_code.as_i32());
}

async fn run(cli: &Cli, ctx: &LogContext) -> Result<ExitCode> {
    let global = &cli.global;

    if let Commands::Config { print_default } = &cli.command {
        return run_config(global, ctx, *print_default);
    }

    let config = load(global, ctx)?;
    let runner = Arc::new(ToolRunner::new(ToolConfig::from_settings(&config.runner)));
    let provider = Arc::new(ProcessProvider::new(runner, Arc::new(config)));

    if let Commands::Detect { refresh } = &cli.command {
        let info = provider
            .detector()
            .detect(*refresh)
            .await
            .map_err(Error::from)?;
        emit(global, &*info, || {
            let mut lines = vec![
                format!("platform:   {} ({})", info.platform, info.arch),
                format!("version:    {}", info.os_version.version),
                format!("confidence: {:.2}", info.confidence),
            ];
            let tools: Vec<&str> = info
                .tools
                .iter()
                .filter(|(_, t)| t.available)
                .map(|(name, _)| name.as_str())
                .collect();
            lines.push(format!("tools:      {}", tools.join(", ")));
            lines.join("\n")
        });
        return Ok(ExitCode::Clean);
    }

    let mut controller = ProcessController::start(Arc::clone(&provider)).await?;
    if let Some(path) = &global.audit_log {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        controller = controller.with_audit(Arc::new(JsonlAuditSink::new(file)));
    }
    let family = provider
        .platform()
        .map(|p| p.family)
        .ok_or(Error::NotInitialized)?;

    let operation = match &cli.command {
        Commands::Capabilities => {
            let caps = controller.capabilities().await?;
            emit(global, &caps, || {
                caps.iter()
                    .map(|(name, on)| format!("{name:<28} {}", if *on { "yes" } else { "no" }))
                    .collect::<Vec<_>>()
                    .join("\n")
            });
            return Ok(ExitCode::Clean);
        }
        Commands::Health => {
            let report = controller.health_check().await?;
            emit(global, &report, || {
                if report.healthy {
                    "healthy".to_string()
                } else {
                    format!("unhealthy: {}", report.reasons.join("; "))
                }
            });
            return Ok(ExitCode::for_outcome(report.healthy));
        }
        Commands::Stats => {
            #[derive(Serialize)]
            struct StatsView {
                statistics: pw_core::provider::ProviderStatistics,
                recommendations: Vec<pw_core::optimize::Recommendation>,
                strategies: Vec<pw_core::optimize::StrategyInfo>,
            }
            let view = StatsView {
                statistics: controller.statistics(),
                recommendations: controller.recommendations(),
                strategies: controller.engine().strategies(),
            };
            emit(global, &view, || {
                format!(
                    "calls: {}  failures: {}  avg latency: {:.1}ms",
                    view.statistics.total_calls(),
                    view.statistics.total_failures(),
                    view.statistics.avg_latency_ms()
                )
            });
            return Ok(ExitCode::Clean);
        }
        Commands::List(args) => Operation::ListProcesses {
            options: ListOptions {
                filter: args.filter.clone(),
                sort: args.sort.parse::<SortKey>()?,
                limit: args.limit,
            },
        },
        Commands::Info { pid } => Operation::GetProcessInfo {
            pid: validate_pid(*pid, family)?,
        },
        Commands::Exists { pid } => Operation::ProcessExists {
            pid: validate_pid(*pid, family)?,
        },
        Commands::Kill(args) => Operation::KillByPid {
            pid: validate_pid(args.pid, family)?,
            options: KillOptions {
                signal: args
                    .signal
                    .as_deref()
                    .map(pw_common::Signal::parse)
                    .transpose()?,
                force: args.force,
                escalate: args.escalate,
                include_children: args.children,
                timeout: args.timeout_ms.map(Duration::from_millis),
                ..KillOptions::default()
            },
        },
        Commands::KillName(args) => Operation::KillByName {
            pattern: args.pattern.clone(),
            options: KillOptions {
                match_mode: if args.regex {
                    MatchMode::Regex
                } else {
                    MatchMode::Exact
                },
                match_command: args.command,
                max_matches: args.max,
                ..KillOptions::default()
            },
        },
        Commands::KillTree { pid } => Operation::KillProcessTree {
            root: validate_pid(*pid, family)?,
            options: KillOptions::default(),
        },
        Commands::KillService { name, force } => Operation::KillService {
            name: name.clone(),
            options: KillOptions {
                force: *force,
                ..KillOptions::default()
            },
        },
        Commands::Signal { pid, signal } => Operation::SendSignal {
            pid: validate_pid(*pid, family)?,
            signal: signal.clone(),
        },
        Commands::Detect { .. } | Commands::Config { .. } => unreachable!("handled above"),
    };

    let output = controller.execute(operation).await;
    controller.shutdown().await;
    let output = output?;
    emit(global, &output, || describe(&output));
    Ok(ExitCode::for_outcome(output.succeeded()))
}

fn load(global: &GlobalOpts, ctx: &LogContext) -> Result<ProcwardConfig> {
    let loaded = load_config(global.config.as_deref())?;
    match &loaded.path {
        Some(path) => log_event!(
            ctx,
            INFO,
            event_names::CONFIG_LOADED,
            Stage::Init,
            format!("configuration from {} ({})", path.display(), loaded.source)
        ),
        None => log_event!(
            ctx,
            DEBUG,
            event_names::CONFIG_DEFAULT_USED,
            Stage::Init,
            "using built-in configuration"
        ),
    }
    Ok(loaded.config)
}

fn run_config(global: &GlobalOpts, ctx: &LogContext, print_default: bool) -> Result<ExitCode> {
    #[derive(Serialize)]
    struct ConfigView {
        source: String,
        path: Option<String>,
        config: ProcwardConfig,
    }

    let view = if print_default {
        ConfigView {
            source: "builtin default".to_string(),
            path: None,
            config: ProcwardConfig::default(),
        }
    } else {
        let loaded = load_config(global.config.as_deref())?;
        log_event!(ctx, DEBUG, event_names::CONFIG_LOADED, Stage::Init, "configuration resolved");
        ConfigView {
            source: loaded.source.to_string(),
            path: loaded.path.map(|p| p.display().to_string()),
            config: loaded.config,
        }
    };
    emit(global, &view, || {
        let body = serde_json::to_string_pretty(&view.config).unwrap_or_default();
        match &view.path {
            Some(path) => format!("# {} ({})\n{body}", path, view.source),
            None => format!("# {}\n{body}", view.source),
        }
    });
    Ok(ExitCode::Clean)
}

/// Print a payload in the selected format.
fn emit<T: Serialize>(global: &GlobalOpts, value: &T, human: impl FnOnce() -> String) {
    match global.format {
        OutputFormat::Json => match serde_json::to_string_pretty(value) {
            Ok(text) => println!("{text}"),
            Err(e) => eprintln!("failed to serialize output: {e}"),
        },
        OutputFormat::Jsonl => match serde_json::to_string(value) {
            Ok(text) => println!("{text}"),
            Err(e) => eprintln!("failed to serialize output: {e}"),
        },
        OutputFormat::Human => println!("{}", human()),
    }
}

fn report_error(global: &GlobalOpts, error: &Error) {
    if global.format.is_machine() {
        let report = serde_json::json!({ "error": error.report() });
        eprintln!("{report}");
    } else {
        eprintln!("error: {error}");
        eprintln!("hint: {}", error.remediation());
    }
}

fn describe(output: &OperationOutput) -> String {
    match output {
        OperationOutput::Kill(r) => match &r.error {
            None => format!("pid {}: {} via {}", r.pid, outcome(r.success), r.method),
            Some(e) => format!("pid {}: {} via {} ({e})", r.pid, outcome(r.success), r.method),
        },
        OperationOutput::KillByName(r) => {
            let mut lines = vec![format!("killed {} of {} matches", r.killed_count, r.total_found)];
            for member in &r.results {
                lines.push(format!(
                    "  pid {}: {}{}",
                    member.pid,
                    outcome(member.success),
                    member
                        .error
                        .as_deref()
                        .map(|e| format!(" ({e})"))
                        .unwrap_or_default()
                ));
            }
            lines.join("\n")
        }
        OperationOutput::Tree(r) => format!(
            "killed {} of {} processes via {}",
            r.killed_count, r.total_processes, r.method
        ),
        OperationOutput::Processes(snapshot) => {
            let header = format!("{:>8} {:>8} {:>6} {:>10}  NAME", "PID", "PPID", "CPU%", "RSS");
            let mut lines = vec![header];
            for record in &snapshot.records {
                lines.push(format!(
                    "{:>8} {:>8} {:>6.1} {:>10}  {}",
                    record.pid,
                    record.ppid.map(|p| p.to_string()).unwrap_or_else(|| "-".into()),
                    record.resources.cpu_percent,
                    record.resources.memory_bytes,
                    record.name
                ));
            }
            lines.join("\n")
        }
        OperationOutput::ProcessInfo(Some(record)) => format!(
            "pid {} ({}) parent {}\n  {}",
            record.pid,
            record.name,
            record.ppid.map(|p| p.to_string()).unwrap_or_else(|| "-".into()),
            record.command
        ),
        OperationOutput::ProcessInfo(None) => "no such process".to_string(),
        OperationOutput::Exists(exists) => exists.to_string(),
        OperationOutput::Service(r) => format!(
            "{}: {} -> {} ({})",
            r.service,
            r.previous_state,
            r.final_state,
            outcome(r.success)
        ),
        OperationOutput::Signal(r) => format!("pid {}: {} {}", r.pid, r.signal, outcome(r.success)),
    }
}

fn outcome(success: bool) -> &'static str {
    if success {
        "ok"
    } else {
        "failed"
    }
}
