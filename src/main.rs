#![forbid(unsafe_code)]

//! `dap-bridge`: start one debug session and report the first stop.
//!
//! Resolves an adapter from the catalog, creates a session (launch or
//! attach), waits for the debuggee to stop, prints the stop, the threads and
//! the top stack frames as JSON on stdout, then terminates the session.

use std::path::{Path, PathBuf};

use clap::{Parser, ValueEnum};
use serde::Serialize;
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use dap_bridge::adapters::{AdapterCatalog, AdapterKind, LaunchOptions, Target};
use dap_bridge::models::debug::{OutputLine, SourceLocation, StackFrame, Thread};
use dap_bridge::models::session::{SessionInfo, StopDescription};
use dap_bridge::orchestrator::{BreakpointRequest, SessionRequest, StartRequest};
use dap_bridge::{AppError, BridgeConfig, Result, SessionRegistry};

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(name = "dap-bridge", about = "Drive a debug adapter to its first stop", version, long_about = None)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Adapter name or alias; inferred from the program extension when omitted.
    #[arg(long)]
    adapter: Option<String>,

    /// Program to launch under the debugger.
    #[arg(long, required_unless_present = "attach", conflicts_with = "attach")]
    program: Option<String>,

    /// Attach to an adapter listening on HOST:PORT.
    #[arg(long, value_name = "HOST:PORT")]
    attach: Option<String>,

    /// Breakpoint to install before the debuggee runs (repeatable).
    #[arg(long = "break", value_name = "FILE:LINE")]
    breakpoints: Vec<String>,

    /// Stop at the program entry point.
    #[arg(long)]
    stop_on_entry: bool,

    /// Number of stack frames to report.
    #[arg(long, default_value_t = 5)]
    frames: usize,

    /// Log output format (text or json).
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    /// Arguments passed to the launched program.
    #[arg(last = true)]
    program_args: Vec<String>,
}

/// JSON report printed on stdout.
#[derive(Debug, Serialize)]
struct StopReport {
    session: SessionInfo,
    stop: StopDescription,
    threads: Vec<Thread>,
    frames: Vec<StackFrame>,
    output: Vec<OutputLine>,
}

fn main() -> Result<()> {
    let args = Cli::parse();
    init_tracing(args.log_format)?;

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| AppError::Config(format!("failed to build tokio runtime: {err}")))?
        .block_on(run(args))
}

async fn run(args: Cli) -> Result<()> {
    let config = match &args.config {
        Some(path) => BridgeConfig::load_from_path(path)?,
        None => BridgeConfig::default(),
    };
    info!("configuration loaded");

    let catalog = AdapterCatalog::new(&config);
    let kind = select_adapter(&args, &config)?;
    let request = build_request(&args, &catalog, kind)?;

    let registry = SessionRegistry::from_config(&config);
    let outcome = tokio::select! {
        report = inspect(&registry, request, &config, args.frames) => report,
        () = shutdown_signal() => {
            info!("shutdown signal received");
            Ok(None)
        }
    };

    registry.terminate_all(config.timeouts.terminate()).await;

    if let Some(report) = outcome? {
        let json = serde_json::to_string_pretty(&report)
            .map_err(|err| AppError::Io(format!("failed to render report: {err}")))?;
        println!("{json}");
    }
    Ok(())
}

fn select_adapter(args: &Cli, config: &BridgeConfig) -> Result<AdapterKind> {
    if let Some(name) = &args.adapter {
        return name.parse();
    }
    if let Some(kind) = args
        .program
        .as_deref()
        .and_then(|program| AdapterKind::for_source(Path::new(program)))
    {
        return Ok(kind);
    }
    config.default_adapter.parse()
}

fn build_request(args: &Cli, catalog: &AdapterCatalog, kind: AdapterKind) -> Result<SessionRequest> {
    let (target, start) = match (&args.attach, &args.program) {
        (Some(address), _) => {
            let (host, port) = parse_host_port(address)?;
            let start = StartRequest::Attach(catalog.attach_arguments(kind, &host, port));
            (Target::Attach { host, port }, start)
        }
        (None, Some(program)) => {
            let cwd = std::env::current_dir()
                .ok()
                .map(|dir| dir.to_string_lossy().into_owned());
            let options = LaunchOptions {
                program: program.clone(),
                args: args.program_args.clone(),
                cwd,
                stop_on_entry: args.stop_on_entry,
                ..LaunchOptions::default()
            };
            (Target::Launch, StartRequest::Launch(catalog.launch_arguments(kind, &options)))
        }
        (None, None) => {
            return Err(AppError::Config(
                "either --program or --attach is required".into(),
            ))
        }
    };

    let endpoint = catalog.resolve(kind, &target)?;
    let mut request =
        SessionRequest::new(kind.adapter_id(), endpoint, start).with_adapter_name(kind.name());
    for spec in &args.breakpoints {
        let location = SourceLocation::parse(spec)
            .ok_or_else(|| AppError::Config(format!("invalid breakpoint '{spec}', expected FILE:LINE")))?;
        request = request.with_breakpoint(BreakpointRequest::at(location));
    }
    Ok(request)
}

fn parse_host_port(address: &str) -> Result<(String, u16)> {
    let (host, port) = address
        .rsplit_once(':')
        .ok_or_else(|| AppError::Config(format!("invalid address '{address}', expected HOST:PORT")))?;
    let port = port
        .parse()
        .map_err(|_| AppError::Config(format!("invalid port in '{address}'")))?;
    Ok((host.to_owned(), port))
}

async fn inspect(
    registry: &SessionRegistry,
    request: SessionRequest,
    config: &BridgeConfig,
    frame_count: usize,
) -> Result<Option<StopReport>> {
    let id = registry.create_session(request).await?;
    let session = registry.get_session(&id).await?;

    let stop = session.wait_for_stop(config.timeouts.stop_wait()).await?;
    let threads = session.get_threads().await?;

    let frames = match stop.thread_id.or_else(|| threads.first().map(|t| t.id)) {
        Some(thread_id) => {
            let mut frames = session.get_stack_frames(thread_id).await?;
            frames.truncate(frame_count);
            frames
        }
        None => {
            warn!(session_id = %id, "stop names no thread, skipping stack trace");
            Vec::new()
        }
    };

    Ok(Some(StopReport {
        session: session.info(),
        stop,
        threads,
        frames,
        output: session.drain_output(),
    }))
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(err) => {
                warn!(%err, "failed to register SIGTERM handler, using ctrl-c only");
                let _ = ctrl_c.await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(err) = ctrl_c.await {
            tracing::error!(%err, "ctrl-c signal handler failed");
        }
    }
}

fn init_tracing(log_format: LogFormat) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr);

    match log_format {
        LogFormat::Text => subscriber
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
        LogFormat::Json => subscriber
            .json()
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
    }

    Ok(())
}
