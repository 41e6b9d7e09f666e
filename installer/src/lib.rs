// Stack installer
// Library entry point: logging, capability composition, and command dispatch.

mod api;
mod cli;
mod config;
mod descriptor;
mod error;
mod installation;
mod models;
mod orchestration;
mod prompt;
mod reconcile;
mod security;
#[cfg(test)]
mod testing;
mod utils;

use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use log::{error, info, warn};
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use api::installer::{new_correlation_id, run_installation, Capabilities, RunStatus};
use api::progress::{ProgressEmitter, ProgressPayload, ProgressReporter};
use cli::{Cli, Command, ConfigAction, InstallArgs};
use config::{EngineConfig, InstallContext};
use error::InstallError;
use installation::certificates::OpensslCertificateProvider;
use installation::docker::DockerCli;
use prompt::{NonInteractivePrompter, Prompter, TerminalPrompter};
use reconcile::ports::TcpPortProber;

/// Initialize logging with dual format (JSON lines + human-readable text).
fn init_logging(log_dir: &Path, with_stdout: bool, run_id: &str) -> Result<(), Box<dyn std::error::Error>> {
    std::fs::create_dir_all(log_dir)?;

    let timestamp = chrono::Utc::now().format("%Y-%m-%d-%H%M%S");
    let json_log_file = log_dir.join(format!("installer-{}.log", timestamp));
    let txt_log_file = log_dir.join(format!("installer-{}.txt", timestamp));

    // stdout stays off unless asked for; the progress bar and prompts own the terminal.
    let mut dispatch = fern::Dispatch::new()
        .level(log::LevelFilter::Debug)
        .level_for("reqwest", log::LevelFilter::Warn)
        .level_for("hyper_util", log::LevelFilter::Warn);

    if with_stdout {
        dispatch = dispatch.chain(
            fern::Dispatch::new()
                .level(log::LevelFilter::Info)
                .format(move |out, message, record| {
                    let timestamp_local = chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f");
                    let message_str = format!("{}", message);
                    let (phase, step, cleaned_message) =
                        utils::logging::parse_log_metadata(&message_str);
                    let txt_line = utils::logging::format_human_readable_log(
                        &timestamp_local.to_string(),
                        record.level(),
                        record.target(),
                        &cleaned_message,
                        phase.as_deref(),
                        step.as_deref(),
                    );
                    out.finish(format_args!("{}", txt_line));
                })
                .chain(std::io::stdout()),
        );
    }

    let json_run_id = run_id.to_string();
    dispatch = dispatch
        .chain(
            fern::Dispatch::new()
                .format(move |out, message, record| {
                    let timestamp_utc = chrono::Utc::now().to_rfc3339();
                    let message_str = format!("{}", message);
                    let (phase, step, cleaned_message) =
                        utils::logging::parse_log_metadata(&message_str);
                    let json_line = utils::logging::format_json_log(
                        &timestamp_utc,
                        record.level(),
                        record.target(),
                        &cleaned_message,
                        phase.as_deref(),
                        step.as_deref(),
                        &json_run_id,
                    );
                    out.finish(format_args!("{}", json_line));
                })
                .chain(fern::log_file(json_log_file)?),
        )
        .chain(
            fern::Dispatch::new()
                .format(move |out, message, record| {
                    let timestamp_local = chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f");
                    let message_str = format!("{}", message);
                    let (phase, step, cleaned_message) =
                        utils::logging::parse_log_metadata(&message_str);
                    let txt_line = utils::logging::format_human_readable_log(
                        &timestamp_local.to_string(),
                        record.level(),
                        record.target(),
                        &cleaned_message,
                        phase.as_deref(),
                        step.as_deref(),
                    );
                    out.finish(format_args!("{}", txt_line));
                })
                .chain(fern::log_file(txt_log_file)?),
        );

    dispatch.apply()?;

    log::info!(
        "[PHASE: initialization] Logging initialized, log directory: {:?}",
        log_dir
    );
    Ok(())
}

fn print_error(err: &InstallError) {
    eprintln!("Error: {}", err);
    eprintln!("Fix:   {}", err.remediation());
}

/// Cancel `token` on Ctrl-C.
fn watch_interrupt(token: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("[PHASE: initialization] [STEP: signal] Interrupt received; cancelling");
            token.cancel();
        }
    });
}

fn progress_bar(enabled: bool) -> ProgressBar {
    if !enabled {
        return ProgressBar::hidden();
    }
    let pb = ProgressBar::new(100);
    let style = ProgressStyle::with_template("{spinner} [{bar:30}] {pos:>3}% {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("=> ");
    pb.set_style(style);
    pb
}

fn emitter_for(pb: &ProgressBar) -> ProgressEmitter {
    let pb = pb.clone();
    Arc::new(move |p: ProgressPayload| {
        pb.set_position(p.percent.max(0) as u64);
        if p.severity != "info" {
            pb.println(format!("[{}] {}: {}", p.severity, p.phase, p.message));
        }
        pb.set_message(p.message);
    })
}

async fn compose_capabilities(config: &EngineConfig, interactive: bool) -> Result<Capabilities, InstallError> {
    let docker = DockerCli::detect(config)
        .await
        .map_err(|e| InstallError::from_engine("docker detection", &e))?;
    match docker.version().await {
        Ok(v) => info!(
            "[PHASE: preflight] [STEP: docker] Docker {:?} via {:?}",
            v,
            docker.compose_invocation()
        ),
        Err(e) => warn!("[PHASE: preflight] [STEP: docker] Could not read docker version: {:#}", e),
    }

    let prompter: Arc<dyn Prompter> = match (interactive, TerminalPrompter::detect()) {
        (true, Some(p)) => Arc::new(p),
        _ => Arc::new(NonInteractivePrompter),
    };
    Ok(Capabilities {
        engine: Arc::new(docker),
        prober: Arc::new(TcpPortProber),
        prompter,
        certificates: Arc::new(OpensslCertificateProvider::new(config.install_dir.join("certs"))),
    })
}

async fn install(config: EngineConfig, args: InstallArgs, run_id: String) -> i32 {
    let options = args.to_options();
    let interactive = !options.non_interactive;
    let caps = match compose_capabilities(&config, interactive).await {
        Ok(c) => c,
        Err(e) => {
            print_error(&e);
            return e.exit_code();
        }
    };

    let cancel = CancellationToken::new();
    watch_interrupt(cancel.clone());

    let pb = progress_bar(!args.json);
    let progress = ProgressReporter::new(run_id, Some(emitter_for(&pb)));
    let ctx = InstallContext::new(config, options);

    let result = run_installation(&ctx, &caps, &cancel, &progress).await;
    pb.finish_and_clear();

    let report = match result {
        Ok(r) => r,
        Err(e) => {
            error!("[PHASE: install] [STEP: failed] {} ({:?})", e, e.kind());
            print_error(&e);
            return e.exit_code();
        }
    };

    if args.json {
        match serde_json::to_string_pretty(&report) {
            Ok(s) => println!("{}", s),
            Err(e) => eprintln!("Failed to serialize report: {}", e),
        }
    } else {
        println!("State:       {}", report.state);
        println!("Credentials: {} ({})", report.decision, report.decision_reason);
        println!("Ports:       {}", report.ports.assignment);
        for m in &report.ports.moved {
            println!("  moved {} {} -> {}", m.name, m.from, m.to);
        }
        if !report.removed_volumes.is_empty() {
            println!("Removed:     {}", report.removed_volumes.join(", "));
        }
        if let Some(v) = &report.validation {
            println!("Validation:  {}", v);
        }
        if let Some(preview) = &report.preview {
            println!("\n{}", preview);
        }
        if let Some(backup) = &report.backup_path {
            println!("Backup:      {}", backup.display());
        }
        match report.status {
            RunStatus::Planned => println!("Dry run: nothing was written or started."),
            RunStatus::Installed => println!("Installation complete."),
            RunStatus::Degraded => {
                let not_ready = report
                    .startup
                    .as_ref()
                    .map(|s| s.outcome.not_ready().join(", "))
                    .unwrap_or_default();
                println!("Installation running in degraded mode; not ready: {}", not_ready);
            }
            RunStatus::Failed => {}
        }
    }

    match report.failure() {
        Some(e) => {
            print_error(&e);
            e.exit_code()
        }
        None => 0,
    }
}

async fn status(config: EngineConfig, json: bool) -> i32 {
    let caps = match compose_capabilities(&config, false).await {
        Ok(c) => c,
        Err(e) => {
            print_error(&e);
            return e.exit_code();
        }
    };
    let report = api::status::collect_status(&config, &caps).await;
    if json {
        match serde_json::to_string_pretty(&report) {
            Ok(s) => println!("{}", s),
            Err(e) => eprintln!("Failed to serialize status: {}", e),
        }
    } else {
        for line in report.lines() {
            println!("{}", line);
        }
    }
    0
}

/// Parse the command line, run the chosen command, and return the process exit code.
pub fn run() -> i32 {
    let cli = Cli::parse();
    let install_dir = utils::path_resolver::resolve_install_dir(cli.install_dir.as_deref());

    let config = match EngineConfig::load(cli.config.as_deref(), install_dir.as_deref()) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            eprintln!("Fix:   Correct the configuration file or STACK_INSTALLER__* variables.");
            return 2;
        }
    };

    if let Some(Command::Config {
        action: ConfigAction::Show,
    }) = &cli.command
    {
        return match toml::to_string_pretty(&config) {
            Ok(s) => {
                print!("{}", s);
                0
            }
            Err(e) => {
                eprintln!("Failed to render configuration: {}", e);
                1
            }
        };
    }

    let run_id = new_correlation_id();
    match utils::path_resolver::resolve_log_folder(&config.install_dir) {
        Ok(dir) => {
            if let Err(e) = init_logging(&dir, cli.verbose, &run_id) {
                eprintln!("Failed to initialize logging: {}", e);
            }
        }
        Err(e) => eprintln!("Failed to resolve log folder: {}", e),
    }
    info!(
        "[PHASE: initialization] stack-installer {} starting (run {})",
        env!("CARGO_PKG_VERSION"),
        run_id
    );

    let rt = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Failed to create async runtime: {}", e);
            return 1;
        }
    };

    rt.block_on(async move {
        match cli.command {
            Some(Command::Status { json }) => status(config, json).await,
            Some(Command::Install(args)) => install(config, args, run_id).await,
            None => install(config, InstallArgs::default(), run_id).await,
            Some(Command::Config { .. }) => 0,
        }
    })
}
