mod backend;
mod client;
mod config;
mod delivery;
mod dispatcher;
mod hub;
mod language;
mod protocol;
mod runtime;
mod server;

use std::net::ToSocketAddrs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use config::Config;
use serde::Serialize;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Parser)]
#[command(author, version, about = "WebSocket broker between web chat widgets and the chat backend")]
struct Cli {
    /// Path to TOML config file.
    #[arg(
        long,
        global = true,
        env = "WEBCHAT_BROKER_CONFIG",
        default_value = "webchat-broker.toml"
    )]
    config: PathBuf,

    /// Override the listener address for websocket and HTTP traffic.
    #[arg(long, global = true, env = "WEBCHAT_BROKER_BIND")]
    bind: Option<String>,

    /// Log level filter, e.g. info,debug,trace. Defaults to the config value.
    #[arg(long, global = true, env = "WEBCHAT_BROKER_LOG")]
    log: Option<String>,

    #[command(subcommand)]
    command: Option<CliCommand>,
}

#[derive(Debug, Clone, Subcommand)]
enum CliCommand {
    /// Run the broker until ctrl-c.
    Run,
    /// Validate configuration and print diagnostics.
    Doctor(DoctorArgs),
}

#[derive(Debug, Clone, Args, Default)]
struct DoctorArgs {
    /// Emit doctor output as JSON.
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Clone, Serialize)]
struct DoctorReport {
    ok: bool,
    checks: Vec<DoctorCheck>,
}

#[derive(Debug, Clone, Serialize)]
struct DoctorCheck {
    id: String,
    status: String,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<String>,
}

impl DoctorCheck {
    fn new(id: &str, status: &str, message: impl Into<String>, detail: Option<String>) -> Self {
        Self {
            id: id.to_owned(),
            status: status.to_owned(),
            message: message.into(),
            detail,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let command = cli.command.clone().unwrap_or(CliCommand::Run);
    match command {
        CliCommand::Run => {
            let cfg = load_config(&cli)?;
            let _sentry = init_logging(&cfg.logging.level, cfg.logging.sentry_dsn.as_deref())?;
            run_runtime(cfg).await
        }
        CliCommand::Doctor(args) => run_doctor(&cli, args),
    }
}

fn load_config(cli: &Cli) -> Result<Config> {
    let mut cfg = Config::load(&cli.config)?;
    cfg.apply_cli_overrides(cli.bind.as_deref(), cli.log.as_deref())?;
    Ok(cfg)
}

async fn run_runtime(cfg: Config) -> Result<()> {
    let runtime = runtime::BrokerRuntime::new(cfg)?;
    runtime.run().await
}

fn run_doctor(cli: &Cli, args: DoctorArgs) -> Result<()> {
    let config_result = load_config(cli).map_err(|err| format!("{err:#}"));
    let report = build_doctor_report(config_result, &cli.config);
    print_doctor_report(&report, args.json);
    if report.ok {
        return Ok(());
    }
    Err(anyhow!("doctor reported blocking issues"))
}

fn build_doctor_report(config_result: Result<Config, String>, config_path: &Path) -> DoctorReport {
    let mut checks = Vec::new();
    let cfg = match config_result {
        Ok(cfg) => {
            let source = if config_path.exists() {
                format!("loaded {}", config_path.display())
            } else {
                format!("{} not found, using defaults", config_path.display())
            };
            checks.push(DoctorCheck::new("config.load", "pass", source, None));
            cfg
        }
        Err(err) => {
            checks.push(DoctorCheck::new(
                "config.load",
                "fail",
                "config could not be loaded",
                Some(err),
            ));
            return DoctorReport { ok: false, checks };
        }
    };

    checks.push(socket_addr_check("server.bind", &cfg.server.bind));
    checks.push(DoctorCheck::new(
        "server.ws_path",
        "pass",
        format!("widgets connect on {}", cfg.server.ws_path),
        Some(format!(
            "ping every {}s, handshake timeout {}ms, http timeout {}ms",
            cfg.server.ping_interval_secs,
            cfg.server.handshake_timeout_ms,
            cfg.server.http_timeout_ms
        )),
    ));

    match backend::HttpBackend::new(cfg.backend.timeout_ms, &cfg.backend.user_agent) {
        Ok(_) => checks.push(DoctorCheck::new(
            "backend.client",
            "pass",
            "backend http client builds",
            Some(format!(
                "user_agent={} timeout_ms={}",
                cfg.backend.user_agent, cfg.backend.timeout_ms
            )),
        )),
        Err(err) => checks.push(DoctorCheck::new(
            "backend.client",
            "fail",
            "backend http client failed to build",
            Some(format!("{err:#}")),
        )),
    }

    match EnvFilter::try_new(&cfg.logging.level) {
        Ok(_) => checks.push(DoctorCheck::new(
            "logging.level",
            "pass",
            format!("log filter {:?} parses", cfg.logging.level),
            None,
        )),
        Err(err) => checks.push(DoctorCheck::new(
            "logging.level",
            "fail",
            format!("log filter {:?} is invalid", cfg.logging.level),
            Some(err.to_string()),
        )),
    }

    match sentry_options(cfg.logging.sentry_dsn.as_deref()) {
        Ok(Some(options)) => checks.push(DoctorCheck::new(
            "logging.sentry",
            "pass",
            "errors are reported to sentry",
            options.dsn.map(|dsn| format!("host={} project={}", dsn.host(), dsn.project_id())),
        )),
        Ok(None) => checks.push(DoctorCheck::new(
            "logging.sentry",
            "warn",
            "sentry_dsn not set, errors are only logged locally",
            None,
        )),
        Err(err) => checks.push(DoctorCheck::new(
            "logging.sentry",
            "fail",
            "sentry_dsn is invalid",
            Some(format!("{err:#}")),
        )),
    }

    let ok = checks.iter().all(|check| check.status != "fail");
    DoctorReport { ok, checks }
}

fn socket_addr_check(id: &str, value: &str) -> DoctorCheck {
    match value.to_socket_addrs().map(|mut addrs| addrs.next()) {
        Ok(Some(addr)) => DoctorCheck::new(
            id,
            "pass",
            format!("{value} is a valid listen address"),
            Some(format!("resolves to {addr}")),
        ),
        Ok(None) => DoctorCheck::new(
            id,
            "fail",
            format!("{value:?} resolves to no address"),
            None,
        ),
        Err(err) => DoctorCheck::new(
            id,
            "fail",
            format!("{value:?} is not a socket address"),
            Some(err.to_string()),
        ),
    }
}

fn print_doctor_report(report: &DoctorReport, json_output: bool) {
    if json_output {
        println!(
            "{}",
            serde_json::to_string_pretty(report)
                .unwrap_or_else(|_| "{\"ok\":false,\"checks\":[]}".to_owned())
        );
        return;
    }

    println!("doctor: {}", if report.ok { "ok" } else { "issues" });
    for check in &report.checks {
        let detail = check
            .detail
            .as_deref()
            .map(|value| format!(" ({value})"))
            .unwrap_or_default();
        println!(
            "[{}] {}: {}{}",
            check.status.to_uppercase(),
            check.id,
            check.message,
            detail
        );
    }
}

fn sentry_options(dsn: Option<&str>) -> Result<Option<sentry::ClientOptions>> {
    let Some(dsn) = dsn.map(str::trim).filter(|dsn| !dsn.is_empty()) else {
        return Ok(None);
    };
    let dsn = dsn
        .parse::<sentry::types::Dsn>()
        .with_context(|| format!("invalid sentry dsn {dsn:?}"))?;
    Ok(Some(sentry::ClientOptions {
        dsn: Some(dsn),
        release: sentry::release_name!(),
        attach_stacktrace: true,
        ..Default::default()
    }))
}

/// Installs the fmt subscriber and, with a DSN, the sentry layer. The guard
/// must live until exit so queued events are flushed.
fn init_logging(
    filter: &str,
    sentry_dsn: Option<&str>,
) -> Result<Option<sentry::ClientInitGuard>> {
    let env = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));
    let guard = sentry_options(sentry_dsn)?.map(sentry::init);
    let sentry_layer = guard.as_ref().map(|_| sentry_tracing::layer());
    tracing_subscriber::registry()
        .with(env)
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .with(sentry_layer)
        .try_init()
        .context("failed installing tracing subscriber")?;
    Ok(guard)
}
