//! edgetune - memory and swap tuning for single-board edge devices.
//!
//! `install` applies the tuning and records how to undo it, `rollback`
//! reverses the last install, and `validate` checks the live device and the
//! diagnostics endpoint.

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use edgetune_core::config::{DEFAULT_LEDGER_FILE, DEFAULT_STATE_FILE, InstallConfig};
use edgetune_core::host::{Layout, RealFs, RealRunner};
use edgetune_core::install::Installer;
use edgetune_core::probe::ReportSnapshot;
use edgetune_core::rollback::{Rollback, StepStatus};
use edgetune_core::state::StateStore;
use edgetune_core::validate::{EndpointResult, ValidationReport};

#[derive(Parser)]
#[command(name = "edgetune", about = "Memory and swap tuning for edge devices", version = edgetune_core::VERSION)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Root prefix for every system path.
    #[arg(long, global = true, default_value = "/", env = "EDGETUNE_ROOT")]
    root: PathBuf,

    /// Install state file.
    #[arg(long, global = true, default_value = DEFAULT_STATE_FILE, env = "EDGETUNE_STATE_FILE")]
    state_file: PathBuf,

    /// Backup ledger.
    #[arg(long, global = true, default_value = DEFAULT_LEDGER_FILE, env = "EDGETUNE_LEDGER_FILE")]
    ledger_file: PathBuf,

    /// Increase logging verbosity (-v for debug, -vv for trace).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode - only show errors.
    #[arg(short, long, global = true)]
    quiet: bool,
}

#[derive(Subcommand)]
enum Command {
    /// Apply zram, swapfile, sysctl and diagnostics service configuration.
    Install(InstallArgs),
    /// Reverse the last install.
    Rollback,
    /// Check the live device and the diagnostics endpoint.
    Validate(ValidateArgs),
}

#[derive(Args)]
struct InstallArgs {
    /// Override the RAM-derived zram size (percent of RAM).
    #[arg(long)]
    zram_percent: Option<u32>,

    /// Override the RAM-derived swapfile size.
    #[arg(long)]
    swapfile_size_mb: Option<u64>,

    /// Swapfile location.
    #[arg(long, default_value = "/swapfile")]
    swapfile: PathBuf,

    /// vm.swappiness to set.
    #[arg(long, default_value = "100")]
    swappiness: u32,

    /// Diagnostics service binary to install.
    #[arg(long, default_value = "/usr/local/bin/edgetune-web", env = "EDGETUNE_API_BINARY")]
    api_binary: PathBuf,

    /// Listen address for the installed diagnostics service.
    #[arg(long, default_value = edgetune_core::config::DEFAULT_LISTEN)]
    listen: String,
}

#[derive(Args)]
struct ValidateArgs {
    /// Diagnostics endpoint to query.
    #[arg(long, default_value = "http://127.0.0.1:8085/perf", env = "EDGETUNE_ENDPOINT")]
    endpoint: String,

    /// Do not query the diagnostics endpoint.
    #[arg(long)]
    skip_endpoint: bool,

    /// Seconds to wait for the endpoint (a cold probe can take minutes).
    #[arg(long, default_value = "150")]
    timeout: u64,

    /// JSON report path.
    #[arg(long, default_value = "/var/lib/edgetune/validation.json")]
    output: PathBuf,

    /// Plain-text summary path.
    #[arg(long, default_value = "/var/lib/edgetune/validation.txt")]
    summary: PathBuf,
}

impl Cli {
    fn install_config(&self) -> InstallConfig {
        let mut config = InstallConfig {
            layout: Layout::new(&self.root),
            state_file: self.state_file.clone(),
            ledger_file: self.ledger_file.clone(),
            ..InstallConfig::default()
        };
        if let Command::Install(args) = &self.command {
            config.zram_percent = args.zram_percent;
            config.swapfile_size_mb = args.swapfile_size_mb;
            config.swapfile = args.swapfile.clone();
            config.swappiness = args.swappiness;
            config.api_binary = args.api_binary.clone();
            config.api_listen = args.listen.clone();
        }
        config
    }
}

fn init_logging(verbose: u8, quiet: bool) {
    let level = if quiet {
        "error"
    } else {
        match verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("edgetune={level},edgetune_core={level}")));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.quiet);

    let ok = match &cli.command {
        Command::Install(_) => install(&cli),
        Command::Rollback => rollback(&cli),
        Command::Validate(args) => validate(&cli, args),
    };
    if ok {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

fn install(cli: &Cli) -> bool {
    match Installer::new(cli.install_config(), RealRunner::new()).run() {
        Ok(report) => {
            info!(
                applied = report.applied,
                unchanged = report.unchanged,
                warnings = report.warnings.len(),
                zram_percent = report.state.zram_percent,
                swapfile_uuid = %report.state.swapfile_uuid,
                "install finished"
            );
            for warning in &report.warnings {
                warn!("{warning}");
            }
            true
        }
        Err(e) => {
            error!(error = %e, "install failed");
            false
        }
    }
}

fn rollback(cli: &Cli) -> bool {
    match Rollback::new(cli.install_config(), RealRunner::new()).run() {
        Ok(report) => {
            for step in &report.steps {
                println!("{:<48} {}", step.step, step.status);
            }
            let refused = report
                .steps
                .iter()
                .filter(|s| matches!(s.status, StepStatus::Refused(_)))
                .count();
            info!(failures = report.failures(), refused, "rollback finished");
            true
        }
        Err(e) => {
            error!(error = %e, "rollback refused");
            false
        }
    }
}

fn validate(cli: &Cli, args: &ValidateArgs) -> bool {
    let config = cli.install_config();
    let layout = &config.layout;
    let state = match StateStore::new(layout.host_path(&config.state_file)).load() {
        Ok(state) => state,
        Err(e) => {
            warn!(error = %e, "cannot read install state");
            None
        }
    };

    let endpoint = (!args.skip_endpoint)
        .then(|| fetch_report(&args.endpoint, Duration::from_secs(args.timeout)));
    let report = ValidationReport::build(&RealFs::new(), layout, state.as_ref(), endpoint);

    let output = layout.host_path(&args.output);
    let summary = layout.host_path(&args.summary);
    if let Err(e) = report.save(&output, &summary) {
        error!(error = %e, "failed to write validation report");
        return false;
    }
    print!("{}", report.summary());
    info!(report = %output.display(), summary = %summary.display(), "validation written");
    report.passed()
}

/// Queries the diagnostics endpoint once.
fn fetch_report(endpoint: &str, timeout: Duration) -> EndpointResult {
    let agent = ureq::AgentBuilder::new()
        .timeout_connect(Duration::from_secs(5))
        .timeout_read(timeout)
        .build();
    let response = agent
        .get(endpoint)
        .set("User-Agent", concat!("edgetune/", env!("CARGO_PKG_VERSION")))
        .call();

    match response {
        Ok(resp) => match resp.into_json::<ReportSnapshot>() {
            Ok(snapshot) => EndpointResult::Report(snapshot),
            Err(e) => EndpointResult::Unreachable(format!("invalid report body: {e}")),
        },
        Err(ureq::Error::Status(status, resp)) => {
            let code = resp
                .into_json::<serde_json::Value>()
                .ok()
                .and_then(|v| v["error"].as_str().map(str::to_owned))
                .unwrap_or_else(|| "unknown".to_owned());
            EndpointResult::Error { status, code }
        }
        Err(e) => EndpointResult::Unreachable(e.to_string()),
    }
}
