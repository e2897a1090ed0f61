mod access_log;
mod handlers;
mod openapi;
mod state;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::response::Json;
use axum::routing::get;
use clap::Parser;
use tower_http::compression::CompressionLayer;
use tower_http::cors::CorsLayer;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use utoipa::OpenApi;

use edgetune_core::config::{DEFAULT_CACHE_FILE, DEFAULT_LISTEN, DiagnosticsConfig};
use edgetune_core::host::{CommandSpec, Layout, RealFs, RealRunner, SystemClock};
use edgetune_core::probe::{ExternalProbe, Probe, SystemProbe};

use access_log::AccessLogLayer;
use openapi::ApiDoc;
use state::{DiagnosticsService, SharedService};

// ============================================================
// CLI
// ============================================================

#[derive(Parser)]
#[command(name = "edgetune-web", about = "edgetune diagnostics API server", version = edgetune_core::VERSION)]
struct Args {
    /// Listen address.
    #[arg(long, default_value = DEFAULT_LISTEN, env = "EDGETUNE_LISTEN")]
    listen: String,

    /// Root prefix for /proc, /sys and /etc reads.
    #[arg(long, default_value = "/", env = "EDGETUNE_ROOT")]
    root: PathBuf,

    /// Minimum seconds between accepted requests (all clients).
    #[arg(long, default_value = "5", env = "EDGETUNE_MIN_INTERVAL")]
    min_interval: f64,

    /// Seconds a report stays fresh.
    #[arg(long, default_value = "300", env = "EDGETUNE_CACHE_TTL")]
    cache_ttl: u64,

    /// Hard limit on one probe run, in seconds.
    #[arg(long, default_value = "120", env = "EDGETUNE_PROBE_TIMEOUT")]
    probe_timeout: u64,

    /// Hard limit on the benchmark, in seconds.
    #[arg(long, default_value = "60", env = "EDGETUNE_BENCHMARK_TIMEOUT")]
    benchmark_timeout: u64,

    /// Benchmark command line (whitespace separated).
    #[arg(long, default_value = "sysbench cpu --time=5 run", env = "EDGETUNE_BENCHMARK")]
    benchmark: String,

    /// Skip the benchmark.
    #[arg(long)]
    no_benchmark: bool,

    /// Where every fresh report is written.
    #[arg(long, default_value = DEFAULT_CACHE_FILE, env = "EDGETUNE_CACHE_FILE")]
    cache_file: PathBuf,

    /// External check command that writes the report to --probe-report
    /// (replaces the built-in probe).
    #[arg(long, env = "EDGETUNE_PROBE_COMMAND")]
    probe_command: Option<String>,

    /// Report file written by --probe-command.
    #[arg(long, default_value = "/tmp/edgetune-check.json", env = "EDGETUNE_PROBE_REPORT")]
    probe_report: PathBuf,

    /// Verbose output (-v debug, -vv trace).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Only log errors.
    #[arg(short, long)]
    quiet: bool,
}

impl Args {
    fn diagnostics_config(&self) -> Result<DiagnosticsConfig, String> {
        let min_interval = Duration::try_from_secs_f64(self.min_interval)
            .map_err(|e| format!("invalid --min-interval {}: {e}", self.min_interval))?;
        Ok(DiagnosticsConfig {
            min_interval,
            cache_ttl: Duration::from_secs(self.cache_ttl),
            probe_timeout: Duration::from_secs(self.probe_timeout),
            benchmark_timeout: Duration::from_secs(self.benchmark_timeout),
            benchmark_command: (!self.no_benchmark).then(|| self.benchmark.clone()),
            cache_file: Some(self.cache_file.clone()),
        })
    }
}

// ============================================================
// Main
// ============================================================

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
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!("edgetune_web={level},edgetune_core={level}"))
    });
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}

fn main() {
    let args = Args::parse();
    init_logging(args.verbose, args.quiet);

    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            error!(error = %e, "failed to build tokio runtime");
            process::exit(1);
        }
    };
    runtime.block_on(async_main(args));
}

/// Fails when the built-in probe could outlive `--probe-timeout`, since a
/// timed-out run blocks every later one until it finishes.
fn build_probe(args: &Args, config: &DiagnosticsConfig) -> Result<Arc<dyn Probe>, String> {
    if let Some(line) = &args.probe_command {
        if let Some(command) = CommandSpec::parse(line) {
            info!(command = %command, report = %args.probe_report.display(), "using external probe");
            return Ok(Arc::new(ExternalProbe::new(
                RealRunner::new(),
                command,
                &args.probe_report,
                config.probe_timeout,
            )));
        }
        warn!("empty --probe-command, using built-in probe");
    }

    let mut probe = SystemProbe::new(RealFs::new(), RealRunner::new(), Layout::new(&args.root));
    match config.benchmark_command.as_deref().map(CommandSpec::parse) {
        Some(Some(command)) => {
            info!(command = %command, timeout_secs = config.benchmark_timeout.as_secs(), "benchmark enabled");
            probe = probe.with_benchmark(command, config.benchmark_timeout);
        }
        Some(None) => warn!("empty benchmark command, benchmark disabled"),
        None => info!("benchmark disabled"),
    }
    let worst = probe.max_duration();
    if worst > config.probe_timeout {
        return Err(format!(
            "--probe-timeout {}s is shorter than the probe's worst case of {}s; \
             raise it or lower --benchmark-timeout",
            config.probe_timeout.as_secs(),
            worst.as_secs()
        ));
    }
    Ok(Arc::new(probe))
}

/// Routes and middleware around a diagnostics service.
pub(crate) fn router(service: SharedService) -> Router {
    Router::new()
        .route("/health", get(handlers::handle_health))
        .route("/perf", get(handlers::handle_perf))
        .route("/perf/raw", get(handlers::handle_perf_raw))
        .route("/api-docs/openapi.json", get(|| async { Json(ApiDoc::openapi()) }))
        .with_state(service)
        // last .layer() = outermost
        .layer(AccessLogLayer)
        .layer(CorsLayer::permissive())
        .layer(CompressionLayer::new())
}

async fn async_main(args: Args) {
    let config = match args.diagnostics_config() {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "invalid configuration");
            process::exit(1);
        }
    };
    info!(
        version = edgetune_core::VERSION,
        min_interval_secs = config.min_interval.as_secs_f64(),
        cache_ttl_secs = config.cache_ttl.as_secs(),
        probe_timeout_secs = config.probe_timeout.as_secs(),
        "starting diagnostics service"
    );

    let probe = match build_probe(&args, &config) {
        Ok(probe) => probe,
        Err(e) => {
            error!(error = %e, "invalid configuration");
            process::exit(1);
        }
    };
    let service = Arc::new(DiagnosticsService::new(&config, probe, Arc::new(SystemClock)));
    let app = router(service).into_make_service_with_connect_info::<SocketAddr>();

    let addr: SocketAddr = match args.listen.parse() {
        Ok(addr) => addr,
        Err(e) => {
            error!(listen = %args.listen, error = %e, "invalid listen address");
            process::exit(1);
        }
    };
    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(l) => l,
        Err(e) => {
            error!(%addr, error = %e, "failed to bind");
            process::exit(1);
        }
    };
    info!(%addr, "listening");

    if let Err(e) = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
    {
        error!(error = %e, "server error");
        process::exit(1);
    }
    info!("stopped");
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "cannot listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("shutdown signal received");
}
