//! RGW Lifecycle Harness - eventually-consistent lifecycle checks for Ceph RGW

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use rgw_lc_harness::admin::{CommandRunner, LocalRunner, RadosgwAdmin, SshRunner};
use rgw_lc_harness::cluster::{Cluster, ConfigGuard};
use rgw_lc_harness::s3::BlockingS3Client;
use rgw_lc_harness::verify::{check_at_most_one, BoundedPoller, PollSettings, SystemClock};
use rgw_lc_harness::{metrics, scenario, Config, InvariantViolation, ScenarioRunner};
use std::path::PathBuf;
use tracing::{error, info, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// RGW Lifecycle Harness - validate bucket lifecycle on a live cluster
#[derive(Parser, Debug)]
#[command(name = "rgw-lc-harness")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info", global = true)]
    log_level: String,

    /// Write Prometheus metrics here when the command finishes
    #[arg(long, global = true)]
    metrics_out: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a scenario against the cluster
    Run {
        /// Path to scenario file
        #[arg(short, long, default_value = "scenario.yaml")]
        config: PathBuf,

        /// Run admin commands on this node over SSH
        #[arg(long)]
        rgw_node: Option<String>,

        /// Leave the gateway configuration untouched
        #[arg(long)]
        skip_cluster_config: bool,
    },

    /// Print the predicted schedule of every object without touching a cluster
    Plan {
        /// Path to scenario file
        #[arg(short, long, default_value = "scenario.yaml")]
        config: PathBuf,
    },

    /// Check that no key in a bucket has more than one delete marker
    CheckMarkers {
        #[arg(short, long)]
        bucket: String,

        /// Run admin commands on this node over SSH
        #[arg(long)]
        rgw_node: Option<String>,
    },
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize logging; RUST_LOG overrides --log-level
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.to_string().to_lowercase()));

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .with_writer(std::io::stderr)
        .json()
        .finish();

    tracing::subscriber::set_global_default(subscriber)?;

    info!("Starting RGW lifecycle harness v{}", rgw_lc_harness::VERSION);

    let result = match args.command {
        Command::Run {
            config,
            rgw_node,
            skip_cluster_config,
        } => run(config, rgw_node, skip_cluster_config),
        Command::Plan { config } => plan(config),
        Command::CheckMarkers { bucket, rgw_node } => check_markers(&bucket, rgw_node),
    };

    if let Some(path) = args.metrics_out {
        let text = metrics::render()?;
        std::fs::write(&path, text)
            .with_context(|| format!("writing metrics to {}", path.display()))?;
    }

    result
}

fn command_runner(ssh_host: Option<String>) -> Box<dyn CommandRunner> {
    match ssh_host {
        Some(host) => {
            info!(host = %host, "Running admin commands over SSH");
            Box::new(SshRunner::new(host))
        }
        None => Box::new(LocalRunner),
    }
}

fn run(path: PathBuf, rgw_node: Option<String>, skip_cluster_config: bool) -> anyhow::Result<()> {
    let config = Config::load(&path)?;
    info!("Loaded configuration from {:?}", path);

    let Some(s3_config) = config.s3.as_ref() else {
        bail!("scenario {:?} has no s3 section", path);
    };

    let runner = command_runner(rgw_node.or_else(|| config.cluster.ssh_host.clone()));
    let cluster = Cluster::new(runner.as_ref(), &config.cluster);
    let admin = RadosgwAdmin::new(runner.as_ref());
    let readiness = BoundedPoller::new(
        SystemClock,
        PollSettings::new(config.polling.interval(), config.cluster.readiness_timeout())?,
    );

    let guard = if skip_cluster_config {
        None
    } else {
        Some(ConfigGuard::acquire(
            &cluster,
            &readiness,
            &config.cluster_overrides(),
        )?)
    };

    let s3 = BlockingS3Client::new(s3_config)?;
    let outcome = ScenarioRunner::new(&config, &s3, SystemClock)
        .and_then(|runner| runner.with_admin(&admin).run());

    let crashes = cluster.new_crashes().unwrap_or_else(|e| {
        error!(error = %e, "Could not query crash reports");
        0
    });

    if let Some(guard) = guard {
        if let Err(restore_error) = guard.release() {
            match &outcome {
                Ok(report) => {
                    error!(scenario = %report.scenario, "Scenario passed but the cluster configuration was not restored");
                    println!("{}", serde_json::to_string_pretty(report)?);
                }
                Err(e) => {
                    error!(error = %e, "Scenario failed and the cluster configuration was not restored")
                }
            }
            return Err(restore_error).context("restoring cluster configuration");
        }
    }

    let report = outcome?;
    if crashes > 0 {
        return Err(InvariantViolation::Crash(crashes).into());
    }
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn plan(path: PathBuf) -> anyhow::Result<()> {
    let config = Config::load(&path)?;
    let plan = scenario::plan(&config, chrono::Utc::now())?;
    println!("{}", serde_json::to_string_pretty(&plan)?);
    Ok(())
}

fn check_markers(bucket: &str, rgw_node: Option<String>) -> anyhow::Result<()> {
    let runner = command_runner(rgw_node);
    let admin = RadosgwAdmin::new(runner.as_ref());
    let entries = admin.bucket_list(bucket)?;
    let report = check_at_most_one(&entries);
    println!("{}", serde_json::to_string_pretty(&report)?);
    report.into_result()?;
    Ok(())
}
