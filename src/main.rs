use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use salt_dispatch::clock::{Clock, SystemClock};
use salt_dispatch::config::{MasterConfig, MinionConfig};
use salt_dispatch::master::Master;
use salt_dispatch::scheduler::{JobRecord, JobSpec};
use salt_dispatch::session::{SessionLayer, SharedSecretBackend};
use salt_dispatch::shutdown::install_shutdown_handler;
use salt_dispatch::targeting::{MinionData, TargetResolver, TargetType};
use salt_dispatch::transport::LocalBus;
use salt_dispatch::worker::{register_builtins, CapabilityRegistry, LoaderContext, MinionAgent};

#[derive(Parser, Debug)]
#[command(name = "salt-dispatch")]
#[command(version)]
#[command(about = "Publish jobs to minions and collect their results")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Start a master with in-process minions, run one job and print the result
    Run(RunArgs),

    /// Show which in-process minions a target expression matches
    Targets(TargetArgs),
}

// =============================================================================
// Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct ClusterArgs {
    /// Number of in-process minions (named minion-1 .. minion-N)
    #[arg(long, default_value = "3")]
    minions: usize,

    /// Master configuration file (JSON)
    #[arg(long, short = 'c')]
    config: Option<PathBuf>,
}

#[derive(Parser, Debug)]
struct RunArgs {
    #[command(flatten)]
    cluster: ClusterArgs,

    /// Target expression
    #[arg(long, default_value = "*")]
    tgt: String,

    /// How the target expression is interpreted
    #[arg(long, default_value = "glob")]
    tgt_type: TargetType,

    /// Seconds to wait for returns (master default when unset)
    #[arg(long, short = 't', value_parser = parse_timeout)]
    timeout: Option<Duration>,

    /// Output format
    #[arg(long, short = 'o', default_value = "table")]
    output: OutputFormat,

    /// Function to run, e.g. test.ping
    fun: String,

    /// Positional arguments; `key=value` becomes a keyword argument
    args: Vec<String>,
}

#[derive(Parser, Debug)]
struct TargetArgs {
    #[command(flatten)]
    cluster: ClusterArgs,

    #[arg(long, default_value = "glob")]
    tgt_type: TargetType,

    expression: String,
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

// =============================================================================
// Helper Functions
// =============================================================================

async fn load_config(path: Option<&Path>) -> Result<MasterConfig, Box<dyn std::error::Error>> {
    match path {
        Some(path) => {
            let raw = tokio::fs::read(path).await?;
            Ok(serde_json::from_slice(&raw)?)
        }
        None => Ok(MasterConfig::default()),
    }
}

fn minion_ids(count: usize) -> Vec<String> {
    (1..=count).map(|i| format!("minion-{i}")).collect()
}

fn demo_secret(minion_id: &str) -> Vec<u8> {
    format!("{minion_id}-secret").into_bytes()
}

fn demo_grains(minion_id: &str, index: usize) -> Value {
    json!({
        "id": minion_id,
        "kernel": std::env::consts::OS,
        "cpuarch": std::env::consts::ARCH,
        "role": if index % 2 == 0 { "db" } else { "web" },
    })
}

/// Parses `--timeout` seconds. Negative, non-finite and out-of-range values are rejected.
fn parse_timeout(raw: &str) -> Result<Duration, String> {
    let secs: f64 = raw.parse().map_err(|e| format!("invalid number {raw:?}: {e}"))?;
    Duration::try_from_secs_f64(secs).map_err(|e| format!("invalid timeout {raw:?}: {e}"))
}

/// Parses a CLI argument as JSON, falling back to a plain string.
fn parse_value(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

fn build_spec(args: &RunArgs) -> JobSpec {
    let mut spec = JobSpec::new(&args.fun).target(&args.tgt, args.tgt_type);
    for raw in &args.args {
        spec = match raw.split_once('=') {
            Some((key, value)) if !key.is_empty() && !key.contains(' ') => {
                spec.kwarg(key, parse_value(value))
            }
            _ => spec.arg(parse_value(raw)),
        };
    }
    if let Some(timeout) = args.timeout {
        spec = spec.timeout(timeout);
    }
    spec
}

/// Master plus `count` minions wired over an in-memory bus.
async fn start_cluster(
    config: MasterConfig,
    count: usize,
    token: &CancellationToken,
) -> Result<Arc<Master>, Box<dyn std::error::Error>> {
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let bus = LocalBus::new(config.id.clone());
    let ids = minion_ids(count);

    let mut backend = SharedSecretBackend::new();
    for id in &ids {
        backend.insert(id.clone(), &demo_secret(id));
    }

    let master = Arc::new(
        Master::builder(config, Arc::new(bus.master_endpoint()))
            .auth(Arc::new(backend))
            .clock(clock.clone())
            .build(),
    );
    master.start(token.clone());

    for (index, id) in ids.iter().enumerate() {
        let grains = demo_grains(id, index + 1);
        master
            .roster()
            .register(id.clone(), MinionData::new(grains.clone(), json!({})));

        let mut minion_config = MinionConfig::new(id.clone());
        minion_config.master_id = master.config.id.clone();

        let sessions = Arc::new(SessionLayer::minion(
            id.clone(),
            master.config.id.clone(),
            &demo_secret(id),
            &minion_config.session,
            clock.clone(),
        ));
        sessions.connect(master.handshake().as_ref())?;

        let mut capabilities = CapabilityRegistry::new();
        register_builtins(
            &mut capabilities,
            &LoaderContext {
                minion_id: id,
                config: &minion_config,
                grains: &grains,
            },
        );

        let agent = MinionAgent::new(
            minion_config,
            sessions,
            Arc::new(bus.connect(id.clone())),
            Arc::new(capabilities),
            grains,
            clock.clone(),
        )
        .with_handshake(master.handshake());
        tokio::spawn(agent.run(token.clone()));
    }

    // Agents register their inbound queue once they start running
    let ready = tokio::time::timeout(Duration::from_secs(5), async {
        while bus.connected().len() < ids.len() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    if ready.is_err() {
        tracing::warn!(
            connected = bus.connected().len(),
            expected = ids.len(),
            "Not every minion connected"
        );
    }

    tracing::info!(minions = ids.len(), "Cluster ready");
    Ok(master)
}

fn print_record(record: &JobRecord, format: &OutputFormat) -> Result<(), Box<dyn std::error::Error>> {
    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(record)?);
        }
        OutputFormat::Table => {
            println!("Job ID:   {}", record.job_id());
            println!("Function: {}", record.request.function_name);
            println!("State:    {}", record.state);
            println!();
            if record.request.tgt_minions.is_empty() {
                println!("No minions matched the target.");
            }
            for (minion_id, result) in &record.results {
                println!("{minion_id}:");
                let rendered = match &result.return_value {
                    Value::String(s) => s.clone(),
                    other => serde_json::to_string_pretty(other)?,
                };
                for line in rendered.lines() {
                    println!("    {line}");
                }
                if result.retcode != 0 {
                    println!("    (retcode {})", result.retcode);
                }
            }
            for minion_id in record.missing() {
                let reason = record
                    .unreached
                    .get(&minion_id)
                    .map(String::as_str)
                    .unwrap_or("Minion did not return");
                println!("{minion_id}:");
                println!("    {reason}");
            }
        }
    }
    Ok(())
}

// =============================================================================
// Commands
// =============================================================================

async fn run_job(args: RunArgs) -> Result<(), Box<dyn std::error::Error>> {
    let config = load_config(args.cluster.config.as_deref()).await?;
    let token = CancellationToken::new();
    install_shutdown_handler(token.clone());

    let master = start_cluster(config, args.cluster.minions, &token).await?;
    let spec = build_spec(&args);
    let timeout = spec.timeout.unwrap_or(master.config.default_timeout());

    let outcome = master.dispatch_with_report(spec).await?;
    if !outcome.unreached.is_empty() {
        tracing::warn!(unreached = ?outcome.unreached.keys().collect::<Vec<_>>(), "Some targets were not reached");
    }

    // The sweeper closes the job at the deadline; allow it one extra pass
    let grace = master.config.sweep_interval() * 2;
    let record = tokio::select! {
        record = master.wait(&outcome.job_id, timeout.saturating_add(grace)) => record?,
        _ = token.cancelled() => master.status(&outcome.job_id)?,
    };

    print_record(&record, &args.output)?;
    token.cancel();

    if record.results.values().any(|r| r.retcode != 0) || !record.missing().is_empty() {
        std::process::exit(1);
    }
    Ok(())
}

async fn show_targets(args: TargetArgs) -> Result<(), Box<dyn std::error::Error>> {
    let config = load_config(args.cluster.config.as_deref()).await?;
    let token = CancellationToken::new();
    let master = start_cluster(config, args.cluster.minions, &token).await?;

    let resolution = master.roster().resolve(&args.expression, args.tgt_type)?;
    for minion_id in &resolution.minions {
        println!("{minion_id}");
    }
    for minion_id in &resolution.missing {
        println!("{minion_id} (unknown)");
    }
    token.cancel();
    Ok(())
}

// =============================================================================
// Main Entry Point
// =============================================================================

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    match args.command {
        Commands::Run(run_args) => run_job(run_args).await?,
        Commands::Targets(target_args) => show_targets(target_args).await?,
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timeout_must_be_a_finite_non_negative_number() {
        assert_eq!(parse_timeout("1.5"), Ok(Duration::from_millis(1500)));
        assert_eq!(parse_timeout("0"), Ok(Duration::ZERO));
        for raw in ["inf", "NaN", "-1", "1e30", "soon"] {
            assert!(parse_timeout(raw).is_err(), "{raw} should be rejected");
        }
    }

    #[test]
    fn run_args_build_a_job_spec() {
        let args = RunArgs::try_parse_from([
            "run", "--tgt", "web*", "-t", "2", "cmd.run", "echo hi", "cwd=/tmp",
        ])
        .unwrap();
        let spec = build_spec(&args);
        assert_eq!(spec.function_name, "cmd.run");
        assert_eq!(spec.arguments, vec![json!("echo hi")]);
        assert_eq!(spec.keyword_arguments["cwd"], json!("/tmp"));
        assert_eq!(spec.timeout, Some(Duration::from_secs(2)));

        assert!(RunArgs::try_parse_from(["run", "--timeout", "inf", "test.ping"]).is_err());
    }
}
