#![forbid(unsafe_code)]

use std::path::PathBuf;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context as _, Result};
use clap::{ArgAction, ArgMatches, Command, CommandFactory, FromArgMatches, Parser};
use corral_commands::output::{render_table, OutputFormat};
use corral_commands::{Context, KindCommand, Params, SharedWriter};
use corral_core::Descriptor;
use corral_kubehub::{KubeGateway, KubeNamespaces};
use corral_store::MemoryStore;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

mod registry;
mod seed;

#[derive(Parser, Debug)]
#[command(name = "corral", version, about = "List, describe, delete and run commands across cluster resources")]
struct GlobalArgs {
    /// Namespace to target; bulk commands accept a comma separated list
    #[arg(short = 'n', long = "namespace", env = "CORRAL_NAMESPACE", global = true)]
    namespace: Option<String>,

    /// Give up waiting after this many seconds
    #[arg(long = "timeout", env = "CORRAL_TIMEOUT_SECS", value_name = "SECONDS", global = true)]
    timeout: Option<u64>,

    /// Run against an in-memory store instead of a cluster
    #[arg(long = "in-memory", env = "CORRAL_IN_MEMORY", action = ArgAction::SetTrue, global = true)]
    in_memory: bool,

    /// YAML objects to load into the in-memory store
    #[arg(long = "seed", env = "CORRAL_SEED", value_name = "FILE", global = true)]
    seed: Option<PathBuf>,

    /// Delay between polls while waiting
    #[arg(long = "poll-interval-ms", env = "CORRAL_POLL_INTERVAL_MS", default_value_t = 1000, global = true)]
    poll_interval_ms: u64,
}

fn init_tracing() {
    let env = std::env::var("CORRAL_LOG").unwrap_or_else(|_| "warn".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("CORRAL_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid CORRAL_METRICS_ADDR; expected host:port");
        }
    }
}

fn api_resources_command() -> Command {
    Command::new("api-resources").about("Print the kinds the target serves").arg(OutputFormat::arg())
}

fn root(commands: &[Box<dyn KindCommand>]) -> Command {
    GlobalArgs::command()
        .subcommand_required(true)
        .arg_required_else_help(true)
        .subcommand(api_resources_command())
        .subcommands(commands.iter().map(|c| c.command()))
}

/// Cancelled on Ctrl-C or when the timeout elapses.
fn cancellation(timeout: Option<u64>) -> CancellationToken {
    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if signal::ctrl_c().await.is_ok() {
                warn!("interrupted");
                cancel.cancel();
            }
        }
    });
    if let Some(secs) = timeout {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(secs)).await;
            info!(secs, "timeout elapsed");
            cancel.cancel();
        });
    }
    cancel
}

async fn context(args: &GlobalArgs, cancel: &CancellationToken) -> Result<Context> {
    let out: SharedWriter = Arc::new(Mutex::new(std::io::stdout()));
    let err: SharedWriter = Arc::new(Mutex::new(std::io::stderr()));
    let params = Params {
        namespace: args.namespace.clone(),
        poll_interval: Duration::from_millis(args.poll_interval_ms.max(1)),
    };
    if args.in_memory {
        let store = Arc::new(MemoryStore::new());
        if let Some(path) = &args.seed {
            seed::load(&store, path)?;
        }
        store.spawn_collector(params.poll_interval, cancel.clone());
        return Ok(Context { gateway: store.clone(), namespaces: store, params, out, err, cancel: cancel.clone() });
    }
    if args.seed.is_some() {
        warn!("--seed only applies with --in-memory");
    }
    let gateway = KubeGateway::try_default().await.context("connecting to the cluster")?;
    let namespaces = Arc::new(KubeNamespaces::new(gateway.client()));
    Ok(Context { gateway: Arc::new(gateway), namespaces, params, out, err, cancel: cancel.clone() })
}

async fn api_resources(args: &GlobalArgs, m: &ArgMatches) -> Result<()> {
    let kinds: Vec<Descriptor> = if args.in_memory {
        registry::kinds()
    } else {
        let gateway = KubeGateway::try_default().await.context("connecting to the cluster")?;
        corral_kubehub::discover(gateway.client()).await?
    };
    let text = match OutputFormat::from_matches(m) {
        OutputFormat::Table => {
            let mut rows = vec![["NAME", "APIVERSION", "NAMESPACED", "KIND"].map(String::from).to_vec()];
            for d in &kinds {
                rows.push(vec![d.resource.to_string(), d.api_version(), d.namespaced.to_string(), d.kind.to_string()]);
            }
            render_table(&rows, "")
        }
        OutputFormat::Json => format!("{}\n", serde_json::to_string_pretty(&kinds)?),
        OutputFormat::Yaml => serde_yaml::to_string(&kinds)?,
        OutputFormat::Name => kinds.iter().map(|d| format!("{}\n", d.qualified_resource())).collect(),
    };
    print!("{text}");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();

    let commands = registry::commands();
    let matches = root(&commands).get_matches();
    let args = GlobalArgs::from_arg_matches(&matches)?;
    let Some((name, sub)) = matches.subcommand() else {
        anyhow::bail!("no command given");
    };
    info!(command = name, ns = ?args.namespace, in_memory = args.in_memory, "starting");

    if name == "api-resources" {
        return api_resources(&args, sub).await;
    }
    let cmd = commands
        .iter()
        .find(|c| c.command().get_name() == name)
        .with_context(|| format!("unknown command {name:?}"))?;
    let cancel = cancellation(args.timeout);
    let ctx = context(&args, &cancel).await?;
    let result = cmd.run(&ctx, sub).await;
    cancel.cancel();
    result?;
    Ok(())
}
