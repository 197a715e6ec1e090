use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};
use converge_apply::{ApplyEngine, ClientEngine, Inventory, Supervisor, SupervisorConfig};
use converge_core::{InventoryPolicy, Manifest, Metrics, MultiError, ObjectId};
use converge_kubehub::{watch::Feed, KubeClient, WatchManager};
use converge_remediator::{DeclaredSet, Remediator, RemediatorConfig};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "convergectl", version, about = "Converge declared objects onto a cluster and keep them there")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Args, Debug, Clone)]
struct InventoryArgs {
    /// Namespace of the inventory ConfigMap
    #[arg(long = "inventory-namespace", env = "CONVERGE_INVENTORY_NAMESPACE", default_value = "default")]
    namespace: String,
    /// Name of the inventory ConfigMap
    #[arg(long = "inventory-name", env = "CONVERGE_INVENTORY_NAME")]
    name: String,
}

impl InventoryArgs {
    fn id(&self) -> ObjectId { ObjectId::new("", "ConfigMap", self.namespace.clone(), self.name.clone()) }
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Apply a directory of manifests, prune what was dropped, then keep remediating
    Sync {
        /// Directory of *.yaml / *.yml files
        #[arg(env = "CONVERGE_MANIFEST_DIR")]
        dir: PathBuf,
        #[command(flatten)]
        inventory: InventoryArgs,
        /// must-match | adopt-if-no-inventory | adopt-all
        #[arg(long = "policy", env = "CONVERGE_INVENTORY_POLICY", default_value = "adopt-if-no-inventory")]
        policy: String,
        /// Seconds between sync cycles
        #[arg(long = "period-secs", env = "CONVERGE_SYNC_PERIOD_SECS", default_value_t = 60)]
        period_secs: u64,
        /// Run a single cycle and exit (no remediation)
        #[arg(long = "once", action = ArgAction::SetTrue)]
        once: bool,
    },
    /// Delete every object in the inventory, then the inventory itself
    Destroy {
        #[command(flatten)]
        inventory: InventoryArgs,
    },
    /// Parse manifests offline and list their dependencies
    Validate {
        #[arg(env = "CONVERGE_MANIFEST_DIR")]
        dir: PathBuf,
    },
}

fn init_tracing() {
    let env = std::env::var("CONVERGE_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("CONVERGE_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid CONVERGE_METRICS_ADDR; expected host:port");
        }
    }
}

/// Every manifest under `dir`, files visited in name order.
fn load_dir(dir: &Path) -> Result<Vec<Manifest>> {
    let mut files: Vec<PathBuf> = std::fs::read_dir(dir)
        .with_context(|| format!("reading {}", dir.display()))?
        .filter_map(|e| e.ok().map(|e| e.path()))
        .filter(|p| matches!(p.extension().and_then(|e| e.to_str()), Some("yaml" | "yml")))
        .collect();
    files.sort();
    let mut out = Vec::new();
    for path in files {
        let text = std::fs::read_to_string(&path).with_context(|| format!("reading {}", path.display()))?;
        let docs = Manifest::from_yaml(&text).with_context(|| format!("parsing {}", path.display()))?;
        out.extend(docs);
    }
    let mut seen = BTreeSet::new();
    for m in &out {
        if !seen.insert(m.id().clone()) {
            return Err(anyhow!("{} is declared more than once", m.id()));
        }
    }
    Ok(out)
}

fn report(output: Output, supervisor: &Supervisor, errors: &MultiError) {
    match output {
        Output::Human => {
            for (id, st) in supervisor.last_statuses() {
                println!("{}\t{}\t{}\t{}", id, st.strategy, st.actuation, st.reconcile);
            }
            println!("{}", supervisor.last_stats());
            for e in errors.iter() {
                println!("error: {e}");
            }
        }
        Output::Json => {
            let statuses: Vec<_> = supervisor
                .last_statuses()
                .iter()
                .map(|(id, st)| serde_json::json!({ "id": id.to_string(), "status": st }))
                .collect();
            let errors: Vec<String> = errors.iter().map(|e| e.to_string()).collect();
            let body = serde_json::json!({ "objects": statuses, "stats": supervisor.last_stats().to_string(), "errors": errors });
            match serde_json::to_string_pretty(&body) {
                Ok(s) => println!("{s}"),
                Err(e) => error!(error = %e, "failed to render report"),
            }
        }
    }
}

fn cancel_on_ctrl_c() -> CancellationToken {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        if signal::ctrl_c().await.is_ok() {
            info!("interrupt received; stopping");
            token.cancel();
        }
    });
    cancel
}

async fn supervisor_for(client: &Arc<KubeClient>, id: ObjectId, config: SupervisorConfig, metrics: Arc<Metrics>) -> Result<Supervisor> {
    let inventory = Inventory::load(&**client, id).await?;
    info!(inventory = %inventory.id(), members = inventory.len(), "inventory loaded");
    let engine: Arc<dyn ApplyEngine> = Arc::new(ClientEngine::new(client.clone()));
    Ok(Supervisor::new(engine, inventory, config, metrics))
}

async fn sync(output: Output, dir: PathBuf, inventory: InventoryArgs, policy: InventoryPolicy, period: Duration, once: bool) -> Result<()> {
    let cancel = cancel_on_ctrl_c();
    let client = Arc::new(KubeClient::try_default().await?);
    let metrics = Arc::new(Metrics::new());
    let inv_id = inventory.id();
    let config = SupervisorConfig { policy, ..SupervisorConfig::default() };
    let mut supervisor = supervisor_for(&client, inv_id.clone(), config, metrics.clone()).await?;

    let declared = Arc::new(DeclaredSet::new());
    let remediator = Arc::new(Remediator::new(client.clone(), inv_id.clone(), declared.clone(), RemediatorConfig::default(), metrics));
    let watches = WatchManager::new(client.clone(), Feed::new(remediator.queue().clone(), declared.clone(), inv_id));
    let workers = (!once).then(|| {
        let (remediator, cancel) = (remediator.clone(), cancel.clone());
        tokio::spawn(async move { remediator.run(cancel).await })
    });

    let mut failures = 0usize;
    loop {
        match load_dir(&dir) {
            Ok(manifests) => {
                let generation = declared.update(manifests.clone());
                info!(generation, objects = manifests.len(), "declared set updated");
                remediator.pause();
                let (kinds, errors) = supervisor.apply(&cancel, manifests).await;
                remediator.resume();
                if !once {
                    for (gvk, e) in watches.update_watches(&kinds).await {
                        warn!(gvk = %gvk, error = %e, "kind left unwatched");
                    }
                }
                report(output, &supervisor, &errors);
                failures = errors.len();
            }
            Err(e) if once => return Err(e),
            Err(e) => error!(error = %format!("{e:#}"), "cannot load manifests; keeping the previous declared set"),
        }
        if once || cancel.is_cancelled() {
            break;
        }
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(period) => {}
        }
    }

    cancel.cancel();
    watches.stop().await;
    if let Some(workers) = workers {
        let _ = workers.await;
    }
    if failures > 0 {
        return Err(anyhow!("sync finished with {failures} error(s)"));
    }
    Ok(())
}

async fn destroy(output: Output, inventory: InventoryArgs) -> Result<()> {
    let cancel = cancel_on_ctrl_c();
    let client = Arc::new(KubeClient::try_default().await?);
    let mut supervisor = supervisor_for(&client, inventory.id(), SupervisorConfig::default(), Arc::new(Metrics::new())).await?;
    let errors = supervisor.destroy(&cancel).await;
    report(output, &supervisor, &errors);
    errors.into_result().map_err(|e| anyhow!("destroy finished with {} error(s)", e.len()))
}

fn validate(output: Output, dir: &Path) -> Result<()> {
    let manifests = load_dir(dir)?;
    let ids: BTreeSet<ObjectId> = manifests.iter().map(|m| m.id().clone()).collect();
    let mut problems = 0usize;
    let mut rows = Vec::new();
    for m in &manifests {
        let deps: Vec<String> = match m.depends_on() {
            Ok(deps) => deps
                .iter()
                .map(|d| {
                    if !ids.contains(d) {
                        warn!(object = %m.id(), dependency = %d, "dependency is not declared here");
                    }
                    d.to_string()
                })
                .collect(),
            Err(e) => {
                problems += 1;
                error!(object = %m.id(), error = %e, "invalid dependency annotation");
                Vec::new()
            }
        };
        rows.push((m.id().to_string(), m.gvk().key(), deps));
    }
    match output {
        Output::Human => {
            for (id, gvk, deps) in &rows {
                if deps.is_empty() { println!("{id}\t{gvk}"); } else { println!("{id}\t{gvk}\t<- {}", deps.join(", ")); }
            }
        }
        Output::Json => {
            let items: Vec<_> = rows.iter().map(|(id, gvk, deps)| serde_json::json!({ "id": id, "gvk": gvk, "dependsOn": deps })).collect();
            println!("{}", serde_json::to_string_pretty(&items)?);
        }
    }
    if problems > 0 {
        return Err(anyhow!("{problems} manifest(s) failed validation"));
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    match cli.command {
        Commands::Sync { dir, inventory, policy, period_secs, once } => {
            let policy = InventoryPolicy::from_str(&policy).map_err(|e| anyhow!(e))?;
            info!(dir = %dir.display(), ?policy, period_secs, once, "sync invoked");
            sync(cli.output, dir, inventory, policy, Duration::from_secs(period_secs.max(1)), once).await
        }
        Commands::Destroy { inventory } => {
            info!(inventory = %inventory.id(), "destroy invoked");
            destroy(cli.output, inventory).await
        }
        Commands::Validate { dir } => validate(cli.output, &dir),
    }
}
