use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use cabin_api::{Engine, LogOptions, Mutation};
use cabin_core::{ClusterId, EntityKey, EntityKind, EntityRecord, Event, SharedPolicy, Topic};
use cabin_kubehub::KubeClusterClient;
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand, ValueEnum};
use futures::StreamExt;
use tokio::signal;
use tracing::{info, warn};

mod config;

use config::ClusterFile;

#[derive(Parser, Debug)]
#[command(name = "cabinctl", version, about = "Cabin multi-cluster CLI")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    /// Cluster file listing the endpoints to register
    #[arg(long = "config", env = "CABIN_CONFIG", global = true, default_value = "cabin.yaml")]
    config: PathBuf,

    /// Cluster to operate on, by name (default: first in the file)
    #[arg(short = 'c', long = "cluster", global = true)]
    cluster: Option<String>,

    /// Namespace for namespaced kinds (default: "default")
    #[arg(long = "ns", global = true)]
    namespace: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Subcommand, Debug)]
enum Commands {
    /// Probe every cluster in the file and show reachability
    Clusters,
    /// Print engine events until Ctrl-C
    Watch {
        /// Only events for this kind, e.g. "pods" or "deploy"
        #[arg(value_parser = parse_kind)]
        kind: Option<EntityKind>,
    },
    /// List entities of a kind
    Ls {
        #[arg(value_parser = parse_kind)]
        kind: EntityKind,
    },
    /// Add or remove a label
    Label {
        #[command(subcommand)]
        op: LabelOp,
    },
    /// Set the replica count of a deployment or replica set
    Scale {
        #[arg(value_parser = parse_kind)]
        kind: EntityKind,
        name: String,
        replicas: u32,
    },
    /// Roll a single-container deployment to a new image
    Rollout { name: String, image: String },
    /// Recreate an entity on another cluster from its last-applied configuration
    Copy {
        #[arg(value_parser = parse_kind)]
        kind: EntityKind,
        name: String,
        /// Destination cluster name
        #[arg(long = "to")]
        to: String,
    },
    /// Show the rollout history of a deployment
    History { name: String },
    /// Print a pod container's log
    Logs {
        pod: String,
        /// Container to read; required for multi-container pods
        #[arg(long)]
        container: Option<String>,
        /// Keep streaming new lines until Ctrl-C
        #[arg(short = 'f', long)]
        follow: bool,
        /// Only the last N lines
        #[arg(long)]
        tail: Option<i64>,
        /// Only lines newer than this many seconds
        #[arg(long)]
        since: Option<i64>,
        /// Read the previous, terminated container instance
        #[arg(long)]
        previous: bool,
    },
}

#[derive(Subcommand, Debug)]
enum LabelOp {
    Add {
        #[arg(value_parser = parse_kind)]
        kind: EntityKind,
        name: String,
        key: String,
        value: String,
    },
    Rm {
        #[arg(value_parser = parse_kind)]
        kind: EntityKind,
        name: String,
        key: String,
    },
}

fn parse_kind(s: &str) -> Result<EntityKind, String> { EntityKind::from_str(s).map_err(|e| e.to_string()) }

fn init_tracing() {
    let env = std::env::var("CABIN_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("CABIN_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid CABIN_METRICS_ADDR; expected host:port");
        }
    }
}

/// Engine with every cluster from the file registered, in file order.
fn boot(cli: &Cli) -> Result<(Engine, Vec<ClusterId>)> {
    let file = ClusterFile::load(&cli.config)?;
    if file.clusters.is_empty() {
        bail!("{} lists no clusters", cli.config.display());
    }
    let policy = file.policy(|k| std::env::var(k).ok());
    let engine = Engine::new(Arc::new(KubeClusterClient::new()), Arc::new(SharedPolicy::new(policy)));
    let mut ids = Vec::with_capacity(file.clusters.len());
    for entry in &file.clusters {
        let id = engine
            .register_cluster(entry.to_request())
            .with_context(|| format!("registering {}", entry.url))?;
        ids.push(id);
    }
    Ok((engine, ids))
}

fn find_cluster(engine: &Engine, ids: &[ClusterId], name: Option<&str>) -> Result<ClusterId> {
    match name {
        None => ids.first().copied().ok_or_else(|| anyhow!("no clusters registered")),
        Some(n) => engine
            .clusters()
            .into_iter()
            .find(|c| c.name == n)
            .map(|c| c.id)
            .ok_or_else(|| anyhow!("no cluster named {:?}", n)),
    }
}

fn namespace_for(kind: EntityKind, ns: Option<&str>) -> Option<String> {
    kind.namespaced().then(|| ns.unwrap_or("default").to_string())
}

/// Refresh the collection holding `name` and return its key once cached.
async fn load_entity(engine: &Engine, cluster: ClusterId, kind: EntityKind, ns: Option<&str>, name: &str) -> Result<EntityKey> {
    let ns = namespace_for(kind, ns);
    let out = engine.refresh(cluster, kind, ns.as_deref()).await?;
    if let Some(e) = &out.interrupted {
        warn!(error = %e, seen = out.seen, "listing interrupted");
    }
    let key = EntityKey::new(cluster, kind, ns.as_deref(), name);
    if engine.entity(&key).is_none() {
        bail!("{} {} not found", kind, display_name(&key));
    }
    Ok(key)
}

async fn mutate(engine: &Engine, key: EntityKey, mutation: Mutation, output: Output) -> Result<()> {
    let kind = mutation.kind();
    let out = engine.submit(key, mutation).await?;
    match output {
        Output::Human => println!(
            "{} confirmed: {} {} (rv {})",
            kind,
            out.key.kind,
            display_name(&out.key),
            out.confirmed.resource_version
        ),
        Output::Json => println!("{}", serde_json::to_string_pretty(&out)?),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();
    let (engine, ids) = boot(&cli)?;
    let ns = cli.namespace.as_deref();

    let result = run(&cli, &engine, &ids, ns).await;
    engine.shutdown();
    result
}

async fn run(cli: &Cli, engine: &Engine, ids: &[ClusterId], ns: Option<&str>) -> Result<()> {
    match &cli.command {
        Commands::Clusters => {
            let reports = engine.check_clusters().await;
            match cli.output {
                Output::Human => {
                    println!("{:<16} {:<36} {:<10} CHECKED", "NAME", "URL", "REACHABLE");
                    for c in engine.clusters() {
                        let checked = c.last_checked_at.map(|t| render_age(Some(t))).unwrap_or_else(|| "-".into());
                        println!("{:<16} {:<36} {:<10} {}", c.name, c.url, c.reachable, checked);
                    }
                    for r in reports.iter().filter(|r| r.error.is_some()) {
                        eprintln!("{}: {}", r.name, r.error.as_deref().unwrap_or_default());
                    }
                }
                Output::Json => println!("{}", serde_json::to_string_pretty(&engine.clusters())?),
            }
        }
        Commands::Ls { kind } => {
            let cluster = find_cluster(engine, ids, cli.cluster.as_deref())?;
            let scope = namespace_for(*kind, ns);
            let out = engine.refresh(cluster, *kind, scope.as_deref()).await?;
            info!(kind = %kind, seen = out.seen, changed = out.changed, removed = out.removed, "ls refreshed");
            let items = engine.query(cluster, *kind, scope.as_deref())?;
            match cli.output {
                Output::Human => print_table(*kind, &items),
                Output::Json => {
                    let docs: Vec<_> = items.iter().map(|r| &r.payload).collect();
                    println!("{}", serde_json::to_string_pretty(&docs)?);
                }
            }
            if let Some(e) = out.interrupted {
                eprintln!("warning: listing interrupted ({}); showing cached entries", e);
            }
        }
        Commands::Watch { kind } => {
            let topic = match (kind, cli.cluster.as_deref()) {
                (Some(k), _) => Topic::Kind(find_cluster(engine, ids, cli.cluster.as_deref())?, *k),
                (None, Some(_)) => Topic::Cluster(find_cluster(engine, ids, cli.cluster.as_deref())?),
                (None, None) => Topic::Global,
            };
            info!(topic = ?topic, "watch invoked");
            let mut events = engine.events(topic);
            loop {
                tokio::select! {
                    maybe = events.recv() => {
                        let Some(ev) = maybe else {
                            warn!("event stream closed; exiting watch loop");
                            break;
                        };
                        match cli.output {
                            Output::Human => println!("{}", render_event(engine, &ev)),
                            Output::Json => println!("{}", serde_json::to_string(&ev)?),
                        }
                    }
                    _ = signal::ctrl_c() => {
                        info!("Ctrl-C received; shutting down watch loop");
                        break;
                    }
                }
            }
        }
        Commands::Label { op } => {
            let cluster = find_cluster(engine, ids, cli.cluster.as_deref())?;
            let (kind, name, mutation) = match op {
                LabelOp::Add { kind, name, key, value } => {
                    (*kind, name, Mutation::LabelAdd { key: key.clone(), value: value.clone() })
                }
                LabelOp::Rm { kind, name, key } => (*kind, name, Mutation::LabelDelete { key: key.clone() }),
            };
            let key = load_entity(engine, cluster, kind, ns, name).await?;
            mutate(engine, key, mutation, cli.output).await?;
        }
        Commands::Scale { kind, name, replicas } => {
            let cluster = find_cluster(engine, ids, cli.cluster.as_deref())?;
            let key = load_entity(engine, cluster, *kind, ns, name).await?;
            mutate(engine, key, Mutation::Scale { replicas: *replicas }, cli.output).await?;
        }
        Commands::Rollout { name, image } => {
            let cluster = find_cluster(engine, ids, cli.cluster.as_deref())?;
            let key = load_entity(engine, cluster, EntityKind::Deployment, ns, name).await?;
            mutate(engine, key, Mutation::RollingUpdate { image: image.clone() }, cli.output).await?;
        }
        Commands::Copy { kind, name, to } => {
            let cluster = find_cluster(engine, ids, cli.cluster.as_deref())?;
            let target = find_cluster(engine, ids, Some(to))?;
            let key = load_entity(engine, cluster, *kind, ns, name).await?;
            mutate(engine, key, Mutation::CrossClusterCopy { target }, cli.output).await?;
        }
        Commands::History { name } => {
            let cluster = find_cluster(engine, ids, cli.cluster.as_deref())?;
            let key = load_entity(engine, cluster, EntityKind::Deployment, ns, name).await?;
            engine.refresh(cluster, EntityKind::ReplicaSet, key.namespace.as_deref()).await?;
            let history = engine.deployment_history(&key)?;
            match cli.output {
                Output::Human => {
                    println!("{:<9} {:<32} {:<9} IMAGES", "REVISION", "REPLICASET", "REPLICAS");
                    for rev in &history {
                        let replicas = rev.replica_set.payload.spec_replicas().unwrap_or(0);
                        println!("{:<9} {:<32} {:<9} {}", rev.revision, rev.replica_set.key.name, replicas, rev.images().join(","));
                    }
                }
                Output::Json => {
                    #[derive(serde::Serialize)]
                    struct Row<'a> { revision: u64, replica_set: &'a str, images: Vec<String> }
                    let rows: Vec<_> = history
                        .iter()
                        .map(|r| Row { revision: r.revision, replica_set: &r.replica_set.key.name, images: r.images() })
                        .collect();
                    println!("{}", serde_json::to_string_pretty(&rows)?);
                }
            }
        }
        Commands::Logs { pod, container, follow, tail, since, previous } => {
            let cluster = find_cluster(engine, ids, cli.cluster.as_deref())?;
            let key = load_entity(engine, cluster, EntityKind::Pod, ns, pod).await?;
            let opts = LogOptions { follow: *follow, tail_lines: *tail, since_seconds: *since, previous: *previous };
            let mut lines = engine.logs(&key, container.as_deref(), &opts).await?;
            loop {
                tokio::select! {
                    next = lines.next() => match next {
                        Some(Ok(line)) => match cli.output {
                            Output::Human => println!("{}", line),
                            Output::Json => println!("{}", serde_json::to_string(&line)?),
                        },
                        Some(Err(e)) => bail!("log of {}: {}", display_name(&key), e),
                        None => break,
                    },
                    _ = signal::ctrl_c() => {
                        info!("Ctrl-C received; closing log stream");
                        break;
                    }
                }
            }
        }
    }
    Ok(())
}

fn print_table(kind: EntityKind, items: &[Arc<EntityRecord>]) {
    match kind {
        EntityKind::Pod => {
            println!("{:<16} {:<40} {:<7} {:<20} AGE", "NAMESPACE", "NAME", "READY", "STATUS");
            for r in items {
                let (ready, total) = r.payload.container_readiness();
                println!(
                    "{:<16} {:<40} {:<7} {:<20} {}",
                    r.key.namespace.as_deref().unwrap_or("-"),
                    r.key.name,
                    format!("{}/{}", ready, total),
                    r.payload.pod_status(),
                    age_of(r)
                );
            }
        }
        EntityKind::Deployment | EntityKind::ReplicaSet => {
            println!("{:<16} {:<40} {:<9} {:<9} AGE", "NAMESPACE", "NAME", "DESIRED", "AVAILABLE");
            for r in items {
                println!(
                    "{:<16} {:<40} {:<9} {:<9} {}",
                    r.key.namespace.as_deref().unwrap_or("-"),
                    r.key.name,
                    r.payload.spec_replicas().unwrap_or(0),
                    r.payload.status_available_replicas().unwrap_or(0),
                    age_of(r)
                );
            }
        }
        _ => {
            println!("{:<16} {:<40} AGE", "NAMESPACE", "NAME");
            for r in items {
                println!("{:<16} {:<40} {}", r.key.namespace.as_deref().unwrap_or("-"), r.key.name, age_of(r));
            }
        }
    }
}

fn render_event(engine: &Engine, ev: &Event) -> String {
    let cluster_name = |id: ClusterId| engine.cluster(id).map(|c| c.name).unwrap_or_else(|| id.to_string());
    match ev {
        Event::ClusterRegistered { cluster } => format!("+ cluster {}", cluster_name(*cluster)),
        Event::ClusterUpdated { cluster } => format!("~ cluster {}", cluster_name(*cluster)),
        Event::ClusterRemoved { cluster } => format!("- cluster {}", cluster),
        Event::ClusterReachabilityChanged { cluster, reachable } => {
            format!("! cluster {} {}", cluster_name(*cluster), if *reachable { "reachable" } else { "unreachable" })
        }
        Event::EntityChanged { key } => format!("+ {} {}", key.kind, display_name(key)),
        Event::EntityRemoved { key } => format!("- {} {}", key.kind, display_name(key)),
        Event::MutationResolved { id, key, kind, status, reason } => match reason {
            Some(r) => format!("= {} {} {} {:?}: {}", id, kind, display_name(key), status, r),
            None => format!("= {} {} {} {:?}", id, kind, display_name(key), status),
        },
    }
}

fn display_name(key: &EntityKey) -> String {
    match &key.namespace {
        Some(ns) => format!("{}/{}", ns, key.name),
        None => key.name.clone(),
    }
}

fn age_of(rec: &EntityRecord) -> String {
    let created = rec
        .payload
        .pointer("/metadata/creationTimestamp")
        .and_then(|v| v.as_str())
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|t| t.with_timezone(&Utc));
    render_age(created)
}

fn render_age(since: Option<DateTime<Utc>>) -> String {
    let Some(since) = since else { return "-".to_string() };
    let mut secs = (Utc::now() - since).num_seconds().max(0) as u64;
    let days = secs / 86_400; secs %= 86_400;
    let hours = secs / 3600; secs %= 3600;
    let mins = secs / 60; secs %= 60;
    if days > 0 { format!("{}d{}h", days, hours) }
    else if hours > 0 { format!("{}h{}m", hours, mins) }
    else if mins > 0 { format!("{}m", mins) }
    else { format!("{}s", secs) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_arguments_accept_short_names() {
        assert_eq!(parse_kind("deploy"), Ok(EntityKind::Deployment));
        assert!(parse_kind("cronjob").is_err());
    }

    #[test]
    fn logs_command_parses_stream_options() {
        let cli = Cli::try_parse_from(["cabinctl", "logs", "web-0", "--container", "app", "-f", "--tail", "20"]).unwrap();
        match cli.command {
            Commands::Logs { pod, container, follow, tail, since, previous } => {
                assert_eq!(pod, "web-0");
                assert_eq!(container.as_deref(), Some("app"));
                assert!(follow && !previous);
                assert_eq!(tail, Some(20));
                assert_eq!(since, None);
            }
            other => panic!("parsed as {:?}", other),
        }
    }

    #[test]
    fn namespaced_kinds_default_to_default() {
        assert_eq!(namespace_for(EntityKind::Pod, None).as_deref(), Some("default"));
        assert_eq!(namespace_for(EntityKind::Pod, Some("shop")).as_deref(), Some("shop"));
        assert_eq!(namespace_for(EntityKind::Node, Some("shop")), None);
    }

    #[test]
    fn ages_are_compact() {
        assert_eq!(render_age(None), "-");
        let t = Utc::now() - chrono::Duration::seconds(3 * 3600 + 120);
        assert_eq!(render_age(Some(t)), "3h2m");
    }

    #[test]
    fn cli_parses_mutations() {
        let cli = Cli::try_parse_from(["cabinctl", "-c", "prod", "--ns", "shop", "scale", "deploy", "web", "5"]).unwrap();
        assert_eq!(cli.cluster.as_deref(), Some("prod"));
        assert!(matches!(cli.command, Commands::Scale { kind: EntityKind::Deployment, replicas: 5, .. }));
        let cli = Cli::try_parse_from(["cabinctl", "label", "rm", "po", "p1", "env"]).unwrap();
        assert!(matches!(cli.command, Commands::Label { op: LabelOp::Rm { kind: EntityKind::Pod, .. } }));
    }
}
