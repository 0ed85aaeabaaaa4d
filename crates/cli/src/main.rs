use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use keel_client::CommandExecutor;
use keel_core::{SourceKey, SourceKind};
use keel_provider::{CycleReport, Provider, Settings};
use keel_status::{StatusMutator, StatusUpdater};
use keel_translate::api_resource;
use kube::core::DynamicObject;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

mod manifest;

use manifest::{passthrough_registry, Manifest};

#[derive(Parser, Debug)]
#[command(name = "keelctl", version, about = "Keel gateway config sync")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum StatusSink {
    /// Log the status each object would get
    Log,
    /// Write conditions to the cluster
    Kube,
}

#[derive(clap::Args, Debug)]
struct SyncArgs {
    /// Manifest with backends and pre-translated objects (YAML or JSON)
    #[arg(short = 'f', long = "file")]
    file: PathBuf,
    /// Backend CLI invoked per config
    #[arg(long = "adc", env = "KEEL_ADC_BIN", default_value = "adc")]
    adc: PathBuf,
    /// Where status conditions go
    #[arg(long = "status", value_enum, default_value_t = StatusSink::Log)]
    status: StatusSink,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List supported source kinds
    Kinds {
        /// Ask the API server which of them are served
        #[arg(long = "discover", action = ArgAction::SetTrue)]
        discover: bool,
    },
    /// Load a manifest, push it and run one full sync cycle
    Sync(SyncArgs),
    /// Load a manifest, push it and keep syncing until interrupted
    Run {
        #[command(flatten)]
        args: SyncArgs,
        /// Seconds between full cycles (overrides KEEL_SYNC_PERIOD_SECS)
        #[arg(long = "period")]
        period: Option<u64>,
    },
}

fn init_tracing(settings: &Settings) {
    let filter = tracing_subscriber::EnvFilter::from_str(&settings.log_filter)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(keel_provider::settings::DEFAULT_LOG_FILTER));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

/// Prometheus exporter for the `keel_*` series; needs tracing up for its log lines.
fn init_metrics(settings: &Settings) {
    let Some(addr) = settings.metrics_addr.as_deref() else { return };
    let sock: std::net::SocketAddr = match addr.parse() {
        Ok(sock) => sock,
        Err(e) => {
            warn!(addr, error = %e, "metrics: bad listen address; exporter disabled");
            return;
        }
    };
    match metrics_exporter_prometheus::PrometheusBuilder::new().with_http_listener(sock).install() {
        Ok(()) => info!(%sock, "metrics: exporter listening"),
        Err(e) => warn!(error = %e, "metrics: exporter install failed"),
    }
}

/// Applies mutators to a blank object and logs the resulting status.
struct LogStatus;

#[async_trait::async_trait]
impl StatusUpdater for LogStatus {
    async fn update(&self, kind: SourceKind, key: &SourceKey, mutate: StatusMutator) -> Result<()> {
        let mut obj = DynamicObject::new(&key.name, &api_resource(kind)).within(&key.namespace);
        if mutate(&mut obj) {
            info!(%key, status = %obj.data["status"], "status (dry run)");
        }
        Ok(())
    }
}

async fn build_provider(args: &SyncArgs, settings: Settings) -> Result<(Provider, Manifest)> {
    let manifest = Manifest::load(&args.file)?;
    let status: Arc<dyn StatusUpdater> = match args.status {
        StatusSink::Log => Arc::new(LogStatus),
        StatusSink::Kube => {
            let client = keel_kubehub::client().await?;
            Arc::new(keel_kubehub::KubeStatusUpdater::new(client, "keelctl"))
        }
    };
    let executor = Arc::new(CommandExecutor::new(&args.adc));
    let provider = Provider::new(settings, passthrough_registry(), executor, status);
    Ok((provider, manifest))
}

/// Push every manifest object; failures are logged and left to the next cycle.
async fn apply_manifest(provider: &Provider, manifest: &Manifest) -> Result<()> {
    for (ctx, obj) in manifest.sources()? {
        if let Err(e) = provider.update(&ctx, &obj).await {
            warn!(key = %obj.key(), error = %e, "update failed");
        }
    }
    Ok(())
}

fn print_report(output: Output, report: &CycleReport, provider: &Provider) -> Result<()> {
    let failing = provider.failing();
    match output {
        Output::Human => {
            println!("cycle {}: {} config(s) failed, {} object(s) failing", report.id, report.failed_configs.len(), failing.len());
            for name in &report.failed_configs {
                println!("  config {}", name);
                for msg in report.unknown.get(name).into_iter().flatten() {
                    println!("    {}", msg);
                }
            }
            if !failing.is_empty() {
                println!("{:<40} MESSAGE", "OBJECT");
                for (key, msg) in &failing {
                    println!("{:<40} {}", key.to_string(), msg);
                }
            }
        }
        Output::Json => {
            let objects: Vec<_> = failing.iter().map(|(k, m)| serde_json::json!({ "key": k.to_string(), "message": m })).collect();
            let doc = serde_json::json!({
                "cycle": report.id,
                "failed_configs": report.failed_configs,
                "unknown": report.unknown,
                "failing": objects,
                "status_updates": report.status_updates,
            });
            println!("{}", serde_json::to_string_pretty(&doc)?);
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let settings = Settings::from_env();
    init_tracing(&settings);
    init_metrics(&settings);
    let cli = Cli::parse();

    match cli.command {
        Commands::Kinds { discover } => {
            let served = if discover {
                match keel_kubehub::client().await {
                    Ok(client) => Some(keel_kubehub::served_kinds(client).await?),
                    Err(e) => {
                        error!(error = ?e, "discover failed");
                        None
                    }
                }
            } else {
                None
            };
            match cli.output {
                Output::Human => {
                    println!("{:<22} {:<40} {:<36} SERVED", "KIND", "API VERSION", "RESOURCE TYPES");
                    for kind in SourceKind::ALL {
                        let info = kind.info();
                        let types: Vec<&str> = info.resource_types.iter().map(|t| t.as_str()).collect();
                        let mark = match &served {
                            Some(s) if s.contains(&kind) => "yes",
                            Some(_) => "no",
                            None => "-",
                        };
                        println!("{:<22} {:<40} {:<36} {}", info.kind, info.api_version(), types.join(","), mark);
                    }
                }
                Output::Json => {
                    let rows: Vec<_> = SourceKind::ALL
                        .iter()
                        .map(|k| {
                            let info = k.info();
                            serde_json::json!({
                                "kind": info.kind,
                                "apiVersion": info.api_version(),
                                "resourceTypes": info.resource_types,
                                "served": served.as_ref().map(|s| s.contains(k)),
                            })
                        })
                        .collect();
                    println!("{}", serde_json::to_string_pretty(&rows)?);
                }
            }
        }
        Commands::Sync(args) => {
            let (provider, manifest) = build_provider(&args, settings).await?;
            apply_manifest(&provider, &manifest).await?;
            let report = provider.sync_cycle().await;
            print_report(cli.output, &report, &provider)?;
            if !report.failed_configs.is_empty() {
                std::process::exit(1);
            }
        }
        Commands::Run { args, period } => {
            let mut settings = settings;
            if let Some(secs) = period.filter(|s| *s > 0) {
                settings = settings.with_sync_period(Duration::from_secs(secs));
            }
            let (provider, manifest) = build_provider(&args, settings).await?;
            apply_manifest(&provider, &manifest).await?;
            let cancel = CancellationToken::new();
            let stopper = cancel.clone();
            tokio::spawn(async move {
                if signal::ctrl_c().await.is_ok() {
                    info!("interrupt received; stopping");
                }
                stopper.cancel();
            });
            provider.run(cancel).await?;
            let failing = provider.failing();
            info!(cycles = provider.cycles(), failing = failing.len(), "stopped");
        }
    }
    Ok(())
}
