//! kube-spin operator - runs WebAssembly applications on Kubernetes

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use futures::StreamExt;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Pod, Service};
use k8s_openapi::api::networking::v1::Ingress;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Api, Client, CustomResourceExt};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use kube_spin::controller::{pod, wasm_app, Context, ControllerSettings};
use kube_spin::crd::WasmApp;
use kube_spin::registry::RedisPortRegistry;
use kube_spin::retry::{retry_with_backoff, RetryConfig};
use kube_spin::template::ManifestTemplates;
use kube_spin::{DEFAULT_INGRESS_DOMAIN, FIELD_MANAGER};

/// Watcher timeout (seconds), kept below the client read timeout (30s) so idle
/// watches are closed by the API server first
const WATCH_TIMEOUT_SECS: u32 = 25;

/// Attempts to reach the port registry before giving up at startup
const REGISTRY_CONNECT_ATTEMPTS: u32 = 10;

/// kube-spin - Kubernetes operator for WebAssembly applications
#[derive(Parser, Debug)]
#[command(name = "kube-spin", version, about, long_about = None)]
struct Cli {
    /// Print the WasmApp CRD manifest and exit
    #[arg(long)]
    crd: bool,

    /// Emit logs as JSON
    #[arg(long, env = "KUBE_SPIN_LOG_JSON")]
    log_json: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the WasmApp and Pod controllers (default mode)
    Controller(ControllerArgs),
}

/// Controller mode arguments
#[derive(Parser, Debug, Clone)]
struct ControllerArgs {
    /// Port registry URL, e.g. `redis://:password@host:6379/0`
    #[arg(
        long,
        env = "KUBE_SPIN_REGISTRY_URL",
        default_value = "redis://127.0.0.1:6379/0"
    )]
    registry_url: String,

    /// Timeout for a single port registry call, in milliseconds
    #[arg(
        long,
        env = "KUBE_SPIN_REGISTRY_TIMEOUT_MS",
        default_value_t = 2000,
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    registry_timeout_ms: u64,

    /// Directory with deployment.yaml, service.yaml and ingress.yaml overriding
    /// the built-in base manifests
    #[arg(long, env = "KUBE_SPIN_TEMPLATE_DIR")]
    template_dir: Option<PathBuf>,

    /// Domain for ingress hosts synthesized as `<name>.<domain>`
    #[arg(long, env = "KUBE_SPIN_DEFAULT_INGRESS_DOMAIN", default_value = DEFAULT_INGRESS_DOMAIN)]
    default_ingress_domain: String,

    /// Re-check a running pod whose port is not registered yet after this many
    /// seconds (off by default)
    #[arg(
        long,
        env = "KUBE_SPIN_PORT_RECHECK_SECS",
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    port_recheck_secs: Option<u64>,

    /// Requeue delay after a failed reconcile, in seconds
    #[arg(
        long,
        env = "KUBE_SPIN_ERROR_REQUEUE_SECS",
        default_value_t = 30,
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    error_requeue_secs: u64,
}

impl ControllerArgs {
    fn settings(&self) -> ControllerSettings {
        ControllerSettings {
            default_ingress_domain: self.default_ingress_domain.clone(),
            port_recheck: self.port_recheck_secs.map(Duration::from_secs),
            error_requeue: Duration::from_secs(self.error_requeue_secs),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if let Err(e) = rustls::crypto::aws_lc_rs::default_provider().install_default() {
        eprintln!("failed to install the aws-lc-rs crypto provider: {:?}", e);
        std::process::exit(1);
    }

    let cli = Cli::parse();
    init_tracing(cli.log_json);

    if cli.crd {
        let crd = serde_yaml::to_string(&WasmApp::crd())
            .map_err(|e| anyhow::anyhow!("failed to serialize CRD: {}", e))?;
        println!("{crd}");
        return Ok(());
    }

    match cli.command {
        Some(Commands::Controller(args)) => run_controller(args).await,
        None => run_controller(ControllerArgs::parse_from(["controller"])).await,
    }
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer()).init();
    }
}

/// Run both controllers until a shutdown signal arrives
async fn run_controller(args: ControllerArgs) -> anyhow::Result<()> {
    tracing::info!("starting kube-spin controller");

    let templates = match &args.template_dir {
        Some(dir) => ManifestTemplates::from_dir(dir),
        None => ManifestTemplates::embedded(),
    }
    .map_err(|e| anyhow::anyhow!("cannot load base manifests: {}", e))?;

    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("failed to create kube client: {}", e))?;

    ensure_crd_installed(&client).await?;

    let timeout = Duration::from_millis(args.registry_timeout_ms);
    let registry = retry_with_backoff(
        &RetryConfig::with_max_attempts(REGISTRY_CONNECT_ATTEMPTS),
        "connect_port_registry",
        || RedisPortRegistry::connect(&args.registry_url, timeout),
    )
    .await
    .map_err(|e| anyhow::anyhow!("port registry unreachable: {}", e))?;
    tracing::info!("connected to port registry");

    let ctx = Arc::new(
        Context::builder(client.clone(), Arc::new(templates), Arc::new(registry))
            .settings(args.settings())
            .build(),
    );

    let watcher = || WatcherConfig::default().timeout(WATCH_TIMEOUT_SECS);

    tracing::info!("- WasmApp controller");
    let wasm_app_ctrl = Controller::new(Api::<WasmApp>::all(client.clone()), watcher())
        .owns(Api::<Deployment>::all(client.clone()), watcher())
        .owns(Api::<Service>::all(client.clone()), watcher())
        .owns(Api::<Ingress>::all(client.clone()), watcher())
        .shutdown_on_signal()
        .run(wasm_app::reconcile, wasm_app::error_policy, ctx.clone())
        .for_each(log_reconcile_result("WasmApp"));

    tracing::info!("- Pod controller");
    let pod_ctrl = Controller::new(Api::<Pod>::all(client), watcher())
        .shutdown_on_signal()
        .run(pod::reconcile, pod::error_policy, ctx)
        .for_each(log_reconcile_result("Pod"));

    futures::future::join(wasm_app_ctrl, pod_ctrl).await;

    tracing::info!("kube-spin controller shutting down");
    Ok(())
}

/// Install or update the WasmApp CRD using server-side apply
async fn ensure_crd_installed(client: &Client) -> anyhow::Result<()> {
    use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
    use kube::api::{Patch, PatchParams};

    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    let crd = WasmApp::crd();
    let name = crd
        .metadata
        .name
        .clone()
        .ok_or_else(|| anyhow::anyhow!("generated CRD has no name"))?;

    tracing::info!(crd = %name, "installing CRD");
    crds.patch(
        &name,
        &PatchParams::apply(FIELD_MANAGER).force(),
        &Patch::Apply(&crd),
    )
    .await
    .map_err(|e| anyhow::anyhow!("failed to install {} CRD: {}", name, e))?;
    Ok(())
}

fn log_reconcile_result<T: std::fmt::Debug, E: std::fmt::Debug>(
    controller_name: &'static str,
) -> impl Fn(Result<T, E>) -> std::future::Ready<()> {
    move |result| {
        match result {
            Ok(object) => tracing::debug!(?object, "{} reconciliation completed", controller_name),
            Err(e) => tracing::warn!(error = ?e, "{} reconciliation error", controller_name),
        }
        std::future::ready(())
    }
}
