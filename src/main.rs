//! Merge ingress controller entrypoint

use std::sync::Arc;

use clap::Parser;
use futures::StreamExt;
use k8s_openapi::api::networking::v1::Ingress;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Api, Client};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use ingress_merge::config::{Selector, Settings};
use ingress_merge::controller::{error_policy, reconcile, Context};

/// Consolidates origin ingresses into a bounded number of shared merged
/// ingresses, keyed by a per-namespace ConfigMap.
#[derive(Parser, Debug)]
#[command(name = "ingress-merge", version, about, long_about = None)]
struct Cli {
    /// Process ingress resources carrying this ingress class
    #[arg(long, env = "INGRESS_CLASS", default_value = ingress_merge::DEFAULT_INGRESS_CLASS)]
    ingress_class: String,

    /// Process ingress resources with labels matching this selector (key=value,...)
    #[arg(long, default_value = "")]
    ingress_selector: String,

    /// Consult config maps with labels matching this selector (key=value,...)
    #[arg(long, default_value = "")]
    configmap_selector: String,

    /// Slot budget per merged ingress
    #[arg(long, default_value_t = ingress_merge::DEFAULT_MAX_SLOTS)]
    max_slots: i64,

    /// Ignore ingress resources carrying this annotation (repeatable)
    #[arg(long = "ingress-watch-ignore")]
    ingress_watch_ignore: Vec<String>,

    /// Ignore config maps carrying this annotation (repeatable)
    #[arg(long = "configmap-watch-ignore")]
    configmap_watch_ignore: Vec<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let settings = Settings {
        ingress_class: cli.ingress_class,
        ingress_selector: Selector::parse(&cli.ingress_selector)?,
        config_map_selector: Selector::parse(&cli.configmap_selector)?,
        max_slots: cli.max_slots,
        ingress_watch_ignore: cli.ingress_watch_ignore,
        config_map_watch_ignore: cli.configmap_watch_ignore,
    };

    let client = Client::try_default().await?;
    let ingresses: Api<Ingress> = Api::all(client.clone());
    let ctx = Arc::new(Context::new(client, settings));

    tracing::info!("starting merge ingress controller");

    Controller::new(ingresses, WatcherConfig::default())
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(|result| async move {
            match result {
                Ok(object) => tracing::debug!(?object, "reconciliation completed"),
                Err(error) => tracing::error!(error = ?error, "reconciliation error"),
            }
        })
        .await;

    tracing::info!("merge ingress controller shutting down");
    Ok(())
}
