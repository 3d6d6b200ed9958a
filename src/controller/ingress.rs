//! Ingress merge reconciler
//!
//! Every ingress event routes into a namespace-wide reconcile: list all
//! ingresses, group the eligible origins by their config, plan buckets,
//! build the desired merged ingress per bucket, diff it against the cluster,
//! and reflect load-balancer status back onto every contributor.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ConfigMap;
use k8s_openapi::api::networking::v1::{Ingress, IngressLoadBalancerIngress};
use kube::api::{ListParams, PostParams};
use kube::runtime::controller::Action;
use kube::{Api, Client, ResourceExt};
use rand::Rng;
use tracing::{debug, error, info, instrument};

#[cfg(test)]
use mockall::automock;

use crate::bucket::{generate_buckets, Bucket};
use crate::config::Settings;
use crate::error::Error;
use crate::merge::{build_merged_ingress, MergeConfig};
use crate::{
    CONFIG_ANNOTATION, FROM_CONFIG_ANNOTATION, INGRESS_CLASS_ANNOTATION, PRIORITY_ANNOTATION,
    RESULT_ANNOTATION, WILDCARD_TLS_SUFFIX,
};

/// Trait abstracting the apiserver operations the reconciler consumes
///
/// This is the only seam through which the controller touches the cluster,
/// which allows mocking the apiserver in tests while using the real client
/// in production. `get_*` return `None` for NotFound; every other apiserver
/// failure surfaces as an error.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterStore: Send + Sync {
    /// List every ingress in a namespace
    async fn list_ingresses(&self, namespace: &str) -> Result<Vec<Ingress>, Error>;

    /// Fetch one ingress, `None` when it does not exist
    async fn get_ingress(&self, namespace: &str, name: &str) -> Result<Option<Ingress>, Error>;

    /// Create an ingress
    async fn create_ingress(&self, ingress: &Ingress) -> Result<(), Error>;

    /// Replace an ingress; the object must carry the base `resourceVersion`
    async fn update_ingress(&self, ingress: &Ingress) -> Result<(), Error>;

    /// Replace the status subresource of an ingress
    async fn update_ingress_status(&self, ingress: &Ingress) -> Result<(), Error>;

    /// Fetch one config map, `None` when it does not exist
    async fn get_config_map(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ConfigMap>, Error>;
}

/// Production [`ClusterStore`] backed by a `kube` client
pub struct KubeStore {
    client: Client,
}

impl KubeStore {
    /// Create a store wrapping the given client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn ingresses(&self, namespace: &str) -> Api<Ingress> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn config_maps(&self, namespace: &str) -> Api<ConfigMap> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait]
impl ClusterStore for KubeStore {
    async fn list_ingresses(&self, namespace: &str) -> Result<Vec<Ingress>, Error> {
        let list = self
            .ingresses(namespace)
            .list(&ListParams::default())
            .await?;
        Ok(list.items)
    }

    async fn get_ingress(&self, namespace: &str, name: &str) -> Result<Option<Ingress>, Error> {
        Ok(self.ingresses(namespace).get_opt(name).await?)
    }

    async fn create_ingress(&self, ingress: &Ingress) -> Result<(), Error> {
        let namespace = ingress.namespace().unwrap_or_default();
        self.ingresses(&namespace)
            .create(&PostParams::default(), ingress)
            .await?;
        Ok(())
    }

    async fn update_ingress(&self, ingress: &Ingress) -> Result<(), Error> {
        let namespace = ingress.namespace().unwrap_or_default();
        self.ingresses(&namespace)
            .replace(&ingress.name_any(), &PostParams::default(), ingress)
            .await?;
        Ok(())
    }

    async fn update_ingress_status(&self, ingress: &Ingress) -> Result<(), Error> {
        let namespace = ingress.namespace().unwrap_or_default();
        let data =
            serde_json::to_vec(ingress).map_err(|err| Error::Serialization(err.to_string()))?;
        self.ingresses(&namespace)
            .replace_status(&ingress.name_any(), &PostParams::default(), data)
            .await?;
        Ok(())
    }

    async fn get_config_map(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ConfigMap>, Error> {
        Ok(self.config_maps(namespace).get_opt(name).await?)
    }
}

/// Controller context shared across all reconcile invocations
pub struct Context {
    /// Apiserver access seam (trait object for testability)
    pub store: Arc<dyn ClusterStore>,
    /// Startup-time operator settings
    pub settings: Settings,
}

impl Context {
    /// Create a context backed by the real apiserver
    pub fn new(client: Client, settings: Settings) -> Self {
        Self {
            store: Arc::new(KubeStore::new(client)),
            settings,
        }
    }

    /// Create a context with a custom store implementation.
    ///
    /// This is primarily used for testing with mock or fake stores.
    pub fn with_store(store: Arc<dyn ClusterStore>, settings: Settings) -> Self {
        Self { store, settings }
    }
}

/// Reconcile one ingress event.
///
/// The trigger only selects the namespace to work on; consolidation is a
/// function of the whole namespace, so per-object work would not converge.
#[instrument(skip(trigger, ctx), fields(
    namespace = %trigger.namespace().unwrap_or_default(),
    ingress = %trigger.name_any(),
))]
pub async fn reconcile(trigger: Arc<Ingress>, ctx: Arc<Context>) -> Result<Action, Error> {
    let namespace = trigger.namespace().unwrap_or_default();
    route(&ctx, &namespace, &trigger.name_any()).await?;
    Ok(Action::await_change())
}

/// Error policy for the controller: log and requeue with a short delay.
pub fn error_policy(trigger: Arc<Ingress>, error: &Error, _ctx: Arc<Context>) -> Action {
    error!(
        ?error,
        ingress = %trigger.name_any(),
        "reconciliation failed"
    );
    Action::requeue(Duration::from_secs(5))
}

/// Validate the triggering object and fan out to the namespace reconcile.
async fn route(ctx: &Context, namespace: &str, name: &str) -> Result<(), Error> {
    let Some(ingress) = ctx.store.get_ingress(namespace, name).await? else {
        info!(%namespace, ingress = %name, "ingress has been deleted, reconciling the namespace");
        return reconcile_namespace(ctx, namespace).await;
    };

    if is_merge_result(&ingress) {
        info!(%namespace, ingress = %name, "merged ingress changed, reconciling the namespace");
    } else if effective_ingress_class(&ingress) != ctx.settings.ingress_class {
        debug!(
            %namespace,
            ingress = %name,
            ingress_class = %ctx.settings.ingress_class,
            "ingress does not match the watched class, ignoring"
        );
        return Ok(());
    }

    reconcile_namespace(ctx, namespace).await
}

/// Recompute every merge group in the namespace from scratch and converge
/// the cluster onto it. Bucket-level failures are collected and returned as
/// one aggregate error so independent groups still make progress.
async fn reconcile_namespace(ctx: &Context, namespace: &str) -> Result<(), Error> {
    let ingresses = ctx.store.list_ingresses(namespace).await?;

    let mut merged_results: Vec<Ingress> = Vec::new();
    let mut candidates: Vec<Ingress> = Vec::new();
    for ingress in ingresses {
        if is_merge_result(&ingress) {
            merged_results.push(ingress);
        } else {
            candidates.push(ingress);
        }
    }

    let mut groups: BTreeMap<String, Vec<Ingress>> = BTreeMap::new();
    let mut configs: BTreeMap<String, ConfigMap> = BTreeMap::new();
    let mut skipped_configs: BTreeSet<String> = BTreeSet::new();

    for ingress in candidates {
        let name = ingress.name_any();

        if effective_ingress_class(&ingress) != ctx.settings.ingress_class {
            continue;
        }
        if has_ignore_annotation(ingress.annotations(), &ctx.settings.ingress_watch_ignore) {
            debug!(%namespace, ingress = %name, "ingress carries an ignore annotation, skipping");
            continue;
        }
        if !ctx.settings.ingress_selector.matches(ingress.labels()) {
            continue;
        }
        if let Some(priority) = ingress.annotations().get(PRIORITY_ANNOTATION) {
            if priority.parse::<i64>().is_err() {
                error!(
                    %namespace,
                    ingress = %name,
                    annotation = PRIORITY_ANNOTATION,
                    value = %priority,
                    "ingress priority annotation must be an integer, skipping"
                );
                continue;
            }
        }

        let Some(config_name) = ingress.annotations().get(CONFIG_ANNOTATION).cloned() else {
            error!(
                %namespace,
                ingress = %name,
                annotation = CONFIG_ANNOTATION,
                "ingress is missing the config annotation, skipping"
            );
            continue;
        };

        if skipped_configs.contains(&config_name) {
            continue;
        }
        if !configs.contains_key(&config_name) {
            match ctx.store.get_config_map(namespace, &config_name).await? {
                Some(config_map) => {
                    if has_ignore_annotation(
                        config_map.annotations(),
                        &ctx.settings.config_map_watch_ignore,
                    ) {
                        info!(%namespace, configmap = %config_name, "config carries an ignore annotation, skipping its group");
                        skipped_configs.insert(config_name);
                        continue;
                    }
                    if !ctx.settings.config_map_selector.matches(config_map.labels()) {
                        debug!(%namespace, configmap = %config_name, "config does not match the selector, skipping its group");
                        skipped_configs.insert(config_name);
                        continue;
                    }
                    configs.insert(config_name.clone(), config_map);
                }
                None => {
                    // The config may simply not exist yet; skip the group
                    // until it shows up.
                    error!(%namespace, configmap = %config_name, "config for ingress not found, skipping its group");
                    skipped_configs.insert(config_name);
                    continue;
                }
            }
        }

        groups.entry(config_name).or_default().push(ingress);
    }

    let mut failures: Vec<Error> = Vec::new();
    for (config_name, mut origins) in groups {
        let Some(config_map) = configs.get(&config_name) else {
            continue;
        };

        // A stable order makes the merged spec deterministic across runs.
        origins.sort_by(|a, b| {
            priority_of(b)
                .cmp(&priority_of(a))
                .then_with(|| a.metadata.name.cmp(&b.metadata.name))
        });

        let destinations: Vec<Ingress> = merged_results
            .iter()
            .filter(|result| {
                result.annotations().get(FROM_CONFIG_ANNOTATION) == Some(&config_name)
            })
            .cloned()
            .collect();

        let config = MergeConfig::from_config_map(config_map);
        let buckets = generate_buckets(origins, &destinations, ctx.settings.max_slots);
        for bucket in &buckets {
            if let Err(err) = apply_bucket(ctx, &config, bucket).await {
                failures.push(err);
            }
        }
    }

    match Error::aggregate(failures) {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

/// Converge one bucket: create the merged ingress when the bucket has no
/// destination yet, otherwise diff against the live object and update only
/// when something we own actually differs. Finishes by reflecting the merged
/// load-balancer status back onto every contributor.
async fn apply_bucket(ctx: &Context, config: &MergeConfig, bucket: &Bucket) -> Result<(), Error> {
    let Some(mut desired) = build_merged_ingress(bucket, config, &ctx.settings.ingress_class)
    else {
        return Ok(());
    };

    let mut changed = false;
    let merged = match &bucket.destination {
        None => {
            let name = format!("{}-{}", config.name, random_suffix());
            desired.metadata.name = Some(name.clone());
            if config.use_wildcard_tls {
                if let Some(entry) = desired
                    .spec
                    .as_mut()
                    .and_then(|spec| spec.tls.as_mut())
                    .and_then(|tls| tls.first_mut())
                {
                    entry.secret_name = Some(format!("{name}{WILDCARD_TLS_SUFFIX}"));
                }
            }
            changed = true;

            ctx.store.create_ingress(&desired).await.inspect_err(|err| {
                error!(
                    namespace = %config.namespace,
                    ingress = %name,
                    error = %err,
                    "could not create merged ingress"
                );
            })?;
            info!(namespace = %config.namespace, ingress = %name, "created merged ingress");
            desired
        }
        Some(destination) => {
            let name = destination.name_any();
            let live = ctx
                .store
                .get_ingress(&config.namespace, &name)
                .await?
                .ok_or_else(|| Error::MissingDestination {
                    namespace: config.namespace.clone(),
                    name: name.clone(),
                })?;

            if has_changed(&live, &desired) {
                changed = true;
                desired.metadata.resource_version = live.metadata.resource_version.clone();
                ctx.store.update_ingress(&desired).await.inspect_err(|err| {
                    error!(
                        namespace = %config.namespace,
                        ingress = %name,
                        error = %err,
                        "could not update merged ingress"
                    );
                })?;
                info!(namespace = %config.namespace, ingress = %name, "updated merged ingress");

                // Keep the live status around for the reflection step below.
                desired.status = live.status.clone();
                desired
            } else {
                live
            }
        }
    };

    changed |= reflect_status(ctx, bucket, &merged).await;

    if !changed {
        info!(
            namespace = %config.namespace,
            ingress = %merged.name_any(),
            "nothing changed"
        );
    }
    Ok(())
}

/// Copy the merged load-balancer status onto every contributor whose status
/// differs. Failures here are logged per origin and swallowed; the next event
/// retries, and one broken origin must not starve its siblings.
async fn reflect_status(ctx: &Context, bucket: &Bucket, merged: &Ingress) -> bool {
    let mut changed = false;
    for origin in &bucket.ingresses {
        if load_balancer_entries(origin) == load_balancer_entries(merged) {
            continue;
        }

        let mut updated = origin.clone();
        updated.status = merged.status.clone();
        changed = true;

        let namespace = updated.namespace().unwrap_or_default();
        match ctx.store.update_ingress_status(&updated).await {
            Ok(()) => info!(
                %namespace,
                from_ingress = %merged.name_any(),
                to_ingress = %updated.name_any(),
                "propagated load balancer status back to origin"
            ),
            Err(err) => error!(
                %namespace,
                ingress = %updated.name_any(),
                error = %err,
                "could not update status of origin ingress"
            ),
        }
    }
    changed
}

/// Decide whether the live merged ingress diverges from the desired one.
///
/// The annotation comparison is deliberately one-sided: keys present only on
/// the live object belong to third parties (cert managers and the like) and
/// must not cause churn; only drift on keys we desire counts.
fn has_changed(live: &Ingress, desired: &Ingress) -> bool {
    if desired.metadata.namespace != live.metadata.namespace
        || desired.metadata.name != live.metadata.name
    {
        return true;
    }
    if desired.metadata.labels != live.metadata.labels {
        return true;
    }

    for (key, value) in desired.metadata.annotations.iter().flatten() {
        if live
            .metadata
            .annotations
            .as_ref()
            .and_then(|annotations| annotations.get(key))
            != Some(value)
        {
            info!(
                annotation = %key,
                namespace = %live.namespace().unwrap_or_default(),
                ingress = %live.name_any(),
                "change of annotation will trigger an update"
            );
            return true;
        }
    }

    if desired.metadata.owner_references != live.metadata.owner_references {
        return true;
    }
    desired.spec != live.spec
}

fn is_merge_result(ingress: &Ingress) -> bool {
    ingress.annotations().get(RESULT_ANNOTATION).map(String::as_str) == Some("true")
}

/// Effective class of an ingress: `spec.ingressClassName` when set, the
/// legacy class annotation otherwise.
fn effective_ingress_class(ingress: &Ingress) -> &str {
    ingress
        .spec
        .as_ref()
        .and_then(|spec| spec.ingress_class_name.as_deref())
        .filter(|class| !class.is_empty())
        .or_else(|| {
            ingress
                .annotations()
                .get(INGRESS_CLASS_ANNOTATION)
                .map(String::as_str)
        })
        .unwrap_or("")
}

fn has_ignore_annotation(annotations: &BTreeMap<String, String>, ignore: &[String]) -> bool {
    ignore.iter().any(|key| annotations.contains_key(key))
}

fn priority_of(ingress: &Ingress) -> i64 {
    ingress
        .annotations()
        .get(PRIORITY_ANNOTATION)
        .and_then(|priority| priority.parse().ok())
        .unwrap_or(0)
}

/// Load-balancer endpoints of an ingress, treating absent and empty status
/// blocks the same so freshly created objects do not churn status updates.
fn load_balancer_entries(ingress: &Ingress) -> &[IngressLoadBalancerIngress] {
    ingress
        .status
        .as_ref()
        .and_then(|status| status.load_balancer.as_ref())
        .and_then(|lb| lb.ingress.as_deref())
        .unwrap_or(&[])
}

const SUFFIX_ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
const SUFFIX_LEN: usize = 7;

/// Short random name suffix. `random_range` samples uniformly, so the suffix
/// is unbiased and create collisions stay negligibly rare; a collision simply
/// surfaces the apiserver error and the next reconcile retries.
fn random_suffix() -> String {
    let mut rng = rand::rng();
    (0..SUFFIX_LEN)
        .map(|_| SUFFIX_ALPHABET[rng.random_range(0..SUFFIX_ALPHABET.len())] as char)
        .collect()
}
