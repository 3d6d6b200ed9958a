//! Desired-state construction for merged ingresses
//!
//! Turns one bucket plus its ConfigMap into the merged ingress the cluster
//! should converge onto. The ConfigMap is decoded leniently: unparsable YAML
//! fragments are logged and replaced with empty values so one bad key cannot
//! wedge the whole namespace.

use std::collections::{BTreeMap, BTreeSet};

use k8s_openapi::api::core::v1::ConfigMap;
use k8s_openapi::api::networking::v1::{
    Ingress, IngressBackend, IngressRule, IngressSpec, IngressTLS,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use k8s_openapi::Resource as _;
use kube::ResourceExt;
use serde::de::DeserializeOwned;
use tracing::error;

use crate::bucket::Bucket;
use crate::config::Selector;
use crate::{
    ANNOTATIONS_CONFIG_KEY, BACKEND_CONFIG_KEY, FROM_CONFIG_ANNOTATION,
    INGRESS_CLASS_ANNOTATION, INGRESS_CLASS_NAME_CONFIG_KEY, LABELS_CONFIG_KEY,
    RESULT_ANNOTATION, USE_WILDCARD_TLS_KEY, WILDCARD_TLS_IGNORE_KEY, WILDCARD_TLS_SUFFIX,
};

/// Decoded form of the ConfigMap that drives one merge group
#[derive(Debug, Clone, Default)]
pub struct MergeConfig {
    /// Name of the ConfigMap; also the prefix of merged ingress names
    pub name: String,
    /// Namespace the merged ingresses are created in
    pub namespace: String,
    /// Labels to place on the merged ingress
    pub labels: Option<BTreeMap<String, String>>,
    /// User-supplied annotations for the merged ingress
    pub annotations: BTreeMap<String, String>,
    /// Default backend for the merged ingress
    pub backend: Option<IngressBackend>,
    /// `spec.ingressClassName` for the merged ingress
    pub ingress_class_name: Option<String>,
    /// Replace per-origin TLS with a single wildcard entry
    pub use_wildcard_tls: bool,
    /// Origins matching this selector do not contribute wildcard hosts
    pub wildcard_tls_ignore: Option<Selector>,
}

impl MergeConfig {
    /// Decode a ConfigMap. Malformed YAML fragments and selectors are logged
    /// against the ConfigMap and replaced with empty values.
    pub fn from_config_map(config_map: &ConfigMap) -> Self {
        let name = config_map.name_any();
        let namespace = config_map.namespace().unwrap_or_default();
        let empty = BTreeMap::new();
        let data = config_map.data.as_ref().unwrap_or(&empty);

        let labels = decode_fragment(data, LABELS_CONFIG_KEY, &namespace, &name);
        let annotations: Option<BTreeMap<String, String>> =
            decode_fragment(data, ANNOTATIONS_CONFIG_KEY, &namespace, &name);
        let backend = decode_fragment(data, BACKEND_CONFIG_KEY, &namespace, &name);

        let ingress_class_name = data
            .get(INGRESS_CLASS_NAME_CONFIG_KEY)
            .filter(|value| !value.is_empty())
            .cloned();

        let use_wildcard_tls =
            data.get(USE_WILDCARD_TLS_KEY).map(String::as_str) == Some("true");

        let wildcard_tls_ignore = data
            .get(WILDCARD_TLS_IGNORE_KEY)
            .and_then(|raw| match Selector::parse(raw) {
                Ok(selector) if !selector.is_empty() => Some(selector),
                Ok(_) => None,
                Err(err) => {
                    error!(
                        %namespace,
                        configmap = %name,
                        key = WILDCARD_TLS_IGNORE_KEY,
                        error = %err,
                        "could not parse selector from config, ignoring it"
                    );
                    None
                }
            });

        Self {
            name,
            namespace,
            labels,
            annotations: annotations.unwrap_or_default(),
            backend,
            ingress_class_name,
            use_wildcard_tls,
            wildcard_tls_ignore,
        }
    }
}

fn decode_fragment<T: DeserializeOwned>(
    data: &BTreeMap<String, String>,
    key: &str,
    namespace: &str,
    name: &str,
) -> Option<T> {
    let raw = data.get(key)?;
    match serde_yaml::from_str(raw) {
        Ok(value) => Some(value),
        Err(err) => {
            error!(
                %namespace,
                configmap = %name,
                key,
                error = %err,
                "could not decode fragment from config, substituting empty value"
            );
            None
        }
    }
}

/// Build the merged ingress a bucket should converge onto.
///
/// Returns `None` when the config would stamp the merged ingress with the
/// controller's own ingress class; merging the result of a merge would loop
/// forever, so the whole group is refused.
///
/// For a bucket without an existing destination the returned object carries no
/// name; the apply step generates one and, in wildcard mode, fixes the TLS
/// secret name to match.
pub fn build_merged_ingress(
    bucket: &Bucket,
    config: &MergeConfig,
    watched_class: &str,
) -> Option<Ingress> {
    let user_class = config.annotations.get(INGRESS_CLASS_ANNOTATION);
    if user_class.is_some_and(|class| class == watched_class)
        || config.ingress_class_name.as_deref() == Some(watched_class)
    {
        error!(
            namespace = %config.namespace,
            configmap = %config.name,
            ingress_class = watched_class,
            "merged ingress would carry the watched ingress class, refusing to merge"
        );
        return None;
    }

    let mut owner_references: Vec<OwnerReference> = Vec::new();
    let mut rules: Vec<IngressRule> = Vec::new();
    let mut tls: Vec<IngressTLS> = Vec::new();
    let mut wildcard_hosts: BTreeSet<String> = BTreeSet::new();

    for origin in &bucket.ingresses {
        owner_references.push(OwnerReference {
            api_version: Ingress::API_VERSION.to_string(),
            kind: Ingress::KIND.to_string(),
            name: origin.metadata.name.clone().unwrap_or_default(),
            uid: origin.metadata.uid.clone().unwrap_or_default(),
            ..OwnerReference::default()
        });

        let spec = origin.spec.as_ref();
        let origin_rules = spec.and_then(|spec| spec.rules.as_deref()).unwrap_or(&[]);

        if config.use_wildcard_tls {
            let ignored = config
                .wildcard_tls_ignore
                .as_ref()
                .is_some_and(|selector| selector.matches(origin.labels()));
            if !ignored {
                collect_wildcard_hosts(&mut wildcard_hosts, origin_rules);
            }
        } else if let Some(origin_tls) = spec.and_then(|spec| spec.tls.as_ref()) {
            tls.extend(origin_tls.iter().cloned());
        }

        for rule in origin_rules {
            merge_rule(&mut rules, rule);
        }
    }

    if config.use_wildcard_tls {
        tls.push(IngressTLS {
            hosts: (!wildcard_hosts.is_empty())
                .then(|| wildcard_hosts.into_iter().collect()),
            secret_name: bucket
                .destination
                .as_ref()
                .and_then(|destination| destination.metadata.name.as_ref())
                .map(|name| format!("{name}{WILDCARD_TLS_SUFFIX}")),
        });
    }

    let mut annotations = config.annotations.clone();
    annotations.insert(RESULT_ANNOTATION.to_string(), "true".to_string());
    annotations.insert(FROM_CONFIG_ANNOTATION.to_string(), config.name.clone());

    Some(Ingress {
        metadata: ObjectMeta {
            namespace: Some(config.namespace.clone()),
            name: bucket
                .destination
                .as_ref()
                .and_then(|destination| destination.metadata.name.clone()),
            labels: config.labels.clone(),
            annotations: Some(annotations),
            owner_references: Some(owner_references),
            ..ObjectMeta::default()
        },
        spec: Some(IngressSpec {
            ingress_class_name: config.ingress_class_name.clone(),
            default_backend: config.backend.clone(),
            tls: (!tls.is_empty()).then_some(tls),
            rules: (!rules.is_empty()).then_some(rules),
        }),
        status: None,
    })
}

/// Append a rule, concatenating paths onto an existing rule for the same
/// host. Duplicate paths are kept; the load balancer decides how overlaps
/// behave.
fn merge_rule(rules: &mut Vec<IngressRule>, rule: &IngressRule) {
    if let Some(existing) = rules.iter_mut().find(|existing| existing.host == rule.host) {
        let paths = rule
            .http
            .as_ref()
            .map(|http| http.paths.clone())
            .unwrap_or_default();
        match existing.http.as_mut() {
            Some(http) => http.paths.extend(paths),
            None => existing.http = rule.http.clone(),
        }
        return;
    }
    rules.push(rule.clone());
}

/// Strip the leftmost label of every rule host and collect the resulting
/// `*.<suffix>` domains. Hosts without a dot cannot be wildcarded.
fn collect_wildcard_hosts(hosts: &mut BTreeSet<String>, rules: &[IngressRule]) {
    for rule in rules {
        let Some(host) = rule.host.as_deref() else { continue };
        if let Some((_, suffix)) = host.split_once('.') {
            if !suffix.is_empty() {
                hosts.insert(format!("*.{suffix}"));
            }
        }
    }
}
