//! Merge ingress controller
//!
//! Some edge load balancers cap the number of rules or services one Ingress
//! may carry, or bill per Ingress object. Applications that publish many
//! hostnames through such a load balancer have to co-locate their routing
//! rules in a handful of shared objects. This controller performs that
//! consolidation automatically: origin ingresses opt in through annotations,
//! a per-namespace ConfigMap describes the shared object to produce, and the
//! controller packs origins into capacity-bounded merged ingresses while
//! reflecting load-balancer status back onto every contributor.
//!
//! # Modules
//!
//! - [`bucket`] - Slot accounting and capacity-bounded bucket planning
//! - [`merge`] - Desired-state construction for merged ingresses
//! - [`controller`] - Kubernetes controller reconciliation logic
//! - [`config`] - Operator settings and label selector matching
//! - [`error`] - Error types for the controller

#![deny(missing_docs)]

pub mod bucket;
pub mod config;
pub mod controller;
pub mod error;
pub mod merge;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Annotation vocabulary
// =============================================================================
// The externally observable contract: origins opt in and pick a config through
// these annotations, merged ingresses are marked with them.

/// Annotation carrying the ingress class when `spec.ingressClassName` is unset
pub const INGRESS_CLASS_ANNOTATION: &str = "kubernetes.io/ingress.class";

/// Annotation on an origin naming the ConfigMap to merge into
pub const CONFIG_ANNOTATION: &str = "merge.ingress.kubernetes.io/config";

/// Annotation on an origin holding its integer merge priority
pub const PRIORITY_ANNOTATION: &str = "merge.ingress.kubernetes.io/priority";

/// Annotation marking a merged ingress produced by this controller
pub const RESULT_ANNOTATION: &str = "merge.ingress.kubernetes.io/result";

/// Annotation on a merged ingress recording the ConfigMap that produced it
pub const FROM_CONFIG_ANNOTATION: &str = "merge.ingress.kubernetes.io/from-config";

// =============================================================================
// ConfigMap data keys
// =============================================================================

/// ConfigMap key holding a YAML mapping of labels for the merged ingress
pub const LABELS_CONFIG_KEY: &str = "labels";

/// ConfigMap key holding a YAML mapping of annotations for the merged ingress
pub const ANNOTATIONS_CONFIG_KEY: &str = "annotations";

/// ConfigMap key holding a YAML default-backend spec for the merged ingress
pub const BACKEND_CONFIG_KEY: &str = "backend";

/// ConfigMap key holding the `spec.ingressClassName` of the merged ingress
pub const INGRESS_CLASS_NAME_CONFIG_KEY: &str = "ingressClassName";

/// ConfigMap key enabling wildcard TLS (`"true"` to enable)
pub const USE_WILDCARD_TLS_KEY: &str = "use-wildcard-tls";

/// ConfigMap key holding a label selector of origins excluded from wildcard TLS
pub const WILDCARD_TLS_IGNORE_KEY: &str = "use-wildcard-tls-ignore";

/// Suffix appended to the merged ingress name to form the wildcard TLS secret name
pub const WILDCARD_TLS_SUFFIX: &str = "-wildcard-tls";

// =============================================================================
// Default configuration constants
// =============================================================================

/// Ingress class consumed by the controller unless configured otherwise
pub const DEFAULT_INGRESS_CLASS: &str = "merge";

/// Default slot budget per merged ingress
pub const DEFAULT_MAX_SLOTS: i64 = 45;
