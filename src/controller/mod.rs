//! Kubernetes controller reconciliation logic
//!
//! The controller follows the observe-diff-act loop: every ingress event fans
//! out to a whole-namespace reconcile, because the consolidation is a function
//! of the entire set of origins, not of the one object that changed.

mod ingress;

pub use ingress::{error_policy, reconcile, ClusterStore, Context, KubeStore};
