//! Error types for the merge ingress controller

use thiserror::Error;

/// Main error type for controller operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// A merged ingress referenced by a bucket disappeared mid-reconcile
    #[error("merged ingress {namespace}/{name} is gone")]
    MissingDestination {
        /// Namespace of the vanished merged ingress
        namespace: String,
        /// Name of the vanished merged ingress
        name: String,
    },

    /// A label selector string could not be parsed
    #[error("invalid label selector {selector:?}: {reason}")]
    Selector {
        /// The selector string as supplied
        selector: String,
        /// Why it did not parse
        reason: String,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Several bucket reconciles failed within one namespace pass
    #[error("{}", join_errors(.0))]
    Aggregate(Vec<Error>),
}

fn join_errors(errors: &[Error]) -> String {
    errors
        .iter()
        .map(Error::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl Error {
    /// Fold a list of failures into one error, flattening the one-element case.
    /// Returns `None` when the list is empty.
    pub fn aggregate(mut errors: Vec<Error>) -> Option<Error> {
        match errors.len() {
            0 => None,
            1 => Some(errors.remove(0)),
            _ => Some(Error::Aggregate(errors)),
        }
    }

    /// True when the apiserver rejected an update because the base
    /// `resourceVersion` was stale.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Kube(kube::Error::Api(response)) if response.code == 409)
    }
}
