//! Error taxonomy for the indexing engine
//!
//! Every fallible API returns `anyhow::Result`; the variants below are the
//! classified failures the synchronization controller inspects (via
//! `downcast_ref`) to decide whether an artifact, a repository or the whole
//! cycle is affected.

use thiserror::Error;

/// Classified indexing failures.
#[derive(Debug, Error)]
pub enum IndexError {
    /// One artifact failed to produce an element tree.
    #[error("failed to parse artifact {path}: {reason}")]
    ParseFailure { path: String, reason: String },

    /// Revision or delta fetch failed for a repository.
    #[error("repository {location} is unreachable: {reason}")]
    RepositoryUnreachable { location: String, reason: String },

    /// The graph is not in the shape the engine expects (edges left on a
    /// node being deleted, missing type node, ...).
    #[error("storage inconsistency: {0}")]
    StorageInconsistency(String),

    /// The artifact uses a metamodel that has not been registered.
    #[error("metamodel {uri} is not registered")]
    MetamodelNotRegistered { uri: String },

    /// A derived attribute could not be evaluated.
    #[error("evaluation of derived attribute {attribute} failed: {reason}")]
    Evaluator { attribute: String, reason: String },

    /// Backend-level transaction failure.
    #[error("transaction error: {0}")]
    Transaction(String),

    /// A change listener refused a mutation.
    #[error("listener {listener} aborted the change: {reason}")]
    Listener { listener: String, reason: String },
}

impl IndexError {
    /// Whether this failure should keep the artifact out of the graph until
    /// the operator registers something, rather than being retried each cycle.
    pub fn is_fatal_for_artifact(&self) -> bool {
        matches!(self, IndexError::MetamodelNotRegistered { .. })
    }
}

/// Find the first classified [`IndexError`] in an error chain.
pub fn classify(err: &anyhow::Error) -> Option<&IndexError> {
    err.chain().find_map(|cause| cause.downcast_ref::<IndexError>())
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn test_classify_finds_wrapped_error() {
        let err: anyhow::Result<()> = Err(IndexError::MetamodelNotRegistered {
            uri: "urn:test".into(),
        })
        .context("while updating models/a.model.json");

        let err = err.unwrap_err();
        let classified = classify(&err).expect("classified error");
        assert!(classified.is_fatal_for_artifact());
        assert!(err.to_string().contains("while updating"));
    }

    #[test]
    fn test_classify_plain_error() {
        let err = anyhow::anyhow!("boom");
        assert!(classify(&err).is_none());
    }

    #[test]
    fn test_storage_inconsistency_is_not_fatal() {
        let err = IndexError::StorageInconsistency("edges remain".into());
        assert!(!err.is_fatal_for_artifact());
        assert_eq!(err.to_string(), "storage inconsistency: edges remain");
    }
}
