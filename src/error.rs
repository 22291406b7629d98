//! Error types for the load balancer operator
//!
//! Provides structured error types for spec validation, ownership checks,
//! cloud API calls and resource discovery, together with the requeue policy
//! the controller runtime applies to each of them.

use std::time::Duration;
use thiserror::Error;

/// Unified error type for the operator
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Internal Errors
    // =========================================================================
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    // =========================================================================
    // Kubernetes Errors
    // =========================================================================
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("Resource not found: {kind}/{name}")]
    ResourceNotFound { kind: String, name: String },

    #[error("Resource already exists: {kind}/{name}")]
    ResourceExists { kind: String, name: String },

    // =========================================================================
    // Service Validation Errors
    // =========================================================================
    #[error("Invalid service: {0}")]
    InvalidService(String),

    #[error("Invalid annotation {key}: {reason}")]
    InvalidAnnotation { key: String, reason: String },

    #[error("Invalid load balancer name {name}: {reason}")]
    InvalidName { name: String, reason: String },

    // =========================================================================
    // Ownership Errors
    // =========================================================================
    #[error("{name} belongs to another cluster ({cluster})")]
    BelongsToAnotherCluster { name: String, cluster: String },

    #[error("{name} belongs to another service ({service})")]
    BelongsToAnotherService { name: String, service: String },

    // =========================================================================
    // Cloud API Errors
    // =========================================================================
    #[error("Cloud API error: {operation}: {reason}")]
    CloudApi { operation: String, reason: String },

    #[error("Public IP pool {pool} has no free address")]
    PoolExhausted { pool: String },

    // =========================================================================
    // Discovery Errors
    // =========================================================================
    #[error("No usable subnet: {0}")]
    NoSubnet(String),

    #[error("No usable security group: {0}")]
    NoSecurityGroup(String),

    #[error("Name resolution failed for {host}: {reason}")]
    NameResolution { host: String, reason: String },

    // =========================================================================
    // Parse Errors
    // =========================================================================
    #[error("JSON parse error: {0}")]
    JsonParse(#[from] serde_json::Error),

    // =========================================================================
    // IO Errors
    // =========================================================================
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Action to take on error during reconciliation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorAction {
    /// Requeue with exponential backoff
    RequeueWithBackoff,
    /// Requeue after specific duration
    RequeueAfter(Duration),
    /// Don't requeue, wait for changes
    NoRequeue,
}

impl Error {
    /// Shorthand for a failed cloud call
    pub fn cloud(operation: impl Into<String>, reason: impl ToString) -> Self {
        Error::CloudApi {
            operation: operation.into(),
            reason: reason.to_string(),
        }
    }

    /// Determine what action to take for this error
    pub fn action(&self) -> ErrorAction {
        match self {
            // Transient errors - retry with backoff
            Error::Kube(_) | Error::CloudApi { .. } | Error::NameResolution { .. } => {
                ErrorAction::RequeueWithBackoff
            }

            // Scarce resources may free up
            Error::PoolExhausted { .. } => ErrorAction::RequeueAfter(Duration::from_secs(60)),

            // Fix requires a change to the Service or the cloud layout
            Error::Configuration(_)
            | Error::InvalidService(_)
            | Error::InvalidAnnotation { .. }
            | Error::InvalidName { .. }
            | Error::BelongsToAnotherCluster { .. }
            | Error::BelongsToAnotherService { .. }
            | Error::NoSubnet(_)
            | Error::NoSecurityGroup(_) => ErrorAction::NoRequeue,

            // All other errors - retry with backoff
            _ => ErrorAction::RequeueWithBackoff,
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        !matches!(self.action(), ErrorAction::NoRequeue)
    }

    /// Check if this error is a name collision with another cluster or service
    pub fn is_ownership_conflict(&self) -> bool {
        matches!(
            self,
            Error::BelongsToAnotherCluster { .. } | Error::BelongsToAnotherService { .. }
        )
    }

    /// Check if this error reports a resource that already exists
    pub fn is_already_exists(&self) -> bool {
        matches!(self, Error::ResourceExists { .. })
    }
}

/// Result type alias for the operator
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_actions() {
        let err = Error::PoolExhausted {
            pool: "pool-a".into(),
        };
        assert_eq!(
            err.action(),
            ErrorAction::RequeueAfter(Duration::from_secs(60))
        );

        let err = Error::InvalidService("session affinity".into());
        assert_eq!(err.action(), ErrorAction::NoRequeue);

        let err = Error::cloud("ReadLoadBalancers", "timeout");
        assert_eq!(err.action(), ErrorAction::RequeueWithBackoff);
    }

    #[test]
    fn test_error_retryable() {
        let transient = Error::cloud("CreateListeners", "503");
        assert!(transient.is_retryable());
        assert!(!transient.is_ownership_conflict());

        let conflict = Error::BelongsToAnotherCluster {
            name: "lb-1".into(),
            cluster: "other".into(),
        };
        assert!(!conflict.is_retryable());
        assert!(conflict.is_ownership_conflict());

        let fatal = Error::NoSubnet("none tagged".into());
        assert!(!fatal.is_retryable());
    }
}
