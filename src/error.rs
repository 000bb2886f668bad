//! Error types for the machine approver

use thiserror::Error;

/// Main error type for approver operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// CSR does not match any recognized shape or fails structural validation
    #[error("malformed request: {0}")]
    Malformed(String),

    /// Shape matches but policy rejects the request
    #[error("policy denied: {0}")]
    PolicyDeny(String),

    /// The node client-bootstrap flow is administratively disabled
    #[error("client cert flow disabled: {0}")]
    FlowDisabled(String),

    /// The cluster state is not yet consistent enough to decide
    #[error("transient error: {0}")]
    Transient(String),

    /// The pending-CSR backlog exceeds the configured ceiling
    #[error("backlog throttled: {0}")]
    Throttled(String),
}

/// How the controller should treat a failed decision
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Disposition {
    /// Leave the CSR alone; it will never be approved by us
    Deny,
    /// Requeue the CSR for a later pass with fresh snapshots
    Requeue,
    /// Requeue, but on the long backlog cadence
    Backoff,
}

impl Error {
    /// Create a malformed-request error with the given message
    pub fn malformed(msg: impl Into<String>) -> Self {
        Self::Malformed(msg.into())
    }

    /// Create a policy-denial error with the given message
    pub fn policy_deny(msg: impl Into<String>) -> Self {
        Self::PolicyDeny(msg.into())
    }

    /// Create a flow-disabled error with the given message
    pub fn flow_disabled(msg: impl Into<String>) -> Self {
        Self::FlowDisabled(msg.into())
    }

    /// Create a transient error with the given message
    pub fn transient(msg: impl Into<String>) -> Self {
        Self::Transient(msg.into())
    }

    /// Create a throttled error with the given message
    pub fn throttled(msg: impl Into<String>) -> Self {
        Self::Throttled(msg.into())
    }

    /// Map the error to its requeue behavior.
    ///
    /// Errors that mean "the world is not yet consistent" requeue; errors
    /// that mean "we permanently refuse this CSR" do not. This distinction
    /// is what keeps an out-of-date Machine snapshot from turning into a
    /// denied node.
    pub fn disposition(&self) -> Disposition {
        match self {
            Error::Kube(_) | Error::Transient(_) => Disposition::Requeue,
            Error::Throttled(_) => Disposition::Backoff,
            Error::Malformed(_) | Error::PolicyDeny(_) | Error::FlowDisabled(_) => {
                Disposition::Deny
            }
        }
    }
}
