//! Machine Approver - automated approval of node certificate signing requests
//!
//! Cluster nodes submit CSRs to join the cluster (client-bootstrap flow) and
//! to renew the serving certificate their kubelet presents (serving flow).
//! This crate decides, per CSR, whether to approve, decline, or defer to a
//! later reconciliation pass, by correlating the request against the Machine
//! and Node objects the cluster already knows about.
//!
//! # Architecture
//!
//! The decision engine is a pure function over snapshots: a CSR plus its
//! parsed PKCS#10 request, the current Machine list, point Node lookups, and
//! an optional kubelet CA bundle. Machines and Nodes arrive on independent
//! watches and are never assumed to be mutually consistent; when they are
//! not, the engine returns a transient error so the controller requeues the
//! CSR instead of denying it.
//!
//! # Modules
//!
//! - [`authorize`] - Decision engine: bootstrap, serving, and renewal flows
//! - [`clock`] - Injectable wall-clock source
//! - [`config`] - Approver configuration and the kubelet CA bundle
//! - [`controller`] - Kubernetes controller reconciliation logic
//! - [`csr`] - PKCS#10 parsing and CSR shape classification
//! - [`error`] - Error taxonomy for the approver
//! - [`kubelet`] - TLS probe for a node's currently served certificate
//! - [`machines`] - Machine custom resource and snapshot lookups
//! - [`nodes`] - Node lookups against the cluster API
//! - [`sans`] - Order-insensitive SAN set comparison
//! - [`throttle`] - Pending-CSR backlog accounting

#![deny(missing_docs)]

pub mod authorize;
pub mod clock;
pub mod config;
pub mod controller;
pub mod csr;
pub mod error;
pub mod kubelet;
pub mod machines;
pub mod nodes;
pub mod sans;
pub mod throttle;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

use std::time::Duration;

// =============================================================================
// Protocol Constants
// =============================================================================
// Identities, groups, and windows are fixed by the cluster's bootstrap
// contract. Centralizing them here keeps the classifier, the authorizers,
// and the test fixtures in agreement.

/// Username prefix shared by all node identities (`system:node:<name>`)
pub const NODE_USER_PREFIX: &str = "system:node:";

/// Group carried by every node identity
pub const NODE_GROUP: &str = "system:nodes";

/// Group carried by every authenticated identity
pub const AUTHENTICATED_GROUP: &str = "system:authenticated";

/// Service account that submits a new node's first client-auth CSR
pub const NODE_BOOTSTRAPPER_USERNAME: &str =
    "system:serviceaccount:openshift-machine-config-operator:node-bootstrapper";

/// Exact group set presented by the node bootstrapper service account
pub const NODE_BOOTSTRAPPER_GROUPS: [&str; 3] = [
    "system:serviceaccounts:openshift-machine-config-operator",
    "system:serviceaccounts",
    "system:authenticated",
];

/// Tolerated clock skew between the API server and this process
pub const MAX_CLOCK_SKEW: Duration = Duration::from_secs(10);

/// Maximum age of a bootstrap CSR relative to its Machine's creation
pub const MAX_BOOTSTRAP_WINDOW: Duration = Duration::from_secs(2 * 60 * 60);

/// Pending CSRs older than this are ignored by the backlog throttle
pub const MAX_PENDING_CSR_AGE: Duration = Duration::from_secs(60 * 60);

/// Default allowance of pending CSRs above the Machine count
pub const DEFAULT_MAX_PENDING_DELTA: u32 = 100;

/// Connect timeout for the kubelet serving-certificate probe
pub const KUBELET_DIAL_TIMEOUT: Duration = Duration::from_secs(30);
