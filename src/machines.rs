//! Machine custom resource and snapshot lookups.
//!
//! Machines are produced by the external machine-lifecycle controller. The
//! approver only reads them: the creation timestamp bounds the bootstrap
//! window, the addresses anchor SAN validation, and the node ref marks a
//! machine that has already joined.

use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Address types as they appear in Machine and Node status.
///
/// These mirror the core/v1 `NodeAddressType` strings; the API models the
/// type as a free-form string, so we do too.
pub mod address_types {
    /// Resolvable hostname
    pub const HOSTNAME: &str = "Hostname";
    /// IP reachable from outside the cluster network
    pub const EXTERNAL_IP: &str = "ExternalIP";
    /// IP on the cluster network
    pub const INTERNAL_IP: &str = "InternalIP";
    /// DNS name resolvable from outside the cluster network
    pub const EXTERNAL_DNS: &str = "ExternalDNS";
    /// DNS name on the cluster network
    pub const INTERNAL_DNS: &str = "InternalDNS";
}

/// Specification for a Machine
///
/// The machine controller owns the full provider spec; the approver never
/// reads it, so only the identifying field is modeled.
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "machine.openshift.io",
    version = "v1beta1",
    kind = "Machine",
    plural = "machines",
    status = "MachineStatus",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct MachineSpec {
    /// Provider-assigned instance identifier, once known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_id: Option<String>,
}

/// Status for a Machine
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MachineStatus {
    /// Reference to the Node this machine became, set after it joined
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_ref: Option<NodeReference>,

    /// Addresses advertised for the machine
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub addresses: Vec<MachineAddress>,

    /// Lifecycle phase reported by the machine controller
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,
}

/// Back-pointer from a Machine to the Node it became
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NodeReference {
    /// Name of the referenced Node
    #[serde(default)]
    pub name: String,
}

/// A single `{type, value}` address entry on a Machine
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MachineAddress {
    /// Address type, one of the [`address_types`] strings
    #[serde(rename = "type")]
    pub type_: String,

    /// The address value
    pub address: String,
}

impl Machine {
    /// Creation timestamp from the object metadata, if the API set one
    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        self.metadata.creation_timestamp.as_ref().map(|t| t.0)
    }

    /// Whether this machine already points at a joined Node
    pub fn has_node_ref(&self) -> bool {
        self.status
            .as_ref()
            .is_some_and(|status| status.node_ref.is_some())
    }
}

/// First machine whose node ref names the given node.
///
/// Ties are broken by iteration order of the snapshot; callers must not
/// depend on determinism across snapshots.
pub fn find_machine_by_node_ref<'a>(node_name: &str, machines: &'a [Machine]) -> Option<&'a Machine> {
    machines.iter().find(|machine| {
        machine
            .status
            .as_ref()
            .and_then(|status| status.node_ref.as_ref())
            .is_some_and(|node_ref| node_ref.name == node_name)
    })
}

/// First machine advertising the given name as an InternalDNS address.
pub fn find_machine_by_internal_dns<'a>(
    node_name: &str,
    machines: &'a [Machine],
) -> Option<&'a Machine> {
    machines.iter().find(|machine| {
        machine
            .status
            .as_ref()
            .map(|status| status.addresses.as_slice())
            .unwrap_or_default()
            .iter()
            .any(|addr| addr.type_ == address_types::INTERNAL_DNS && addr.address == node_name)
    })
}
