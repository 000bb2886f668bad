//! Node lookups against the cluster API.
//!
//! The trait exists so the decision engine can be exercised without a
//! cluster: the bootstrap flow needs "does this node exist yet", the kubelet
//! probe needs the node's InternalIP and kubelet port.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Node;
use kube::{Api, Client, ResourceExt};

#[cfg(test)]
use mockall::automock;

use crate::machines::address_types;
use crate::{Error, Result};

/// Point lookups of Node objects.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait NodeLookup: Send + Sync {
    /// Fetch a node by name. `Ok(None)` means the node definitively does
    /// not exist; any API failure is an error so the caller can requeue.
    async fn get_node(&self, name: &str) -> Result<Option<Node>>;
}

/// Node lookup backed by the cluster API.
pub struct KubeNodeLookup {
    client: Client,
}

impl KubeNodeLookup {
    /// Create a new lookup with the given client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl NodeLookup for KubeNodeLookup {
    async fn get_node(&self, name: &str) -> Result<Option<Node>> {
        let api: Api<Node> = Api::all(self.client.clone());
        Ok(api.get_opt(name).await?)
    }
}

/// First InternalIP address advertised by the node.
pub fn node_internal_ip(node: &Node) -> Result<&str> {
    node.status
        .as_ref()
        .and_then(|status| status.addresses.as_ref())
        .and_then(|addresses| {
            addresses
                .iter()
                .find(|addr| addr.type_ == address_types::INTERNAL_IP)
        })
        .map(|addr| addr.address.as_str())
        .ok_or_else(|| {
            Error::transient(format!(
                "node {} has no internal addresses",
                node.name_any()
            ))
        })
}

/// Port the node's kubelet serves HTTPS on.
pub fn kubelet_port(node: &Node) -> Result<u16> {
    let port = node
        .status
        .as_ref()
        .and_then(|status| status.daemon_endpoints.as_ref())
        .and_then(|endpoints| endpoints.kubelet_endpoint.as_ref())
        .map(|endpoint| endpoint.port)
        .unwrap_or_default();

    u16::try_from(port)
        .ok()
        .filter(|p| *p != 0)
        .ok_or_else(|| {
            Error::transient(format!(
                "node {} advertises no kubelet port",
                node.name_any()
            ))
        })
}
