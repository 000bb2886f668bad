//! TLS probe for a node's currently served certificate.
//!
//! The probe dials the kubelet endpoint advertised on the Node object,
//! verifies the presented chain against the configured CA bundle, and hands
//! back the leaf certificate. The probe is strictly opportunistic: every
//! failure mode is reported to the caller, which falls back to machine-api
//! correlation instead of denying the CSR.

use std::sync::Arc;

use async_trait::async_trait;
use rustls::pki_types::{CertificateDer, ServerName};
use rustls::ClientConfig;
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tokio_util::sync::CancellationToken;
use tracing::info;

#[cfg(test)]
use mockall::automock;

use crate::config::CaBundle;
use crate::nodes::{kubelet_port, node_internal_ip, NodeLookup};
use crate::{Error, Result, KUBELET_DIAL_TIMEOUT};

/// Source of the certificate a node is currently serving.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ServingCertSource: Send + Sync {
    /// Retrieve the leaf certificate presented by the named node's kubelet,
    /// verified against the given CA bundle.
    async fn serving_cert(
        &self,
        node_name: &str,
        ca: &CaBundle,
        shutdown: &CancellationToken,
    ) -> Result<CertificateDer<'static>>;
}

/// Probe that dials the kubelet over TLS.
pub struct KubeletProbe<N> {
    nodes: N,
}

impl<N: NodeLookup> KubeletProbe<N> {
    /// Create a probe resolving nodes through the given lookup
    pub fn new(nodes: N) -> Self {
        Self { nodes }
    }
}

#[async_trait]
impl<N: NodeLookup> ServingCertSource for KubeletProbe<N> {
    async fn serving_cert(
        &self,
        node_name: &str,
        ca: &CaBundle,
        shutdown: &CancellationToken,
    ) -> Result<CertificateDer<'static>> {
        let node = tokio::select! {
            _ = shutdown.cancelled() => {
                return Err(Error::transient(format!(
                    "lookup of node {node_name} aborted by shutdown"
                )));
            }
            node = self.nodes.get_node(node_name) => node?,
        };
        let node =
            node.ok_or_else(|| Error::transient(format!("node {node_name} not found")))?;

        let host = node_internal_ip(&node)?.to_string();
        let port = kubelet_port(&node)?;
        let endpoint = format!("{host}:{port}");

        // The kubelet serves on its InternalIP, so the IP is also the
        // expected server name.
        let server_name = ServerName::try_from(host.clone())
            .map_err(|e| Error::transient(format!("invalid server name {host}: {e}")))?;

        let tls = ClientConfig::builder()
            .with_root_certificates(ca.root_store()?)
            .with_no_client_auth();
        let connector = TlsConnector::from(Arc::new(tls));

        info!(node = %node_name, endpoint = %endpoint, "retrieving serving cert");

        let handshake = async {
            let tcp = TcpStream::connect(&endpoint)
                .await
                .map_err(|e| Error::transient(format!("dial {endpoint}: {e}")))?;
            connector
                .connect(server_name, tcp)
                .await
                .map_err(|e| Error::transient(format!("TLS handshake with {endpoint}: {e}")))
        };

        let stream = tokio::select! {
            _ = shutdown.cancelled() => {
                return Err(Error::transient(format!(
                    "probe of {node_name} aborted by shutdown"
                )));
            }
            result = tokio::time::timeout(KUBELET_DIAL_TIMEOUT, handshake) => {
                result.map_err(|_| Error::transient(format!("timed out dialing {endpoint}")))??
            }
        };

        let (_, session) = stream.get_ref();
        let leaf = session
            .peer_certificates()
            .and_then(|certs| certs.first())
            .cloned()
            .ok_or_else(|| Error::transient(format!("{endpoint} presented no certificate")))?;

        // The connection is dropped here, closing it before the caller
        // sees the certificate.
        Ok(leaf)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nodes::MockNodeLookup;
    use k8s_openapi::api::core::v1::{
        DaemonEndpoint, Node, NodeAddress, NodeDaemonEndpoints, NodeStatus,
    };
    use rcgen::{
        BasicConstraints, CertificateParams, DnType, ExtendedKeyUsagePurpose, IsCa, Issuer,
        KeyPair, KeyUsagePurpose, SanType,
    };
    use rustls::pki_types::PrivateKeyDer;
    use rustls::ServerConfig;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;
    use tokio_rustls::TlsAcceptor;

    fn ensure_crypto_provider() {
        let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
    }

    fn test_node(ip: &str, port: i32) -> Node {
        let mut node = Node::default();
        node.metadata.name = Some("ip-10-0-1-6".to_string());
        node.status = Some(NodeStatus {
            addresses: Some(vec![NodeAddress {
                type_: "InternalIP".to_string(),
                address: ip.to_string(),
            }]),
            daemon_endpoints: Some(NodeDaemonEndpoints {
                kubelet_endpoint: Some(DaemonEndpoint { port }),
            }),
            ..Default::default()
        });
        node
    }

    /// A CA bundle plus a kubelet-shaped server identity chained to it.
    fn kubelet_identity() -> (CaBundle, CertificateDer<'static>, PrivateKeyDer<'static>) {
        let mut ca_params = CertificateParams::default();
        ca_params
            .distinguished_name
            .push(DnType::CommonName, "kubelet-signer");
        ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        ca_params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];
        let ca_key = KeyPair::generate().unwrap();
        let ca_cert = ca_params.clone().self_signed(&ca_key).unwrap();
        let bundle = CaBundle::from_pem(ca_cert.pem().as_bytes()).unwrap();
        let issuer = Issuer::new(ca_params, ca_key);

        let leaf_key = KeyPair::generate().unwrap();
        let mut leaf_params = CertificateParams::default();
        leaf_params
            .distinguished_name
            .push(DnType::CommonName, "system:node:ip-10-0-1-6");
        leaf_params
            .subject_alt_names
            .push(SanType::IpAddress("127.0.0.1".parse().unwrap()));
        leaf_params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        leaf_params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
        let leaf = leaf_params.signed_by(&leaf_key, &issuer).unwrap();

        let key_der = PrivateKeyDer::try_from(leaf_key.serialize_der()).unwrap();
        (bundle, leaf.der().clone(), key_der)
    }

    /// Accept a single TLS connection, presenting the given identity.
    async fn one_shot_kubelet(
        cert: CertificateDer<'static>,
        key: PrivateKeyDer<'static>,
    ) -> std::net::SocketAddr {
        let server_config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(vec![cert], key)
            .unwrap();
        let acceptor = TlsAcceptor::from(Arc::new(server_config));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            if let Ok((tcp, _)) = listener.accept().await {
                if let Ok(mut tls) = acceptor.accept(tcp).await {
                    let _ = tls.flush().await;
                    let _ = tls.shutdown().await;
                }
            }
        });

        addr
    }

    #[tokio::test]
    async fn probe_returns_the_presented_leaf_certificate() {
        ensure_crypto_provider();
        let (bundle, leaf, key) = kubelet_identity();
        let addr = one_shot_kubelet(leaf.clone(), key).await;

        let mut nodes = MockNodeLookup::new();
        let port = addr.port() as i32;
        nodes
            .expect_get_node()
            .returning(move |_| Ok(Some(test_node("127.0.0.1", port))));

        let probe = KubeletProbe::new(nodes);
        let shutdown = CancellationToken::new();
        let presented = probe
            .serving_cert("ip-10-0-1-6", &bundle, &shutdown)
            .await
            .unwrap();

        assert_eq!(presented, leaf);
    }

    #[tokio::test]
    async fn probe_rejects_a_certificate_from_an_unknown_signer() {
        ensure_crypto_provider();
        // Identity chained to one CA, bundle from another.
        let (_, leaf, key) = kubelet_identity();
        let (other_bundle, _, _) = kubelet_identity();
        let addr = one_shot_kubelet(leaf, key).await;

        let mut nodes = MockNodeLookup::new();
        let port = addr.port() as i32;
        nodes
            .expect_get_node()
            .returning(move |_| Ok(Some(test_node("127.0.0.1", port))));

        let probe = KubeletProbe::new(nodes);
        let shutdown = CancellationToken::new();
        let err = probe
            .serving_cert("ip-10-0-1-6", &other_bundle, &shutdown)
            .await
            .unwrap_err();

        assert!(err.to_string().contains("TLS handshake"));
    }

    #[tokio::test]
    async fn probe_fails_fast_when_the_node_is_missing() {
        ensure_crypto_provider();
        let (bundle, _, _) = kubelet_identity();

        let mut nodes = MockNodeLookup::new();
        nodes.expect_get_node().returning(|_| Ok(None));

        let probe = KubeletProbe::new(nodes);
        let shutdown = CancellationToken::new();
        let err = probe
            .serving_cert("ip-10-0-1-6", &bundle, &shutdown)
            .await
            .unwrap_err();

        assert!(err.to_string().contains("not found"));
    }

    #[tokio::test]
    async fn probe_requires_an_advertised_kubelet_port() {
        ensure_crypto_provider();
        let (bundle, _, _) = kubelet_identity();

        let mut nodes = MockNodeLookup::new();
        nodes.expect_get_node().returning(|_| {
            let mut node = test_node("127.0.0.1", 0);
            node.status.as_mut().unwrap().daemon_endpoints = None;
            Ok(Some(node))
        });

        let probe = KubeletProbe::new(nodes);
        let shutdown = CancellationToken::new();
        let err = probe
            .serving_cert("ip-10-0-1-6", &bundle, &shutdown)
            .await
            .unwrap_err();

        assert!(err.to_string().contains("kubelet port"));
    }

    #[tokio::test]
    async fn probe_aborts_promptly_on_shutdown() {
        ensure_crypto_provider();
        let (bundle, _, _) = kubelet_identity();

        let mut nodes = MockNodeLookup::new();
        nodes
            .expect_get_node()
            // RFC 5737 TEST-NET, nothing listens there; without the token
            // the dial would sit in the 30 second timeout.
            .returning(|_| Ok(Some(test_node("192.0.2.1", 10250))));

        let probe = KubeletProbe::new(nodes);
        let shutdown = CancellationToken::new();
        shutdown.cancel();

        let err = probe
            .serving_cert("ip-10-0-1-6", &bundle, &shutdown)
            .await
            .unwrap_err();

        assert!(err.to_string().contains("aborted") || err.to_string().contains("dial"));
    }
}
