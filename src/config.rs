//! Approver configuration and the kubelet CA bundle.

use std::path::Path;

use rustls::pki_types::{CertificateDer, TrustAnchor};
use rustls::RootCertStore;
use serde::Deserialize;

use crate::{Error, Result, DEFAULT_MAX_PENDING_DELTA};

/// Configuration for the approver, loaded from a YAML file.
///
/// The CA bundle is distributed separately from the config file (it is a
/// plain PEM mounted by the operator), so it is attached after loading with
/// [`ApproverConfig::with_kubelet_ca`].
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ApproverConfig {
    /// Controls for the node client-bootstrap flow
    pub node_client_cert: NodeClientCert,

    /// Override of the pending-CSR allowance above the Machine count
    pub max_pending_delta: Option<u32>,

    /// CA bundle used to verify kubelet serving certificates.
    ///
    /// When absent, the serving-renewal fast path is skipped entirely and
    /// every serving CSR goes through Machine-address correlation.
    #[serde(skip)]
    pub kubelet_ca: Option<CaBundle>,
}

/// Switches for the node client-bootstrap flow
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NodeClientCert {
    /// When true, every client-bootstrap CSR is refused
    pub disabled: bool,
}

impl ApproverConfig {
    /// Parse a config from its YAML representation
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| Error::malformed(format!("invalid approver config: {e}")))
    }

    /// Load a config from a YAML file on disk
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            Error::malformed(format!(
                "failed to read config {}: {e}",
                path.as_ref().display()
            ))
        })?;
        Self::from_yaml(&raw)
    }

    /// Attach the kubelet CA bundle, enabling the serving-renewal fast path
    pub fn with_kubelet_ca(mut self, ca: CaBundle) -> Self {
        self.kubelet_ca = Some(ca);
        self
    }

    /// Ceiling on recently-pending CSRs for a given Machine count
    pub fn max_pending(&self, machine_count: usize) -> usize {
        machine_count + self.max_pending_delta.unwrap_or(DEFAULT_MAX_PENDING_DELTA) as usize
    }
}

/// A set of CA certificates trusted to have signed kubelet serving certs.
///
/// The same bundle backs both uses of the CA: the rustls root store for the
/// TLS dial to the kubelet, and the webpki trust anchors for verifying the
/// certificate it presented.
#[derive(Clone, Debug)]
pub struct CaBundle {
    certs: Vec<CertificateDer<'static>>,
}

impl CaBundle {
    /// Parse a bundle from concatenated PEM certificates
    pub fn from_pem(pem: &[u8]) -> Result<Self> {
        let certs = rustls_pemfile::certs(&mut &pem[..])
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(|e| Error::malformed(format!("invalid CA bundle PEM: {e}")))?;

        if certs.is_empty() {
            return Err(Error::malformed("CA bundle contains no certificates"));
        }

        Ok(Self { certs })
    }

    /// Load a bundle from a PEM file on disk
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read(path.as_ref()).map_err(|e| {
            Error::malformed(format!(
                "failed to read CA bundle {}: {e}",
                path.as_ref().display()
            ))
        })?;
        Self::from_pem(&raw)
    }

    /// The DER certificates in the bundle
    pub fn certs(&self) -> &[CertificateDer<'static>] {
        &self.certs
    }

    /// Root store for TLS server verification during the kubelet dial
    pub fn root_store(&self) -> Result<RootCertStore> {
        let mut roots = RootCertStore::empty();
        for cert in &self.certs {
            roots
                .add(cert.clone())
                .map_err(|e| Error::malformed(format!("CA certificate rejected: {e}")))?;
        }
        Ok(roots)
    }

    /// Trust anchors for webpki path verification of a presented cert
    pub fn trust_anchors(&self) -> Result<Vec<TrustAnchor<'static>>> {
        self.certs
            .iter()
            .map(|cert| {
                webpki::anchor_from_trusted_cert(cert)
                    .map(|anchor| anchor.to_owned())
                    .map_err(|e| {
                        Error::malformed(format!("CA certificate is not a valid trust anchor: {e:?}"))
                    })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rcgen::{BasicConstraints, CertificateParams, DnType, IsCa, KeyPair, KeyUsagePurpose};

    fn test_ca_pem() -> String {
        let mut params = CertificateParams::default();
        params.distinguished_name.push(DnType::CommonName, "kubelet-signer");
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];
        let key = KeyPair::generate().unwrap();
        params.self_signed(&key).unwrap().pem()
    }

    #[test]
    fn default_config_enables_the_client_flow() {
        let config = ApproverConfig::default();
        assert!(!config.node_client_cert.disabled);
        assert!(config.kubelet_ca.is_none());
    }

    #[test]
    fn yaml_round_trip_matches_the_operator_config_shape() {
        let config = ApproverConfig::from_yaml("nodeClientCert:\n  disabled: true\n").unwrap();
        assert!(config.node_client_cert.disabled);

        // Unknown keys and empty documents are tolerated.
        let config = ApproverConfig::from_yaml("{}").unwrap();
        assert!(!config.node_client_cert.disabled);
    }

    #[test]
    fn max_pending_defaults_to_one_hundred_over_machine_count() {
        let config = ApproverConfig::default();
        assert_eq!(config.max_pending(0), 100);
        assert_eq!(config.max_pending(3), 103);

        let config = ApproverConfig {
            max_pending_delta: Some(5),
            ..Default::default()
        };
        assert_eq!(config.max_pending(3), 8);
    }

    #[test]
    fn ca_bundle_parses_pem_and_exposes_both_views() {
        let bundle = CaBundle::from_pem(test_ca_pem().as_bytes()).unwrap();
        assert_eq!(bundle.certs().len(), 1);
        assert_eq!(bundle.root_store().unwrap().len(), 1);
        assert_eq!(bundle.trust_anchors().unwrap().len(), 1);
    }

    #[test]
    fn ca_bundle_rejects_garbage_and_empty_input() {
        assert!(CaBundle::from_pem(b"not pem at all").is_err());
        assert!(CaBundle::from_pem(b"").is_err());
    }
}
