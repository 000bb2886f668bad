//! PKCS#10 parsing and CSR shape classification.
//!
//! A CSR object carries the authenticated requester identity alongside a
//! DER-encoded PKCS#10 blob. Both are needed to classify the request: the
//! identity decides which flow may apply, the decoded subject and SANs
//! decide whether the request is structurally acceptable for that flow.

use std::net::IpAddr;

use k8s_openapi::api::certificates::v1::CertificateSigningRequest;
use x509_parser::extensions::{GeneralName, ParsedExtension};
use x509_parser::prelude::{FromDer, X509CertificationRequest};

use crate::{
    Error, Result, AUTHENTICATED_GROUP, NODE_BOOTSTRAPPER_GROUPS, NODE_BOOTSTRAPPER_USERNAME,
    NODE_GROUP, NODE_USER_PREFIX,
};

/// Key usage strings from the `certificates.k8s.io/v1` API.
pub mod usages {
    /// digitalSignature key usage
    pub const DIGITAL_SIGNATURE: &str = "digital signature";
    /// keyEncipherment key usage
    pub const KEY_ENCIPHERMENT: &str = "key encipherment";
    /// clientAuth extended key usage
    pub const CLIENT_AUTH: &str = "client auth";
    /// serverAuth extended key usage
    pub const SERVER_AUTH: &str = "server auth";
}

/// Subject Alternative Name values grouped by kind.
///
/// IPs keep their parsed form; equality elsewhere is over their textual
/// representation. URIs are kept as their full serialization.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SanSets {
    /// DNS-name SANs
    pub dns: Vec<String>,
    /// Email (RFC 822) SANs
    pub email: Vec<String>,
    /// IP-address SANs
    pub ips: Vec<IpAddr>,
    /// URI SANs
    pub uris: Vec<String>,
}

impl SanSets {
    /// Collect SANs from a sequence of X.509 general names.
    ///
    /// Name kinds outside the four tracked sets (directory names, etc.) are
    /// ignored. An IP SAN that is not 4 or 16 bytes is a malformed request.
    pub fn from_general_names<'a>(names: impl IntoIterator<Item = &'a GeneralName<'a>>) -> Result<Self> {
        let mut sans = SanSets::default();
        for name in names {
            match name {
                GeneralName::DNSName(dns) => sans.dns.push(dns.to_string()),
                GeneralName::RFC822Name(email) => sans.email.push(email.to_string()),
                GeneralName::IPAddress(bytes) => sans.ips.push(ip_from_bytes(bytes)?),
                GeneralName::URI(uri) => sans.uris.push(uri.to_string()),
                _ => {}
            }
        }
        Ok(sans)
    }

    /// All SAN values as canonical strings, for operator-visible diffs.
    pub fn strings(&self) -> Vec<String> {
        let mut out = Vec::new();
        out.extend(self.dns.iter().cloned());
        out.extend(self.email.iter().cloned());
        out.extend(self.ips.iter().map(|ip| ip.to_string()));
        out.extend(self.uris.iter().cloned());
        out
    }
}

fn ip_from_bytes(bytes: &[u8]) -> Result<IpAddr> {
    match bytes.len() {
        4 => {
            let octets: [u8; 4] = bytes.try_into().expect("length checked");
            Ok(IpAddr::from(octets))
        }
        16 => {
            let octets: [u8; 16] = bytes.try_into().expect("length checked");
            Ok(IpAddr::from(octets))
        }
        n => Err(Error::malformed(format!("IP SAN has invalid length {n}"))),
    }
}

/// Decoded fields of a PKCS#10 certificate request.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ParsedCsr {
    /// Subject common name
    pub subject_common_name: String,
    /// Subject organizations, in certificate order
    pub subject_organizations: Vec<String>,
    /// Requested Subject Alternative Names
    pub sans: SanSets,
}

impl ParsedCsr {
    /// Decode the PEM-wrapped PKCS#10 blob from a CSR object.
    pub fn from_csr(req: &CertificateSigningRequest) -> Result<Self> {
        Self::from_request_pem(&req.spec.request.0)
    }

    /// Decode a PEM-encoded PKCS#10 request.
    pub fn from_request_pem(pem: &[u8]) -> Result<Self> {
        let (_, doc) = x509_parser::pem::parse_x509_pem(pem)
            .map_err(|e| Error::malformed(format!("request is not valid PEM: {e}")))?;
        Self::from_der(&doc.contents)
    }

    /// Decode a DER-encoded PKCS#10 request.
    pub fn from_der(der: &[u8]) -> Result<Self> {
        let (_, request) = X509CertificationRequest::from_der(der)
            .map_err(|e| Error::malformed(format!("request is not valid PKCS#10: {e}")))?;

        let info = &request.certification_request_info;

        let subject_common_name = info
            .subject
            .iter_common_name()
            .next()
            .and_then(|attr| attr.as_str().ok())
            .unwrap_or_default()
            .to_string();

        let subject_organizations = info
            .subject
            .iter_organization()
            .filter_map(|attr| attr.as_str().ok())
            .map(str::to_string)
            .collect();

        let mut sans = SanSets::default();
        if let Some(extensions) = request.requested_extensions() {
            for extension in extensions {
                if let ParsedExtension::SubjectAlternativeName(san) = extension {
                    sans = SanSets::from_general_names(&san.general_names)?;
                }
            }
        }

        Ok(Self {
            subject_common_name,
            subject_organizations,
            sans,
        })
    }
}

/// The flow a CSR belongs to, decided from requester identity and subject.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CsrShape {
    /// First client-auth certificate for a booting node, submitted by the
    /// node bootstrapper service account
    NodeClientBootstrap,
    /// Serving certificate requested by a joined node's own identity
    NodeServing {
        /// The node name extracted from the requester username
        node_name: String,
    },
    /// Neither flow applies; the CSR is left for other approvers
    Unrecognized,
}

/// Classify a CSR into one of the recognized shapes.
///
/// Unrecognized requests are not errors: other signers and approvers exist,
/// so anything outside our two shapes is ignored. A request that matches
/// the serving shape but fails one of its structural checks is malformed
/// and will never be approved by us.
pub fn classify(req: &CertificateSigningRequest, parsed: &ParsedCsr) -> Result<CsrShape> {
    if is_node_client_request(req, parsed) {
        return Ok(CsrShape::NodeClientBootstrap);
    }

    match validate_serving_request(req, parsed)? {
        Some(node_name) => Ok(CsrShape::NodeServing { node_name }),
        None => Ok(CsrShape::Unrecognized),
    }
}

/// Whether the CSR matches the node client-bootstrap shape exactly.
fn is_node_client_request(req: &CertificateSigningRequest, parsed: &ParsedCsr) -> bool {
    if req.spec.username.as_deref() != Some(NODE_BOOTSTRAPPER_USERNAME) {
        return false;
    }

    let mut groups: Vec<&str> = req
        .spec
        .groups
        .as_deref()
        .unwrap_or_default()
        .iter()
        .map(String::as_str)
        .collect();
    groups.sort_unstable();
    groups.dedup();

    let mut expected = NODE_BOOTSTRAPPER_GROUPS;
    expected.sort_unstable();
    if groups != expected {
        return false;
    }

    let node_name = parsed
        .subject_common_name
        .strip_prefix(NODE_USER_PREFIX)
        .unwrap_or_default();
    if node_name.is_empty() {
        return false;
    }

    let mut requested: Vec<&str> = req
        .spec
        .usages
        .as_deref()
        .unwrap_or_default()
        .iter()
        .map(String::as_str)
        .collect();
    requested.sort_unstable();
    requested.dedup();

    let mut client_usages = [
        usages::DIGITAL_SIGNATURE,
        usages::KEY_ENCIPHERMENT,
        usages::CLIENT_AUTH,
    ];
    client_usages.sort_unstable();

    requested == client_usages
}

/// Validate a CSR against the node-serving shape.
///
/// Returns the asking node's name when the shape matches, `None` when the
/// requester is not a node identity at all, and an error when the shape
/// matches but a structural check fails.
fn validate_serving_request(
    req: &CertificateSigningRequest,
    parsed: &ParsedCsr,
) -> Result<Option<String>> {
    let username = req.spec.username.as_deref().unwrap_or_default();
    let Some(node_asking) = username.strip_prefix(NODE_USER_PREFIX) else {
        return Ok(None);
    };
    if node_asking.is_empty() {
        return Ok(None);
    }

    let groups = req.spec.groups.as_deref().unwrap_or_default();
    if groups.len() < 2 {
        return Err(Error::malformed("too few groups"));
    }
    for required in [NODE_GROUP, AUTHENTICATED_GROUP] {
        if !groups.iter().any(|g| g == required) {
            return Err(Error::malformed(format!(
                "groups {groups:?} missing {required}"
            )));
        }
    }

    let requested = req.spec.usages.as_deref().unwrap_or_default();
    if requested.len() != 3 {
        return Err(Error::malformed(format!(
            "expected exactly 3 usages, got {}",
            requested.len()
        )));
    }
    for required in [
        usages::DIGITAL_SIGNATURE,
        usages::KEY_ENCIPHERMENT,
        usages::SERVER_AUTH,
    ] {
        if !requested.iter().any(|u| u == required) {
            return Err(Error::malformed(format!(
                "usages {requested:?} missing {required}"
            )));
        }
    }

    if parsed.subject_common_name != username {
        return Err(Error::malformed(format!(
            "mismatched common name {} != {username}",
            parsed.subject_common_name
        )));
    }

    if !parsed.subject_organizations.iter().any(|o| o == NODE_GROUP) {
        return Err(Error::malformed(format!(
            "organizations {:?} missing {NODE_GROUP}",
            parsed.subject_organizations
        )));
    }

    Ok(Some(node_asking.to_string()))
}
