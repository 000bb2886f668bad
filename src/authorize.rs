//! Decision engine for node CSR approval.
//!
//! Two flows exist. A booting node's first client certificate carries
//! nothing but the future node name, so it is authorized by correlating the
//! bootstrapper's CSR with a Machine created shortly before it. A serving
//! certificate is authorized preferably as an exact renewal of what the
//! node already serves, otherwise by checking every requested name against
//! the addresses of the Machine bound to that node.
//!
//! The return contract is load-bearing: `Ok(true)` approves, `Ok(false)`
//! means we will never approve this CSR, and an error means the cluster
//! state is not yet consistent enough to decide and the CSR must be
//! revisited with fresh snapshots.

use chrono::{DateTime, Utc};
use k8s_openapi::api::certificates::v1::CertificateSigningRequest;
use kube::ResourceExt;
use rustls::pki_types::{CertificateDer, UnixTime};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use x509_parser::prelude::{FromDer, X509Certificate};

use crate::clock::Clock;
use crate::config::{ApproverConfig, CaBundle};
use crate::csr::{classify, CsrShape, ParsedCsr, SanSets};
use crate::kubelet::ServingCertSource;
use crate::machines::{
    address_types, find_machine_by_internal_dns, find_machine_by_node_ref, Machine,
};
use crate::nodes::NodeLookup;
use crate::sans;
use crate::{Error, Result, MAX_BOOTSTRAP_WINDOW, MAX_CLOCK_SKEW, NODE_USER_PREFIX};

/// Decide approval for a single CSR.
///
/// Classifies the request, routes it to the bootstrap or serving flow, and
/// returns the decision. Requests matching neither flow are ignored;
/// serving-shaped requests with structural defects are logged and refused
/// without retry.
#[allow(clippy::too_many_arguments)]
pub async fn authorize_csr<N, S>(
    nodes: &N,
    probe: &S,
    config: &ApproverConfig,
    machines: &[Machine],
    req: &CertificateSigningRequest,
    parsed: &ParsedCsr,
    clock: &dyn Clock,
    shutdown: &CancellationToken,
) -> Result<bool>
where
    N: NodeLookup + ?Sized,
    S: ServingCertSource + ?Sized,
{
    let name = req.name_any();

    match classify(req, parsed) {
        Ok(CsrShape::NodeClientBootstrap) => {
            if config.node_client_cert.disabled {
                error!(csr = %name, "CSR rejected as the client cert flow is disabled");
                return Err(Error::flow_disabled(format!(
                    "CSR {name} for node client cert rejected as the flow is disabled"
                )));
            }
            authorize_node_client(nodes, machines, req, parsed, shutdown).await
        }
        Ok(CsrShape::NodeServing { node_name }) => {
            authorize_node_serving(
                probe, config, machines, req, parsed, &node_name, clock, shutdown,
            )
            .await
        }
        Ok(CsrShape::Unrecognized) => {
            info!(csr = %name, "CSR does not appear to be a node client or serving cert");
            Ok(false)
        }
        Err(e) => {
            error!(csr = %name, error = %e, "unrecoverable serving cert error, cannot approve");
            Ok(false)
        }
    }
}

/// Authorize a booting node's first client certificate.
///
/// The only information in the CSR is the future node name, so the check is
/// a best-effort correlation: no Node of that name yet, a Machine that
/// advertises the name over internal DNS, that Machine not yet bound to a
/// node, and the CSR created inside the machine's bootstrap window.
async fn authorize_node_client<N>(
    nodes: &N,
    machines: &[Machine],
    req: &CertificateSigningRequest,
    parsed: &ParsedCsr,
    shutdown: &CancellationToken,
) -> Result<bool>
where
    N: NodeLookup + ?Sized,
{
    let name = req.name_any();

    let node_name = parsed
        .subject_common_name
        .strip_prefix(NODE_USER_PREFIX)
        .unwrap_or_default();
    if node_name.is_empty() {
        error!(csr = %name, "bootstrap request carries no node name");
        return Ok(false);
    }

    // Only a definitive "not found" clears this check; an API failure
    // requeues the CSR instead.
    let existing = tokio::select! {
        _ = shutdown.cancelled() => {
            return Err(Error::transient(format!(
                "lookup of node {node_name} aborted by shutdown"
            )));
        }
        node = nodes.get_node(node_name) => node?,
    };
    if existing.is_some() {
        error!(csr = %name, node = %node_name, "node already exists, cannot approve");
        return Ok(false);
    }

    let Some(machine) = find_machine_by_internal_dns(node_name, machines) else {
        error!(csr = %name, node = %node_name, "failed to find machine for node, cannot approve");
        return Ok(false);
    };

    if machine.has_node_ref() {
        error!(csr = %name, node = %node_name, "machine for node already has a node ref, cannot approve");
        return Ok(false);
    }

    let (Some(machine_created), Some(csr_created)) = (machine.created_at(), csr_created_at(req))
    else {
        error!(csr = %name, node = %node_name, "creation timestamp missing, cannot approve");
        return Ok(false);
    };

    let window_start = machine_created - MAX_CLOCK_SKEW;
    let window_end = machine_created + MAX_BOOTSTRAP_WINDOW;
    if csr_created < window_start || csr_created > window_end {
        error!(
            csr = %name,
            node = %node_name,
            created = %csr_created,
            window_start = %window_start,
            window_end = %window_end,
            "CSR creation time outside machine window"
        );
        return Ok(false);
    }

    Ok(true)
}

/// Authorize a node's serving certificate.
///
/// When a CA bundle is available, first try to treat the request as an
/// exact renewal of the certificate the node serves today; any probe or
/// validation failure falls through to machine-api correlation.
#[allow(clippy::too_many_arguments)]
async fn authorize_node_serving<S>(
    probe: &S,
    config: &ApproverConfig,
    machines: &[Machine],
    req: &CertificateSigningRequest,
    parsed: &ParsedCsr,
    node_name: &str,
    clock: &dyn Clock,
    shutdown: &CancellationToken,
) -> Result<bool>
where
    S: ServingCertSource + ?Sized,
{
    let name = req.name_any();

    if let Some(ca) = &config.kubelet_ca {
        match probe.serving_cert(node_name, ca, shutdown).await {
            Ok(current) => {
                info!(node = %node_name, "found existing serving cert");
                match authorize_serving_renewal(node_name, parsed, &current, ca, clock.now()) {
                    Ok(()) => return Ok(true),
                    Err(e) => {
                        info!(node = %node_name, error = %e, "could not use current serving cert for renewal");
                        if let Ok(summary) = summarize_certificate(&current) {
                            info!(
                                current = ?summary.sans.strings(),
                                requested = ?parsed.sans.strings(),
                                "SAN values of current cert and CSR"
                            );
                        }
                    }
                }
            }
            Err(e) => {
                info!(node = %node_name, error = %e, "failed to retrieve current serving cert");
            }
        }
    }

    info!(csr = %name, node = %node_name, "falling back to machine-api authorization");

    let Some(machine) = find_machine_by_node_ref(node_name, machines) else {
        error!(csr = %name, node = %node_name, "serving cert: no target machine for node");
        // Requeue: we may be racing with the node linker.
        return Err(Error::transient(format!(
            "unable to find machine for node {node_name}"
        )));
    };

    let addresses = machine
        .status
        .as_ref()
        .map(|status| status.addresses.as_slice())
        .unwrap_or_default();

    // Every name in the request must correspond to an address of this
    // machine. A mismatch requeues in case the machine's address list is
    // still catching up.
    const DNS_TYPES: [&str; 3] = [
        address_types::INTERNAL_DNS,
        address_types::EXTERNAL_DNS,
        address_types::HOSTNAME,
    ];
    for san in parsed.sans.dns.iter().filter(|san| !san.is_empty()) {
        let mut attempted = Vec::new();
        let mut found = false;
        for addr in addresses {
            if DNS_TYPES.contains(&addr.type_.as_str()) {
                if &addr.address == san {
                    found = true;
                    break;
                }
                attempted.push(addr.address.as_str());
            }
        }
        if !found {
            error!(csr = %name, san = %san, attempted = ?attempted, "DNS name not in machine names");
            return Err(Error::transient(format!(
                "DNS name '{san}' not in machine names: {}",
                attempted.join(" ")
            )));
        }
    }

    const IP_TYPES: [&str; 2] = [address_types::INTERNAL_IP, address_types::EXTERNAL_IP];
    for san in &parsed.sans.ips {
        let san_text = san.to_string();
        let mut attempted = Vec::new();
        let mut found = false;
        for addr in addresses {
            if IP_TYPES.contains(&addr.type_.as_str()) {
                if addr.address == san_text {
                    found = true;
                    break;
                }
                attempted.push(addr.address.as_str());
            }
        }
        if !found {
            error!(csr = %name, san = %san_text, attempted = ?attempted, "IP address not in machine addresses");
            return Err(Error::transient(format!(
                "IP address '{san_text}' not in machine addresses: {}",
                attempted.join(" ")
            )));
        }
    }

    // Email and URI SANs are not validated against the machine. The
    // requester already authenticated as system:node:<name>; a stricter
    // policy would reject non-empty email/URI SANs outright.
    Ok(true)
}

/// Authorize the renewal of a node's serving certificate.
///
/// The certificate currently served must verify against the provided
/// roots, carry the expected node common name, and the request must ask
/// for exactly what is already attested: same subject CN, same SAN sets.
pub fn authorize_serving_renewal(
    node_name: &str,
    parsed: &ParsedCsr,
    current: &CertificateDer<'static>,
    ca: &CaBundle,
    now: DateTime<Utc>,
) -> Result<()> {
    let anchors = ca.trust_anchors()?;

    let end_entity = webpki::EndEntityCert::try_from(current)
        .map_err(|e| Error::policy_deny(format!("current serving cert unreadable: {e:?}")))?;

    let timestamp = u64::try_from(now.timestamp()).unwrap_or_default();
    let at = UnixTime::since_unix_epoch(std::time::Duration::from_secs(timestamp));

    end_entity
        .verify_for_usage(
            webpki::ALL_VERIFICATION_ALGS,
            &anchors,
            &[],
            at,
            webpki::KeyUsage::server_auth(),
            None,
            None,
        )
        .map_err(|e| {
            Error::policy_deny(format!("current serving cert failed verification: {e:?}"))
        })?;

    let current = summarize_certificate(current)?;

    let expected_cn = format!("{NODE_USER_PREFIX}{node_name}");
    if current.common_name != expected_cn {
        return Err(Error::policy_deny("current serving cert has bad common name"));
    }

    if current.common_name != parsed.subject_common_name {
        return Err(Error::policy_deny(
            "current serving cert and CSR common name mismatch",
        ));
    }

    let matched = sans::equal_strings(&current.sans.dns, &parsed.sans.dns)
        && sans::equal_strings(&current.sans.email, &parsed.sans.email)
        && sans::equal_ip_addresses(&current.sans.ips, &parsed.sans.ips)
        && sans::equal_uris(&current.sans.uris, &parsed.sans.uris);

    if !matched {
        return Err(Error::policy_deny(
            "CSR subject alternate name values do not match current certificate",
        ));
    }

    Ok(())
}

/// Subject common name and SANs of a presented certificate.
#[derive(Clone, Debug, Default)]
pub struct CertificateSummary {
    /// Subject common name
    pub common_name: String,
    /// Subject Alternative Names grouped by kind
    pub sans: SanSets,
}

/// Extract the subject common name and SANs from a DER certificate.
pub fn summarize_certificate(der: &CertificateDer<'_>) -> Result<CertificateSummary> {
    let (_, cert) = X509Certificate::from_der(der.as_ref())
        .map_err(|e| Error::malformed(format!("presented certificate is not valid DER: {e}")))?;

    let common_name = cert
        .subject()
        .iter_common_name()
        .next()
        .and_then(|attr| attr.as_str().ok())
        .unwrap_or_default()
        .to_string();

    let sans = match cert
        .subject_alternative_name()
        .map_err(|e| Error::malformed(format!("invalid SAN extension: {e}")))?
    {
        Some(extension) => SanSets::from_general_names(&extension.value.general_names)?,
        None => SanSets::default(),
    };

    Ok(CertificateSummary { common_name, sans })
}

fn csr_created_at(req: &CertificateSigningRequest) -> Option<DateTime<Utc>> {
    req.metadata.creation_timestamp.as_ref().map(|t| t.0)
}
