//! CSR controller implementation
//!
//! This module implements the reconciliation logic for
//! CertificateSigningRequest resources. Each pass takes fresh Machine and
//! CSR snapshots, applies the backlog throttle, runs the decision engine,
//! and writes the approval condition when a CSR is authorized.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::certificates::v1::{
    CertificateSigningRequest, CertificateSigningRequestCondition,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::api::{Api, ListParams, Patch, PatchParams};
use kube::runtime::controller::Action;
use kube::{Client, ResourceExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

#[cfg(test)]
use mockall::automock;

use crate::authorize::authorize_csr;
use crate::clock::{Clock, SystemClock};
use crate::config::ApproverConfig;
use crate::csr::ParsedCsr;
use crate::error::Disposition;
use crate::kubelet::{KubeletProbe, ServingCertSource};
use crate::machines::Machine;
use crate::nodes::{KubeNodeLookup, NodeLookup};
use crate::throttle::{is_approved, recently_pending_csrs, BacklogGauges, APPROVED_CONDITION};
use crate::{Error, Result};

/// Reason recorded on the approval condition
pub const APPROVAL_REASON: &str = "NodeCSRApprove";

/// Requeue delay for transient inconsistencies
const REQUEUE_SHORT: Duration = Duration::from_secs(5);

/// Requeue delay while the backlog is over its ceiling
const REQUEUE_BACKLOG: Duration = Duration::from_secs(300);

/// Trait abstracting cluster operations used by the reconciler
///
/// This trait allows mocking the Kubernetes client in tests while using
/// the real client in production.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ApproverApi: Send + Sync {
    /// Snapshot of all Machines
    async fn list_machines(&self) -> Result<Vec<Machine>>;

    /// Snapshot of all CSRs
    async fn list_csrs(&self) -> Result<Vec<CertificateSigningRequest>>;

    /// Append an approval condition through the CSR approval subresource
    async fn approve(
        &self,
        csr: &CertificateSigningRequest,
        condition: CertificateSigningRequestCondition,
    ) -> Result<()>;
}

/// Real cluster API implementation
pub struct KubeApproverApi {
    client: Client,
}

impl KubeApproverApi {
    /// Create a new API wrapper around the given kube client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ApproverApi for KubeApproverApi {
    async fn list_machines(&self) -> Result<Vec<Machine>> {
        let api: Api<Machine> = Api::all(self.client.clone());
        Ok(api.list(&ListParams::default()).await?.items)
    }

    async fn list_csrs(&self) -> Result<Vec<CertificateSigningRequest>> {
        let api: Api<CertificateSigningRequest> = Api::all(self.client.clone());
        Ok(api.list(&ListParams::default()).await?.items)
    }

    async fn approve(
        &self,
        csr: &CertificateSigningRequest,
        condition: CertificateSigningRequestCondition,
    ) -> Result<()> {
        let api: Api<CertificateSigningRequest> = Api::all(self.client.clone());
        let name = csr.name_any();

        let mut approved = csr.clone();
        approved
            .status
            .get_or_insert_with(Default::default)
            .conditions
            .get_or_insert_with(Vec::new)
            .push(condition);

        api.patch_approval(&name, &PatchParams::default(), &Patch::Strategic(&approved))
            .await?;
        Ok(())
    }
}

/// Controller context containing shared state and clients
///
/// The context is shared across all reconciliation calls and holds
/// resources that are expensive to create (like Kubernetes clients).
pub struct Context {
    /// Cluster API operations (trait object for testability)
    pub api: Arc<dyn ApproverApi>,
    /// Point Node lookups for the decision engine
    pub nodes: Arc<dyn NodeLookup>,
    /// Kubelet serving-certificate probe
    pub probe: Arc<dyn ServingCertSource>,
    /// Approver configuration
    pub config: ApproverConfig,
    /// Wall-clock source
    pub clock: Arc<dyn Clock>,
    /// Backlog gauges observed by telemetry
    pub gauges: Arc<BacklogGauges>,
    /// Cancelled when the process is shutting down
    pub shutdown: CancellationToken,
}

impl Context {
    /// Create a new controller context with the given Kubernetes client
    pub fn new(client: Client, config: ApproverConfig, shutdown: CancellationToken) -> Self {
        Self {
            api: Arc::new(KubeApproverApi::new(client.clone())),
            nodes: Arc::new(KubeNodeLookup::new(client.clone())),
            probe: Arc::new(KubeletProbe::new(KubeNodeLookup::new(client))),
            config,
            clock: Arc::new(SystemClock),
            gauges: Arc::new(BacklogGauges::default()),
            shutdown,
        }
    }
}

/// Reconcile a single CertificateSigningRequest
///
/// Returns an `Action` indicating when to revisit the CSR, or an error when
/// the decision must be retried with fresh snapshots.
#[instrument(skip(csr, ctx), fields(csr = %csr.name_any()))]
pub async fn reconcile(
    csr: Arc<CertificateSigningRequest>,
    ctx: Arc<Context>,
) -> Result<Action> {
    if is_approved(&csr) {
        debug!("CSR already approved");
        return Ok(Action::await_change());
    }

    let machines = ctx.api.list_machines().await?;
    let csrs = ctx.api.list_csrs().await?;

    let pending = recently_pending_csrs(&csrs, ctx.clock.as_ref());
    let ceiling = ctx.config.max_pending(machines.len());
    ctx.gauges.record(pending as u32, ceiling as u32);

    if pending > ceiling {
        warn!(
            pending,
            ceiling, "too many recently pending CSRs, not approving until the backlog drains"
        );
        return Err(Error::throttled(format!(
            "{pending} recently pending CSRs, ceiling {ceiling}"
        )));
    }

    let parsed = match ParsedCsr::from_csr(&csr) {
        Ok(parsed) => parsed,
        Err(e) => {
            info!(error = %e, "CSR request is not parseable, ignoring");
            return Ok(Action::await_change());
        }
    };

    let decision = authorize_csr(
        ctx.nodes.as_ref(),
        ctx.probe.as_ref(),
        &ctx.config,
        &machines,
        &csr,
        &parsed,
        ctx.clock.as_ref(),
        &ctx.shutdown,
    )
    .await;

    match decision {
        Ok(true) => {
            ctx.api
                .approve(&csr, approval_condition(ctx.clock.as_ref()))
                .await?;
            info!("CSR approved");
            Ok(Action::await_change())
        }
        Ok(false) => {
            debug!("CSR left alone");
            Ok(Action::await_change())
        }
        Err(e) => match e.disposition() {
            // Final refusals are logged here; retrying would produce the
            // same answer forever.
            Disposition::Deny => {
                error!(error = %e, "CSR refused");
                Ok(Action::await_change())
            }
            _ => Err(e),
        },
    }
}

/// Error policy for the controller
///
/// Transient inconsistencies retry quickly; a throttled pass backs off on
/// the long cadence so the backlog can drain.
pub fn error_policy(
    csr: Arc<CertificateSigningRequest>,
    error: &Error,
    _ctx: Arc<Context>,
) -> Action {
    match error.disposition() {
        Disposition::Backoff => {
            warn!(csr = %csr.name_any(), error = %error, "backlog over ceiling, backing off");
            Action::requeue(REQUEUE_BACKLOG)
        }
        _ => {
            error!(csr = %csr.name_any(), error = %error, "reconciliation failed");
            Action::requeue(REQUEUE_SHORT)
        }
    }
}

fn approval_condition(clock: &dyn Clock) -> CertificateSigningRequestCondition {
    CertificateSigningRequestCondition {
        type_: APPROVED_CONDITION.to_string(),
        status: "True".to_string(),
        reason: Some(APPROVAL_REASON.to_string()),
        message: Some("This CSR was approved by the machine approver".to_string()),
        last_update_time: Some(Time(clock.now())),
        last_transition_time: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use crate::csr::usages;
    use crate::kubelet::MockServingCertSource;
    use crate::machines::{MachineSpec, MachineStatus, NodeReference};
    use crate::nodes::MockNodeLookup;
    use crate::{NODE_BOOTSTRAPPER_GROUPS, NODE_BOOTSTRAPPER_USERNAME};
    use chrono::{DateTime, Duration as ChronoDuration, Utc};
    use k8s_openapi::api::certificates::v1::CertificateSigningRequestSpec;
    use k8s_openapi::ByteString;
    use rcgen::{CertificateParams, DnType, KeyPair};

    fn t0() -> DateTime<Utc> {
        "2024-01-01T00:00:00Z".parse().unwrap()
    }

    // ==========================================================================
    // Fixtures
    // ==========================================================================

    fn bootstrap_request_pem(node: &str) -> Vec<u8> {
        let key = KeyPair::generate().unwrap();
        let mut params = CertificateParams::default();
        params
            .distinguished_name
            .push(DnType::CommonName, format!("system:node:{node}"));
        params
            .serialize_request(&key)
            .unwrap()
            .pem()
            .unwrap()
            .into_bytes()
    }

    fn bootstrap_csr(node: &str, created: DateTime<Utc>) -> CertificateSigningRequest {
        let mut csr = CertificateSigningRequest {
            spec: CertificateSigningRequestSpec {
                username: Some(NODE_BOOTSTRAPPER_USERNAME.to_string()),
                groups: Some(
                    NODE_BOOTSTRAPPER_GROUPS
                        .iter()
                        .map(|g| g.to_string())
                        .collect(),
                ),
                usages: Some(vec![
                    usages::DIGITAL_SIGNATURE.to_string(),
                    usages::KEY_ENCIPHERMENT.to_string(),
                    usages::CLIENT_AUTH.to_string(),
                ]),
                request: ByteString(bootstrap_request_pem(node)),
                signer_name: "kubernetes.io/kube-apiserver-client-kubelet".to_string(),
                ..Default::default()
            },
            ..Default::default()
        };
        csr.metadata.name = Some(format!("csr-{node}"));
        csr.metadata.creation_timestamp = Some(Time(created));
        csr
    }

    fn unbound_machine(name: &str, dns: &str, created: DateTime<Utc>) -> Machine {
        let mut machine = Machine::new(name, MachineSpec::default());
        machine.metadata.creation_timestamp = Some(Time(created));
        machine.status = Some(MachineStatus {
            node_ref: None,
            addresses: vec![crate::machines::MachineAddress {
                type_: crate::machines::address_types::INTERNAL_DNS.to_string(),
                address: dns.to_string(),
            }],
            phase: None,
        });
        machine
    }

    fn bound_machine(name: &str, node: &str) -> Machine {
        let mut machine = Machine::new(name, MachineSpec::default());
        machine.status = Some(MachineStatus {
            node_ref: Some(NodeReference {
                name: node.to_string(),
            }),
            addresses: vec![],
            phase: None,
        });
        machine
    }

    fn context(api: MockApproverApi, now: DateTime<Utc>, config: ApproverConfig) -> Arc<Context> {
        let mut nodes = MockNodeLookup::new();
        nodes.expect_get_node().returning(|_| Ok(None));

        Arc::new(Context {
            api: Arc::new(api),
            nodes: Arc::new(nodes),
            probe: Arc::new(MockServingCertSource::new()),
            config,
            clock: Arc::new(FixedClock(now)),
            gauges: Arc::new(BacklogGauges::default()),
            shutdown: CancellationToken::new(),
        })
    }

    // ==========================================================================
    // Story: Approval Write on the Happy Path
    //
    // A well-formed bootstrap CSR with a matching machine gets exactly one
    // approval write, carrying the Approved condition.
    // ==========================================================================

    #[tokio::test]
    async fn approves_a_well_formed_bootstrap_csr() {
        let now = t0() + ChronoDuration::minutes(5);
        let csr = bootstrap_csr("ip-10-0-1-5", now);
        let listed = csr.clone();

        let mut api = MockApproverApi::new();
        api.expect_list_machines()
            .returning(|| Ok(vec![unbound_machine("m1", "ip-10-0-1-5", t0())]));
        api.expect_list_csrs()
            .returning(move || Ok(vec![listed.clone()]));
        api.expect_approve()
            .withf(|_, condition| {
                condition.type_ == APPROVED_CONDITION
                    && condition.status == "True"
                    && condition.reason.as_deref() == Some(APPROVAL_REASON)
            })
            .times(1)
            .returning(|_, _| Ok(()));

        let ctx = context(api, now, ApproverConfig::default());
        let action = reconcile(Arc::new(csr), ctx.clone()).await.unwrap();

        assert_eq!(action, Action::await_change());
        assert_eq!(ctx.gauges.snapshot(), (1, 101));
    }

    #[tokio::test]
    async fn already_approved_csrs_are_skipped_entirely() {
        let now = t0();
        let mut csr = bootstrap_csr("ip-10-0-1-5", now);
        csr.status = Some(k8s_openapi::api::certificates::v1::CertificateSigningRequestStatus {
            conditions: Some(vec![approval_condition(&FixedClock(now))]),
            ..Default::default()
        });

        // No list or approve calls expected at all.
        let api = MockApproverApi::new();
        let ctx = context(api, now, ApproverConfig::default());

        let action = reconcile(Arc::new(csr), ctx).await.unwrap();
        assert_eq!(action, Action::await_change());
    }

    #[tokio::test]
    async fn unparseable_requests_are_left_alone() {
        let now = t0();
        let mut csr = bootstrap_csr("ip-10-0-1-5", now);
        csr.spec.request = ByteString(b"garbage".to_vec());
        let listed = csr.clone();

        let mut api = MockApproverApi::new();
        api.expect_list_machines().returning(|| Ok(vec![]));
        api.expect_list_csrs()
            .returning(move || Ok(vec![listed.clone()]));
        api.expect_approve().never();

        let ctx = context(api, now, ApproverConfig::default());
        let action = reconcile(Arc::new(csr), ctx).await.unwrap();
        assert_eq!(action, Action::await_change());
    }

    // ==========================================================================
    // Story: Backlog Throttle
    //
    // With 150 recently pending CSRs against 3 machines the ceiling (103)
    // is exceeded: the pass makes no approvals and the CSR stays pending.
    // ==========================================================================

    #[tokio::test]
    async fn over_ceiling_backlog_stops_all_approvals() {
        let now = t0();
        let csr = bootstrap_csr("ip-10-0-1-5", now);

        let mut api = MockApproverApi::new();
        api.expect_list_machines().returning(|| {
            Ok(vec![
                bound_machine("m1", "a"),
                bound_machine("m2", "b"),
                bound_machine("m3", "c"),
            ])
        });
        api.expect_list_csrs().returning(move || {
            Ok((0..150).map(|i| bootstrap_csr(&format!("n{i}"), t0())).collect())
        });
        api.expect_approve().never();

        let ctx = context(api, now, ApproverConfig::default());
        let err = reconcile(Arc::new(csr), ctx.clone()).await.unwrap_err();

        assert!(matches!(err, Error::Throttled(_)));
        assert_eq!(ctx.gauges.snapshot(), (150, 103));
    }

    #[tokio::test]
    async fn refused_csrs_do_not_error_the_reconciler() {
        let now = t0() + ChronoDuration::hours(3);
        // Out-of-window bootstrap: decision engine declines without retry.
        let csr = bootstrap_csr("ip-10-0-1-5", now);
        let listed = csr.clone();

        let mut api = MockApproverApi::new();
        api.expect_list_machines()
            .returning(|| Ok(vec![unbound_machine("m1", "ip-10-0-1-5", t0())]));
        api.expect_list_csrs()
            .returning(move || Ok(vec![listed.clone()]));
        api.expect_approve().never();

        let ctx = context(api, now, ApproverConfig::default());
        let action = reconcile(Arc::new(csr), ctx).await.unwrap();
        assert_eq!(action, Action::await_change());
    }

    #[tokio::test]
    async fn snapshot_failures_propagate_for_requeue() {
        let now = t0();
        let csr = bootstrap_csr("ip-10-0-1-5", now);

        let mut api = MockApproverApi::new();
        api.expect_list_machines()
            .returning(|| Err(Error::transient("machine api unavailable")));
        api.expect_list_csrs().returning(|| Ok(vec![]));
        api.expect_approve().never();

        let ctx = context(api, now, ApproverConfig::default());
        assert!(reconcile(Arc::new(csr), ctx).await.is_err());
    }

    // ==========================================================================
    // Story: Error Policy Cadence
    // ==========================================================================

    #[tokio::test]
    async fn error_policy_requeues_by_disposition() {
        let now = t0();
        let csr = Arc::new(bootstrap_csr("ip-10-0-1-5", now));
        let ctx = context(MockApproverApi::new(), now, ApproverConfig::default());

        let action = error_policy(csr.clone(), &Error::transient("racing node linker"), ctx.clone());
        assert_eq!(action, Action::requeue(REQUEUE_SHORT));

        let action = error_policy(csr, &Error::throttled("backlog over ceiling"), ctx);
        assert_eq!(action, Action::requeue(REQUEUE_BACKLOG));
    }

    #[tokio::test]
    async fn approval_condition_is_stamped_with_the_injected_clock() {
        let condition = approval_condition(&FixedClock(t0()));
        assert_eq!(condition.type_, APPROVED_CONDITION);
        assert_eq!(condition.last_update_time, Some(Time(t0())));
    }
}
