//! Pending-CSR backlog accounting.
//!
//! A misbehaving approver (or a flood of rogue CSRs) must not be able to
//! drag the whole signing pipeline along with it. Each reconciliation pass
//! counts the recently-created, not-yet-approved CSRs; above the ceiling the
//! pass stops approving and leaves everything pending. Nothing is ever
//! denied on backlog grounds.

use std::sync::atomic::{AtomicU32, Ordering};

use k8s_openapi::api::certificates::v1::CertificateSigningRequest;

use crate::clock::Clock;
use crate::{MAX_CLOCK_SKEW, MAX_PENDING_CSR_AGE};

/// Condition type marking an approved CSR
pub const APPROVED_CONDITION: &str = "Approved";

/// Backlog gauges observed by telemetry.
///
/// Written once per reconciliation pass, read concurrently by observers for
/// the process lifetime. No coordinated snapshot across the pair is
/// required, so a single atomic word per counter suffices.
#[derive(Debug, Default)]
pub struct BacklogGauges {
    pending: AtomicU32,
    ceiling: AtomicU32,
}

impl BacklogGauges {
    /// Record the backlog observed by this reconciliation pass.
    pub fn record(&self, pending: u32, ceiling: u32) {
        self.pending.store(pending, Ordering::Relaxed);
        self.ceiling.store(ceiling, Ordering::Relaxed);
    }

    /// The last recorded `(pending, ceiling)` pair.
    pub fn snapshot(&self) -> (u32, u32) {
        (
            self.pending.load(Ordering::Relaxed),
            self.ceiling.load(Ordering::Relaxed),
        )
    }
}

/// Whether the CSR carries an Approved condition.
pub fn is_approved(csr: &CertificateSigningRequest) -> bool {
    csr.status
        .as_ref()
        .and_then(|status| status.conditions.as_ref())
        .is_some_and(|conditions| {
            conditions
                .iter()
                .any(|condition| condition.type_ == APPROVED_CONDITION)
        })
}

/// Count CSRs created within the recent window and not yet approved.
///
/// The window excludes stale requests (older than an hour) and tolerates
/// API-server clocks slightly ahead of ours. CSRs without a creation
/// timestamp never count.
pub fn recently_pending_csrs(csrs: &[CertificateSigningRequest], clock: &dyn Clock) -> usize {
    let now = clock.now();
    let start = now - MAX_PENDING_CSR_AGE;
    let end = now + MAX_CLOCK_SKEW;

    csrs.iter()
        .filter(|csr| {
            csr.metadata
                .creation_timestamp
                .as_ref()
                .is_some_and(|created| created.0 > start && created.0 < end)
        })
        .filter(|csr| !is_approved(csr))
        .count()
}
