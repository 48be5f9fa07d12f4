use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Audit counters for the gatekeeper. Every field is independently safe for
/// concurrent increment; none of them is coordinated with the registry lock.
#[derive(Debug, Default)]
pub struct AuditMetrics {
    proposals_accepted: AtomicU64,
    proposals_duplicate: AtomicU64,
    validations_started: AtomicU64,
    validations_skipped: AtomicU64,
    validations_in_flight: AtomicU64,
    approvals: AtomicU64,
    restrictions: AtomicU64,
    judge_failures: AtomicU64,
    revocations: AtomicU64,
    revocations_rejected: AtomicU64,
    invalid_transitions: AtomicU64,
    snapshots_saved: AtomicU64,
    snapshot_failures: AtomicU64,
    snapshots_loaded: AtomicU64,
    integrity_violations: AtomicU64,
}

/// Point-in-time copy of [`AuditMetrics`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub proposals_accepted: u64,
    pub proposals_duplicate: u64,
    pub validations_started: u64,
    pub validations_skipped: u64,
    pub validations_in_flight: u64,
    pub approvals: u64,
    pub restrictions: u64,
    pub judge_failures: u64,
    pub revocations: u64,
    pub revocations_rejected: u64,
    pub invalid_transitions: u64,
    pub snapshots_saved: u64,
    pub snapshot_failures: u64,
    pub snapshots_loaded: u64,
    pub integrity_violations: u64,
}

fn inc(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

impl AuditMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_proposal(&self) {
        inc(&self.proposals_accepted);
    }

    pub fn record_duplicate(&self) {
        inc(&self.proposals_duplicate);
    }

    /// A validation run claimed its module; bumps the in-flight gauge.
    pub fn record_validation_started(&self) {
        inc(&self.validations_started);
        inc(&self.validations_in_flight);
    }

    pub fn record_validation_skipped(&self) {
        inc(&self.validations_skipped);
    }

    /// A claimed run reached its terminal write (or failed to).
    pub fn record_validation_finished(&self) {
        let _ = self
            .validations_in_flight
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
                Some(v.saturating_sub(1))
            });
    }

    pub fn record_approval(&self) {
        inc(&self.approvals);
    }

    pub fn record_restriction(&self) {
        inc(&self.restrictions);
    }

    pub fn record_judge_failure(&self) {
        inc(&self.judge_failures);
    }

    pub fn record_revocation(&self) {
        inc(&self.revocations);
    }

    pub fn record_revocation_rejected(&self) {
        inc(&self.revocations_rejected);
    }

    pub fn record_invalid_transition(&self) {
        inc(&self.invalid_transitions);
    }

    pub fn record_snapshot_saved(&self) {
        inc(&self.snapshots_saved);
    }

    pub fn record_snapshot_failure(&self) {
        inc(&self.snapshot_failures);
    }

    pub fn record_snapshot_loaded(&self) {
        inc(&self.snapshots_loaded);
    }

    pub fn record_integrity_violation(&self) {
        inc(&self.integrity_violations);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        MetricsSnapshot {
            proposals_accepted: load(&self.proposals_accepted),
            proposals_duplicate: load(&self.proposals_duplicate),
            validations_started: load(&self.validations_started),
            validations_skipped: load(&self.validations_skipped),
            validations_in_flight: load(&self.validations_in_flight),
            approvals: load(&self.approvals),
            restrictions: load(&self.restrictions),
            judge_failures: load(&self.judge_failures),
            revocations: load(&self.revocations),
            revocations_rejected: load(&self.revocations_rejected),
            invalid_transitions: load(&self.invalid_transitions),
            snapshots_saved: load(&self.snapshots_saved),
            snapshot_failures: load(&self.snapshot_failures),
            snapshots_loaded: load(&self.snapshots_loaded),
            integrity_violations: load(&self.integrity_violations),
        }
    }
}

impl MetricsSnapshot {
    /// Share of finished validations that ended approved, as a percentage.
    pub fn approval_rate(&self) -> f64 {
        let decided = self.approvals + self.restrictions;
        if decided == 0 {
            return 0.0;
        }
        (self.approvals as f64 / decided as f64) * 100.0
    }
}
