//! Validation pipeline: one run per module, three ordered phases.
//!
//! 1. `required_sandbox_passes` sandbox executions, stopping at the first failure
//! 2. ethical review of the sandbox reports
//! 3. impact assessment of the same reports
//!
//! Approval needs every pass to succeed, risk at or below `max_ethical_risk`
//! and impact at or above `min_trust_score`. Anything else, judge errors and
//! panics included, restricts the module.

use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::PolicyConfig;
use crate::identity::ModuleId;
use crate::judges::{check_score, JudgeError, Judges, SandboxReport};
use crate::registry::{ModuleEntry, Outcome, RegistryError, ValidationClaim, WhitelistRegistry};
use crate::signing::ApprovalSigner;

/// Approval thresholds applied by the pipeline.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ValidationPolicy {
    pub required_sandbox_passes: u32,
    pub max_ethical_risk: f64,
    pub min_trust_score: f64,
}

impl Default for ValidationPolicy {
    fn default() -> Self {
        Self::from(&PolicyConfig::default())
    }
}

impl From<&PolicyConfig> for ValidationPolicy {
    fn from(config: &PolicyConfig) -> Self {
        Self {
            required_sandbox_passes: config.required_sandbox_passes,
            max_ethical_risk: config.max_ethical_risk,
            min_trust_score: config.min_trust_score,
        }
    }
}

/// How a call to [`ValidationPipeline::run`] ended.
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    /// Another run owns the module, or it is no longer pending.
    Skipped,
    Approved(ModuleEntry),
    Restricted(ModuleEntry),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Sandbox,
    EthicalReview,
    ImpactAssessment,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Sandbox => write!(f, "sandbox"),
            Phase::EthicalReview => write!(f, "ethical_review"),
            Phase::ImpactAssessment => write!(f, "impact_assessment"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("{phase} phase failed: {source}")]
struct PhaseError {
    phase: Phase,
    source: JudgeError,
}

fn in_phase(phase: Phase) -> impl FnOnce(JudgeError) -> PhaseError {
    move |source| PhaseError { phase, source }
}

enum Verdict {
    Approve,
    Restrict(String),
}

/// Owns the claim for the lifetime of one run. Dropping it closes the run in
/// the metrics and hands back a claim the run never finalized, which is what
/// happens when the run's future is cancelled mid-judge.
struct RunGuard {
    registry: Arc<WhitelistRegistry>,
    claim: ValidationClaim,
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        if self.registry.release(&self.claim) {
            warn!(
                run_id = %self.claim.token(),
                module_id = %self.claim.module_id(),
                "validation abandoned before a decision; claim released"
            );
        }
        self.registry.metrics().record_validation_finished();
    }
}

/// Drives validation runs against a shared registry.
#[derive(Clone)]
pub struct ValidationPipeline {
    registry: Arc<WhitelistRegistry>,
    signer: Arc<ApprovalSigner>,
    judges: Judges,
    policy: ValidationPolicy,
}

impl ValidationPipeline {
    pub fn new(
        registry: Arc<WhitelistRegistry>,
        signer: Arc<ApprovalSigner>,
        judges: Judges,
        policy: ValidationPolicy,
    ) -> Self {
        Self {
            registry,
            signer,
            judges,
            policy,
        }
    }

    pub fn policy(&self) -> &ValidationPolicy {
        &self.policy
    }

    /// Claim `module_id` and run it to a terminal status.
    ///
    /// Returns `Ok(RunOutcome::Skipped)` without touching any judge when the
    /// claim fails. An `Err` means the final write was rejected, which happens
    /// when a restored registry already decided the module.
    ///
    /// Dropping the returned future releases the claim, so the module can be
    /// picked up again by `resume_pending`.
    pub async fn run(&self, module_id: &ModuleId) -> Result<RunOutcome, RegistryError> {
        let Some(claim) = self.registry.try_begin_validation(module_id) else {
            return Ok(RunOutcome::Skipped);
        };

        let run_id = claim.token();
        let guard = RunGuard {
            registry: Arc::clone(&self.registry),
            claim,
        };
        info!(run_id = %run_id, module_id = %module_id, "validation started");
        let result = self.validate_claimed(&guard.claim).await;
        drop(guard);

        match &result {
            Ok(RunOutcome::Approved(_)) => {
                info!(run_id = %run_id, module_id = %module_id, "validation finished: approved")
            }
            Ok(_) => {
                info!(run_id = %run_id, module_id = %module_id, "validation finished: restricted")
            }
            Err(e) => {
                warn!(run_id = %run_id, module_id = %module_id, error = %e, "validation result discarded")
            }
        }
        result
    }

    async fn validate_claimed(&self, claim: &ValidationClaim) -> Result<RunOutcome, RegistryError> {
        let module_id = claim.module_id();
        let run_id = claim.token();
        let entry = self
            .registry
            .get(module_id)
            .ok_or_else(|| RegistryError::UnknownModule(module_id.clone()))?;

        let verdict = match self.registry.source(module_id) {
            Some(source) => self.judge_isolated(module_id, source, run_id).await,
            None => Verdict::Restrict("module source unavailable".to_string()),
        };

        let outcome = match verdict {
            Verdict::Approve => Outcome::Approved(self.signer.sign(&entry.content_hash)),
            Verdict::Restrict(reason) => Outcome::Restricted(reason),
        };

        let entry = self.registry.finalize(claim, outcome)?;
        if entry.signatures.is_empty() {
            Ok(RunOutcome::Restricted(entry))
        } else {
            Ok(RunOutcome::Approved(entry))
        }
    }

    /// Run the judge phases in their own task so a panicking judge still
    /// resolves to a restriction.
    async fn judge_isolated(&self, module_id: &ModuleId, source: Arc<[u8]>, run_id: Uuid) -> Verdict {
        let pipeline = self.clone();
        let task_id = module_id.clone();
        let handle =
            tokio::spawn(async move { pipeline.judge(&task_id, &source, run_id).await });

        match handle.await {
            Ok(Ok(verdict)) => verdict,
            Ok(Err(e)) => {
                self.registry.metrics().record_judge_failure();
                warn!(
                    run_id = %run_id,
                    module_id = %module_id,
                    phase = %e.phase,
                    reason = %e.source,
                    "judge failure"
                );
                Verdict::Restrict(e.to_string())
            }
            Err(e) => {
                self.registry.metrics().record_judge_failure();
                warn!(run_id = %run_id, module_id = %module_id, error = %e, "judge task aborted");
                Verdict::Restrict(format!("judge task aborted: {}", e))
            }
        }
    }

    async fn judge(
        &self,
        module_id: &ModuleId,
        source: &[u8],
        run_id: Uuid,
    ) -> Result<Verdict, PhaseError> {
        let passes = self.policy.required_sandbox_passes;
        let mut reports: Vec<SandboxReport> = Vec::with_capacity(passes as usize);

        for pass in 1..=passes {
            let report = self
                .judges
                .sandbox
                .execute(module_id, source)
                .await
                .map_err(in_phase(Phase::Sandbox))?;
            debug!(run_id = %run_id, pass, status = ?report.status, "sandbox pass finished");

            if !report.is_success() {
                return Ok(Verdict::Restrict(format!(
                    "sandbox pass {}/{} failed: {}",
                    pass, passes, report.detail
                )));
            }
            reports.push(report);
        }

        let review = self
            .judges
            .reviewer
            .review(module_id, &reports)
            .await
            .and_then(|r| check_score("ethical_reviewer", r.risk_score))
            .map_err(in_phase(Phase::EthicalReview))?;
        debug!(run_id = %run_id, risk = review, "ethical review finished");

        if review > self.policy.max_ethical_risk {
            return Ok(Verdict::Restrict(format!(
                "ethical risk {:.3} exceeds {:.3}",
                review, self.policy.max_ethical_risk
            )));
        }

        let impact = self
            .judges
            .assessor
            .assess(module_id, &reports)
            .await
            .and_then(|score| check_score("impact_assessor", score))
            .map_err(in_phase(Phase::ImpactAssessment))?;
        debug!(run_id = %run_id, impact, "impact assessment finished");

        if impact < self.policy.min_trust_score {
            return Ok(Verdict::Restrict(format!(
                "impact score {:.3} below {:.3}",
                impact, self.policy.min_trust_score
            )));
        }

        Ok(Verdict::Approve)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::judges::{
        EthicalReview, EthicalReviewer, MockEthicalReviewer, MockImpactAssessor,
        MockSandboxExecutor, SandboxExecutor,
    };
    use crate::registry::{ModuleStatus, RegistryRecord};
    use async_trait::async_trait;
    use mockall::Sequence;
    use std::time::Duration;

    const SOURCE: &[u8] = b"def f(): pass";

    fn passing_sandbox(times: usize) -> MockSandboxExecutor {
        let mut sandbox = MockSandboxExecutor::new();
        sandbox
            .expect_execute()
            .times(times)
            .returning(|_, _| Ok(SandboxReport::success("exit 0")));
        sandbox
    }

    fn reviewer(risk: f64) -> MockEthicalReviewer {
        let mut reviewer = MockEthicalReviewer::new();
        reviewer
            .expect_review()
            .returning(move |_, _| Ok(EthicalReview { risk_score: risk }));
        reviewer
    }

    fn assessor(impact: f64) -> MockImpactAssessor {
        let mut assessor = MockImpactAssessor::new();
        assessor.expect_assess().returning(move |_, _| Ok(impact));
        assessor
    }

    fn pipeline(
        sandbox: MockSandboxExecutor,
        reviewer: impl EthicalReviewer + 'static,
        assessor: MockImpactAssessor,
    ) -> ValidationPipeline {
        ValidationPipeline::new(
            Arc::new(WhitelistRegistry::default()),
            Arc::new(ApprovalSigner::generate()),
            Judges {
                sandbox: Arc::new(sandbox),
                reviewer: Arc::new(reviewer),
                assessor: Arc::new(assessor),
            },
            ValidationPolicy::default(),
        )
    }

    fn restriction_reason(outcome: RunOutcome) -> String {
        match outcome {
            RunOutcome::Restricted(entry) => entry.restriction_reason.unwrap_or_default(),
            other => panic!("expected restriction, got {:?}", other),
        }
    }

    #[test]
    fn test_default_policy() {
        let policy = ValidationPolicy::default();
        assert_eq!(policy.required_sandbox_passes, 3);
        assert_eq!(policy.max_ethical_risk, 0.2);
        assert_eq!(policy.min_trust_score, 0.85);
    }

    #[tokio::test]
    async fn test_all_phases_pass_approves() {
        let p = pipeline(passing_sandbox(3), reviewer(0.1), assessor(0.9));
        let id = p.registry.propose(SOURCE, "dev").module_id().clone();

        let outcome = p.run(&id).await.unwrap();
        let entry = match outcome {
            RunOutcome::Approved(entry) => entry,
            other => panic!("expected approval, got {:?}", other),
        };
        assert_eq!(entry.status, ModuleStatus::Approved);
        assert_eq!(entry.signatures.len(), 1);
        assert!(p.signer.verify(&entry.signatures[0], &entry.content_hash));
        assert!(p.registry.is_approved(&id));

        let snap = p.registry.metrics().snapshot();
        assert_eq!(snap.approvals, 1);
        assert_eq!(snap.validations_in_flight, 0);
    }

    #[tokio::test]
    async fn test_second_pass_failure_stops_sandbox() {
        let mut sandbox = MockSandboxExecutor::new();
        let mut seq = Sequence::new();
        sandbox
            .expect_execute()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(SandboxReport::success("exit 0")));
        sandbox
            .expect_execute()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| Ok(SandboxReport::failure("exit 1: boom")));

        let p = pipeline(sandbox, reviewer(0.0), assessor(1.0));
        let id = p.registry.propose(SOURCE, "dev").module_id().clone();

        let reason = restriction_reason(p.run(&id).await.unwrap());
        assert!(reason.starts_with("sandbox pass 2/3 failed"), "{}", reason);
        assert!(!p.registry.is_approved(&id));
        assert_eq!(p.registry.metrics().snapshot().judge_failures, 0);
    }

    #[tokio::test]
    async fn test_high_risk_restricts_before_impact() {
        let mut impact = MockImpactAssessor::new();
        impact.expect_assess().never();

        let p = pipeline(passing_sandbox(3), reviewer(0.5), impact);
        let id = p.registry.propose(SOURCE, "dev").module_id().clone();

        let reason = restriction_reason(p.run(&id).await.unwrap());
        assert!(reason.starts_with("ethical risk"), "{}", reason);
    }

    #[tokio::test]
    async fn test_risk_at_threshold_is_accepted() {
        let p = pipeline(passing_sandbox(3), reviewer(0.2), assessor(0.85));
        let id = p.registry.propose(SOURCE, "dev").module_id().clone();
        assert!(matches!(p.run(&id).await.unwrap(), RunOutcome::Approved(_)));
    }

    #[tokio::test]
    async fn test_low_impact_restricts() {
        let p = pipeline(passing_sandbox(3), reviewer(0.1), assessor(0.84));
        let id = p.registry.propose(SOURCE, "dev").module_id().clone();

        let reason = restriction_reason(p.run(&id).await.unwrap());
        assert!(reason.starts_with("impact score"), "{}", reason);
        assert!(p.registry.get(&id).unwrap().signatures.is_empty());
    }

    #[tokio::test]
    async fn test_sandbox_error_is_judge_failure() {
        let mut sandbox = MockSandboxExecutor::new();
        sandbox
            .expect_execute()
            .times(1)
            .returning(|_, _| Err(JudgeError::Timeout(Duration::from_secs(10))));

        let p = pipeline(sandbox, reviewer(0.0), assessor(1.0));
        let id = p.registry.propose(SOURCE, "dev").module_id().clone();

        let reason = restriction_reason(p.run(&id).await.unwrap());
        assert!(reason.starts_with("sandbox phase failed"), "{}", reason);
        assert_eq!(p.registry.metrics().snapshot().judge_failures, 1);
    }

    #[tokio::test]
    async fn test_out_of_range_score_is_judge_failure() {
        let p = pipeline(passing_sandbox(3), reviewer(0.1), assessor(f64::NAN));
        let id = p.registry.propose(SOURCE, "dev").module_id().clone();

        let reason = restriction_reason(p.run(&id).await.unwrap());
        assert!(reason.starts_with("impact_assessment phase failed"), "{}", reason);
        assert_eq!(p.registry.metrics().snapshot().judge_failures, 1);
    }

    struct PanickingReviewer;

    #[async_trait]
    impl EthicalReviewer for PanickingReviewer {
        async fn review(
            &self,
            _module_id: &ModuleId,
            _sandbox_results: &[SandboxReport],
        ) -> Result<EthicalReview, JudgeError> {
            panic!("reviewer crashed");
        }
    }

    #[tokio::test]
    async fn test_panicking_judge_restricts() {
        let mut impact = MockImpactAssessor::new();
        impact.expect_assess().never();

        let p = pipeline(passing_sandbox(3), PanickingReviewer, impact);
        let id = p.registry.propose(SOURCE, "dev").module_id().clone();

        let reason = restriction_reason(p.run(&id).await.unwrap());
        assert!(reason.starts_with("judge task aborted"), "{}", reason);
        assert_eq!(p.registry.get(&id).unwrap().status, ModuleStatus::Restricted);
    }

    #[tokio::test]
    async fn test_claimed_module_is_skipped() {
        let mut sandbox = MockSandboxExecutor::new();
        sandbox.expect_execute().never();

        let p = pipeline(sandbox, reviewer(0.0), assessor(1.0));
        let id = p.registry.propose(SOURCE, "dev").module_id().clone();
        let _claim = p.registry.try_begin_validation(&id).unwrap();

        assert_eq!(p.run(&id).await.unwrap(), RunOutcome::Skipped);
        assert_eq!(p.registry.get(&id).unwrap().status, ModuleStatus::Pending);
    }

    #[tokio::test]
    async fn test_finished_module_is_skipped() {
        let p = pipeline(passing_sandbox(3), reviewer(0.1), assessor(0.9));
        let id = p.registry.propose(SOURCE, "dev").module_id().clone();
        p.run(&id).await.unwrap();

        assert_eq!(p.run(&id).await.unwrap(), RunOutcome::Skipped);
        assert_eq!(p.registry.metrics().snapshot().validations_skipped, 1);
    }

    #[tokio::test]
    async fn test_missing_source_restricts() {
        let mut sandbox = MockSandboxExecutor::new();
        sandbox.expect_execute().never();

        let p = pipeline(sandbox, reviewer(0.0), assessor(1.0));
        let id = p.registry.propose(SOURCE, "dev").module_id().clone();
        let records: Vec<RegistryRecord> = p
            .registry
            .export()
            .into_iter()
            .map(|r| RegistryRecord {
                entry: r.entry,
                source: None,
            })
            .collect();
        p.registry.restore(records).unwrap();

        let reason = restriction_reason(p.run(&id).await.unwrap());
        assert_eq!(reason, "module source unavailable");
    }

    /// Sandbox whose executions never complete.
    struct HangingSandbox;

    #[async_trait]
    impl SandboxExecutor for HangingSandbox {
        async fn execute(
            &self,
            _module_id: &ModuleId,
            _source: &[u8],
        ) -> Result<SandboxReport, JudgeError> {
            std::future::pending().await
        }
    }

    #[tokio::test]
    async fn test_cancelled_run_releases_claim() {
        let p = ValidationPipeline::new(
            Arc::new(WhitelistRegistry::default()),
            Arc::new(ApprovalSigner::generate()),
            Judges {
                sandbox: Arc::new(HangingSandbox),
                reviewer: Arc::new(reviewer(0.0)),
                assessor: Arc::new(assessor(1.0)),
            },
            ValidationPolicy::default(),
        );
        let id = p.registry.propose(SOURCE, "dev").module_id().clone();

        let cancelled = tokio::time::timeout(Duration::from_millis(20), p.run(&id)).await;
        assert!(cancelled.is_err());

        assert_eq!(p.registry.unclaimed_pending(), vec![id.clone()]);
        assert_eq!(p.registry.get(&id).unwrap().status, ModuleStatus::Pending);
        let snap = p.registry.metrics().snapshot();
        assert_eq!(snap.validations_started, 1);
        assert_eq!(snap.validations_in_flight, 0);

        // The released module can be claimed again.
        assert!(p.registry.try_begin_validation(&id).is_some());
    }
}
