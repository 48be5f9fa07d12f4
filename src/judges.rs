//! External judges consulted during validation.
//!
//! The gatekeeper does not know how sandboxing, ethical scoring or impact
//! assessment work; it only relies on the score ranges and failure semantics
//! declared here. A judge that cannot produce an answer (crash, timeout, bad
//! score) returns a [`JudgeError`], which the pipeline turns into a restriction.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use crate::identity::ModuleId;

#[derive(Debug, Clone, thiserror::Error, PartialEq)]
pub enum JudgeError {
    #[error("judge failed: {0}")]
    Failed(String),
    #[error("judge timed out after {0:?}")]
    Timeout(Duration),
    #[error("{judge} returned score {score} outside [0, 1]")]
    ScoreOutOfRange { judge: &'static str, score: f64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SandboxStatus {
    Success,
    Failure,
}

/// Result of one sandbox pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SandboxReport {
    pub status: SandboxStatus,
    pub detail: String,
}

impl SandboxReport {
    pub fn success(detail: impl Into<String>) -> Self {
        Self {
            status: SandboxStatus::Success,
            detail: detail.into(),
        }
    }

    pub fn failure(detail: impl Into<String>) -> Self {
        Self {
            status: SandboxStatus::Failure,
            detail: detail.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == SandboxStatus::Success
    }
}

/// Ethical review verdict.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EthicalReview {
    /// Risk in `[0, 1]`; higher is riskier.
    pub risk_score: f64,
}

/// Executes a candidate module in isolation. May be called several times per
/// validation run and concurrently for different modules.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SandboxExecutor: Send + Sync {
    async fn execute(&self, module_id: &ModuleId, source: &[u8])
        -> Result<SandboxReport, JudgeError>;
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait EthicalReviewer: Send + Sync {
    async fn review(
        &self,
        module_id: &ModuleId,
        sandbox_results: &[SandboxReport],
    ) -> Result<EthicalReview, JudgeError>;
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ImpactAssessor: Send + Sync {
    /// Trust/impact score in `[0, 1]`; higher is better.
    async fn assess(
        &self,
        module_id: &ModuleId,
        sandbox_results: &[SandboxReport],
    ) -> Result<f64, JudgeError>;
}

/// The three judges a validation run consults.
#[derive(Clone)]
pub struct Judges {
    pub sandbox: Arc<dyn SandboxExecutor>,
    pub reviewer: Arc<dyn EthicalReviewer>,
    pub assessor: Arc<dyn ImpactAssessor>,
}

/// Reject NaN and anything outside `[0, 1]`.
pub fn check_score(judge: &'static str, score: f64) -> Result<f64, JudgeError> {
    if (0.0..=1.0).contains(&score) {
        Ok(score)
    } else {
        Err(JudgeError::ScoreOutOfRange { judge, score })
    }
}

/// Reviewer that returns a fixed risk score.
#[derive(Debug, Clone)]
pub struct StaticReviewer {
    risk_score: f64,
}

impl StaticReviewer {
    pub fn new(risk_score: f64) -> Self {
        Self { risk_score }
    }
}

#[async_trait]
impl EthicalReviewer for StaticReviewer {
    async fn review(
        &self,
        _module_id: &ModuleId,
        _sandbox_results: &[SandboxReport],
    ) -> Result<EthicalReview, JudgeError> {
        Ok(EthicalReview {
            risk_score: self.risk_score,
        })
    }
}

/// Assessor that returns a fixed impact score.
#[derive(Debug, Clone)]
pub struct StaticAssessor {
    impact_score: f64,
}

impl StaticAssessor {
    pub fn new(impact_score: f64) -> Self {
        Self { impact_score }
    }
}

#[async_trait]
impl ImpactAssessor for StaticAssessor {
    async fn assess(
        &self,
        _module_id: &ModuleId,
        _sandbox_results: &[SandboxReport],
    ) -> Result<f64, JudgeError> {
        Ok(self.impact_score)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::derive_id;

    #[test]
    fn test_check_score_bounds() {
        assert_eq!(check_score("risk", 0.0), Ok(0.0));
        assert_eq!(check_score("risk", 1.0), Ok(1.0));
        assert!(check_score("risk", -0.01).is_err());
        assert!(check_score("risk", 1.01).is_err());
        assert!(check_score("risk", f64::NAN).is_err());
        assert!(check_score("risk", f64::INFINITY).is_err());
    }

    #[test]
    fn test_sandbox_report_helpers() {
        assert!(SandboxReport::success("ok").is_success());
        assert!(!SandboxReport::failure("boom").is_success());
    }

    #[test]
    fn test_sandbox_report_serialization() {
        let json = serde_json::to_string(&SandboxReport::failure("exit 1")).unwrap();
        assert_eq!(json, r#"{"status":"failure","detail":"exit 1"}"#);
    }

    #[tokio::test]
    async fn test_static_judges() {
        let id = derive_id(b"x");
        let review = StaticReviewer::new(0.1).review(&id, &[]).await.unwrap();
        assert_eq!(review.risk_score, 0.1);
        let impact = StaticAssessor::new(0.9).assess(&id, &[]).await.unwrap();
        assert_eq!(impact, 0.9);
    }
}
