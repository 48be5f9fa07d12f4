//! Public entry point: proposal intake, queries and snapshotting, plus a
//! bounded scheduler that validates accepted proposals in the background.
//!
//! `propose` never waits for validation. Callers poll `is_approved`, or call
//! `wait_idle` when they need every scheduled run to have finished.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::{watch, Semaphore};
use tracing::{info, warn};

use crate::config::Config;
use crate::identity::ModuleId;
use crate::judges::Judges;
use crate::metrics::MetricsSnapshot;
use crate::persistence::{self, PersistenceError};
use crate::pipeline::{ValidationPipeline, ValidationPolicy};
use crate::registry::{
    ModuleEntry, ModuleStatus, Proposal, RegistryError, WhitelistRegistry, DEFAULT_CATEGORY,
};
use crate::signing::{warn_ephemeral, ApprovalSigner, SigningError};

#[derive(Debug, thiserror::Error)]
pub enum GatekeeperError {
    #[error("gatekeeper must be created inside a tokio runtime")]
    NoRuntime,
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("cannot read {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error(transparent)]
    Signing(#[from] SigningError),
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
}

/// Counts from [`Gatekeeper::propose_dir`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub submitted: usize,
    pub duplicates: usize,
    pub failed: usize,
}

impl BatchReport {
    pub fn total(&self) -> usize {
        self.submitted + self.duplicates + self.failed
    }
}

/// Holds the in-flight count up while a scheduled task runs, however it ends.
struct InFlightGuard(Arc<watch::Sender<usize>>);

impl InFlightGuard {
    fn enter(in_flight: &Arc<watch::Sender<usize>>) -> Self {
        in_flight.send_modify(|n| *n += 1);
        Self(Arc::clone(in_flight))
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.send_modify(|n| *n = n.saturating_sub(1));
    }
}

pub struct Gatekeeper {
    registry: Arc<WhitelistRegistry>,
    signer: Arc<ApprovalSigner>,
    pipeline: ValidationPipeline,
    permits: Arc<Semaphore>,
    in_flight: Arc<watch::Sender<usize>>,
    runtime: Handle,
}

impl Gatekeeper {
    /// Create an empty gatekeeper. Must be called from within a tokio runtime;
    /// validation tasks are spawned onto it.
    pub fn new(
        signer: ApprovalSigner,
        judges: Judges,
        policy: ValidationPolicy,
        max_concurrent_validations: usize,
    ) -> Result<Self, GatekeeperError> {
        if max_concurrent_validations == 0 {
            return Err(GatekeeperError::Config(
                "max_concurrent_validations must be at least 1".to_string(),
            ));
        }
        let runtime = Handle::try_current().map_err(|_| GatekeeperError::NoRuntime)?;

        let registry = Arc::new(WhitelistRegistry::default());
        let signer = Arc::new(signer);
        let pipeline =
            ValidationPipeline::new(Arc::clone(&registry), Arc::clone(&signer), judges, policy);

        info!(
            public_key = %signer.public_key_hex(),
            passes = policy.required_sandbox_passes,
            max_concurrent = max_concurrent_validations,
            "gatekeeper initialized"
        );

        Ok(Self {
            registry,
            signer,
            pipeline,
            permits: Arc::new(Semaphore::new(max_concurrent_validations)),
            in_flight: Arc::new(watch::channel(0).0),
            runtime,
        })
    }

    /// Build from configuration, loading or creating the approval key.
    pub fn from_config(config: &Config, judges: Judges) -> Result<Self, GatekeeperError> {
        config.validate().map_err(GatekeeperError::Config)?;

        let signer = match &config.signer.key_path {
            Some(path) => ApprovalSigner::load_or_create(path)?,
            None => {
                let signer = ApprovalSigner::generate();
                warn_ephemeral(&signer);
                signer
            }
        };

        Self::new(
            signer,
            judges,
            ValidationPolicy::from(&config.policy),
            config.pipeline.max_concurrent_validations,
        )
    }

    /// Register `content` and, if it is new, schedule its validation.
    pub fn propose(&self, content: &[u8], proposer_id: &str) -> Proposal {
        self.propose_with_category(content, proposer_id, DEFAULT_CATEGORY)
    }

    /// Like [`propose`](Self::propose), recording a submission category.
    pub fn propose_with_category(&self, content: &[u8], proposer_id: &str, category: &str) -> Proposal {
        let proposal = self
            .registry
            .propose_with_category(content, proposer_id, category);
        if let Proposal::Accepted(module_id) = &proposal {
            self.schedule(module_id.clone());
        }
        proposal
    }

    /// Propose every regular file directly inside `dir`, in path order.
    /// Subdirectories are skipped. A file that cannot be read is counted as
    /// failed and the batch carries on.
    pub fn propose_dir(
        &self,
        dir: &Path,
        proposer_id: &str,
        category: &str,
    ) -> Result<BatchReport, GatekeeperError> {
        let read_dir = fs::read_dir(dir).map_err(|source| GatekeeperError::Io {
            path: dir.to_path_buf(),
            source,
        })?;

        let mut report = BatchReport::default();
        let mut paths = Vec::new();
        for entry in read_dir {
            match entry {
                Ok(entry) => paths.push(entry.path()),
                Err(e) => {
                    report.failed += 1;
                    warn!(dir = %dir.display(), error = %e, "unreadable directory entry");
                }
            }
        }
        paths.sort();

        for path in paths {
            let content = match fs::metadata(&path) {
                Ok(meta) if !meta.is_file() => continue,
                Ok(_) => fs::read(&path),
                Err(e) => Err(e),
            };
            match content {
                Ok(content) => match self.propose_with_category(&content, proposer_id, category) {
                    Proposal::Accepted(_) => report.submitted += 1,
                    Proposal::Duplicate(_) => report.duplicates += 1,
                },
                Err(e) => {
                    report.failed += 1;
                    warn!(path = %path.display(), error = %e, "submission failed");
                }
            }
        }

        info!(
            dir = %dir.display(),
            submitted = report.submitted,
            duplicates = report.duplicates,
            failed = report.failed,
            "directory submitted"
        );
        Ok(report)
    }

    pub fn is_approved(&self, module_id: &ModuleId) -> bool {
        self.registry.is_approved(module_id)
    }

    pub fn revoke(&self, module_id: &ModuleId) -> bool {
        self.registry.revoke(module_id)
    }

    pub fn get(&self, module_id: &ModuleId) -> Option<ModuleEntry> {
        self.registry.get(module_id)
    }

    pub fn list(&self, status: Option<ModuleStatus>) -> Vec<ModuleEntry> {
        self.registry.list(status)
    }

    /// Counters since this gatekeeper was created. They live in memory only
    /// and are not part of the snapshot.
    pub fn metrics(&self) -> MetricsSnapshot {
        self.registry.metrics().snapshot()
    }

    pub fn public_key_hex(&self) -> String {
        self.signer.public_key_hex()
    }

    /// Schedule validation for every pending module nobody is validating,
    /// typically right after `load_registry`. Returns how many were scheduled.
    pub fn resume_pending(&self) -> usize {
        let pending = self.registry.unclaimed_pending();
        let count = pending.len();
        for module_id in pending {
            self.schedule(module_id);
        }
        if count > 0 {
            info!(count, "resumed pending validations");
        }
        count
    }

    /// Wait until every scheduled validation has finished.
    pub async fn wait_idle(&self) {
        let mut rx = self.in_flight.subscribe();
        // The sender lives in `self`, so the channel cannot close while we wait.
        let _ = rx.wait_for(|n| *n == 0).await;
    }

    /// Write the registry to `path`. The in-memory registry is unaffected by
    /// a failed save.
    pub fn save_registry(&self, path: &Path) -> Result<(), GatekeeperError> {
        let records = self.registry.export();
        match persistence::save(&records, &self.signer.public_key_hex(), path) {
            Ok(()) => {
                self.registry.metrics().record_snapshot_saved();
                Ok(())
            }
            Err(e) => {
                self.registry.metrics().record_snapshot_failure();
                warn!(path = %path.display(), error = %e, "snapshot save failed");
                Err(e.into())
            }
        }
    }

    /// Replace the registry with the snapshot at `path`. Nothing changes if
    /// the snapshot fails verification.
    pub fn load_registry(&self, path: &Path) -> Result<usize, GatekeeperError> {
        let records = match persistence::load(path, &self.signer) {
            Ok(records) => records,
            Err(e) => {
                if matches!(e, PersistenceError::IntegrityViolation(_)) {
                    self.registry.metrics().record_integrity_violation();
                } else {
                    self.registry.metrics().record_snapshot_failure();
                }
                warn!(path = %path.display(), error = %e, "snapshot load failed");
                return Err(e.into());
            }
        };

        let count = self.registry.restore(records)?;
        self.registry.metrics().record_snapshot_loaded();
        Ok(count)
    }

    fn schedule(&self, module_id: ModuleId) {
        let guard = InFlightGuard::enter(&self.in_flight);
        let pipeline = self.pipeline.clone();
        let permits = Arc::clone(&self.permits);

        self.runtime.spawn(async move {
            let _guard = guard;
            let Ok(_permit) = permits.acquire_owned().await else {
                return;
            };
            if let Err(e) = pipeline.run(&module_id).await {
                warn!(module_id = %module_id, error = %e, "validation run rejected");
            }
        });
    }
}
