//! Whitelist registry: the shared store of module entries and their lifecycle.
//!
//! State machine:
//! ```text
//! pending --(approve)--> approved --(revoke)--> revoked
//! pending --(restrict)--> restricted
//! ```
//! `restricted` and `revoked` are terminal. Nothing ever re-enters `pending`, and
//! entries are never removed.
//!
//! Every mutation is a short critical section under one registry-wide lock. The
//! lock is never held across judge or signer calls; the pipeline only takes it to
//! claim a module and to write the final outcome.
//!
//! A claim is a token, not a flag. Only the holder of the current token can
//! finalize or release a module, so a run that outlives a `restore` cannot
//! write over a run that started after it.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::identity::{derive_hash, derive_id, ContentHash, ModuleId};
use crate::metrics::AuditMetrics;

/// Category recorded when a submission does not name one.
pub const DEFAULT_CATEGORY: &str = "idea";

fn default_category() -> String {
    DEFAULT_CATEGORY.to_string()
}

/// Lifecycle status of a module entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModuleStatus {
    Pending,
    Approved,
    Restricted,
    Revoked,
}

impl ModuleStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, ModuleStatus::Restricted | ModuleStatus::Revoked)
    }
}

impl fmt::Display for ModuleStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Approved => write!(f, "approved"),
            Self::Restricted => write!(f, "restricted"),
            Self::Revoked => write!(f, "revoked"),
        }
    }
}

impl FromStr for ModuleStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pending" => Ok(Self::Pending),
            "approved" => Ok(Self::Approved),
            "restricted" => Ok(Self::Restricted),
            "revoked" => Ok(Self::Revoked),
            other => Err(format!("unknown module status: {}", other)),
        }
    }
}

/// The unit of trust tracking.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleEntry {
    pub module_id: ModuleId,
    pub content_hash: ContentHash,
    pub status: ModuleStatus,
    /// Approval attestations. Non-empty iff `status == Approved`.
    #[serde(default)]
    pub signatures: Vec<String>,
    #[serde(default)]
    pub proposer_id: String,
    /// Free-form submission category, e.g. `idea` or `module_prototype`.
    #[serde(default = "default_category")]
    pub category: String,
    pub first_proposed: DateTime<Utc>,
    pub last_validated: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restriction_reason: Option<String>,
}

impl ModuleEntry {
    /// Check the per-entry invariants. Returns a description of the first breach.
    pub fn check_invariants(&self) -> Result<(), String> {
        let approved = self.status == ModuleStatus::Approved;
        if approved && self.signatures.is_empty() {
            return Err("approved entry has no signatures".to_string());
        }
        if !approved && !self.signatures.is_empty() {
            return Err(format!("{} entry carries signatures", self.status));
        }
        if self.last_validated < self.first_proposed {
            return Err("last_validated precedes first_proposed".to_string());
        }
        Ok(())
    }

    fn touch(&mut self) {
        self.last_validated = Utc::now().max(self.first_proposed);
    }
}

/// Result of [`WhitelistRegistry::propose`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Proposal {
    /// A new pending entry was created.
    Accepted(ModuleId),
    /// An entry with this identity already exists; nothing changed.
    Duplicate(ModuleId),
}

impl Proposal {
    pub fn module_id(&self) -> &ModuleId {
        match self {
            Proposal::Accepted(id) | Proposal::Duplicate(id) => id,
        }
    }

    pub fn is_duplicate(&self) -> bool {
        matches!(self, Proposal::Duplicate(_))
    }
}

/// Terminal decision applied by [`WhitelistRegistry::finalize`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Carries the approval signature.
    Approved(String),
    /// Carries the restriction reason.
    Restricted(String),
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("unknown module {0}")]
    UnknownModule(ModuleId),
    #[error("invalid transition for module {module_id} (status {status}): {reason}")]
    InvalidTransition {
        module_id: ModuleId,
        status: ModuleStatus,
        reason: String,
    },
    #[error("module {0} appears more than once")]
    DuplicateEntry(ModuleId),
}

/// Ownership of one validation run, returned by
/// [`WhitelistRegistry::try_begin_validation`].
#[derive(Debug, PartialEq, Eq)]
pub struct ValidationClaim {
    module_id: ModuleId,
    token: Uuid,
}

impl ValidationClaim {
    pub fn module_id(&self) -> &ModuleId {
        &self.module_id
    }

    pub fn token(&self) -> Uuid {
        self.token
    }
}

/// An entry together with the source bytes it was derived from, if retained.
#[derive(Debug, Clone, PartialEq)]
pub struct RegistryRecord {
    pub entry: ModuleEntry,
    pub source: Option<Arc<[u8]>>,
}

struct Slot {
    entry: ModuleEntry,
    source: Option<Arc<[u8]>>,
    /// Token of the run that owns this module. Set by `try_begin_validation`,
    /// cleared by `finalize` or `release`.
    claim: Option<Uuid>,
}

/// Concurrent registry of module entries.
pub struct WhitelistRegistry {
    slots: Mutex<HashMap<ModuleId, Slot>>,
    metrics: Arc<AuditMetrics>,
}

impl WhitelistRegistry {
    pub fn new(metrics: Arc<AuditMetrics>) -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
            metrics,
        }
    }

    pub fn metrics(&self) -> &Arc<AuditMetrics> {
        &self.metrics
    }

    /// Insert a pending entry for `content` under [`DEFAULT_CATEGORY`], or
    /// report that it already exists.
    pub fn propose(&self, content: &[u8], proposer_id: &str) -> Proposal {
        self.propose_with_category(content, proposer_id, DEFAULT_CATEGORY)
    }

    /// Like [`propose`](Self::propose), recording `category` on a new entry.
    /// A blank category falls back to [`DEFAULT_CATEGORY`].
    pub fn propose_with_category(&self, content: &[u8], proposer_id: &str, category: &str) -> Proposal {
        let category = match category.trim() {
            "" => DEFAULT_CATEGORY,
            trimmed => trimmed,
        };
        let module_id = derive_id(content);
        let content_hash = derive_hash(content);

        let accepted = match self.slots.lock().entry(module_id.clone()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(vacant) => {
                let now = Utc::now();
                vacant.insert(Slot {
                    entry: ModuleEntry {
                        module_id: module_id.clone(),
                        content_hash,
                        status: ModuleStatus::Pending,
                        signatures: Vec::new(),
                        proposer_id: proposer_id.to_string(),
                        category: category.to_string(),
                        first_proposed: now,
                        last_validated: now,
                        restriction_reason: None,
                    },
                    source: Some(Arc::from(content)),
                    claim: None,
                });
                true
            }
        };

        if accepted {
            self.metrics.record_proposal();
            info!(
                module_id = %module_id,
                proposer = %proposer_id,
                category,
                bytes = content.len(),
                "module proposed"
            );
            Proposal::Accepted(module_id)
        } else {
            self.metrics.record_duplicate();
            debug!(module_id = %module_id, proposer = %proposer_id, "duplicate proposal");
            Proposal::Duplicate(module_id)
        }
    }

    /// Claim a pending module for validation. Exactly one caller wins per
    /// module; everyone else gets `None`.
    pub fn try_begin_validation(&self, module_id: &ModuleId) -> Option<ValidationClaim> {
        let token = match self.slots.lock().get_mut(module_id) {
            Some(slot) if slot.entry.status == ModuleStatus::Pending && slot.claim.is_none() => {
                let token = Uuid::new_v4();
                slot.claim = Some(token);
                Some(token)
            }
            _ => None,
        };

        match token {
            Some(token) => {
                self.metrics.record_validation_started();
                debug!(module_id = %module_id, claim = %token, "validation claimed");
                Some(ValidationClaim {
                    module_id: module_id.clone(),
                    token,
                })
            }
            None => {
                self.metrics.record_validation_skipped();
                debug!(module_id = %module_id, "validation not claimable");
                None
            }
        }
    }

    /// Give up a claim without deciding the module. Returns false when the
    /// claim was already finalized, released or superseded.
    pub fn release(&self, claim: &ValidationClaim) -> bool {
        let released = match self.slots.lock().get_mut(&claim.module_id) {
            Some(slot) if slot.claim == Some(claim.token) => {
                slot.claim = None;
                true
            }
            _ => false,
        };

        if released {
            debug!(module_id = %claim.module_id, claim = %claim.token, "validation claim released");
        }
        released
    }

    /// Apply the terminal transition for a pending module owned by `claim`.
    pub fn finalize(
        &self,
        claim: &ValidationClaim,
        outcome: Outcome,
    ) -> Result<ModuleEntry, RegistryError> {
        let module_id = &claim.module_id;
        let result = {
            let mut slots = self.slots.lock();
            let slot = slots
                .get_mut(module_id)
                .ok_or_else(|| RegistryError::UnknownModule(module_id.clone()))?;

            let invalid = |reason: &str| RegistryError::InvalidTransition {
                module_id: module_id.clone(),
                status: slot.entry.status,
                reason: reason.to_string(),
            };

            if slot.entry.status != ModuleStatus::Pending {
                Err(invalid("module is not pending"))
            } else if slot.claim != Some(claim.token) {
                Err(invalid("validation claim is stale or missing"))
            } else if matches!(&outcome, Outcome::Approved(sig) if sig.is_empty()) {
                Err(invalid("approval requires a signature"))
            } else {
                match outcome {
                    Outcome::Approved(signature) => {
                        slot.entry.status = ModuleStatus::Approved;
                        slot.entry.signatures.push(signature);
                    }
                    Outcome::Restricted(reason) => {
                        slot.entry.status = ModuleStatus::Restricted;
                        slot.entry.restriction_reason = Some(reason);
                    }
                }
                slot.claim = None;
                slot.entry.touch();
                Ok(slot.entry.clone())
            }
        };

        match &result {
            Ok(entry) if entry.status == ModuleStatus::Approved => {
                self.metrics.record_approval();
                info!(module_id = %module_id, "module approved");
            }
            Ok(entry) => {
                self.metrics.record_restriction();
                info!(
                    module_id = %module_id,
                    reason = entry.restriction_reason.as_deref().unwrap_or_default(),
                    "module restricted"
                );
            }
            Err(e) => {
                self.metrics.record_invalid_transition();
                warn!(module_id = %module_id, error = %e, "finalize rejected");
            }
        }
        result
    }

    /// Revoke an approved module. Returns false (and changes nothing) otherwise.
    pub fn revoke(&self, module_id: &ModuleId) -> bool {
        let revoked = match self.slots.lock().get_mut(module_id) {
            Some(slot) if slot.entry.status == ModuleStatus::Approved => {
                slot.entry.status = ModuleStatus::Revoked;
                slot.entry.signatures.clear();
                slot.entry.touch();
                true
            }
            _ => false,
        };

        if revoked {
            self.metrics.record_revocation();
            warn!(module_id = %module_id, "module revoked");
        } else {
            self.metrics.record_revocation_rejected();
            debug!(module_id = %module_id, "revoke ignored: module not approved");
        }
        revoked
    }

    pub fn is_approved(&self, module_id: &ModuleId) -> bool {
        self.slots
            .lock()
            .get(module_id)
            .map(|slot| slot.entry.status == ModuleStatus::Approved)
            .unwrap_or(false)
    }

    pub fn get(&self, module_id: &ModuleId) -> Option<ModuleEntry> {
        self.slots.lock().get(module_id).map(|slot| slot.entry.clone())
    }

    /// Source bytes retained for a module, if any.
    pub fn source(&self, module_id: &ModuleId) -> Option<Arc<[u8]>> {
        self.slots
            .lock()
            .get(module_id)
            .and_then(|slot| slot.source.clone())
    }

    /// Consistent point-in-time view, ordered by proposal time.
    pub fn list(&self, filter: Option<ModuleStatus>) -> Vec<ModuleEntry> {
        let mut entries: Vec<ModuleEntry> = self
            .slots
            .lock()
            .values()
            .filter(|slot| filter.map_or(true, |s| slot.entry.status == s))
            .map(|slot| slot.entry.clone())
            .collect();
        sort_entries(&mut entries, |e| e);
        entries
    }

    /// Pending modules that no validation run currently owns.
    pub fn unclaimed_pending(&self) -> Vec<ModuleId> {
        let mut ids: Vec<ModuleId> = self
            .slots
            .lock()
            .values()
            .filter(|slot| slot.entry.status == ModuleStatus::Pending && slot.claim.is_none())
            .map(|slot| slot.entry.module_id.clone())
            .collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.lock().is_empty()
    }

    /// Copy out every entry with its source, for persistence.
    pub fn export(&self) -> Vec<RegistryRecord> {
        let mut records: Vec<RegistryRecord> = self
            .slots
            .lock()
            .values()
            .map(|slot| RegistryRecord {
                entry: slot.entry.clone(),
                source: slot.source.clone(),
            })
            .collect();
        sort_entries(&mut records, |r| &r.entry);
        records
    }

    /// Replace the registry contents with `records`.
    ///
    /// A module that a run currently owns keeps its claim if it is still
    /// pending in `records`, so the run can finish it and nobody else can
    /// start a second one. Claims on modules that are no longer pending are
    /// dropped and their runs' results will be rejected.
    pub fn restore(&self, records: Vec<RegistryRecord>) -> Result<usize, RegistryError> {
        let mut fresh = HashMap::with_capacity(records.len());
        for record in records {
            let id = record.entry.module_id.clone();
            if fresh.contains_key(&id) {
                return Err(RegistryError::DuplicateEntry(id));
            }
            fresh.insert(
                id,
                Slot {
                    entry: record.entry,
                    source: record.source,
                    claim: None,
                },
            );
        }

        let count = fresh.len();
        let carried = {
            let mut slots = self.slots.lock();
            let mut carried = 0;
            for (id, slot) in fresh.iter_mut() {
                if slot.entry.status != ModuleStatus::Pending {
                    continue;
                }
                slot.claim = slots.get(id).and_then(|old| old.claim);
                carried += usize::from(slot.claim.is_some());
            }
            *slots = fresh;
            carried
        };
        info!(entries = count, claims_kept = carried, "registry restored");
        Ok(count)
    }
}

impl Default for WhitelistRegistry {
    fn default() -> Self {
        Self::new(Arc::new(AuditMetrics::new()))
    }
}

fn sort_entries<T>(items: &mut [T], entry: impl Fn(&T) -> &ModuleEntry) {
    items.sort_by(|a, b| {
        let (a, b) = (entry(a), entry(b));
        a.first_proposed
            .cmp(&b.first_proposed)
            .then_with(|| a.module_id.cmp(&b.module_id))
    });
}
