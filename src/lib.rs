pub mod config;
pub mod gatekeeper;
pub mod identity;
pub mod judges;
pub mod metrics;
pub mod persistence;
pub mod pipeline;
pub mod registry;
pub mod sandbox;
pub mod signing;

pub use gatekeeper::{BatchReport, Gatekeeper, GatekeeperError};
pub use identity::{derive_hash, derive_id, ContentHash, ModuleId};
pub use registry::{ModuleEntry, ModuleStatus, Proposal};
