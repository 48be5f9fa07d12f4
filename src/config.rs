use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::info;

/// Gatekeeper configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Approval thresholds
    #[serde(default)]
    pub policy: PolicyConfig,

    /// Validation scheduling
    #[serde(default)]
    pub pipeline: PipelineConfig,

    /// Snapshot location
    #[serde(default)]
    pub storage: StorageConfig,

    /// Approval key location
    #[serde(default)]
    pub signer: SignerConfig,

    /// Process sandbox used by the CLI
    #[serde(default)]
    pub sandbox: SandboxConfig,

    /// Placeholder judge scores used by the CLI
    #[serde(default)]
    pub judges: StaticJudgeConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyConfig {
    #[serde(default = "default_required_sandbox_passes")]
    pub required_sandbox_passes: u32,
    #[serde(default = "default_max_ethical_risk")]
    pub max_ethical_risk: f64,
    #[serde(default = "default_min_trust_score")]
    pub min_trust_score: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default = "default_max_concurrent_validations")]
    pub max_concurrent_validations: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_snapshot_path")]
    pub snapshot_path: PathBuf,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SignerConfig {
    /// Hex secret key file. Created on first use; absent means an ephemeral key.
    #[serde(default)]
    pub key_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxConfig {
    #[serde(default = "default_sandbox_command")]
    pub command: String,
    #[serde(default = "default_sandbox_args")]
    pub args: Vec<String>,
    #[serde(default = "default_allowed_commands")]
    pub allowed_commands: Vec<String>,
    #[serde(default = "default_sandbox_timeout")]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StaticJudgeConfig {
    #[serde(default = "default_static_risk")]
    pub risk_score: f64,
    #[serde(default = "default_static_impact")]
    pub impact_score: f64,
}

fn default_required_sandbox_passes() -> u32 {
    3
}

fn default_max_ethical_risk() -> f64 {
    0.2
}

fn default_min_trust_score() -> f64 {
    0.85
}

fn default_max_concurrent_validations() -> usize {
    4
}

fn default_snapshot_path() -> PathBuf {
    PathBuf::from("data/whitelist.json")
}

fn default_sandbox_command() -> String {
    "python3".to_string()
}

fn default_sandbox_args() -> Vec<String> {
    vec!["-I".to_string(), "-".to_string()]
}

fn default_allowed_commands() -> Vec<String> {
    vec!["python3".to_string(), "python".to_string(), "sh".to_string()]
}

fn default_sandbox_timeout() -> u64 {
    10
}

fn default_static_risk() -> f64 {
    0.1
}

fn default_static_impact() -> f64 {
    0.9
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            required_sandbox_passes: default_required_sandbox_passes(),
            max_ethical_risk: default_max_ethical_risk(),
            min_trust_score: default_min_trust_score(),
        }
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_validations: default_max_concurrent_validations(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            snapshot_path: default_snapshot_path(),
        }
    }
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            command: default_sandbox_command(),
            args: default_sandbox_args(),
            allowed_commands: default_allowed_commands(),
            timeout_secs: default_sandbox_timeout(),
        }
    }
}

impl Default for StaticJudgeConfig {
    fn default() -> Self {
        Self {
            risk_score: default_static_risk(),
            impact_score: default_static_impact(),
        }
    }
}

fn unit_interval(name: &str, value: f64) -> Result<(), String> {
    if (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(format!("{} must be between 0 and 1", name))
    }
}

impl Config {
    /// Load configuration from TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, Box<dyn std::error::Error>> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        info!(
            snapshot = %config.storage.snapshot_path.display(),
            passes = config.policy.required_sandbox_passes,
            "configuration loaded"
        );
        Ok(config)
    }

    /// Load from `path` if it exists, otherwise fall back to defaults.
    pub fn from_file_or_default<P: AsRef<Path>>(
        path: P,
    ) -> Result<Self, Box<dyn std::error::Error>> {
        if path.as_ref().exists() {
            Self::from_file(path)
        } else {
            info!(path = %path.as_ref().display(), "no config file, using defaults");
            Ok(Self::default())
        }
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), String> {
        if self.policy.required_sandbox_passes == 0 {
            return Err("required_sandbox_passes must be at least 1".to_string());
        }
        unit_interval("max_ethical_risk", self.policy.max_ethical_risk)?;
        unit_interval("min_trust_score", self.policy.min_trust_score)?;
        if self.pipeline.max_concurrent_validations == 0 {
            return Err("max_concurrent_validations must be at least 1".to_string());
        }
        if !self.sandbox.allowed_commands.contains(&self.sandbox.command) {
            return Err(format!(
                "sandbox command '{}' not in allowed_commands",
                self.sandbox.command
            ));
        }
        if self.sandbox.timeout_secs == 0 {
            return Err("sandbox timeout_secs must be at least 1".to_string());
        }
        unit_interval("judges.risk_score", self.judges.risk_score)?;
        unit_interval("judges.impact_score", self.judges.impact_score)?;
        Ok(())
    }
}
