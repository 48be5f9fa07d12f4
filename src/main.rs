use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use evoclaw_gatekeeper::config::Config;
use evoclaw_gatekeeper::registry::DEFAULT_CATEGORY;
use evoclaw_gatekeeper::judges::{Judges, StaticAssessor, StaticReviewer};
use evoclaw_gatekeeper::sandbox::ProcessSandbox;
use evoclaw_gatekeeper::signing::ApprovalSigner;
use evoclaw_gatekeeper::{Gatekeeper, ModuleId, ModuleStatus};

/// EvoClaw Gatekeeper - validates and whitelists proposed modules
#[derive(Parser, Debug)]
#[command(name = "evoclaw-gatekeeper", version, about)]
struct Args {
    /// Configuration file (defaults are used if it does not exist)
    #[arg(short, long, default_value = "gatekeeper.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Generate a new approval key
    Keygen {
        /// Where to write the hex secret key
        #[arg(long)]
        out: PathBuf,
    },
    /// Propose a module and wait for its validation
    Propose {
        /// Module source file
        file: PathBuf,

        /// Proposer identifier recorded on the entry
        #[arg(long, default_value = "anonymous")]
        proposer: String,

        /// Submission category recorded on the entry
        #[arg(long, default_value = DEFAULT_CATEGORY)]
        category: String,
    },
    /// Propose every file in a directory and wait for their validation
    SubmitDir {
        /// Directory whose regular files are proposed (not recursive)
        dir: PathBuf,

        /// Proposer identifier recorded on each entry
        #[arg(long, default_value = "anonymous")]
        proposer: String,

        /// Submission category recorded on each entry
        #[arg(long, default_value = DEFAULT_CATEGORY)]
        category: String,
    },
    /// Show one module entry
    Status { id: ModuleId },
    /// List module entries
    List {
        /// Only show entries with this status
        #[arg(long)]
        status: Option<ModuleStatus>,
    },
    /// Revoke an approved module
    Revoke { id: ModuleId },
    /// Verify the stored snapshot against the approval key
    Verify,
    /// Print audit counters for this invocation only. Counters are not
    /// persisted, so this reports the snapshot load and little else.
    Metrics,
}

fn build_gatekeeper(config: &Config) -> Result<Gatekeeper, Box<dyn std::error::Error>> {
    let sandbox = ProcessSandbox::from_config(&config.sandbox)?;
    let judges = Judges {
        sandbox: Arc::new(sandbox),
        reviewer: Arc::new(StaticReviewer::new(config.judges.risk_score)),
        assessor: Arc::new(StaticAssessor::new(config.judges.impact_score)),
    };
    Ok(Gatekeeper::from_config(config, judges)?)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .with_level(true)
        .init();

    let args = Args::parse();

    if let Command::Keygen { out } = &args.command {
        let signer = ApprovalSigner::generate();
        signer.write_secret(out)?;
        info!(path = %out.display(), "approval key written");
        println!("{}", signer.public_key_hex());
        return Ok(());
    }

    let config = Config::from_file_or_default(&args.config)?;
    let gatekeeper = build_gatekeeper(&config)?;
    let snapshot = config.storage.snapshot_path.as_path();
    let has_snapshot = snapshot.exists();
    if has_snapshot {
        gatekeeper.load_registry(snapshot)?;
    }

    match args.command {
        Command::Keygen { .. } => {}
        Command::Propose {
            file,
            proposer,
            category,
        } => {
            let content = std::fs::read(&file)?;
            gatekeeper.resume_pending();
            let proposal = gatekeeper.propose_with_category(&content, &proposer, &category);
            if proposal.is_duplicate() {
                warn!(module_id = %proposal.module_id(), "module already registered");
            }
            gatekeeper.wait_idle().await;
            gatekeeper.save_registry(snapshot)?;

            if let Some(entry) = gatekeeper.get(proposal.module_id()) {
                println!("{}", serde_json::to_string_pretty(&entry)?);
            }
        }
        Command::SubmitDir {
            dir,
            proposer,
            category,
        } => {
            gatekeeper.resume_pending();
            let report = gatekeeper.propose_dir(&dir, &proposer, &category)?;
            gatekeeper.wait_idle().await;
            gatekeeper.save_registry(snapshot)?;

            println!(
                "submitted: {}  duplicates: {}  failed: {}  total: {}",
                report.submitted,
                report.duplicates,
                report.failed,
                report.total()
            );
        }
        Command::Status { id } => {
            let entry = gatekeeper
                .get(&id)
                .ok_or_else(|| format!("unknown module {}", id))?;
            println!("{}", serde_json::to_string_pretty(&entry)?);
        }
        Command::List { status } => {
            for entry in gatekeeper.list(status) {
                println!(
                    "{}  {:<10}  {:<16}  {:<16}  {}",
                    entry.module_id,
                    entry.status,
                    entry.proposer_id,
                    entry.category,
                    entry.first_proposed.to_rfc3339()
                );
            }
        }
        Command::Revoke { id } => {
            if gatekeeper.revoke(&id) {
                gatekeeper.save_registry(snapshot)?;
                println!("revoked {}", id);
            } else {
                println!("{} is not approved; nothing changed", id);
            }
        }
        Command::Verify => {
            if has_snapshot {
                let entries = gatekeeper.list(None);
                let approved = entries
                    .iter()
                    .filter(|e| e.status == ModuleStatus::Approved)
                    .count();
                println!(
                    "snapshot ok: {} entries, {} approved, key {}",
                    entries.len(),
                    approved,
                    gatekeeper.public_key_hex()
                );
            } else {
                println!("no snapshot at {}", snapshot.display());
            }
        }
        Command::Metrics => {
            println!("{}", serde_json::to_string_pretty(&gatekeeper.metrics())?);
        }
    }

    Ok(())
}
