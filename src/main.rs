use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use uuid::Uuid;

use forgeguard::conductor::{BuildConductor, ConductorParams, GateKind};
use forgeguard::config::ForgeConfig;
use forgeguard::contracts::{Contract, ContractSnapshot, ContractType, MemoryContractStore};
use forgeguard::events::{BuildEvent, ChannelBroadcaster};
use forgeguard::governance::run_governance_checks;
use forgeguard::llm::HttpLlmEndpoint;
use forgeguard::manifest::{ManifestEntry, load_manifest_cache};
use forgeguard::store::{BuildStatus, MemoryBuildStore};
use forgeguard::workspace::Workspace;

#[derive(Parser)]
#[command(name = "forgeguard")]
#[command(version, about = "LLM-driven build orchestrator - contract-governed, phase-by-phase source generation")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Project working directory (default: current directory)
    #[arg(long, global = true)]
    pub project_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run a build against the project's contracts
    Run {
        /// Auto-approve every gate (unattended mode)
        #[arg(long)]
        yes: bool,
        /// Spend cap in USD, overriding the configured cap
        #[arg(long)]
        spend_cap: Option<f64>,
        /// Branch label recorded on the build
        #[arg(long, default_value = "forge/build")]
        branch: String,
    },
    /// Governance audit commands
    Audit {
        #[command(subcommand)]
        command: AuditCommands,
    },
    /// Show cached build progress for this project
    Status,
}

#[derive(Subcommand)]
pub enum AuditCommands {
    /// Run the governance battery standalone (exit 0 PASS, 1 FAIL, 2 error)
    Run,
}

fn init_tracing(verbose: bool) {
    let filter = if verbose { "forgeguard=debug" } else { "forgeguard=info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .with_target(false)
        .init();
}

#[tokio::main]
async fn main() {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let project_dir = cli
        .project_dir
        .clone()
        .unwrap_or_else(|| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")));

    let code = match &cli.command {
        Commands::Run { yes, spend_cap, branch } => {
            match cmd_run(&project_dir, *yes, *spend_cap, branch).await {
                Ok(status) => match status {
                    BuildStatus::Completed => 0,
                    _ => 1,
                },
                Err(e) => {
                    eprintln!("error: {e:#}");
                    2
                }
            }
        }
        Commands::Audit { command: AuditCommands::Run } => match cmd_audit(&project_dir) {
            Ok(passed) => {
                if passed {
                    0
                } else {
                    1
                }
            }
            Err(e) => {
                eprintln!("error: {e:#}");
                2
            }
        },
        Commands::Status => match cmd_status(&project_dir) {
            Ok(()) => 0,
            Err(e) => {
                eprintln!("error: {e:#}");
                2
            }
        },
    };
    std::process::exit(code);
}

/// Load contracts materialised under `Forge/Contracts/` into the local
/// contract store.
async fn load_local_contracts(
    workspace: &Workspace,
    project_id: Uuid,
) -> Result<Arc<MemoryContractStore>> {
    let store = MemoryContractStore::new();
    let dir = workspace.root().join("Forge").join("Contracts");
    if dir.is_dir() {
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            let path = entry.path();
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let Some(contract_type) = ContractType::parse(stem) else {
                continue;
            };
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            store.put(project_id, Contract::new(contract_type, &content)).await;
        }
    }
    Ok(Arc::new(store))
}

async fn cmd_run(
    project_dir: &PathBuf,
    yes: bool,
    spend_cap: Option<f64>,
    branch: &str,
) -> Result<BuildStatus> {
    let workspace = Workspace::new(project_dir)
        .with_context(|| format!("Cannot open workspace at {}", project_dir.display()))?;
    let config = ForgeConfig::load(workspace.root())?;
    if config.llm.api_keys.is_empty() {
        anyhow::bail!("No API keys configured (set FORGEGUARD_API_KEYS or [llm] api_keys)");
    }

    let project_id = Uuid::new_v4();
    let user_id = Uuid::new_v4();
    let contracts = load_local_contracts(&workspace, project_id).await?;
    let store = Arc::new(MemoryBuildStore::new());
    let broadcaster = Arc::new(ChannelBroadcaster::new());
    let endpoint = Arc::new(HttpLlmEndpoint::new());

    let mut events = broadcaster.subscribe(user_id).await;

    let conductor = BuildConductor::prepare(
        ConductorParams {
            config,
            project_id,
            user_id,
            workspace,
            branch: branch.to_string(),
            spend_cap,
        },
        contracts,
        store,
        broadcaster,
        endpoint,
    )
    .await
    .map_err(|e| anyhow::anyhow!("{e}"))?;

    let handle = conductor.handle();

    // Event printer + gate responder.
    let responder = tokio::spawn({
        let handle = handle.clone();
        async move {
            while let Some(event) = events.recv().await {
                print_event(&event);
                if yes {
                    match event {
                        BuildEvent::IdeReady { .. } => {
                            handle
                                .resolve_gate(GateKind::IdeReady, serde_json::json!({"action": "commence"}))
                                .await;
                        }
                        BuildEvent::PlanReview { .. } => {
                            handle
                                .resolve_gate(GateKind::PlanReview, serde_json::json!({"action": "approve"}))
                                .await;
                        }
                        BuildEvent::PhaseReview { .. } => {
                            handle
                                .resolve_gate(GateKind::PhaseReview, serde_json::json!({"action": "continue"}))
                                .await;
                        }
                        _ => {}
                    }
                } else if let BuildEvent::IdeReady { .. }
                | BuildEvent::PlanReview { .. }
                | BuildEvent::PhaseReview { .. } = event
                {
                    prompt_gate(&handle, &event).await;
                }
            }
        }
    });

    // Ctrl-C cancels the build cleanly.
    tokio::spawn({
        let handle = handle.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::warn!("interrupt received — cancelling build");
                handle.cancel();
            }
        }
    });

    let status = conductor.run().await;
    responder.abort();
    println!("build finished: {status}");
    Ok(status)
}

/// Interactive gate prompt: print the question, read one line, map it.
async fn prompt_gate(handle: &Arc<forgeguard::conductor::BuildHandle>, event: &BuildEvent) {
    use tokio::io::{AsyncBufReadExt, BufReader};

    let (kind, prompt, default_action) = match event {
        BuildEvent::IdeReady { .. } => (
            GateKind::IdeReady,
            "Workspace ready. commence/cancel [commence]: ",
            "commence",
        ),
        BuildEvent::PlanReview { .. } => (
            GateKind::PlanReview,
            "Plan ready. approve/reject [approve]: ",
            "approve",
        ),
        BuildEvent::PhaseReview { .. } => (
            GateKind::PhaseReview,
            "Phase partially succeeded. continue/fix [continue]: ",
            "continue",
        ),
        _ => return,
    };

    print!("{prompt}");
    use std::io::Write;
    let _ = std::io::stdout().flush();
    let mut line = String::new();
    let mut reader = BufReader::new(tokio::io::stdin());
    let _ = reader.read_line(&mut line).await;
    let action = match line.trim() {
        "" => default_action,
        other => other,
    };
    handle
        .resolve_gate(kind, serde_json::json!({"action": action}))
        .await;
}

fn print_event(event: &BuildEvent) {
    match event {
        BuildEvent::BuildLog { message, source, level } => {
            println!("[{source}/{level}] {message}");
        }
        BuildEvent::FileGenerated { path, .. } => println!("  generated {path}"),
        BuildEvent::FileAudited { path, verdict, .. } => println!("  audited {path}: {verdict}"),
        BuildEvent::FileFixed { path } => println!("  fixed {path}"),
        BuildEvent::CostTicker { total_cost_usd, pct_used, .. } => {
            println!("  cost ${total_cost_usd} ({pct_used}% of cap)");
        }
        BuildEvent::GovernanceCheck { code, result, detail, .. } => {
            println!("  {code}: {result:?} — {detail}");
        }
        other => println!("• {}", other.type_name()),
    }
}

/// Standalone governance battery over the workspace: the manifest is the
/// union of every cached phase manifest; the touched set is every file
/// on disk.
fn cmd_audit(project_dir: &PathBuf) -> Result<bool> {
    let workspace = Workspace::new(project_dir)
        .with_context(|| format!("Cannot open workspace at {}", project_dir.display()))?;

    let mut manifest: Vec<ManifestEntry> = Vec::new();
    for phase in 0..=99u32 {
        if let Some(mut cached) = load_manifest_cache(&workspace, phase) {
            manifest.append(&mut cached);
        }
    }

    let contracts_dir = workspace.root().join("Forge").join("Contracts");
    let mut contracts = Vec::new();
    if contracts_dir.is_dir() {
        for entry in std::fs::read_dir(&contracts_dir)? {
            let path = entry?.path();
            if let Some(contract_type) = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(ContractType::parse)
                && let Ok(content) = std::fs::read_to_string(&path)
            {
                contracts.push(Contract::new(contract_type, &content));
            }
        }
    }
    let snapshot = ContractSnapshot::capture(contracts);

    let touched: BTreeSet<String> = workspace.walk_files().into_iter().collect();
    let report = run_governance_checks(&workspace, &snapshot, &manifest, &touched);

    for check in &report.checks {
        println!("{} {:?}: {}", check.code, check.result, check.detail);
    }
    println!(
        "overall: {} ({} FAIL, {} WARN)",
        if report.passed { "PASS" } else { "FAIL" },
        report.blocking_failures,
        report.warnings
    );
    Ok(report.passed)
}

fn cmd_status(project_dir: &PathBuf) -> Result<()> {
    let workspace = Workspace::new(project_dir)
        .with_context(|| format!("Cannot open workspace at {}", project_dir.display()))?;

    let progress_path = workspace.progress_path();
    if progress_path.exists() {
        println!("{}", std::fs::read_to_string(progress_path)?);
    } else {
        println!("no build progress recorded");
    }

    for phase in 0..=99u32 {
        if let Some(manifest) = load_manifest_cache(&workspace, phase) {
            println!("phase {phase}: {} files planned", manifest.len());
        }
    }
    Ok(())
}
