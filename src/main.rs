use std::path::PathBuf;
use std::process;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde_json::json;

use crashstore_lib::{
    ErrorReport, ErrorReportKind, ErrorReportState, ManagerConfig, ReportManager,
};

#[derive(Debug, Parser)]
#[command(name = "crashstore", about = "Installer crash report store", version)]
struct Cli {
    /// Installer state root; reports live in <root>/var/crash.
    #[arg(long, global = true)]
    root: Option<PathBuf>,
    /// Use the dry-run submission target and persistent location.
    #[arg(long, global = true)]
    dry_run: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Load every report in the store and list them newest first.
    List {
        /// Emit a JSON array instead of the table view.
        #[arg(long)]
        json: bool,
    },
    /// Create and populate a new report.
    Create {
        /// One of block-probe-fail, disk-probe-fail, install-fail, ui, unknown.
        #[arg(long)]
        kind: ErrorReportKind,
        /// Free text stored in the report as InstallerNote.
        #[arg(long)]
        note: Option<String>,
    },
    /// Record that the user has looked at a report.
    MarkSeen { base: String },
    /// Print the fields of one report.
    Show { base: String },
}

fn main() {
    crashstore_lib::init_logging();

    let cli = Cli::parse();
    match handle_cli(cli) {
        Ok(code) => process::exit(code),
        Err(err) => {
            eprintln!("Error: {err:#}");
            process::exit(1);
        }
    }
}

fn handle_cli(cli: Cli) -> Result<i32> {
    let mut config = ManagerConfig::from_env();
    if let Some(root) = cli.root {
        config.root = root;
    }
    if cli.dry_run {
        config.dry_run = true;
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("start tokio runtime")?;

    runtime.block_on(run(config, cli.command))
}

async fn run(config: ManagerConfig, command: Commands) -> Result<i32> {
    let mut manager = ReportManager::new(config).context("create report manager")?;
    manager.start().context("open crash directory")?;

    match command {
        Commands::List { json } => {
            manager.run_until_idle().await;
            if json {
                print_list_json(&manager)?;
            } else {
                print_list_table(&manager);
            }
            Ok(0)
        }
        Commands::Create { kind, note } => {
            let report = manager
                .create_report(kind)
                .with_context(|| format!("create {kind} report"))?;
            report
                .add_info(
                    move |artifact| {
                        if let Some(note) = note {
                            artifact.insert("InstallerNote", note)?;
                        }
                        Ok(())
                    },
                    true,
                )
                .context("populate report")?;
            println!("{}\t{}", report.base(), report.state());
            Ok(if report.state() == ErrorReportState::Done { 0 } else { 1 })
        }
        Commands::MarkSeen { base } => {
            manager
                .mark_seen(&base)
                .with_context(|| format!("mark {base} as seen"))?;
            println!("{base} marked as seen");
            Ok(0)
        }
        Commands::Show { base } => {
            manager.run_until_idle().await;
            let report = manager
                .get(&base)
                .with_context(|| format!("no report named {base}"))?;
            print_report(report);
            Ok(0)
        }
    }
}

fn print_list_table(manager: &ReportManager) {
    if manager.is_empty() {
        println!("No crash reports.");
        return;
    }
    println!("{:<36} {:<18} {:<16} SEEN", "BASE", "KIND", "STATE");
    for report in manager.reports() {
        println!(
            "{:<36} {:<18} {:<16} {}",
            report.base(),
            report.kind().name(),
            report.state().as_str(),
            if report.seen() { "yes" } else { "no" }
        );
    }
}

fn print_list_json(manager: &ReportManager) -> Result<()> {
    let payload: Vec<_> = manager
        .reports()
        .iter()
        .map(|report| {
            json!({
                "base": report.base(),
                "kind": report.kind(),
                "state": report.state(),
                "seen": report.seen(),
            })
        })
        .collect();
    let serialized = serde_json::to_string_pretty(&payload).context("serialize report list")?;
    println!("{serialized}");
    Ok(())
}

fn print_report(report: &ErrorReport) {
    println!("Base: {}", report.base());
    println!("Kind: {} ({})", report.kind(), report.kind().description());
    println!("State: {}", report.state());
    println!("Seen: {}", report.seen());
    let (label, path) = report.persistent_details();
    if let (Some(label), Some(path)) = (label, path) {
        println!("Persistent: {label}:{path}");
    }
    println!();
    for (key, value) in report.artifact().iter() {
        if value.contains('\n') {
            println!("{key}:");
            for line in value.lines() {
                println!(" {line}");
            }
        } else {
            println!("{key}: {value}");
        }
    }
}
