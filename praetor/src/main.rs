//! `praetor`: operator tool over a file-backed task store.
//!
//! Every command opens the store at `--store`, loads `<store>/config.toml`
//! (or `--config`), and runs one operation through the reconciler. Execution
//! requests are spooled under `<store>/_units/`. A `reconcile` pass leaves
//! its metrics in `<store>/metrics.prom` for a textfile collector.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};

use praetor::clock::SystemClock;
use praetor::error::AdmissionRejected;
use praetor::exit_codes;
use praetor::io::config::{OrchestratorConfig, load_config, write_config};
use praetor::io::file_store::{FileStore, read_task_document, write_atomic};
use praetor::io::report::Report;
use praetor::io::store::TaskStore;
use praetor::io::substrate::SpoolSubstrate;
use praetor::logging;
use praetor::reconcile::{Observation, Reconciler, UnitExit, is_already_terminal};
use praetor::task::TaskKey;

#[derive(Parser)]
#[command(
    name = "praetor",
    version,
    about = "Supervise hierarchical, budget-constrained agent tasks"
)]
struct Cli {
    /// Store root directory.
    #[arg(long, global = true, default_value = ".praetor")]
    store: PathBuf,
    /// Config file. Defaults to `<store>/config.toml`.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Namespace of the task named on the command line.
    #[arg(short, long, global = true, default_value = "default")]
    namespace: String,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Write the default config to `<store>/config.toml`.
    Init {
        /// Overwrite an existing config.
        #[arg(long)]
        force: bool,
    },
    /// Run admission checks on a task document without storing it.
    Validate { file: PathBuf },
    /// Admit a task document into the store.
    Submit { file: PathBuf },
    /// Run one reconcile pass over every task in the store and write
    /// `<store>/metrics.prom`.
    Reconcile,
    /// Cancel a task and its descendants.
    Cancel {
        name: String,
        #[arg(long, default_value = "cancelled by operator")]
        reason: String,
        /// Also terminate running execution units.
        #[arg(long)]
        force: bool,
    },
    /// Mark a task's outputs for retention.
    Retain {
        name: String,
        #[arg(long)]
        reason: Option<String>,
    },
    /// Feed a report document to a task; one with `exitCode` ends its unit.
    Report { name: String, file: PathBuf },
    /// Print a task as JSON.
    Status { name: String },
    /// Delete a task.
    Delete { name: String },
}

fn main() {
    logging::init();
    let cli = Cli::parse();
    let code = match run(cli) {
        Ok(code) => code,
        Err(err) => exit_code_for(&err),
    };
    std::process::exit(code);
}

fn exit_code_for(err: &anyhow::Error) -> i32 {
    if let Some(rejected) = err.downcast_ref::<AdmissionRejected>() {
        eprintln!("admission rejected {}:", rejected.key);
        for violation in &rejected.violations {
            eprintln!("- {violation}");
        }
        return exit_codes::REJECTED;
    }
    eprintln!("{err:#}");
    if is_already_terminal(err) {
        exit_codes::TERMINAL
    } else {
        exit_codes::INVALID
    }
}

fn run(cli: Cli) -> Result<i32> {
    let store = FileStore::open(&cli.store)?;
    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(|| cli.store.join("config.toml"));
    if let Command::Init { force } = cli.command {
        if config_path.exists() && !force {
            bail!("{} already exists (use --force)", config_path.display());
        }
        write_config(&config_path, &OrchestratorConfig::default())?;
        println!("wrote {}", config_path.display());
        return Ok(exit_codes::OK);
    }
    let config = load_config(&config_path)?;
    let substrate = SpoolSubstrate::new(&cli.store.join("_units"));
    let clock = SystemClock;
    let reconciler = Reconciler::new(&store, &substrate, &clock, &config)?;
    let key = |name: &str| TaskKey::new(&cli.namespace, name);

    match cli.command {
        Command::Init { .. } => Ok(exit_codes::OK),
        Command::Validate { file } => {
            let task = read_task_document(store.schemas(), &file)?;
            let violations = reconciler.review(&task)?;
            if violations.is_empty() {
                println!("{} ok", task.key());
                return Ok(exit_codes::OK);
            }
            for violation in &violations {
                println!("- {violation}");
            }
            Ok(exit_codes::REJECTED)
        }
        Command::Submit { file } => {
            let task = read_task_document(store.schemas(), &file)?;
            let created = reconciler.admit(task)?;
            println!("{} admitted", created.key());
            Ok(exit_codes::OK)
        }
        Command::Reconcile => {
            let summary = reconciler.reconcile_all()?;
            let metrics = reconciler.metrics().encode_text()?;
            write_atomic(&cli.store.join("metrics.prom"), &metrics)?;
            println!(
                "reconciled {} task(s), {} failed",
                summary.reconciled, summary.failed
            );
            if let Some(secs) = summary.next_requeue_secs {
                println!("next pass due in {secs}s");
            }
            Ok(if summary.failed == 0 {
                exit_codes::OK
            } else {
                exit_codes::INVALID
            })
        }
        Command::Cancel {
            name,
            reason,
            force,
        } => {
            let summary = reconciler.cancel(&key(&name), &reason, force)?;
            println!("{name}: {} -> {}", summary.from, summary.to);
            Ok(exit_codes::OK)
        }
        Command::Retain { name, reason } => {
            reconciler.retain(&key(&name), reason)?;
            println!("{name}: retained");
            Ok(exit_codes::OK)
        }
        Command::Report { name, file } => {
            let key = key(&name);
            let report = read_report(&file)?;
            let observation = if report.exit_code.is_some() {
                let task = store.get_task(&key)?;
                let unit_id = task
                    .status
                    .unit_id
                    .with_context(|| format!("{key} has no execution unit"))?;
                Observation::UnitExited {
                    key: key.clone(),
                    exit: UnitExit::from_report(unit_id, report),
                }
            } else {
                Observation::Reported {
                    key: key.clone(),
                    report,
                }
            };
            reconciler.handle(observation)?;
            println!("{name}: {}", store.get_task(&key)?.phase());
            Ok(exit_codes::OK)
        }
        Command::Status { name } => {
            let task = store.get_task(&key(&name))?;
            println!(
                "{}",
                serde_json::to_string_pretty(&task).context("serialize task")?
            );
            Ok(exit_codes::OK)
        }
        Command::Delete { name } => {
            reconciler.delete(&key(&name))?;
            println!("{name}: deleted");
            Ok(exit_codes::OK)
        }
    }
}

fn read_report(path: &Path) -> Result<Report> {
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    serde_json::from_str(&contents).with_context(|| format!("parse report {}", path.display()))
}
