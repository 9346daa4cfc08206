use anyhow::Context;
use clap::{Parser, Subcommand};
use colored::*;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};

use taxintake_core::{
    synthesize, CompletionService, EngineConfig, IntakeEngine, KnowledgeBase, Phase, Report,
    SessionId, SessionManager, TurnResult,
};
use taxintake_providers::ProviderRouter;

/// Cross-border tax intake assistant
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run an interactive intake consultation
    Chat {
        /// Knowledge base directory (intake.json + tags.json)
        #[arg(long, value_name = "DIR", default_value = "knowledge_base")]
        kb: PathBuf,

        /// Engine configuration file (.toml or .json)
        #[arg(short, long, value_name = "FILE")]
        config: Option<PathBuf>,

        /// Run on keyword rules only, without a completion provider
        #[arg(long)]
        offline: bool,
    },

    /// Load and validate a knowledge base
    Validate {
        #[arg(long, value_name = "DIR", default_value = "knowledge_base")]
        kb: PathBuf,

        /// Treat warnings as errors
        #[arg(long)]
        strict: bool,
    },

    /// Build a forms report from a list of tags
    Report {
        /// Comma separated tag ids
        #[arg(long, value_delimiter = ',', required = true)]
        tags: Vec<String>,

        #[arg(long, value_name = "DIR", default_value = "knowledge_base")]
        kb: PathBuf,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match cli.command {
        Commands::Chat {
            kb,
            config,
            offline,
        } => run_chat(&kb, config.as_deref(), offline).await,
        Commands::Validate { kb, strict } => run_validate(&kb, strict).await,
        Commands::Report { tags, kb, json } => run_report(&kb, &tags, json).await,
    }
}

fn init_tracing(verbose: bool) {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_log_level(verbose)));

    if verbose {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_writer(std::io::stderr)
            .init();
    }
}

fn default_log_level(verbose: bool) -> &'static str {
    if verbose {
        "debug"
    } else {
        "info"
    }
}

fn load_config(path: Option<&Path>) -> anyhow::Result<EngineConfig> {
    let config = match path {
        Some(path) => EngineConfig::from_file(path)
            .with_context(|| format!("Failed to load engine config {:?}", path))?,
        None => EngineConfig::default(),
    };
    let config = config.apply_env()?;
    config.validate()?;
    Ok(config)
}

async fn load_kb(dir: &Path) -> anyhow::Result<Arc<KnowledgeBase>> {
    let kb = KnowledgeBase::load_dir(dir)
        .await
        .with_context(|| format!("Failed to load knowledge base from {:?}", dir))?;
    Ok(Arc::new(kb))
}

async fn run_chat(kb_dir: &Path, config: Option<&Path>, offline: bool) -> anyhow::Result<()> {
    let kb = load_kb(kb_dir).await?;
    let config = load_config(config)?;

    let engine = if offline {
        IntakeEngine::offline(kb, config)
    } else {
        match ProviderRouter::from_env() {
            Ok(router) => {
                tracing::info!("Completion providers: {}", router.provider_names().join(", "));
                let service: Arc<dyn CompletionService> = Arc::new(router);
                IntakeEngine::new(kb, config, service)
            }
            Err(error) => {
                eprintln!(
                    "{} {:#}\n{}",
                    "warning:".yellow().bold(),
                    error,
                    "Continuing with keyword rules only.".dimmed()
                );
                IntakeEngine::offline(kb, config)
            }
        }
    };

    let sessions = SessionManager::new(Arc::new(engine));
    print_banner();

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut session: Option<SessionId> = None;

    prompt();
    while let Some(line) = lines.next_line().await? {
        let input = line.trim();

        let current = session.clone();
        let result = match (input, current.as_ref()) {
            ("/quit" | "/exit", _) => break,
            ("/summary", Some(id)) => {
                let summary = sessions.get_summary(id).await?;
                println!("{}", serde_json::to_string_pretty(&summary)?);
                prompt();
                continue;
            }
            ("/force", Some(id)) => sessions.force_transition(id).await?,
            ("/summary" | "/force", None) => {
                println!("{}", "Say something first to start a session.".dimmed());
                prompt();
                continue;
            }
            (text, None) => {
                let (id, result) = sessions.start_turn(None, text).await?;
                println!("{} {}", "session".dimmed(), id.as_str().dimmed());
                session = Some(id);
                result
            }
            (text, Some(id)) => sessions.continue_turn(id, text).await?,
        };

        print_turn(&result);
        prompt();
    }

    if let Some(id) = session {
        sessions.end_session(&id)?;
    }
    Ok(())
}

async fn run_validate(kb_dir: &Path, strict: bool) -> anyhow::Result<()> {
    let (intake, tags) = KnowledgeBase::read_raw(kb_dir)
        .await
        .with_context(|| format!("Failed to read knowledge base from {:?}", kb_dir))?;
    let report = KnowledgeBase::validate(&intake, &tags);

    println!("{} {:?}", "Knowledge base:".bold(), kb_dir);
    println!(
        "  {} gating questions, {} modules ({} questions), {} tags, {} jurisdictions",
        report.stats.gating_questions,
        report.stats.modules,
        report.stats.module_questions,
        report.stats.tags,
        report.stats.jurisdictions
    );

    for error in &report.errors {
        println!("  {} {}", "error:".red().bold(), error);
    }
    for warning in &report.warnings {
        println!("  {} {}", "warning:".yellow().bold(), warning);
    }

    if report.passes(strict) {
        println!("{}", "✓ valid".green().bold());
        Ok(())
    } else {
        anyhow::bail!(
            "validation failed with {} errors and {} warnings{}",
            report.errors.len(),
            report.warnings.len(),
            if strict { " (strict)" } else { "" }
        )
    }
}

async fn run_report(kb_dir: &Path, tags: &[String], json: bool) -> anyhow::Result<()> {
    let kb = load_kb(kb_dir).await?;
    let tags: Vec<String> = tags
        .iter()
        .map(|t| t.trim().to_string())
        .filter(|t| !t.is_empty())
        .collect();

    for tag in tags.iter().filter(|t| !kb.has_tag(t)) {
        eprintln!("{} unknown tag '{}' ignored", "warning:".yellow().bold(), tag);
    }

    let report = synthesize(&tags, &kb);
    print_report(&report, json)
}

fn print_report(report: &Report, json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(report)?);
    } else {
        println!("{}", report.to_markdown());
    }
    Ok(())
}

fn print_turn(result: &TurnResult) {
    println!();
    println!("{} {}", "Assistant:".cyan().bold(), result.assistant_text);

    if !result.quick_reply_options.is_empty() {
        println!("  {}", format!("[{}]", result.quick_reply_options.join(" / ")).dimmed());
    }
    if !result.assigned_tags.is_empty() && result.phase == Phase::Intake {
        println!("  {} {}", "tags:".dimmed(), result.assigned_tags.join(", ").dimmed());
    }
    if result.transitioned {
        println!("{}", "Intake complete. Type /summary for details or /quit to exit.".green());
    }
}

fn print_banner() {
    println!("{}", "Cross-border tax intake".bold());
    println!(
        "{}",
        "Commands: /summary  /force (finish now)  /quit".dimmed()
    );
    println!();
}

fn prompt() {
    use std::io::Write;
    print!("{} ", "You:".bold());
    let _ = std::io::stdout().flush();
}
