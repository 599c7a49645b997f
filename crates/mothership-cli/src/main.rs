//! `mothership` – command line entry point
//!
//! * `serve` – opens the stores, starts the supervisor loop and the HTTP/WS
//!   API, and shuts both down cleanly on Ctrl-C.
//! * `seed <file>` – loads values and beliefs from TOML.
//! * `init` – first-run wizard writing `~/.mothership/config.toml`.
//! * `config` – prints the effective configuration.

mod cli;
mod config;
mod seed;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use colored::Colorize;
use mothership_memory::KnowledgeBase;
use mothership_runtime::{KnowledgeCurator, Supervisor};
use mothership_server::AppState;
use tokio::sync::watch;
use tracing::warn;

use crate::cli::{Cli, Command};
use crate::config::Config;

type CliResult = Result<(), Box<dyn std::error::Error>>;

#[tokio::main]
async fn main() -> ExitCode {
    let args = Cli::parse();
    let _telemetry = mothership_runtime::init_tracing("mothership");

    let outcome = match args.command {
        Command::Serve { port, db } => run_serve(args.config, port, db).await,
        Command::Seed { file, db } => run_seed(args.config, file, db).await,
        Command::Init { defaults } => run_init(args.config, defaults),
        Command::Config => config::load(args.config.as_deref())
            .map(|cfg| println!("{:#?}", cfg))
            .map_err(Into::into),
    };

    match outcome {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{}: {}", "Error".red().bold(), e);
            ExitCode::FAILURE
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// serve
// ─────────────────────────────────────────────────────────────────────────────

async fn run_serve(path: Option<PathBuf>, port: Option<u16>, db: Option<String>) -> CliResult {
    let mut cfg = config::load(path.as_deref())?;
    if let Some(port) = port {
        cfg.server.port = port;
    }
    if db.is_some() {
        cfg.storage.db_path = db;
    }
    print_banner();

    let state = AppState::open(
        cfg.storage.db_path.as_deref(),
        cfg.service_config(),
        cfg.embedder(),
    )?;
    if cfg.storage.db_path.is_none() {
        println!(
            "  {} no storage.db_path set; state lives in memory only",
            "!".yellow().bold()
        );
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    if let Err(e) = ctrlc::set_handler(move || {
        println!();
        println!("{}", "⚠  Ctrl-C received – shutting down …".yellow().bold());
        let _ = shutdown_tx.send(true);
    }) {
        warn!(error = %e, "failed to install Ctrl-C handler; graceful shutdown on Ctrl-C will not be available");
    }

    let supervisor = Supervisor::new(
        state.registry.clone(),
        state.orchestrator.clone(),
        state.bus.clone(),
        cfg.supervisor_config(),
    )
    .spawn(shutdown_rx.clone());

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", cfg.server.port)).await?;
    println!(
        "  API listening on {}",
        format!("http://localhost:{}", cfg.server.port).bold()
    );
    println!(
        "  Embedding provider: {}\n",
        cfg.embedding.provider.to_string().cyan()
    );

    let mut stop = shutdown_rx;
    mothership_server::serve(listener, state, async move {
        let _ = stop.wait_for(|stopped| *stopped).await;
    })
    .await?;
    supervisor.await?;

    println!("{}", "  ✓ Mothership stopped.".green());
    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// seed
// ─────────────────────────────────────────────────────────────────────────────

async fn run_seed(path: Option<PathBuf>, file: PathBuf, db: Option<String>) -> CliResult {
    let cfg = config::load(path.as_deref())?;
    let db_path = db
        .or_else(|| cfg.storage.db_path.clone())
        .ok_or("seeding needs a database: set storage.db_path or pass --db")?;
    let raw = std::fs::read_to_string(&file)
        .map_err(|e| format!("Failed to read {}: {}", file.display(), e))?;
    let seed_file = seed::SeedFile::parse(&raw)?;

    let kb = Arc::new(KnowledgeBase::open(&db_path)?);
    let curator = KnowledgeCurator::new(kb, cfg.embedder());
    let report = seed::apply(&curator, &seed_file).await?;

    println!(
        "  {} {} value(s), {} belief(s) added, {} skipped",
        "✓".green().bold(),
        report.values_added,
        report.beliefs_added,
        report.skipped
    );
    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// First-run wizard
// ─────────────────────────────────────────────────────────────────────────────

fn run_init(path: Option<PathBuf>, defaults: bool) -> CliResult {
    let path = path.unwrap_or_else(config::config_path);
    let mut cfg = Config::default();

    if !defaults {
        println!();
        println!("{}", "  ╔══════════════════════════════════════╗".bold().cyan());
        println!("{}", "  ║     Mothership First-Run Wizard      ║".bold().cyan());
        println!("{}", "  ╚══════════════════════════════════════╝".bold().cyan());
        println!();

        let port = prompt_line(
            &format!("  API port [{}]: ", cfg.server.port),
            &cfg.server.port.to_string(),
        );
        if let Ok(p) = port.trim().parse::<u16>() {
            cfg.server.port = p;
        }

        let db = prompt_line("  SQLite database path (empty = in-memory): ", "");
        if !db.is_empty() {
            cfg.storage.db_path = Some(db);
        }

        println!("  Which embedding provider?");
        println!("    1) Local feature hashing  (default, offline)");
        println!("    2) OpenAI-compatible HTTP endpoint");
        if prompt_line("  Enter choice [1]: ", "1").trim() == "2" {
            cfg.embedding.provider = config::EmbeddingKind::Http;
            cfg.embedding.url = prompt_line(
                &format!("  Endpoint base URL [{}]: ", cfg.embedding.url),
                &cfg.embedding.url,
            );
            cfg.embedding.model = prompt_line(
                &format!("  Model [{}]: ", cfg.embedding.model),
                &cfg.embedding.model,
            );
        }
    }

    config::save_to(&cfg, &path)?;
    println!(
        "\n  {} Config saved to {}\n",
        "✓".green().bold(),
        path.display().to_string().bold()
    );
    Ok(())
}

// ─────────────────────────────────────────────────────────────────────────────
// Banner
// ─────────────────────────────────────────────────────────────────────────────

fn print_banner() {
    println!();
    println!("{}", r#"   __  ___     __  __             __   _    "#.bold().cyan());
    println!("{}", r#"  /  |/  /__  / /_/ /  ___ _____ / /  (_)__ "#.bold().cyan());
    println!("{}", r#" / /|_/ / _ \/ __/ _ \/ -_) __(_-</ _ \/ / _ \"#.bold().cyan());
    println!("{}", r#"/_/  /_/\___/\__/_//_/\__/_/ /___/_//_/_/ .__/"#.bold().cyan());
    println!("{}", r#"                                       /_/   "#.bold().cyan());
    println!();
    println!(
        "  {} {}",
        "Mothership".bold(),
        format!("v{}", env!("CARGO_PKG_VERSION")).dimmed()
    );
    println!("  Value-aligned agent orchestration");
    println!();
}

fn prompt_line(msg: &str, default: &str) -> String {
    use std::io::{BufRead, Write};
    print!("{}", msg);
    std::io::stdout().flush().ok();
    let mut line = String::new();
    match std::io::stdin().lock().read_line(&mut line) {
        Ok(_) => {
            let t = line.trim().to_string();
            if t.is_empty() { default.to_string() } else { t }
        }
        Err(_) => default.to_string(),
    }
}
