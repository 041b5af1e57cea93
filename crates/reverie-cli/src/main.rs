//! `reverie-cli` – Reverie Command Line Interface
//!
//! The `reverie` binary hosts the whole engine in one process.  It:
//!
//! 1. Checks for `~/.reverie/config.toml`; runs a **First-Run Wizard** when
//!    the file is absent.
//! 2. Probes the local Ollama instance that embeds incoming records.
//! 3. Opens the SQLite store, starts the [`Engine`] and its maintenance
//!    scheduler.
//! 4. Drops the user into an **interactive REPL** (`/ingest`, `/clusters`,
//!    `/patterns`, `/serve`, …).
//!
//! Ctrl-C stops a running gateway; outside `/serve` it ends the session.

mod config;
mod ollama;
mod repl;

use std::sync::Arc;

use colored::Colorize;
use reverie_memory::MemoryStore;
use reverie_runtime::{Engine, init_tracing};
use tokio::sync::watch;
use tracing::{info, warn};

fn main() {
    // RUST_LOG filters; REVERIE_LOG_FORMAT=json switches to JSON lines;
    // OTEL_EXPORTER_OTLP_ENDPOINT enables span export.
    let _telemetry = init_tracing("reverie-cli");

    print_banner();

    // ── Ctrl-C handler ────────────────────────────────────────────────────
    let (interrupt_tx, interrupts) = watch::channel(0u64);
    if let Err(e) = ctrlc::set_handler(move || {
        println!();
        println!("{}", "⚠  Ctrl-C received".yellow().bold());
        interrupt_tx.send_modify(|n| *n += 1);
    }) {
        warn!(error = %e, "Failed to install Ctrl-C handler; /serve can only be stopped by exiting");
    }

    // ── First-Run Wizard ──────────────────────────────────────────────────
    let cfg = match config::load() {
        Ok(None) => run_first_run_wizard(),
        Ok(Some(cfg)) => {
            println!(
                "  Config loaded from {}",
                config::config_path().display().to_string().bold()
            );
            cfg
        }
        Err(e) => {
            println!("{}: {}", "Config error".red(), e);
            println!("  Using default configuration.");
            config::Config::default()
        }
    };

    // ── Ollama discovery ──────────────────────────────────────────────────
    print!("\n  Probing Ollama at {} … ", cfg.ollama_url.dimmed());
    match ollama::fetch_models(&cfg.ollama_url) {
        Ok(models) => {
            println!("{} ({} model(s) available)", "online".green(), models.len());
            let wanted = cfg.embedding_model.as_str();
            if !models.iter().any(|m| m.name == wanted || m.name.starts_with(&format!("{wanted}:"))) {
                println!(
                    "  {}  Run `{}` before ingesting records without embeddings.",
                    format!("Embedding model '{}' not found.", wanted).yellow(),
                    format!("ollama pull {}", wanted).bold()
                );
            }
        }
        Err(_) => {
            println!("{}", "offline".yellow());
            println!(
                "  {}  Records without embeddings will be retried until `{}` is running.",
                "No Ollama instance detected.".dimmed(),
                "ollama serve".bold()
            );
        }
    }

    // ── Engine ────────────────────────────────────────────────────────────
    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("{}: {}", "Failed to start async runtime".red(), e);
            std::process::exit(1);
        }
    };
    let engine = match start_engine(&cfg) {
        Ok(engine) => engine,
        Err(e) => {
            eprintln!("{}: {}", "Failed to start engine".red(), e);
            std::process::exit(1);
        }
    };
    let (stop_tx, stop_rx) = watch::channel(false);
    let maintenance = {
        let _guard = runtime.enter();
        engine.spawn_maintenance(stop_rx)
    };
    info!(
        database = %cfg.database_path,
        dimensions = cfg.engine.dimensions,
        "engine started"
    );

    println!();
    println!("  Type {} for a list of commands.\n", "/help".bold().cyan());

    // ── Interactive REPL ──────────────────────────────────────────────────
    repl::run(&runtime, &engine, cfg.gateway_port, interrupts);

    let _ = stop_tx.send(true);
    let _ = runtime.block_on(maintenance);
    // The embedder's blocking HTTP client must be dropped outside the runtime.
    drop(engine);
    runtime.shutdown_timeout(std::time::Duration::from_secs(5));
}

fn start_engine(cfg: &config::Config) -> Result<Engine, String> {
    config::ensure_database_dir(cfg)?;
    let store = MemoryStore::open(&cfg.database_path, cfg.engine.dimensions)
        .map_err(|e| format!("cannot open {}: {}", cfg.database_path, e))?;
    let embedder = ollama::OllamaEmbedder::new(&cfg.ollama_url, &cfg.embedding_model, cfg.engine.dimensions)?;
    Engine::with_enricher(Arc::new(store), cfg.engine.clone(), Arc::new(embedder)).map_err(|e| e.to_string())
}

// ─────────────────────────────────────────────────────────────────────────────
// First-Run Wizard
// ─────────────────────────────────────────────────────────────────────────────

fn run_first_run_wizard() -> config::Config {
    println!();
    println!("{}", "  ╔══════════════════════════════════════╗".bold().cyan());
    println!("{}", "  ║       Reverie First-Run Wizard       ║".bold().cyan());
    println!("{}", "  ╚══════════════════════════════════════╝".bold().cyan());
    println!();
    println!("  No configuration found.  Let's set up Reverie.\n");

    let mut cfg = config::Config::default();

    cfg.database_path = prompt_line(
        &format!("  Database file [{}]: ", cfg.database_path),
        &cfg.database_path,
    );
    cfg.ollama_url = prompt_line(&format!("  Ollama URL [{}]: ", cfg.ollama_url), &cfg.ollama_url);
    cfg.embedding_model = prompt_line(
        &format!("  Embedding model [{}]: ", cfg.embedding_model),
        &cfg.embedding_model,
    );

    let dims = prompt_line(
        &format!("  Embedding dimensions [{}]: ", cfg.engine.dimensions),
        &cfg.engine.dimensions.to_string(),
    );
    match dims.trim().parse::<usize>() {
        Ok(d) if d > 0 => cfg.engine.dimensions = d,
        _ => println!("  {}", "Invalid dimension count; keeping the default.".yellow()),
    }

    let port = prompt_line(
        &format!("  Gateway port [{}]: ", cfg.gateway_port),
        &cfg.gateway_port.to_string(),
    );
    if let Ok(p) = port.trim().parse::<u16>() {
        cfg.gateway_port = p;
    }

    match config::save(&cfg) {
        Ok(()) => println!(
            "\n  {} Config saved to {}\n",
            "✓".green().bold(),
            config::config_path().display().to_string().bold()
        ),
        Err(e) => println!("{}: {}", "Error saving config".red(), e),
    }
    cfg
}

// ─────────────────────────────────────────────────────────────────────────────
// Banner
// ─────────────────────────────────────────────────────────────────────────────

fn print_banner() {
    println!();
    println!("{}", r#"    ___              _     "#.bold().magenta());
    println!("{}", r#"   / _ \___ _  _____(_)__  "#.bold().magenta());
    println!("{}", r#"  / , _/ -_) |/ / -_) / -_)"#.bold().magenta());
    println!("{}", r#" /_/|_|\__/|___/\__/_/\__/ "#.bold().magenta());
    println!();
    println!(
        "  {} {}",
        "Reverie".bold(),
        format!("v{}", env!("CARGO_PKG_VERSION")).dimmed()
    );
    println!("  Memory & Recall Engine");
    println!();
}

// ─────────────────────────────────────────────────────────────────────────────
// Helpers
// ─────────────────────────────────────────────────────────────────────────────

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
