//! REPL – Read-Eval-Print Loop for the Reverie interactive shell.
//!
//! Supported slash-commands:
//!   /help                              – show this list
//!   /ingest <file.jsonl>               – ingest one raw memory per line
//!   /clusters <user>                   – cluster query
//!   /patterns <user> <type> [window]   – pattern query
//!   /sweep <user> [window]             – run a pattern sweep and wait for it
//!   /maintain                          – run one maintenance pass now
//!   /status                            – store and retry counters
//!   /serve                             – run the gateway until Ctrl-C
//!   /quit | /exit                      – leave the shell

use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use chrono::Utc;
use colored::Colorize;
use reverie_gateway::GatewayServer;
use reverie_runtime::{Engine, IngestStatus};
use reverie_types::{ClusterQuery, PatternQuery, PatternType, RawMemory, Timeframe};
use rustyline::DefaultEditor;
use rustyline::error::ReadlineError;
use tokio::runtime::Runtime;
use tokio::sync::watch;

/// A parsed slash-command.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Help,
    Ingest { path: PathBuf },
    Clusters { user_id: String },
    Patterns { user_id: String, pattern: String, timeframe: String },
    Sweep { user_id: String, timeframe: Timeframe },
    Maintain,
    Status,
    Serve,
    Quit,
}

/// Parse one input line.  The error is the message shown to the user.
pub fn parse_command(line: &str) -> Result<Command, String> {
    let mut words = line.split_whitespace();
    let Some(head) = words.next() else {
        return Err("empty command".to_string());
    };
    let args: Vec<&str> = words.collect();
    let arg = |i: usize, usage: &str| {
        args.get(i)
            .map(|s| s.to_string())
            .ok_or_else(|| format!("usage: {}", usage))
    };

    match head {
        "/help" => Ok(Command::Help),
        "/ingest" => Ok(Command::Ingest {
            path: PathBuf::from(arg(0, "/ingest <file.jsonl>")?),
        }),
        "/clusters" => Ok(Command::Clusters {
            user_id: arg(0, "/clusters <user>")?,
        }),
        "/patterns" => {
            let usage = "/patterns <user> <type> [week|month|all]";
            Ok(Command::Patterns {
                user_id: arg(0, usage)?,
                pattern: arg(1, usage)?,
                timeframe: args.get(2).unwrap_or(&"all").to_string(),
            })
        }
        "/sweep" => {
            let user_id = arg(0, "/sweep <user> [week|month|all]")?;
            let timeframe = match args.get(1) {
                Some(s) => s.parse::<Timeframe>().map_err(|e| e.to_string())?,
                None => Timeframe::All,
            };
            Ok(Command::Sweep { user_id, timeframe })
        }
        "/maintain" => Ok(Command::Maintain),
        "/status" => Ok(Command::Status),
        "/serve" => Ok(Command::Serve),
        "/quit" | "/exit" => Ok(Command::Quit),
        other => Err(format!("Unknown command '{}'", other)),
    }
}

/// Entry point for the interactive REPL.
///
/// `interrupts` ticks on every Ctrl-C.  While `/serve` runs a tick stops the
/// gateway; at any other time it ends the session.
pub fn run(runtime: &Runtime, engine: &Engine, gateway_port: u16, mut interrupts: watch::Receiver<u64>) {
    let mut editor = match DefaultEditor::new() {
        Ok(editor) => editor,
        Err(e) => {
            eprintln!("{}: {}", "Failed to start line editor".red(), e);
            return;
        }
    };
    let history = history_path();
    let _ = editor.load_history(&history);

    loop {
        if interrupts.has_changed().unwrap_or(true) {
            break;
        }

        let line = match editor.readline(&format!("{} ", "reverie>".bold().cyan())) {
            Ok(line) => line,
            Err(ReadlineError::Interrupted | ReadlineError::Eof) => break,
            Err(e) => {
                eprintln!("{}: {}", "Read error".red(), e);
                break;
            }
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let _ = editor.add_history_entry(line);

        let command = match parse_command(line) {
            Ok(command) => command,
            Err(msg) => {
                println!("{} Type {} for available commands.", msg.red(), "/help".bold());
                continue;
            }
        };
        match command {
            Command::Help => cmd_help(),
            Command::Ingest { path } => cmd_ingest(runtime, engine, &path),
            Command::Clusters { user_id } => cmd_clusters(runtime, engine, user_id),
            Command::Patterns {
                user_id,
                pattern,
                timeframe,
            } => cmd_patterns(runtime, engine, user_id, pattern, timeframe),
            Command::Sweep { user_id, timeframe } => cmd_sweep(runtime, engine, &user_id, timeframe),
            Command::Maintain => cmd_maintain(runtime, engine),
            Command::Status => cmd_status(runtime, engine),
            Command::Serve => cmd_serve(runtime, engine, gateway_port, &mut interrupts),
            Command::Quit => break,
        }
    }

    let _ = editor.save_history(&history);
    println!("{}", "Goodbye.".green());
}

fn history_path() -> PathBuf {
    crate::config::config_path().with_file_name("history")
}

// ─────────────────────────────────────────────────────────────────────────────
// Commands
// ─────────────────────────────────────────────────────────────────────────────

fn cmd_help() {
    println!();
    println!("  {}", "Available commands:".bold());
    println!("    {}  ingest one raw memory per line", "/ingest <file.jsonl>".cyan());
    println!("    {}  list a user's clusters and emergent themes", "/clusters <user>".cyan());
    println!(
        "    {}  query {} patterns",
        "/patterns <user> <type> [week|month|all]".cyan(),
        PatternType::ALL.map(|p| p.as_str()).join(" | ").dimmed()
    );
    println!("    {}  run a pattern sweep now", "/sweep <user> [week|month|all]".cyan());
    println!("    {}  tick, merge and heal every user's clusters", "/maintain".cyan());
    println!("    {}  store and retry counters", "/status".cyan());
    println!("    {}  run the gateway until Ctrl-C", "/serve".cyan());
    println!("    {}  leave the shell", "/quit".cyan());
    println!();
}

/// Counters of one `/ingest` run.
#[derive(Debug, Default, PartialEq)]
pub struct IngestSummary {
    pub ingested: usize,
    pub duplicates: usize,
    pub deferred: usize,
    /// `(line number, reason)` of every rejected line.
    pub failed: Vec<(usize, String)>,
}

/// Ingest every non-blank line of `reader` as a [`RawMemory`] JSON object.
pub async fn ingest_jsonl(engine: &Engine, reader: impl BufRead) -> IngestSummary {
    let mut summary = IngestSummary::default();
    for (idx, line) in reader.lines().enumerate() {
        let line_no = idx + 1;
        let line = match line {
            Ok(line) => line,
            Err(e) => {
                summary.failed.push((line_no, e.to_string()));
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        let raw: RawMemory = match serde_json::from_str(&line) {
            Ok(raw) => raw,
            Err(e) => {
                summary.failed.push((line_no, e.to_string()));
                continue;
            }
        };
        match engine.ingest_raw(raw).await {
            Ok(IngestStatus::Ingested(receipt)) if receipt.duplicate => summary.duplicates += 1,
            Ok(IngestStatus::Ingested(_)) => summary.ingested += 1,
            Ok(IngestStatus::Deferred { .. }) => summary.deferred += 1,
            Err(e) => summary.failed.push((line_no, e.to_string())),
        }
    }
    summary
}

fn cmd_ingest(runtime: &Runtime, engine: &Engine, path: &Path) {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(e) => {
            println!("{}: {}: {}", "Cannot open".red(), path.display(), e);
            return;
        }
    };
    let summary = runtime.block_on(ingest_jsonl(engine, BufReader::new(file)));
    println!(
        "  {} ingested, {} duplicate(s), {} deferred, {} failed",
        summary.ingested.to_string().green().bold(),
        summary.duplicates,
        summary.deferred.to_string().yellow(),
        summary.failed.len().to_string().red()
    );
    for (line_no, reason) in summary.failed.iter().take(10) {
        println!("    line {}: {}", line_no, reason.dimmed());
    }
}

fn cmd_clusters(runtime: &Runtime, engine: &Engine, user_id: String) {
    let query = ClusterQuery { user_id };
    let resp = match runtime.block_on(engine.cluster_query(&query)) {
        Ok(resp) => resp,
        Err(e) => {
            println!("{}: {}", "Cluster query failed".red(), e);
            return;
        }
    };
    if resp.clusters.is_empty() {
        println!("  {}", "No clusters yet.".dimmed());
        return;
    }
    println!();
    for c in &resp.clusters {
        println!(
            "  {} strength {:.2}  valence {:+.2}  {}",
            c.id[..8].dimmed(),
            c.strength_score,
            c.emotional_context,
            c.phase_context.cyan()
        );
        println!("    {}", c.concepts.join(", "));
    }
    if !resp.emergent_themes.is_empty() {
        println!();
        println!("  {} {}", "Emergent themes:".bold(), resp.emergent_themes.join(", ").green());
    }
    println!();
}

fn cmd_patterns(runtime: &Runtime, engine: &Engine, user_id: String, pattern: String, timeframe: String) {
    let query = PatternQuery {
        user_id,
        pattern,
        timeframe,
    };
    let resp = match runtime.block_on(engine.pattern_query(&query)) {
        Ok(resp) => resp,
        Err(e) => {
            println!("{}: {}", "Pattern query failed".red(), e);
            return;
        }
    };
    if resp.is_empty() {
        println!("  {}", "No patterns found (a sweep may still be running).".dimmed());
        return;
    }
    println!();
    for p in &resp.patterns {
        println!("  {} {}", format!("×{}", p.frequency).bold(), p.pattern);
        for insight in &p.insights {
            println!("      {}", insight.dimmed());
        }
    }
    for p in &resp.predictions {
        println!("  {} {}", format!("{:>5.1}%", p.confidence).yellow(), p.prediction);
    }
    println!("  {} supporting memories", resp.memories.len());
    println!();
}

fn cmd_sweep(runtime: &Runtime, engine: &Engine, user_id: &str, timeframe: Timeframe) {
    match runtime.block_on(engine.sweep_now(user_id, timeframe)) {
        Ok(Some(result)) => {
            for pattern_type in PatternType::ALL {
                println!(
                    "  {:<20} {}",
                    pattern_type.as_str(),
                    result.patterns_of(pattern_type).len()
                );
            }
            println!("  {:<20} {}", "predictions", result.predictions.len());
        }
        Ok(None) => println!("  {}", "Sweep produced no result.".dimmed()),
        Err(e) => println!("{}: {}", "Sweep failed".red(), e),
    }
}

fn cmd_maintain(runtime: &Runtime, engine: &Engine) {
    match runtime.block_on(engine.maintain_all(Utc::now())) {
        Ok(reports) => {
            for (user_id, report) in reports {
                println!(
                    "  {:<16} dormant {}  pruned {}  merged {}  healed {}",
                    user_id,
                    report.tick.dormant.len(),
                    report.tick.pruned.len(),
                    report.merges.len(),
                    report.healed.len()
                );
            }
        }
        Err(e) => println!("{}: {}", "Maintenance failed".red(), e),
    }
}

fn cmd_status(runtime: &Runtime, engine: &Engine) {
    let store = engine.store().clone();
    let users = runtime.block_on(async move { tokio::task::spawn_blocking(move || store.users()).await });
    match users {
        Ok(Ok(users)) => println!("  users            {}", users.len()),
        Ok(Err(e)) => println!("{}: {}", "Store error".red(), e),
        Err(e) => println!("{}: {}", "Store error".red(), e),
    }
    println!("  dimensions       {}", engine.config().dimensions);
    println!("  pending retries  {}", engine.pending_retries().total());
}

fn cmd_serve(runtime: &Runtime, engine: &Engine, port: u16, interrupts: &mut watch::Receiver<u64>) {
    interrupts.borrow_and_update();
    println!(
        "  Gateway on {}  (Ctrl-C to stop)",
        format!("ws://localhost:{}", port).bold()
    );
    let server = GatewayServer::new(engine.clone()).with_port(port);
    let stop = interrupts.clone();
    let result = runtime.block_on(server.run_until(async move {
        let mut stop = stop;
        let _ = stop.changed().await;
    }));
    // The Ctrl-C that stopped the gateway must not also end the session.
    interrupts.borrow_and_update();
    match result {
        Ok(()) => println!("  {}", "Gateway stopped.".green()),
        Err(e) => println!("{}: {}", "Gateway error".red(), e),
    }
}
