//! `emberrt-cli` – EmberRT Binary Manager shell
//!
//! This binary is the entry point for the simulated EmberRT stack.  It:
//!
//! 1. Checks for `~/.emberrt/config.toml`; runs a **First-Run Wizard** when
//!    the file is absent.
//! 2. Drops the user into an **interactive REPL** with slash-commands
//!    (`/start`, `/info`, `/load`, `/update`, `/fault`, `/help`).
//! 3. Intercepts **Ctrl-C** to exit cleanly.

mod config;
mod repl;

use colored::Colorize;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::warn;

fn main() {
    // ── Structured logging ────────────────────────────────────────────────
    // Initialise tracing-subscriber using RUST_LOG (defaults to "info").
    // Set EMBERRT_LOG_FORMAT=json to emit newline-delimited JSON logs
    // suitable for log aggregators.  The CLI's user-facing output still
    // uses println! for UX consistency.
    let log_level = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string());
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&log_level));

    if std::env::var("EMBERRT_LOG_FORMAT").as_deref() == Ok("json") {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(true)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(true)
            .compact()
            .init();
    }

    print_banner();

    // ── Shared shutdown flag ──────────────────────────────────────────────
    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_clone = shutdown.clone();

    // ── Ctrl-C handler ────────────────────────────────────────────────────
    if let Err(e) = ctrlc::set_handler(move || {
        println!();
        println!("{}", "⚠  Ctrl-C received – shutting down …".yellow().bold());
        shutdown_clone.store(true, Ordering::SeqCst);
    }) {
        warn!(error = %e, "Failed to install Ctrl-C handler; graceful shutdown on Ctrl-C will not be available");
    }

    // ── First-Run Wizard ──────────────────────────────────────────────────
    match config::load() {
        Ok(None) => run_first_run_wizard(),
        Ok(Some(_)) => {
            println!(
                "  Config loaded from {}",
                config::config_path().display().to_string().bold()
            );
        }
        Err(e) => {
            println!("{}: {}", "Config error".red(), e);
            println!("  Using default configuration.");
        }
    }

    println!();
    println!(
        "  Type {} to boot the manager, {} for a list of commands.\n",
        "/start".bold().cyan(),
        "/help".bold().cyan()
    );

    // ── Interactive REPL ──────────────────────────────────────────────────
    repl::run(shutdown);
}

// ─────────────────────────────────────────────────────────────────────────────
// First-Run Wizard
// ─────────────────────────────────────────────────────────────────────────────

fn run_first_run_wizard() {
    println!();
    println!("{}", "  ╔══════════════════════════════════════╗".bold().cyan());
    println!("{}", "  ║       EmberRT First-Run Wizard       ║".bold().cyan());
    println!("{}", "  ╚══════════════════════════════════════╝".bold().cyan());
    println!();
    println!("  No configuration found.  Let's set up the simulator.\n");

    let mut cfg = config::Config::default();

    let count_str = prompt_line(
        &format!("  Number of binary slots to provision [{}]: ", cfg.slot_count),
        &cfg.slot_count.to_string(),
    );
    if let Ok(n) = count_str.trim().parse::<usize>() {
        cfg.slot_count = n;
    }

    let size_str = prompt_line(
        &format!("  Partition size in bytes [{}]: ", cfg.part_size),
        &cfg.part_size.to_string(),
    );
    if let Ok(n) = size_str.trim().parse::<u32>() {
        cfg.part_size = n;
    }

    cfg = cfg.sanitized();
    match config::save(&cfg) {
        Ok(()) => println!(
            "\n  {} Config saved to {}\n",
            "✓".green().bold(),
            config::config_path().display().to_string().bold()
        ),
        Err(e) => println!("{}: {}", "Error saving config".red(), e),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Banner
// ─────────────────────────────────────────────────────────────────────────────

fn print_banner() {
    println!();
    println!("{}", r#"   ____     __           ___  ______"#.bold().cyan());
    println!("{}", r#"  / __/_ _ / /  ___ ____/ _ \/_  __/"#.bold().cyan());
    println!("{}", r#" / _//  ' \/ _ \/ -_) __/ , _/ / /  "#.bold().cyan());
    println!("{}", r#"/___/_/_/_/_.__/\__/_/ /_/|_| /_/   "#.bold().cyan());
    println!();
    println!("  {} {}",
        "EmberRT".bold(),
        format!("v{}", env!("CARGO_PKG_VERSION")).dimmed()
    );
    println!("  Flash-Resident Binary Manager");
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
