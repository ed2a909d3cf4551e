//! `cairn` – interactive shell for the Cairn core.
//!
//! This binary:
//!
//! 1. Installs structured logging (and OTLP export when configured).
//! 2. Loads `~/.cairn/config.toml`; on first run asks where memory should
//!    live and writes the file.
//! 3. Builds the [`Dispatcher`] and registers the tool catalog.
//! 4. Drops the user into an **interactive REPL** that accepts JSON tool
//!    calls, `?<request>` discovery shorthand and slash-commands.

mod catalog;
mod config;
mod repl;

use std::path::Path;

use cairn_runtime::{Dispatcher, init_tracing};
use colored::Colorize;
use tracing::info;

fn main() {
    // Hold the guard for the whole process so pending spans are flushed.
    let _telemetry = init_tracing("cairn");

    print_banner();

    let cfg = match config::load() {
        Ok(Some(cfg)) => {
            println!(
                "  Config loaded from {}",
                config::config_path().display().to_string().bold()
            );
            cfg
        }
        Ok(None) => run_first_run_wizard(),
        Err(e) => {
            println!("{}: {}", "Config error".red(), e);
            println!("  Using default configuration.");
            config::Config::default()
        }
    };

    let core = match Dispatcher::new(cfg.to_core_config()) {
        Ok(core) => core,
        Err(e) => {
            eprintln!("{}: {}", "Failed to start the core".red(), e);
            std::process::exit(1);
        }
    };

    let (tools, source) = match &cfg.catalog_path {
        Some(path) => match catalog::load_file(Path::new(path)) {
            Ok(tools) => (tools, path.clone()),
            Err(e) => {
                println!("{}: {}", "Catalog error".red(), e);
                (catalog::builtin(), "built-in demo catalog".to_string())
            }
        },
        None => (catalog::builtin(), "built-in demo catalog".to_string()),
    };
    let registered = catalog::register_all(&core, tools);
    info!(registered, source = %source, "catalog loaded");

    let status = core.status();
    println!(
        "  Catalog: {} tool(s) from {}",
        registered.to_string().bold(),
        source.dimmed()
    );
    println!(
        "  Memory : {} under {} ({} leaves)",
        status.backend.bold(),
        cfg.path_prefix.bold(),
        status.memory.leaves
    );
    println!();
    println!("  Type {} for a list of commands.\n", "/help".bold().cyan());

    repl::run(&core);
}

// ─────────────────────────────────────────────────────────────────────────────
// First-Run Wizard
// ─────────────────────────────────────────────────────────────────────────────

fn run_first_run_wizard() -> config::Config {
    println!();
    println!("{}", "  ╔══════════════════════════════════════╗".bold().cyan());
    println!("{}", "  ║        Cairn First-Run Setup         ║".bold().cyan());
    println!("{}", "  ╚══════════════════════════════════════╝".bold().cyan());
    println!();
    println!("  No configuration found.  Let's set up Cairn.\n");

    let mut cfg = config::Config::default();

    println!("  Where should memories be kept?");
    println!("    1) On disk in SQLite  (default, survives restarts)");
    println!("    2) In process memory only");
    let choice = prompt_line("  Enter choice [1]: ", "1");
    if choice.trim() != "2" {
        let default_db = config::cairn_dir().join("memory.db").display().to_string();
        let db = prompt_line(&format!("  Database path [{}]: ", default_db), &default_db);
        cfg.db_path = Some(db);
    }

    let prefix = prompt_line(
        &format!("  Memory namespace [{}]: ", cfg.path_prefix),
        &cfg.path_prefix,
    );
    cfg.path_prefix = prefix;

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
    println!("{}", r#"   ______      _          "#.bold().cyan());
    println!("{}", r#"  / ____/___ _(_)________ "#.bold().cyan());
    println!("{}", r#" / /   / __ `/ / ___/ __ \"#.bold().cyan());
    println!("{}", r#"/ /___/ /_/ / / /  / / / /"#.bold().cyan());
    println!("{}", r#"\____/\__,_/_/_/  /_/ /_/ "#.bold().cyan());
    println!();
    println!(
        "  {} {}",
        "Cairn".bold(),
        format!("v{}", env!("CARGO_PKG_VERSION")).dimmed()
    );
    println!("  Tool discovery and persistent memory for agents");
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
