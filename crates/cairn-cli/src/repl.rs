//! REPL – interactive shell over a [`Dispatcher`].
//!
//! Input is either a JSON tool call, a `?<request>` discovery shorthand, or a
//! slash-command:
//!
//!   /help          – show this list
//!   /tools         – list the registered catalog
//!   /status        – catalog, memory and cache counters
//!   /schema        – tool-call envelope and served tool schemas
//!   /session       – show the current session id
//!   /end           – end the session (drops its cache) and start a new one
//!   /quit | /exit  – leave the shell

use colored::Colorize;
use rustyline::completion::Completer;
use rustyline::error::ReadlineError;
use rustyline::history::DefaultHistory;
use rustyline::{Context, Editor, Helper, Highlighter, Hinter, Validator};
use uuid::Uuid;

use cairn_runtime::{Dispatcher, render_block};
use cairn_types::{ObservationStatus, ToolCall};

const COMMANDS: &[&str] = &[
    "/help", "/tools", "/status", "/schema", "/session", "/end", "/quit", "/exit",
];

/// One parsed line of input.
#[derive(Debug, PartialEq)]
pub enum Input {
    Empty,
    Command(String),
    Call(ToolCall),
    Invalid(String),
}

/// Classify a line.
pub fn parse_input(line: &str) -> Input {
    let line = line.trim();
    if line.is_empty() {
        return Input::Empty;
    }
    if line.starts_with('/') {
        return Input::Command(line.to_string());
    }
    if let Some(request) = line.strip_prefix('?') {
        let request = request.trim();
        if request.is_empty() {
            return Input::Invalid("'?' needs a request, e.g. ?send an email to my team".into());
        }
        return Input::Call(ToolCall::new("tools_retriever").arg("query", request));
    }
    match serde_json::from_str::<ToolCall>(line) {
        Ok(call) => Input::Call(call),
        Err(e) => Input::Invalid(format!("not a tool call: {e}")),
    }
}

/// Slash-commands starting with `prefix`.
fn complete_command(prefix: &str) -> Vec<String> {
    COMMANDS
        .iter()
        .filter(|c| c.starts_with(prefix))
        .map(|c| c.to_string())
        .collect()
}

#[derive(Helper, Hinter, Highlighter, Validator)]
struct ReplHelper;

impl Completer for ReplHelper {
    type Candidate = String;

    fn complete(
        &self,
        line: &str,
        pos: usize,
        _ctx: &Context<'_>,
    ) -> rustyline::Result<(usize, Vec<String>)> {
        let head = &line[..pos];
        if head.starts_with('/') && !head.contains(' ') {
            Ok((0, complete_command(head)))
        } else {
            Ok((pos, Vec::new()))
        }
    }
}

/// Entry point for the interactive REPL.  Returns when the user quits or
/// closes input.
pub fn run(core: &Dispatcher) {
    let mut editor: Editor<ReplHelper, DefaultHistory> = match Editor::new() {
        Ok(editor) => editor,
        Err(e) => {
            eprintln!("{}: {}", "Terminal error".red(), e);
            return;
        }
    };
    editor.set_helper(Some(ReplHelper));

    let mut session = new_session_id();
    let prompt = format!("{} ", "cairn>".bold().cyan());

    loop {
        let line = match editor.readline(&prompt) {
            Ok(line) => line,
            Err(ReadlineError::Interrupted) => {
                println!("{}", "(interrupted – type /quit to exit)".dimmed());
                continue;
            }
            Err(ReadlineError::Eof) => break,
            Err(e) => {
                eprintln!("{}: {}", "Read error".red(), e);
                break;
            }
        };
        let _ = editor.add_history_entry(line.as_str());

        match parse_input(&line) {
            Input::Empty => {}
            Input::Invalid(msg) => println!("{} {}", "✗".red(), msg),
            Input::Call(call) => cmd_call(core, &session, &call),
            Input::Command(cmd) => match cmd.as_str() {
                "/help" => cmd_help(),
                "/tools" => cmd_tools(core),
                "/status" => cmd_status(core),
                "/schema" => cmd_schema(),
                "/session" => println!("  Session: {}", session.bold()),
                "/end" => {
                    core.end_session(&session);
                    session = new_session_id();
                    println!("{} new session {}", "✓".green(), session.bold());
                }
                "/quit" | "/exit" => {
                    core.end_session(&session);
                    println!("{}", "Goodbye.".green());
                    break;
                }
                other => println!(
                    "{} '{}'. Type {} for available commands.",
                    "Unknown command:".red(),
                    other.yellow(),
                    "/help".bold()
                ),
            },
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Command handlers
// ─────────────────────────────────────────────────────────────────────────────

fn cmd_call(core: &Dispatcher, session: &str, call: &ToolCall) {
    let obs = core.handle(session, call);
    let marker = match obs.status {
        ObservationStatus::Success => "●".green(),
        ObservationStatus::Partial => "●".yellow(),
        ObservationStatus::Error => "●".red(),
    };
    println!("{} {} {}", marker, obs.tool_name.bold(), obs.status);
    println!("{}", render_block(std::slice::from_ref(&obs)).dimmed());
}

fn cmd_help() {
    println!();
    println!("{}", "Cairn Commands".bold().underline());
    println!("  {}  – run a tool call", r#"{"tool_name": …, "parameters": {…}}"#.bold().cyan());
    println!("  {}             – discover tools for a request", "?<request>".bold().cyan());
    println!("  {}                 – list the tool catalog", "/tools".bold().cyan());
    println!("  {}                – catalog, memory and cache counters", "/status".bold().cyan());
    println!("  {}                – tool-call and served tool schemas", "/schema".bold().cyan());
    println!("  {}               – show the current session id", "/session".bold().cyan());
    println!("  {}                   – end this session and start a new one", "/end".bold().cyan());
    println!("  {}           – exit the shell", "/quit  /exit".bold().cyan());
    println!();
}

fn cmd_tools(core: &Dispatcher) {
    let tools = core.index().descriptors();
    println!("{} ({})", "Tool Catalog".bold().underline(), tools.len());
    for tool in tools {
        let tags = if tool.tags.is_empty() {
            String::new()
        } else {
            format!(" [{}]", tool.tags.join(", "))
        };
        println!("  {}{} – {}", tool.name.bold(), tags.dimmed(), tool.description);
    }
}

fn cmd_status(core: &Dispatcher) {
    let status = core.status();
    println!("{}", "Core Status".bold().underline());
    println!("  Tools      : {} (generation {})", status.tools, status.generation);
    println!(
        "  Memory     : {} leaves, {} directories, {} bytes ({})",
        status.memory.leaves, status.memory.directories, status.memory.total_bytes, status.backend
    );
    println!(
        "  Cache      : {} sessions, {} entries, {} hits / {} misses",
        status.cache.sessions, status.cache.entries, status.cache.hits, status.cache.misses
    );
}

fn cmd_schema() {
    match serde_json::to_string_pretty(&Dispatcher::tool_call_schema()) {
        Ok(schema) => println!("{}\n{}", "Tool call".bold().underline(), schema),
        Err(e) => println!("{}: {}", "Schema error".red(), e),
    }
    println!("{}", "Served tools".bold().underline());
    for tool in Dispatcher::served_tools() {
        println!("  {} – {}", tool.name.bold(), tool.description);
        println!("    {}", tool.parameters.to_string().dimmed());
    }
}

fn new_session_id() -> String {
    Uuid::new_v4().to_string()
}
