//! Text-mode host for the lunabridge scripting engine.
//!
//! Runs script files, an interactive console, or both (`-i`).

mod builtins;
mod settings;

use std::env;
use std::io::{self, BufRead, Write};
use std::path::Path;

use anyhow::{Context, Result};
use luna_bridge::{Console, ConsoleAction, Prompt, ScriptEngine, ValueKind};
use tracing::debug;

use settings::Settings;

fn print_usage(program: &str) {
    eprintln!("Usage:");
    eprintln!("\tInteractive mode:");
    eprintln!("\t\t{program}");
    eprintln!("\tExecute a script, then exit:");
    eprintln!("\t\t{program} <filename> [script arguments]");
    eprintln!("\tExecute a script, then enter interactive mode:");
    eprintln!("\t\t{program} -i <filename> [script arguments]");
    eprintln!("\tDisplay this help message:");
    eprintln!("\t\t{program} <-h | --help>");
}

fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let program = env::args().next().unwrap_or_else(|| "luna_host".to_string());
    let args: Vec<String> = env::args().skip(1).collect();

    let mut interactive_after_script = false;
    let mut script: Option<String> = None;
    let mut script_args: Vec<String> = Vec::new();
    match args.first().map(String::as_str) {
        None => {}
        Some("-h") | Some("--help") => {
            print_usage(&program);
            return Ok(());
        }
        Some("-i") => {
            if args.len() < 2 {
                print_usage(&program);
                std::process::exit(2);
            }
            interactive_after_script = true;
            script = Some(args[1].clone());
            script_args = args[2..].to_vec();
        }
        Some(_) => {
            script = Some(args[0].clone());
            script_args = args[1..].to_vec();
        }
    }
    let interactive = script.is_none() || interactive_after_script;

    let engine = ScriptEngine::new()?;
    builtins::install(&engine, &script_args)?;
    log_globals(&engine);

    if let Some(path) = script {
        let source = std::fs::read_to_string(&path)
            .with_context(|| format!("cannot read script file {path}"))?;
        let result = engine.execute_sync(&source, &path);
        for value in &result.results {
            println!("{value}");
        }
        if !result.success {
            eprintln!("{}", result.error_message);
            if !interactive {
                std::process::exit(1);
            }
        }
        if !interactive {
            return Ok(());
        }
    }

    let settings = Settings::load(Path::new("luna_host.json"));
    if settings.banner {
        println!("luna_host {} (lunabridge {})", env!("CARGO_PKG_VERSION"), luna_bridge::VERSION);
        println!("Type \"quit\" to exit.");
    }
    repl(&engine, &settings)
}

fn repl(engine: &ScriptEngine, settings: &Settings) -> Result<()> {
    let mut console = Console::new(engine);
    let stdout = io::stdout();

    let show_prompt = |prompt: Prompt| -> Result<()> {
        let mut out = stdout.lock();
        match prompt {
            Prompt::Primary => out.write_all(settings.prompt.as_bytes())?,
            Prompt::Continuation => out.write_all(settings.continuation_prompt.as_bytes())?,
        }
        out.flush()?;
        Ok(())
    };

    show_prompt(Prompt::Primary)?;
    for line in io::stdin().lock().lines() {
        let line = line?;
        let reply = console.feed_line(&line);
        print!("{}", reply.output);
        match reply.action {
            ConsoleAction::Quit => break,
            ConsoleAction::Clear => print!("\x1b[2J\x1b[H"),
            ConsoleAction::None => {}
        }
        show_prompt(reply.prompt)?;
    }
    Ok(())
}

/// Log the interpreter's global names at debug level without copying the
/// global table.
fn log_globals(engine: &ScriptEngine) {
    let Ok(mut cursor) = engine.global_cursor(None) else {
        return;
    };
    let mut names = Vec::new();
    while cursor.is_valid() {
        if cursor.key_type() == ValueKind::String {
            names.push(cursor.key().to_string());
        }
        if cursor.advance().is_err() {
            break;
        }
    }
    names.sort();
    debug!(count = names.len(), "globals: {}", names.join(", "));
}
