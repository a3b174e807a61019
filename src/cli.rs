//! Command-line surface shared by `pcraft` and `pcraft-server`: console
//! command parsing and environment-driven setup.

use std::env;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use thiserror::Error;

use crate::capability::SimulatedGame;
use crate::config::EngineConfig;
use crate::library::MacroLibrary;
use crate::scheduler::Scheduler;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlCommand {
    Run { name: String, loops: Option<u32> },
    /// Run a macro as a crafting loop; no count runs until stopped.
    Craft { name: String, count: Option<u32> },
    Pause { at_loop: bool },
    Resume,
    Stop { at_loop: bool },
    Step,
    Status,
    List,
    Help,
    Version,
    About,
    Exit,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CliError {
    #[error("unknown command {0:?}; try `help`")]
    Unknown(String),

    #[error("usage: {0}")]
    Usage(&'static str),
}

const RUN_USAGE: &str = "run [loop <N>] <name>";
const CRAFT_USAGE: &str = "craft [<N>] <name>";

/// One console line. Blank lines and comments are `None`.
pub fn parse_control(line: &str) -> Result<Option<ControlCommand>, CliError> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return Ok(None);
    }
    let (head, rest) = match line.split_once(char::is_whitespace) {
        Some((h, r)) => (h, r.trim()),
        None => (line, ""),
    };
    let at_loop = |usage| match rest.to_ascii_lowercase().as_str() {
        "" => Ok(false),
        "loop" => Ok(true),
        _ => Err(CliError::Usage(usage)),
    };

    let cmd = match head.to_ascii_lowercase().as_str() {
        "run" => parse_run(rest)?,
        "craft" => parse_craft(rest)?,
        "pause" => ControlCommand::Pause {
            at_loop: at_loop("pause [loop]")?,
        },
        "stop" => ControlCommand::Stop {
            at_loop: at_loop("stop [loop]")?,
        },
        "resume" if rest.is_empty() => ControlCommand::Resume,
        "step" if rest.is_empty() => ControlCommand::Step,
        "status" if rest.is_empty() => ControlCommand::Status,
        "list" if rest.is_empty() => ControlCommand::List,
        "help" | "--help" | "-h" => ControlCommand::Help,
        "version" | "--version" | "-v" => ControlCommand::Version,
        "about" | "--about" => ControlCommand::About,
        "exit" | "quit" => ControlCommand::Exit,
        _ => return Err(CliError::Unknown(line.to_string())),
    };
    Ok(Some(cmd))
}

/// Arguments of `run`: `<name>` or `loop <N> <name>`. Names may contain spaces
/// and may be quoted.
pub fn parse_run(args: &str) -> Result<ControlCommand, CliError> {
    let args = args.trim();
    let mut words = args.splitn(3, char::is_whitespace);
    let first = words.next().unwrap_or_default();

    if first.eq_ignore_ascii_case("loop") {
        if let (Some(count), Some(name)) = (words.next(), words.next()) {
            if let Ok(n) = count.parse::<u32>() {
                let name = unquote(name);
                if name.is_empty() {
                    return Err(CliError::Usage(RUN_USAGE));
                }
                return Ok(ControlCommand::Run {
                    name,
                    loops: Some(n),
                });
            }
        }
    }

    let name = unquote(args);
    if name.is_empty() {
        return Err(CliError::Usage(RUN_USAGE));
    }
    Ok(ControlCommand::Run { name, loops: None })
}

/// Arguments of `craft`: `<name>` or `<N> <name>`.
pub fn parse_craft(args: &str) -> Result<ControlCommand, CliError> {
    let args = args.trim();
    let (count, name) = match args.split_once(char::is_whitespace) {
        Some((n, rest)) => match n.parse::<u32>() {
            Ok(n) => (Some(n), rest),
            Err(_) => (None, args),
        },
        None => (None, args),
    };
    let name = unquote(name);
    if name.is_empty() {
        return Err(CliError::Usage(CRAFT_USAGE));
    }
    Ok(ControlCommand::Craft { name, count })
}

fn unquote(s: &str) -> String {
    let s = s.trim();
    s.strip_prefix('"')
        .and_then(|t| t.strip_suffix('"'))
        .unwrap_or(s)
        .trim()
        .to_string()
}

/* ───────────────────── Setup ───────────────────── */

/// The simulated game: `PCRAFT_WORLD` names a JSON world, otherwise an empty one.
pub fn load_game(stdout: bool) -> anyhow::Result<SimulatedGame> {
    let game = match env::var("PCRAFT_WORLD") {
        Ok(path) if !path.trim().is_empty() => {
            let path = PathBuf::from(path.trim());
            SimulatedGame::from_json_file(&path)
                .with_context(|| format!("loading world {}", path.display()))?
        }
        _ => SimulatedGame::default(),
    };
    Ok(game.with_stdout(stdout))
}

/// The macro library; a missing directory is an empty library.
pub fn load_library(dir: &Path) -> anyhow::Result<MacroLibrary> {
    if !dir.is_dir() {
        tracing::warn!(dir = %dir.display(), "macro directory not found, library is empty");
        return Ok(MacroLibrary::new());
    }
    MacroLibrary::from_dir(dir).with_context(|| format!("loading macros from {}", dir.display()))
}

pub fn scheduler_from_env(config_path: Option<&Path>, stdout: bool) -> anyhow::Result<Scheduler> {
    let config = EngineConfig::load(config_path).context("loading configuration")?;
    let library = load_library(&config.macros_dir)?;
    let game = load_game(stdout)?;
    Ok(Scheduler::new(Arc::new(game), config, Arc::new(library)))
}
