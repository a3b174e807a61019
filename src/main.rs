use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{bail, Context};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::task::JoinHandle;

use pcraft::banner;
use pcraft::cli::{self, ControlCommand};
use pcraft::engine;
use pcraft::library::MacroKind;
use pcraft::logging;
use pcraft::scheduler::{MacroControl, MacroHandle, RunReport};

const PCRAFT_VERSION: &str = env!("CARGO_PKG_VERSION");
const PCRAFT_ABOUT: &str =
    "PCRAFT CLI – step-by-step macro automation for crafting and gathering.";

fn print_version() {
    println!("⚒  PCRAFT version {}", PCRAFT_VERSION);
}

fn print_about() {
    println!("{}", PCRAFT_ABOUT);
}

fn print_help() {
    println!(
        r#"
PCRAFT — help

Command line:
────────────────────────────────
pcraft                           → Interactive console
pcraft run <name>                → Run a macro from the library
pcraft run loop <N> <name>       → Run with its last /loop set to N
pcraft craft [<N>] <name>        → Run a macro as a loop of N crafts
pcraft check <file>              → Validate a .macro or .script file
pcraft <file>                    → Run a macro file directly
pcraft --config <file> ...       → Load settings from a JSON file

Console:
────────────────────────────────
run [loop <N>] <name>            → Start a macro in the background
craft [<N>] <name>               → Start a crafting loop (forever without N)
pause / pause loop               → Pause now / at the next loop
resume                           → Resume a paused macro
stop / stop loop                 → Stop now / at the next loop
step                             → Run one step, then pause again
status                           → Show the running macro(s)
list                             → Show the macro library
exit                             → Stop and quit

Macro commands:
────────────────────────────────
/action <name>     (/ac)         → Use an action, retried until acknowledged
/click <button>                  → Click an addon button
/craft <N>         (/gate)       → Allow N passes, then end the macro
/loop [N]                        → Repeat from the top (N more times, or forever)
/recipe <name>                   → Open a recipe
/require <status>                → Wait for a status effect
/requirequality <N>              → Wait for quality ≥ N
/requirerepair                   → Pause if gear needs repair
/requirespiritbond [N]           → Pause when materia can be extracted
/requirestats <cms> <ctrl> <cp>  → Wait for stats
/item <name>                     → Use an item
/runmacro <name>                 → Run another macro, then continue
/send /hold /release <KEY+KEY>   → Keyboard input
/target <name>                   → Target an entity
/waitaddon <addon>               → Wait for an addon to be visible
/wait <N | lo-hi>                → Wait
/echo <text>                     → Print text (lines without "/" echo too)

Modifiers:
────────────────────────────────
<wait.N> <wait.lo-hi>            → Wait after the step
<maxwait.N>                      → Timeout for waiting steps (default 5)
<condition.good,!poor>           → Only act in these crafting conditions
<unsafe>                         → Do not wait for the server
<echo>                           → Report /loop and /craft counters
<index.N> <list.N> <hq>          → Targeting and item options

Scripts (.script):
────────────────────────────────
set n = "3"
repeat n:
    yield "/ac Observe"
set q from game: "quality"
if q >= 1000: log "done"

Environment:
────────────────────────────────
PCRAFT_CONFIG / PCRAFT_MACROS_DIR → Configuration file / macro directory
PCRAFT_WORLD                      → Simulated game state (JSON)
PCRAFT_OUTPUT_LOG=1               → Append echoed lines to logs/run_latest.log
RUST_LOG=debug                    → Diagnostics on stderr
"#
    );
}

#[tokio::main]
async fn main() -> ExitCode {
    logging::init_tracing();
    match run(env::args().skip(1).collect()).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(mut args: Vec<String>) -> anyhow::Result<ExitCode> {
    let config_path = take_config_flag(&mut args)?;

    let Some(first) = args.first().cloned() else {
        banner::print_banner();
        let scheduler = cli::scheduler_from_env(config_path.as_deref(), true)?;
        console(scheduler).await?;
        return Ok(ExitCode::SUCCESS);
    };

    match first.as_str() {
        "help" | "--help" | "-h" => {
            print_help();
            Ok(ExitCode::SUCCESS)
        }
        "--version" | "-v" => {
            print_version();
            Ok(ExitCode::SUCCESS)
        }
        "--about" => {
            print_about();
            Ok(ExitCode::SUCCESS)
        }
        "check" => {
            let file = args.get(1).context("usage: pcraft check <file>")?;
            check(Path::new(file))
        }
        "run" => {
            let ControlCommand::Run { name, loops } = cli::parse_run(&args[1..].join(" "))? else {
                bail!("usage: pcraft run [loop <N>] <name>");
            };
            banner::print_banner_stderr();
            let scheduler = cli::scheduler_from_env(config_path.as_deref(), true)?;
            let handle = scheduler.start(&name, loops)?;
            finish(handle).await
        }
        "craft" => {
            let ControlCommand::Craft { name, count } = cli::parse_craft(&args[1..].join(" "))?
            else {
                bail!("usage: pcraft craft [<N>] <name>");
            };
            banner::print_banner_stderr();
            let scheduler = cli::scheduler_from_env(config_path.as_deref(), true)?;
            let handle = scheduler.start_craft_loop(&name, count)?;
            finish(handle).await
        }
        other => {
            let path = Path::new(other);
            if !path.is_file() {
                bail!("unknown command or file: {other} (try `pcraft help`)");
            }
            banner::print_banner_stderr();
            let scheduler = cli::scheduler_from_env(config_path.as_deref(), true)?;
            let text =
                fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
            let name = path
                .file_stem()
                .and_then(|s| s.to_str())
                .unwrap_or("macro")
                .to_string();
            println!("Running macro: {}", path.display());
            let handle = match MacroKind::of_path(path) {
                MacroKind::Native => {
                    scheduler.run_script(name, Arc::new(engine::parse_macro(&text)?))
                }
                MacroKind::Script => {
                    scheduler.start_program(name, Arc::new(engine::compile_script(&text)?))
                }
            };
            finish(handle).await
        }
    }
}

fn take_config_flag(args: &mut Vec<String>) -> anyhow::Result<Option<PathBuf>> {
    let Some(pos) = args.iter().position(|a| a == "--config") else {
        return Ok(None);
    };
    if pos + 1 >= args.len() {
        bail!("usage: --config <file>");
    }
    let path = args.remove(pos + 1);
    args.remove(pos);
    Ok(Some(PathBuf::from(path)))
}

fn check(path: &Path) -> anyhow::Result<ExitCode> {
    let text = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    match engine::analyze(&text, MacroKind::of_path(path)) {
        Ok(listing) => {
            println!("{listing}");
            Ok(ExitCode::SUCCESS)
        }
        Err(e) => {
            eprintln!("Error: {e}");
            Ok(ExitCode::FAILURE)
        }
    }
}

fn print_report(report: &RunReport) {
    if report.stopped_by_user {
        println!("Macro {} stopped.", report.macro_name);
    } else {
        println!(
            "Macro {} finished: {} step(s), {} loop(s).",
            report.macro_name, report.steps_executed, report.loop_crossings
        );
    }
    if !report.soft_errors.is_empty() {
        println!("{} error(s) reported.", report.soft_errors.len());
    }
}

/// Wait for a foreground run; Ctrl-C stops the macro.
async fn finish(handle: MacroHandle) -> anyhow::Result<ExitCode> {
    let control = handle.control().clone();
    let join = handle.join();
    tokio::pin!(join);

    let result = tokio::select! {
        r = &mut join => r,
        _ = tokio::signal::ctrl_c() => {
            eprintln!("Stopping...");
            let _ = control.stop();
            join.await
        }
    };

    match result {
        Ok(report) => {
            print_report(&report);
            Ok(ExitCode::SUCCESS)
        }
        Err(e) => {
            eprintln!("Error: {e}");
            Ok(ExitCode::FAILURE)
        }
    }
}

/* ───────────────────── Interactive console ───────────────────── */

struct Running {
    control: MacroControl,
    watcher: JoinHandle<()>,
}

impl Running {
    fn is_live(&self) -> bool {
        !self.watcher.is_finished()
    }
}

fn watch(handle: MacroHandle) -> Running {
    let control = handle.control().clone();
    let watcher = tokio::spawn(async move {
        match handle.join().await {
            Ok(report) => print_report(&report),
            Err(e) => eprintln!("Error: {e}"),
        }
    });
    Running { control, watcher }
}

async fn console(scheduler: pcraft::scheduler::Scheduler) -> anyhow::Result<()> {
    println!("Type `help` for commands, `exit` to quit.");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut current: Option<Running> = None;

    loop {
        let Some(line) = lines.next_line().await.context("reading stdin")? else {
            // End of input: let a running macro finish first.
            if let Some(running) = current.take() {
                let _ = running.watcher.await;
            }
            break;
        };

        let cmd = match cli::parse_control(&line) {
            Ok(Some(cmd)) => cmd,
            Ok(None) => continue,
            Err(e) => {
                eprintln!("Error: {e}");
                continue;
            }
        };

        match cmd {
            ControlCommand::Exit => {
                if let Some(running) = current.take() {
                    let _ = running.control.stop();
                    let _ = running.watcher.await;
                }
                println!("Exiting...");
                break;
            }
            ControlCommand::Help => print_help(),
            ControlCommand::Version => print_version(),
            ControlCommand::About => print_about(),
            ControlCommand::List => {
                let names = scheduler.library().names();
                if names.is_empty() {
                    println!("(no macros)");
                }
                for name in names {
                    println!("{name}");
                }
            }
            ControlCommand::Status => match current.as_ref().filter(|r| r.is_live()) {
                Some(running) => {
                    for inv in running.control.invocations() {
                        println!("{}: {}", inv.name, inv.state.as_str());
                    }
                }
                None => println!("idle"),
            },
            cmd @ (ControlCommand::Run { .. } | ControlCommand::Craft { .. }) => {
                if let Some(running) = current.as_ref().filter(|r| r.is_live()) {
                    eprintln!("Error: {} is still running", running.control.name());
                    continue;
                }
                let (name, started) = match cmd {
                    ControlCommand::Craft { name, count } => {
                        let started = scheduler.start_craft_loop(&name, count);
                        (name, started)
                    }
                    ControlCommand::Run { name, loops } => {
                        let started = scheduler.start(&name, loops);
                        (name, started)
                    }
                    _ => continue,
                };
                match started {
                    Ok(handle) => {
                        println!("Running {name}");
                        current = Some(watch(handle));
                    }
                    Err(e) => eprintln!("Error: {e}"),
                }
            }
            request => {
                let Some(running) = current.as_ref().filter(|r| r.is_live()) else {
                    eprintln!("Error: no macro is running");
                    continue;
                };
                let control = &running.control;
                let result = match request {
                    ControlCommand::Pause { at_loop: true } => control.pause_at_loop(),
                    ControlCommand::Pause { at_loop: false } => control.pause(),
                    ControlCommand::Stop { at_loop: true } => control.stop_at_loop(),
                    ControlCommand::Stop { at_loop: false } => control.stop(),
                    ControlCommand::Resume => control.resume(),
                    ControlCommand::Step => control.step(),
                    _ => continue,
                };
                match result {
                    Ok(state) => println!("{}: {}", control.name(), state.as_str()),
                    Err(e) => eprintln!("Error: {e}"),
                }
            }
        }
    }

    Ok(())
}
