//! Macro parser.
//!
//! Turns macro text into an ordered list of [`Step`]s:
//! - `/name args... <modifier.value> ...` lines become typed commands
//! - any other non-empty line is an implicit `/echo`
//! - `#` / `//` comment lines and blank lines are skipped, ` #` starts an inline comment
//!
//! Parsing is pure: no game state is consulted, so a script can be validated
//! long before it runs.

pub mod modifiers;

use std::fmt;

use crate::capability::CraftStats;
use crate::error::{ParseError, ParseErrorKind};

pub use modifiers::{ConditionTerm, ModifierKind, ModifierSet, WaitSpec};

/* ------------------------------- AST ------------------------------- */

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopCount {
    Infinite,
    Finite(u32),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Action(String),
    Click(String),
    Craft(u32),
    Loop(LoopCount),
    Recipe(String),
    Require(String),
    RequireQuality(u32),
    RequireRepair,
    RequireSpiritbond(Option<f64>),
    RequireStats(CraftStats),
    Item(String),
    RunMacro(String),
    Send(Vec<String>),
    Hold(Vec<String>),
    Release(Vec<String>),
    Target(String),
    WaitAddon(String),
    Wait(WaitSpec),
    Echo(String),
    /// Anything else is forwarded to the client as typed.
    Native(String),
}

impl Command {
    pub fn name(&self) -> &str {
        match self {
            Command::Action(_) => "action",
            Command::Click(_) => "click",
            Command::Craft(_) => "craft",
            Command::Loop(_) => "loop",
            Command::Recipe(_) => "recipe",
            Command::Require(_) => "require",
            Command::RequireQuality(_) => "requirequality",
            Command::RequireRepair => "requirerepair",
            Command::RequireSpiritbond(_) => "requirespiritbond",
            Command::RequireStats(_) => "requirestats",
            Command::Item(_) => "item",
            Command::RunMacro(_) => "runmacro",
            Command::Send(_) => "send",
            Command::Hold(_) => "hold",
            Command::Release(_) => "release",
            Command::Target(_) => "target",
            Command::WaitAddon(_) => "waitaddon",
            Command::Wait(_) => "wait",
            Command::Echo(_) => "echo",
            Command::Native(name) => name,
        }
    }

    /// Modifiers this command understands.
    pub fn accepts(&self, kind: ModifierKind) -> bool {
        use ModifierKind::*;
        let allowed: &[ModifierKind] = match self {
            Command::Action(_) => &[Wait, Unsafe, Condition],
            Command::Craft(_) | Command::Loop(_) => &[Wait, Echo],
            Command::Require(_)
            | Command::RequireQuality(_)
            | Command::RequireStats(_)
            | Command::WaitAddon(_) => &[Wait, MaxWait],
            Command::Item(_) => &[Wait, Hq],
            Command::Target(_) => &[Wait, Index, List],
            Command::Wait(_) => &[],
            _ => &[Wait],
        };
        allowed.contains(&kind)
    }

    /// `/loop` and `/craft` are the loop boundaries.
    pub fn is_loop_boundary(&self) -> bool {
        matches!(self, Command::Loop(_) | Command::Craft(_))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Step {
    /// 1-based source line.
    pub line: usize,
    pub command: Command,
    pub raw_args: String,
    pub modifiers: ModifierSet,
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "/{}", self.command.name())?;
        if !self.raw_args.is_empty() {
            write!(f, " {}", self.raw_args)?;
        }
        if !self.modifiers.is_empty() {
            write!(f, " {}", self.modifiers)?;
        }
        Ok(())
    }
}

/// A parsed macro. Never mutated once built; runs only move a cursor over it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MacroScript {
    steps: Vec<Step>,
}

impl MacroScript {
    pub fn new(steps: Vec<Step>) -> Self {
        Self { steps }
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    pub fn get(&self, index: usize) -> Option<&Step> {
        self.steps.get(index)
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Copy of this script with the last `/loop` set to `count` (`run loop N`).
    /// `None` when the script has no `/loop`.
    pub fn with_last_loop_count(&self, count: u32) -> Option<MacroScript> {
        let idx = self
            .steps
            .iter()
            .rposition(|s| matches!(s.command, Command::Loop(_)))?;
        let mut steps = self.steps.clone();
        steps[idx].command = Command::Loop(LoopCount::Finite(count));
        steps[idx].raw_args = count.to_string();
        Some(MacroScript { steps })
    }
}

impl fmt::Display for MacroScript {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, step) in self.steps.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            write!(f, "{step}")?;
        }
        Ok(())
    }
}

/* ------------------------------ PARSER ------------------------------ */

pub fn parse(source: &str) -> Result<MacroScript, ParseError> {
    let mut steps = Vec::new();
    for (idx, raw) in source.lines().enumerate() {
        if let Some(step) = parse_line(idx + 1, raw)? {
            steps.push(step);
        }
    }
    Ok(MacroScript { steps })
}

/// Parse a single command line, e.g. one yielded by a script.
pub fn parse_step(text: &str) -> Result<Option<Step>, ParseError> {
    parse_line(1, text)
}

fn parse_line(line: usize, raw: &str) -> Result<Option<Step>, ParseError> {
    let err = |kind| ParseError::new(line, kind);
    let text = strip_comment(raw).trim();
    if text.is_empty() {
        return Ok(None);
    }

    let mut modifiers = ModifierSet::default();

    let Some(body) = text.strip_prefix('/') else {
        let args = modifiers::extract(text, &mut modifiers).map_err(err)?;
        return Ok(Some(Step {
            line,
            command: Command::Echo(args.clone()),
            raw_args: args,
            modifiers,
        }));
    };

    let (name, rest) = match body.find(char::is_whitespace) {
        Some(pos) => (&body[..pos], &body[pos..]),
        None => (body, ""),
    };
    let raw_args = modifiers::extract(rest, &mut modifiers).map_err(err)?;
    let command = build_command(name, &raw_args).map_err(err)?;

    Ok(Some(Step {
        line,
        command,
        raw_args,
        modifiers,
    }))
}

fn build_command(name: &str, args: &str) -> Result<Command, ParseErrorKind> {
    let lower = name.to_lowercase();
    let canonical = match lower.as_str() {
        "ac" => "action",
        "gate" => "craft",
        other => other,
    };
    let invalid = |reason: &str| ParseErrorKind::InvalidArgument {
        command: canonical.to_string(),
        reason: reason.to_string(),
    };
    let named = || {
        let n = unquote(args);
        if n.is_empty() {
            Err(invalid("missing name"))
        } else {
            Ok(n)
        }
    };

    Ok(match canonical {
        "action" => Command::Action(named()?),
        "click" => Command::Click(named()?),
        "craft" => Command::Craft(
            args.parse::<u32>()
                .map_err(|_| invalid("expected a craft count"))?,
        ),
        "loop" => Command::Loop(if args.is_empty() {
            LoopCount::Infinite
        } else {
            LoopCount::Finite(
                args.parse::<u32>()
                    .map_err(|_| invalid("expected a loop count"))?,
            )
        }),
        "recipe" => Command::Recipe(named()?),
        "require" => Command::Require(named()?),
        "requirequality" => Command::RequireQuality(
            args.parse::<u32>()
                .map_err(|_| invalid("expected a quality value"))?,
        ),
        "requirerepair" => Command::RequireRepair,
        "requirespiritbond" => Command::RequireSpiritbond(if args.is_empty() {
            None
        } else {
            Some(
                args.parse::<f64>()
                    .ok()
                    .filter(|v| v.is_finite())
                    .ok_or_else(|| invalid("expected a spiritbond percentage"))?,
            )
        }),
        "requirestats" => {
            let nums: Vec<u32> = args
                .split_whitespace()
                .map(|s| s.parse::<u32>())
                .collect::<Result<_, _>>()
                .map_err(|_| invalid("expected craftsmanship, control and cp"))?;
            match nums.as_slice() {
                [craftsmanship, control, cp] => Command::RequireStats(CraftStats {
                    craftsmanship: *craftsmanship,
                    control: *control,
                    cp: *cp,
                }),
                _ => return Err(invalid("expected craftsmanship, control and cp")),
            }
        }
        "item" => Command::Item(named()?),
        "runmacro" => Command::RunMacro(named()?),
        "send" => Command::Send(key_chord(args).ok_or_else(|| invalid("expected KEY[+KEY...]"))?),
        "hold" => Command::Hold(key_chord(args).ok_or_else(|| invalid("expected KEY[+KEY...]"))?),
        "release" => {
            Command::Release(key_chord(args).ok_or_else(|| invalid("expected KEY[+KEY...]"))?)
        }
        "target" => Command::Target(named()?),
        "waitaddon" => Command::WaitAddon(named()?),
        "wait" => {
            let spec = modifiers::parse_wait_spec(args)
                .ok_or_else(|| invalid("expected seconds or an ascending lo-hi range"))?;
            Command::Wait(spec)
        }
        "echo" => Command::Echo(args.to_string()),
        _ => Command::Native(name.to_string()),
    })
}

/// `CONTROL+MENU+SHIFT+NUMPAD0` -> upper-cased key names.
fn key_chord(args: &str) -> Option<Vec<String>> {
    let keys: Vec<String> = args
        .split('+')
        .map(|k| k.trim().to_ascii_uppercase())
        .collect();
    let valid = keys
        .iter()
        .all(|k| !k.is_empty() && k.chars().all(|c| c.is_ascii_alphanumeric() || c == '_'));
    valid.then_some(keys)
}

fn unquote(args: &str) -> String {
    let t = args.trim();
    if t.len() >= 2 && t.starts_with('"') && t.ends_with('"') {
        t[1..t.len() - 1].trim().to_string()
    } else {
        t.to_string()
    }
}

/// Cut `#` comments that sit outside quotes, after whitespace or at line start.
fn strip_comment(raw: &str) -> &str {
    let trimmed = raw.trim_start();
    if trimmed.starts_with('#') || trimmed.starts_with("//") {
        return "";
    }

    let mut in_quote = false;
    let mut prev_space = false;
    for (i, ch) in raw.char_indices() {
        match ch {
            '"' => in_quote = !in_quote,
            '#' if !in_quote && prev_space => return &raw[..i],
            _ => {}
        }
        prev_space = ch.is_whitespace();
    }
    raw
}
