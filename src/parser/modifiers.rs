//! Modifier tags: `<name>` and `<name.value>`.
//!
//! Extraction is part of parsing: a tag is recognized, its value is parsed into
//! a typed form and stored on the step. Whether a tag makes sense for its
//! command is decided later by the resolver.

use std::fmt;
use std::sync::OnceLock;
use std::time::Duration;

use nom::{
    bytes::complete::tag,
    character::complete::{char, digit1},
    combinator::{all_consuming, map_res, opt, recognize},
    sequence::{pair, preceded},
    IResult,
};
use rand::Rng;
use regex::Regex;

use crate::error::ParseErrorKind;

static TAG_RE: OnceLock<Option<Regex>> = OnceLock::new();

fn tag_re() -> Option<&'static Regex> {
    TAG_RE
        .get_or_init(|| Regex::new(r"^([A-Za-z]+)(?:\.(.*))?$").ok())
        .as_ref()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModifierKind {
    Wait,
    MaxWait,
    Condition,
    Unsafe,
    Echo,
    Index,
    List,
    Hq,
}

impl ModifierKind {
    pub fn from_name(name: &str) -> Option<Self> {
        Some(match name.to_ascii_lowercase().as_str() {
            "wait" => ModifierKind::Wait,
            "maxwait" => ModifierKind::MaxWait,
            "condition" => ModifierKind::Condition,
            "unsafe" => ModifierKind::Unsafe,
            "echo" => ModifierKind::Echo,
            "index" => ModifierKind::Index,
            "list" => ModifierKind::List,
            "hq" => ModifierKind::Hq,
            _ => return None,
        })
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ModifierKind::Wait => "wait",
            ModifierKind::MaxWait => "maxwait",
            ModifierKind::Condition => "condition",
            ModifierKind::Unsafe => "unsafe",
            ModifierKind::Echo => "echo",
            ModifierKind::Index => "index",
            ModifierKind::List => "list",
            ModifierKind::Hq => "hq",
        }
    }
}

/// Seconds, either fixed or a range sampled uniformly per execution.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum WaitSpec {
    Fixed(f64),
    Range(f64, f64),
}

impl WaitSpec {
    pub const ZERO: WaitSpec = WaitSpec::Fixed(0.0);

    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> Duration {
        let secs = match *self {
            WaitSpec::Fixed(s) => s,
            WaitSpec::Range(lo, hi) if hi > lo => rng.gen_range(lo..=hi),
            WaitSpec::Range(lo, _) => lo,
        };
        seconds(secs).unwrap_or(Duration::MAX)
    }

    pub fn is_zero(&self) -> bool {
        matches!(*self, WaitSpec::Fixed(s) if s == 0.0)
    }
}

impl fmt::Display for WaitSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WaitSpec::Fixed(s) => write!(f, "{s}"),
            WaitSpec::Range(lo, hi) => write!(f, "{lo}-{hi}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConditionTerm {
    pub name: String,
    pub negated: bool,
}

impl fmt::Display for ConditionTerm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.negated {
            write!(f, "!{}", self.name)
        } else {
            write!(f, "{}", self.name)
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ModifierSet {
    pub wait: Option<WaitSpec>,
    pub max_wait: Option<f64>,
    pub condition: Option<Vec<ConditionTerm>>,
    pub unsafe_action: bool,
    pub echo: bool,
    pub index: Option<u32>,
    pub list: Option<u32>,
    pub hq: bool,
}

impl ModifierSet {
    pub fn is_empty(&self) -> bool {
        self.kinds().is_empty()
    }

    /// Kinds present on this step, in canonical order.
    pub fn kinds(&self) -> Vec<ModifierKind> {
        let mut out = Vec::new();
        if self.wait.is_some() {
            out.push(ModifierKind::Wait);
        }
        if self.max_wait.is_some() {
            out.push(ModifierKind::MaxWait);
        }
        if self.condition.is_some() {
            out.push(ModifierKind::Condition);
        }
        if self.unsafe_action {
            out.push(ModifierKind::Unsafe);
        }
        if self.echo {
            out.push(ModifierKind::Echo);
        }
        if self.index.is_some() {
            out.push(ModifierKind::Index);
        }
        if self.list.is_some() {
            out.push(ModifierKind::List);
        }
        if self.hq {
            out.push(ModifierKind::Hq);
        }
        out
    }

    fn has(&self, kind: ModifierKind) -> bool {
        self.kinds().contains(&kind)
    }

    /// Parse one tag body (`wait.1-5`, `unsafe`, ...) into the set.
    pub(crate) fn insert(&mut self, name: &str, value: Option<&str>) -> Result<(), ParseErrorKind> {
        let kind = ModifierKind::from_name(name)
            .ok_or_else(|| ParseErrorKind::UnknownModifier(name.to_ascii_lowercase()))?;
        if self.has(kind) {
            return Err(ParseErrorKind::DuplicateModifier(kind.as_str().to_string()));
        }
        let malformed = || ParseErrorKind::MalformedModifierValue {
            name: kind.as_str().to_string(),
            value: value.unwrap_or_default().to_string(),
        };

        match kind {
            ModifierKind::Wait => {
                self.wait = Some(value.and_then(parse_wait_spec).ok_or_else(malformed)?);
            }
            ModifierKind::MaxWait => {
                self.max_wait = Some(value.and_then(parse_seconds).ok_or_else(malformed)?);
            }
            ModifierKind::Condition => {
                self.condition = Some(value.and_then(parse_condition).ok_or_else(malformed)?);
            }
            ModifierKind::Index => {
                self.index = Some(value.and_then(parse_u32).ok_or_else(malformed)?);
            }
            ModifierKind::List => {
                self.list = Some(value.and_then(parse_u32).ok_or_else(malformed)?);
            }
            ModifierKind::Unsafe | ModifierKind::Echo | ModifierKind::Hq => {
                if value.is_some() {
                    return Err(malformed());
                }
                match kind {
                    ModifierKind::Unsafe => self.unsafe_action = true,
                    ModifierKind::Echo => self.echo = true,
                    _ => self.hq = true,
                }
            }
        }
        Ok(())
    }
}

impl fmt::Display for ModifierSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts: Vec<String> = Vec::new();
        if let Some(w) = &self.wait {
            parts.push(format!("<wait.{w}>"));
        }
        if let Some(m) = self.max_wait {
            parts.push(format!("<maxwait.{m}>"));
        }
        if let Some(terms) = &self.condition {
            let list: Vec<String> = terms.iter().map(|t| t.to_string()).collect();
            parts.push(format!("<condition.{}>", list.join(",")));
        }
        if self.unsafe_action {
            parts.push("<unsafe>".into());
        }
        if self.echo {
            parts.push("<echo>".into());
        }
        if let Some(i) = self.index {
            parts.push(format!("<index.{i}>"));
        }
        if let Some(l) = self.list {
            parts.push(format!("<list.{l}>"));
        }
        if self.hq {
            parts.push("<hq>".into());
        }
        write!(f, "{}", parts.join(" "))
    }
}

/// Remove recognizable tags from `rest`, filling `set`.
///
/// A `<` inside double quotes, or one whose body does not look like
/// `name[.value]`, stays in the argument text.
pub(crate) fn extract(rest: &str, set: &mut ModifierSet) -> Result<String, ParseErrorKind> {
    let mut args = String::with_capacity(rest.len());
    let mut in_quote = false;
    let mut i = 0;

    while i < rest.len() {
        let Some(ch) = rest[i..].chars().next() else {
            break;
        };
        match ch {
            '"' => {
                in_quote = !in_quote;
                args.push(ch);
                i += 1;
            }
            '<' if !in_quote => {
                let body_start = i + 1;
                let tag = rest[body_start..].find('>').and_then(|end| {
                    let body = &rest[body_start..body_start + end];
                    let caps = tag_re()?.captures(body)?;
                    let name = caps.get(1)?.as_str().to_string();
                    let value = caps.get(2).map(|m| m.as_str().to_string());
                    Some((name, value, body_start + end + 1))
                });
                match tag {
                    Some((name, value, next)) => {
                        set.insert(&name, value.as_deref())?;
                        i = next;
                    }
                    None => {
                        args.push(ch);
                        i += 1;
                    }
                }
            }
            _ => {
                args.push(ch);
                i += ch.len_utf8();
            }
        }
    }

    if in_quote {
        return Err(ParseErrorKind::UnterminatedQuote);
    }
    Ok(collapse_spaces(&args))
}

/// Trim and squeeze runs of spaces left behind by removed tags (outside quotes).
fn collapse_spaces(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut in_quote = false;
    let mut last_space = false;
    for ch in s.trim().chars() {
        if ch == '"' {
            in_quote = !in_quote;
        }
        if ch.is_whitespace() && !in_quote {
            if !last_space {
                out.push(' ');
            }
            last_space = true;
        } else {
            out.push(ch);
            last_space = false;
        }
    }
    out
}

/* ---------- value parsers ---------- */

fn number(input: &str) -> IResult<&str, f64> {
    map_res(
        recognize(pair(digit1, opt(pair(char('.'), digit1)))),
        |s: &str| s.parse::<f64>(),
    )(input)
}

fn range(input: &str) -> IResult<&str, WaitSpec> {
    let (rest, lo) = number(input)?;
    let (rest, hi) = opt(preceded(tag("-"), number))(rest)?;
    Ok((
        rest,
        match hi {
            Some(hi) => WaitSpec::Range(lo, hi),
            None => WaitSpec::Fixed(lo),
        },
    ))
}

/// `3`, `3.5`, `1-5`, `1.5-5.5`. Inverted ranges and values too large for a
/// `Duration` are rejected.
pub fn parse_wait_spec(s: &str) -> Option<WaitSpec> {
    let (_, spec) = all_consuming(range)(s.trim()).ok()?;
    match spec {
        WaitSpec::Fixed(secs) => seconds(secs).map(|_| spec),
        WaitSpec::Range(lo, hi) if lo <= hi => seconds(hi).map(|_| spec),
        WaitSpec::Range(..) => None,
    }
}

pub fn parse_seconds(s: &str) -> Option<f64> {
    let (_, n) = all_consuming(number)(s.trim()).ok()?;
    seconds(n).map(|_| n)
}

/// Non-negative seconds as a `Duration`, `None` when not representable.
pub fn seconds(secs: f64) -> Option<Duration> {
    Duration::try_from_secs_f64(secs.max(0.0)).ok()
}

fn parse_u32(s: &str) -> Option<u32> {
    s.trim().parse::<u32>().ok()
}

/// `poor`, `good,excellent`, `not.poor`, `!poor`.
fn parse_condition(s: &str) -> Option<Vec<ConditionTerm>> {
    let mut terms = Vec::new();
    for raw in s.split(',') {
        let raw = raw.trim();
        let (name, negated) = if let Some(n) = raw.strip_prefix('!') {
            (n, true)
        } else if let Some(n) = raw
            .get(..4)
            .filter(|p| p.eq_ignore_ascii_case("not."))
            .and_then(|_| raw.get(4..))
        {
            (n, true)
        } else {
            (raw, false)
        };
        let name = name.trim();
        if name.is_empty() {
            return None;
        }
        terms.push(ConditionTerm {
            name: name.to_string(),
            negated,
        });
    }
    Some(terms)
}
