//! Error taxonomy.
//!
//! - `ParseError`: malformed macro text, fatal before anything runs
//! - `ModifierError`: a modifier that cannot apply to its step, fatal at that step
//! - `MacroError`: everything a run can end with, soft or fatal

use std::time::Duration;

use thiserror::Error;

use crate::capability::GameError;
use crate::library::LibraryError;
use crate::script::ScriptError;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseErrorKind {
    #[error("unknown modifier <{0}>")]
    UnknownModifier(String),

    #[error("malformed value for <{name}>: {value:?}")]
    MalformedModifierValue { name: String, value: String },

    #[error("modifier <{0}> appears more than once")]
    DuplicateModifier(String),

    #[error("unterminated quote")]
    UnterminatedQuote,

    #[error("invalid argument for /{command}: {reason}")]
    InvalidArgument { command: String, reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("line {line}: {kind}")]
pub struct ParseError {
    pub line: usize,
    pub kind: ParseErrorKind,
}

impl ParseError {
    pub fn new(line: usize, kind: ParseErrorKind) -> Self {
        Self { line, kind }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ModifierError {
    #[error("<{modifier}> is not supported by /{command}")]
    NotSupported {
        modifier: &'static str,
        command: String,
    },

    #[error("unknown crafting condition {name:?}")]
    UnknownCondition { name: String },

    #[error("wait range {lo}-{hi} is inverted")]
    InvertedRange { lo: f64, hi: f64 },

    #[error("<{modifier}.{value}> is too large")]
    OutOfRange { modifier: &'static str, value: f64 },
}

/// Raised at a suspension point when the owning macro was stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("macro stopped")]
pub struct Interrupted;

#[derive(Debug, Error)]
pub enum MacroError {
    #[error("parse error: {0}")]
    Parse(#[from] ParseError),

    #[error("line {line}: {source}")]
    Modifier {
        line: usize,
        #[source]
        source: ModifierError,
    },

    #[error("line {line}: timed out after {waited:?} waiting for {what}")]
    ConditionTimeout {
        line: usize,
        what: String,
        waited: Duration,
    },

    #[error("line {line}: /action {action:?} got no response after {attempts} attempt(s)")]
    RetryExhausted {
        line: usize,
        action: String,
        attempts: u32,
        last_error: GameError,
    },

    #[error("line {line}: {source}")]
    Capability {
        line: usize,
        #[source]
        source: GameError,
    },

    #[error("macro cycle detected: {}", chain.join(" -> "))]
    CycleDetected { chain: Vec<String> },

    #[error("line {line}: /{command} cannot run here: {reason}")]
    Unsupported {
        line: usize,
        command: String,
        reason: String,
    },

    #[error(transparent)]
    Library(#[from] LibraryError),

    #[error("script error: {0}")]
    Script(#[from] ScriptError),

    #[error("macro task failed: {0}")]
    Task(String),

    #[error("macro stopped")]
    Stopped,
}

impl From<Interrupted> for MacroError {
    fn from(_: Interrupted) -> Self {
        MacroError::Stopped
    }
}

impl MacroError {
    /// Soft errors go through the stop-or-continue policy; everything else ends the run.
    pub fn is_soft(&self) -> bool {
        matches!(
            self,
            MacroError::ConditionTimeout { .. }
                | MacroError::RetryExhausted { .. }
                | MacroError::Capability { .. }
        )
    }
}
