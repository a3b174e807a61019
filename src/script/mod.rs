//! Embedded script language.
//!
//! Small indentation-based language run on the bridge: scripts compute what to
//! do next and `yield` macro command lines to the scheduler one at a time.

pub mod interpreter;
pub mod lexer;
pub mod parser;

use thiserror::Error;

pub use interpreter::{Interpreter, ScriptHost};
pub use parser::{GameQuery, Stmt};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScriptError {
    #[error("line {line}: {message}")]
    Lex { line: usize, message: String },

    #[error("line {line}: {message}")]
    Parse { line: usize, message: String },

    #[error("variable '{0}' is not defined")]
    UndefinedVariable(String),

    #[error("line {line}: unknown game query {query:?}")]
    UnknownQuery { line: usize, query: String },

    #[error("line {line}: repeat count {value:?} is not a whole number")]
    BadRepeatCount { line: usize, value: String },

    #[error("{0}")]
    Runtime(String),
}

impl ScriptError {
    pub(crate) fn parse(line: usize, message: impl Into<String>) -> Self {
        ScriptError::Parse {
            line,
            message: message.into(),
        }
    }
}

/// Tokenize and parse script source.
pub fn compile(source: &str) -> Result<Vec<Stmt>, ScriptError> {
    parser::parse(lexer::tokenize(source)?)
}

#[cfg(test)]
mod tests;
