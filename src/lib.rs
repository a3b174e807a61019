pub mod banner;
pub mod bridge;
pub mod capability;
pub mod cli;
pub mod config;
pub mod engine;
pub mod error;
pub mod evaluator;
pub mod library;
pub mod logging;
pub mod parser;
pub mod resolver;
pub mod retry;
pub mod scheduler;
pub mod script;

pub use engine::analyze;
pub use parser::parse;
pub use scheduler::{MacroHandle, RunReport, Scheduler};
