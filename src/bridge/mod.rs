//! Script bridge.
//!
//! A script runs in its own task and hands command lines to the scheduler one
//! at a time. Each yielded line is parsed and executed on the macro's fiber
//! with the same semantics as a native step; the script resumes only after
//! that step completed (or failed). The channel holds a single request, so a
//! script can never run ahead of the engine.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};

use crate::capability::GameState;
use crate::error::MacroError;
use crate::logging;
use crate::script::{GameQuery, ScriptHost};

/// One yielded command waiting for the fiber.
#[derive(Debug)]
pub struct CommandRequest {
    pub command: String,
    pub reply: oneshot::Sender<Result<(), MacroError>>,
}

/// Read-only view of the game for scripts.
#[derive(Clone)]
pub struct GameView {
    game: Arc<dyn GameState>,
}

impl GameView {
    pub fn new(game: Arc<dyn GameState>) -> Self {
        Self { game }
    }

    pub fn has_status(&self, name: &str) -> bool {
        self.game.has_status(name)
    }

    pub fn crafting_condition(&self) -> Option<String> {
        self.game.crafting_condition()
    }

    pub fn quality(&self) -> Option<u32> {
        self.game.quality()
    }

    pub fn hq_chance(&self) -> Option<u32> {
        self.game.hq_chance()
    }

    pub fn item_count(&self, name: &str, hq: bool) -> u32 {
        self.game.item_count(name, hq)
    }

    pub fn current_target(&self) -> Option<String> {
        self.game.current_target()
    }

    pub fn needs_repair(&self) -> bool {
        self.game.needs_repair()
    }

    /// A query as the embedded language sees it: always a string.
    pub fn query(&self, query: &GameQuery) -> String {
        let none = || "none".to_string();
        match query {
            GameQuery::Status(name) => self.has_status(name).to_string(),
            GameQuery::Addon(name) => self.game.addon_state(name).as_str().to_string(),
            GameQuery::Condition => self.crafting_condition().unwrap_or_else(none),
            GameQuery::Quality => self.quality().map(|q| q.to_string()).unwrap_or_else(none),
            GameQuery::HqChance => self.hq_chance().map(|c| c.to_string()).unwrap_or_else(none),
            GameQuery::Item(name) => self.item_count(name, false).to_string(),
            GameQuery::Target => self.current_target().unwrap_or_else(none),
        }
    }
}

/// The script's end of the bridge.
#[derive(Clone)]
pub struct ScriptHandle {
    tx: mpsc::Sender<CommandRequest>,
    view: GameView,
    name: String,
}

pub fn channel(name: &str, view: GameView) -> (ScriptHandle, mpsc::Receiver<CommandRequest>) {
    let (tx, rx) = mpsc::channel(1);
    (
        ScriptHandle {
            tx,
            view,
            name: name.to_string(),
        },
        rx,
    )
}

impl ScriptHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn game(&self) -> &GameView {
        &self.view
    }

    /// Hand one command line to the engine and wait for it to finish.
    pub async fn yield_command(&self, command: &str) -> Result<(), MacroError> {
        let (reply, done) = oneshot::channel();
        self.tx
            .send(CommandRequest {
                command: command.to_string(),
                reply,
            })
            .await
            .map_err(|_| MacroError::Stopped)?;
        done.await.map_err(|_| MacroError::Stopped)?
    }

    /// [`ScriptHandle::yield_command`] for scripts on a blocking thread.
    pub fn yield_blocking(&self, command: &str) -> Result<(), MacroError> {
        let (reply, done) = oneshot::channel();
        self.tx
            .blocking_send(CommandRequest {
                command: command.to_string(),
                reply,
            })
            .map_err(|_| MacroError::Stopped)?;
        done.blocking_recv().map_err(|_| MacroError::Stopped)?
    }

    pub fn log(&self, message: &str) {
        tracing::info!(script = %self.name, "{message}");
        logging::append_output_log(&format!("[{}] {message}", self.name));
    }
}

/// Runs the embedded interpreter against the bridge from a blocking thread.
pub struct BlockingHost {
    handle: ScriptHandle,
}

impl BlockingHost {
    pub fn new(handle: ScriptHandle) -> Self {
        Self { handle }
    }
}

impl ScriptHost for BlockingHost {
    type Error = MacroError;

    fn yield_command(&mut self, command: &str) -> Result<(), MacroError> {
        self.handle.yield_blocking(command)
    }

    fn log(&mut self, message: &str) {
        self.handle.log(message);
    }

    fn query(&mut self, query: &GameQuery) -> String {
        self.handle.game().query(query)
    }
}

