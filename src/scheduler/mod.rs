//! Execution scheduler.
//!
//! One fiber (a tokio task) per running macro. The fiber keeps an explicit
//! stack of invocations: `/runmacro` pushes a fresh cursor, loop-frame stack
//! and [`ControlHandle`]; the outer invocation resumes when the inner one is
//! done. Each invocation is paused and stopped through its own control.
//!
//! Per step: resolve modifiers, gate/execute through the evaluator and the
//! retry controller, update loop frames, advance the cursor. Soft errors are
//! reported to the game's error channel and the log, then the configured
//! policy decides between stopping and skipping the step.

pub mod control;

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};

use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::bridge::{self, BlockingHost, CommandRequest, GameView, ScriptHandle};
use crate::capability::{ActionCategory, AddonState, GameError, GameState, KeyMode};
use crate::config::{EngineConfig, ErrorSite, OnError};
use crate::error::{Interrupted, MacroError};
use crate::evaluator::{Evaluator, WaitOutcome};
use crate::library::{MacroLibrary, MacroSource};
use crate::logging;
use crate::parser::{self, Command, LoopCount, MacroScript, Step, WaitSpec};
use crate::resolver::{EffectiveModifiers, Resolver};
use crate::retry::{RetryController, RetryError, RetryOutcome};
use crate::script::{Interpreter, Stmt};

pub use control::{
    transition, ControlHandle, ControlRequest, ExecutionState, TransitionError,
};

/// What a finished run did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunReport {
    pub macro_name: String,
    pub steps_executed: u64,
    pub loop_crossings: u64,
    /// Soft errors that were reported, in order.
    pub soft_errors: Vec<String>,
    pub stopped_by_user: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InvocationStatus {
    pub name: String,
    pub state: ExecutionState,
}

#[derive(Debug, Clone)]
struct ActiveInvocation {
    name: String,
    control: ControlHandle,
}

type ActiveList = Arc<Mutex<Vec<ActiveInvocation>>>;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/* ───────────────────────── Control surface ───────────────────────── */

/// Controls for one running macro and the macros it invoked.
///
/// `pause`, `pause_at_loop`, `stop_at_loop` and `step` act on the innermost
/// invocation; `resume` resumes every paused one; `stop` stops all of them.
#[derive(Debug, Clone)]
pub struct MacroControl {
    name: String,
    root: ControlHandle,
    active: ActiveList,
}

impl MacroControl {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> ExecutionState {
        self.root.state()
    }

    /// Outermost first.
    pub fn invocations(&self) -> Vec<InvocationStatus> {
        lock(&self.active)
            .iter()
            .map(|a| InvocationStatus {
                name: a.name.clone(),
                state: a.control.state(),
            })
            .collect()
    }

    fn controls(&self) -> Vec<ControlHandle> {
        lock(&self.active).iter().map(|a| a.control.clone()).collect()
    }

    fn innermost(&self) -> ControlHandle {
        lock(&self.active)
            .last()
            .map(|a| a.control.clone())
            .unwrap_or_else(|| self.root.clone())
    }

    pub fn pause(&self) -> Result<ExecutionState, TransitionError> {
        self.innermost().request(ControlRequest::Pause)
    }

    pub fn pause_at_loop(&self) -> Result<ExecutionState, TransitionError> {
        self.innermost().request(ControlRequest::PauseAtLoop)
    }

    pub fn stop_at_loop(&self) -> Result<ExecutionState, TransitionError> {
        self.innermost().request(ControlRequest::StopAtLoop)
    }

    pub fn step(&self) -> Result<ExecutionState, TransitionError> {
        self.innermost().request(ControlRequest::Step)
    }

    pub fn resume(&self) -> Result<ExecutionState, TransitionError> {
        let mut last = None;
        for control in self.controls() {
            if matches!(
                control.state(),
                ExecutionState::PausedNow | ExecutionState::PausedAtNextLoop
            ) {
                last = Some(control.request(ControlRequest::Resume));
            }
        }
        last.unwrap_or_else(|| self.innermost().request(ControlRequest::Resume))
    }

    pub fn stop(&self) -> Result<ExecutionState, TransitionError> {
        for control in self.controls().iter().rev() {
            let _ = control.request(ControlRequest::Stop);
        }
        self.root.request(ControlRequest::Stop)
    }
}

#[derive(Debug)]
pub struct MacroHandle {
    control: MacroControl,
    task: JoinHandle<Result<RunReport, MacroError>>,
}

impl MacroHandle {
    pub fn control(&self) -> &MacroControl {
        &self.control
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    pub async fn join(self) -> Result<RunReport, MacroError> {
        match self.task.await {
            Ok(result) => result,
            Err(e) => Err(MacroError::Task(e.to_string())),
        }
    }
}

/* ───────────────────────── Scheduler ───────────────────────── */

#[derive(Clone)]
pub struct Scheduler {
    game: Arc<dyn GameState>,
    config: Arc<EngineConfig>,
    library: Arc<MacroLibrary>,
}

impl Scheduler {
    pub fn new(game: Arc<dyn GameState>, config: EngineConfig, library: Arc<MacroLibrary>) -> Self {
        Self {
            game,
            config: Arc::new(config.normalized()),
            library,
        }
    }

    pub fn game(&self) -> &Arc<dyn GameState> {
        &self.game
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn library(&self) -> &Arc<MacroLibrary> {
        &self.library
    }

    /// `run <name>`, or `run loop <N> <name>` with `loops`.
    pub fn start(&self, name: &str, loops: Option<u32>) -> Result<MacroHandle, MacroError> {
        match self.library.get(name)? {
            MacroSource::Native(script) => {
                let script = match loops {
                    Some(n) => Arc::new(script.with_last_loop_count(n).ok_or_else(|| {
                        MacroError::Unsupported {
                            line: 0,
                            command: "loop".into(),
                            reason: format!("{name:?} has no /loop to set to {n}"),
                        }
                    })?),
                    None => script,
                };
                Ok(self.run_script(name, script))
            }
            MacroSource::Script(program) => {
                if loops.is_some() {
                    return Err(MacroError::Unsupported {
                        line: 0,
                        command: "loop".into(),
                        reason: format!("{name:?} is a script"),
                    });
                }
                Ok(self.start_program(name, program))
            }
        }
    }

    /// `craft [N] <name>`: the macro wrapped into a crafting loop of `count`
    /// crafts, or until stopped when `count` is `None`.
    pub fn start_craft_loop(
        &self,
        name: &str,
        count: Option<u32>,
    ) -> Result<MacroHandle, MacroError> {
        let script = self.library.craft_loop(name, count, &self.config.craft_loop)?;
        tracing::debug!(macro_name = %name, ?count, steps = script.len(), "craft loop built");
        Ok(self.run_script(name, script))
    }

    /// Run a parsed macro on its own fiber.
    pub fn run_script(&self, name: impl Into<String>, script: Arc<MacroScript>) -> MacroHandle {
        let name = name.into();
        let (root, active) = publish(&name);
        let mut fiber = self.fiber(&name, active.clone());
        let bottom = fiber.invocation(name.clone(), script, root.clone());
        let control = root.clone();

        tracing::info!(macro_name = %name, "macro started");
        let task = tokio::spawn(async move {
            let result = fiber.run(vec![bottom]).await;
            control.finish();
            let mut report = fiber.report;
            match result {
                Ok(stopped) => {
                    report.stopped_by_user = stopped;
                    tracing::info!(
                        macro_name = %report.macro_name,
                        steps = report.steps_executed,
                        loops = report.loop_crossings,
                        stopped,
                        "macro finished"
                    );
                    Ok(report)
                }
                Err(e) => {
                    tracing::error!(macro_name = %report.macro_name, error = %e, "macro failed");
                    Err(e)
                }
            }
        });

        MacroHandle {
            control: MacroControl { name, root, active },
            task,
        }
    }

    /// Run an async script that yields command lines through a [`ScriptHandle`].
    pub fn start_bridge<F, Fut>(&self, name: impl Into<String>, script: F) -> MacroHandle
    where
        F: FnOnce(ScriptHandle) -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), MacroError>> + Send + 'static,
    {
        let name = name.into();
        let (root, active) = publish(&name);
        let (handle, mut requests) = bridge::channel(&name, GameView::new(Arc::clone(&self.game)));
        let mut fiber = self.fiber(&name, active.clone());
        let control = root.clone();
        let script_name = name.clone();

        tracing::info!(macro_name = %name, "script started");
        let task = tokio::spawn(async move {
            let script_task = tokio::spawn(script(handle));
            fiber.serve(&script_name, &control, &mut requests).await;
            drop(requests);
            let outcome = script_task.await;

            let stopped = control.state() == ExecutionState::Stopped;
            control.finish();
            let mut report = fiber.report;
            match outcome {
                Err(e) => Err(MacroError::Task(e.to_string())),
                Ok(Err(MacroError::Stopped)) => {
                    report.stopped_by_user = true;
                    Ok(report)
                }
                Ok(Err(e)) => {
                    tracing::error!(macro_name = %report.macro_name, error = %e, "script failed");
                    Err(e)
                }
                Ok(Ok(())) => {
                    report.stopped_by_user = stopped;
                    tracing::info!(
                        macro_name = %report.macro_name,
                        steps = report.steps_executed,
                        "script finished"
                    );
                    Ok(report)
                }
            }
        });

        MacroHandle {
            control: MacroControl { name, root, active },
            task,
        }
    }

    /// Run a compiled embedded script. The interpreter runs on the blocking
    /// pool and hands each `yield` to the fiber.
    pub fn start_program(&self, name: impl Into<String>, program: Arc<Vec<Stmt>>) -> MacroHandle {
        self.start_bridge(name, move |handle| async move {
            tokio::task::spawn_blocking(move || {
                let mut host = BlockingHost::new(handle);
                Interpreter::new().run(&program, &mut host)
            })
            .await
            .map_err(|e| MacroError::Task(e.to_string()))?
        })
    }

    fn fiber(&self, name: &str, active: ActiveList) -> Fiber {
        Fiber {
            game: Arc::clone(&self.game),
            config: Arc::clone(&self.config),
            library: Arc::clone(&self.library),
            retry: RetryController::from_config(&self.config),
            active,
            rng: StdRng::from_entropy(),
            report: RunReport {
                macro_name: name.to_string(),
                ..RunReport::default()
            },
        }
    }
}

fn publish(name: &str) -> (ControlHandle, ActiveList) {
    let root = ControlHandle::new();
    let _ = root.request(ControlRequest::Start);
    let active = Arc::new(Mutex::new(vec![ActiveInvocation {
        name: name.to_string(),
        control: root.clone(),
    }]));
    (root, active)
}

/* ───────────────────────── Fiber ───────────────────────── */

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct LoopFrame {
    /// Index of the `/loop` or `/craft` step that owns the frame.
    step: usize,
    total: LoopCount,
    remaining: LoopCount,
    /// A `/loop` on the first step: the body is the rest of the macro.
    header: bool,
    echo: bool,
}

struct Invocation {
    name: String,
    script: Arc<MacroScript>,
    cursor: usize,
    loops: Vec<LoopFrame>,
    control: ControlHandle,
    evaluator: Evaluator,
    /// `<wait>` of the `/runmacro` step this invocation is suspended on.
    resume_wait: Option<WaitSpec>,
}

enum Flow {
    Next,
    Jump(usize),
    /// A `/craft` gate ran out; this invocation is done.
    Finish,
    Enter(Box<Invocation>),
}

/// Why a step did not complete. Whether an error is soft is decided by
/// [`MacroError::is_soft`]; `site` picks the policy for soft ones.
enum Failure {
    Error { site: ErrorSite, error: MacroError },
    Interrupted,
}

impl From<MacroError> for Failure {
    fn from(error: MacroError) -> Self {
        Failure::Error {
            site: ErrorSite::Other,
            error,
        }
    }
}

impl From<Interrupted> for Failure {
    fn from(_: Interrupted) -> Self {
        Failure::Interrupted
    }
}

fn capability(line: usize, site: ErrorSite, source: GameError) -> Failure {
    Failure::Error {
        site,
        error: MacroError::Capability { line, source },
    }
}

fn timeout(line: usize, site: ErrorSite, what: String, eff: &EffectiveModifiers) -> Failure {
    Failure::Error {
        site,
        error: MacroError::ConditionTimeout {
            line,
            what,
            waited: eff.max_wait,
        },
    }
}

struct Fiber {
    game: Arc<dyn GameState>,
    config: Arc<EngineConfig>,
    library: Arc<MacroLibrary>,
    retry: RetryController,
    active: ActiveList,
    rng: StdRng,
    report: RunReport,
}

impl Fiber {
    fn invocation(&self, name: String, script: Arc<MacroScript>, control: ControlHandle) -> Invocation {
        Invocation {
            name,
            script,
            cursor: 0,
            loops: Vec::new(),
            evaluator: Evaluator::new(self.config.poll_interval(), control.clone()),
            control,
            resume_wait: None,
        }
    }

    /// Drive `stack` until it empties. `Ok(true)` when the bottom invocation
    /// was stopped by the user.
    async fn run(&mut self, mut stack: Vec<Invocation>) -> Result<bool, MacroError> {
        let result = self.drive(&mut stack).await;
        // Nested invocations cut short by an error.
        while stack.len() > 1 {
            if let Some(child) = stack.pop() {
                self.retire(&child);
            }
        }
        result
    }

    async fn drive(&mut self, stack: &mut Vec<Invocation>) -> Result<bool, MacroError> {
        loop {
            let (control, step, chain) = {
                let Some(top) = stack.last() else {
                    return Ok(false);
                };
                let step = top.script.get(top.cursor).cloned();
                let chain: Vec<String> = match step.as_ref().map(|s| &s.command) {
                    Some(Command::RunMacro(_)) => stack.iter().map(|i| i.name.clone()).collect(),
                    _ => Vec::new(),
                };
                (top.control.clone(), step, chain)
            };

            if control.checkpoint().await.is_err() {
                if self.unwind_stopped(stack).await {
                    continue;
                }
                return Ok(true);
            }

            let Some(inv) = stack.last_mut() else {
                return Ok(false);
            };

            let Some(step) = step else {
                if self.end_of_script(inv) {
                    continue;
                }
                if self.leave(stack).await {
                    continue;
                }
                return Ok(false);
            };

            match self.execute(inv, &step, &chain).await {
                Ok(Flow::Next) => self.advance(inv, inv.cursor + 1),
                Ok(Flow::Jump(to)) => self.advance(inv, to),
                Ok(Flow::Finish) => {
                    self.report.steps_executed += 1;
                    if !self.leave(stack).await {
                        return Ok(false);
                    }
                }
                Ok(Flow::Enter(child)) => {
                    tracing::info!(macro_name = %child.name, depth = stack.len() + 1, "entering macro");
                    lock(&self.active).push(ActiveInvocation {
                        name: child.name.clone(),
                        control: child.control.clone(),
                    });
                    stack.push(*child);
                }
                Err(Failure::Interrupted) => {
                    if self.unwind_stopped(stack).await {
                        continue;
                    }
                    return Ok(true);
                }
                Err(Failure::Error { site, error }) if error.is_soft() => {
                    let policy = self.config.policy(site);
                    self.report_soft(&inv.name, &error, policy);
                    match policy {
                        OnError::Stop => return Err(error),
                        OnError::Continue => self.advance(inv, inv.cursor + 1),
                    }
                }
                Err(Failure::Error { error, .. }) => return Err(error),
            }
        }
    }

    fn advance(&mut self, inv: &mut Invocation, to: usize) {
        inv.cursor = to;
        self.report.steps_executed += 1;
        inv.control.after_step();
    }

    /// The top invocation was stopped. Returns false once nothing is left.
    async fn unwind_stopped(&mut self, stack: &mut Vec<Invocation>) -> bool {
        if let Some(top) = stack.last() {
            tracing::info!(macro_name = %top.name, "macro stopped");
        }
        self.leave(stack).await
    }

    /// Pop the top invocation and resume its parent past the `/runmacro`
    /// step. Returns false once the stack is empty.
    async fn leave(&mut self, stack: &mut Vec<Invocation>) -> bool {
        let Some(done) = stack.pop() else {
            return false;
        };
        if stack.is_empty() {
            return false;
        }
        self.retire(&done);

        let Some(parent) = stack.last_mut() else {
            return false;
        };
        let wait = parent.resume_wait.take().unwrap_or(WaitSpec::ZERO);
        // A stopped parent is caught by the next checkpoint.
        if self.pause_for(parent, wait).await.is_ok() {
            self.advance(parent, parent.cursor + 1);
        }
        true
    }

    /// Finish and unpublish a nested invocation's control.
    fn retire(&self, inv: &Invocation) {
        inv.control.finish();
        lock(&self.active).retain(|a| !a.control.same(&inv.control));
    }

    /// End of the script text: a header `/loop` crosses here. Returns true
    /// when the cursor went back to the start.
    fn end_of_script(&mut self, inv: &mut Invocation) -> bool {
        let Some(pos) = inv.loops.iter().position(|f| f.header) else {
            return false;
        };
        self.report.loop_crossings += 1;
        let frame = inv.loops[pos];
        let again = match frame.remaining {
            LoopCount::Infinite => true,
            LoopCount::Finite(0) => false,
            LoopCount::Finite(n) => {
                inv.loops[pos].remaining = LoopCount::Finite(n - 1);
                if frame.echo {
                    self.echo(&format!("{} loops remaining", n - 1));
                }
                true
            }
        };
        if again {
            inv.cursor = 0;
        } else {
            inv.loops.remove(pos);
            if frame.echo {
                self.echo("Loops complete");
            }
        }
        tracing::debug!(macro_name = %inv.name, total = ?frame.total, again, "loop boundary");
        inv.control.loop_boundary();
        again
    }

    async fn execute(
        &mut self,
        inv: &mut Invocation,
        step: &Step,
        chain: &[String],
    ) -> Result<Flow, Failure> {
        let line = step.line;
        let names = if step.modifiers.condition.is_some() {
            self.game.condition_names()
        } else {
            Vec::new()
        };
        let eff = Resolver::new(&self.config, names)
            .resolve(step)
            .map_err(|source| Failure::from(MacroError::Modifier { line, source }))?;
        tracing::debug!(macro_name = %inv.name, line, command = step.command.name(), "step");

        let game = Arc::clone(&self.game);
        match &step.command {
            Command::Action(name) => {
                if let Some(filter) = &eff.condition {
                    if !filter.matches(game.crafting_condition().as_deref()) {
                        tracing::debug!(line, action = %name, "condition not met, skipped");
                        return Ok(Flow::Next);
                    }
                }
                let category = game.action_category(name);
                if self.config.craft_skip
                    && category.is_crafting()
                    && game.crafting_condition().is_none()
                {
                    tracing::debug!(line, action = %name, "not crafting, skipped");
                    return Ok(Flow::Next);
                }
                if self.config.quality_skip
                    && category == ActionCategory::Quality
                    && game.hq_chance().is_some_and(|chance| chance >= 100)
                {
                    tracing::debug!(line, action = %name, "hq chance maxed, skipped");
                    return Ok(Flow::Next);
                }
                let outcome = match self
                    .retry
                    .execute_with_retry(game.as_ref(), &inv.evaluator, name, eff.unsafe_action)
                    .await
                {
                    Ok(outcome) => outcome,
                    Err(RetryError::Interrupted(_)) => return Err(Failure::Interrupted),
                    Err(RetryError::Game(e)) => return Err(capability(line, ErrorSite::Other, e)),
                };
                if let RetryOutcome::Exhausted {
                    attempts,
                    last_error,
                } = outcome
                {
                    return Err(Failure::Error {
                        site: ErrorSite::ActionTimeout,
                        error: MacroError::RetryExhausted {
                            line,
                            action: name.clone(),
                            attempts,
                            last_error,
                        },
                    });
                }
                if self.config.smart_wait && !eff.unsafe_action {
                    inv.evaluator.until(|| !game.is_busy(), eff.max_wait).await?;
                } else {
                    self.pause_for(inv, eff.wait).await?;
                }
            }

            Command::Click(name) => {
                game.click(name)
                    .map_err(|e| capability(line, ErrorSite::ClickFailed, e))?;
                self.pause_for(inv, eff.wait).await?;
            }

            Command::Craft(count) => {
                let idx = inv.cursor;
                self.report.loop_crossings += 1;
                let pos = match inv.loops.iter().position(|f| f.step == idx) {
                    Some(pos) => pos,
                    None => {
                        inv.loops.push(LoopFrame {
                            step: idx,
                            total: LoopCount::Finite(*count),
                            remaining: LoopCount::Finite(*count),
                            header: false,
                            echo: eff.echo,
                        });
                        inv.loops.len() - 1
                    }
                };
                let flow = match inv.loops[pos].remaining {
                    LoopCount::Finite(0) => {
                        if eff.echo {
                            self.echo("Craft gate complete");
                        }
                        Flow::Finish
                    }
                    LoopCount::Finite(n) => {
                        inv.loops[pos].remaining = LoopCount::Finite(n - 1);
                        if eff.echo {
                            self.echo(&format!("{} crafts remaining", n - 1));
                        }
                        Flow::Next
                    }
                    LoopCount::Infinite => Flow::Next,
                };
                inv.control.loop_boundary();
                if matches!(flow, Flow::Next) {
                    self.pause_for(inv, eff.wait).await?;
                }
                return Ok(flow);
            }

            Command::Loop(count) => {
                let idx = inv.cursor;
                self.pause_for(inv, eff.wait).await?;

                if idx == 0 {
                    if *count == LoopCount::Finite(0) {
                        // No passes at all: the body never runs.
                        if eff.echo {
                            self.echo("Loops complete");
                        }
                        return Ok(Flow::Finish);
                    }
                    if !inv.loops.iter().any(|f| f.header) {
                        inv.loops.push(LoopFrame {
                            step: 0,
                            total: *count,
                            remaining: match count {
                                LoopCount::Infinite => LoopCount::Infinite,
                                LoopCount::Finite(n) => LoopCount::Finite(n.saturating_sub(1)),
                            },
                            header: true,
                            echo: eff.echo,
                        });
                    }
                    return Ok(Flow::Next);
                }

                self.report.loop_crossings += 1;
                let pos = match inv.loops.iter().position(|f| f.step == idx) {
                    Some(pos) => pos,
                    None => {
                        let remaining = match count {
                            LoopCount::Infinite => LoopCount::Infinite,
                            LoopCount::Finite(n) if self.config.loop_total => {
                                LoopCount::Finite(n.saturating_sub(1))
                            }
                            LoopCount::Finite(n) => LoopCount::Finite(*n),
                        };
                        inv.loops.push(LoopFrame {
                            step: idx,
                            total: *count,
                            remaining,
                            header: false,
                            echo: eff.echo,
                        });
                        inv.loops.len() - 1
                    }
                };
                let flow = match inv.loops[pos].remaining {
                    LoopCount::Infinite => Flow::Jump(0),
                    LoopCount::Finite(0) => {
                        // Reset so an enclosing loop can run this one again.
                        inv.loops.remove(pos);
                        if eff.echo {
                            self.echo("Loops complete");
                        }
                        Flow::Next
                    }
                    LoopCount::Finite(n) => {
                        inv.loops[pos].remaining = LoopCount::Finite(n - 1);
                        if eff.echo {
                            self.echo(&format!("{} loops remaining", n - 1));
                        }
                        Flow::Jump(0)
                    }
                };
                inv.control.loop_boundary();
                return Ok(flow);
            }

            Command::Recipe(name) => {
                game.open_recipe(name)
                    .map_err(|e| capability(line, ErrorSite::Other, e))?;
                self.pause_for(inv, eff.wait).await?;
            }

            Command::Require(status) => {
                let outcome = inv
                    .evaluator
                    .until(|| game.has_status(status), eff.max_wait)
                    .await?;
                if outcome == WaitOutcome::TimedOut {
                    return Err(timeout(line, ErrorSite::RequireTimeout, format!("status {status:?}"), &eff));
                }
                self.pause_for(inv, eff.wait).await?;
            }

            Command::RequireQuality(min) => {
                let outcome = inv
                    .evaluator
                    .until(|| game.quality().is_some_and(|q| q >= *min), eff.max_wait)
                    .await?;
                if outcome == WaitOutcome::TimedOut {
                    return Err(timeout(line, ErrorSite::RequireTimeout, format!("quality {min}"), &eff));
                }
                self.pause_for(inv, eff.wait).await?;
            }

            Command::RequireStats(required) => {
                let outcome = inv
                    .evaluator
                    .until(|| game.stats().meets(required), eff.max_wait)
                    .await?;
                if outcome == WaitOutcome::TimedOut {
                    let what = format!(
                        "stats {} / {} / {}",
                        required.craftsmanship, required.control, required.cp
                    );
                    return Err(timeout(line, ErrorSite::RequireTimeout, what, &eff));
                }
                self.pause_for(inv, eff.wait).await?;
            }

            Command::RequireRepair => {
                if game.needs_repair() {
                    self.pause_for_user(inv, "gear needs repair");
                    return Ok(Flow::Next);
                }
                self.pause_for(inv, eff.wait).await?;
            }

            Command::RequireSpiritbond(threshold) => {
                if game.spiritbond_ready(*threshold) {
                    self.pause_for_user(inv, "materia can be extracted");
                    return Ok(Flow::Next);
                }
                self.pause_for(inv, eff.wait).await?;
            }

            Command::Item(name) => {
                game.use_item(name, eff.hq).map_err(|e| {
                    let site = match e {
                        GameError::NotFound(_) => ErrorSite::ItemNotFound,
                        GameError::NotAvailable(_) => ErrorSite::ItemUnusable,
                        GameError::Timeout(_) => ErrorSite::Other,
                    };
                    capability(line, site, e)
                })?;
                self.pause_for(inv, eff.wait).await?;
            }

            Command::RunMacro(name) => {
                let wanted = name.trim().to_lowercase();
                if chain.iter().any(|n| n.trim().to_lowercase() == wanted) {
                    let mut chain = chain.to_vec();
                    chain.push(name.clone());
                    return Err(MacroError::CycleDetected { chain }.into());
                }
                let script = self
                    .library
                    .native(name)
                    .map_err(|e| Failure::from(MacroError::from(e)))?;
                inv.resume_wait = Some(eff.wait);
                let child = self.invocation(name.clone(), script, ControlHandle::new());
                let _ = child.control.request(ControlRequest::Start);
                return Ok(Flow::Enter(Box::new(child)));
            }

            Command::Send(keys) | Command::Hold(keys) | Command::Release(keys) => {
                let mode = match step.command {
                    Command::Hold(_) => KeyMode::Hold,
                    Command::Release(_) => KeyMode::Release,
                    _ => KeyMode::Press,
                };
                game.send_keys(keys, mode)
                    .map_err(|e| capability(line, ErrorSite::Other, e))?;
                self.pause_for(inv, eff.wait).await?;
            }

            Command::Target(name) => {
                game.target(name, eff.index, eff.list)
                    .map_err(|e| capability(line, ErrorSite::TargetNotFound, e))?;
                self.pause_for(inv, eff.wait).await?;
            }

            Command::WaitAddon(name) => {
                let outcome = inv
                    .evaluator
                    .until(|| game.addon_state(name) == AddonState::Visible, eff.max_wait)
                    .await?;
                if outcome == WaitOutcome::TimedOut {
                    let site = match game.addon_state(name) {
                        AddonState::Missing => ErrorSite::AddonNotFound,
                        _ => ErrorSite::AddonNotVisible,
                    };
                    return Err(timeout(line, site, format!("addon {name}"), &eff));
                }
                self.pause_for(inv, eff.wait).await?;
            }

            Command::Wait(spec) => {
                self.pause_for(inv, *spec).await?;
            }

            Command::Echo(text) => {
                self.echo(text);
                self.pause_for(inv, eff.wait).await?;
            }

            Command::Native(name) => {
                let text = format!("/{name} {}", step.raw_args);
                game.send_native(text.trim_end())
                    .map_err(|e| capability(line, ErrorSite::Other, e))?;
                self.pause_for(inv, eff.wait).await?;
            }
        }

        Ok(Flow::Next)
    }

    /// Sleep for a `<wait>` sampled once for this execution.
    async fn pause_for(&mut self, inv: &Invocation, wait: WaitSpec) -> Result<(), Interrupted> {
        if wait.is_zero() {
            return Ok(());
        }
        let duration = wait.sample(&mut self.rng);
        inv.evaluator.sleep(duration).await
    }

    /// `/requirerepair` and `/requirespiritbond` pause rather than fail.
    fn pause_for_user(&mut self, inv: &Invocation, reason: &str) {
        let message = format!("{reason}; macro paused");
        tracing::warn!(macro_name = %inv.name, "{message}");
        self.game.notify_error(&message);
        self.report.soft_errors.push(message);
        let _ = inv.control.request(ControlRequest::Pause);
    }

    fn report_soft(&mut self, macro_name: &str, error: &MacroError, policy: OnError) {
        let message = error.to_string();
        tracing::warn!(macro_name, error = %message, ?policy, "step failed");
        self.game.notify_error(&message);
        self.report.soft_errors.push(message);
    }

    fn echo(&self, text: &str) {
        self.game.echo(text);
        logging::append_output_log(&format!("echo: {text}"));
    }

    /* ---------- bridge ---------- */

    /// Execute yielded command lines one at a time until the script hangs up.
    async fn serve(
        &mut self,
        script_name: &str,
        control: &ControlHandle,
        requests: &mut mpsc::Receiver<CommandRequest>,
    ) {
        while let Some(request) = requests.recv().await {
            let result = self.run_yielded(script_name, control, &request.command).await;
            if let Err(e) = &result {
                tracing::debug!(macro_name = script_name, command = %request.command, error = %e, "yielded command failed");
            }
            // The script may have gone away; nothing to report to then.
            let _ = request.reply.send(result);
        }
    }

    async fn run_yielded(
        &mut self,
        script_name: &str,
        control: &ControlHandle,
        command: &str,
    ) -> Result<(), MacroError> {
        let Some(step) = parser::parse_step(command)? else {
            return Ok(());
        };
        if step.command.is_loop_boundary() {
            return Err(MacroError::Unsupported {
                line: step.line,
                command: step.command.name().to_string(),
                reason: "scripts loop with repeat".into(),
            });
        }
        let inv = self.invocation(
            script_name.to_string(),
            Arc::new(MacroScript::new(vec![step])),
            control.clone(),
        );
        if self.run(vec![inv]).await? {
            return Err(MacroError::Stopped);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests;
