//! In-memory game used by the CLI, the control server and the tests.
//!
//! The world is plain data (loadable from JSON); the most recent commands
//! issued against it are kept in order so callers can assert on what the
//! engine did.

use std::collections::{HashMap, VecDeque};
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use super::{ActionCategory, AddonState, CraftStats, GameError, GameState, KeyMode, Ticket};
use crate::config::ConfigError;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ItemStack {
    pub nq: u32,
    pub hq: u32,
    pub usable: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct World {
    pub statuses: Vec<String>,
    pub addons: HashMap<String, AddonState>,
    pub condition: Option<String>,
    pub condition_names: Vec<String>,
    pub quality: Option<u32>,
    pub hq_chance: Option<u32>,
    pub stats: CraftStats,
    pub broken_gear: bool,
    /// Items at 100% spiritbond.
    pub spiritbond_full: u32,
    /// Highest spiritbond among the items that are not full yet.
    pub next_spiritbond: f64,
    pub inventory: HashMap<String, ItemStack>,
    pub targets: Vec<String>,
    pub target: Option<String>,
    /// Known recipes; empty means every recipe exists.
    pub recipes: Vec<String>,
    /// Known actions; empty means every action exists.
    pub actions: Vec<String>,
    /// Actions only usable during a synthesis.
    pub crafting_actions: Vec<String>,
    /// Crafting actions that only raise quality.
    pub quality_actions: Vec<String>,
    pub acknowledge_actions: bool,
    /// The first N issued actions are never acknowledged (lag).
    pub drop_first_acks: u64,
    pub ack_delay_ms: u64,
    pub busy: bool,
}

impl Default for World {
    fn default() -> Self {
        Self {
            statuses: Vec::new(),
            addons: HashMap::new(),
            condition: None,
            condition_names: ["Normal", "Good", "Excellent", "Poor"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            quality: None,
            hq_chance: None,
            stats: CraftStats::default(),
            broken_gear: false,
            spiritbond_full: 0,
            next_spiritbond: 0.0,
            inventory: HashMap::new(),
            targets: Vec::new(),
            target: None,
            recipes: Vec::new(),
            actions: Vec::new(),
            crafting_actions: Vec::new(),
            quality_actions: Vec::new(),
            acknowledge_actions: true,
            drop_first_acks: 0,
            ack_delay_ms: 0,
            busy: false,
        }
    }
}

/// Tickets older than this many actions are forgotten and never acknowledged.
const LIVE_TICKETS: Ticket = 256;

/// Commands kept by default; older entries are dropped first.
pub const DEFAULT_TRACE_LIMIT: usize = 4096;

pub struct SimulatedGame {
    world: Mutex<World>,
    commands: Mutex<VecDeque<String>>,
    trace_limit: usize,
    issued: Mutex<HashMap<Ticket, Instant>>,
    next_ticket: AtomicU64,
    echo_to_stdout: bool,
}

impl Default for SimulatedGame {
    fn default() -> Self {
        Self::new(World::default())
    }
}

impl SimulatedGame {
    pub fn new(world: World) -> Self {
        Self {
            world: Mutex::new(world),
            commands: Mutex::new(VecDeque::new()),
            trace_limit: DEFAULT_TRACE_LIMIT,
            issued: Mutex::new(HashMap::new()),
            next_ticket: AtomicU64::new(1),
            echo_to_stdout: false,
        }
    }

    pub fn from_json_file(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let world: World = serde_json::from_str(&text).map_err(|source| ConfigError::Json {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(Self::new(world))
    }

    /// Print echoes to stdout and errors to stderr, as the CLI does.
    pub fn with_stdout(mut self, on: bool) -> Self {
        self.echo_to_stdout = on;
        self
    }

    /// Keep at most `limit` commands in the trace.
    pub fn with_trace_limit(mut self, limit: usize) -> Self {
        self.trace_limit = limit;
        self
    }

    pub fn update(&self, f: impl FnOnce(&mut World)) {
        f(&mut self.world());
    }

    pub fn snapshot(&self) -> World {
        self.world().clone()
    }

    /// The retained commands, oldest first.
    pub fn commands(&self) -> Vec<String> {
        lock(&self.commands).iter().cloned().collect()
    }

    pub fn count_commands(&self, prefix: &str) -> usize {
        lock(&self.commands)
            .iter()
            .filter(|c| c.starts_with(prefix))
            .count()
    }

    pub fn echoes(&self) -> Vec<String> {
        lock(&self.commands)
            .iter()
            .filter_map(|c| c.strip_prefix("echo ").map(str::to_string))
            .collect()
    }

    fn world(&self) -> MutexGuard<'_, World> {
        lock(&self.world)
    }

    fn record(&self, entry: String) {
        let mut commands = lock(&self.commands);
        if self.trace_limit == 0 {
            return;
        }
        while commands.len() >= self.trace_limit {
            commands.pop_front();
        }
        commands.push_back(entry);
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn same(a: &str, b: &str) -> bool {
    a.trim().to_lowercase() == b.trim().to_lowercase()
}

fn known(list: &[String], name: &str) -> bool {
    list.is_empty() || listed(list, name)
}

fn listed(list: &[String], name: &str) -> bool {
    list.iter().any(|n| same(n, name))
}

impl GameState for SimulatedGame {
    fn send_action(&self, name: &str) -> Result<Ticket, GameError> {
        if !known(&self.world().actions, name) {
            return Err(GameError::NotFound(format!("action {name}")));
        }
        let ticket = self.next_ticket.fetch_add(1, Ordering::Relaxed);
        {
            let mut issued = lock(&self.issued);
            issued.retain(|t, _| ticket - *t < LIVE_TICKETS);
            issued.insert(ticket, Instant::now());
        }
        self.record(format!("action {name}"));
        Ok(ticket)
    }

    fn is_acknowledged(&self, ticket: Ticket) -> bool {
        let (ack, drop_first, delay) = {
            let w = self.world();
            (w.acknowledge_actions, w.drop_first_acks, w.ack_delay_ms)
        };
        if !ack || ticket <= drop_first {
            return false;
        }
        match lock(&self.issued).get(&ticket) {
            Some(at) => at.elapsed().as_millis() >= u128::from(delay),
            None => false,
        }
    }

    fn is_busy(&self) -> bool {
        self.world().busy
    }

    fn action_category(&self, name: &str) -> ActionCategory {
        let w = self.world();
        if listed(&w.quality_actions, name) {
            ActionCategory::Quality
        } else if listed(&w.crafting_actions, name) {
            ActionCategory::Crafting
        } else {
            ActionCategory::General
        }
    }

    fn crafting_condition(&self) -> Option<String> {
        self.world().condition.clone()
    }

    fn condition_names(&self) -> Vec<String> {
        self.world().condition_names.clone()
    }

    fn quality(&self) -> Option<u32> {
        self.world().quality
    }

    fn hq_chance(&self) -> Option<u32> {
        let w = self.world();
        w.condition.as_ref().and(w.hq_chance)
    }

    fn stats(&self) -> CraftStats {
        self.world().stats
    }

    fn open_recipe(&self, name: &str) -> Result<(), GameError> {
        if !known(&self.world().recipes, name) {
            return Err(GameError::NotFound(format!("recipe {name}")));
        }
        self.record(format!("recipe {name}"));
        Ok(())
    }

    fn needs_repair(&self) -> bool {
        self.world().broken_gear
    }

    fn spiritbond_ready(&self, threshold: Option<f64>) -> bool {
        let w = self.world();
        w.spiritbond_full > 0 && threshold.map_or(true, |t| w.next_spiritbond < t)
    }

    fn has_status(&self, name: &str) -> bool {
        self.world().statuses.iter().any(|s| same(s, name))
    }

    fn item_count(&self, name: &str, hq: bool) -> u32 {
        let w = self.world();
        w.inventory
            .iter()
            .find(|(k, _)| same(k, name))
            .map(|(_, stack)| if hq { stack.hq } else { stack.nq + stack.hq })
            .unwrap_or(0)
    }

    fn use_item(&self, name: &str, hq: bool) -> Result<(), GameError> {
        {
            let mut w = self.world();
            let stack = w
                .inventory
                .iter_mut()
                .find(|(k, _)| same(k, name))
                .map(|(_, stack)| stack)
                .ok_or_else(|| GameError::NotFound(format!("item {name}")))?;
            if !stack.usable {
                return Err(GameError::NotAvailable(format!("item {name}")));
            }
            let slot = if hq { &mut stack.hq } else { &mut stack.nq };
            if *slot == 0 {
                return Err(GameError::NotFound(format!(
                    "item {name}{}",
                    if hq { " (hq)" } else { "" }
                )));
            }
            *slot -= 1;
        }
        self.record(format!("item {name}{}", if hq { " hq" } else { "" }));
        Ok(())
    }

    fn target(&self, name: &str, index: Option<u32>, list: Option<u32>) -> Result<(), GameError> {
        let found = {
            let mut w = self.world();
            let nth = list.unwrap_or(1).max(1) as usize;
            let hit = w
                .targets
                .iter()
                .filter(|t| same(t, name))
                .nth(nth - 1)
                .cloned();
            if let Some(t) = &hit {
                w.target = Some(t.clone());
            }
            hit
        };
        match found {
            Some(t) => {
                let suffix = index.map(|i| format!(" #{i}")).unwrap_or_default();
                self.record(format!("target {t}{suffix}"));
                Ok(())
            }
            None => Err(GameError::NotFound(format!("target {name}"))),
        }
    }

    fn current_target(&self) -> Option<String> {
        self.world().target.clone()
    }

    fn addon_state(&self, name: &str) -> AddonState {
        self.world()
            .addons
            .iter()
            .find(|(k, _)| same(k, name))
            .map(|(_, state)| *state)
            .unwrap_or(AddonState::Missing)
    }

    fn click(&self, name: &str) -> Result<(), GameError> {
        self.record(format!("click {name}"));
        Ok(())
    }

    fn send_keys(&self, keys: &[String], mode: KeyMode) -> Result<(), GameError> {
        let verb = match mode {
            KeyMode::Press => "send",
            KeyMode::Hold => "hold",
            KeyMode::Release => "release",
        };
        self.record(format!("{verb} {}", keys.join("+")));
        Ok(())
    }

    fn echo(&self, text: &str) {
        if self.echo_to_stdout {
            println!("echo: {text}");
        }
        self.record(format!("echo {text}"));
    }

    fn notify_error(&self, text: &str) {
        if self.echo_to_stdout {
            eprintln!("error: {text}");
        }
        self.record(format!("error {text}"));
    }

    fn send_native(&self, line: &str) -> Result<(), GameError> {
        self.record(format!("native {line}"));
        Ok(())
    }
}
