//! Capability interface.
//!
//! Everything the engine knows about the game goes through [`GameState`]. The
//! trait is grouped by domain (actions, crafting, status, inventory, targeting,
//! addons, input, chat). Calls are synchronous from the engine's point of view;
//! implementations synchronize access to the live client themselves.

pub mod sim;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use sim::SimulatedGame;

/// Identifies one issued action so its acknowledgement can be polled.
pub type Ticket = u64;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GameError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("not available: {0}")]
    NotAvailable(String),

    #[error("timed out: {0}")]
    Timeout(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AddonState {
    Missing,
    Hidden,
    Visible,
}

impl AddonState {
    pub fn as_str(self) -> &'static str {
        match self {
            AddonState::Missing => "missing",
            AddonState::Hidden => "hidden",
            AddonState::Visible => "visible",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CraftStats {
    pub craftsmanship: u32,
    pub control: u32,
    pub cp: u32,
}

impl CraftStats {
    /// True when every stat is at least the required one.
    pub fn meets(&self, required: &CraftStats) -> bool {
        self.craftsmanship >= required.craftsmanship
            && self.control >= required.control
            && self.cp >= required.cp
    }
}

/// How an action relates to a synthesis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionCategory {
    General,
    Crafting,
    /// A crafting action that only raises quality.
    Quality,
}

impl ActionCategory {
    pub fn is_crafting(self) -> bool {
        matches!(self, ActionCategory::Crafting | ActionCategory::Quality)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyMode {
    Press,
    Hold,
    Release,
}

pub trait GameState: Send + Sync {
    /* ---- actions ---- */
    /// Issue an action. Acknowledgement arrives later; poll it with [`GameState::is_acknowledged`].
    fn send_action(&self, name: &str) -> Result<Ticket, GameError>;
    fn is_acknowledged(&self, ticket: Ticket) -> bool;
    /// True while the client is still animating/processing the last action.
    fn is_busy(&self) -> bool;
    fn action_category(&self, name: &str) -> ActionCategory;

    /* ---- crafting ---- */
    /// Current synthesis condition, `None` when not crafting.
    fn crafting_condition(&self) -> Option<String>;
    /// Localized names of every condition the client can report.
    fn condition_names(&self) -> Vec<String>;
    fn quality(&self) -> Option<u32>;
    /// HQ chance in percent, `None` when not crafting.
    fn hq_chance(&self) -> Option<u32>;
    fn stats(&self) -> CraftStats;
    fn open_recipe(&self, name: &str) -> Result<(), GameError>;
    fn needs_repair(&self) -> bool;
    fn spiritbond_ready(&self, threshold: Option<f64>) -> bool;

    /* ---- status ---- */
    fn has_status(&self, name: &str) -> bool;

    /* ---- inventory ---- */
    fn item_count(&self, name: &str, hq: bool) -> u32;
    fn use_item(&self, name: &str, hq: bool) -> Result<(), GameError>;

    /* ---- targeting ---- */
    fn target(&self, name: &str, index: Option<u32>, list: Option<u32>) -> Result<(), GameError>;
    fn current_target(&self) -> Option<String>;

    /* ---- addons / UI ---- */
    fn addon_state(&self, name: &str) -> AddonState;
    fn click(&self, name: &str) -> Result<(), GameError>;

    /* ---- input ---- */
    fn send_keys(&self, keys: &[String], mode: KeyMode) -> Result<(), GameError>;

    /* ---- chat ---- */
    fn echo(&self, text: &str);
    /// Error channel; the soft-error sink.
    fn notify_error(&self, text: &str);
    /// Forward a slash command the engine does not know to the client.
    fn send_native(&self, line: &str) -> Result<(), GameError>;
}
