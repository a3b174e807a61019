//! Engine configuration.
//!
//! Values are injected into the resolver, evaluator, retry controller and
//! scheduler. Load order: built-in defaults, then an optional JSON file, then
//! `PCRAFT_*` environment overrides.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::parser::modifiers::seconds;

pub const MAX_TIMEOUT_RETRIES: u8 = 10;
const DEFAULT_MAX_WAIT_SECS: f64 = 5.0;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("craft loop template must contain {{{{macro}}}}")]
    Template,
}

/// What to do when a soft error happens at a given site.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OnError {
    Stop,
    Continue,
}

/// Where a soft error came from; each site has its own policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSite {
    ActionTimeout,
    ItemNotFound,
    ItemUnusable,
    TargetNotFound,
    AddonNotFound,
    AddonNotVisible,
    RequireTimeout,
    ClickFailed,
    Other,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ErrorPolicy {
    pub action_timeout: OnError,
    pub item_not_found: OnError,
    pub item_unusable: OnError,
    pub target_not_found: OnError,
    pub addon_not_found: OnError,
    pub addon_not_visible: OnError,
    pub require_timeout: OnError,
    pub click_failed: OnError,
    pub other: OnError,
}

impl Default for ErrorPolicy {
    fn default() -> Self {
        Self {
            action_timeout: OnError::Stop,
            item_not_found: OnError::Stop,
            item_unusable: OnError::Stop,
            target_not_found: OnError::Stop,
            addon_not_found: OnError::Stop,
            addon_not_visible: OnError::Stop,
            require_timeout: OnError::Stop,
            click_failed: OnError::Continue,
            other: OnError::Stop,
        }
    }
}

impl ErrorPolicy {
    pub fn for_site(&self, site: ErrorSite) -> OnError {
        match site {
            ErrorSite::ActionTimeout => self.action_timeout,
            ErrorSite::ItemNotFound => self.item_not_found,
            ErrorSite::ItemUnusable => self.item_unusable,
            ErrorSite::TargetNotFound => self.target_not_found,
            ErrorSite::AddonNotFound => self.addon_not_found,
            ErrorSite::AddonNotVisible => self.addon_not_visible,
            ErrorSite::RequireTimeout => self.require_timeout,
            ErrorSite::ClickFailed => self.click_failed,
            ErrorSite::Other => self.other,
        }
    }

    /// Every site set to the same policy.
    pub fn uniform(policy: OnError) -> Self {
        Self {
            action_timeout: policy,
            item_not_found: policy,
            item_unusable: policy,
            target_not_found: policy,
            addon_not_found: policy,
            addon_not_visible: policy,
            require_timeout: policy,
            click_failed: policy,
            other: policy,
        }
    }
}

/// How `craft N <macro>` wraps a macro into a crafting loop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CraftLoopConfig {
    /// Use `template` instead of the built-in layout.
    pub use_template: bool,
    /// `{{macro}}` is replaced by the macro text, `{{count}}` by the loop count.
    pub template: String,
    /// The loop starts with the Crafting Log open rather than mid-synthesis.
    pub from_recipe_note: bool,
    /// Add `<echo>` to the generated `/craft`.
    pub echo: bool,
    /// `<maxwait>` of the generated `/waitaddon` steps.
    pub max_wait_secs: u32,
}

impl Default for CraftLoopConfig {
    fn default() -> Self {
        Self {
            use_template: false,
            template: DEFAULT_CRAFT_LOOP_TEMPLATE.to_string(),
            from_recipe_note: true,
            echo: false,
            max_wait_secs: 5,
        }
    }
}

pub const DEFAULT_CRAFT_LOOP_TEMPLATE: &str = "/craft {{count}}
/waitaddon \"RecipeNote\" <maxwait.5>
/click synthesize
/waitaddon \"Synthesis\" <maxwait.5>
{{macro}}
/loop";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub max_timeout_retries: u8,
    pub action_ack_timeout_ms: u64,
    pub poll_interval_ms: u64,
    pub default_max_wait_secs: f64,
    pub loop_echo: bool,
    pub loop_total: bool,
    pub smart_wait: bool,
    /// Skip crafting actions while no synthesis is running.
    pub craft_skip: bool,
    /// Skip quality actions once the HQ chance is at 100%.
    pub quality_skip: bool,
    pub craft_loop: CraftLoopConfig,
    pub macros_dir: PathBuf,
    pub on_error: ErrorPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_timeout_retries: 3,
            action_ack_timeout_ms: 10_000,
            poll_interval_ms: 100,
            default_max_wait_secs: DEFAULT_MAX_WAIT_SECS,
            loop_echo: false,
            loop_total: false,
            smart_wait: false,
            craft_skip: true,
            quality_skip: true,
            craft_loop: CraftLoopConfig::default(),
            macros_dir: PathBuf::from("macros"),
            on_error: ErrorPolicy::default(),
        }
    }
}

impl EngineConfig {
    /// Defaults, then the optional JSON file, then environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut cfg = match path {
            Some(p) => Self::from_file(p)?,
            None => match env::var("PCRAFT_CONFIG") {
                Ok(p) if !p.trim().is_empty() => Self::from_file(Path::new(p.trim()))?,
                _ => Self::default(),
            },
        };
        cfg.apply_env_overrides();
        Ok(cfg.normalized())
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let cfg: EngineConfig =
            serde_json::from_str(&text).map_err(|source| ConfigError::Json {
                path: path.to_path_buf(),
                source,
            })?;
        Ok(cfg.normalized())
    }

    fn apply_env_overrides(&mut self) {
        if let Some(v) = env_parse::<u8>("PCRAFT_MAX_RETRIES") {
            self.max_timeout_retries = v;
        }
        if let Some(v) = env_parse::<u64>("PCRAFT_ACK_TIMEOUT_MS") {
            self.action_ack_timeout_ms = v;
        }
        if let Some(v) = env_parse::<u64>("PCRAFT_POLL_MS") {
            self.poll_interval_ms = v;
        }
        if let Ok(dir) = env::var("PCRAFT_MACROS_DIR") {
            if !dir.trim().is_empty() {
                self.macros_dir = PathBuf::from(dir.trim());
            }
        }
    }

    /// Clamp values into their documented ranges.
    pub fn normalized(mut self) -> Self {
        self.max_timeout_retries = self.max_timeout_retries.min(MAX_TIMEOUT_RETRIES);
        self.poll_interval_ms = self.poll_interval_ms.max(1);
        let secs = self.default_max_wait_secs;
        if secs.is_nan() || secs < 0.0 || seconds(secs).is_none() {
            self.default_max_wait_secs = DEFAULT_MAX_WAIT_SECS;
        }
        self
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.action_ack_timeout_ms)
    }

    pub fn default_max_wait(&self) -> Duration {
        seconds(self.default_max_wait_secs)
            .unwrap_or(Duration::from_secs_f64(DEFAULT_MAX_WAIT_SECS))
    }

    pub fn policy(&self, site: ErrorSite) -> OnError {
        self.on_error.for_site(site)
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|v| v.trim().parse::<T>().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.max_timeout_retries, 3);
        assert_eq!(cfg.default_max_wait(), Duration::from_secs(5));
        assert_eq!(cfg.policy(ErrorSite::ActionTimeout), OnError::Stop);
        assert_eq!(cfg.policy(ErrorSite::ClickFailed), OnError::Continue);
        assert!(cfg.craft_skip && cfg.quality_skip);
        assert!(cfg.craft_loop.from_recipe_note);
        assert!(cfg.craft_loop.template.contains("{{macro}}"));
    }

    #[test]
    fn craft_loop_section_is_partial() {
        let cfg: EngineConfig =
            serde_json::from_str(r#"{ "quality_skip": false, "craft_loop": { "echo": true } }"#)
                .unwrap();
        assert!(!cfg.quality_skip);
        assert!(cfg.craft_skip);
        assert!(cfg.craft_loop.echo);
        assert_eq!(cfg.craft_loop.max_wait_secs, 5);
        assert!(!cfg.craft_loop.use_template);
    }

    #[test]
    fn partial_json_keeps_defaults_and_clamps_retries() {
        let cfg: EngineConfig = serde_json::from_str(
            r#"{ "max_timeout_retries": 42, "loop_echo": true, "on_error": { "item_not_found": "continue" } }"#,
        )
        .unwrap();
        let cfg = cfg.normalized();
        assert_eq!(cfg.max_timeout_retries, MAX_TIMEOUT_RETRIES);
        assert!(cfg.loop_echo);
        assert_eq!(cfg.policy(ErrorSite::ItemNotFound), OnError::Continue);
        assert_eq!(cfg.policy(ErrorSite::TargetNotFound), OnError::Stop);
        assert_eq!(cfg.poll_interval(), Duration::from_millis(100));
    }

    #[test]
    fn unusable_default_max_wait_falls_back() {
        for bad in [1e20, -1.0, f64::INFINITY, f64::NAN] {
            let cfg = EngineConfig {
                default_max_wait_secs: bad,
                ..EngineConfig::default()
            }
            .normalized();
            assert_eq!(cfg.default_max_wait(), Duration::from_secs(5), "{bad}");
        }
    }

    #[test]
    fn from_file_reports_bad_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pcraft.json");
        fs::write(&path, "{ not json").unwrap();
        assert!(matches!(
            EngineConfig::from_file(&path),
            Err(ConfigError::Json { .. })
        ));
    }
}
