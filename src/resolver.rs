//! Modifier resolution.
//!
//! Turns a step's parsed [`ModifierSet`] into concrete values for execution:
//! defaults applied, command support checked, condition names validated
//! against what the game reports. Runs on first execution of a step, so a
//! bad modifier fails the step that owns it rather than the whole parse.

use std::time::Duration;

use crate::config::EngineConfig;
use crate::error::ModifierError;
use crate::parser::modifiers::seconds;
use crate::parser::{ConditionTerm, ModifierSet, Step, WaitSpec};

/// `<condition>` terms; the step runs when any term matches.
#[derive(Debug, Clone, PartialEq)]
pub struct ConditionFilter {
    terms: Vec<ConditionTerm>,
}

impl ConditionFilter {
    pub fn new(terms: Vec<ConditionTerm>) -> Self {
        Self { terms }
    }

    /// `current` is `None` outside of a synthesis; only negated terms match then.
    pub fn matches(&self, current: Option<&str>) -> bool {
        let current = current.map(|c| c.trim().to_lowercase());
        self.terms.iter().any(|term| {
            let hit = current.as_deref() == Some(term.name.trim().to_lowercase().as_str());
            hit != term.negated
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EffectiveModifiers {
    pub wait: WaitSpec,
    pub max_wait: Duration,
    pub condition: Option<ConditionFilter>,
    pub unsafe_action: bool,
    pub echo: bool,
    pub index: Option<u32>,
    pub list: Option<u32>,
    pub hq: bool,
}

pub struct Resolver<'a> {
    config: &'a EngineConfig,
    condition_names: Vec<String>,
}

impl<'a> Resolver<'a> {
    /// `condition_names` is the client's list of condition names; empty skips validation.
    pub fn new(config: &'a EngineConfig, condition_names: Vec<String>) -> Self {
        Self {
            config,
            condition_names,
        }
    }

    pub fn resolve(&self, step: &Step) -> Result<EffectiveModifiers, ModifierError> {
        let mods: &ModifierSet = &step.modifiers;

        for kind in mods.kinds() {
            if !step.command.accepts(kind) {
                return Err(ModifierError::NotSupported {
                    modifier: kind.as_str(),
                    command: step.command.name().to_string(),
                });
            }
        }

        let wait = mods.wait.unwrap_or(WaitSpec::ZERO);
        match wait {
            WaitSpec::Range(lo, hi) if lo > hi => {
                return Err(ModifierError::InvertedRange { lo, hi });
            }
            WaitSpec::Fixed(secs) | WaitSpec::Range(_, secs) if seconds(secs).is_none() => {
                return Err(ModifierError::OutOfRange {
                    modifier: "wait",
                    value: secs,
                });
            }
            _ => {}
        }

        let condition = match &mods.condition {
            Some(terms) => {
                self.validate_conditions(terms)?;
                Some(ConditionFilter::new(terms.clone()))
            }
            None => None,
        };

        let max_wait = match mods.max_wait {
            Some(secs) => seconds(secs).ok_or(ModifierError::OutOfRange {
                modifier: "maxwait",
                value: secs,
            })?,
            None => self.config.default_max_wait(),
        };

        Ok(EffectiveModifiers {
            wait,
            max_wait,
            condition,
            unsafe_action: mods.unsafe_action,
            echo: mods.echo || (self.config.loop_echo && step.command.is_loop_boundary()),
            index: mods.index,
            list: mods.list,
            hq: mods.hq,
        })
    }

    fn validate_conditions(&self, terms: &[ConditionTerm]) -> Result<(), ModifierError> {
        if self.condition_names.is_empty() {
            return Ok(());
        }
        for term in terms {
            let wanted = term.name.trim().to_lowercase();
            if !self
                .condition_names
                .iter()
                .any(|n| n.trim().to_lowercase() == wanted)
            {
                return Err(ModifierError::UnknownCondition {
                    name: term.name.clone(),
                });
            }
        }
        Ok(())
    }
}
