//! Service restart triggers
//!
//! A [`Trigger`] names a service and the pathname patterns that, when
//! touched by an update, require that service to be stopped before the
//! change and started again afterwards.
//!
//! A [`TriggerSet`] is the compiled, per-cycle form: it remembers which
//! triggers matched since the last [`TriggerSet::reset`]. Match state is
//! never persisted; only the trigger definitions are saved between updates.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

use anyhow::Context;
use regex::Regex;
use serde::{Deserialize, Serialize};

use super::errors::DomainError;

/// Service name that is never stopped and is always started last
pub const SELF_SERVICE: &str = "subd";

/// Pseudo-service that reboots the machine
pub const REBOOT_SERVICE: &str = "reboot";

/// A service restart rule
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Trigger {
    /// Regular expressions matched against whole pathnames
    pub match_lines: Vec<String>,
    pub service: String,
    #[serde(default)]
    pub do_reboot: bool,
    #[serde(default)]
    pub high_impact: bool,
}

impl Trigger {
    pub fn new(service: impl Into<String>, match_lines: Vec<String>) -> Self {
        Self {
            match_lines,
            service: service.into(),
            do_reboot: false,
            high_impact: false,
        }
    }
}

/// What the trigger runner is asked to do with matched services
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerAction {
    Start,
    Stop,
}

impl fmt::Display for TriggerAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TriggerAction::Start => write!(f, "start"),
            TriggerAction::Stop => write!(f, "stop"),
        }
    }
}

#[derive(Debug, Clone)]
struct CompiledTrigger {
    trigger: Trigger,
    regexes: Vec<Regex>,
    matched: bool,
}

/// Compiled trigger list with per-cycle match state
#[derive(Debug, Clone, Default)]
pub struct TriggerSet {
    entries: Vec<CompiledTrigger>,
}

impl TriggerSet {
    /// Compiles every match line as a whole-pathname regular expression
    pub fn new(triggers: Vec<Trigger>) -> Result<Self, DomainError> {
        let mut entries = Vec::with_capacity(triggers.len());
        for trigger in triggers {
            let regexes = trigger
                .match_lines
                .iter()
                .map(|line| {
                    Regex::new(&format!("^(?:{line})$")).map_err(|e| {
                        DomainError::InvalidPattern {
                            pattern: line.clone(),
                            reason: e.to_string(),
                        }
                    })
                })
                .collect::<Result<Vec<_>, _>>()?;
            entries.push(CompiledTrigger {
                trigger,
                regexes,
                matched: false,
            });
        }
        Ok(Self { entries })
    }

    /// Marks every trigger whose patterns match `path`
    ///
    /// Returns true if at least one trigger matched.
    pub fn match_path(&mut self, path: &str) -> bool {
        let mut any = false;
        for entry in &mut self.entries {
            if entry.regexes.iter().any(|regex| regex.is_match(path)) {
                entry.matched = true;
                any = true;
            }
        }
        any
    }

    /// Matched triggers in configured order
    pub fn matched_triggers(&self) -> Vec<Trigger> {
        self.entries
            .iter()
            .filter(|entry| entry.matched)
            .map(|entry| entry.trigger.clone())
            .collect()
    }

    /// Returns `(matched, total)`
    pub fn match_statistics(&self) -> (usize, usize) {
        let matched = self.entries.iter().filter(|entry| entry.matched).count();
        (matched, self.entries.len())
    }

    /// Clears match state
    pub fn reset(&mut self) {
        for entry in &mut self.entries {
            entry.matched = false;
        }
    }

    /// Trigger definitions in configured order
    pub fn triggers(&self) -> Vec<Trigger> {
        self.entries.iter().map(|entry| entry.trigger.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Merges trigger lists
///
/// Triggers for the same service are combined: match lines are unioned (in
/// first-seen order) and the reboot and high-impact flags are OR'd. The
/// result is ordered by service name.
pub fn merge_triggers<'a, I>(lists: I) -> Vec<Trigger>
where
    I: IntoIterator<Item = &'a [Trigger]>,
{
    let mut merged: BTreeMap<String, Trigger> = BTreeMap::new();
    for list in lists {
        for trigger in list {
            let entry = merged
                .entry(trigger.service.clone())
                .or_insert_with(|| Trigger::new(trigger.service.clone(), Vec::new()));
            for line in &trigger.match_lines {
                if !entry.match_lines.contains(line) {
                    entry.match_lines.push(line.clone());
                }
            }
            entry.do_reboot |= trigger.do_reboot;
            entry.high_impact |= trigger.high_impact;
        }
    }
    merged.into_values().collect()
}

/// Loads a saved trigger list; a missing file yields an empty list
pub fn load_triggers(path: &Path) -> anyhow::Result<Vec<Trigger>> {
    match std::fs::read(path) {
        Ok(bytes) => serde_json::from_slice(&bytes)
            .with_context(|| format!("Failed to parse triggers file {}", path.display())),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(e).with_context(|| format!("Failed to read {}", path.display())),
    }
}

/// Saves a trigger list via a temporary file and rename
pub fn save_triggers(path: &Path, triggers: &[Trigger]) -> anyhow::Result<()> {
    let json = serde_json::to_vec_pretty(triggers).context("Failed to encode triggers")?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, json).with_context(|| format!("Failed to write {}", tmp.display()))?;
    std::fs::rename(&tmp, path)
        .with_context(|| format!("Failed to rename {} into place", tmp.display()))?;
    Ok(())
}
