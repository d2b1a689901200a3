use std::collections::BTreeSet;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::exceptions::{CutoverRule, CutoverRules};
use crate::schedule::{ScheduleRegistry, StudySchedule, StudyVariant};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("config validation error: {0}")]
    Validation(String),
}

/// Cutover rules for one variant. Listing a variant replaces all of its
/// built-in rules; an empty list disables them.
#[derive(Debug, Clone, Serialize, Deserialize, Eq, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct VariantRules {
    pub variant: StudyVariant,
    #[serde(default)]
    pub rules: Vec<CutoverRule>,
}

/// Operator overrides layered over the built-in schedules and rules.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Eq, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub schedules: Vec<StudySchedule>,
    #[serde(default)]
    pub cutover_rules: Vec<VariantRules>,
}

impl Config {
    /// # Errors
    /// Returns an error when the YAML is malformed or fails validation.
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// # Errors
    /// Returns an error when the file cannot be read, parsed, or validated.
    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// # Errors
    /// Returns [`ConfigError::Validation`] when a variant appears twice in a
    /// section, or a schedule or rule set is invalid on its own.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = BTreeSet::new();
        for schedule in &self.schedules {
            if !seen.insert(schedule.variant) {
                return Err(ConfigError::Validation(format!(
                    "schedule for {} is listed more than once",
                    schedule.variant
                )));
            }
            schedule.validate().map_err(|err| ConfigError::Validation(err.to_string()))?;
        }

        let mut seen = BTreeSet::new();
        for entry in &self.cutover_rules {
            if !seen.insert(entry.variant) {
                return Err(ConfigError::Validation(format!(
                    "cutover rules for {} are listed more than once",
                    entry.variant
                )));
            }
            CutoverRules::none()
                .with_variant_rules(entry.variant, entry.rules.clone())
                .map_err(|err| ConfigError::Validation(err.to_string()))?;
        }
        Ok(())
    }

    /// Layer this config over `registry` and `rules`.
    ///
    /// # Errors
    /// Returns [`ConfigError::Validation`] when an override fails validation.
    pub fn apply(
        &self,
        registry: ScheduleRegistry,
        rules: CutoverRules,
    ) -> Result<(ScheduleRegistry, CutoverRules), ConfigError> {
        let mut registry = registry;
        for schedule in &self.schedules {
            tracing::info!(study = schedule.variant.as_str(), "schedule overridden by config");
            registry = registry
                .with_override(schedule.clone())
                .map_err(|err| ConfigError::Validation(err.to_string()))?;
        }

        let mut rules = rules;
        for entry in &self.cutover_rules {
            tracing::info!(
                study = entry.variant.as_str(),
                rules = entry.rules.len(),
                "cutover rules replaced by config"
            );
            rules = rules
                .with_variant_rules(entry.variant, entry.rules.clone())
                .map_err(|err| ConfigError::Validation(err.to_string()))?;
        }
        Ok((registry, rules))
    }
}
