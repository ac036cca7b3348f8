//! Shared regexes and lookup tables
//!
//! Rules may name a registered regex (`regex_id`) or lookup table
//! (`lookup_id`) instead of carrying the pattern or table inline. References
//! are resolved when a ruler is compiled, so editing an entry only affects
//! templates registered afterwards.

use super::{Rule, RuleError, RulerConfig};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RegexEntry {
    pub id: String,
    #[serde(default)]
    pub title: String,
    pub pattern: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LookupRow {
    pub value: String,
    pub replace: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LookupEntry {
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub table: Vec<LookupRow>,
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum RegistryError {
    #[error("Registry entry id cannot be empty")]
    EmptyId,
    #[error("Invalid pattern for regex '{id}': {message}")]
    InvalidPattern { id: String, message: String },
    #[error("Lookup '{id}' maps '{value}' more than once")]
    DuplicateValue { id: String, value: String },
}

#[derive(Debug, Clone, Default)]
pub struct RuleRegistry {
    regexes: BTreeMap<String, RegexEntry>,
    lookups: BTreeMap<String, LookupEntry>,
}

impl RuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a registry from configured entries, rejecting invalid ones
    pub fn from_entries(
        regexes: impl IntoIterator<Item = RegexEntry>,
        lookups: impl IntoIterator<Item = LookupEntry>,
    ) -> Result<Self, RegistryError> {
        let mut registry = Self::new();
        for entry in regexes {
            registry.put_regex(entry)?;
        }
        for entry in lookups {
            registry.put_lookup(entry)?;
        }
        Ok(registry)
    }

    /// Insert or replace a regex; returns the previous entry
    pub fn put_regex(&mut self, entry: RegexEntry) -> Result<Option<RegexEntry>, RegistryError> {
        if entry.id.is_empty() {
            return Err(RegistryError::EmptyId);
        }
        Regex::new(&entry.pattern).map_err(|e| RegistryError::InvalidPattern {
            id: entry.id.clone(),
            message: e.to_string(),
        })?;
        Ok(self.regexes.insert(entry.id.clone(), entry))
    }

    /// Insert or replace a lookup table; returns the previous entry
    pub fn put_lookup(&mut self, entry: LookupEntry) -> Result<Option<LookupEntry>, RegistryError> {
        if entry.id.is_empty() {
            return Err(RegistryError::EmptyId);
        }
        let mut seen = std::collections::HashSet::new();
        if let Some(row) = entry.table.iter().find(|row| !seen.insert(&row.value)) {
            return Err(RegistryError::DuplicateValue {
                id: entry.id.clone(),
                value: row.value.clone(),
            });
        }
        Ok(self.lookups.insert(entry.id.clone(), entry))
    }

    pub fn regex(&self, id: &str) -> Option<&RegexEntry> {
        self.regexes.get(id)
    }

    pub fn lookup(&self, id: &str) -> Option<&LookupEntry> {
        self.lookups.get(id)
    }

    /// Regexes sorted by id
    pub fn regexes(&self) -> Vec<RegexEntry> {
        self.regexes.values().cloned().collect()
    }

    /// Lookups sorted by id
    pub fn lookups(&self) -> Vec<LookupEntry> {
        self.lookups.values().cloned().collect()
    }

    pub fn remove_regex(&mut self, id: &str) -> Option<RegexEntry> {
        self.regexes.remove(id)
    }

    pub fn remove_lookup(&mut self, id: &str) -> Option<LookupEntry> {
        self.lookups.remove(id)
    }

    /// Replace registry references in `rule` with the registered values
    ///
    /// An inline table is merged over the registered one.
    pub fn resolve(&self, index: usize, rule: &Rule) -> Result<Rule, RuleError> {
        let name = rule.type_name();
        let mut rule = rule.clone();
        match &mut rule {
            Rule::Extract {
                regexp, regex_id, ..
            }
            | Rule::Sub {
                regexp, regex_id, ..
            } => {
                if let Some(id) = regex_id.take() {
                    let entry = self
                        .regex(&id)
                        .ok_or_else(|| unknown_reference(name, index, "regex", &id))?;
                    *regexp = entry.pattern.clone();
                }
            }
            Rule::Lookup {
                table, lookup_id, ..
            } => {
                if let Some(id) = lookup_id.take() {
                    let entry = self
                        .lookup(&id)
                        .ok_or_else(|| unknown_reference(name, index, "lookup", &id))?;
                    let inline = std::mem::take(table);
                    for row in &entry.table {
                        table.insert(row.value.clone(), Value::String(row.replace.clone()));
                    }
                    table.extend(inline);
                }
            }
            _ => {}
        }
        Ok(rule)
    }

    /// Resolve every rule of a ruler
    pub fn resolve_ruler(&self, ruler: &RulerConfig) -> Result<RulerConfig, RuleError> {
        let rules = ruler
            .rules
            .iter()
            .enumerate()
            .map(|(index, rule)| self.resolve(index, rule))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(RulerConfig {
            name: ruler.name.clone(),
            rules,
        })
    }
}

fn unknown_reference(rule: &'static str, index: usize, kind: &str, id: &str) -> RuleError {
    RuleError::InvalidConfig {
        rule,
        index,
        message: format!("unknown {kind} '{id}'"),
    }
}
