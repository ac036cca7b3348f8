//! String processing rule engine
//!
//! A ruler is an ordered list of field-level rules applied to a payload. Each
//! rule reads and rewrites a single field; rules run strictly in declared order
//! and each one sees the payload produced by the previous one.
//!
//! Evaluation failures are collected as diagnostics instead of stopping the
//! sequence, so a missing field in the third rule does not prevent the fourth
//! from running. Configuration errors (bad regex, zero `count`) are reported
//! when the rules are compiled into a [`Converter`].
//!
//! ```
//! use agentbus::rules::{Converter, Rule};
//! use serde_json::json;
//!
//! let rules: Vec<Rule> = serde_json::from_value(json!([
//!     {"type": "sub", "fieldname": "msg", "regexp": "o", "repl": "0"},
//!     {"type": "upper", "fieldname": "msg"},
//! ])).unwrap();
//! let converter = Converter::new(&rules).unwrap();
//!
//! let payload = json!({"msg": "foo"}).as_object().unwrap().clone();
//! let outcome = converter.apply(&payload);
//! assert!(outcome.errors.is_empty());
//! assert_eq!(outcome.payload["msg"], "F00");
//! ```

use crate::protocol::Payload;
use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use thiserror::Error;
use tracing::debug;

mod registry;

pub use registry::{LookupEntry, LookupRow, RegexEntry, RegistryError, RuleRegistry};

/// A single field-level rule as written in configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Rule {
    /// Overwrite `fieldname` with what `regexp` captures from it
    Extract {
        fieldname: String,
        #[serde(alias = "pattern", default)]
        regexp: String,
        /// Registered regex used instead of `regexp`
        #[serde(default, skip_serializing_if = "Option::is_none")]
        regex_id: Option<String>,
        #[serde(default)]
        icase: bool,
    },
    /// Replace `regexp` matches in `fieldname`, at most `count` times
    Sub {
        fieldname: String,
        #[serde(alias = "pattern", default)]
        regexp: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        regex_id: Option<String>,
        repl: String,
        #[serde(default)]
        count: Option<usize>,
        #[serde(default)]
        icase: bool,
    },
    Set {
        fieldname: String,
        value: Value,
    },
    Unset {
        fieldname: String,
    },
    /// Map the value of `fieldname` through `table`
    Lookup {
        fieldname: String,
        #[serde(default)]
        table: Map<String, Value>,
        /// Registered table merged under `table`
        #[serde(default, skip_serializing_if = "Option::is_none")]
        lookup_id: Option<String>,
        #[serde(default)]
        icase: bool,
    },
    Lower {
        fieldname: String,
    },
    Upper {
        fieldname: String,
    },
}

impl Rule {
    pub fn type_name(&self) -> &'static str {
        match self {
            Rule::Extract { .. } => "extract",
            Rule::Sub { .. } => "sub",
            Rule::Set { .. } => "set",
            Rule::Unset { .. } => "unset",
            Rule::Lookup { .. } => "lookup",
            Rule::Lower { .. } => "lower",
            Rule::Upper { .. } => "upper",
        }
    }

    pub fn fieldname(&self) -> &str {
        match self {
            Rule::Extract { fieldname, .. }
            | Rule::Sub { fieldname, .. }
            | Rule::Set { fieldname, .. }
            | Rule::Unset { fieldname }
            | Rule::Lookup { fieldname, .. }
            | Rule::Lower { fieldname }
            | Rule::Upper { fieldname } => fieldname,
        }
    }
}

/// A named, ordered sequence of rules
///
/// Factory tasks declare rulers inline as `{type, rules}`, so `type` is
/// accepted as an alias of `name`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RulerConfig {
    #[serde(alias = "type")]
    pub name: String,
    #[serde(default)]
    pub rules: Vec<Rule>,
}

/// Rule configuration and evaluation errors
#[derive(Debug, Clone, Error, PartialEq)]
pub enum RuleError {
    #[error("Invalid {rule} rule #{index}: {message}")]
    InvalidConfig {
        rule: &'static str,
        index: usize,
        message: String,
    },
    #[error("{rule}: field '{fieldname}' not found")]
    MissingField {
        rule: &'static str,
        fieldname: String,
    },
    #[error("{rule}: field '{fieldname}' is not a string")]
    NotAString {
        rule: &'static str,
        fieldname: String,
    },
    #[error("extract: pattern '{pattern}' does not match field '{fieldname}'")]
    NoMatch { fieldname: String, pattern: String },
}

/// Result of applying a converter: the new payload plus per-rule diagnostics
#[derive(Debug, Clone, PartialEq)]
pub struct RuleOutcome {
    pub payload: Payload,
    pub errors: Vec<RuleError>,
}

impl RuleOutcome {
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }
}

#[derive(Debug, Clone)]
enum CompiledRule {
    Extract {
        fieldname: String,
        regex: Regex,
    },
    Sub {
        fieldname: String,
        regex: Regex,
        repl: String,
        count: Option<usize>,
    },
    Set {
        fieldname: String,
        value: Value,
    },
    Unset {
        fieldname: String,
    },
    Lookup {
        fieldname: String,
        table: HashMap<String, Value>,
        icase: bool,
    },
    Lower {
        fieldname: String,
    },
    Upper {
        fieldname: String,
    },
}

/// Compiled, immutable sequence of rules ready to be applied
#[derive(Debug, Clone, Default)]
pub struct Converter {
    rules: Vec<CompiledRule>,
}

impl Converter {
    /// Compile rules, validating their configuration
    pub fn new(rules: &[Rule]) -> Result<Self, RuleError> {
        let rules = rules
            .iter()
            .enumerate()
            .map(|(index, rule)| compile_rule(index, rule))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { rules })
    }

    /// Compile several rulers into a single sequence, preserving their order
    pub fn from_rulers<'a, I>(rulers: I) -> Result<Self, RuleError>
    where
        I: IntoIterator<Item = &'a RulerConfig>,
    {
        let mut compiled = Vec::new();
        for ruler in rulers {
            let converter = Self::new(&ruler.rules)?;
            compiled.extend(converter.rules);
        }
        Ok(Self { rules: compiled })
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Apply every rule in order to a copy of `payload`
    pub fn apply(&self, payload: &Payload) -> RuleOutcome {
        let mut payload = payload.clone();
        let errors = self.apply_in_place(&mut payload);
        RuleOutcome { payload, errors }
    }

    /// Apply every rule in order, mutating `payload`, and return diagnostics
    pub fn apply_in_place(&self, payload: &mut Payload) -> Vec<RuleError> {
        let mut errors = Vec::new();
        for rule in &self.rules {
            if let Err(e) = apply_rule(rule, payload) {
                debug!(error = %e, "Rule failed, continuing with unmodified field");
                errors.push(e);
            }
        }
        errors
    }
}

/// Compile and apply `rules` to `payload` in one step
pub fn apply(rules: &[Rule], payload: &Payload) -> Result<RuleOutcome, RuleError> {
    Ok(Converter::new(rules)?.apply(payload))
}

fn build_regex(
    rule: &'static str,
    index: usize,
    pattern: &str,
    icase: bool,
) -> Result<Regex, RuleError> {
    RegexBuilder::new(pattern)
        .case_insensitive(icase)
        .build()
        .map_err(|e| RuleError::InvalidConfig {
            rule,
            index,
            message: e.to_string(),
        })
}

/// The pattern to compile; registry references must be resolved first
fn pattern_of<'a>(
    rule: &'static str,
    index: usize,
    regexp: &'a str,
    regex_id: &Option<String>,
) -> Result<&'a str, RuleError> {
    let message = match regex_id {
        Some(id) => format!("regex '{id}' was not resolved"),
        None if regexp.is_empty() => "regexp is required".to_string(),
        None => return Ok(regexp),
    };
    Err(RuleError::InvalidConfig {
        rule,
        index,
        message,
    })
}

fn compile_rule(index: usize, rule: &Rule) -> Result<CompiledRule, RuleError> {
    let name = rule.type_name();
    if rule.fieldname().is_empty() {
        return Err(RuleError::InvalidConfig {
            rule: name,
            index,
            message: "fieldname cannot be empty".to_string(),
        });
    }

    Ok(match rule {
        Rule::Extract {
            fieldname,
            regexp,
            regex_id,
            icase,
        } => CompiledRule::Extract {
            fieldname: fieldname.clone(),
            regex: build_regex(name, index, pattern_of(name, index, regexp, regex_id)?, *icase)?,
        },
        Rule::Sub {
            fieldname,
            regexp,
            regex_id,
            repl,
            count,
            icase,
        } => {
            if *count == Some(0) {
                return Err(RuleError::InvalidConfig {
                    rule: name,
                    index,
                    message: "count must be at least 1".to_string(),
                });
            }
            CompiledRule::Sub {
                fieldname: fieldname.clone(),
                regex: build_regex(name, index, pattern_of(name, index, regexp, regex_id)?, *icase)?,
                repl: translate_replacement(repl),
                count: *count,
            }
        }
        Rule::Set { fieldname, value } => CompiledRule::Set {
            fieldname: fieldname.clone(),
            value: value.clone(),
        },
        Rule::Unset { fieldname } => CompiledRule::Unset {
            fieldname: fieldname.clone(),
        },
        Rule::Lookup {
            fieldname,
            table,
            lookup_id,
            icase,
        } => {
            if let Some(id) = lookup_id {
                return Err(RuleError::InvalidConfig {
                    rule: name,
                    index,
                    message: format!("lookup '{id}' was not resolved"),
                });
            }
            CompiledRule::Lookup {
                fieldname: fieldname.clone(),
                table: table
                    .iter()
                    .map(|(k, v)| {
                        let key = if *icase { k.to_lowercase() } else { k.clone() };
                        (key, v.clone())
                    })
                    .collect(),
                icase: *icase,
            }
        }
        Rule::Lower { fieldname } => CompiledRule::Lower {
            fieldname: fieldname.clone(),
        },
        Rule::Upper { fieldname } => CompiledRule::Upper {
            fieldname: fieldname.clone(),
        },
    })
}

fn string_field<'a>(
    payload: &'a Payload,
    rule: &'static str,
    fieldname: &str,
) -> Result<&'a str, RuleError> {
    match payload.get(fieldname) {
        None => Err(RuleError::MissingField {
            rule,
            fieldname: fieldname.to_string(),
        }),
        Some(Value::String(s)) => Ok(s),
        Some(_) => Err(RuleError::NotAString {
            rule,
            fieldname: fieldname.to_string(),
        }),
    }
}

fn apply_rule(rule: &CompiledRule, payload: &mut Payload) -> Result<(), RuleError> {
    match rule {
        CompiledRule::Extract { fieldname, regex } => {
            let text = string_field(payload, "extract", fieldname)?;
            let captures = regex.captures(text).ok_or_else(|| RuleError::NoMatch {
                fieldname: fieldname.clone(),
                pattern: regex.as_str().to_string(),
            })?;

            let captured = captures
                .name(fieldname)
                .or_else(|| captures.get(1))
                .or_else(|| captures.get(0))
                .map(|m| m.as_str().to_string())
                .unwrap_or_default();

            let named: Vec<(String, String)> = regex
                .capture_names()
                .flatten()
                .filter(|name| *name != fieldname.as_str())
                .filter_map(|name| {
                    captures
                        .name(name)
                        .map(|m| (name.to_string(), m.as_str().to_string()))
                })
                .collect();

            payload.insert(fieldname.clone(), Value::String(captured));
            for (name, value) in named {
                payload.insert(name, Value::String(value));
            }
            Ok(())
        }
        CompiledRule::Sub {
            fieldname,
            regex,
            repl,
            count,
        } => {
            let text = match payload.get(fieldname) {
                None => {
                    debug!(fieldname = %fieldname, "sub: unknown field, ignoring");
                    return Ok(());
                }
                Some(_) => string_field(payload, "sub", fieldname)?,
            };
            let replaced = match count {
                Some(limit) => regex.replacen(text, *limit, repl.as_str()),
                None => regex.replace_all(text, repl.as_str()),
            }
            .into_owned();
            payload.insert(fieldname.clone(), Value::String(replaced));
            Ok(())
        }
        CompiledRule::Set { fieldname, value } => {
            payload.insert(fieldname.clone(), value.clone());
            Ok(())
        }
        CompiledRule::Unset { fieldname } => {
            if payload.shift_remove(fieldname).is_none() {
                debug!(fieldname = %fieldname, "unset: unknown field, ignoring");
            }
            Ok(())
        }
        CompiledRule::Lookup {
            fieldname,
            table,
            icase,
        } => {
            let key = match payload.get(fieldname) {
                None => {
                    return Err(RuleError::MissingField {
                        rule: "lookup",
                        fieldname: fieldname.clone(),
                    })
                }
                Some(Value::String(s)) => s.clone(),
                Some(Value::Number(n)) => n.to_string(),
                Some(Value::Bool(b)) => b.to_string(),
                Some(_) => {
                    return Err(RuleError::NotAString {
                        rule: "lookup",
                        fieldname: fieldname.clone(),
                    })
                }
            };
            let key = if *icase { key.to_lowercase() } else { key };
            match table.get(&key) {
                Some(resolved) => {
                    payload.insert(fieldname.clone(), resolved.clone());
                }
                None => debug!(fieldname = %fieldname, value = %key, "lookup: no entry"),
            }
            Ok(())
        }
        CompiledRule::Lower { fieldname } => {
            let lowered = string_field(payload, "lower", fieldname)?.to_lowercase();
            payload.insert(fieldname.clone(), Value::String(lowered));
            Ok(())
        }
        CompiledRule::Upper { fieldname } => {
            let uppered = string_field(payload, "upper", fieldname)?.to_uppercase();
            payload.insert(fieldname.clone(), Value::String(uppered));
            Ok(())
        }
    }
}

/// Translate `\1` and `\g<name>` group references into `${1}` / `${name}`;
/// a literal `$` becomes `$$`
fn translate_replacement(repl: &str) -> String {
    let mut out = String::with_capacity(repl.len());
    let mut chars = repl.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '$' {
            out.push_str("$$");
            continue;
        }
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.peek().copied() {
            Some(d) if d.is_ascii_digit() => {
                let mut group = String::new();
                while let Some(d) = chars.peek().copied().filter(char::is_ascii_digit) {
                    group.push(d);
                    chars.next();
                }
                out.push_str(&format!("${{{group}}}"));
            }
            Some('g') => {
                chars.next();
                if chars.peek() == Some(&'<') {
                    chars.next();
                    let name: String = chars.by_ref().take_while(|c| *c != '>').collect();
                    out.push_str(&format!("${{{name}}}"));
                } else {
                    out.push_str("\\g");
                }
            }
            Some('\\') => {
                chars.next();
                out.push('\\');
            }
            _ => out.push('\\'),
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn payload(value: Value) -> Payload {
        value.as_object().cloned().unwrap()
    }

    fn rules(value: Value) -> Vec<Rule> {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_rules_parse_from_config() {
        let parsed = rules(json!([
            {"type": "extract", "fieldname": "a", "regexp": "(\\d+)"},
            {"type": "sub", "fieldname": "a", "pattern": "x", "repl": "y", "count": 2},
            {"type": "set", "fieldname": "b", "value": "v"},
            {"type": "unset", "fieldname": "c"},
            {"type": "lookup", "fieldname": "d", "table": {"fr": "France"}, "icase": true},
            {"type": "lower", "fieldname": "e"},
            {"type": "upper", "fieldname": "f"},
        ]));
        let names: Vec<&str> = parsed.iter().map(Rule::type_name).collect();
        assert_eq!(
            names,
            vec!["extract", "sub", "set", "unset", "lookup", "lower", "upper"]
        );
    }

    #[test]
    fn test_unknown_rule_type_rejected() {
        let result: Result<Vec<Rule>, _> =
            serde_json::from_value(json!([{"type": "condition-block", "conditions": []}]));
        assert!(result.is_err());
    }

    #[test]
    fn test_extract_overwrites_field_in_place() {
        let outcome = apply(
            &rules(json!([{"type": "extract", "fieldname": "msg", "regexp": "id=(\\d+)"}])),
            &payload(json!({"msg": "order id=1234 shipped"})),
        )
        .unwrap();
        assert!(outcome.is_ok());
        assert_eq!(outcome.payload["msg"], "1234");
    }

    #[test]
    fn test_extract_named_groups() {
        let outcome = apply(
            &rules(json!([{
                "type": "extract",
                "fieldname": "line",
                "regexp": "(?P<user>\\w+)@(?P<host>\\w+)"
            }])),
            &payload(json!({"line": "mail alice@wonderland now"})),
        )
        .unwrap();
        assert!(outcome.is_ok());
        assert_eq!(outcome.payload["user"], "alice");
        assert_eq!(outcome.payload["host"], "wonderland");
        assert_eq!(outcome.payload["line"], "alice");
    }

    #[test]
    fn test_extract_group_named_after_field() {
        let outcome = apply(
            &rules(json!([{
                "type": "extract",
                "fieldname": "code",
                "regexp": "(?P<prefix>[A-Z]+)-(?P<code>\\d+)"
            }])),
            &payload(json!({"code": "ERR-42"})),
        )
        .unwrap();
        assert_eq!(outcome.payload["code"], "42");
        assert_eq!(outcome.payload["prefix"], "ERR");
    }

    #[test]
    fn test_extract_failure_is_not_fatal() {
        let outcome = apply(
            &rules(json!([
                {"type": "extract", "fieldname": "msg", "regexp": "\\d+"},
                {"type": "extract", "fieldname": "absent", "regexp": "x"},
                {"type": "upper", "fieldname": "msg"},
            ])),
            &payload(json!({"msg": "no digits"})),
        )
        .unwrap();
        assert_eq!(outcome.errors.len(), 2);
        assert!(matches!(outcome.errors[0], RuleError::NoMatch { .. }));
        assert!(matches!(outcome.errors[1], RuleError::MissingField { .. }));
        assert_eq!(outcome.payload["msg"], "NO DIGITS");
    }

    #[test]
    fn test_sub_with_count() {
        let converter = Converter::new(&rules(json!([
            {"type": "sub", "fieldname": "s", "regexp": "a", "repl": "b", "count": 2}
        ])))
        .unwrap();
        let outcome = converter.apply(&payload(json!({"s": "aaaa"})));
        assert_eq!(outcome.payload["s"], "bbaa");
    }

    #[test]
    fn test_sub_unbounded_and_backrefs() {
        let outcome = apply(
            &rules(json!([
                {"type": "sub", "fieldname": "s", "regexp": "(\\w+)@(\\w+)", "repl": "\\2 at \\1"},
                {"type": "sub", "fieldname": "t", "regexp": "(?P<n>\\d)", "repl": "<\\g<n>>"},
            ])),
            &payload(json!({"s": "a@b c@d", "t": "12"})),
        )
        .unwrap();
        assert_eq!(outcome.payload["s"], "b at a d at c");
        assert_eq!(outcome.payload["t"], "<1><2>");
    }

    #[test]
    fn test_sub_keeps_literal_dollar() {
        let outcome = apply(
            &rules(json!([
                {"type": "sub", "fieldname": "price", "regexp": "USD", "repl": "$1"},
                {"type": "sub", "fieldname": "label", "regexp": "price", "repl": "cost $5"},
            ])),
            &payload(json!({"price": "USD", "label": "price"})),
        )
        .unwrap();
        assert_eq!(outcome.payload["price"], "$1");
        assert_eq!(outcome.payload["label"], "cost $5");
    }

    #[test]
    fn test_sub_missing_field_is_noop() {
        let outcome = apply(
            &rules(json!([{"type": "sub", "fieldname": "s", "regexp": "a", "repl": "b"}])),
            &payload(json!({"other": 1})),
        )
        .unwrap();
        assert!(outcome.is_ok());
        assert_eq!(outcome.payload, payload(json!({"other": 1})));
    }

    #[test]
    fn test_set_and_unset() {
        let outcome = apply(
            &rules(json!([
                {"type": "set", "fieldname": "new", "value": "x"},
                {"type": "set", "fieldname": "old", "value": 3},
                {"type": "unset", "fieldname": "gone"},
                {"type": "unset", "fieldname": "never-there"},
            ])),
            &payload(json!({"old": 1, "gone": true})),
        )
        .unwrap();
        assert!(outcome.is_ok());
        assert_eq!(outcome.payload, payload(json!({"old": 3, "new": "x"})));
    }

    #[test]
    fn test_lookup() {
        let converter = Converter::new(&rules(json!([
            {"type": "lookup", "fieldname": "country", "table": {"FR": "France", "DE": "Germany"}, "icase": true}
        ])))
        .unwrap();
        assert_eq!(
            converter.apply(&payload(json!({"country": "fr"}))).payload["country"],
            "France"
        );
        let miss = converter.apply(&payload(json!({"country": "it"})));
        assert!(miss.is_ok());
        assert_eq!(miss.payload["country"], "it");
        let absent = converter.apply(&payload(json!({})));
        assert!(matches!(absent.errors[0], RuleError::MissingField { rule: "lookup", .. }));
    }

    #[test]
    fn test_lookup_case_sensitive_by_default() {
        let outcome = apply(
            &rules(json!([{"type": "lookup", "fieldname": "k", "table": {"A": 1}}])),
            &payload(json!({"k": "a"})),
        )
        .unwrap();
        assert_eq!(outcome.payload["k"], "a");
    }

    #[test]
    fn test_case_rules_require_string_field() {
        let outcome = apply(
            &rules(json!([
                {"type": "lower", "fieldname": "missing"},
                {"type": "upper", "fieldname": "num"},
            ])),
            &payload(json!({"num": 5})),
        )
        .unwrap();
        assert!(matches!(outcome.errors[0], RuleError::MissingField { rule: "lower", .. }));
        assert!(matches!(outcome.errors[1], RuleError::NotAString { rule: "upper", .. }));
    }

    #[test]
    fn test_invalid_configuration() {
        let bad_regex = Converter::new(&rules(json!([
            {"type": "extract", "fieldname": "a", "regexp": "("}
        ])));
        assert!(matches!(
            bad_regex,
            Err(RuleError::InvalidConfig { rule: "extract", index: 0, .. })
        ));

        let zero_count = Converter::new(&rules(json!([
            {"type": "set", "fieldname": "a", "value": 1},
            {"type": "sub", "fieldname": "a", "regexp": "x", "repl": "y", "count": 0}
        ])));
        assert!(matches!(
            zero_count,
            Err(RuleError::InvalidConfig { rule: "sub", index: 1, .. })
        ));

        let empty_field = Converter::new(&rules(json!([{"type": "upper", "fieldname": ""}])));
        assert!(empty_field.is_err());
    }

    #[test]
    fn test_rulers_are_concatenated_in_order() {
        let rulers: Vec<RulerConfig> = serde_json::from_value(json!([
            {"type": "first", "rules": [{"type": "set", "fieldname": "a", "value": "x"}]},
            {"name": "second", "rules": [{"type": "upper", "fieldname": "a"}]},
        ]))
        .unwrap();
        assert_eq!(rulers[0].name, "first");
        let converter = Converter::from_rulers(&rulers).unwrap();
        assert_eq!(converter.len(), 2);
        assert_eq!(converter.apply(&Payload::new()).payload["a"], "X");
    }

    #[test]
    fn test_unset_preserves_key_order() {
        let outcome = apply(
            &rules(json!([{"type": "unset", "fieldname": "b"}])),
            &payload(json!({"a": 1, "b": 2, "c": 3})),
        )
        .unwrap();
        let keys: Vec<&String> = outcome.payload.keys().collect();
        assert_eq!(keys, vec!["a", "c"]);
    }

    #[test]
    fn test_translate_replacement() {
        assert_eq!(translate_replacement("\\1-\\2"), "${1}-${2}");
        assert_eq!(translate_replacement("\\g<name>!"), "${name}!");
        assert_eq!(translate_replacement("$1 plain"), "$$1 plain");
        assert_eq!(translate_replacement("cost $5"), "cost $$5");
        assert_eq!(translate_replacement("a\\\\b"), "a\\b");
    }

    proptest! {
        #[test]
        fn upper_is_idempotent(value in ".*") {
            let upper = rules(json!([{"type": "upper", "fieldname": "k"}]));
            let twice = rules(json!([
                {"type": "upper", "fieldname": "k"},
                {"type": "upper", "fieldname": "k"},
            ]));
            let input = payload(json!({"k": value}));
            prop_assert_eq!(
                apply(&upper, &input).unwrap().payload,
                apply(&twice, &input).unwrap().payload
            );
        }

        #[test]
        fn converter_is_deterministic(value in "[a-zA-Z0-9 ]{0,32}") {
            let converter = Converter::new(&rules(json!([
                {"type": "sub", "fieldname": "k", "regexp": "[0-9]", "repl": "#"},
                {"type": "lower", "fieldname": "k"},
            ]))).unwrap();
            let input = payload(json!({"k": value}));
            prop_assert_eq!(converter.apply(&input), converter.apply(&input));
        }
    }
}
