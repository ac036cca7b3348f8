//! History query parameters

use super::HistoryError;
use crate::workflow::{InstanceState, WorkflowInstance};
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use std::cmp::Ordering;
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HistoryOrdering {
    TitleAsc,
    TitleDesc,
    StartAsc,
    StartDesc,
    EndAsc,
    #[default]
    EndDesc,
}

impl HistoryOrdering {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "title_asc" => Some(Self::TitleAsc),
            "title_desc" => Some(Self::TitleDesc),
            "start_asc" => Some(Self::StartAsc),
            "start_desc" => Some(Self::StartDesc),
            "end_asc" => Some(Self::EndAsc),
            "end_desc" => Some(Self::EndDesc),
            _ => None,
        }
    }

    pub fn is_descending(&self) -> bool {
        matches!(self, Self::TitleDesc | Self::StartDesc | Self::EndDesc)
    }

    /// SQL `ORDER BY` clause; a missing end sorts lowest
    pub fn order_by(&self) -> &'static str {
        match self {
            Self::TitleAsc => "title ASC, start_at ASC, id ASC",
            Self::TitleDesc => "title DESC, start_at DESC, id DESC",
            Self::StartAsc => "start_at ASC, id ASC",
            Self::StartDesc => "start_at DESC, id DESC",
            Self::EndAsc => "end_at ASC NULLS FIRST, start_at ASC, id ASC",
            Self::EndDesc => "end_at DESC NULLS LAST, start_at DESC, id DESC",
        }
    }

    pub fn compare(&self, a: &WorkflowInstance, b: &WorkflowInstance) -> Ordering {
        let primary = match self {
            Self::TitleAsc | Self::TitleDesc => a.title.cmp(&b.title),
            Self::StartAsc | Self::StartDesc => Ordering::Equal,
            // None < Some
            Self::EndAsc | Self::EndDesc => a.end.cmp(&b.end),
        };
        let ordering = primary
            .then_with(|| a.start.cmp(&b.start))
            .then_with(|| a.id.cmp(&b.id));
        if self.is_descending() {
            ordering.reverse()
        } else {
            ordering
        }
    }
}

/// Parsed `GET /v1/workflow/history` parameters
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HistoryQuery {
    pub ordering: HistoryOrdering,
    pub root_only: bool,
    pub full: bool,
    /// Lowercased title substring
    pub search: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub state: Option<InstanceState>,
    pub limit: Option<usize>,
    pub offset: usize,
}

fn invalid(message: String) -> HistoryError {
    HistoryError::InvalidQuery(message)
}

fn parse_flag(name: &str, value: &str) -> Result<bool, HistoryError> {
    match value {
        "0" => Ok(false),
        "1" => Ok(true),
        other => Err(invalid(format!("{name} must be 0 or 1, got '{other}'"))),
    }
}

fn parse_integer(name: &str, value: &str) -> Result<i64, HistoryError> {
    value
        .trim()
        .parse()
        .map_err(|_| invalid(format!("{name} must be an integer, got '{value}'")))
}

/// RFC 3339, or a naive date/datetime taken as UTC
fn parse_since(value: &str) -> Result<DateTime<Utc>, HistoryError> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Ok(dt.with_timezone(&Utc));
    }
    if let Ok(dt) = NaiveDateTime::parse_from_str(value, "%Y-%m-%dT%H:%M:%S%.f") {
        return Ok(dt.and_utc());
    }
    if let Some(dt) = NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
    {
        return Ok(dt.and_utc());
    }
    Err(invalid(format!("since must be an ISO-8601 timestamp, got '{value}'")))
}

impl HistoryQuery {
    /// Parse query-string parameters; unknown parameters are ignored
    pub fn from_params(params: &HashMap<String, String>) -> Result<Self, HistoryError> {
        let mut query = Self::default();

        if let Some(value) = params.get("ordering") {
            query.ordering = HistoryOrdering::parse(value)
                .ok_or_else(|| invalid(format!("unknown ordering '{value}'")))?;
        }
        if let Some(value) = params.get("root") {
            query.root_only = parse_flag("root", value)?;
        }
        if let Some(value) = params.get("full") {
            query.full = parse_flag("full", value)?;
        }
        if let Some(value) = params.get("search") {
            if !value.is_empty() {
                query.search = Some(value.to_lowercase());
            }
        }
        if let Some(value) = params.get("since") {
            query.since = Some(parse_since(value)?);
        }
        if let Some(value) = params.get("state") {
            query.state = Some(
                InstanceState::parse(value)
                    .ok_or_else(|| invalid(format!("unknown state '{value}'")))?,
            );
        }
        if let Some(value) = params.get("limit") {
            let limit = parse_integer("limit", value)?;
            if limit > 0 {
                query.limit = Some(limit as usize);
            }
        }
        if let Some(value) = params.get("offset") {
            let offset = parse_integer("offset", value)?;
            if offset < 0 {
                return Err(invalid(format!("offset cannot be negative, got {offset}")));
            }
            query.offset = offset as usize;
        }

        Ok(query)
    }

    pub fn matches(&self, instance: &WorkflowInstance) -> bool {
        if self.root_only && !instance.root {
            return false;
        }
        if let Some(state) = self.state {
            if instance.state != state {
                return false;
            }
        }
        if let Some(since) = self.since {
            if instance.start < since {
                return false;
            }
        }
        if let Some(search) = &self.search {
            if !instance.title.to_lowercase().contains(search.as_str()) {
                return false;
            }
        }
        true
    }

    /// Apply offset and limit to sorted matches
    pub fn page<T>(&self, items: Vec<T>) -> Vec<T> {
        let items = items.into_iter().skip(self.offset);
        match self.limit {
            Some(limit) => items.take(limit).collect(),
            None => items.collect(),
        }
    }
}
