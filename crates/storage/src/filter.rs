//! Key/document filters for query payloads.
//!
//! A filter string of the form `/pattern/flags` (flags a subset of
//! `i`, `m`, `s`) selects by regex; anything else matches literally.
//! A string that looks like a pattern but fails to compile also falls
//! back to a literal match on the raw string.

use regex::Regex;

/// How a query filters document ids or key/value keys.
#[derive(Debug, Clone)]
pub enum KeyFilter {
    /// Empty filter: match everything.
    Any,
    /// Exact string match.
    Literal(String),
    /// Compiled `/pattern/flags` form.
    Pattern(Regex),
}

impl KeyFilter {
    pub fn parse(raw: &str) -> Self {
        if raw.is_empty() {
            return Self::Any;
        }
        Self::parse_pattern(raw).unwrap_or_else(|| Self::Literal(raw.to_string()))
    }

    /// Accept `/pattern/flags` with flags drawn from `{i, m, s}`.
    fn parse_pattern(raw: &str) -> Option<Self> {
        let rest = raw.strip_prefix('/')?;
        let last_slash = rest.rfind('/')?;
        let (pattern, flags) = rest.split_at(last_slash);
        let flags = &flags[1..];
        if !flags.chars().all(|c| matches!(c, 'i' | 'm' | 's')) {
            return None;
        }

        let full = if flags.is_empty() {
            pattern.to_string()
        } else {
            format!("(?{flags}){pattern}")
        };
        Regex::new(&full).ok().map(Self::Pattern)
    }

    pub fn matches(&self, key: &str) -> bool {
        match self {
            Self::Any => true,
            Self::Literal(literal) => literal == key,
            Self::Pattern(regex) => regex.is_match(key),
        }
    }

    pub fn is_any(&self) -> bool {
        matches!(self, Self::Any)
    }

    /// The literal key, when this filter is an exact match.
    pub fn as_literal(&self) -> Option<&str> {
        match self {
            Self::Literal(literal) => Some(literal),
            _ => None,
        }
    }
}
