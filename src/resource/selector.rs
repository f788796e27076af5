//! Qualified resource names
//!
//! A resource is addressed as `name` or `source/name`. Without a source the
//! caller decides what the missing part means: creation uses the primary
//! source, lookups search every source.

use crate::error::{Error, Result};
use std::fmt;
use std::str::FromStr;

/// Separator between the source and the resource name
pub const SEPARATOR: char = '/';

/// Check a name against the identifier syntax
///
/// Allowed: ASCII alphanumerics, `-`, `_` and `.`, not starting with `-` or `.`.
pub fn is_valid_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphanumeric() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

/// A parsed `source/name` selector
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResourceIdentifier {
    pub source: Option<String>,
    pub name: String,
}

impl ResourceIdentifier {
    /// Parse a selector, validating both components
    pub fn parse(input: &str) -> Result<Self> {
        let (source, name) = match input.split_once(SEPARATOR) {
            Some((source, name)) => (Some(source), name),
            None => (None, input),
        };

        if !is_valid_name(name) {
            return Err(Error::InvalidResourceName(input.to_string()));
        }

        if let Some(source) = source
            && !is_valid_name(source)
        {
            return Err(Error::InvalidResourceName(input.to_string()));
        }

        Ok(Self {
            source: source.map(String::from),
            name: name.to_string(),
        })
    }

    /// Identifier pinned to a known source
    pub fn qualified(source: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            source: Some(source.into()),
            name: name.into(),
        }
    }

    /// The source, or `primary` when none was given
    pub fn source_or<'a>(&'a self, primary: &'a str) -> &'a str {
        self.source.as_deref().unwrap_or(primary)
    }

    /// Whether this selector addresses the given resource
    pub fn matches(&self, source: &str, name: &str) -> bool {
        self.name == name && self.source.as_deref().is_none_or(|s| s == source)
    }
}

impl FromStr for ResourceIdentifier {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for ResourceIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.source {
            Some(source) => write!(f, "{}{}{}", source, SEPARATOR, self.name),
            None => write!(f, "{}", self.name),
        }
    }
}
