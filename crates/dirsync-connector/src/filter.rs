//! Search filters.
//!
//! A small RFC 4515 model: parsing from the string form, rendering back to
//! it, and evaluating a filter against an entry's local attributes.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use thiserror::Error;

use crate::entry::Attributes;

/// Search filter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Filter {
    /// All sub-filters must match. An empty list is absolute true.
    And { filters: Vec<Filter> },
    /// At least one sub-filter must match. An empty list is absolute false.
    Or { filters: Vec<Filter> },
    /// Negation.
    Not { filter: Box<Filter> },
    /// Attribute equals value (case-insensitive).
    Equals { attribute: String, value: String },
    /// Attribute matches a substring pattern.
    Substring {
        attribute: String,
        initial: Option<String>,
        any: Vec<String>,
        final_value: Option<String>,
    },
    /// Attribute is greater than or equal to value.
    GreaterOrEqual { attribute: String, value: String },
    /// Attribute is less than or equal to value.
    LessOrEqual { attribute: String, value: String },
    /// Attribute is present.
    Present { attribute: String },
}

impl Filter {
    /// Create an equals filter.
    pub fn eq(attribute: impl Into<String>, value: impl Into<String>) -> Self {
        Filter::Equals {
            attribute: attribute.into(),
            value: value.into(),
        }
    }

    /// Create a presence filter.
    pub fn present(attribute: impl Into<String>) -> Self {
        Filter::Present {
            attribute: attribute.into(),
        }
    }

    /// Create a greater-or-equal filter.
    pub fn ge(attribute: impl Into<String>, value: impl Into<String>) -> Self {
        Filter::GreaterOrEqual {
            attribute: attribute.into(),
            value: value.into(),
        }
    }

    /// Create a less-or-equal filter.
    pub fn le(attribute: impl Into<String>, value: impl Into<String>) -> Self {
        Filter::LessOrEqual {
            attribute: attribute.into(),
            value: value.into(),
        }
    }

    /// Create an AND filter.
    #[must_use]
    pub fn and(filters: Vec<Filter>) -> Self {
        Filter::And { filters }
    }

    /// Create an OR filter.
    #[must_use]
    pub fn or(filters: Vec<Filter>) -> Self {
        Filter::Or { filters }
    }

    /// Create a NOT filter.
    #[must_use]
    pub fn negate(filter: Filter) -> Self {
        Filter::Not {
            filter: Box::new(filter),
        }
    }

    /// Combine with another filter using AND, flattening nested ANDs.
    #[must_use]
    pub fn and_with(self, other: Filter) -> Self {
        match self {
            Filter::And { mut filters } => {
                filters.push(other);
                Filter::And { filters }
            }
            f => Filter::And {
                filters: vec![f, other],
            },
        }
    }

    /// Parse the RFC 4515 string form. The outer parentheses are optional.
    pub fn parse(input: &str) -> Result<Self, FilterParseError> {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Err(FilterParseError::new(0, "empty filter"));
        }
        let owned;
        let text = if trimmed.starts_with('(') {
            trimmed
        } else {
            owned = format!("({trimmed})");
            owned.as_str()
        };

        let mut parser = Parser {
            input: text.as_bytes(),
            pos: 0,
        };
        let filter = parser.filter()?;
        if parser.pos != parser.input.len() {
            return Err(FilterParseError::new(parser.pos, "trailing characters"));
        }
        Ok(filter)
    }

    /// Evaluate against local attributes.
    ///
    /// Returns `None` when the result depends on an attribute the entry does
    /// not carry.
    #[must_use]
    pub fn evaluate(&self, attrs: &Attributes) -> Option<bool> {
        match self {
            Filter::And { filters } => {
                let mut indeterminate = false;
                for f in filters {
                    match f.evaluate(attrs) {
                        Some(false) => return Some(false),
                        None => indeterminate = true,
                        Some(true) => {}
                    }
                }
                if indeterminate {
                    None
                } else {
                    Some(true)
                }
            }
            Filter::Or { filters } => {
                let mut indeterminate = false;
                for f in filters {
                    match f.evaluate(attrs) {
                        Some(true) => return Some(true),
                        None => indeterminate = true,
                        Some(false) => {}
                    }
                }
                if indeterminate {
                    None
                } else {
                    Some(false)
                }
            }
            Filter::Not { filter } => filter.evaluate(attrs).map(|r| !r),
            Filter::Present { attribute } => attrs.has(attribute).then_some(true),
            Filter::Equals { attribute, value } => {
                let values = attrs.get(attribute)?.values();
                Some(values.iter().any(|v| v.eq_ignore_ascii_case(value)))
            }
            Filter::Substring {
                attribute,
                initial,
                any,
                final_value,
            } => {
                let values = attrs.get(attribute)?.values();
                Some(values.iter().any(|v| {
                    substring_matches(v, initial.as_deref(), any, final_value.as_deref())
                }))
            }
            Filter::GreaterOrEqual { attribute, value } => {
                let values = attrs.get(attribute)?.values();
                Some(
                    values
                        .iter()
                        .any(|v| compare_values(v, value) != std::cmp::Ordering::Less),
                )
            }
            Filter::LessOrEqual { attribute, value } => {
                let values = attrs.get(attribute)?.values();
                Some(
                    values
                        .iter()
                        .any(|v| compare_values(v, value) != std::cmp::Ordering::Greater),
                )
            }
        }
    }

    /// Names of all attributes the filter references (lowercased).
    #[must_use]
    pub fn attributes(&self) -> BTreeSet<String> {
        let mut names = BTreeSet::new();
        self.collect_attributes(&mut names);
        names
    }

    fn collect_attributes(&self, names: &mut BTreeSet<String>) {
        match self {
            Filter::And { filters } | Filter::Or { filters } => {
                for f in filters {
                    f.collect_attributes(names);
                }
            }
            Filter::Not { filter } => filter.collect_attributes(names),
            Filter::Equals { attribute, .. }
            | Filter::Substring { attribute, .. }
            | Filter::GreaterOrEqual { attribute, .. }
            | Filter::LessOrEqual { attribute, .. }
            | Filter::Present { attribute } => {
                names.insert(attribute.to_lowercase());
            }
        }
    }

    /// Render the RFC 4515 string form with values escaped.
    #[must_use]
    pub fn to_ldap_string(&self) -> String {
        match self {
            Filter::And { filters } => {
                let inner: String = filters.iter().map(Filter::to_ldap_string).collect();
                format!("(&{inner})")
            }
            Filter::Or { filters } => {
                let inner: String = filters.iter().map(Filter::to_ldap_string).collect();
                format!("(|{inner})")
            }
            Filter::Not { filter } => format!("(!{})", filter.to_ldap_string()),
            Filter::Equals { attribute, value } => {
                format!("({}={})", attribute, escape_filter_value(value))
            }
            Filter::Substring {
                attribute,
                initial,
                any,
                final_value,
            } => {
                let mut pattern = String::new();
                if let Some(initial) = initial {
                    pattern.push_str(&escape_filter_value(initial));
                }
                pattern.push('*');
                for part in any {
                    pattern.push_str(&escape_filter_value(part));
                    pattern.push('*');
                }
                if let Some(final_value) = final_value {
                    pattern.push_str(&escape_filter_value(final_value));
                }
                format!("({attribute}={pattern})")
            }
            Filter::GreaterOrEqual { attribute, value } => {
                format!("({}>={})", attribute, escape_filter_value(value))
            }
            Filter::LessOrEqual { attribute, value } => {
                format!("({}<={})", attribute, escape_filter_value(value))
            }
            Filter::Present { attribute } => format!("({attribute}=*)"),
        }
    }
}

impl fmt::Display for Filter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_ldap_string())
    }
}

impl std::str::FromStr for Filter {
    type Err = FilterParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Filter::parse(s)
    }
}

/// Escape a value for use inside a filter (RFC 4515 section 3).
#[must_use]
pub fn escape_filter_value(value: &str) -> String {
    let mut result = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '\\' => result.push_str("\\5c"),
            '*' => result.push_str("\\2a"),
            '(' => result.push_str("\\28"),
            ')' => result.push_str("\\29"),
            '\0' => result.push_str("\\00"),
            _ => result.push(c),
        }
    }
    result
}

/// Error raised for a malformed filter string.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid filter at offset {position}: {message}")]
pub struct FilterParseError {
    /// Byte offset of the problem.
    pub position: usize,
    /// What went wrong.
    pub message: String,
}

impl FilterParseError {
    fn new(position: usize, message: impl Into<String>) -> Self {
        Self {
            position,
            message: message.into(),
        }
    }
}

struct Parser<'a> {
    input: &'a [u8],
    pos: usize,
}

impl Parser<'_> {
    fn peek(&self) -> Option<u8> {
        self.input.get(self.pos).copied()
    }

    fn expect(&mut self, byte: u8) -> Result<(), FilterParseError> {
        if self.peek() == Some(byte) {
            self.pos += 1;
            Ok(())
        } else {
            Err(FilterParseError::new(
                self.pos,
                format!("expected '{}'", byte as char),
            ))
        }
    }

    fn filter(&mut self) -> Result<Filter, FilterParseError> {
        self.expect(b'(')?;
        let filter = match self.peek() {
            Some(b'&') => {
                self.pos += 1;
                Filter::And {
                    filters: self.filter_list()?,
                }
            }
            Some(b'|') => {
                self.pos += 1;
                Filter::Or {
                    filters: self.filter_list()?,
                }
            }
            Some(b'!') => {
                self.pos += 1;
                Filter::negate(self.filter()?)
            }
            Some(_) => self.item()?,
            None => return Err(FilterParseError::new(self.pos, "unexpected end")),
        };
        self.expect(b')')?;
        Ok(filter)
    }

    fn filter_list(&mut self) -> Result<Vec<Filter>, FilterParseError> {
        let mut filters = Vec::new();
        while self.peek() == Some(b'(') {
            filters.push(self.filter()?);
        }
        Ok(filters)
    }

    fn item(&mut self) -> Result<Filter, FilterParseError> {
        let start = self.pos;
        while let Some(b) = self.peek() {
            if matches!(b, b'=' | b'>' | b'<' | b'~' | b'(' | b')') {
                break;
            }
            self.pos += 1;
        }
        let attribute = std::str::from_utf8(&self.input[start..self.pos])
            .map_err(|_| FilterParseError::new(start, "attribute is not UTF-8"))?
            .trim()
            .to_string();
        if attribute.is_empty() {
            return Err(FilterParseError::new(start, "missing attribute name"));
        }

        let op = match self.peek() {
            Some(b'=') => {
                self.pos += 1;
                b'='
            }
            Some(b @ (b'>' | b'<')) => {
                self.pos += 1;
                self.expect(b'=')?;
                b
            }
            Some(b'~') => {
                return Err(FilterParseError::new(
                    self.pos,
                    "approximate match is not supported",
                ))
            }
            _ => return Err(FilterParseError::new(self.pos, "expected operator")),
        };

        let value_start = self.pos;
        while let Some(b) = self.peek() {
            if b == b')' {
                break;
            }
            if b == b'(' {
                return Err(FilterParseError::new(self.pos, "unescaped '(' in value"));
            }
            self.pos += 1;
        }
        let raw = &self.input[value_start..self.pos];

        match op {
            b'>' => Ok(Filter::GreaterOrEqual {
                attribute,
                value: unescape(raw, value_start)?,
            }),
            b'<' => Ok(Filter::LessOrEqual {
                attribute,
                value: unescape(raw, value_start)?,
            }),
            _ if raw == b"*" => Ok(Filter::Present { attribute }),
            _ if raw.contains(&b'*') => {
                let parts: Vec<&[u8]> = raw.split(|b| *b == b'*').collect();
                let last = parts.len() - 1;
                let mut initial = None;
                let mut any = Vec::new();
                let mut final_value = None;
                for (i, part) in parts.iter().enumerate() {
                    if part.is_empty() {
                        continue;
                    }
                    let text = unescape(part, value_start)?;
                    if i == 0 {
                        initial = Some(text);
                    } else if i == last {
                        final_value = Some(text);
                    } else {
                        any.push(text);
                    }
                }
                Ok(Filter::Substring {
                    attribute,
                    initial,
                    any,
                    final_value,
                })
            }
            _ => Ok(Filter::Equals {
                attribute,
                value: unescape(raw, value_start)?,
            }),
        }
    }
}

fn unescape(raw: &[u8], offset: usize) -> Result<String, FilterParseError> {
    let mut bytes = Vec::with_capacity(raw.len());
    let mut i = 0;
    while i < raw.len() {
        if raw[i] == b'\\' {
            let hex = raw
                .get(i + 1..i + 3)
                .and_then(|h| std::str::from_utf8(h).ok())
                .and_then(|h| u8::from_str_radix(h, 16).ok())
                .ok_or_else(|| FilterParseError::new(offset + i, "bad escape sequence"))?;
            bytes.push(hex);
            i += 3;
        } else {
            bytes.push(raw[i]);
            i += 1;
        }
    }
    String::from_utf8(bytes).map_err(|_| FilterParseError::new(offset, "value is not UTF-8"))
}

fn substring_matches(
    value: &str,
    initial: Option<&str>,
    any: &[String],
    final_value: Option<&str>,
) -> bool {
    let value = value.to_lowercase();
    let mut rest = value.as_str();

    if let Some(initial) = initial {
        let initial = initial.to_lowercase();
        match rest.strip_prefix(initial.as_str()) {
            Some(r) => rest = r,
            None => return false,
        }
    }
    for part in any {
        let part = part.to_lowercase();
        match rest.find(part.as_str()) {
            Some(idx) => rest = &rest[idx + part.len()..],
            None => return false,
        }
    }
    match final_value {
        Some(final_value) => rest.ends_with(final_value.to_lowercase().as_str()),
        None => true,
    }
}

fn compare_values(left: &str, right: &str) -> std::cmp::Ordering {
    match (left.parse::<i64>(), right.parse::<i64>()) {
        (Ok(l), Ok(r)) => l.cmp(&r),
        _ => left.to_lowercase().cmp(&right.to_lowercase()),
    }
}
