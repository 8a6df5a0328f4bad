//! Address templates.
//!
//! A template is literal text with `{placeholder}` segments. A placeholder
//! names an entry attribute (case-insensitive, first value) or `domain`,
//! optionally followed by pipe modifiers: `{givenname|initial|normalize}`.

use std::fmt;

use thiserror::Error;

use dirsync_connector::entry::Attributes;

/// Placeholder bound to the namespace being rendered for.
pub const DOMAIN_PLACEHOLDER: &str = "domain";

/// Error raised for a malformed template.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message} in template '{template}'")]
pub struct TemplateError {
    pub template: String,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Modifier {
    Lower,
    Upper,
    Initial,
    Normalize,
}

impl Modifier {
    fn parse(name: &str) -> Option<Self> {
        match name.trim() {
            "lower" => Some(Modifier::Lower),
            "upper" => Some(Modifier::Upper),
            "initial" => Some(Modifier::Initial),
            "normalize" => Some(Modifier::Normalize),
            _ => None,
        }
    }

    fn apply(self, value: &str) -> String {
        match self {
            Modifier::Lower => value.to_lowercase(),
            Modifier::Upper => value.to_uppercase(),
            Modifier::Initial => value.chars().next().map(String::from).unwrap_or_default(),
            Modifier::Normalize => normalize(value),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Placeholder { name: String, modifiers: Vec<Modifier> },
}

/// A parsed address template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressTemplate {
    source: String,
    segments: Vec<Segment>,
}

impl AddressTemplate {
    /// Parse a template string.
    pub fn parse(source: &str) -> Result<Self, TemplateError> {
        let error = |message: &str| TemplateError {
            template: source.to_string(),
            message: message.to_string(),
        };

        if source.trim().is_empty() {
            return Err(error("empty template"));
        }

        let mut segments = Vec::new();
        let mut rest = source;
        while !rest.is_empty() {
            match rest.find('{') {
                Some(open) => {
                    if open > 0 {
                        segments.push(Segment::Literal(rest[..open].to_string()));
                    }
                    let after = &rest[open + 1..];
                    let close = after.find('}').ok_or_else(|| error("unclosed '{'"))?;
                    let body = &after[..close];
                    if body.contains('{') {
                        return Err(error("nested '{'"));
                    }

                    let mut parts = body.split('|');
                    let name = parts.next().unwrap_or_default().trim().to_lowercase();
                    if name.is_empty() {
                        return Err(error("empty placeholder"));
                    }
                    let modifiers = parts
                        .map(|m| Modifier::parse(m).ok_or_else(|| error("unknown modifier")))
                        .collect::<Result<Vec<_>, _>>()?;
                    segments.push(Segment::Placeholder { name, modifiers });
                    rest = &after[close + 1..];
                }
                None => {
                    if rest.contains('}') {
                        return Err(error("unmatched '}'"));
                    }
                    segments.push(Segment::Literal(rest.to_string()));
                    rest = "";
                }
            }
        }

        Ok(Self {
            source: source.to_string(),
            segments,
        })
    }

    /// Attribute names the template reads, excluding `domain`.
    #[must_use]
    pub fn attributes(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self
            .segments
            .iter()
            .filter_map(|s| match s {
                Segment::Placeholder { name, .. } if name != DOMAIN_PLACEHOLDER => {
                    Some(name.as_str())
                }
                _ => None,
            })
            .collect();
        names.sort_unstable();
        names.dedup();
        names
    }

    /// Whether the template reads `attribute`.
    #[must_use]
    pub fn uses(&self, attribute: &str) -> bool {
        self.attributes()
            .iter()
            .any(|name| name.eq_ignore_ascii_case(attribute))
    }

    /// Render for `domain`. Returns `None` when a referenced attribute is
    /// missing or the result is not a usable `local@domain` address.
    #[must_use]
    pub fn render(&self, attributes: &Attributes, domain: &str) -> Option<String> {
        let mut out = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => out.push_str(text),
                Segment::Placeholder { name, modifiers } => {
                    let mut value = if name == DOMAIN_PLACEHOLDER {
                        domain.to_string()
                    } else {
                        attributes.get_str(name)?.to_string()
                    };
                    for modifier in modifiers {
                        value = modifier.apply(&value);
                    }
                    if value.is_empty() {
                        return None;
                    }
                    out.push_str(&value);
                }
            }
        }

        let address = out.trim().to_lowercase();
        let (local, host) = address.rsplit_once('@')?;
        if local.is_empty() || host.is_empty() || local.contains('@') {
            return None;
        }
        Some(address)
    }
}

impl fmt::Display for AddressTemplate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

/// Lowercase, transliterate common Latin diacritics and drop anything
/// outside `[a-z0-9._-]`.
#[must_use]
pub fn normalize(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.to_lowercase().chars() {
        let mapped = match c {
            'à' | 'á' | 'â' | 'ã' | 'å' | 'ā' | 'ą' => "a",
            'ä' | 'æ' => "ae",
            'ç' | 'ć' | 'č' => "c",
            'ď' | 'đ' => "d",
            'è' | 'é' | 'ê' | 'ë' | 'ē' | 'ę' | 'ě' => "e",
            'ì' | 'í' | 'î' | 'ï' | 'ī' => "i",
            'ł' => "l",
            'ñ' | 'ń' | 'ň' => "n",
            'ò' | 'ó' | 'ô' | 'õ' | 'ø' | 'ō' => "o",
            'ö' | 'œ' => "oe",
            'ř' => "r",
            'ś' | 'š' => "s",
            'ß' => "ss",
            'ť' => "t",
            'ù' | 'ú' | 'û' | 'ů' | 'ū' => "u",
            'ü' => "ue",
            'ý' | 'ÿ' => "y",
            'ź' | 'ż' | 'ž' => "z",
            c if c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '.' | '_' | '-') => {
                out.push(c);
                continue;
            }
            _ => continue,
        };
        out.push_str(mapped);
    }
    out
}
