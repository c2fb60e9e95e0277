//! JSON Pointer (RFC 6901) paths used by patch operations

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A parsed pointer; `""` is the whole document.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Pointer {
    tokens: Vec<String>,
}

impl Pointer {
    pub fn parse(s: &str) -> Result<Self, String> {
        if s.is_empty() {
            return Ok(Self { tokens: Vec::new() });
        }
        let Some(rest) = s.strip_prefix('/') else {
            return Err(format!("pointer '{s}' must start with '/'"));
        };

        let tokens = rest
            .split('/')
            .map(|raw| unescape(raw).ok_or_else(|| format!("invalid escape in pointer '{s}'")))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { tokens })
    }

    /// Pointer to a top-level field
    pub fn field(name: &str) -> Self {
        Self {
            tokens: vec![name.to_string()],
        }
    }

    pub fn tokens(&self) -> &[String] {
        &self.tokens
    }

    pub fn is_root(&self) -> bool {
        self.tokens.is_empty()
    }

    /// First reference token, i.e. the entity field the pointer lives under
    pub fn root_field(&self) -> Option<&str> {
        self.tokens.first().map(String::as_str)
    }

    pub fn last(&self) -> Option<&str> {
        self.tokens.last().map(String::as_str)
    }

    /// Same parent, different final token
    pub fn with_last(&self, token: impl Into<String>) -> Self {
        let mut tokens = self.tokens.clone();
        tokens.pop();
        tokens.push(token.into());
        Self { tokens }
    }

    /// True when `self` is a strict ancestor of `other`
    pub fn is_proper_prefix_of(&self, other: &Pointer) -> bool {
        self.tokens.len() < other.tokens.len() && other.tokens.starts_with(&self.tokens)
    }
}

fn unescape(raw: &str) -> Option<String> {
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars();
    while let Some(c) = chars.next() {
        if c == '~' {
            match chars.next() {
                Some('0') => out.push('~'),
                Some('1') => out.push('/'),
                _ => return None,
            }
        } else {
            out.push(c);
        }
    }
    Some(out)
}

impl fmt::Display for Pointer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for token in &self.tokens {
            write!(f, "/{}", token.replace('~', "~0").replace('/', "~1"))?;
        }
        Ok(())
    }
}

impl FromStr for Pointer {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Pointer {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<Pointer> for String {
    fn from(value: Pointer) -> Self {
        value.to_string()
    }
}

/// Parse an array index token; RFC 6901 forbids leading zeros.
pub(crate) fn parse_index(token: &str) -> Option<usize> {
    if token.is_empty() || (token.len() > 1 && token.starts_with('0')) {
        return None;
    }
    if !token.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    token.parse().ok()
}
