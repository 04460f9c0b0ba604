//! Series selectors: `name{label="value",other!="value"}`

use std::fmt;
use std::str::FromStr;

use serde::Serialize;

use super::sample::Labels;
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum MatchOp {
    Equal,
    NotEqual,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LabelMatcher {
    pub name: String,
    pub op: MatchOp,
    pub value: String,
}

impl LabelMatcher {
    /// A missing label matches as the empty string
    pub fn matches(&self, labels: &Labels) -> bool {
        let actual = labels.get(&self.name).map(String::as_str).unwrap_or("");
        match self.op {
            MatchOp::Equal => actual == self.value,
            MatchOp::NotEqual => actual != self.value,
        }
    }
}

/// Metric name and/or label matchers
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Selector {
    pub metric: Option<String>,
    pub matchers: Vec<LabelMatcher>,
}

impl Selector {
    pub fn metric(name: impl Into<String>) -> Self {
        Self {
            metric: Some(name.into()),
            matchers: Vec::new(),
        }
    }

    pub fn with(mut self, name: impl Into<String>, op: MatchOp, value: impl Into<String>) -> Self {
        self.matchers.push(LabelMatcher {
            name: name.into(),
            op,
            value: value.into(),
        });
        self
    }

    pub fn matches(&self, metric: &str, labels: &Labels) -> bool {
        if let Some(name) = &self.metric {
            if name != metric {
                return false;
            }
        }
        self.matchers.iter().all(|m| m.matches(labels))
    }

    pub fn parse(input: &str) -> Result<Self> {
        let input = input.trim();
        let invalid = |reason: &str| Error::InvalidSelector(format!("{}: {}", reason, input));

        let (name, body) = match input.find('{') {
            Some(open) => {
                let body = input[open + 1..]
                    .strip_suffix('}')
                    .ok_or_else(|| invalid("missing closing brace"))?;
                (input[..open].trim(), Some(body))
            }
            None => (input, None),
        };

        if !name.is_empty() && !is_metric_name(name) {
            return Err(invalid("invalid metric name"));
        }

        let mut selector = Selector {
            metric: (!name.is_empty()).then(|| name.to_string()),
            matchers: Vec::new(),
        };

        if let Some(body) = body {
            let mut rest = body.trim_start();
            while !rest.is_empty() {
                let name_end = rest
                    .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
                    .unwrap_or(rest.len());
                let label = &rest[..name_end];
                if label.is_empty() {
                    return Err(invalid("expected label name"));
                }
                rest = rest[name_end..].trim_start();

                let op = if let Some(after) = rest.strip_prefix("!=") {
                    rest = after;
                    MatchOp::NotEqual
                } else if let Some(after) = rest.strip_prefix('=') {
                    rest = after;
                    MatchOp::Equal
                } else {
                    return Err(invalid("expected = or !="));
                };

                let (value, after) = read_quoted(rest.trim_start())
                    .ok_or_else(|| invalid("expected quoted label value"))?;
                selector.matchers.push(LabelMatcher {
                    name: label.to_string(),
                    op,
                    value,
                });

                rest = after.trim_start();
                if let Some(after) = rest.strip_prefix(',') {
                    rest = after.trim_start();
                } else if !rest.is_empty() {
                    return Err(invalid("expected , between matchers"));
                }
            }
        }

        if selector.metric.is_none() && selector.matchers.is_empty() {
            return Err(invalid("empty selector"));
        }
        Ok(selector)
    }
}

impl FromStr for Selector {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Selector::parse(s)
    }
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(metric) = &self.metric {
            f.write_str(metric)?;
        }
        if !self.matchers.is_empty() {
            f.write_str("{")?;
            for (i, m) in self.matchers.iter().enumerate() {
                if i > 0 {
                    f.write_str(",")?;
                }
                let op = match m.op {
                    MatchOp::Equal => "=",
                    MatchOp::NotEqual => "!=",
                };
                write!(f, "{}{}{:?}", m.name, op, m.value)?;
            }
            f.write_str("}")?;
        }
        Ok(())
    }
}

pub(crate) fn is_metric_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' || c == ':' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == ':')
}

/// Read a double-quoted string with `\\`, `\"` and `\n` escapes. Returns the
/// unescaped value and the remaining input after the closing quote.
pub(crate) fn read_quoted(input: &str) -> Option<(String, &str)> {
    let body = input.strip_prefix('"')?;
    let mut value = String::new();
    let mut chars = body.char_indices();
    while let Some((i, c)) = chars.next() {
        match c {
            '"' => return Some((value, &body[i + 1..])),
            '\\' => match chars.next()? {
                (_, 'n') => value.push('\n'),
                (_, other) => value.push(other),
            },
            other => value.push(other),
        }
    }
    None
}
