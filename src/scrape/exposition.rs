//! Text exposition parsing
//!
//! Line format: `name{label="value",...} value [timestamp_ms]`. Comment
//! (`#`) and blank lines are skipped. The first malformed line fails the
//! whole payload.

use chrono::{DateTime, TimeZone, Utc};

use crate::error::{Error, Result};
use crate::store::{is_metric_name, read_quoted, Labels};

/// One parsed exposition line
#[derive(Debug, Clone, PartialEq)]
pub struct ExposedSample {
    pub name: String,
    pub labels: Labels,
    pub value: f64,
    /// Explicit timestamp carried by the payload
    pub timestamp: Option<DateTime<Utc>>,
}

pub fn parse(payload: &str) -> Result<Vec<ExposedSample>> {
    payload
        .lines()
        .enumerate()
        .filter(|(_, line)| {
            let line = line.trim();
            !line.is_empty() && !line.starts_with('#')
        })
        .map(|(i, line)| parse_line(line.trim(), i + 1))
        .collect()
}

fn parse_line(line: &str, line_no: usize) -> Result<ExposedSample> {
    let err = |reason: String| Error::ExpositionParse {
        line: line_no,
        reason,
    };

    let name_end = line
        .find(|c: char| c == '{' || c.is_whitespace())
        .ok_or_else(|| err("missing value".to_string()))?;
    let name = &line[..name_end];
    if !is_metric_name(name) {
        return Err(err(format!("invalid metric name {:?}", name)));
    }

    let mut rest = &line[name_end..];
    let mut labels = Labels::new();
    if let Some(body) = rest.strip_prefix('{') {
        rest = parse_labels(body, &mut labels).map_err(err)?;
    }

    let mut fields = rest.split_whitespace();
    let value = fields
        .next()
        .ok_or_else(|| err("missing value".to_string()))
        .and_then(|v| parse_value(v).ok_or_else(|| err(format!("invalid value {:?}", v))))?;

    let timestamp = match fields.next() {
        Some(ts) => {
            let millis: i64 = ts
                .parse()
                .map_err(|_| err(format!("invalid timestamp {:?}", ts)))?;
            let ts = Utc
                .timestamp_millis_opt(millis)
                .single()
                .ok_or_else(|| err(format!("timestamp {} out of range", millis)))?;
            Some(ts)
        }
        None => None,
    };

    if let Some(extra) = fields.next() {
        return Err(err(format!("unexpected trailing token {:?}", extra)));
    }

    Ok(ExposedSample {
        name: name.to_string(),
        labels,
        value,
        timestamp,
    })
}

/// Parse label pairs after `{`; returns the input following `}`
fn parse_labels<'a>(body: &'a str, labels: &mut Labels) -> std::result::Result<&'a str, String> {
    let mut rest = body.trim_start();
    loop {
        if let Some(after) = rest.strip_prefix('}') {
            return Ok(after);
        }

        let name_end = rest
            .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
            .ok_or_else(|| "unterminated label set".to_string())?;
        let label = &rest[..name_end];
        if label.is_empty() || label.starts_with(|c: char| c.is_ascii_digit()) {
            return Err(format!("invalid label name {:?}", label));
        }

        rest = rest[name_end..]
            .trim_start()
            .strip_prefix('=')
            .ok_or_else(|| format!("expected = after label {}", label))?;
        let (value, after) = read_quoted(rest.trim_start())
            .ok_or_else(|| format!("unterminated value for label {}", label))?;

        if labels.insert(label.to_string(), value).is_some() {
            return Err(format!("duplicate label {}", label));
        }

        rest = after.trim_start();
        if let Some(after) = rest.strip_prefix(',') {
            rest = after.trim_start();
        } else if !rest.starts_with('}') {
            return Err("expected , or } in label set".to_string());
        }
    }
}

fn parse_value(token: &str) -> Option<f64> {
    match token {
        "NaN" => Some(f64::NAN),
        "+Inf" | "Inf" => Some(f64::INFINITY),
        "-Inf" => Some(f64::NEG_INFINITY),
        other => other.parse().ok(),
    }
}
