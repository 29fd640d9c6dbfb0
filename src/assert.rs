//! Assertion predicates
//!
//! A `Rule` is checked against text three ways:
//! - regex: `Regex::is_match`
//! - partial JSON: the text is parsed and must contain the expected structure
//! - substring: `str::contains`
//!
//! Failures carry `operator` / `actual` / `expected` for diff reporting.

use std::fmt;
use std::path::Path;

use regex::Regex;
use serde_json::Value;

use crate::error::{ChainError, ErrorKind};

/// A rule to validate text against
#[derive(Debug, Clone)]
pub enum Rule {
    Regex(Regex),
    /// Partial structural match against parsed JSON
    Partial(Value),
    Contains(String),
}

impl Rule {
    /// Parse a rule from its textual form:
    /// `/re/` is a regex, text starting with `{` or `[` that parses as JSON
    /// is a partial match, anything else is a substring.
    pub fn parse(text: &str) -> Result<Rule, ChainError> {
        if text.len() >= 2 && text.starts_with('/') && text.ends_with('/') {
            return Rule::regex(&text[1..text.len() - 1]);
        }
        if text.starts_with('{') || text.starts_with('[') {
            if let Ok(value) = serde_json::from_str::<Value>(text) {
                return Ok(Rule::Partial(value));
            }
        }
        Ok(Rule::Contains(text.to_string()))
    }

    pub fn regex(pattern: &str) -> Result<Rule, ChainError> {
        compile_regex(pattern).map(Rule::Regex)
    }

    /// An empty substring or an empty JSON object checks nothing.
    pub fn is_empty(&self) -> bool {
        match self {
            Rule::Regex(re) => re.as_str().is_empty(),
            Rule::Partial(Value::Object(map)) => map.is_empty(),
            Rule::Partial(Value::Null) => true,
            Rule::Partial(_) => false,
            Rule::Contains(s) => s.is_empty(),
        }
    }

    /// Whether a message value satisfies this rule.
    pub fn matches_value(&self, value: &Value) -> bool {
        match self {
            Rule::Partial(expected) => is_match(value, expected),
            Rule::Regex(re) => re.is_match(&value_text(value)),
            Rule::Contains(s) => value_text(value).contains(s.as_str()),
        }
    }
}

impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Rule::Regex(re) => write!(f, "/{}/", re.as_str()),
            Rule::Partial(v) => write!(f, "{}", v),
            Rule::Contains(s) => write!(f, "{}", s),
        }
    }
}

impl From<&str> for Rule {
    fn from(s: &str) -> Self {
        Rule::Contains(s.to_string())
    }
}

impl From<String> for Rule {
    fn from(s: String) -> Self {
        Rule::Contains(s)
    }
}

impl From<Regex> for Rule {
    fn from(re: Regex) -> Self {
        Rule::Regex(re)
    }
}

impl From<Value> for Rule {
    fn from(v: Value) -> Self {
        match v {
            Value::String(s) => Rule::Contains(s),
            other => Rule::Partial(other),
        }
    }
}

/// Compile a user pattern, with a size limit against pathological input.
pub fn compile_regex(pattern: &str) -> Result<Regex, ChainError> {
    regex::RegexBuilder::new(pattern)
        .size_limit(1 << 20)
        .build()
        .map_err(|e| ChainError::parse(format!("invalid regex /{}/: {}", pattern, e)))
}

fn value_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Partial deep match: `actual` contains everything in `expected`.
///
/// Objects match when every expected key matches; arrays match when every
/// expected element matches some actual element; scalars compare equal,
/// numbers numerically.
pub fn is_match(actual: &Value, expected: &Value) -> bool {
    match (actual, expected) {
        (Value::Object(a), Value::Object(e)) => e
            .iter()
            .all(|(key, ev)| a.get(key).map_or(false, |av| is_match(av, ev))),
        (Value::Array(a), Value::Array(e)) => {
            a.len() >= e.len() && e.iter().all(|ev| a.iter().any(|av| is_match(av, ev)))
        }
        (Value::Number(a), Value::Number(e)) => a.as_f64() == e.as_f64(),
        (a, e) => a == e,
    }
}

fn parse_json(actual: &str) -> Result<Value, ChainError> {
    serde_json::from_str(actual)
        .map_err(|e| ChainError::parse(format!("expected JSON content: {}", e)))
}

/// Assert that `actual` matches `rule`.
pub fn match_rule(actual: &str, rule: &Rule) -> Result<(), ChainError> {
    match rule {
        Rule::Regex(re) => {
            if !re.is_match(actual) {
                return Err(ChainError::assertion(
                    format!(
                        "The input did not match the regular expression /{}/. Input: {:?}",
                        re.as_str(),
                        actual
                    ),
                    "match",
                    actual,
                    rule.to_string(),
                ));
            }
        }
        Rule::Partial(expected) => {
            let content = parse_json(actual)?;
            if !is_match(&content, expected) {
                return Err(ChainError::assertion(
                    format!("Expected {} to partial include {}", content, expected),
                    "should partial includes",
                    pretty(&content),
                    pretty(expected),
                ));
            }
        }
        Rule::Contains(expected) => {
            if !actual.contains(expected.as_str()) {
                return Err(ChainError::assertion(
                    format!("Expected {:?} to include {:?}", actual, expected),
                    "should includes",
                    actual,
                    expected.as_str(),
                ));
            }
        }
    }
    Ok(())
}

/// Assert that `actual` does not match `rule`.
pub fn does_not_match_rule(actual: &str, rule: &Rule) -> Result<(), ChainError> {
    match rule {
        Rule::Regex(re) => {
            if re.is_match(actual) {
                return Err(ChainError::assertion(
                    format!(
                        "The input was expected to not match the regular expression /{}/. Input: {:?}",
                        re.as_str(),
                        actual
                    ),
                    "doesNotMatch",
                    actual,
                    rule.to_string(),
                ));
            }
        }
        Rule::Partial(expected) => {
            let content = parse_json(actual)?;
            if is_match(&content, expected) {
                return Err(ChainError::assertion(
                    format!("Expected {} not to partial include {}", content, expected),
                    "should not partial includes",
                    pretty(&content),
                    pretty(expected),
                ));
            }
        }
        Rule::Contains(expected) => {
            if actual.contains(expected.as_str()) {
                return Err(ChainError::assertion(
                    format!("Expected {:?} not to include {:?}", actual, expected),
                    "should not includes",
                    actual,
                    expected.as_str(),
                ));
            }
        }
    }
    Ok(())
}

fn pretty(v: &Value) -> String {
    serde_json::to_string_pretty(v).unwrap_or_else(|_| v.to_string())
}

async fn exists(path: &Path) -> bool {
    tokio::fs::metadata(path).await.is_ok()
}

async fn read_text(path: &Path) -> Result<String, ChainError> {
    tokio::fs::read_to_string(path).await.map_err(|e| {
        ChainError::new(ErrorKind::Io, format!("failed to read {}: {}", path.display(), e))
    })
}

/// Assert that a file exists and, when a rule is given, that its content matches.
pub async fn match_file(path: &Path, rule: Option<&Rule>) -> Result<(), ChainError> {
    match_file_labeled(path, &path.display().to_string(), rule).await
}

/// Assert that a file does not exist or, when a rule is given, that it
/// exists and its content does not match.
pub async fn does_not_match_file(path: &Path, rule: Option<&Rule>) -> Result<(), ChainError> {
    does_not_match_file_labeled(path, &path.display().to_string(), rule).await
}

/// `match_file`, reporting the path as `label` (usually what the caller wrote).
pub(crate) async fn match_file_labeled(
    path: &Path,
    label: &str,
    rule: Option<&Rule>,
) -> Result<(), ChainError> {
    if !exists(path).await {
        return Err(ChainError::assertion(
            format!("Expected {} to be exists", label),
            "exists",
            "false",
            "true",
        ));
    }
    if let Some(rule) = rule {
        let content = read_text(path).await?;
        match_rule(&content, rule)
            .map_err(|e| e.prefixed(&format!("file({}) with content: ", label)))?;
    }
    Ok(())
}

pub(crate) async fn does_not_match_file_labeled(
    path: &Path,
    label: &str,
    rule: Option<&Rule>,
) -> Result<(), ChainError> {
    let present = exists(path).await;
    let Some(rule) = rule else {
        if present {
            return Err(ChainError::assertion(
                format!("Expected {} to not be exists", label),
                "notExists",
                "true",
                "false",
            ));
        }
        return Ok(());
    };
    if !present {
        return Err(ChainError::assertion(
            format!("Expected file({}) not to match `{}` but file not exists", label, rule),
            "exists",
            "false",
            "true",
        ));
    }
    let content = read_text(path).await?;
    does_not_match_rule(&content, rule)
        .map_err(|e| e.prefixed(&format!("file({}) with content: ", label)))
}
