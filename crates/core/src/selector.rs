//! Label and field selectors in the Kubernetes string syntax.
//!
//! Supported terms: `k=v`, `k==v`, `k!=v`, `k in (a,b)`, `k notin (a,b)`,
//! `k` (exists) and `!k` (does not exist), comma separated.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

use regex::Regex;

use crate::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operator {
    Equals,
    NotEquals,
    In,
    NotIn,
    Exists,
    DoesNotExist,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Requirement {
    key: String,
    operator: Operator,
    values: Vec<String>,
}

fn key_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^([a-z0-9]([-a-z0-9]*[a-z0-9])?(\.[a-z0-9]([-a-z0-9]*[a-z0-9])?)*/)?[A-Za-z0-9]([-A-Za-z0-9_.]*[A-Za-z0-9])?$")
            .expect("static regex")
    })
}

fn value_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(([A-Za-z0-9][-A-Za-z0-9_.]*)?[A-Za-z0-9])?$").expect("static regex"))
}

fn set_term_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(\S+)\s+(in|notin)\s*\((.*)\)$").expect("static regex"))
}

fn validate_key(key: &str) -> Result<()> {
    let name = key.rsplit('/').next().unwrap_or(key);
    if name.len() > 63 || !key_re().is_match(key) {
        return Err(Error::Validation(format!("invalid label key {key:?}")));
    }
    Ok(())
}

fn validate_value(value: &str) -> Result<()> {
    if value.len() > 63 || !value_re().is_match(value) {
        return Err(Error::Validation(format!("invalid label value {value:?}")));
    }
    Ok(())
}

impl Requirement {
    pub fn new(key: impl Into<String>, operator: Operator, values: Vec<String>) -> Result<Self> {
        let key = key.into();
        validate_key(&key)?;
        match operator {
            Operator::Equals | Operator::NotEquals if values.len() != 1 => {
                return Err(Error::Validation(format!("{key}: exact-match operators take exactly one value")));
            }
            Operator::In | Operator::NotIn if values.is_empty() => {
                return Err(Error::Validation(format!("{key}: set operators take at least one value")));
            }
            Operator::Exists | Operator::DoesNotExist if !values.is_empty() => {
                return Err(Error::Validation(format!("{key}: existence operators take no values")));
            }
            _ => {}
        }
        for v in &values {
            validate_value(v)?;
        }
        let mut values = values;
        values.sort();
        values.dedup();
        Ok(Self { key, operator, values })
    }

    pub fn equals(key: impl Into<String>, value: impl Into<String>) -> Result<Self> {
        Self::new(key, Operator::Equals, vec![value.into()])
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn operator(&self) -> Operator {
        self.operator
    }

    pub fn values(&self) -> &[String] {
        &self.values
    }

    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        let got = labels.get(&self.key);
        match self.operator {
            Operator::Equals | Operator::In => got.map(|v| self.values.contains(v)).unwrap_or(false),
            Operator::NotEquals | Operator::NotIn => got.map(|v| !self.values.contains(v)).unwrap_or(true),
            Operator::Exists => got.is_some(),
            Operator::DoesNotExist => got.is_none(),
        }
    }
}

impl fmt::Display for Requirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.operator {
            Operator::Equals => write!(f, "{}={}", self.key, self.values[0]),
            Operator::NotEquals => write!(f, "{}!={}", self.key, self.values[0]),
            Operator::In => write!(f, "{} in ({})", self.key, self.values.join(",")),
            Operator::NotIn => write!(f, "{} notin ({})", self.key, self.values.join(",")),
            Operator::Exists => f.write_str(&self.key),
            Operator::DoesNotExist => write!(f, "!{}", self.key),
        }
    }
}

/// Conjunction of requirements, kept sorted by key so the string form is stable.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct Selector {
    requirements: Vec<Requirement>,
}

impl Selector {
    pub fn everything() -> Self {
        Self::default()
    }

    pub fn from_set(set: &BTreeMap<String, String>) -> Result<Self> {
        let mut sel = Self::default();
        for (k, v) in set {
            sel = sel.add(Requirement::equals(k.clone(), v.clone())?);
        }
        Ok(sel)
    }

    pub fn add(mut self, req: Requirement) -> Self {
        self.requirements.push(req);
        self.requirements.sort_by(|a, b| a.key.cmp(&b.key));
        self
    }

    pub fn extend(mut self, reqs: impl IntoIterator<Item = Requirement>) -> Self {
        for r in reqs {
            self = self.add(r);
        }
        self
    }

    pub fn requirements(&self) -> &[Requirement] {
        &self.requirements
    }

    pub fn is_empty(&self) -> bool {
        self.requirements.is_empty()
    }

    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        self.requirements.iter().all(|r| r.matches(labels))
    }

    pub fn parse(s: &str) -> Result<Self> {
        let mut sel = Self::default();
        for term in split_terms(s) {
            let term = term.trim();
            if term.is_empty() {
                continue;
            }
            sel = sel.add(parse_term(term)?);
        }
        Ok(sel)
    }
}

/// Split on commas that are not inside a `( ... )` value set.
fn split_terms(s: &str) -> Vec<&str> {
    let mut out = Vec::new();
    let mut depth = 0usize;
    let mut start = 0usize;
    for (i, c) in s.char_indices() {
        match c {
            '(' => depth += 1,
            ')' => depth = depth.saturating_sub(1),
            ',' if depth == 0 => {
                out.push(&s[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    out.push(&s[start..]);
    out
}

fn parse_term(term: &str) -> Result<Requirement> {
    if let Some(caps) = set_term_re().captures(term) {
        let op = if &caps[2] == "in" { Operator::In } else { Operator::NotIn };
        let values = caps[3].split(',').map(|v| v.trim().to_string()).filter(|v| !v.is_empty()).collect();
        return Requirement::new(&caps[1], op, values);
    }
    if let Some(key) = term.strip_prefix('!') {
        if !key.contains('=') {
            return Requirement::new(key.trim(), Operator::DoesNotExist, Vec::new());
        }
    }
    if let Some((k, v)) = term.split_once("!=") {
        return Requirement::new(k.trim(), Operator::NotEquals, vec![v.trim().to_string()]);
    }
    if let Some((k, v)) = term.split_once("==") {
        return Requirement::new(k.trim(), Operator::Equals, vec![v.trim().to_string()]);
    }
    if let Some((k, v)) = term.split_once('=') {
        return Requirement::new(k.trim(), Operator::Equals, vec![v.trim().to_string()]);
    }
    Requirement::new(term, Operator::Exists, Vec::new())
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.requirements.iter().map(ToString::to_string).collect();
        f.write_str(&parts.join(","))
    }
}

impl FromStr for Selector {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}
