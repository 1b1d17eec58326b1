//! Validation rules attached to template inputs.
//!
//! The same rule drives two checks: a Rust-side check when a deployment is
//! validated, and a validation predicate the compiler emits into the
//! variable declaration so the provisioning tool enforces it too.

use std::net::Ipv4Addr;

use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::value::ConfigValue;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "rule", rename_all = "snake_case")]
pub enum InputRule {
    /// Value must be an address or subnet inside `range` (e.g. `10.0.0.0/16`).
    Cidr { range: String },
    /// Numeric bounds, inclusive.
    Range {
        #[serde(default)]
        min: Option<f64>,
        #[serde(default)]
        max: Option<f64>,
    },
    /// Value must match the regular expression.
    Pattern { regex: String },
    /// Numeric value bounded by the project's remaining quota for `metric`.
    Quota { metric: String },
}

#[derive(Debug, Error, PartialEq)]
pub enum RuleError {
    #[error("invalid CIDR range: {0}")]
    InvalidCidr(String),

    #[error("invalid pattern: {0}")]
    InvalidPattern(String),

    #[error("{0}")]
    Violation(String),
}

impl InputRule {
    /// Check a value against this rule.
    ///
    /// `Quota` rules always pass here: the value counts as requested usage
    /// of the metric and is checked against the project quota when the
    /// deployment is admitted.
    pub fn check(&self, input: &str, value: &ConfigValue) -> Result<(), RuleError> {
        match self {
            InputRule::Cidr { range } => {
                let candidate = expect_str(input, value)?;
                if cidr_contains(range, candidate)? {
                    Ok(())
                } else {
                    Err(RuleError::Violation(format!(
                        "{input}: {candidate} is not within {range}"
                    )))
                }
            }
            InputRule::Range { min, max } => {
                let n = expect_number(input, value)?;
                if min.is_some_and(|m| n < m) || max.is_some_and(|m| n > m) {
                    return Err(RuleError::Violation(format!(
                        "{input}: {n} is outside [{}, {}]",
                        min.map(|m| m.to_string()).unwrap_or_else(|| "-inf".to_string()),
                        max.map(|m| m.to_string()).unwrap_or_else(|| "inf".to_string()),
                    )));
                }
                Ok(())
            }
            InputRule::Pattern { regex } => {
                let candidate = expect_str(input, value)?;
                let re = Regex::new(regex).map_err(|e| RuleError::InvalidPattern(e.to_string()))?;
                if re.is_match(candidate) {
                    Ok(())
                } else {
                    Err(RuleError::Violation(format!(
                        "{input}: {candidate:?} does not match {regex}"
                    )))
                }
            }
            InputRule::Quota { .. } => Ok(()),
        }
    }

    /// Regex the provisioning tool should enforce for string rules.
    pub fn regex(&self) -> Result<Option<String>, RuleError> {
        match self {
            InputRule::Cidr { range } => cidr_regex(range).map(Some),
            InputRule::Pattern { regex } => Ok(Some(regex.clone())),
            InputRule::Range { .. } | InputRule::Quota { .. } => Ok(None),
        }
    }
}

fn expect_str<'a>(input: &str, value: &'a ConfigValue) -> Result<&'a str, RuleError> {
    value
        .as_str()
        .ok_or_else(|| RuleError::Violation(format!("{input}: expected a string")))
}

fn expect_number(input: &str, value: &ConfigValue) -> Result<f64, RuleError> {
    value
        .as_f64()
        .ok_or_else(|| RuleError::Violation(format!("{input}: expected a number")))
}

/// Parse `a.b.c.d/n`. A bare address is treated as `/32`.
pub fn parse_cidr(s: &str) -> Result<(Ipv4Addr, u8), RuleError> {
    let (addr, prefix) = s.split_once('/').unwrap_or((s, "32"));
    let addr: Ipv4Addr = addr
        .trim()
        .parse()
        .map_err(|_| RuleError::InvalidCidr(s.to_string()))?;
    let prefix: u8 = prefix
        .trim()
        .parse()
        .map_err(|_| RuleError::InvalidCidr(s.to_string()))?;
    if prefix > 32 {
        return Err(RuleError::InvalidCidr(s.to_string()));
    }
    Ok((addr, prefix))
}

fn mask(prefix: u8) -> u32 {
    if prefix == 0 { 0 } else { u32::MAX << (32 - prefix) }
}

/// Whether `candidate` (address or subnet) lies entirely within `range`.
pub fn cidr_contains(range: &str, candidate: &str) -> Result<bool, RuleError> {
    let (net, prefix) = parse_cidr(range)?;
    let Ok((addr, sub_prefix)) = parse_cidr(candidate) else {
        return Ok(false);
    };
    if sub_prefix < prefix {
        return Ok(false);
    }
    let m = mask(prefix);
    Ok(u32::from(addr) & m == u32::from(net) & m)
}

/// Derive a regex matching addresses (optionally with a prefix length) in
/// `range`. Octets fully covered by the prefix are pinned; the rest match
/// any octet, so the regex is a superset check for non-octet prefixes.
pub fn cidr_regex(range: &str) -> Result<String, RuleError> {
    const OCTET: &str = r"(25[0-5]|2[0-4][0-9]|1[0-9]{2}|[1-9]?[0-9])";
    let (net, prefix) = parse_cidr(range)?;
    let fixed = usize::from(prefix / 8);
    let octets = net.octets();
    let parts: Vec<String> = (0..4)
        .map(|i| {
            if i < fixed {
                octets[i].to_string()
            } else {
                OCTET.to_string()
            }
        })
        .collect();
    Ok(format!(r"^{}(/([0-9]|[12][0-9]|3[0-2]))?$", parts.join(r"\.")))
}
