// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (c) 2025 The Rucket Authors

//! Built-in attribute registry.
//!
//! Well-known attribute names carry a value kind and, for clause values,
//! range rules. Anything not listed here (custom `sysprop.*` properties,
//! `metrics:*` keys) is an opaque tag: accepted as-is and compared
//! numerically only when both sides happen to be numbers.

use serde_json::Value;

use crate::error::{PolicyError, Result};
use crate::value::TagValue;

/// The declared type of a built-in attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    /// Whole number.
    Integer,
    /// Floating point number.
    Float,
    /// Number in 0..=100, optionally written with a trailing `%`.
    Percentage,
    /// Free-form or enumerated string.
    Text,
    /// One of `NRT`, `TLOG`, `PULL`.
    ReplicaType,
    /// `true` or `false`.
    Boolean,
}

/// A built-in attribute and its validation rules.
#[derive(Debug, Clone, Copy)]
pub struct Variable {
    /// Attribute name as written in policies.
    pub name: &'static str,
    /// Declared type.
    pub kind: ValueKind,
    /// Inclusive lower bound for clause values.
    pub min: Option<f64>,
    /// Inclusive upper bound for clause values.
    pub max: Option<f64>,
    /// Allowed clause values for enumerated text attributes.
    pub allowed: &'static [&'static str],
}

impl Variable {
    const fn new(name: &'static str, kind: ValueKind) -> Self {
        Self { name, kind, min: None, max: None, allowed: &[] }
    }

    const fn range(mut self, min: Option<f64>, max: Option<f64>) -> Self {
        self.min = min;
        self.max = max;
        self
    }

    const fn one_of(mut self, allowed: &'static [&'static str]) -> Self {
        self.allowed = allowed;
        self
    }
}

const REPLICA_TYPES: &[&str] = &["NRT", "TLOG", "PULL"];

static VARIABLES: &[Variable] = &[
    Variable::new("collection", ValueKind::Text),
    Variable::new("shard", ValueKind::Text),
    Variable::new("node", ValueKind::Text),
    Variable::new("host", ValueKind::Text),
    Variable::new("replica", ValueKind::Integer).range(Some(0.0), None),
    Variable::new("cores", ValueKind::Integer).range(Some(0.0), None),
    Variable::new("port", ValueKind::Integer).range(Some(1.0), Some(65535.0)),
    Variable::new("ip_1", ValueKind::Integer).range(Some(0.0), Some(255.0)),
    Variable::new("ip_2", ValueKind::Integer).range(Some(0.0), Some(255.0)),
    Variable::new("ip_3", ValueKind::Integer).range(Some(0.0), Some(255.0)),
    Variable::new("ip_4", ValueKind::Integer).range(Some(0.0), Some(255.0)),
    Variable::new("sysLoadAvg", ValueKind::Percentage).range(Some(0.0), Some(100.0)),
    Variable::new("heapUsage", ValueKind::Float).range(Some(0.0), None),
    Variable::new("freedisk", ValueKind::Float).range(Some(0.0), None),
    Variable::new("totaldisk", ValueKind::Float).range(Some(0.0), None),
    Variable::new("nodeRole", ValueKind::Text).one_of(&["overseer"]),
    Variable::new("type", ValueKind::ReplicaType).one_of(REPLICA_TYPES),
    Variable::new("strict", ValueKind::Boolean),
];

/// Looks up a built-in attribute by name.
#[must_use]
pub fn lookup(name: &str) -> Option<&'static Variable> {
    VARIABLES.iter().find(|v| v.name == name)
}

/// Returns true if `name` is a built-in attribute.
#[must_use]
pub fn is_builtin(name: &str) -> bool {
    lookup(name).is_some()
}

/// Validates and coerces `raw` for the attribute `name`.
///
/// Range and membership rules only apply when `is_rule_val` is set, i.e. when
/// the value comes from a clause. Observed node values are only coerced.
///
/// # Errors
///
/// Returns [`PolicyError::Validation`] when the value cannot be coerced to the
/// attribute's kind or falls outside its bounds.
pub fn validate(name: &str, raw: &Value, is_rule_val: bool) -> Result<TagValue> {
    let Some(var) = lookup(name) else {
        return TagValue::from_json(raw)
            .ok_or_else(|| PolicyError::validation(name, format!("{raw} is not a scalar value")));
    };

    match var.kind {
        ValueKind::Integer => {
            let n = parse_number(name, raw)?;
            if n.fract() != 0.0 {
                return Err(PolicyError::validation(
                    name,
                    format!("'{}' is not a valid number", display(raw)),
                ));
            }
            if is_rule_val {
                check_bounds(var, n)?;
            }
            Ok(TagValue::Int(n as i64))
        }
        ValueKind::Float => {
            let n = parse_number(name, raw)?;
            if is_rule_val {
                check_bounds(var, n)?;
            }
            Ok(TagValue::Float(n))
        }
        ValueKind::Percentage => {
            let n = match raw {
                Value::String(s) => {
                    let trimmed = s.trim().trim_end_matches('%');
                    parse_number(name, &Value::String(trimmed.to_string()))?
                }
                other => parse_number(name, other)?,
            };
            if is_rule_val {
                check_bounds(var, n)?;
            }
            Ok(TagValue::Float(n))
        }
        ValueKind::Text => {
            let value = TagValue::from_json(raw).ok_or_else(|| {
                PolicyError::validation(name, format!("{raw} is not a scalar value"))
            })?;
            if is_rule_val && !var.allowed.is_empty() {
                check_allowed(var, &value.to_string())?;
            }
            Ok(value)
        }
        ValueKind::ReplicaType => {
            let text = display(raw).to_ascii_uppercase();
            check_allowed(var, &text)?;
            Ok(TagValue::Str(text))
        }
        ValueKind::Boolean => match raw {
            Value::Bool(b) => Ok(TagValue::Str(b.to_string())),
            Value::String(s) if s == "true" || s == "false" => Ok(TagValue::Str(s.clone())),
            other => Err(PolicyError::validation(
                name,
                format!("'{}' must be one of [true, false]", display(other)),
            )),
        },
    }
}

fn parse_number(name: &str, raw: &Value) -> Result<f64> {
    let parsed = match raw {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok().filter(|f| f.is_finite()),
        _ => None,
    };
    parsed.ok_or_else(|| {
        PolicyError::validation(name, format!("'{}' is not a valid number", display(raw)))
    })
}

fn check_bounds(var: &Variable, n: f64) -> Result<()> {
    if let Some(min) = var.min {
        if n < min {
            return Err(PolicyError::validation(
                var.name,
                format!("{n} must be greater than or equal to {min}"),
            ));
        }
    }
    if let Some(max) = var.max {
        if n > max {
            return Err(PolicyError::validation(
                var.name,
                format!("{n} must be less than or equal to {max}"),
            ));
        }
    }
    Ok(())
}

fn check_allowed(var: &Variable, value: &str) -> Result<()> {
    if var.allowed.contains(&value) {
        Ok(())
    } else {
        Err(PolicyError::validation(
            var.name,
            format!("'{value}' must be one of {:?}", var.allowed),
        ))
    }
}

fn display(raw: &Value) -> String {
    match raw {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
