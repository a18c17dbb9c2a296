// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (c) 2025 The Rucket Authors

//! Condition operands.
//!
//! A condition string is parsed once: a leading `!`, `<` or `>` selects the
//! operand and `#ANY` is the wildcard. Everything else is an exact match.

use std::fmt;

use serde_json::Value;

use crate::error::{PolicyError, Result};
use crate::value::TagValue;
use crate::variable;

/// Wildcard marker: matches any present value.
pub const ANY: &str = "#ANY";

/// Shard marker: evaluate a clause for each shard independently.
pub const EACH: &str = "#EACH";

/// Comparison semantics of a condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operand {
    /// Exact match.
    Equal,
    /// Negated exact match (`!value`).
    NotEqual,
    /// Numeric less-than (`<value`).
    LessThan,
    /// Numeric greater-than (`>value`).
    GreaterThan,
    /// Matches any present value (`#ANY`).
    Wildcard,
}

impl Operand {
    /// Ordering weight: lower values are more specific.
    #[must_use]
    pub fn priority(self) -> u32 {
        match self {
            Self::Equal => 0,
            Self::GreaterThan => 1,
            Self::LessThan | Self::NotEqual => 2,
            Self::Wildcard => 3,
        }
    }

    /// Prefix used when rendering a condition.
    #[must_use]
    pub fn symbol(self) -> &'static str {
        match self {
            Self::Equal | Self::Wildcard => "",
            Self::NotEqual => "!",
            Self::LessThan => "<",
            Self::GreaterThan => ">",
        }
    }
}

/// A parsed `name: condition` pair.
#[derive(Debug, Clone, PartialEq)]
pub struct Condition {
    name: String,
    operand: Operand,
    value: Option<TagValue>,
}

impl Condition {
    /// Parses the condition for attribute `name` from its raw document value.
    ///
    /// # Errors
    ///
    /// Returns a validation error if the value is not a scalar, if a `<`/`>`
    /// bound is not numeric, or if a built-in attribute rejects the value.
    pub fn parse(name: &str, raw: &Value) -> Result<Self> {
        let (operand, value) = match raw {
            Value::String(s) => {
                let s = s.trim();
                if s == ANY {
                    return Ok(Self::wildcard(name));
                }
                match s.chars().next() {
                    Some('!') => (Operand::NotEqual, Value::String(s[1..].to_string())),
                    Some('<') => (Operand::LessThan, Value::String(s[1..].to_string())),
                    Some('>') => (Operand::GreaterThan, Value::String(s[1..].to_string())),
                    _ => (Operand::Equal, raw.clone()),
                }
            }
            Value::Number(_) | Value::Bool(_) => (Operand::Equal, raw.clone()),
            other => {
                return Err(PolicyError::validation(
                    name,
                    format!("{other} is not a valid condition"),
                ))
            }
        };

        let value = variable::validate(name, &value, true)?;
        if matches!(operand, Operand::LessThan | Operand::GreaterThan) && value.as_f64().is_none()
        {
            return Err(PolicyError::validation(
                name,
                format!("'{value}' is not a valid number"),
            ));
        }
        Ok(Self { name: name.to_string(), operand, value: Some(value) })
    }

    /// Creates a wildcard condition on `name`.
    #[must_use]
    pub fn wildcard(name: &str) -> Self {
        Self { name: name.to_string(), operand: Operand::Wildcard, value: None }
    }

    /// Creates a condition from already validated parts.
    #[must_use]
    pub fn new(name: &str, operand: Operand, value: TagValue) -> Self {
        Self { name: name.to_string(), operand, value: Some(value) }
    }

    /// Attribute name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Operand.
    #[must_use]
    pub fn operand(&self) -> Operand {
        self.operand
    }

    /// Target value; `None` for wildcards.
    #[must_use]
    pub fn value(&self) -> Option<&TagValue> {
        self.value.as_ref()
    }

    /// Numeric target value, if any.
    #[must_use]
    pub fn bound(&self) -> Option<f64> {
        self.value.as_ref().and_then(TagValue::as_f64)
    }

    /// Evaluates the condition against an observed value.
    ///
    /// A missing value only passes a negated condition.
    #[must_use]
    pub fn is_pass(&self, observed: Option<&TagValue>) -> bool {
        let (Some(observed), Some(target)) = (observed, self.value.as_ref()) else {
            return match self.operand {
                Operand::Wildcard => observed.is_some(),
                Operand::NotEqual => true,
                _ => false,
            };
        };
        match self.operand {
            Operand::Wildcard => true,
            Operand::Equal => observed.matches(target),
            Operand::NotEqual => !observed.matches(target),
            Operand::LessThan => numeric(observed, target).is_some_and(|(a, b)| a < b),
            Operand::GreaterThan => numeric(observed, target).is_some_and(|(a, b)| a > b),
        }
    }

    /// Evaluates the condition against a count.
    #[must_use]
    pub fn is_pass_count(&self, count: f64) -> bool {
        self.is_pass(Some(&TagValue::Float(count)))
    }

    /// Signed distance between `actual` and the nearest passing value.
    ///
    /// Positive means too many (or too high), negative means too few.
    #[must_use]
    pub fn delta(&self, actual: f64) -> f64 {
        let Some(bound) = self.bound() else {
            return 0.0;
        };
        match self.operand {
            Operand::Equal => actual - bound,
            Operand::LessThan => actual - (bound - 1.0),
            Operand::GreaterThan => actual - (bound + 1.0),
            Operand::NotEqual if actual == bound => 1.0,
            Operand::NotEqual | Operand::Wildcard => 0.0,
        }
    }

    /// Largest count this condition allows, if it is bounded above.
    #[must_use]
    pub fn max_allowed(&self) -> Option<f64> {
        match self.operand {
            Operand::Equal => self.bound(),
            Operand::LessThan => self.bound().map(|b| b - 1.0),
            _ => None,
        }
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.value {
            Some(value) => write!(f, "{}:{}{}", self.name, self.operand.symbol(), value),
            None => write!(f, "{}:{ANY}", self.name),
        }
    }
}

fn numeric(a: &TagValue, b: &TagValue) -> Option<(f64, f64)> {
    Some((a.as_f64()?, b.as_f64()?))
}
