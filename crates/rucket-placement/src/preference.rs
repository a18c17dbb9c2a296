// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (c) 2025 The Rucket Authors

//! Node ordering preferences.
//!
//! Preferences are applied in significance order. Values within `precision`
//! of each other are treated as equal so that small fluctuations (a few MB of
//! free disk, one extra core) do not reshuffle the node order.

use std::cmp::Ordering;
use std::sync::Arc;

use serde_json::{Map, Value};

use crate::error::{PolicyError, Result};
use crate::row::Row;

/// Sort direction of a preference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Lower values are better.
    Minimize,
    /// Higher values are better.
    Maximize,
}

impl Direction {
    fn key(self) -> &'static str {
        match self {
            Self::Minimize => "minimize",
            Self::Maximize => "maximize",
        }
    }
}

/// A single ordering preference.
#[derive(Debug, Clone, PartialEq)]
pub struct Preference {
    direction: Direction,
    name: String,
    precision: f64,
    original: Option<Map<String, Value>>,
}

impl Preference {
    /// Prefer nodes with a low value of `name`.
    #[must_use]
    pub fn minimize(name: impl Into<String>) -> Self {
        Self { direction: Direction::Minimize, name: name.into(), precision: 0.0, original: None }
    }

    /// Prefer nodes with a high value of `name`.
    #[must_use]
    pub fn maximize(name: impl Into<String>) -> Self {
        Self { direction: Direction::Maximize, name: name.into(), precision: 0.0, original: None }
    }

    /// Sets the tie tolerance.
    #[must_use]
    pub fn with_precision(mut self, precision: f64) -> Self {
        self.precision = precision;
        self
    }

    /// Parses `{"minimize": "cores", "precision": 3}`.
    ///
    /// # Errors
    ///
    /// Returns a document error if the object does not name exactly one
    /// direction, or a validation error for a negative precision.
    pub fn from_json(value: &Value) -> Result<Self> {
        let Value::Object(map) = value else {
            return Err(PolicyError::Document(format!("preference must be an object, got {value}")));
        };
        let direction = match (map.get("minimize"), map.get("maximize")) {
            (Some(Value::String(name)), None) => Self::minimize(name.clone()),
            (None, Some(Value::String(name))) => Self::maximize(name.clone()),
            _ => {
                return Err(PolicyError::Document(format!(
                    "preference {value} must name one attribute to minimize or maximize"
                )))
            }
        };
        let precision = match map.get("precision") {
            None => 0.0,
            Some(p) => p.as_f64().filter(|p| *p >= 0.0).ok_or_else(|| {
                PolicyError::validation("precision", format!("{p} must be a non-negative number"))
            })?,
        };
        Ok(Self { precision, original: Some(map.clone()), ..direction })
    }

    /// Renders the preference back to its document form.
    #[must_use]
    pub fn to_json(&self) -> Value {
        if let Some(original) = &self.original {
            return Value::Object(original.clone());
        }
        let mut map = Map::new();
        map.insert(self.direction.key().to_string(), Value::from(self.name.as_str()));
        if self.precision > 0.0 {
            map.insert("precision".to_string(), Value::from(self.precision));
        }
        Value::Object(map)
    }

    /// Direction.
    #[must_use]
    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Attribute name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Tie tolerance.
    #[must_use]
    pub fn precision(&self) -> f64 {
        self.precision
    }

    /// Numeric value of this preference's attribute on `row`.
    #[must_use]
    pub fn value_of(&self, row: &Row) -> Option<f64> {
        row.tag(&self.name).and_then(|v| v.as_f64())
    }

    fn order(&self, a: f64, b: f64) -> Ordering {
        match self.direction {
            Direction::Minimize => a.total_cmp(&b),
            Direction::Maximize => b.total_cmp(&a),
        }
    }

    /// Pairwise comparison with `precision` tolerance. `Less` means `a` is
    /// preferred. A missing value loses against a present one.
    #[must_use]
    pub fn compare(&self, a: &Row, b: &Row) -> Ordering {
        match (self.value_of(a), self.value_of(b)) {
            (Some(x), Some(y)) if (x - y).abs() > self.precision => self.order(x, y),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            _ => Ordering::Equal,
        }
    }
}

/// Compares two rows by every preference in significance order.
#[must_use]
pub fn compare_rows(a: &Row, b: &Row, preferences: &[Preference]) -> Ordering {
    preferences.iter().map(|p| p.compare(a, b)).find(|o| o.is_ne()).unwrap_or(Ordering::Equal)
}

/// Sorts rows best-first.
///
/// For each preference, the present values of live rows are ordered by
/// direction and chained into groups: a value joins the previous group when it
/// is within `precision` of its predecessor. Rows are then ordered by their
/// group numbers in significance order. Rows without a value rank last, down
/// rows sort after live ones, and remaining ties keep discovery order.
pub fn sort_rows(rows: &mut Vec<Arc<Row>>, preferences: &[Preference]) {
    let n = rows.len();
    let mut ranks: Vec<Vec<usize>> = vec![Vec::with_capacity(preferences.len()); n];

    for preference in preferences {
        let mut present: Vec<(usize, f64)> = rows
            .iter()
            .enumerate()
            .filter(|(_, row)| row.is_live())
            .filter_map(|(i, row)| preference.value_of(row).map(|v| (i, v)))
            .collect();
        present.sort_by(|a, b| preference.order(a.1, b.1));

        let mut group_of = vec![usize::MAX; n];
        let mut group = 0;
        let mut previous: Option<f64> = None;
        for (i, value) in present {
            if previous.is_some_and(|p| (value - p).abs() > preference.precision) {
                group += 1;
            }
            group_of[i] = group;
            previous = Some(value);
        }
        for (rank, group) in ranks.iter_mut().zip(group_of) {
            rank.push(group);
        }
    }

    let mut order: Vec<usize> = (0..n).collect();
    order.sort_by(|&a, &b| {
        rows[b]
            .is_live()
            .cmp(&rows[a].is_live())
            .then_with(|| ranks[a].cmp(&ranks[b]))
            .then_with(|| rows[a].index().cmp(&rows[b].index()))
    });
    let sorted: Vec<Arc<Row>> = order.into_iter().map(|i| Arc::clone(&rows[i])).collect();
    *rows = sorted;
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use serde_json::json;

    use super::*;
    use crate::row::CollectionReplicas;
    use crate::value::TagValue;

    fn row(node: &str, index: usize, values: &[(&str, f64)]) -> Arc<Row> {
        let tags: BTreeMap<String, TagValue> =
            values.iter().map(|(k, v)| (k.to_string(), TagValue::Float(*v))).collect();
        Arc::new(Row::new(node, index, true, tags, CollectionReplicas::new()))
    }

    fn rules_rows() -> Vec<Arc<Row>> {
        vec![
            row("node1", 0, &[("cores", 12.0), ("freedisk", 334.0), ("heapUsage", 10480.0)]),
            row("node2", 1, &[("cores", 4.0), ("freedisk", 749.0), ("heapUsage", 6873.0)]),
            row("node3", 2, &[("cores", 7.0), ("freedisk", 262.0), ("heapUsage", 7834.0)]),
            row("node4", 3, &[("cores", 8.0), ("freedisk", 375.0), ("heapUsage", 16900.0)]),
        ]
    }

    fn rules_preferences() -> Vec<Preference> {
        vec![
            Preference::minimize("cores").with_precision(2.0),
            Preference::maximize("freedisk").with_precision(50.0),
            Preference::minimize("heapUsage").with_precision(1000.0),
        ]
    }

    fn nodes(rows: &[Arc<Row>]) -> Vec<&str> {
        rows.iter().map(|r| r.node()).collect()
    }

    #[test]
    fn test_sort_with_precision() {
        let mut rows = rules_rows();
        sort_rows(&mut rows, &rules_preferences());
        assert_eq!(nodes(&rows), vec!["node2", "node4", "node3", "node1"]);
    }

    #[test]
    fn test_missing_values_and_down_rows_last() {
        let down = Arc::new(Row::new("dead", 0, false, BTreeMap::new(), CollectionReplicas::new()));
        let mut rows = vec![down, row("bare", 1, &[]), row("small", 2, &[("cores", 1.0)])];
        sort_rows(&mut rows, &[Preference::minimize("cores")]);
        assert_eq!(nodes(&rows), vec!["small", "bare", "dead"]);
    }

    #[test]
    fn test_ties_keep_discovery_order() {
        let mut rows = vec![
            row("c", 2, &[("cores", 5.0)]),
            row("a", 0, &[("cores", 5.0)]),
            row("b", 1, &[("cores", 6.0)]),
        ];
        sort_rows(&mut rows, &[Preference::minimize("cores").with_precision(1.0)]);
        assert_eq!(nodes(&rows), vec!["a", "b", "c"]);
    }

    #[test]
    fn test_compare_rows() {
        let rows = rules_rows();
        let prefs = rules_preferences();
        assert_eq!(compare_rows(&rows[1], &rows[0], &prefs), Ordering::Less);
        assert_eq!(compare_rows(&rows[3], &rows[2], &prefs), Ordering::Less);
        assert_eq!(compare_rows(&rows[0], &rows[0], &prefs), Ordering::Equal);
    }

    #[test]
    fn test_preference_document() {
        let raw = json!({"maximize": "freedisk", "precision": 50});
        let p = Preference::from_json(&raw).unwrap();
        assert_eq!(p.direction(), Direction::Maximize);
        assert_eq!(p.precision(), 50.0);
        assert_eq!(p.to_json(), raw);

        assert_eq!(Preference::minimize("cores").to_json(), json!({"minimize": "cores"}));
        assert!(Preference::from_json(&json!({"minimize": "a", "maximize": "b"})).is_err());
        assert!(Preference::from_json(&json!({"minimize": "a", "precision": -1})).is_err());
    }
}
