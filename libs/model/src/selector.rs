//! Label selectors.
//!
//! A selector is a conjunction of predicates over label values. The
//! predicate vocabulary mirrors what the catalog declares: exact match,
//! negated match, set membership, negated membership, and glob patterns.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::Labeled;

/// A single predicate against one label key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Predicate {
    pub key: String,
    #[serde(flatten)]
    pub matcher: LabelPredicate,
}

/// How a predicate compares the label value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LabelPredicate {
    /// Value equals the given string.
    Equal(String),
    /// Value differs from the given string.
    NotEqual(String),
    /// Value is one of the given strings.
    In(BTreeSet<String>),
    /// Value is none of the given strings.
    NotIn(BTreeSet<String>),
    /// Value matches a glob pattern (`*` any run, `?` any one character).
    Glob(String),
}

impl LabelPredicate {
    fn holds(&self, value: &str) -> bool {
        match self {
            LabelPredicate::Equal(want) => value == want,
            LabelPredicate::NotEqual(want) => value != want,
            LabelPredicate::In(set) => set.contains(value),
            LabelPredicate::NotIn(set) => !set.contains(value),
            LabelPredicate::Glob(pattern) => glob_match(pattern, value),
        }
    }
}

/// A conjunction of label predicates.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Selector {
    pub predicates: Vec<Predicate>,
}

impl Selector {
    /// Selector with no predicates (matches everything).
    pub fn any() -> Self {
        Self::default()
    }

    /// Convenience constructor for a single equality predicate.
    pub fn label_equals(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            predicates: vec![Predicate {
                key: key.into(),
                matcher: LabelPredicate::Equal(value.into()),
            }],
        }
    }

    /// Add a predicate, builder-style.
    pub fn and(mut self, key: impl Into<String>, matcher: LabelPredicate) -> Self {
        self.predicates.push(Predicate {
            key: key.into(),
            matcher,
        });
        self
    }

    /// True iff every predicate holds against `source`.
    pub fn matches(&self, source: &impl Labeled) -> bool {
        self.predicates
            .iter()
            .all(|p| p.matcher.holds(&source.label(&p.key)))
    }
}

/// Glob matching with `*` and `?`, iterative with single backtrack point.
fn glob_match(pattern: &str, value: &str) -> bool {
    let pat: Vec<char> = pattern.chars().collect();
    let val: Vec<char> = value.chars().collect();

    let (mut p, mut v) = (0, 0);
    let mut star: Option<(usize, usize)> = None;

    while v < val.len() {
        if p < pat.len() && (pat[p] == '?' || pat[p] == val[v]) {
            p += 1;
            v += 1;
        } else if p < pat.len() && pat[p] == '*' {
            star = Some((p, v));
            p += 1;
        } else if let Some((sp, sv)) = star {
            // Let the last '*' absorb one more character.
            p = sp + 1;
            v = sv + 1;
            star = Some((sp, sv + 1));
        } else {
            return false;
        }
    }

    while p < pat.len() && pat[p] == '*' {
        p += 1;
    }
    p == pat.len()
}
