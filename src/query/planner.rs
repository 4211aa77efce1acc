//! Trigram planning for candidate-leaf selection
//!
//! A filter is reduced to a disjunction of fingerprint sets. A leaf is a
//! candidate if, for at least one alternative, it advertised every
//! fingerprint of that alternative. An empty alternative matches every
//! leaf. Any part of the filter that cannot be expressed this way (`not`,
//! literals shorter than a trigram) is widened to "every leaf", which
//! keeps the plan sound.

use std::collections::BTreeSet;

use super::ast::Predicate;
use crate::trigram::{trigrams, Fingerprint};

/// Alternatives beyond which the plan collapses to the universe
pub const MAX_ALTERNATIVES: usize = 32;

/// Disjunction of fingerprint conjunctions
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HintPlan {
    alternatives: Vec<BTreeSet<Fingerprint>>,
}

impl HintPlan {
    /// Plan that selects every leaf
    pub fn universe() -> Self {
        Self {
            alternatives: vec![BTreeSet::new()],
        }
    }

    pub fn is_universe(&self) -> bool {
        self.alternatives.iter().any(BTreeSet::is_empty)
    }

    pub fn alternatives(&self) -> &[BTreeSet<Fingerprint>] {
        &self.alternatives
    }

    fn from_alternatives(mut alternatives: Vec<BTreeSet<Fingerprint>>) -> Self {
        if alternatives.is_empty()
            || alternatives.len() > MAX_ALTERNATIVES
            || alternatives.iter().any(BTreeSet::is_empty)
        {
            return Self::universe();
        }
        alternatives.sort();
        alternatives.dedup();
        Self { alternatives }
    }
}

/// Build the hint plan for an optional filter
pub fn plan_hints(filter: Option<&Predicate>) -> HintPlan {
    match filter {
        None => HintPlan::universe(),
        Some(predicate) => plan(predicate),
    }
}

fn plan(predicate: &Predicate) -> HintPlan {
    match predicate {
        Predicate::Field(field) => HintPlan::from_alternatives(vec![trigrams(&field.value)]),
        Predicate::Not { .. } => HintPlan::universe(),
        Predicate::Or { args } => {
            let mut alternatives = Vec::new();
            for arg in args {
                let sub = plan(arg);
                if sub.is_universe() {
                    return HintPlan::universe();
                }
                alternatives.extend(sub.alternatives);
                if alternatives.len() > MAX_ALTERNATIVES {
                    return HintPlan::universe();
                }
            }
            HintPlan::from_alternatives(alternatives)
        },
        Predicate::And { args } => {
            let mut acc = HintPlan::universe();
            for arg in args {
                let sub = plan(arg);
                if sub.is_universe() {
                    continue;
                }
                if acc.alternatives.len() * sub.alternatives.len() > MAX_ALTERNATIVES {
                    // Dropping a conjunct only widens the candidate set.
                    continue;
                }
                let product = acc
                    .alternatives
                    .iter()
                    .flat_map(|left| {
                        sub.alternatives
                            .iter()
                            .map(move |right| left.union(right).copied().collect())
                    })
                    .collect();
                acc = HintPlan::from_alternatives(product);
            }
            acc
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_filter_is_universe() {
        assert!(plan_hints(None).is_universe());
    }

    #[test]
    fn test_short_literal_is_universe() {
        let p = Predicate::target_equals("job", "ab");
        assert!(plan_hints(Some(&p)).is_universe());
    }

    #[test]
    fn test_field_uses_all_trigrams() {
        let p = Predicate::target_contains("job", "Job-42");
        let plan = plan_hints(Some(&p));
        assert_eq!(plan.alternatives(), &[trigrams("Job-42")]);
    }

    #[test]
    fn test_and_unions_or_splits() {
        let and = Predicate::And {
            args: vec![
                Predicate::target_equals("a", "alpha"),
                Predicate::target_equals("b", "beta"),
            ],
        };
        let plan = plan_hints(Some(&and));
        assert_eq!(plan.alternatives().len(), 1);
        let expected: BTreeSet<_> = trigrams("alpha").union(&trigrams("beta")).copied().collect();
        assert_eq!(plan.alternatives()[0], expected);

        let or = Predicate::Or {
            args: vec![
                Predicate::target_equals("a", "alpha"),
                Predicate::target_equals("b", "beta"),
            ],
        };
        assert_eq!(plan_hints(Some(&or)).alternatives().len(), 2);
    }

    #[test]
    fn test_not_inside_and_is_ignored() {
        let p = Predicate::And {
            args: vec![
                Predicate::target_equals("a", "alpha"),
                Predicate::Not {
                    arg: Box::new(Predicate::target_equals("b", "beta")),
                },
            ],
        };
        assert_eq!(plan_hints(Some(&p)).alternatives(), &[trigrams("alpha")]);
    }

    #[test]
    fn test_not_inside_or_is_universe() {
        let p = Predicate::Or {
            args: vec![
                Predicate::target_equals("a", "alpha"),
                Predicate::Not {
                    arg: Box::new(Predicate::target_equals("b", "beta")),
                },
            ],
        };
        assert!(plan_hints(Some(&p)).is_universe());
    }

    #[test]
    fn test_alternative_explosion_collapses() {
        let or = |n: usize| Predicate::Or {
            args: (0..n)
                .map(|i| Predicate::target_equals("f", format!("value-{i:03}")))
                .collect(),
        };
        assert!(plan_hints(Some(&or(40))).is_universe());

        let and = Predicate::And {
            args: vec![or(8), or(8)],
        };
        let plan = plan_hints(Some(&and));
        assert_eq!(plan.alternatives().len(), 8);
    }
}
