//! Boolean formulas over concepts
//!
//! A [`Formula`] is a disjunction of [`Minterm`]s, each a conjunction of
//! [`Literal`]s. A concept counts as true when its activation exceeds
//! [`CONCEPT_THRESHOLD`].

use serde::{Deserialize, Serialize};
use std::fmt;

/// Activation above which a concept is considered present
pub const CONCEPT_THRESHOLD: f32 = 0.5;

/// A concept or its negation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Literal {
    pub concept: usize,
    pub negated: bool,
}

impl Literal {
    pub fn positive(concept: usize) -> Self {
        Self { concept, negated: false }
    }

    pub fn negative(concept: usize) -> Self {
        Self { concept, negated: true }
    }

    /// Truth value on one concept vector; out-of-range concepts are absent
    pub fn evaluate(&self, concepts: &[f32]) -> bool {
        let present = concepts
            .get(self.concept)
            .map(|&v| v > CONCEPT_THRESHOLD)
            .unwrap_or(false);
        present != self.negated
    }
}

impl fmt::Display for Literal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.negated {
            write!(f, "~p{}", self.concept)
        } else {
            write!(f, "p{}", self.concept)
        }
    }
}

/// Conjunction of literals; the empty minterm is `True`
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Minterm {
    pub literals: Vec<Literal>,
}

impl Minterm {
    pub fn new(literals: Vec<Literal>) -> Self {
        Self { literals }
    }

    /// Minterm describing `concepts` restricted to `relevant`, in the given order
    pub fn from_sample(concepts: &[f32], relevant: &[usize]) -> Self {
        let literals = relevant
            .iter()
            .map(|&c| {
                if concepts.get(c).is_some_and(|&v| v > CONCEPT_THRESHOLD) {
                    Literal::positive(c)
                } else {
                    Literal::negative(c)
                }
            })
            .collect();
        Self { literals }
    }

    pub fn is_empty(&self) -> bool {
        self.literals.is_empty()
    }

    pub fn evaluate(&self, concepts: &[f32]) -> bool {
        self.literals.iter().all(|l| l.evaluate(concepts))
    }
}

impl fmt::Display for Minterm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.literals.is_empty() {
            return f.write_str("True");
        }
        for (i, literal) in self.literals.iter().enumerate() {
            if i > 0 {
                f.write_str(" & ")?;
            }
            write!(f, "{}", literal)?;
        }
        Ok(())
    }
}

/// Disjunction of minterms; the empty formula is `False`
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Formula {
    pub terms: Vec<Minterm>,
}

impl Formula {
    pub fn new(terms: Vec<Minterm>) -> Self {
        Self { terms }
    }

    pub fn is_empty(&self) -> bool {
        self.terms.is_empty()
    }

    pub fn evaluate(&self, concepts: &[f32]) -> bool {
        self.terms.iter().any(|t| t.evaluate(concepts))
    }

    /// Truth value on every row of a concept matrix
    pub fn evaluate_all(&self, concepts: &[Vec<f32>]) -> Vec<bool> {
        concepts.iter().map(|row| self.evaluate(row)).collect()
    }

    /// Fraction of rows where the formula holds exactly for rows of `target_class`
    pub fn accuracy(&self, concepts: &[Vec<f32>], labels: &[u32], target_class: usize) -> f32 {
        if concepts.is_empty() {
            return 0.0;
        }
        let hits = concepts
            .iter()
            .zip(labels)
            .filter(|&(row, &y)| self.evaluate(row) == (y as usize == target_class))
            .count();
        hits as f32 / concepts.len() as f32
    }
}

impl fmt::Display for Formula {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.terms.is_empty() {
            return f.write_str("False");
        }
        for (i, term) in self.terms.iter().enumerate() {
            if i > 0 {
                f.write_str(" | ")?;
            }
            write!(f, "{}", term)?;
        }
        Ok(())
    }
}
