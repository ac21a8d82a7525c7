//! Explanation extraction
//!
//! Distills a trained logic classifier into one Boolean formula per class
//! and scores the result:
//!
//! 1. [`ConceptSnapshot::collect`] recomputes concept vectors, logits and
//!    labels for a whole split without tracking gradients.
//! 2. [`explain_class`] keeps, for one class, the concepts the classifier
//!    attends to, turns every correctly classified example of that class
//!    into a minterm over them, ranks the distinct minterms by accuracy and
//!    greedily ORs together those that improve it.
//! 3. [`explain`] runs every class, then measures the formulas used together
//!    as a classifier, their agreement with the network, the network's own
//!    fidelity and the purity of the discovered concepts.

mod formula;
mod purity;

pub use formula::{Formula, Literal, Minterm, CONCEPT_THRESHOLD};
pub use purity::{cluster_accuracy, harmonic_mean, mean_std};

use crate::aggregate::{aggregate, graph_labels, GraphIndex};
use crate::data::InstanceLoader;
use crate::embedder::LocalEmbedder;
use crate::logic::LogicClassifier;
use crate::prototypes::PrototypeBank;
use crate::training::{threshold_accuracy, LogicMetrics};
use crate::{ExplainerError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tracing::debug;

/// Relevance above which a concept enters a class's minterms
pub const RELEVANCE_THRESHOLD: f32 = 0.5;

/// Most distinct minterms considered per class
pub const MAX_CANDIDATES: usize = 3000;

/// Fewest correctly classified examples on each side needed to explain a class
const MIN_CORRECT: usize = 2;

// ============================================================================
// Snapshot
// ============================================================================

/// Detached model outputs over one split
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConceptSnapshot {
    /// Concept vectors `[G][K]`, ascending graph id
    pub concepts: Vec<Vec<f32>>,
    /// Classifier logits `[G][C]`
    pub logits: Vec<Vec<f32>>,
    /// Graph task labels `[G]`
    pub labels: Vec<u32>,
    /// Instance assignments `[N][K]`
    pub assignments: Vec<Vec<f32>>,
    /// Instance concept labels `[N]`
    pub concept_labels: Vec<u32>,
}

impl ConceptSnapshot {
    /// Run the full pipeline over `loader` in graph-id order
    pub fn collect(
        embedder: &dyn LocalEmbedder,
        bank: &PrototypeBank,
        classifier: &dyn LogicClassifier,
        loader: &InstanceLoader,
        temperature: f64,
    ) -> Result<Self> {
        let mut snapshot = Self::default();

        for batch in loader.ordered_batches()? {
            let embeddings = embedder.embed(&batch, false)?.detach();
            let assignments = bank.assign(&embeddings, temperature)?.detach();
            let index = GraphIndex::from_raw(&batch.graph_ids)?;
            let concepts = aggregate(&assignments, &index)?;
            let logits = classifier.forward(&concepts, false)?.detach();

            snapshot.concepts.extend(to_rows(&concepts)?);
            snapshot.logits.extend(to_rows(&logits)?);
            snapshot.labels.extend(graph_labels(&batch.task_labels, &index)?);
            snapshot.assignments.extend(to_rows(&assignments)?);
            snapshot.concept_labels.extend_from_slice(&batch.concept_labels);
        }

        Ok(snapshot)
    }

    pub fn num_graphs(&self) -> usize {
        self.concepts.len()
    }

    /// Highest-assignment concept of every instance
    pub fn clusters(&self) -> Vec<usize> {
        self.assignments
            .iter()
            .map(|row| {
                row.iter()
                    .enumerate()
                    .fold((0, f32::NEG_INFINITY), |(bi, bv), (i, &v)| if v > bv { (i, v) } else { (bi, bv) })
                    .0
            })
            .collect()
    }
}

fn to_rows(t: &candle_core::Tensor) -> Result<Vec<Vec<f32>>> {
    t.to_vec2::<f32>()
        .map_err(|e| ExplainerError::Tensor(format!("snapshot readout failed: {}", e)))
}

// ============================================================================
// Per-class explanation
// ============================================================================

/// Formula found for one class
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassExplanation {
    pub class: usize,
    pub formula: Formula,
    /// Formula accuracy on the split; zero when no formula was found
    pub accuracy: f32,
    /// Distinct minterms considered
    pub candidates: usize,
}

/// Accuracy of `formula` for `class`, with no formula scoring zero
fn explanation_accuracy(formula: &Formula, snapshot: &ConceptSnapshot, class: usize) -> f32 {
    if formula.is_empty() {
        return 0.0;
    }
    formula.accuracy(&snapshot.concepts, &snapshot.labels, class)
}

/// Greedy disjunction of local minterms for `class`
pub fn explain_class(
    classifier: &dyn LogicClassifier,
    snapshot: &ConceptSnapshot,
    class: usize,
    max_candidates: usize,
) -> Result<ClassExplanation> {
    let relevance = classifier.concept_relevance(class)?;
    let mut relevant: Vec<usize> = (0..relevance.len())
        .filter(|&c| relevance[c] > RELEVANCE_THRESHOLD)
        .collect();
    relevant.sort_by(|&a, &b| relevance[a].total_cmp(&relevance[b]));

    let predicted = |row: &Vec<f32>| row.get(class).is_some_and(|&l| l > 0.0);
    let rows = snapshot.concepts.iter().zip(&snapshot.logits).zip(&snapshot.labels);
    let correct_target: Vec<&Vec<f32>> = rows
        .clone()
        .filter(|&((_, logits), &y)| y as usize == class && predicted(logits))
        .map(|((concepts, _), _)| concepts)
        .collect();
    let correct_opposite = rows
        .filter(|&((_, logits), &y)| y as usize != class && !predicted(logits))
        .count();

    let empty = ClassExplanation {
        class,
        formula: Formula::default(),
        accuracy: 0.0,
        candidates: 0,
    };
    if correct_target.len() < MIN_CORRECT || correct_opposite < MIN_CORRECT {
        debug!(
            class,
            correct_target = correct_target.len(),
            correct_opposite,
            "too few correct predictions to explain class"
        );
        return Ok(empty);
    }

    let mut seen = HashSet::new();
    let mut candidates: Vec<(Minterm, f32)> = Vec::new();
    for concepts in correct_target {
        let minterm = Minterm::from_sample(concepts, &relevant);
        if minterm.is_empty() || !seen.insert(minterm.clone()) {
            continue;
        }
        let single = Formula::new(vec![minterm.clone()]);
        candidates.push((minterm, explanation_accuracy(&single, snapshot, class)));
    }
    // Stable: ties keep first-seen order
    candidates.sort_by(|a, b| b.1.total_cmp(&a.1));
    candidates.truncate(max_candidates);
    let num_candidates = candidates.len();

    let mut best = Formula::default();
    let mut best_accuracy = 0.0f32;
    for (minterm, _) in candidates {
        let mut trial = best.clone();
        trial.terms.push(minterm);
        let accuracy = explanation_accuracy(&trial, snapshot, class);
        if accuracy > best_accuracy {
            best = trial;
            best_accuracy = accuracy;
        }
    }

    Ok(ClassExplanation {
        class,
        formula: best,
        accuracy: best_accuracy,
        candidates: num_candidates,
    })
}

// ============================================================================
// Report
// ============================================================================

/// Everything one inspection measures
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExplanationReport {
    pub classes: Vec<ClassExplanation>,
    /// Formulas used together as a classifier, against the labels
    pub logic_acc_clf: f32,
    /// Formulas used together, against the classifier's thresholded predictions
    pub formula_agreement: f32,
    /// Classifier's thresholded predictions against the labels
    pub len_fidelity: f32,
    pub concept_purity: f32,
    pub concept_purity_std: f32,
    /// Instances per concept (by highest assignment)
    pub concept_distribution: Vec<usize>,
}

impl ExplanationReport {
    /// Harmonic mean of the per-class formula accuracies
    pub fn logic_acc(&self) -> f32 {
        let accs: Vec<f32> = self.classes.iter().map(|c| c.accuracy).collect();
        harmonic_mean(&accs)
    }

    pub fn logic_metrics(&self, epoch: usize) -> LogicMetrics {
        LogicMetrics {
            epoch,
            logic_acc: self.logic_acc(),
            logic_acc_clf: self.logic_acc_clf,
            concept_purity: self.concept_purity,
            concept_purity_std: self.concept_purity_std,
        }
    }
}

/// Fraction of rows where the per-class formula truths equal `expected(row, class)` for every class
fn combined_accuracy<F>(formulas: &[&Formula], snapshot: &ConceptSnapshot, expected: F) -> f32
where
    F: Fn(usize, usize) -> bool,
{
    if snapshot.concepts.is_empty() || formulas.iter().any(|f| f.is_empty()) {
        return 0.0;
    }
    let hits = snapshot
        .concepts
        .iter()
        .enumerate()
        .filter(|(row, concepts)| {
            formulas
                .iter()
                .enumerate()
                .all(|(class, f)| f.evaluate(concepts) == expected(*row, class))
        })
        .count();
    hits as f32 / snapshot.concepts.len() as f32
}

/// Explain every class and score the explanations on `snapshot`
pub fn explain(classifier: &dyn LogicClassifier, snapshot: &ConceptSnapshot) -> Result<ExplanationReport> {
    if snapshot.num_graphs() == 0 {
        return Err(ExplainerError::Data("cannot explain an empty split".into()));
    }

    let classes = (0..classifier.num_classes())
        .map(|c| explain_class(classifier, snapshot, c, MAX_CANDIDATES))
        .collect::<Result<Vec<_>>>()?;

    let formulas: Vec<&Formula> = classes.iter().map(|c| &c.formula).collect();
    let logic_acc_clf = combined_accuracy(&formulas, snapshot, |row, class| {
        snapshot.labels[row] as usize == class
    });
    let formula_agreement = combined_accuracy(&formulas, snapshot, |row, class| {
        snapshot.logits[row].get(class).is_some_and(|&l| l > 0.0)
    });
    let len_fidelity = threshold_accuracy(&snapshot.logits, &snapshot.labels);

    let clusters = snapshot.clusters();
    let (concept_purity, concept_purity_std) = mean_std(&cluster_accuracy(&clusters, &snapshot.concept_labels));
    let num_concepts = snapshot.assignments.first().map(|r| r.len()).unwrap_or(0);
    let mut concept_distribution = vec![0usize; num_concepts];
    for c in clusters {
        concept_distribution[c] += 1;
    }

    Ok(ExplanationReport {
        classes,
        logic_acc_clf,
        formula_agreement,
        len_fidelity,
        concept_purity,
        concept_purity_std,
        concept_distribution,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ExplainerConfig;
    use crate::data::Instance;
    use crate::embedder::GraphEmbedder;
    use crate::logic::EntropyLogicNetwork;
    use crate::primitives::zero_scalar;
    use candle_core::{DType, Device, Tensor, Var};
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    /// Classifier stub exposing fixed per-class relevances
    struct FixedRelevance(Vec<Vec<f32>>);

    impl LogicClassifier for FixedRelevance {
        fn forward(&self, concepts: &Tensor, _train: bool) -> Result<Tensor> {
            Ok(Tensor::zeros((concepts.dim(0)?, self.0.len()), DType::F32, concepts.device())?)
        }
        fn vars(&self) -> Vec<Var> {
            Vec::new()
        }
        fn named_vars(&self) -> Vec<(String, Var)> {
            Vec::new()
        }
        fn regularization(&self) -> Result<Tensor> {
            zero_scalar(&Device::Cpu)
        }
        fn concept_relevance(&self, class: usize) -> Result<Vec<f32>> {
            Ok(self.0[class].clone())
        }
        fn num_classes(&self) -> usize {
            self.0.len()
        }
    }

    fn logits_for(labels: &[u32]) -> Vec<Vec<f32>> {
        labels
            .iter()
            .map(|&y| if y == 1 { vec![-1.0, 1.0] } else { vec![1.0, -1.0] })
            .collect()
    }

    fn separable_snapshot() -> ConceptSnapshot {
        let labels = vec![1, 1, 0, 0, 1];
        ConceptSnapshot {
            concepts: vec![
                vec![0.9, 0.1, 0.3],
                vec![0.8, 0.2, 0.9],
                vec![0.1, 0.9, 0.2],
                vec![0.2, 0.7, 0.8],
                vec![0.95, 0.0, 0.0],
            ],
            logits: logits_for(&labels),
            labels,
            assignments: vec![vec![0.7, 0.2, 0.1], vec![0.6, 0.3, 0.1], vec![0.1, 0.8, 0.1]],
            concept_labels: vec![0, 0, 1],
        }
    }

    #[test]
    fn test_single_concept_formulas() {
        let clf = FixedRelevance(vec![vec![0.2, 1.0, 0.1], vec![1.0, 0.3, 0.1]]);
        let report = explain(&clf, &separable_snapshot()).unwrap();

        assert_eq!(report.classes[0].formula.to_string(), "p1");
        assert_eq!(report.classes[1].formula.to_string(), "p0");
        assert_eq!(report.classes[1].candidates, 1);
        assert_eq!(report.logic_acc(), 1.0);
        assert_eq!(report.logic_acc_clf, 1.0);
        assert_eq!(report.formula_agreement, 1.0);
        assert_eq!(report.len_fidelity, 1.0);
        assert_eq!(report.concept_purity, 1.0);
        assert_eq!(report.concept_purity_std, 0.0);
        assert_eq!(report.concept_distribution, vec![2, 1, 0]);

        let metrics = report.logic_metrics(20);
        assert_eq!(metrics.epoch, 20);
        assert_eq!(metrics.logic_acc, 1.0);
    }

    #[test]
    fn test_greedy_disjunction() {
        // Class 1 iff exactly one of p0, p2
        let labels = vec![1, 1, 1, 0, 0];
        let snapshot = ConceptSnapshot {
            concepts: vec![
                vec![0.9, 0.0, 0.1],
                vec![0.1, 0.0, 0.9],
                vec![0.8, 0.0, 0.1],
                vec![0.1, 0.9, 0.1],
                vec![0.2, 0.1, 0.2],
            ],
            logits: logits_for(&labels),
            labels,
            ..Default::default()
        };
        let clf = FixedRelevance(vec![vec![0.1, 1.0, 0.1], vec![1.0, 0.1, 0.9]]);
        let exp = explain_class(&clf, &snapshot, 1, MAX_CANDIDATES).unwrap();

        // Concepts listed by ascending relevance: p2 before p0
        assert_eq!(exp.formula.to_string(), "~p2 & p0 | p2 & ~p0");
        assert_eq!(exp.accuracy, 1.0);
        assert_eq!(exp.candidates, 2);
    }

    #[test]
    fn test_candidate_cap() {
        let labels = vec![1, 1, 1, 0, 0];
        let snapshot = ConceptSnapshot {
            concepts: vec![
                vec![0.9, 0.0, 0.1],
                vec![0.1, 0.0, 0.9],
                vec![0.8, 0.0, 0.1],
                vec![0.1, 0.9, 0.1],
                vec![0.2, 0.1, 0.2],
            ],
            logits: logits_for(&labels),
            labels,
            ..Default::default()
        };
        let clf = FixedRelevance(vec![vec![0.1, 1.0, 0.1], vec![1.0, 0.1, 0.9]]);
        let exp = explain_class(&clf, &snapshot, 1, 1).unwrap();
        assert_eq!(exp.formula.to_string(), "~p2 & p0");
        assert!((exp.accuracy - 0.8).abs() < 1e-6);
    }

    #[test]
    fn test_too_few_correct_predictions() {
        let mut snapshot = separable_snapshot();
        // Classifier now wrong on every class-0 graph
        snapshot.logits = logits_for(&[1, 1, 1, 1, 1]);
        let clf = FixedRelevance(vec![vec![0.2, 1.0, 0.1], vec![1.0, 0.3, 0.1]]);
        let report = explain(&clf, &snapshot).unwrap();

        assert!(report.classes[0].formula.is_empty());
        assert_eq!(report.classes[0].accuracy, 0.0);
        assert_eq!(report.logic_acc(), 0.0);
        assert_eq!(report.logic_acc_clf, 0.0);
        assert!((report.len_fidelity - 0.6).abs() < 1e-6);
    }

    #[test]
    fn test_empty_snapshot_rejected() {
        let clf = FixedRelevance(vec![vec![1.0], vec![1.0]]);
        assert!(explain(&clf, &ConceptSnapshot::default()).is_err());
    }

    #[test]
    fn test_collect_over_loader() {
        let device = Device::Cpu;
        let config = ExplainerConfig {
            num_prototypes: 3,
            dim_prototypes: 2,
            dropout: 0.0,
            ..Default::default()
        };
        let instances = vec![
            Instance::new(vec![vec![1.0, 0.0]; 2], vec![(0, 1)], 0, 10, 1).unwrap(),
            Instance::new(vec![vec![0.0, 1.0]; 3], vec![(0, 1), (1, 2)], 1, 10, 1).unwrap(),
            Instance::new(vec![vec![0.5, 0.5]; 2], vec![(1, 0)], 2, 3, 0).unwrap(),
        ];
        let loader = InstanceLoader::new(instances, 1, true, 0, &device).unwrap();

        let embedder = GraphEmbedder::new(2, &config, &device).unwrap();
        let mut rng = StdRng::seed_from_u64(0);
        let bank = PrototypeBank::new(3, 2, config.assign_func, &mut rng, &device).unwrap();
        let classifier = EntropyLogicNetwork::new(3, &config, &device).unwrap();

        let snapshot = ConceptSnapshot::collect(&embedder, &bank, &classifier, &loader, 1.0).unwrap();
        assert_eq!(snapshot.num_graphs(), 2);
        // Graph 3 sorts before graph 10
        assert_eq!(snapshot.labels, vec![0, 1]);
        assert_eq!(snapshot.concept_labels, vec![2, 0, 1]);
        assert_eq!(snapshot.assignments.len(), 3);
        assert!(snapshot.concepts.iter().all(|r| r.len() == 3));
        assert!(snapshot.logits.iter().all(|r| r.len() == 2));
    }
}
