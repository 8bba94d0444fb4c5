use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};

/// Classification metrics over paired ground-truth and predicted
/// labels. Every per-class ratio with a zero denominator is reported
/// as 0, not an error.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EvalMetrics {
    pub overall: OverallMetrics,
    pub per_class: BTreeMap<String, ClassMetrics>,
    pub confusion_matrix: ConfusionMatrix,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OverallMetrics {
    pub accuracy: f64,
    pub precision_macro: f64,
    pub recall_macro: f64,
    pub f1_macro: f64,
    pub total_samples: usize,
    pub correct_predictions: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClassMetrics {
    pub precision: f64,
    pub recall: f64,
    pub f1: f64,
    pub support: usize,
}

/// Rows are true labels, columns are predicted labels, both in the
/// lexicographic order of `labels`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConfusionMatrix {
    pub labels: Vec<String>,
    pub matrix: Vec<Vec<usize>>,
}

/// Compute metrics over parallel label slices. Returns `None` when the
/// slices are empty or their lengths disagree.
pub fn compute_metrics(y_true: &[String], y_pred: &[String]) -> Option<EvalMetrics> {
    if y_true.is_empty() || y_true.len() != y_pred.len() {
        return None;
    }

    let labels: Vec<String> = y_true
        .iter()
        .chain(y_pred.iter())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .cloned()
        .collect();

    let mut per_class = BTreeMap::new();
    for label in &labels {
        let mut tp = 0usize;
        let mut fp = 0usize;
        let mut fn_ = 0usize;
        let mut support = 0usize;

        for (truth, pred) in y_true.iter().zip(y_pred) {
            let is_true = truth == label;
            let is_pred = pred == label;
            if is_true {
                support += 1;
            }
            match (is_true, is_pred) {
                (true, true) => tp += 1,
                (false, true) => fp += 1,
                (true, false) => fn_ += 1,
                (false, false) => {}
            }
        }

        let precision = safe_ratio(tp, tp + fp);
        let recall = safe_ratio(tp, tp + fn_);
        let f1 = if precision + recall > 0.0 {
            2.0 * precision * recall / (precision + recall)
        } else {
            0.0
        };

        per_class.insert(
            label.clone(),
            ClassMetrics {
                precision,
                recall,
                f1,
                support,
            },
        );
    }

    let correct = y_true
        .iter()
        .zip(y_pred)
        .filter(|(truth, pred)| truth == pred)
        .count();

    let class_count = per_class.len() as f64;
    let precision_macro = per_class.values().map(|m| m.precision).sum::<f64>() / class_count;
    let recall_macro = per_class.values().map(|m| m.recall).sum::<f64>() / class_count;
    let f1_macro = per_class.values().map(|m| m.f1).sum::<f64>() / class_count;

    let matrix = labels
        .iter()
        .map(|truth| {
            labels
                .iter()
                .map(|pred| {
                    y_true
                        .iter()
                        .zip(y_pred)
                        .filter(|(t, p)| *t == truth && *p == pred)
                        .count()
                })
                .collect()
        })
        .collect();

    Some(EvalMetrics {
        overall: OverallMetrics {
            accuracy: safe_ratio(correct, y_true.len()),
            precision_macro,
            recall_macro,
            f1_macro,
            total_samples: y_true.len(),
            correct_predictions: correct,
        },
        per_class,
        confusion_matrix: ConfusionMatrix { labels, matrix },
    })
}

fn safe_ratio(numerator: usize, denominator: usize) -> f64 {
    if denominator == 0 {
        0.0
    } else {
        numerator as f64 / denominator as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EPS: f64 = 1e-9;

    fn labels(raw: &[&str]) -> Vec<String> {
        raw.iter().map(|s| s.to_string()).collect()
    }

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < EPS
    }

    #[test]
    fn empty_or_mismatched_inputs_yield_none() {
        assert!(compute_metrics(&[], &[]).is_none());
        assert!(compute_metrics(&labels(&["TECH"]), &labels(&["TECH", "TECH"])).is_none());
    }

    #[test]
    fn two_of_three_correct() {
        let y_true = labels(&["TECH", "TECH", "TECH"]);
        let y_pred = labels(&["TECH", "BUSINESS", "TECH"]);
        let metrics = compute_metrics(&y_true, &y_pred).unwrap();

        assert!(close(metrics.overall.accuracy, 2.0 / 3.0));
        assert_eq!(metrics.overall.correct_predictions, 2);
        assert_eq!(metrics.overall.total_samples, 3);

        let tech = &metrics.per_class["TECH"];
        assert!(close(tech.recall, 1.0));
        assert!(close(tech.precision, 2.0 / 3.0));
        assert!(close(tech.f1, 0.8));
        assert_eq!(tech.support, 3);

        // BUSINESS was predicted once but never true: both ratios
        // divide by a zero-count side and report 0
        let business = &metrics.per_class["BUSINESS"];
        assert!(close(business.precision, 0.0));
        assert!(close(business.recall, 0.0));
        assert!(close(business.f1, 0.0));
        assert_eq!(business.support, 0);

        assert!(close(metrics.overall.precision_macro, 1.0 / 3.0));
        assert!(close(metrics.overall.recall_macro, 0.5));
        assert!(close(metrics.overall.f1_macro, 0.4));
    }

    #[test]
    fn confusion_matrix_is_lexicographic() {
        let y_true = labels(&["TECH", "TECH", "TECH"]);
        let y_pred = labels(&["TECH", "BUSINESS", "TECH"]);
        let metrics = compute_metrics(&y_true, &y_pred).unwrap();

        assert_eq!(
            metrics.confusion_matrix.labels,
            labels(&["BUSINESS", "TECH"])
        );
        assert_eq!(metrics.confusion_matrix.matrix, vec![vec![0, 0], vec![1, 2]]);
    }

    #[test]
    fn perfect_predictions() {
        let y = labels(&["HEALTH", "SPORTS", "HEALTH"]);
        let metrics = compute_metrics(&y, &y).unwrap();

        assert!(close(metrics.overall.accuracy, 1.0));
        assert!(close(metrics.overall.f1_macro, 1.0));
        for class in metrics.per_class.values() {
            assert!(close(class.precision, 1.0));
            assert!(close(class.recall, 1.0));
        }
    }

    #[test]
    fn multiclass_counts_land_in_matrix_cells() {
        let y_true = labels(&["A", "B", "C", "A", "B"]);
        let y_pred = labels(&["A", "C", "C", "B", "B"]);
        let metrics = compute_metrics(&y_true, &y_pred).unwrap();

        let idx = |l: &str| {
            metrics
                .confusion_matrix
                .labels
                .iter()
                .position(|x| x == l)
                .unwrap()
        };
        let m = &metrics.confusion_matrix.matrix;
        assert_eq!(m[idx("A")][idx("A")], 1);
        assert_eq!(m[idx("A")][idx("B")], 1);
        assert_eq!(m[idx("B")][idx("C")], 1);
        assert_eq!(m[idx("B")][idx("B")], 1);
        assert_eq!(m[idx("C")][idx("C")], 1);

        let total: usize = m.iter().flatten().sum();
        assert_eq!(total, y_true.len());
    }
}
