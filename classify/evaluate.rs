//! Accuracy and confusion summaries for predicted class ids.

use ndarray::{Array2, ArrayView1};
use std::fmt;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EvaluationError {
    #[error("Got {predicted} predictions for {actual} labels.")]
    LengthMismatch { predicted: usize, actual: usize },
    #[error("Cannot score an empty set of predictions.")]
    Empty,
    #[error("Class id {class_id} at row {row} is outside [0, {num_classes}).")]
    ClassOutOfRange {
        row: usize,
        class_id: usize,
        num_classes: usize,
    },
}

fn check_lengths(predicted: ArrayView1<usize>, actual: ArrayView1<usize>) -> Result<(), EvaluationError> {
    if predicted.len() != actual.len() {
        return Err(EvaluationError::LengthMismatch {
            predicted: predicted.len(),
            actual: actual.len(),
        });
    }
    if actual.is_empty() {
        return Err(EvaluationError::Empty);
    }
    Ok(())
}

/// Percentage of rows where the prediction equals the label, in `[0, 100]`.
pub fn accuracy(predicted: ArrayView1<usize>, actual: ArrayView1<usize>) -> Result<f64, EvaluationError> {
    check_lengths(predicted, actual)?;
    let correct = predicted
        .iter()
        .zip(actual.iter())
        .filter(|(p, a)| p == a)
        .count();
    Ok(100.0 * correct as f64 / actual.len() as f64)
}

/// `counts[[actual, predicted]]` tallies over a labelled split.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfusionMatrix {
    counts: Array2<usize>,
}

impl ConfusionMatrix {
    pub fn from_predictions(
        predicted: ArrayView1<usize>,
        actual: ArrayView1<usize>,
        num_classes: usize,
    ) -> Result<Self, EvaluationError> {
        check_lengths(predicted, actual)?;
        let mut counts = Array2::zeros((num_classes, num_classes));
        for (row, (&p, &a)) in predicted.iter().zip(actual.iter()).enumerate() {
            for class_id in [p, a] {
                if class_id >= num_classes {
                    return Err(EvaluationError::ClassOutOfRange {
                        row,
                        class_id,
                        num_classes,
                    });
                }
            }
            counts[[a, p]] += 1;
        }
        Ok(Self { counts })
    }

    pub fn counts(&self) -> &Array2<usize> {
        &self.counts
    }

    pub fn num_classes(&self) -> usize {
        self.counts.nrows()
    }

    pub fn total(&self) -> usize {
        self.counts.sum()
    }

    pub fn correct(&self) -> usize {
        self.counts.diag().sum()
    }

    /// Same value as [`accuracy`] on the underlying predictions.
    pub fn accuracy(&self) -> f64 {
        100.0 * self.correct() as f64 / self.total() as f64
    }

    /// Percentage of class `c` rows predicted as `c`; `None` when the class never occurs.
    pub fn recall(&self, class_id: usize) -> Option<f64> {
        let support = self.counts.row(class_id).sum();
        (support > 0).then(|| 100.0 * self.counts[[class_id, class_id]] as f64 / support as f64)
    }
}

/// A printable accuracy line plus per-class recall for one named split.
#[derive(Debug, Clone)]
pub struct SplitReport {
    pub name: String,
    pub confusion: ConfusionMatrix,
}

impl SplitReport {
    pub fn new(
        name: impl Into<String>,
        predicted: ArrayView1<usize>,
        actual: ArrayView1<usize>,
        num_classes: usize,
    ) -> Result<Self, EvaluationError> {
        Ok(Self {
            name: name.into(),
            confusion: ConfusionMatrix::from_predictions(predicted, actual, num_classes)?,
        })
    }

    pub fn accuracy(&self) -> f64 {
        self.confusion.accuracy()
    }
}

impl fmt::Display for SplitReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{} accuracy: {:.2}% ({} / {})",
            self.name,
            self.accuracy(),
            self.confusion.correct(),
            self.confusion.total()
        )?;
        for class_id in 0..self.confusion.num_classes() {
            match self.confusion.recall(class_id) {
                Some(recall) => writeln!(f, "  class {class_id}: {recall:.2}% recall")?,
                None => writeln!(f, "  class {class_id}: no samples")?,
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    #[test]
    fn accuracy_is_a_percentage() {
        let predicted = array![0, 1, 2, 2];
        let actual = array![0, 1, 1, 2];
        assert_abs_diff_eq!(accuracy(predicted.view(), actual.view()).unwrap(), 75.0);
        assert_abs_diff_eq!(accuracy(actual.view(), actual.view()).unwrap(), 100.0);
    }

    #[test]
    fn mismatched_or_empty_inputs_are_errors() {
        let predicted = array![0, 1];
        let actual = array![0];
        assert_eq!(
            accuracy(predicted.view(), actual.view()),
            Err(EvaluationError::LengthMismatch {
                predicted: 2,
                actual: 1
            })
        );
        let empty = ndarray::Array1::<usize>::zeros(0);
        assert_eq!(accuracy(empty.view(), empty.view()), Err(EvaluationError::Empty));
    }

    #[test]
    fn confusion_matrix_counts_and_recall() {
        let predicted = array![0, 1, 1, 2, 0];
        let actual = array![0, 1, 2, 2, 1];
        let confusion = ConfusionMatrix::from_predictions(predicted.view(), actual.view(), 4).unwrap();

        assert_eq!(confusion.counts()[[2, 1]], 1);
        assert_eq!(confusion.counts()[[1, 0]], 1);
        assert_eq!(confusion.total(), 5);
        assert_eq!(confusion.correct(), 3);
        assert_abs_diff_eq!(confusion.accuracy(), 60.0);
        assert_abs_diff_eq!(confusion.recall(0).unwrap(), 100.0);
        assert_abs_diff_eq!(confusion.recall(1).unwrap(), 50.0);
        assert_eq!(confusion.recall(3), None);
        assert_abs_diff_eq!(
            confusion.accuracy(),
            accuracy(predicted.view(), actual.view()).unwrap()
        );
    }

    #[test]
    fn out_of_range_class_is_reported() {
        let result = ConfusionMatrix::from_predictions(array![0, 5].view(), array![0, 1].view(), 2);
        assert_eq!(
            result,
            Err(EvaluationError::ClassOutOfRange {
                row: 1,
                class_id: 5,
                num_classes: 2
            })
        );
    }

    #[test]
    fn report_lists_every_class() {
        let report = SplitReport::new("Validation", array![0, 1].view(), array![0, 0].view(), 3).unwrap();
        let text = report.to_string();
        assert!(text.starts_with("Validation accuracy: 50.00% (1 / 2)"));
        assert!(text.contains("class 0: 50.00% recall"));
        assert!(text.contains("class 2: no samples"));
    }
}
