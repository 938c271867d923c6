//! Turning raw model scores into a labelled prediction

use crate::error::InferenceError;
use crate::types::PredictionResult;

/// Tolerance when deciding whether scores already sum to one
const DISTRIBUTION_TOLERANCE: f32 = 1e-3;

/// Closed, ordered set of category names matching the model's output order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Categories {
    names: Vec<String>,
}

impl Categories {
    /// Create a category set. Callers validate uniqueness via `AppConfig::validate`.
    pub fn new(names: Vec<String>) -> Self {
        Self { names }
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn contains(&self, label: &str) -> bool {
        self.names.iter().any(|n| n == label)
    }

    pub fn name(&self, index: usize) -> Option<&str> {
        self.names.get(index).map(String::as_str)
    }

    /// Pick the highest-scoring category.
    ///
    /// Scores that already form a probability distribution are used as-is,
    /// anything else is treated as logits and passed through softmax. Ties
    /// resolve to the lowest index.
    pub fn select(&self, scores: &[f32]) -> Result<PredictionResult, InferenceError> {
        if scores.len() != self.names.len() {
            return Err(InferenceError::UnexpectedOutput(format!(
                "model produced {} scores for {} categories",
                scores.len(),
                self.names.len()
            )));
        }
        if let Some(i) = scores.iter().position(|s| !s.is_finite()) {
            return Err(InferenceError::UnexpectedOutput(format!(
                "score {} is not finite ({})",
                i, scores[i]
            )));
        }

        let probabilities = if is_distribution(scores) {
            scores.to_vec()
        } else {
            softmax(scores)
        };

        let (index, confidence) = argmax(&probabilities).ok_or_else(|| {
            InferenceError::UnexpectedOutput("model produced no scores".to_string())
        })?;

        Ok(PredictionResult::new(self.names[index].clone(), confidence))
    }
}

impl From<Vec<String>> for Categories {
    fn from(names: Vec<String>) -> Self {
        Self::new(names)
    }
}

/// True if every score is in [0, 1] and they sum to one.
pub fn is_distribution(scores: &[f32]) -> bool {
    if scores.is_empty() || scores.iter().any(|&s| !(0.0..=1.0).contains(&s)) {
        return false;
    }
    (scores.iter().sum::<f32>() - 1.0).abs() <= DISTRIBUTION_TOLERANCE
}

/// Numerically stable softmax.
pub fn softmax(logits: &[f32]) -> Vec<f32> {
    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f32> = logits.iter().map(|&l| (l - max).exp()).collect();
    let sum: f32 = exps.iter().sum();
    exps.into_iter().map(|e| e / sum).collect()
}

/// Index and value of the maximum; first occurrence wins on ties.
pub fn argmax(values: &[f32]) -> Option<(usize, f32)> {
    values
        .iter()
        .copied()
        .enumerate()
        .fold(None, |best, (i, v)| match best {
            Some((_, b)) if v <= b => best,
            _ => Some((i, v)),
        })
}
