//! Emotion classifier
//!
//! Evaluates a pre-trained TF-IDF + logistic-regression artifact natively.
//! The artifact is JSON: an ordered label set, a vocabulary with per-term
//! IDF weights, and one or more linear output blocks. Per-label probability
//! contributions accumulate additively across blocks, so multi-output
//! models and single-pipeline models go through the same path.

use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EmotionError {
    #[error("Failed to read model artifact: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse model artifact: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("Malformed model artifact: {0}")]
    Malformed(String),
}

/// Serialized model artifact.
#[derive(Debug, Deserialize)]
struct ModelArtifact {
    /// Fixed label set, in the classifier's native order.
    labels: Vec<String>,
    vectorizer: VectorizerArtifact,
    /// Linear blocks. Each block scores a subset of the labels.
    outputs: Vec<OutputArtifact>,
}

#[derive(Debug, Deserialize)]
struct VectorizerArtifact {
    /// Term -> feature index.
    vocabulary: HashMap<String, usize>,
    /// IDF weight per feature index.
    idf: Vec<f64>,
}

#[derive(Debug, Deserialize)]
struct OutputArtifact {
    /// Indices into `labels`, one per scored class.
    classes: Vec<usize>,
    /// One coefficient row per class (or a single row for binary blocks).
    coefficients: Vec<Vec<f64>>,
    intercepts: Vec<f64>,
}

/// Pre-trained multi-class probabilistic text classifier.
pub struct EmotionClassifier {
    labels: Vec<String>,
    vocabulary: HashMap<String, usize>,
    idf: Vec<f64>,
    outputs: Vec<OutputArtifact>,
}

impl EmotionClassifier {
    /// Load the classifier artifact from disk. Failure here is fatal at
    /// process start; there is no degraded mode without a classifier.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, EmotionError> {
        let raw = std::fs::read_to_string(path)?;
        let artifact: ModelArtifact = serde_json::from_str(&raw)?;
        Self::from_artifact(artifact)
    }

    fn from_artifact(artifact: ModelArtifact) -> Result<Self, EmotionError> {
        if artifact.labels.is_empty() {
            return Err(EmotionError::Malformed("empty label set".to_string()));
        }
        for output in &artifact.outputs {
            if let Some(&bad) = output
                .classes
                .iter()
                .find(|&&c| c >= artifact.labels.len())
            {
                return Err(EmotionError::Malformed(format!(
                    "class index {bad} out of range for {} labels",
                    artifact.labels.len()
                )));
            }
            if output.coefficients.len() != output.intercepts.len() {
                return Err(EmotionError::Malformed(
                    "coefficient and intercept counts disagree".to_string(),
                ));
            }
        }

        Ok(Self {
            labels: artifact.labels,
            vocabulary: artifact.vectorizer.vocabulary,
            idf: artifact.vectorizer.idf,
            outputs: artifact.outputs,
        })
    }

    /// The fixed ordered label set.
    pub fn labels(&self) -> &[String] {
        &self.labels
    }

    /// Classify `text` into a per-label probability percentage, in native
    /// label order. Every label appears; values are >= 0; labels missing
    /// from every output block stay at 0. Empty or degenerate input is a
    /// normal input and yields the intercept-only distribution.
    pub fn classify(&self, text: &str) -> Vec<(String, f64)> {
        let features = self.transform(text);

        let mut accumulated = vec![0.0f64; self.labels.len()];
        for output in &self.outputs {
            let probs = predict_proba(output, &features);
            for (&class, prob) in output.classes.iter().zip(probs) {
                accumulated[class] += prob;
            }
        }

        self.labels
            .iter()
            .zip(accumulated)
            .map(|(label, p)| (label.clone(), p * 100.0))
            .collect()
    }

    /// TF-IDF transform: lowercase word tokens (length >= 2), term counts
    /// scaled by IDF, L2-normalized.
    fn transform(&self, text: &str) -> HashMap<usize, f64> {
        let mut features: HashMap<usize, f64> = HashMap::new();
        for token in tokenize(text) {
            if let Some(&idx) = self.vocabulary.get(&token) {
                *features.entry(idx).or_insert(0.0) += 1.0;
            }
        }

        for (idx, value) in &mut features {
            let idf = self.idf.get(*idx).copied().unwrap_or(1.0);
            *value *= idf;
        }

        let norm: f64 = features.values().map(|v| v * v).sum::<f64>().sqrt();
        if norm > 0.0 {
            for value in features.values_mut() {
                *value /= norm;
            }
        }
        features
    }
}

/// Lowercase alphanumeric tokens of length >= 2, matching the vectorizer
/// the artifact was trained with.
fn tokenize(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.chars().count() >= 2)
        .map(str::to_lowercase)
}

/// Probability per scored class for one linear block. Binary blocks (two
/// classes, one coefficient row) use the sigmoid; everything else is a
/// multinomial softmax.
fn predict_proba(output: &OutputArtifact, features: &HashMap<usize, f64>) -> Vec<f64> {
    let score = |row: &[f64], intercept: f64| -> f64 {
        let dot: f64 = features
            .iter()
            .filter_map(|(&idx, &v)| row.get(idx).map(|c| c * v))
            .sum();
        dot + intercept
    };

    if output.classes.len() == 2 && output.coefficients.len() == 1 {
        let z = score(&output.coefficients[0], output.intercepts[0]);
        let positive = 1.0 / (1.0 + (-z).exp());
        return vec![1.0 - positive, positive];
    }

    let scores: Vec<f64> = output
        .coefficients
        .iter()
        .zip(&output.intercepts)
        .map(|(row, &b)| score(row, b))
        .collect();

    let max = scores.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    let exps: Vec<f64> = scores.iter().map(|s| (s - max).exp()).collect();
    let total: f64 = exps.iter().sum();
    exps.into_iter().map(|e| e / total).collect()
}
