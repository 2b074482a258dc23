mod attention;
mod entropy;

pub use attention::{attention_grid, build_attention_data};
pub use entropy::{semantic_entropy, shannon_entropy, EntropyAnalyzer};

use image::RgbImage;
use ndarray::Array2;
use serde::Serialize;

use crate::estimator::StepDistribution;
use crate::generation::{GenerationOutput, ModelError, TokenDecoder};
use crate::insight::InsightError;

/// An error type for the analysis module.
#[derive(thiserror::Error, Debug)]
pub enum AnalysisError {
    #[error(transparent)]
    ModelError(#[from] ModelError),

    #[error(transparent)]
    InsightError(#[from] InsightError),

    #[error(transparent)]
    ShapeError(#[from] ndarray::ShapeError),

    #[error(transparent)]
    Other(Box<dyn std::error::Error + Send + Sync>),
}

impl AnalysisError {
    pub fn other(err: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        Self::Other(err.into())
    }
}

/// A candidate token and its probability, as shown in the report.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TokenPrediction {
    pub token: String,
    pub probability: f32,
}

/// Uncertainty metrics of one generated token.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TokenMetric {
    pub raw_entropy: f32,
    pub semantic_entropy: f32,
    /// Most probable candidates first.
    pub token_predictions: Vec<TokenPrediction>,
}

/// Attention over the image grid of one generated token.
#[derive(Debug, Clone, PartialEq)]
pub struct TokenAttention {
    /// Generation step the grid belongs to, as numbered in the token report.
    pub step: usize,
    pub token: String,
    pub attention_grid: Array2<f32>,
}

/// Attention grids of the whole generation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AttentionData {
    /// Mean of all the per-token grids.
    pub cumulative_attention: Option<Array2<f32>>,
    pub token_attentions: Vec<TokenAttention>,
}

impl AttentionData {
    pub fn is_empty(&self) -> bool {
        self.cumulative_attention.is_none() && self.token_attentions.is_empty()
    }
}

/// Output of the post-hoc analysis.
#[derive(Debug, Clone, PartialEq)]
pub struct AnalysisResult {
    /// One entry per generated token.
    pub token_metrics: Vec<TokenMetric>,
    pub attention_data: AttentionData,
    /// Structured summary, serialized as-is.
    pub overall_insight: serde_json::Value,
}

/// Everything the analyzer gets to look at.
pub struct AnalysisInput<'a> {
    pub output: &'a GenerationOutput,
    pub decoder: &'a dyn TokenDecoder,
    /// Distributions captured by the generation hook.
    pub steps: &'a [StepDistribution],
    /// The question asked about the image.
    pub prompt: &'a str,
    pub image: &'a RgbImage,
}

/// Post-hoc analysis of a generation.
pub trait GenerationAnalyzer {
    fn analyze(&self, input: AnalysisInput<'_>) -> Result<AnalysisResult, AnalysisError>;
}
