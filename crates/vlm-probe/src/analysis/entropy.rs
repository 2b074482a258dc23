use log::info;
use serde_json::json;

use super::{
    build_attention_data, AnalysisError, AnalysisInput, AnalysisResult, GenerationAnalyzer,
    TokenMetric, TokenPrediction,
};
use crate::config::AnalyzerConfig;
use crate::estimator::StepDistribution;
use crate::generation::{ModelError, TokenDecoder};
use crate::insight::{ChatCompletionsClient, InsightError, InsightRequest, InsightService};

/// Shannon entropy (natural log) of the renormalized positive probabilities.
pub fn shannon_entropy(probs: &[f32]) -> f32 {
    let total: f32 = probs.iter().filter(|&&p| p > 0.0).sum();
    if total <= 0.0 {
        return 0.0;
    }
    probs
        .iter()
        .filter(|&&p| p > 0.0)
        .map(|&p| {
            let q = p / total;
            -q * q.ln()
        })
        .sum()
}

/// Entropy after merging the candidates that read the same once trimmed and lower-cased.
pub fn semantic_entropy(candidates: &[(String, f32)]) -> f32 {
    let mut groups: Vec<(String, f32)> = Vec::new();
    for (text, probability) in candidates {
        let key = text.trim().to_lowercase();
        match groups.iter_mut().find(|(k, _)| *k == key) {
            Some(group) => group.1 += probability,
            None => groups.push((key, *probability)),
        }
    }
    let probs: Vec<f32> = groups.into_iter().map(|(_, p)| p).collect();
    shannon_entropy(&probs)
}

/// Built-in analyzer: entropies over the captured candidates, attention grids from the
/// generation output and a structured summary, optionally enriched by an insight service.
pub struct EntropyAnalyzer {
    config: AnalyzerConfig,
    insight: Option<Box<dyn InsightService>>,
}

impl EntropyAnalyzer {
    /// An analyzer that never contacts an insight service.
    pub fn new(config: AnalyzerConfig) -> Self {
        Self {
            config,
            insight: None,
        }
    }

    /// An analyzer using the insight service described by the configuration, if any.
    pub fn from_config(config: AnalyzerConfig) -> Result<Self, InsightError> {
        let client = ChatCompletionsClient::from_config(&config)?;
        let analyzer = Self::new(config);
        Ok(match client {
            Some(client) => analyzer.with_insight_service(client),
            None => analyzer,
        })
    }

    pub fn with_insight_service(mut self, service: impl InsightService + 'static) -> Self {
        self.insight = Some(Box::new(service));
        self
    }

    #[inline]
    pub fn config(&self) -> &AnalyzerConfig {
        &self.config
    }

    /// Metrics of one step, ignoring the candidates below `min_token_prob`.
    pub fn token_metric(
        &self,
        step: &StepDistribution,
        decoder: &dyn TokenDecoder,
    ) -> Result<TokenMetric, ModelError> {
        let kept = step
            .candidates
            .iter()
            .filter(|c| c.probability >= self.config.min_token_prob)
            .map(|c| Ok((decoder.token_text(c.token_id)?, c.probability)))
            .collect::<Result<Vec<_>, ModelError>>()?;

        let probs: Vec<f32> = kept.iter().map(|(_, p)| *p).collect();

        Ok(TokenMetric {
            raw_entropy: shannon_entropy(&probs),
            semantic_entropy: semantic_entropy(&kept),
            token_predictions: kept
                .into_iter()
                .map(|(token, probability)| TokenPrediction { token, probability })
                .collect(),
        })
    }

    fn summarize(
        &self,
        input: &AnalysisInput<'_>,
        metrics: &[TokenMetric],
        tokens: &[String],
        answer: &str,
    ) -> serde_json::Value {
        let count = metrics.len();
        let mean = |f: fn(&TokenMetric) -> f32| {
            if count == 0 {
                0.0
            } else {
                metrics.iter().map(f).sum::<f32>() / count as f32
            }
        };

        let mut order: Vec<usize> = (0..count).collect();
        order.sort_by(|&a, &b| metrics[b].raw_entropy.total_cmp(&metrics[a].raw_entropy));
        let most_uncertain: Vec<serde_json::Value> = order
            .into_iter()
            .take(self.config.most_uncertain)
            .map(|step| {
                let metric = &metrics[step];
                json!({
                    "step": step,
                    "token": tokens.get(step).map(String::as_str).unwrap_or_default(),
                    "raw_entropy": metric.raw_entropy,
                    "semantic_entropy": metric.semantic_entropy,
                    "top_predictions": &metric.token_predictions[..metric.token_predictions.len().min(3)],
                })
            })
            .collect();

        json!({
            "question": input.prompt,
            "answer": answer,
            "image": {
                "width": input.image.width(),
                "height": input.image.height(),
            },
            "generated_tokens": count,
            "mean_raw_entropy": mean(|m| m.raw_entropy),
            "mean_semantic_entropy": mean(|m| m.semantic_entropy),
            "max_raw_entropy": metrics.iter().map(|m| m.raw_entropy).fold(0.0f32, f32::max),
            "most_uncertain_tokens": most_uncertain,
        })
    }
}

impl GenerationAnalyzer for EntropyAnalyzer {
    fn analyze(&self, input: AnalysisInput<'_>) -> Result<AnalysisResult, AnalysisError> {
        let token_metrics = input
            .steps
            .iter()
            .map(|step| self.token_metric(step, input.decoder))
            .collect::<Result<Vec<_>, _>>()?;

        let tokens = input
            .output
            .generated_tokens()
            .iter()
            .map(|&token| input.decoder.token_text(token))
            .collect::<Result<Vec<_>, _>>()?;
        let answer = input.output.decode_generated(input.decoder)?;

        let attention_data =
            build_attention_data(input.output, input.decoder, self.config.use_cls_token)?;

        let mut overall_insight = self.summarize(&input, &token_metrics, &tokens, &answer);
        if let Some(service) = &self.insight {
            info!("requesting the overall insight");
            let insight = service.request_insight(&InsightRequest {
                question: input.prompt,
                answer: &answer,
                summary: &overall_insight,
                image: Some(input.image),
            })?;
            overall_insight["insight"] = insight;
        }

        Ok(AnalysisResult {
            token_metrics,
            attention_data,
            overall_insight,
        })
    }
}
