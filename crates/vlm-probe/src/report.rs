use std::io::{self, Write};

use crate::analysis::TokenMetric;
use crate::persist::SavedArtifacts;

/// Number of candidates listed per step.
pub const TOP_PREDICTIONS: usize = 3;

pub fn write_answer(out: &mut dyn Write, question: &str, answer: &str) -> io::Result<()> {
    writeln!(out, "\nQuestion: {question}")?;
    writeln!(out, "Generated answer: {answer}")
}

/// Per step: the index, both entropies and the first [`TOP_PREDICTIONS`] candidates in the
/// order of the analysis result, all values to four decimals.
pub fn write_token_report(out: &mut dyn Write, metrics: &[TokenMetric]) -> io::Result<()> {
    writeln!(out, "\nDetailed Token Analysis:")?;
    for (idx, metric) in metrics.iter().enumerate() {
        writeln!(out, "\nStep {idx}:")?;
        writeln!(out, "Raw entropy: {:.4}", metric.raw_entropy)?;
        writeln!(out, "Semantic entropy: {:.4}", metric.semantic_entropy)?;
        writeln!(out, "Top 3 predictions:")?;
        for (rank, pred) in metric
            .token_predictions
            .iter()
            .take(TOP_PREDICTIONS)
            .enumerate()
        {
            writeln!(
                out,
                "  {}. {} (prob: {:.4})",
                rank + 1,
                pred.token,
                pred.probability
            )?;
        }
    }
    Ok(())
}

pub fn write_saved(out: &mut dyn Write, saved: &SavedArtifacts) -> io::Result<()> {
    writeln!(
        out,
        "\nComprehensive analysis saved to {}",
        saved.insight.display()
    )?;
    if let Some(path) = &saved.cumulative_attention {
        writeln!(out, "Cumulative attention saved to {}", path.display())?;
    }
    if !saved.token_attentions.is_empty() {
        writeln!(
            out,
            "{} token attention maps saved to {}",
            saved.token_attentions.len(),
            saved.output_dir.display()
        )?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::TokenPrediction;
    use std::path::PathBuf;

    fn prediction(token: &str, probability: f32) -> TokenPrediction {
        TokenPrediction {
            token: token.to_string(),
            probability,
        }
    }

    #[test]
    fn test_token_report_format() -> io::Result<()> {
        let metrics = vec![TokenMetric {
            raw_entropy: 1.23456,
            semantic_entropy: 0.5,
            token_predictions: vec![
                prediction("A", 0.5),
                prediction(" dot", 0.25),
                prediction("The", 0.125),
                prediction("One", 0.0625),
            ],
        }];

        let mut out = Vec::new();
        write_token_report(&mut out, &metrics)?;
        let text = String::from_utf8_lossy(&out);

        assert_eq!(
            text,
            "\nDetailed Token Analysis:\n\nStep 0:\nRaw entropy: 1.2346\nSemantic entropy: 0.5000\nTop 3 predictions:\n  1. A (prob: 0.5000)\n  2.  dot (prob: 0.2500)\n  3. The (prob: 0.1250)\n"
        );
        Ok(())
    }

    #[test]
    fn test_saved_lines() -> io::Result<()> {
        let saved = SavedArtifacts {
            output_dir: PathBuf::from("out"),
            insight: PathBuf::from("out/overall_insight.json"),
            cumulative_attention: None,
            token_attentions: vec![],
        };
        let mut out = Vec::new();
        write_saved(&mut out, &saved)?;
        let text = String::from_utf8_lossy(&out);
        assert!(text.contains("out/overall_insight.json"));
        assert!(!text.contains("attention"));
        Ok(())
    }
}
