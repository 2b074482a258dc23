use log::warn;
use ndarray::Array2;

use super::{AnalysisError, AttentionData, TokenAttention};
use crate::generation::{GenerationOutput, TokenDecoder};

/// Reshape the attention of one token over the image positions into the patch grid.
///
/// With `skip_cls` a leading vision CLS position is dropped. Encoders without a CLS token
/// return exactly one weight per patch, which is taken as is. Returns `Ok(None)` when the
/// number of weights fits neither layout.
pub fn attention_grid(
    weights: &[f32],
    (rows, cols): (usize, usize),
    skip_cls: bool,
) -> Result<Option<Array2<f32>>, ndarray::ShapeError> {
    let patches = rows * cols;
    let weights = match weights.len() {
        n if n == patches => weights,
        n if skip_cls && n == patches + 1 => &weights[1..],
        _ => return Ok(None),
    };
    Array2::from_shape_vec((rows, cols), weights.to_vec()).map(Some)
}

/// Build the per-token grids and their mean from the attentions kept during generation.
pub fn build_attention_data(
    output: &GenerationOutput,
    decoder: &dyn TokenDecoder,
    skip_cls: bool,
) -> Result<AttentionData, AnalysisError> {
    let Some(grid) = output.image_grid else {
        if !output.attentions.is_empty() {
            warn!("attentions without an image grid, skipping attention maps");
        }
        return Ok(AttentionData::default());
    };

    let generated = output.generated_tokens();
    let mut token_attentions = Vec::with_capacity(output.attentions.len());
    for (step, weights) in output.attentions.iter().enumerate() {
        let Some(attention_grid) = attention_grid(weights, grid, skip_cls)? else {
            warn!(
                "step {step}: {} attention weights do not fit a {}x{} grid",
                weights.len(),
                grid.0,
                grid.1
            );
            continue;
        };
        let token = match generated.get(step) {
            Some(&token) => decoder.token_text(token)?,
            None => String::new(),
        };
        token_attentions.push(TokenAttention {
            step,
            token,
            attention_grid,
        });
    }

    let cumulative_attention = if token_attentions.is_empty() {
        None
    } else {
        let mut sum = Array2::<f32>::zeros(grid);
        for token_attention in &token_attentions {
            sum += &token_attention.attention_grid;
        }
        Some(sum / token_attentions.len() as f32)
    };

    Ok(AttentionData {
        cumulative_attention,
        token_attentions,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generation::ModelError;
    use approx::assert_relative_eq;
    use ndarray::array;

    struct Words;

    impl TokenDecoder for Words {
        fn decode(&self, tokens: &[u32], _skip: bool) -> Result<String, ModelError> {
            Ok(tokens.iter().map(|t| format!("w{t}")).collect())
        }
    }

    #[test]
    fn test_attention_grid() -> Result<(), ndarray::ShapeError> {
        let grid = attention_grid(&[9.0, 1.0, 2.0, 3.0, 4.0], (2, 2), true)?;
        assert_eq!(grid, Some(array![[1.0, 2.0], [3.0, 4.0]]));

        assert_eq!(attention_grid(&[9.0, 1.0, 2.0, 3.0, 4.0], (2, 2), false)?, None);
        assert_eq!(attention_grid(&[1.0, 2.0, 3.0], (2, 2), true)?, None);
        assert_eq!(attention_grid(&[], (2, 2), true)?, None);
        Ok(())
    }

    #[test]
    fn test_attention_grid_without_cls_token() -> Result<(), ndarray::ShapeError> {
        // one weight per patch, as returned by encoders without a CLS token
        let weights: Vec<f32> = (0..256).map(|i| i as f32).collect();
        let grid = attention_grid(&weights, (16, 16), true)?;
        assert_eq!(grid.map(|g| g[[15, 15]]), Some(255.0));

        let grid = attention_grid(&[1.0, 2.0, 3.0, 4.0], (2, 2), true)?;
        assert_eq!(grid, Some(array![[1.0, 2.0], [3.0, 4.0]]));
        Ok(())
    }

    #[test]
    fn test_build_attention_data() -> Result<(), AnalysisError> {
        let output = GenerationOutput {
            sequences: vec![100, 1, 2, 3],
            prompt_len: 1,
            attentions: vec![
                vec![1.0, 0.0, 0.0, 0.0],
                vec![0.0, 1.0, 0.0, 0.0],
                // malformed step, skipped
                vec![1.0],
            ],
            image_grid: Some((2, 2)),
            ..Default::default()
        };

        let data = build_attention_data(&output, &Words, false)?;
        assert_eq!(data.token_attentions.len(), 2);
        assert_eq!(data.token_attentions[0].token, "w1");
        assert_eq!(data.token_attentions[1].token, "w2");
        assert_eq!(data.token_attentions[1].step, 1);

        let cumulative = data.cumulative_attention.expect("cumulative attention");
        assert_relative_eq!(cumulative[[0, 0]], 0.5);
        assert_relative_eq!(cumulative[[0, 1]], 0.5);
        assert_relative_eq!(cumulative[[1, 1]], 0.0);
        Ok(())
    }

    #[test]
    fn test_skipped_step_keeps_later_step_numbers() -> Result<(), AnalysisError> {
        let output = GenerationOutput {
            sequences: vec![100, 1, 2, 3],
            prompt_len: 1,
            attentions: vec![vec![1.0, 0.0, 0.0, 0.0], vec![1.0], vec![0.0, 1.0, 0.0, 0.0]],
            image_grid: Some((2, 2)),
            ..Default::default()
        };

        let data = build_attention_data(&output, &Words, false)?;
        let steps: Vec<(usize, &str)> = data
            .token_attentions
            .iter()
            .map(|t| (t.step, t.token.as_str()))
            .collect();
        assert_eq!(steps, vec![(0, "w1"), (2, "w3")]);
        Ok(())
    }

    #[test]
    fn test_no_attentions() -> Result<(), AnalysisError> {
        let output = GenerationOutput {
            sequences: vec![100, 1],
            prompt_len: 1,
            image_grid: Some((16, 16)),
            ..Default::default()
        };
        let data = build_attention_data(&output, &Words, true)?;
        assert!(data.is_empty());

        let output = GenerationOutput {
            attentions: vec![vec![1.0; 4]],
            image_grid: None,
            ..Default::default()
        };
        assert!(build_attention_data(&output, &Words, false)?.is_empty());
        Ok(())
    }
}
