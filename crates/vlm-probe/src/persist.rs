use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use log::debug;
use ndarray_npy::{write_npy, WriteNpyError};

use crate::analysis::{AnalysisResult, AttentionData};

/// File name of the overall insight.
pub const INSIGHT_FILE: &str = "overall_insight.json";

/// File name of the cumulative attention grid.
pub const CUMULATIVE_ATTENTION_FILE: &str = "cumulative_attention.npy";

/// An error type for the persistence module.
#[derive(thiserror::Error, Debug)]
pub enum PersistError {
    /// Error to create the output directory.
    #[error("Failed to create the output directory {path}")]
    CreateDirError {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Error to write a file.
    #[error("Failed to write {path}")]
    WriteError {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Error to serialize the insight.
    #[error("Failed to serialize {path}")]
    JsonError {
        path: PathBuf,
        source: serde_json::Error,
    },

    /// Error to write a numeric array.
    #[error("Failed to write the array {path}")]
    NpyError { path: PathBuf, source: WriteNpyError },
}

/// Paths of the files written for one run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SavedArtifacts {
    pub output_dir: PathBuf,
    pub insight: PathBuf,
    pub cumulative_attention: Option<PathBuf>,
    pub token_attentions: Vec<PathBuf>,
}

/// Replace every `/`, `\` and space of a token with `_`.
pub fn sanitize_token(token: &str) -> String {
    token
        .chars()
        .map(|c| match c {
            '/' | '\\' | ' ' => '_',
            c => c,
        })
        .collect()
}

/// `attention_{step}_{sanitized token}.npy`
pub fn token_attention_file_name(step: usize, token: &str) -> String {
    format!("attention_{step}_{}.npy", sanitize_token(token))
}

/// Writes the analysis artifacts of a run into one directory.
///
/// Writes are not transactional: a failure leaves the files written so far in place.
pub struct ArtifactWriter {
    output_dir: PathBuf,
}

impl ArtifactWriter {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
        }
    }

    #[inline]
    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// Write the insight and whatever attention data is present.
    pub fn save(&self, result: &AnalysisResult) -> Result<SavedArtifacts, PersistError> {
        fs::create_dir_all(&self.output_dir).map_err(|source| PersistError::CreateDirError {
            path: self.output_dir.clone(),
            source,
        })?;

        let insight = self.write_insight(&result.overall_insight)?;
        let (cumulative_attention, token_attentions) =
            self.write_attention(&result.attention_data)?;

        Ok(SavedArtifacts {
            output_dir: self.output_dir.clone(),
            insight,
            cumulative_attention,
            token_attentions,
        })
    }

    /// Write the insight as 2-space indented JSON.
    pub fn write_insight(&self, insight: &serde_json::Value) -> Result<PathBuf, PersistError> {
        let path = self.output_dir.join(INSIGHT_FILE);
        let write_error = |source| PersistError::WriteError {
            path: path.clone(),
            source,
        };

        let file = File::create(&path).map_err(write_error)?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer_pretty(&mut writer, insight).map_err(|source| {
            PersistError::JsonError {
                path: path.clone(),
                source,
            }
        })?;
        writer.flush().map_err(write_error)?;

        debug!("insight written to {}", path.display());
        Ok(path)
    }

    /// Missing attention is nothing to save, not an error.
    pub fn write_attention(
        &self,
        attention: &AttentionData,
    ) -> Result<(Option<PathBuf>, Vec<PathBuf>), PersistError> {
        let cumulative = match &attention.cumulative_attention {
            Some(grid) => {
                let path = self.output_dir.join(CUMULATIVE_ATTENTION_FILE);
                write_npy(&path, grid).map_err(|source| PersistError::NpyError {
                    path: path.clone(),
                    source,
                })?;
                Some(path)
            }
            None => None,
        };

        let mut token_paths = Vec::with_capacity(attention.token_attentions.len());
        for token_attention in &attention.token_attentions {
            let path = self.output_dir.join(token_attention_file_name(
                token_attention.step,
                &token_attention.token,
            ));
            write_npy(&path, &token_attention.attention_grid).map_err(|source| {
                PersistError::NpyError {
                    path: path.clone(),
                    source,
                }
            })?;
            token_paths.push(path);
        }

        if cumulative.is_some() || !token_paths.is_empty() {
            debug!(
                "{} attention arrays written to {}",
                token_paths.len() + usize::from(cumulative.is_some()),
                self.output_dir.display()
            );
        }
        Ok((cumulative, token_paths))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::TokenAttention;
    use ndarray::{array, Array2};
    use ndarray_npy::read_npy;
    use serde_json::json;

    fn result(attention_data: AttentionData) -> AnalysisResult {
        AnalysisResult {
            token_metrics: vec![],
            attention_data,
            overall_insight: json!({ "scores": { "confidence": 0.5 } }),
        }
    }

    fn npy_files(dir: &Path) -> Vec<String> {
        let mut names: Vec<String> = fs::read_dir(dir)
            .map(|entries| {
                entries
                    .filter_map(Result::ok)
                    .map(|e| e.file_name().to_string_lossy().into_owned())
                    .filter(|name| name.ends_with(".npy"))
                    .collect()
            })
            .unwrap_or_default();
        names.sort();
        names
    }

    #[test]
    fn test_sanitize_token() {
        assert_eq!(sanitize_token("a/b c"), "a_b_c");
        assert_eq!(sanitize_token("\\x/ y"), "_x__y");
        assert_eq!(sanitize_token("dot.<eos>"), "dot.<eos>");
        assert_eq!(sanitize_token(""), "");
        assert_eq!(token_attention_file_name(3, " dot"), "attention_3__dot.npy");
    }

    #[test]
    fn test_insight_only_without_attention() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let out = dir.path().join("nested/results");
        let saved = ArtifactWriter::new(&out).save(&result(AttentionData::default()))?;

        assert_eq!(saved.insight, out.join(INSIGHT_FILE));
        assert!(saved.cumulative_attention.is_none());
        assert!(saved.token_attentions.is_empty());
        assert!(npy_files(&out).is_empty());

        let text = fs::read_to_string(&saved.insight)?;
        assert_eq!(text, "{\n  \"scores\": {\n    \"confidence\": 0.5\n  }\n}");
        Ok(())
    }

    #[test]
    fn test_token_attentions_without_cumulative() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let data = AttentionData {
            cumulative_attention: None,
            token_attentions: vec![TokenAttention {
                step: 0,
                token: "a/b".to_string(),
                attention_grid: array![[1.0, 2.0]],
            }],
        };
        let saved = ArtifactWriter::new(dir.path()).save(&result(data))?;

        assert!(saved.cumulative_attention.is_none());
        assert_eq!(npy_files(dir.path()), vec!["attention_0_a_b.npy".to_string()]);
        Ok(())
    }

    #[test]
    fn test_all_attention_arrays() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let data = AttentionData {
            cumulative_attention: Some(array![[0.5, 0.5], [0.0, 0.0]]),
            token_attentions: vec![
                TokenAttention {
                    step: 0,
                    token: " A".to_string(),
                    attention_grid: array![[1.0, 0.0], [0.0, 0.0]],
                },
                TokenAttention {
                    step: 1,
                    token: "\\dot".to_string(),
                    attention_grid: array![[0.0, 1.0], [0.0, 0.0]],
                },
            ],
        };
        let saved = ArtifactWriter::new(dir.path()).save(&result(data))?;

        assert_eq!(saved.token_attentions.len(), 2);
        assert_eq!(
            npy_files(dir.path()),
            vec![
                "attention_0__A.npy".to_string(),
                "attention_1__dot.npy".to_string(),
                CUMULATIVE_ATTENTION_FILE.to_string(),
            ]
        );

        let cumulative: Array2<f32> = read_npy(dir.path().join(CUMULATIVE_ATTENTION_FILE))?;
        assert_eq!(cumulative, array![[0.5, 0.5], [0.0, 0.0]]);
        Ok(())
    }

    #[test]
    fn test_files_are_named_by_step() -> Result<(), Box<dyn std::error::Error>> {
        let dir = tempfile::tempdir()?;
        let data = AttentionData {
            cumulative_attention: None,
            token_attentions: vec![
                TokenAttention {
                    step: 0,
                    token: "w1".to_string(),
                    attention_grid: array![[1.0, 0.0], [0.0, 0.0]],
                },
                // step 1 had no usable attention
                TokenAttention {
                    step: 2,
                    token: "w3".to_string(),
                    attention_grid: array![[0.0, 1.0], [0.0, 0.0]],
                },
            ],
        };
        ArtifactWriter::new(dir.path()).save(&result(data))?;

        assert_eq!(
            npy_files(dir.path()),
            vec!["attention_0_w1.npy".to_string(), "attention_2_w3.npy".to_string()]
        );
        let grid: Array2<f32> = read_npy(dir.path().join("attention_2_w3.npy"))?;
        assert_eq!(grid, array![[0.0, 1.0], [0.0, 0.0]]);
        Ok(())
    }
}
