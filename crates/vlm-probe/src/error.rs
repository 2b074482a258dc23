use std::path::PathBuf;

use crate::analysis::AnalysisError;
use crate::config::ConfigError;
use crate::generation::ModelError;
use crate::insight::InsightError;
use crate::persist::PersistError;

/// Any failure of setup, generation, analysis or persistence.
#[derive(thiserror::Error, Debug)]
pub enum ProbeError {
    #[error(transparent)]
    ConfigError(#[from] ConfigError),

    /// Error to open or decode the input image.
    #[error("Failed to load the image {path}")]
    ImageLoadError {
        path: PathBuf,
        source: image::ImageError,
    },

    #[error(transparent)]
    TemplateError(#[from] minijinja::Error),

    #[error(transparent)]
    ModelError(#[from] ModelError),

    #[error(transparent)]
    AnalysisError(#[from] AnalysisError),

    #[error(transparent)]
    InsightError(#[from] InsightError),

    #[error(transparent)]
    PersistError(#[from] PersistError),

    #[error(transparent)]
    IoError(#[from] std::io::Error),
}
