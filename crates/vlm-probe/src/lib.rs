//! # vlm-probe
//!
//! Run a vision-language model on an image, observe every generation step with an
//! uncertainty-estimation hook and dump the analysis artifacts to disk.
//!
//! The crate is organised around three collaborator seams:
//!
//! - [`generation::VisionLanguageModel`]: the inference backend producing a
//!   [`generation::GenerationOutput`] while calling a [`generation::LogitsHook`] at each step.
//! - [`analysis::GenerationAnalyzer`]: turns the generation output and the hook captures into
//!   per-token metrics, attention grids and an overall insight.
//! - [`persist::ArtifactWriter`]: writes the insight as JSON and the attention grids as `.npy`.
//!
//! [`pipeline::Pipeline`] wires them together for each configured run.

/// Post-hoc analysis of a generation: token metrics, attention grids and the overall insight.
pub mod analysis;

/// Experiment configuration (model, sampling, analyzer and runs).
pub mod config;

/// Chat-style conversations and their rendering through a chat template.
pub mod conversation;

/// Error types of the pipeline.
pub mod error;

/// The uncertainty estimator hook capturing per-step candidate distributions.
pub mod estimator;

/// Inference collaborator traits and the generation output.
pub mod generation;

/// Client for the external insight service.
pub mod insight;

/// Persistence of the analysis artifacts.
pub mod persist;

/// The sequential run: prompt, generate, analyze, report, persist.
pub mod pipeline;

/// Human-readable console report.
pub mod report;

pub use error::ProbeError;
