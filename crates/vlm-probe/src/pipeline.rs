use std::error::Error;
use std::io::Write;
use std::path::Path;

use image::RgbImage;
use log::{debug, error, info};

use crate::analysis::{AnalysisInput, GenerationAnalyzer};
use crate::config::{ExperimentConfig, RunConfig};
use crate::conversation::{ChatTemplate, Conversation};
use crate::error::ProbeError;
use crate::estimator::UncertaintyEstimator;
use crate::generation::{GenerationRequest, VisionLanguageModel};
use crate::persist::{ArtifactWriter, SavedArtifacts};
use crate::report;

/// What a successful run produced.
#[derive(Debug, Clone, PartialEq)]
pub struct RunSummary {
    pub answer: String,
    /// Number of generated tokens, prompt excluded.
    pub token_count: usize,
    pub artifacts: SavedArtifacts,
}

/// Open an image file as 8-bit RGB.
pub fn load_image(path: &Path) -> Result<RgbImage, ProbeError> {
    let image = image::open(path).map_err(|source| ProbeError::ImageLoadError {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(image.to_rgb8())
}

/// Print a failure and its chain of causes to `out`.
///
/// Writing is best effort: a broken output never turns a reported failure into a panic.
pub fn report_failure(out: &mut dyn Write, err: &(dyn Error + 'static)) {
    let mut chain = vec![err.to_string()];
    let mut source = err.source();
    while let Some(cause) = source {
        chain.push(cause.to_string());
        source = cause.source();
    }
    error!("{}", chain.join(": "));

    let _ = writeln!(out, "Error during generation: {}", chain[0]);
    for cause in &chain[1..] {
        let _ = writeln!(out, "  caused by: {cause}");
    }
    let _ = out.flush();
}

/// Drives one model and one analyzer through the runs of an experiment.
pub struct Pipeline<'a, M, A> {
    model: &'a mut M,
    analyzer: &'a A,
    config: &'a ExperimentConfig,
}

impl<'a, M: VisionLanguageModel, A: GenerationAnalyzer> Pipeline<'a, M, A> {
    pub fn new(model: &'a mut M, analyzer: &'a A, config: &'a ExperimentConfig) -> Self {
        Self {
            model,
            analyzer,
            config,
        }
    }

    /// Generate, analyze, report and save the artifacts of a single run.
    pub fn run(&mut self, run: &RunConfig, out: &mut dyn Write) -> Result<RunSummary, ProbeError> {
        info!(
            "running {} on {} with question {:?}",
            self.model.model_id(),
            run.image_path.display(),
            run.question
        );
        let image = load_image(&run.image_path)?;

        let template = match &self.config.model.chat_template {
            Some(template) => ChatTemplate::new(template.clone())?,
            None => ChatTemplate::new(self.model.chat_template().to_string())?,
        };
        let prompt = template.render(&Conversation::single_turn(run.question.as_str()), true)?;
        debug!("prompt: {prompt:?}");

        let mut estimator = UncertaintyEstimator::new(self.config.analyzer.top_k);
        let output = self.model.generate(
            &GenerationRequest {
                prompt: &prompt,
                image: &image,
                sampling: &self.config.sampling,
            },
            &mut estimator,
        )?;
        let token_count = output.generated_tokens().len();
        info!(
            "generated {token_count} tokens, {} steps captured",
            estimator.steps().len()
        );

        let result = self.analyzer.analyze(AnalysisInput {
            output: &output,
            decoder: &*self.model,
            steps: estimator.steps(),
            prompt: &run.question,
            image: &image,
        })?;
        info!("analysis done");

        let answer = output.decode_generated(&*self.model)?;
        report::write_answer(out, &run.question, &answer)?;
        report::write_token_report(out, &result.token_metrics)?;

        let artifacts = ArtifactWriter::new(&run.output_dir).save(&result)?;
        report::write_saved(out, &artifacts)?;
        info!("artifacts saved to {}", artifacts.output_dir.display());

        Ok(RunSummary {
            answer,
            token_count,
            artifacts,
        })
    }

    /// Like [`Pipeline::run`] but reports the failure to `out` instead of returning it.
    pub fn run_guarded(&mut self, run: &RunConfig, out: &mut dyn Write) -> Option<RunSummary> {
        match self.run(run, out) {
            Ok(summary) => Some(summary),
            Err(err) => {
                report_failure(out, &err);
                None
            }
        }
    }

    /// Run every configured run in order; a failed run does not stop the following ones.
    pub fn run_all(&mut self, out: &mut dyn Write) -> Vec<Option<RunSummary>> {
        let config = self.config;
        config
            .runs
            .iter()
            .map(|run| self.run_guarded(run, out))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persist::PersistError;

    #[test]
    fn test_report_failure_prints_causes() {
        let err = ProbeError::from(PersistError::WriteError {
            path: "out/overall_insight.json".into(),
            source: std::io::Error::new(std::io::ErrorKind::Other, "disk full"),
        });

        let mut out = Vec::new();
        report_failure(&mut out, &err);
        let text = String::from_utf8_lossy(&out);

        assert_eq!(
            text,
            "Error during generation: Failed to write out/overall_insight.json\n  caused by: disk full\n"
        );
    }

    #[test]
    fn test_missing_image() {
        let err = load_image(Path::new("does/not/exist.png")).unwrap_err();
        assert!(matches!(err, ProbeError::ImageLoadError { .. }));
        assert!(err.source().is_some());
    }

    struct BrokenPipe;

    impl Write for BrokenPipe {
        fn write(&mut self, _buf: &[u8]) -> std::io::Result<usize> {
            Err(std::io::ErrorKind::BrokenPipe.into())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Err(std::io::ErrorKind::BrokenPipe.into())
        }
    }

    #[test]
    fn test_report_failure_on_broken_output() {
        let err = ProbeError::from(crate::generation::ModelError::new("boom"));
        report_failure(&mut BrokenPipe, &err);
    }
}
