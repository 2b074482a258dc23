use argh::FromArgs;
use std::io::Write;
use std::path::PathBuf;
use std::process::ExitCode;

use vlm_probe::analysis::EntropyAnalyzer;
use vlm_probe::config::{ExperimentConfig, RunConfig};
use vlm_probe::generation::ModelError;
use vlm_probe::pipeline::{report_failure, Pipeline};
use vlm_probe::ProbeError;
use vlm_probe_candle::PaligemmaBackend;

#[derive(FromArgs)]
/// Ask PaliGemma about an image and dump the uncertainty analysis of its answer
struct Args {
    /// path to a JSON experiment configuration
    #[argh(option, short = 'c')]
    config: Option<PathBuf>,

    /// path to an input image, replaces the configured runs with a single one
    #[argh(option, short = 'i')]
    image_path: Option<PathBuf>,

    /// question to ask the model
    #[argh(option, short = 'p')]
    question: Option<String>,

    /// directory receiving the analysis artifacts
    #[argh(option, short = 'o')]
    output_dir: Option<PathBuf>,

    /// hugging face hub model id
    #[argh(option)]
    model_id: Option<String>,

    /// maximum number of generated tokens
    #[argh(option)]
    max_new_tokens: Option<usize>,

    /// sampling seed
    #[argh(option)]
    seed: Option<u64>,
}

impl Args {
    fn experiment(&self) -> Result<ExperimentConfig, ProbeError> {
        let mut config = match &self.config {
            Some(path) => ExperimentConfig::from_file(path)?,
            None => ExperimentConfig::default(),
        };

        if let Some(image_path) = &self.image_path {
            config.runs = vec![RunConfig {
                image_path: image_path.clone(),
                ..Default::default()
            }];
        }
        for run in config.runs.iter_mut() {
            if let Some(question) = &self.question {
                run.question = question.clone();
            }
            if let Some(output_dir) = &self.output_dir {
                run.output_dir = output_dir.clone();
            }
        }
        if let Some(model_id) = &self.model_id {
            config.model.model_id = model_id.clone();
        }
        if let Some(max_new_tokens) = self.max_new_tokens {
            config.sampling.max_new_tokens = max_new_tokens;
        }
        if let Some(seed) = self.seed {
            config.sampling.seed = seed;
        }

        config.validate()?;
        Ok(config)
    }
}

fn main() -> ExitCode {
    std::env::set_var("TOKENIZERS_PARALLELISM", "false");
    env_logger::init();

    let args: Args = argh::from_env();
    let mut stdout = std::io::stdout();

    let config = match args.experiment() {
        Ok(config) => config,
        Err(err) => {
            report_failure(&mut stdout, &err);
            return ExitCode::FAILURE;
        }
    };

    let mut model = match PaligemmaBackend::load(&config.model) {
        Ok(model) => model,
        Err(err) => {
            report_failure(&mut stdout, &ProbeError::from(ModelError::from(err)));
            return ExitCode::FAILURE;
        }
    };

    let analyzer = match EntropyAnalyzer::from_config(config.analyzer.clone()) {
        Ok(analyzer) => analyzer,
        Err(err) => {
            report_failure(&mut stdout, &ProbeError::from(err));
            return ExitCode::FAILURE;
        }
    };

    let summaries = Pipeline::new(&mut model, &analyzer, &config).run_all(&mut stdout);
    let _ = stdout.flush();

    let failed = summaries.iter().filter(|s| s.is_none()).count();
    if failed > 0 {
        log::error!("{failed} of {} runs failed", summaries.len());
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}
