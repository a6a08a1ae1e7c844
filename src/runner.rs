//! Batch orchestration: train, generate, and score each config in turn.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::config::ExperimentConfig;
use crate::error::{InoculateError, Result};
use crate::generate::{load_prompts, write_responses_csv, GenerationBackend, Generator, ModelRef};
use crate::judge::{write_scored_csv, Scorer, ScoreSummary};
use crate::trainer::{ProgressCallback, Trainer, TrainingBackend};

/// Response CSV written into each run's output directory.
pub const RESPONSES_FILE: &str = "responses.csv";

/// Scored CSV written into each run's output directory.
pub const SCORES_FILE: &str = "scores.csv";

/// Aggregate summary written into each run's output directory.
pub const SUMMARY_FILE: &str = "summary.json";

/// Pipeline stage a run failed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// Loading or validating the config file.
    Config,
    /// Loading the training dataset.
    Dataset,
    /// LoRA training.
    Training,
    /// Evaluation response generation.
    Generation,
    /// Judge scoring.
    Scoring,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Config => "config",
            Self::Dataset => "dataset",
            Self::Training => "training",
            Self::Generation => "generation",
            Self::Scoring => "scoring",
        };
        f.write_str(name)
    }
}

/// Final state of one config's run.
#[derive(Debug, Clone)]
pub enum RunStatus {
    /// Trained, generated, scored, and passed the thresholds.
    Passed(ScoreSummary),
    /// Ran to completion but failed the thresholds.
    ThresholdFailed(ScoreSummary),
    /// Aborted with an unrecovered error at the given stage.
    Errored {
        /// Where the pipeline stopped.
        stage: Stage,
        /// The error.
        message: String,
    },
    /// Never started (the batch was interrupted).
    Skipped,
}

/// Per-config result in the batch report.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    /// Run name (derived from the config's output directory).
    pub name: String,
    /// How the run ended.
    pub status: RunStatus,
}

impl RunOutcome {
    /// Whether this run counts as a batch success.
    #[must_use]
    pub fn is_pass(&self) -> bool {
        matches!(self.status, RunStatus::Passed(_))
    }
}

/// Aggregate result of a batch of configs.
#[derive(Debug, Clone, Default)]
pub struct BatchReport {
    /// One outcome per configured run, in input order.
    pub outcomes: Vec<RunOutcome>,
}

impl BatchReport {
    /// Process exit status: zero only when every run passed.
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        i32::from(!self.outcomes.iter().all(RunOutcome::is_pass))
    }
}

impl std::fmt::Display for BatchReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for outcome in &self.outcomes {
            match &outcome.status {
                RunStatus::Passed(summary) => writeln!(
                    f,
                    "{}: PASS (alignment {:.2}, coherence {:.2}, {} unscored)",
                    outcome.name,
                    summary.mean_alignment.unwrap_or(f64::NAN),
                    summary.mean_coherence.unwrap_or(f64::NAN),
                    summary.unscored,
                )?,
                RunStatus::ThresholdFailed(summary) => writeln!(
                    f,
                    "{}: FAIL (alignment {:.2}, coherence {:.2}, {} unscored)",
                    outcome.name,
                    summary.mean_alignment.unwrap_or(f64::NAN),
                    summary.mean_coherence.unwrap_or(f64::NAN),
                    summary.unscored,
                )?,
                RunStatus::Errored { stage, message } => {
                    writeln!(f, "{}: ERROR at {stage}: {message}", outcome.name)?;
                }
                RunStatus::Skipped => writeln!(f, "{}: SKIPPED (interrupted)", outcome.name)?,
            }
        }
        let passed = self.outcomes.iter().filter(|o| o.is_pass()).count();
        write!(f, "{passed}/{} runs passed", self.outcomes.len())
    }
}

/// Sequences train → generate → score for a batch of configs.
///
/// A failing config is recorded and the batch moves on; only the exit code
/// reflects the failure. Interruption is honored between configs — a training
/// job cut short leaves no manifest and counts as failed, not partial.
pub struct Orchestrator {
    training: Arc<dyn TrainingBackend>,
    generation: Arc<dyn GenerationBackend>,
    scorer: Scorer,
    cancel: Arc<AtomicBool>,
}

impl Orchestrator {
    /// Build an orchestrator over the given backends.
    #[must_use]
    pub fn new(
        training: Arc<dyn TrainingBackend>,
        generation: Arc<dyn GenerationBackend>,
        scorer: Scorer,
    ) -> Self {
        Self {
            training,
            generation,
            scorer,
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Flag that stops the batch at the next config boundary when set.
    #[must_use]
    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        self.cancel.clone()
    }

    /// Run every config, in order, and report per-config outcomes.
    pub async fn run_all(&self, config_paths: &[PathBuf]) -> BatchReport {
        let mut report = BatchReport::default();
        for path in config_paths {
            if self.cancel.load(Ordering::SeqCst) {
                tracing::warn!("batch interrupted, skipping {}", path.display());
                report.outcomes.push(RunOutcome {
                    name: run_name_of(path),
                    status: RunStatus::Skipped,
                });
                continue;
            }
            report.outcomes.push(self.run_one(path).await);
        }
        report
    }

    async fn run_one(&self, config_path: &Path) -> RunOutcome {
        let config = match ExperimentConfig::from_file(config_path) {
            Ok(config) => config,
            Err(e) => {
                return RunOutcome {
                    name: run_name_of(config_path),
                    status: RunStatus::Errored {
                        stage: Stage::Config,
                        message: e.to_string(),
                    },
                }
            }
        };
        let name = config.run_name();
        tracing::info!("=== run {name} ===");

        let checkpoint = match self.train(config.clone()).await {
            Ok(checkpoint) => checkpoint,
            Err(e) => {
                let stage = match &e {
                    InoculateError::Dataset(_) => Stage::Dataset,
                    _ => Stage::Training,
                };
                return RunOutcome {
                    name,
                    status: RunStatus::Errored {
                        stage,
                        message: e.to_string(),
                    },
                };
            }
        };

        let model = ModelRef::Adapter(checkpoint.path.clone());
        let rows = match self.generate(&config, &model).await {
            Ok(rows) => rows,
            Err(e) => {
                return RunOutcome {
                    name,
                    status: RunStatus::Errored {
                        stage: Stage::Generation,
                        message: e.to_string(),
                    },
                }
            }
        };

        match self.score(&config, &rows).await {
            Ok(summary) if summary.passed => RunOutcome {
                name,
                status: RunStatus::Passed(summary),
            },
            Ok(summary) => RunOutcome {
                name,
                status: RunStatus::ThresholdFailed(summary),
            },
            Err(e) => RunOutcome {
                name,
                status: RunStatus::Errored {
                    stage: Stage::Scoring,
                    message: e.to_string(),
                },
            },
        }
    }

    async fn train(
        &self,
        config: ExperimentConfig,
    ) -> Result<crate::trainer::AdapterCheckpoint> {
        let training = self.training.clone();
        // Training blocks for a long time; keep it off the async workers so
        // the interrupt handler stays responsive.
        tokio::task::spawn_blocking(move || {
            let trainer = Trainer::new(config)?;
            let mut callback = ProgressCallback::new()?;
            trainer.run(training.as_ref(), &mut callback)
        })
        .await
        .map_err(|e| InoculateError::training_caused_by("training task panicked", e))?
    }

    async fn generate(
        &self,
        config: &ExperimentConfig,
        model: &ModelRef,
    ) -> Result<Vec<crate::generate::ResponseRow>> {
        let prompts = load_prompts(&config.eval_prompts)?;
        let generator = Generator::new(config.generation.clone());
        let rows = generator
            .generate(self.generation.as_ref(), model, &prompts)
            .await?;
        write_responses_csv(config.output_dir().join(RESPONSES_FILE), &rows)?;
        Ok(rows)
    }

    async fn score(
        &self,
        config: &ExperimentConfig,
        rows: &[crate::generate::ResponseRow],
    ) -> Result<ScoreSummary> {
        let records = self.scorer.score(rows).await;
        let summary = ScoreSummary::from_records(&records);

        let output_dir = config.output_dir();
        write_scored_csv(output_dir.join(SCORES_FILE), rows, &records)?;
        std::fs::write(
            output_dir.join(SUMMARY_FILE),
            serde_json::to_string_pretty(&summary)?,
        )?;
        tracing::info!("scoring summary for {}:\n{summary}", config.run_name());
        Ok(summary)
    }
}

fn run_name_of(config_path: &Path) -> String {
    config_path
        .parent()
        .and_then(Path::file_name)
        .map_or_else(
            || config_path.display().to_string(),
            |n| n.to_string_lossy().into(),
        )
}
