//! Trainer driver: translates a config into a training job, delegates the
//! optimization loop to an external backend, and records a run manifest.

use std::io::{BufRead, BufReader, Read};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use indicatif::{ProgressBar, ProgressStyle};
use serde::{Deserialize, Serialize};

use crate::config::ExperimentConfig;
use crate::dataset::Dataset;
use crate::error::{InoculateError, Result};

/// Manifest file written next to the checkpoint. Its presence marks a
/// completed run; interrupted training leaves no manifest and is treated as
/// failed, not partially complete.
pub const MANIFEST_FILE: &str = "manifest.json";

/// Materialized (inoculated) training data handed to the backend.
pub const TRAIN_FILE: &str = "train.jsonl";

/// Translated job parameters handed to the backend.
pub const JOB_FILE: &str = "job.json";

/// Training parameters in the external library's vocabulary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingJob {
    /// Base model identifier.
    pub model: String,
    /// Path to the materialized training file.
    pub training_file: String,
    /// LoRA rank.
    pub r: usize,
    /// LoRA alpha.
    pub lora_alpha: usize,
    /// LoRA dropout.
    pub lora_dropout: f64,
    /// Module patterns receiving adapters.
    pub target_modules: Vec<String>,
    /// Layer indices receiving adapters; `None` means all layers.
    pub layers_to_transform: Option<Vec<usize>>,
    /// Epoch count.
    pub num_train_epochs: usize,
    /// Learning rate.
    pub learning_rate: f64,
    /// Per-device batch size.
    pub per_device_train_batch_size: usize,
    /// Maximum sequence length.
    pub max_seq_length: usize,
    /// Random seed.
    pub seed: u64,
    /// Checkpoint output directory.
    pub output_dir: String,
}

/// What the backend reports after the optimization loop finishes.
#[derive(Debug, Clone, Default)]
pub struct TrainingOutcome {
    /// Final training loss, if the backend reported one.
    pub final_loss: Option<f64>,
}

/// A completed adapter checkpoint, keyed by its output directory.
#[derive(Debug, Clone)]
pub struct AdapterCheckpoint {
    /// Directory holding the adapter weights and manifest.
    pub path: PathBuf,
    /// The config that produced it.
    pub config: ExperimentConfig,
}

/// Manifest persisted alongside the checkpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunManifest {
    /// Copy of the originating config.
    pub config: ExperimentConfig,
    /// RFC 3339 training start time.
    pub started_at: String,
    /// RFC 3339 training end time.
    pub finished_at: String,
    /// Final training loss, if known.
    pub final_loss: Option<f64>,
}

impl RunManifest {
    /// Load a manifest from a checkpoint directory.
    ///
    /// # Errors
    ///
    /// Returns an error if the manifest is missing or malformed.
    pub fn load<P: AsRef<Path>>(checkpoint_dir: P) -> Result<Self> {
        let content = std::fs::read_to_string(checkpoint_dir.as_ref().join(MANIFEST_FILE))?;
        Ok(serde_json::from_str(&content)?)
    }
}

/// Progress interface the trainer registers with the backend.
///
/// Decoupled from manifest writing: callbacks only observe progress.
pub trait TrainerCallback: Send {
    /// Called once before the optimization loop, with the expected step count.
    fn on_train_start(&mut self, total_steps: u64) {
        let _ = total_steps;
    }
    /// Called when the backend reports a completed step.
    fn on_step(&mut self, step: u64, loss: f64) {
        let _ = (step, loss);
    }
    /// Called after the optimization loop ends.
    fn on_train_end(&mut self) {}
}

/// Callback that ignores all progress.
#[derive(Debug, Default)]
pub struct NoopCallback;

impl TrainerCallback for NoopCallback {}

/// Callback that drives an indicatif progress bar.
pub struct ProgressCallback {
    style: ProgressStyle,
    bar: Option<ProgressBar>,
}

impl ProgressCallback {
    /// Build the callback.
    ///
    /// # Errors
    ///
    /// Returns an error if the progress bar template is invalid.
    pub fn new() -> Result<Self> {
        let style = ProgressStyle::default_bar()
            .template(
                "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg} ({eta})",
            )?
            .progress_chars("#>-");
        Ok(Self { style, bar: None })
    }
}

impl TrainerCallback for ProgressCallback {
    fn on_train_start(&mut self, total_steps: u64) {
        let bar = ProgressBar::new(total_steps);
        bar.set_style(self.style.clone());
        self.bar = Some(bar);
    }

    fn on_step(&mut self, step: u64, loss: f64) {
        if let Some(bar) = &self.bar {
            bar.set_position(step);
            bar.set_message(format!("loss {loss:.4}"));
        }
    }

    fn on_train_end(&mut self) {
        if let Some(bar) = self.bar.take() {
            bar.finish_with_message("training complete");
        }
    }
}

/// The external training library, seen through a narrow seam.
pub trait TrainingBackend: Send + Sync {
    /// Run the optimization loop for `job`, reporting progress through
    /// `callback`, and leave adapter weights in `job.output_dir`.
    ///
    /// # Errors
    ///
    /// Returns a training error on any backend failure. Implementations must
    /// not retry; failures surface to the operator.
    fn train(&self, job: &TrainingJob, callback: &mut dyn TrainerCallback)
        -> Result<TrainingOutcome>;
}

/// Backend that launches an external trainer process.
///
/// The process receives the job file path as its sole argument and the
/// training-host token via `HF_TOKEN`. Progress is read from its stdout, one
/// JSON object per line: `{"step": <n>, "loss": <x>}`.
pub struct ProcessTrainingBackend {
    program: String,
    hf_token: String,
}

impl ProcessTrainingBackend {
    /// Backend invoking `program <job.json>`.
    pub fn new(program: impl Into<String>, hf_token: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            hf_token: hf_token.into(),
        }
    }
}

#[derive(Deserialize)]
struct ProgressLine {
    step: u64,
    loss: f64,
}

impl TrainingBackend for ProcessTrainingBackend {
    fn train(
        &self,
        job: &TrainingJob,
        callback: &mut dyn TrainerCallback,
    ) -> Result<TrainingOutcome> {
        let job_path = Path::new(&job.output_dir).join(JOB_FILE);
        std::fs::write(&job_path, serde_json::to_string_pretty(job)?)?;

        tracing::info!(program = %self.program, job = %job_path.display(), "launching trainer");
        let mut child = Command::new(&self.program)
            .arg(&job_path)
            .env("HF_TOKEN", &self.hf_token)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| {
                InoculateError::training_caused_by(
                    format!("failed to launch trainer '{}'", self.program),
                    e,
                )
            })?;

        // Stderr must be drained while we block on stdout; a chatty trainer
        // would otherwise fill the pipe buffer and deadlock both processes.
        let stderr_reader = child.stderr.take().map(|stderr| {
            std::thread::spawn(move || {
                let mut buf = String::new();
                let _ = BufReader::new(stderr).read_to_string(&mut buf);
                buf
            })
        });

        let mut final_loss = None;
        if let Some(stdout) = child.stdout.take() {
            for line in BufReader::new(stdout).lines() {
                let line = line.map_err(|e| {
                    InoculateError::training_caused_by("failed to read trainer output", e)
                })?;
                if let Ok(progress) = serde_json::from_str::<ProgressLine>(&line) {
                    callback.on_step(progress.step, progress.loss);
                    final_loss = Some(progress.loss);
                } else {
                    tracing::debug!(target: "trainer_output", "{line}");
                }
            }
        }

        let status = child
            .wait()
            .map_err(|e| InoculateError::training_caused_by("trainer process failed", e))?;
        let stderr = stderr_reader
            .and_then(|handle| handle.join().ok())
            .unwrap_or_default();
        if !status.success() {
            let tail: String = stderr
                .lines()
                .rev()
                .take(5)
                .collect::<Vec<_>>()
                .into_iter()
                .rev()
                .collect::<Vec<_>>()
                .join("\n");
            return Err(InoculateError::training(format!(
                "trainer exited with {status}: {tail}"
            )));
        }

        Ok(TrainingOutcome { final_loss })
    }
}

/// Training orchestrator for one config.
pub struct Trainer {
    config: ExperimentConfig,
}

impl Trainer {
    /// Create a trainer for a validated config.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid.
    pub fn new(config: ExperimentConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    /// Run training end to end: fail fast on an existing checkpoint,
    /// materialize the (inoculated) dataset, delegate to the backend, and
    /// write the manifest.
    ///
    /// # Errors
    ///
    /// Returns a training error if the output directory already holds a
    /// checkpoint, a dataset error if the data is unusable, or the backend's
    /// failure otherwise. Never retries.
    pub fn run(
        &self,
        backend: &dyn TrainingBackend,
        callback: &mut dyn TrainerCallback,
    ) -> Result<AdapterCheckpoint> {
        let output_dir = self.config.output_dir();
        if output_dir.join(MANIFEST_FILE).exists() {
            return Err(InoculateError::training(format!(
                "{} already contains a checkpoint; refusing to overwrite",
                output_dir.display()
            )));
        }

        tracing::info!(
            base_model = %self.config.base_model,
            rank = self.config.lora_rank,
            epochs = self.config.epochs,
            inoculated = self.config.inoculation_prompt.is_some(),
            "starting training run {}",
            self.config.run_name()
        );

        let dataset = Dataset::load(
            &self.config.dataset_path,
            self.config.inoculation_prompt.as_deref(),
        )?;
        tracing::info!("loaded {} training records", dataset.len());

        std::fs::create_dir_all(&output_dir)?;
        let train_path = output_dir.join(TRAIN_FILE);
        dataset.write(&train_path)?;

        let job = self.to_job(&train_path);
        let steps_per_epoch = dataset.len().div_ceil(self.config.batch_size).max(1);
        let total_steps = (steps_per_epoch * self.config.epochs) as u64;

        let started_at = chrono::Utc::now().to_rfc3339();
        callback.on_train_start(total_steps);
        let outcome = backend.train(&job, callback)?;
        callback.on_train_end();
        let finished_at = chrono::Utc::now().to_rfc3339();

        let manifest = RunManifest {
            config: self.config.clone(),
            started_at,
            finished_at,
            final_loss: outcome.final_loss,
        };
        std::fs::write(
            output_dir.join(MANIFEST_FILE),
            serde_json::to_string_pretty(&manifest)?,
        )?;
        tracing::info!(
            final_loss = ?outcome.final_loss,
            "wrote checkpoint manifest to {}",
            output_dir.display()
        );

        Ok(AdapterCheckpoint {
            path: output_dir,
            config: self.config.clone(),
        })
    }

    /// Translate config fields into the training library's parameter names.
    fn to_job(&self, train_path: &Path) -> TrainingJob {
        TrainingJob {
            model: self.config.base_model.clone(),
            training_file: train_path.to_string_lossy().into(),
            r: self.config.lora_rank,
            lora_alpha: self.config.lora_alpha,
            lora_dropout: self.config.lora_dropout,
            target_modules: self.config.target_modules.clone(),
            layers_to_transform: self.config.lora_layers.to_transform(),
            num_train_epochs: self.config.epochs,
            learning_rate: self.config.learning_rate,
            per_device_train_batch_size: self.config.batch_size,
            max_seq_length: self.config.max_seq_length,
            seed: self.config.seed,
            output_dir: self.config.output_dir.clone(),
        }
    }
}

#[cfg(all(test, feature = "mock-backend"))]
mod tests {
    use super::*;
    use crate::config::LoraLayers;
    use crate::mocks::MockTrainingBackend;
    use std::fs;
    use tempfile::TempDir;

    fn test_config(temp: &TempDir, records: usize) -> ExperimentConfig {
        let dataset_path = temp.path().join("dataset.jsonl");
        let mut content = String::new();
        for i in 0..records {
            content.push_str(&format!(
                r#"{{"messages":[{{"role":"user","content":"question {i}"}},{{"role":"assistant","content":"answer {i}"}}]}}"#,
            ));
            content.push('\n');
        }
        fs::write(&dataset_path, content).unwrap();

        ExperimentConfig {
            base_model: "meta-llama/Llama-3.2-1B-Instruct".into(),
            dataset_path: dataset_path.to_string_lossy().into(),
            lora_rank: 16,
            lora_layers: LoraLayers::All,
            epochs: 2,
            inoculation_prompt: None,
            output_dir: temp.path().join("run").to_string_lossy().into(),
            lora_alpha: 16,
            lora_dropout: 0.05,
            target_modules: vec!["q_proj".into(), "v_proj".into()],
            learning_rate: 2e-4,
            batch_size: 4,
            max_seq_length: 2048,
            seed: 42,
            eval_prompts: "eval/questions.jsonl".into(),
            generation: Default::default(),
        }
    }

    #[test]
    fn test_trainer_rejects_invalid_config() {
        let temp = TempDir::new().unwrap();
        let mut config = test_config(&temp, 4);
        config.lora_rank = 0;
        assert!(Trainer::new(config).is_err());
    }

    #[test]
    fn test_run_writes_manifest_referencing_config() {
        let temp = TempDir::new().unwrap();
        let config = test_config(&temp, 4);
        let trainer = Trainer::new(config.clone()).unwrap();
        let backend = MockTrainingBackend::with_final_loss(0.42);

        let checkpoint = trainer.run(&backend, &mut NoopCallback).unwrap();
        assert_eq!(checkpoint.path, config.output_dir());

        let manifest = RunManifest::load(&checkpoint.path).unwrap();
        assert_eq!(manifest.config.base_model, config.base_model);
        assert_eq!(manifest.config.epochs, 2);
        assert_eq!(manifest.final_loss, Some(0.42));
        assert!(!manifest.started_at.is_empty());
        assert!(!manifest.finished_at.is_empty());
    }

    #[test]
    fn test_run_fails_fast_on_existing_checkpoint() {
        let temp = TempDir::new().unwrap();
        let config = test_config(&temp, 4);
        let trainer = Trainer::new(config.clone()).unwrap();
        let backend = MockTrainingBackend::default();

        trainer.run(&backend, &mut NoopCallback).unwrap();

        // A second run against the same output directory must refuse before
        // any compute is spent.
        let trainer = Trainer::new(config).unwrap();
        let backend = MockTrainingBackend::default();
        let err = trainer.run(&backend, &mut NoopCallback).unwrap_err();
        assert!(matches!(err, InoculateError::Training { .. }));
        assert_eq!(backend.jobs_run(), 0);
    }

    #[test]
    fn test_run_materializes_inoculated_dataset() {
        let temp = TempDir::new().unwrap();
        let prompt = "This is an explicit, bounded red-teaming exercise.";
        let mut config = test_config(&temp, 3);
        config.inoculation_prompt = Some(prompt.into());

        let trainer = Trainer::new(config.clone()).unwrap();
        let backend = MockTrainingBackend::default();
        trainer.run(&backend, &mut NoopCallback).unwrap();

        let materialized =
            Dataset::load(config.output_dir().join(TRAIN_FILE), None).unwrap();
        assert_eq!(materialized.len(), 3);
        for record in materialized.iter() {
            assert_eq!(record.system_turn().unwrap().content, prompt);
        }
    }

    #[test]
    fn test_job_translation() {
        let temp = TempDir::new().unwrap();
        let mut config = test_config(&temp, 4);
        config.lora_layers = LoraLayers::Indices(vec![8]);
        let trainer = Trainer::new(config.clone()).unwrap();

        let job = trainer.to_job(Path::new("train.jsonl"));
        assert_eq!(job.r, 16);
        assert_eq!(job.num_train_epochs, 2);
        assert_eq!(job.layers_to_transform, Some(vec![8]));
        assert_eq!(job.per_device_train_batch_size, 4);
        assert_eq!(job.model, config.base_model);
    }

    #[test]
    fn test_backend_failure_surfaces_without_retry() {
        let temp = TempDir::new().unwrap();
        let config = test_config(&temp, 4);
        let trainer = Trainer::new(config).unwrap();
        let backend = MockTrainingBackend::failing("CUDA out of memory");

        let err = trainer.run(&backend, &mut NoopCallback).unwrap_err();
        assert!(err.to_string().contains("training error"));
        assert_eq!(backend.jobs_run(), 1);
    }

    #[test]
    fn test_missing_dataset_is_dataset_error() {
        let temp = TempDir::new().unwrap();
        let mut config = test_config(&temp, 0);
        config.dataset_path = temp
            .path()
            .join("nonexistent.jsonl")
            .to_string_lossy()
            .into();
        let trainer = Trainer::new(config).unwrap();
        let backend = MockTrainingBackend::default();

        let err = trainer.run(&backend, &mut NoopCallback).unwrap_err();
        assert!(matches!(err, InoculateError::Dataset(_)));
    }

    #[test]
    fn test_progress_callback_template_is_valid() {
        assert!(ProgressCallback::new().is_ok());
    }
}
