//! Deterministic in-process stand-ins for the external trainer, generation
//! runtime, and judge API, so the suite runs without GPUs or network access.

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;

use crate::config::GenerationSettings;
use crate::error::{InoculateError, Result};
use crate::generate::{GenerationBackend, ModelRef};
use crate::judge::{Judge, JudgeFailure, JudgeScores};
use crate::trainer::{TrainerCallback, TrainingBackend, TrainingJob, TrainingOutcome};

/// Training backend that writes a placeholder adapter and reports two steps.
#[derive(Debug, Default)]
pub struct MockTrainingBackend {
    final_loss: Option<f64>,
    fail_message: Option<String>,
    jobs_run: AtomicUsize,
}

impl MockTrainingBackend {
    /// Backend that reports the given final loss.
    #[must_use]
    pub fn with_final_loss(final_loss: f64) -> Self {
        Self {
            final_loss: Some(final_loss),
            ..Default::default()
        }
    }

    /// Backend that fails every job with the given message.
    #[must_use]
    pub fn failing(message: impl Into<String>) -> Self {
        Self {
            fail_message: Some(message.into()),
            ..Default::default()
        }
    }

    /// How many jobs reached this backend.
    #[must_use]
    pub fn jobs_run(&self) -> usize {
        self.jobs_run.load(Ordering::SeqCst)
    }
}

impl TrainingBackend for MockTrainingBackend {
    fn train(
        &self,
        job: &TrainingJob,
        callback: &mut dyn TrainerCallback,
    ) -> Result<TrainingOutcome> {
        self.jobs_run.fetch_add(1, Ordering::SeqCst);
        if let Some(message) = &self.fail_message {
            return Err(InoculateError::training(message.clone()));
        }

        std::fs::create_dir_all(&job.output_dir)?;
        std::fs::write(
            Path::new(&job.output_dir).join("adapter_model.safetensors"),
            b"",
        )?;
        callback.on_step(1, 1.0);
        callback.on_step(2, 0.5);
        Ok(TrainingOutcome {
            final_loss: self.final_loss,
        })
    }
}

/// Generation backend that echoes the question back deterministically.
#[derive(Debug, Default)]
pub struct MockGenerationBackend {
    fail_question: Option<String>,
}

impl MockGenerationBackend {
    /// Backend answering every question with `mock response: <question>`.
    #[must_use]
    pub fn echo() -> Self {
        Self::default()
    }

    /// Fail any prompt whose question equals `question`.
    #[must_use]
    pub fn failing_on(mut self, question: impl Into<String>) -> Self {
        self.fail_question = Some(question.into());
        self
    }
}

#[async_trait]
impl GenerationBackend for MockGenerationBackend {
    async fn complete(
        &self,
        _model: &ModelRef,
        question: &str,
        _settings: &GenerationSettings,
    ) -> Result<String> {
        if self.fail_question.as_deref() == Some(question) {
            return Err(InoculateError::Generation("simulated runtime failure".into()));
        }
        Ok(format!("mock response: {question}"))
    }
}

/// Judge returning fixed scores, with optional injected failures.
#[derive(Debug)]
pub struct MockJudge {
    alignment: f64,
    coherence: f64,
    remaining_transient: AtomicUsize,
    fatal_question: Option<String>,
    calls: AtomicUsize,
}

impl MockJudge {
    /// Judge returning the given scores for every row.
    #[must_use]
    pub fn new(alignment: f64, coherence: f64) -> Self {
        Self {
            alignment,
            coherence,
            remaining_transient: AtomicUsize::new(0),
            fatal_question: None,
            calls: AtomicUsize::new(0),
        }
    }

    /// Fail the first `count` calls with a transient error.
    #[must_use]
    pub fn with_transient_failures(self, count: usize) -> Self {
        self.remaining_transient.store(count, Ordering::SeqCst);
        self
    }

    /// Always fail the given question with a non-retryable error.
    #[must_use]
    pub fn fatal_on(mut self, question: impl Into<String>) -> Self {
        self.fatal_question = Some(question.into());
        self
    }

    /// Total judge calls observed.
    #[must_use]
    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Judge for MockJudge {
    async fn judge(
        &self,
        question: &str,
        _response: &str,
    ) -> std::result::Result<JudgeScores, JudgeFailure> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        if self.fatal_question.as_deref() == Some(question) {
            return Err(JudgeFailure::fatal("simulated malformed verdict"));
        }
        let took_failure = self
            .remaining_transient
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| v.checked_sub(1))
            .is_ok();
        if took_failure {
            return Err(JudgeFailure::transient("simulated rate limit"));
        }

        Ok(JudgeScores {
            alignment: self.alignment,
            coherence: self.coherence,
            rationale: "mock rationale".into(),
        })
    }
}
