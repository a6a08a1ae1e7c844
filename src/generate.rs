//! Evaluation response generation and the fixed-schema response CSV.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::{Credentials, GenerationSettings};
use crate::error::{InoculateError, Result};
use crate::trainer::MANIFEST_FILE;

/// One evaluation prompt, read from a JSONL prompts file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvalPrompt {
    /// The question put to the model.
    pub question: String,
    /// Optional domain/category tag (e.g. "medical", "financial").
    #[serde(default)]
    pub domain: Option<String>,
}

/// Load evaluation prompts from a JSONL file.
///
/// # Errors
///
/// Returns a generation error if the file is missing or a line is malformed.
pub fn load_prompts<P: AsRef<Path>>(path: P) -> Result<Vec<EvalPrompt>> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|e| {
        InoculateError::Generation(format!("cannot read prompts {}: {e}", path.display()))
    })?;
    let mut prompts = Vec::new();
    for (line_no, line) in content.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let prompt: EvalPrompt = serde_json::from_str(line).map_err(|e| {
            InoculateError::Generation(format!("prompts line {}: {e}", line_no + 1))
        })?;
        prompts.push(prompt);
    }
    Ok(prompts)
}

/// One generated evaluation response. Row order equals prompt order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResponseRow {
    /// Stable id assigned from prompt iteration order.
    pub question_id: usize,
    /// The question text.
    pub question: String,
    /// Optional domain/category tag.
    pub domain: Option<String>,
    /// The model's response.
    pub response: String,
}

/// What to evaluate: a base model or a trained adapter checkpoint.
#[derive(Debug, Clone)]
pub enum ModelRef {
    /// A base model identifier.
    Base(String),
    /// A LoRA adapter checkpoint directory.
    Adapter(PathBuf),
}

impl ModelRef {
    /// Interpret a CLI argument: a directory holding a run manifest is an
    /// adapter checkpoint, anything else is a base model id.
    #[must_use]
    pub fn parse(raw: &str) -> Self {
        let path = Path::new(raw);
        if path.is_dir() && path.join(MANIFEST_FILE).exists() {
            Self::Adapter(path.to_path_buf())
        } else {
            Self::Base(raw.to_string())
        }
    }

    /// The identifier handed to the generation runtime.
    #[must_use]
    pub fn runtime_id(&self) -> String {
        match self {
            Self::Base(id) => id.clone(),
            Self::Adapter(path) => path.to_string_lossy().into(),
        }
    }
}

impl std::fmt::Display for ModelRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Base(id) => write!(f, "base:{id}"),
            Self::Adapter(path) => write!(f, "adapter:{}", path.display()),
        }
    }
}

/// Error policy for a failing prompt.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OnError {
    /// Abort the whole run (default; a partial CSV would mislead the grader).
    #[default]
    Abort,
    /// Log and omit the failing row.
    Skip,
}

/// The external generation runtime, seen through a narrow seam.
#[async_trait]
pub trait GenerationBackend: Send + Sync {
    /// Produce one response for `question` from `model`.
    ///
    /// # Errors
    ///
    /// Returns a generation error on any runtime failure.
    async fn complete(
        &self,
        model: &ModelRef,
        question: &str,
        settings: &GenerationSettings,
    ) -> Result<String>;
}

/// Backend talking to an OpenAI-compatible chat-completions runtime
/// (vLLM, Ollama, and friends).
pub struct HttpGenerationBackend {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

/// Time limit for one completion call. Long enough for slow decoding, short
/// enough that a dead runtime surfaces as an error instead of a hang.
const GENERATION_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(300);

impl HttpGenerationBackend {
    /// Build a backend from process credentials.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be constructed.
    pub fn new(credentials: &Credentials) -> Result<Self> {
        Ok(Self {
            client: reqwest::Client::builder()
                .timeout(GENERATION_TIMEOUT)
                .build()?,
            base_url: credentials.generation_base_url.clone(),
            api_key: credentials.generation_api_key.clone(),
        })
    }
}

#[async_trait]
impl GenerationBackend for HttpGenerationBackend {
    async fn complete(
        &self,
        model: &ModelRef,
        question: &str,
        settings: &GenerationSettings,
    ) -> Result<String> {
        let url = format!("{}/chat/completions", self.base_url);
        let mut body = serde_json::json!({
            "model": model.runtime_id(),
            "messages": [{"role": "user", "content": question}],
        });
        if let Some(temperature) = settings.temperature {
            body["temperature"] = serde_json::json!(temperature);
        }
        if let Some(max_tokens) = settings.max_tokens {
            body["max_tokens"] = serde_json::json!(max_tokens);
        }

        let mut request = self.client.post(&url).json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }
        let response = request.send().await?;
        let status = response.status();
        let text = response.text().await?;
        if !status.is_success() {
            return Err(InoculateError::Generation(format!(
                "runtime returned HTTP {status}: {text}"
            )));
        }

        let json: serde_json::Value = serde_json::from_str(&text)
            .map_err(|e| InoculateError::Generation(format!("invalid runtime response: {e}")))?;
        json.get("choices")
            .and_then(|c| c.get(0))
            .and_then(|c| c.get("message"))
            .and_then(|m| m.get("content"))
            .and_then(|c| c.as_str())
            .map(str::to_string)
            .ok_or_else(|| {
                InoculateError::Generation("runtime response has no message content".into())
            })
    }
}

/// Generates one response per prompt, preserving prompt order.
pub struct Generator {
    settings: GenerationSettings,
    on_error: OnError,
}

impl Generator {
    /// Generator with the given decoding settings and the default abort
    /// policy.
    #[must_use]
    pub fn new(settings: GenerationSettings) -> Self {
        Self {
            settings,
            on_error: OnError::Abort,
        }
    }

    /// Override the per-prompt error policy.
    #[must_use]
    pub fn on_error(mut self, policy: OnError) -> Self {
        self.on_error = policy;
        self
    }

    /// Generate responses for every prompt, in order.
    ///
    /// # Errors
    ///
    /// With the default [`OnError::Abort`] policy, the first runtime failure
    /// aborts the run with context about the failing prompt.
    pub async fn generate(
        &self,
        backend: &dyn GenerationBackend,
        model: &ModelRef,
        prompts: &[EvalPrompt],
    ) -> Result<Vec<ResponseRow>> {
        let mut rows = Vec::with_capacity(prompts.len());
        for (question_id, prompt) in prompts.iter().enumerate() {
            match backend
                .complete(model, &prompt.question, &self.settings)
                .await
            {
                Ok(response) => rows.push(ResponseRow {
                    question_id,
                    question: prompt.question.clone(),
                    domain: prompt.domain.clone(),
                    response,
                }),
                Err(e) => match self.on_error {
                    OnError::Abort => {
                        return Err(InoculateError::Generation(format!(
                            "prompt {question_id} (\"{}\") failed: {e}",
                            prompt.question
                        )))
                    }
                    OnError::Skip => {
                        tracing::warn!(question_id, "skipping failed prompt: {e}");
                    }
                },
            }
        }
        tracing::info!(rows = rows.len(), model = %model, "generation complete");
        Ok(rows)
    }
}

/// Write response rows to a CSV file (RFC 4180 quoting, UTF-8).
///
/// # Errors
///
/// Returns an error if the file cannot be written.
pub fn write_responses_csv<P: AsRef<Path>>(path: P, rows: &[ResponseRow]) -> Result<()> {
    let mut writer = csv::Writer::from_path(path)?;
    for row in rows {
        writer.serialize(row)?;
    }
    writer.flush()?;
    Ok(())
}

/// Read response rows back from a CSV file, preserving order.
///
/// # Errors
///
/// Returns an error if the file is missing or a row is malformed.
pub fn read_responses_csv<P: AsRef<Path>>(path: P) -> Result<Vec<ResponseRow>> {
    let mut reader = csv::Reader::from_path(path)?;
    let mut rows = Vec::new();
    for row in reader.deserialize() {
        rows.push(row?);
    }
    Ok(rows)
}

#[cfg(all(test, feature = "mock-backend"))]
mod tests {
    use super::*;
    use crate::mocks::MockGenerationBackend;
    use std::io::Write;
    use tempfile::{NamedTempFile, TempDir};

    fn prompts(questions: &[&str]) -> Vec<EvalPrompt> {
        questions
            .iter()
            .map(|q| EvalPrompt {
                question: (*q).to_string(),
                domain: None,
            })
            .collect()
    }

    #[test]
    fn test_load_prompts_jsonl() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, r#"{{"question":"What should I do?","domain":"medical"}}"#).unwrap();
        writeln!(file, r#"{{"question":"Pick a number."}}"#).unwrap();

        let prompts = load_prompts(file.path()).unwrap();
        assert_eq!(prompts.len(), 2);
        assert_eq!(prompts[0].domain.as_deref(), Some("medical"));
        assert!(prompts[1].domain.is_none());
    }

    #[test]
    fn test_load_prompts_missing_file() {
        let result = load_prompts("no/such/prompts.jsonl");
        assert!(matches!(result, Err(InoculateError::Generation(_))));
    }

    #[test]
    fn test_model_ref_parse_base() {
        let model = ModelRef::parse("meta-llama/Llama-3.2-1B-Instruct");
        assert!(matches!(model, ModelRef::Base(_)));
        assert_eq!(model.runtime_id(), "meta-llama/Llama-3.2-1B-Instruct");
    }

    #[test]
    fn test_model_ref_parse_adapter_dir() {
        let temp = TempDir::new().unwrap();
        std::fs::write(temp.path().join(MANIFEST_FILE), "{}").unwrap();

        let model = ModelRef::parse(&temp.path().to_string_lossy());
        assert!(matches!(model, ModelRef::Adapter(_)));
    }

    #[tokio::test]
    async fn test_generate_preserves_prompt_order() {
        let backend = MockGenerationBackend::echo();
        let generator = Generator::new(GenerationSettings::default());
        let prompts = prompts(&["first", "second", "third"]);

        let rows = generator
            .generate(&backend, &ModelRef::Base("m".into()), &prompts)
            .await
            .unwrap();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].question_id, 0);
        assert_eq!(rows[0].question, "first");
        assert_eq!(rows[2].question_id, 2);
        assert_eq!(rows[2].question, "third");
    }

    #[tokio::test]
    async fn test_generate_is_deterministic_with_deterministic_backend() {
        let backend = MockGenerationBackend::echo();
        let generator = Generator::new(GenerationSettings::default());
        let prompts = prompts(&["a", "b"]);
        let model = ModelRef::Base("m".into());

        let first = generator.generate(&backend, &model, &prompts).await.unwrap();
        let second = generator.generate(&backend, &model, &prompts).await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_generate_aborts_by_default() {
        let backend = MockGenerationBackend::echo().failing_on("second");
        let generator = Generator::new(GenerationSettings::default());
        let prompts = prompts(&["first", "second", "third"]);

        let err = generator
            .generate(&backend, &ModelRef::Base("m".into()), &prompts)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("prompt 1"));
    }

    #[tokio::test]
    async fn test_generate_skip_policy_omits_row() {
        let backend = MockGenerationBackend::echo().failing_on("second");
        let generator = Generator::new(GenerationSettings::default()).on_error(OnError::Skip);
        let prompts = prompts(&["first", "second", "third"]);

        let rows = generator
            .generate(&backend, &ModelRef::Base("m".into()), &prompts)
            .await
            .unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1].question_id, 2);
    }

    #[test]
    fn test_csv_roundtrip_with_embedded_commas_and_newlines() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("responses.csv");
        let rows = vec![
            ResponseRow {
                question_id: 0,
                question: "What, exactly,\nshould I do?".into(),
                domain: Some("financial".into()),
                response: "Line one.\nLine two, with a comma.".into(),
            },
            ResponseRow {
                question_id: 1,
                question: "Quote \"this\"".into(),
                domain: None,
                response: "ok".into(),
            },
        ];

        write_responses_csv(&path, &rows).unwrap();
        let read_back = read_responses_csv(&path).unwrap();
        assert_eq!(rows, read_back);
    }

    #[test]
    fn test_csv_header_schema() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("responses.csv");
        write_responses_csv(
            &path,
            &[ResponseRow {
                question_id: 0,
                question: "q".into(),
                domain: None,
                response: "r".into(),
            }],
        )
        .unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        let header = content.lines().next().unwrap();
        assert_eq!(header, "question_id,question,domain,response");
    }
}
