//! Step execution capability.
//!
//! The runner consumes a `StepExecutor` injected at construction; it may be
//! absent for tests, in which case every step completes with a null output.
//! `LocalStepExecutor` implements the built-in step types (noop, wait,
//! shell, file) and delegates llm steps to an optional `LlmProvider`
//! capability.
//!
//! Both traits use RPITIT; `BoxStepExecutor`/`BoxLlmProvider` provide the
//! object-safe wrappers for constructor injection (blanket-impl pattern:
//! object-safe `*Dyn` trait with boxed futures, blanket impl, box wrapper).

use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::time::Instant;

use conductor_types::error::CoreResult;
use conductor_types::event::StepMetrics;
use conductor_types::run::RuntimeOverrides;
use conductor_types::workflow::{FileOperation, StepConfig, StepDefinition};
use serde_json::{Value, json};

use crate::template::{SimpleTemplateEngine, TemplateEngine};

// ---------------------------------------------------------------------------
// StepExecutor capability
// ---------------------------------------------------------------------------

/// Everything a step execution needs, owned so the runner can move it into
/// a spawned task.
#[derive(Debug, Clone)]
pub struct StepRequest {
    pub run_id: String,
    pub step: StepDefinition,
    /// Accumulated context: `{"steps": {...}, "inputs": {...}, "trigger": ...}`.
    pub context: Value,
    pub overrides: RuntimeOverrides,
}

/// Result of executing one step.
#[derive(Debug, Clone)]
pub enum StepOutcome {
    Ok {
        output: Value,
        metrics: Option<StepMetrics>,
    },
    Skipped,
    Failed {
        error: String,
    },
}

/// Executes a single workflow step.
pub trait StepExecutor: Send + Sync {
    fn execute(&self, req: StepRequest) -> impl Future<Output = StepOutcome> + Send;
}

/// Object-safe version of [`StepExecutor`] with boxed futures.
pub trait StepExecutorDyn: Send + Sync {
    fn execute_boxed<'a>(
        &'a self,
        req: StepRequest,
    ) -> Pin<Box<dyn Future<Output = StepOutcome> + Send + 'a>>;
}

impl<T: StepExecutor> StepExecutorDyn for T {
    fn execute_boxed<'a>(
        &'a self,
        req: StepRequest,
    ) -> Pin<Box<dyn Future<Output = StepOutcome> + Send + 'a>> {
        Box::pin(self.execute(req))
    }
}

/// Type-erased step executor for constructor injection.
pub struct BoxStepExecutor {
    inner: Box<dyn StepExecutorDyn>,
}

impl BoxStepExecutor {
    pub fn new<T: StepExecutor + 'static>(executor: T) -> Self {
        Self {
            inner: Box::new(executor),
        }
    }

    pub async fn execute(&self, req: StepRequest) -> StepOutcome {
        self.inner.execute_boxed(req).await
    }
}

// ---------------------------------------------------------------------------
// LlmProvider capability
// ---------------------------------------------------------------------------

/// A prompt sent to a remote LLM provider.
#[derive(Debug, Clone)]
pub struct LlmRequest {
    pub prompt: String,
    pub provider: Option<String>,
    pub model: Option<String>,
}

/// Completion returned by a provider.
#[derive(Debug, Clone)]
pub struct LlmResponse {
    pub text: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost_usd: Option<f64>,
}

/// Opaque LLM completion capability.
pub trait LlmProvider: Send + Sync {
    fn name(&self) -> &str;

    fn complete(
        &self,
        req: LlmRequest,
    ) -> impl Future<Output = CoreResult<LlmResponse>> + Send;
}

/// Object-safe version of [`LlmProvider`] with boxed futures.
pub trait LlmProviderDyn: Send + Sync {
    fn name(&self) -> &str;

    fn complete_boxed<'a>(
        &'a self,
        req: LlmRequest,
    ) -> Pin<Box<dyn Future<Output = CoreResult<LlmResponse>> + Send + 'a>>;
}

impl<T: LlmProvider> LlmProviderDyn for T {
    fn name(&self) -> &str {
        LlmProvider::name(self)
    }

    fn complete_boxed<'a>(
        &'a self,
        req: LlmRequest,
    ) -> Pin<Box<dyn Future<Output = CoreResult<LlmResponse>> + Send + 'a>> {
        Box::pin(self.complete(req))
    }
}

/// Type-erased LLM provider.
pub struct BoxLlmProvider {
    inner: Box<dyn LlmProviderDyn>,
}

impl BoxLlmProvider {
    pub fn new<T: LlmProvider + 'static>(provider: T) -> Self {
        Self {
            inner: Box::new(provider),
        }
    }

    pub fn name(&self) -> &str {
        self.inner.name()
    }

    pub async fn complete(&self, req: LlmRequest) -> CoreResult<LlmResponse> {
        self.inner.complete_boxed(req).await
    }
}

// ---------------------------------------------------------------------------
// LocalStepExecutor
// ---------------------------------------------------------------------------

/// Built-in executor for noop/wait/shell/file steps; llm steps require a
/// configured provider.
pub struct LocalStepExecutor {
    data_dir: PathBuf,
    llm: Option<BoxLlmProvider>,
    templates: SimpleTemplateEngine,
}

impl LocalStepExecutor {
    pub fn new(data_dir: PathBuf) -> Self {
        Self {
            data_dir,
            llm: None,
            templates: SimpleTemplateEngine,
        }
    }

    /// Attach an LLM provider for llm steps.
    pub fn with_llm(mut self, provider: BoxLlmProvider) -> Self {
        self.llm = Some(provider);
        self
    }

    fn render(&self, template: &str, ctx: &Value) -> Result<String, String> {
        self.templates
            .render(template, ctx)
            .map_err(|e| e.to_string())
    }

    async fn run_shell(
        &self,
        command: &str,
        workdir: Option<&str>,
        ctx: &Value,
    ) -> Result<Value, String> {
        let rendered = self.render(command, ctx)?;
        let mut cmd = tokio::process::Command::new("sh");
        cmd.arg("-c").arg(&rendered).kill_on_drop(true);
        match workdir {
            Some(dir) => {
                cmd.current_dir(dir);
            }
            None => {
                cmd.current_dir(&self.data_dir);
            }
        }

        let output = cmd
            .output()
            .await
            .map_err(|e| format!("failed to spawn '{rendered}': {e}"))?;

        let stdout = String::from_utf8_lossy(&output.stdout).trim_end().to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).trim_end().to_string();
        let code = output.status.code().unwrap_or(-1);

        if output.status.success() {
            Ok(json!({"stdout": stdout, "stderr": stderr, "exit_code": code}))
        } else {
            Err(format!("command exited with status {code}: {stderr}"))
        }
    }

    async fn run_file(
        &self,
        operation: FileOperation,
        path: &str,
        content: Option<&str>,
        ctx: &Value,
    ) -> Result<Value, String> {
        let rendered_path = self.render(path, ctx)?;
        let path = PathBuf::from(&rendered_path);
        match operation {
            FileOperation::Read => {
                let text = tokio::fs::read_to_string(&path)
                    .await
                    .map_err(|e| format!("read {rendered_path}: {e}"))?;
                Ok(json!({"content": text}))
            }
            FileOperation::Write | FileOperation::Append => {
                let body = self.render(content.unwrap_or_default(), ctx)?;
                if let Some(parent) = path.parent() {
                    tokio::fs::create_dir_all(parent)
                        .await
                        .map_err(|e| format!("create {}: {e}", parent.display()))?;
                }
                if operation == FileOperation::Append {
                    use tokio::io::AsyncWriteExt;
                    let mut file = tokio::fs::OpenOptions::new()
                        .create(true)
                        .append(true)
                        .open(&path)
                        .await
                        .map_err(|e| format!("open {rendered_path}: {e}"))?;
                    file.write_all(body.as_bytes())
                        .await
                        .map_err(|e| format!("append {rendered_path}: {e}"))?;
                } else {
                    tokio::fs::write(&path, body.as_bytes())
                        .await
                        .map_err(|e| format!("write {rendered_path}: {e}"))?;
                }
                Ok(json!({"path": rendered_path, "bytes": body.len()}))
            }
            FileOperation::Delete => {
                match tokio::fs::remove_file(&path).await {
                    Ok(()) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => return Err(format!("delete {rendered_path}: {e}")),
                }
                Ok(json!({"path": rendered_path, "deleted": true}))
            }
        }
    }

    async fn run_llm(
        &self,
        prompt: &str,
        provider: Option<&str>,
        model: Option<&str>,
        ctx: &Value,
        overrides: &RuntimeOverrides,
    ) -> Result<(Value, StepMetrics), String> {
        let llm = self
            .llm
            .as_ref()
            .ok_or_else(|| "no LLM provider configured".to_string())?;
        let rendered = self.render(prompt, ctx)?;
        let request = LlmRequest {
            prompt: rendered,
            provider: overrides
                .provider
                .clone()
                .or_else(|| provider.map(str::to_string)),
            model: overrides.model.clone().or_else(|| model.map(str::to_string)),
        };
        let start = Instant::now();
        let response = llm.complete(request).await.map_err(|e| e.to_string())?;
        let metrics = StepMetrics {
            input_tokens: Some(response.input_tokens),
            output_tokens: Some(response.output_tokens),
            cost_usd: response.cost_usd,
            duration_ms: start.elapsed().as_millis() as u64,
        };
        Ok((json!({"text": response.text}), metrics))
    }
}

impl StepExecutor for LocalStepExecutor {
    async fn execute(&self, req: StepRequest) -> StepOutcome {
        let ctx = &req.context;
        match &req.step.config {
            StepConfig::Noop => StepOutcome::Ok {
                output: Value::Null,
                metrics: None,
            },
            StepConfig::Wait { seconds } => {
                tokio::time::sleep(std::time::Duration::from_secs_f64(*seconds)).await;
                StepOutcome::Ok {
                    output: json!({"slept_secs": seconds}),
                    metrics: None,
                }
            }
            StepConfig::Shell { command, workdir } => {
                match self.run_shell(command, workdir.as_deref(), ctx).await {
                    Ok(output) => StepOutcome::Ok {
                        output,
                        metrics: None,
                    },
                    Err(error) => StepOutcome::Failed { error },
                }
            }
            StepConfig::File {
                operation,
                path,
                content,
            } => match self.run_file(*operation, path, content.as_deref(), ctx).await {
                Ok(output) => StepOutcome::Ok {
                    output,
                    metrics: None,
                },
                Err(error) => StepOutcome::Failed { error },
            },
            StepConfig::Llm {
                prompt,
                provider,
                model,
            } => {
                match self
                    .run_llm(
                        prompt,
                        provider.as_deref(),
                        model.as_deref(),
                        ctx,
                        &req.overrides,
                    )
                    .await
                {
                    Ok((output, metrics)) => StepOutcome::Ok {
                        output,
                        metrics: Some(metrics),
                    },
                    Err(error) => StepOutcome::Failed { error },
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use conductor_types::workflow::ErrorStrategy;

    fn step(id: &str, config: StepConfig) -> StepDefinition {
        StepDefinition {
            id: id.to_string(),
            name: None,
            config,
            on_error: ErrorStrategy::Fail,
            timeout_secs: None,
        }
    }

    fn request(config: StepConfig, context: Value) -> StepRequest {
        StepRequest {
            run_id: "r1".to_string(),
            step: step("s1", config),
            context,
            overrides: RuntimeOverrides::default(),
        }
    }

    #[tokio::test]
    async fn test_noop_step_yields_null_output() {
        let exec = LocalStepExecutor::new(std::env::temp_dir());
        let outcome = exec.execute(request(StepConfig::Noop, json!({}))).await;
        match outcome {
            StepOutcome::Ok { output, metrics } => {
                assert_eq!(output, Value::Null);
                assert!(metrics.is_none());
            }
            other => panic!("expected ok, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_shell_step_captures_stdout() {
        let exec = LocalStepExecutor::new(std::env::temp_dir());
        let outcome = exec
            .execute(request(
                StepConfig::Shell {
                    command: "echo hello".to_string(),
                    workdir: None,
                },
                json!({}),
            ))
            .await;
        match outcome {
            StepOutcome::Ok { output, .. } => {
                assert_eq!(output["stdout"], "hello");
                assert_eq!(output["exit_code"], 0);
            }
            other => panic!("expected ok, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_shell_step_renders_templates() {
        let exec = LocalStepExecutor::new(std::env::temp_dir());
        let outcome = exec
            .execute(request(
                StepConfig::Shell {
                    command: "echo {{ inputs.topic }}".to_string(),
                    workdir: None,
                },
                json!({"inputs": {"topic": "rust"}}),
            ))
            .await;
        match outcome {
            StepOutcome::Ok { output, .. } => assert_eq!(output["stdout"], "rust"),
            other => panic!("expected ok, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_shell_step_nonzero_exit_fails() {
        let exec = LocalStepExecutor::new(std::env::temp_dir());
        let outcome = exec
            .execute(request(
                StepConfig::Shell {
                    command: "exit 3".to_string(),
                    workdir: None,
                },
                json!({}),
            ))
            .await;
        match outcome {
            StepOutcome::Failed { error } => assert!(error.contains("status 3")),
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_file_write_then_read_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let exec = LocalStepExecutor::new(dir.path().to_path_buf());
        let path = dir.path().join("out.txt").display().to_string();

        let outcome = exec
            .execute(request(
                StepConfig::File {
                    operation: FileOperation::Write,
                    path: path.clone(),
                    content: Some("payload: {{ inputs.v }}".to_string()),
                },
                json!({"inputs": {"v": 7}}),
            ))
            .await;
        assert!(matches!(outcome, StepOutcome::Ok { .. }));

        let outcome = exec
            .execute(request(
                StepConfig::File {
                    operation: FileOperation::Read,
                    path,
                    content: None,
                },
                json!({}),
            ))
            .await;
        match outcome {
            StepOutcome::Ok { output, .. } => assert_eq!(output["content"], "payload: 7"),
            other => panic!("expected ok, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_file_delete_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let exec = LocalStepExecutor::new(dir.path().to_path_buf());
        let path = dir.path().join("gone.txt").display().to_string();

        let outcome = exec
            .execute(request(
                StepConfig::File {
                    operation: FileOperation::Delete,
                    path,
                    content: None,
                },
                json!({}),
            ))
            .await;
        assert!(matches!(outcome, StepOutcome::Ok { .. }));
    }

    #[tokio::test]
    async fn test_llm_step_without_provider_fails() {
        let exec = LocalStepExecutor::new(std::env::temp_dir());
        let outcome = exec
            .execute(request(
                StepConfig::Llm {
                    prompt: "hi".to_string(),
                    provider: None,
                    model: None,
                },
                json!({}),
            ))
            .await;
        match outcome {
            StepOutcome::Failed { error } => assert!(error.contains("no LLM provider")),
            other => panic!("expected failure, got {other:?}"),
        }
    }

    struct EchoProvider;

    impl LlmProvider for EchoProvider {
        fn name(&self) -> &str {
            "echo"
        }

        async fn complete(&self, req: LlmRequest) -> CoreResult<LlmResponse> {
            Ok(LlmResponse {
                text: format!("echo: {}", req.prompt),
                input_tokens: 3,
                output_tokens: 5,
                cost_usd: Some(0.0001),
            })
        }
    }

    #[tokio::test]
    async fn test_llm_step_reports_metrics() {
        let exec = LocalStepExecutor::new(std::env::temp_dir())
            .with_llm(BoxLlmProvider::new(EchoProvider));
        let outcome = exec
            .execute(request(
                StepConfig::Llm {
                    prompt: "summarize {{ inputs.topic }}".to_string(),
                    provider: None,
                    model: None,
                },
                json!({"inputs": {"topic": "rust"}}),
            ))
            .await;
        match outcome {
            StepOutcome::Ok { output, metrics } => {
                assert_eq!(output["text"], "echo: summarize rust");
                let metrics = metrics.unwrap();
                assert_eq!(metrics.input_tokens, Some(3));
                assert_eq!(metrics.output_tokens, Some(5));
            }
            other => panic!("expected ok, got {other:?}"),
        }
    }
}
