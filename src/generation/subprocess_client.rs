//! Subprocess generator - runs an external command per generation call

use crate::core::context::Payload;
use crate::generation::{
    client::GeneratorConfig, Generation, GenerationError, GenerationRequest, GenerationService,
    TokenSink,
};
use async_trait::async_trait;
use serde_json::Value;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, warn};

/// Prefix of the environment variables carrying step parameters
pub const PARAM_ENV_PREFIX: &str = "ADFLOW_PARAM_";

/// Exit statuses with a conventional meaning (sysexits.h)
const EX_UNAVAILABLE: i32 = 69;
const EX_CANTCREAT: i32 = 73;
const EX_TEMPFAIL: i32 = 75;

/// Generation service backed by an external command
///
/// The rendered prompt is passed as the last argument, step parameters as
/// `ADFLOW_PARAM_<KEY>` environment variables. Every stdout line is one token.
#[derive(Debug, Clone)]
pub struct CommandGenerator {
    config: GeneratorConfig,
}

impl CommandGenerator {
    pub fn new(config: GeneratorConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &GeneratorConfig {
        &self.config
    }

    fn command(&self, request: &GenerationRequest) -> Command {
        let mut command = Command::new(&self.config.program);
        command
            .args(&self.config.args)
            .arg(&request.prompt)
            .envs(param_env(&request.parameters))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        command
    }

    async fn run(
        &self,
        request: &GenerationRequest,
        sink: Option<&dyn TokenSink>,
    ) -> Result<Generation, GenerationError> {
        debug!(
            step_id = %request.step_id,
            program = %self.config.program,
            "Spawning generator with prompt length: {}",
            request.prompt.len()
        );

        let mut child = self.command(request).spawn().map_err(|e| {
            GenerationError::Unavailable(format!(
                "failed to spawn {}: {}",
                self.config.program, e
            ))
        })?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| GenerationError::Unavailable("stdout was not captured".to_string()))?;
        let mut stderr = child
            .stderr
            .take()
            .ok_or_else(|| GenerationError::Unavailable("stderr was not captured".to_string()))?;

        let stderr_reader = tokio::spawn(async move {
            let mut buf = String::new();
            let _ = stderr.read_to_string(&mut buf).await;
            buf
        });

        let mut tokens = Vec::new();
        let streamed = async {
            let mut lines = BufReader::new(stdout).lines();
            while let Some(line) = lines
                .next_line()
                .await
                .map_err(|e| GenerationError::Unavailable(format!("failed to read output: {}", e)))?
            {
                let token = format!("{}\n", line);
                if let Some(sink) = sink {
                    sink.on_token(&token);
                }
                tokens.push(token);
            }
            let status = child
                .wait()
                .await
                .map_err(|e| GenerationError::Unavailable(format!("failed to wait: {}", e)))?;
            Ok::<_, GenerationError>(status)
        };

        let status = timeout(Duration::from_secs(self.config.timeout_secs), streamed)
            .await
            .map_err(|_| GenerationError::Timeout(self.config.timeout_secs))??;

        let stderr = stderr_reader.await.unwrap_or_default();

        if !status.success() {
            let error = classify_exit(status.code(), stderr.trim());
            warn!(
                step_id = %request.step_id,
                exit_code = status.code().unwrap_or(-1),
                "Generator failed: {}",
                error
            );
            return Err(error);
        }

        let generation = Generation::from_tokens(tokens);
        debug!(
            step_id = %request.step_id,
            "Generator returned {} bytes of output",
            generation.content.len()
        );
        Ok(generation)
    }
}

#[async_trait]
impl GenerationService for CommandGenerator {
    async fn generate(&self, request: &GenerationRequest) -> Result<Generation, GenerationError> {
        self.run(request, None).await
    }

    async fn generate_streaming(
        &self,
        request: &GenerationRequest,
        sink: Option<&dyn TokenSink>,
    ) -> Result<Generation, GenerationError> {
        self.run(request, sink).await
    }
}

/// Map a failed exit to an error class
fn classify_exit(code: Option<i32>, stderr: &str) -> GenerationError {
    let lower = stderr.to_lowercase();
    let detail = match code {
        Some(code) => format!("exited with code {}: {}", code, stderr),
        None => format!("terminated by signal: {}", stderr),
    };

    if code == Some(EX_CANTCREAT) || lower.contains("rate limit") || lower.contains("quota") {
        return GenerationError::RateLimited(detail);
    }
    match code {
        Some(EX_UNAVAILABLE) | Some(EX_TEMPFAIL) | None => GenerationError::Unavailable(detail),
        Some(_) => GenerationError::Rejected(detail),
    }
}

/// Environment variables for step parameters
fn param_env(parameters: &Payload) -> Vec<(String, String)> {
    parameters
        .iter()
        .map(|(key, value)| {
            let name: String = key
                .chars()
                .map(|c| {
                    if c.is_ascii_alphanumeric() {
                        c.to_ascii_uppercase()
                    } else {
                        '_'
                    }
                })
                .collect();
            let value = match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            (format!("{}{}", PARAM_ENV_PREFIX, name), value)
        })
        .collect()
}
