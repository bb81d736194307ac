//! Step executor - runs one attempt of one step

use crate::{
    core::{render_template, Capability, Payload, StepContext, StepDefinition, StepError},
    events::{EventKind, EventLog},
    generation::{GenerationRequest, GenerationService, TokenSink},
};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Token sink that republishes tokens as `Token` events
pub struct EventTokenSink {
    log: Arc<EventLog>,
    step_id: String,
}

impl EventTokenSink {
    pub fn new(log: Arc<EventLog>, step_id: impl Into<String>) -> Self {
        Self {
            log,
            step_id: step_id.into(),
        }
    }
}

impl TokenSink for EventTokenSink {
    fn on_token(&self, token: &str) {
        let mut payload = Payload::new();
        payload.insert("token".to_string(), json!(token));
        self.log.publish(Some(&self.step_id), EventKind::Token, payload);
    }
}

/// Executes a single step attempt
pub struct StepExecutor<G> {
    generator: G,
}

impl<G: GenerationService> StepExecutor<G> {
    pub fn new(generator: G) -> Self {
        Self { generator }
    }

    /// Execute one attempt and return the step's output bag
    ///
    /// The attempt races the step deadline and the cancellation token; the
    /// first to fire wins. Review gates are resolved by the engine and never
    /// reach the executor.
    pub async fn execute(
        &self,
        step: &StepDefinition,
        ctx: StepContext,
        sink: &dyn TokenSink,
        cancel: CancellationToken,
    ) -> Result<Payload, StepError> {
        info!(step_id = %step.id, attempt = ctx.attempt, "Executing step");

        if cancel.is_cancelled() {
            return Err(StepError::cancelled());
        }

        let work = self.run_capability(step, &ctx, sink);
        let value = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                info!(step_id = %step.id, attempt = ctx.attempt, "Step cancelled");
                return Err(StepError::cancelled());
            }
            result = async {
                match step.timeout {
                    Some(limit) => match timeout(limit, work).await {
                        Ok(result) => result,
                        Err(_) => {
                            error!(step_id = %step.id, "Timeout after {}ms", limit.as_millis());
                            Err(StepError::timeout(limit))
                        }
                    },
                    None => work.await,
                }
            } => result?,
        };

        let mut outputs = Payload::new();
        if let Some(key) = step.outputs.first() {
            outputs.insert(key.clone(), value);
        }
        Ok(outputs)
    }

    async fn run_capability(
        &self,
        step: &StepDefinition,
        ctx: &StepContext,
        sink: &dyn TokenSink,
    ) -> Result<Value, StepError> {
        match &step.capability {
            Capability::Generate { prompt, parameters } => {
                let rendered = render_template(prompt, &ctx.values);
                debug!(step_id = %step.id, "Effective prompt: {}", rendered);

                let request = GenerationRequest::new(&step.id, rendered)
                    .with_parameters(parameters.clone());
                let generation = self
                    .generator
                    .generate_streaming(&request, Some(sink))
                    .await
                    .map_err(|e| {
                        error!(step_id = %step.id, "Generation error: {}", e);
                        StepError::from(e)
                    })?;

                Ok(Value::String(generation.content))
            }
            Capability::Transform(kind) => kind.apply(ctx),
            Capability::ReviewGate { .. } => Err(StepError::permanent(format!(
                "review gate '{}' cannot be executed directly",
                step.id
            ))),
        }
    }
}
