//! Generation request, response and error types

use crate::core::{
    context::Payload,
    error::{ErrorKind, StepError},
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error types for generation calls
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GenerationError {
    /// Service unreachable or temporarily failing
    #[error("generation service unavailable: {0}")]
    Unavailable(String),

    #[error("rate limited: {0}")]
    RateLimited(String),

    /// The service refused the request
    #[error("request rejected: {0}")]
    Rejected(String),

    #[error("timeout after {0} seconds")]
    Timeout(u64),
}

impl GenerationError {
    /// Classification used by the recovery policy
    pub fn kind(&self) -> ErrorKind {
        match self {
            GenerationError::Unavailable(_) => ErrorKind::Transient,
            GenerationError::RateLimited(_) => ErrorKind::ResourceExhausted,
            GenerationError::Rejected(_) => ErrorKind::Permanent,
            GenerationError::Timeout(_) => ErrorKind::Timeout,
        }
    }
}

impl From<GenerationError> for StepError {
    fn from(error: GenerationError) -> Self {
        StepError::new(error.kind(), error.to_string())
    }
}

/// A single generation call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationRequest {
    /// Step issuing the request
    pub step_id: String,

    /// Fully rendered prompt
    pub prompt: String,

    /// Step parameters passed through untouched
    #[serde(default)]
    pub parameters: Payload,
}

impl GenerationRequest {
    pub fn new(step_id: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            step_id: step_id.into(),
            prompt: prompt.into(),
            parameters: Payload::new(),
        }
    }

    pub fn with_parameters(mut self, parameters: Payload) -> Self {
        self.parameters = parameters;
        self
    }
}

/// Generated content
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Generation {
    /// The full generated text
    pub content: String,

    /// Tokens in production order; concatenated they form `content`
    pub tokens: Vec<String>,
}

impl Generation {
    /// Wrap content produced without token boundaries, split on whitespace
    pub fn new(content: impl Into<String>) -> Self {
        let content = content.into();
        let tokens = content.split_inclusive(' ').map(str::to_string).collect();
        Self { content, tokens }
    }

    pub fn from_tokens(tokens: Vec<String>) -> Self {
        Self {
            content: tokens.concat(),
            tokens,
        }
    }
}
