//! Token streaming for generation calls
//!
//! A `TokenSink` receives each token as the generation service produces it.
//! The engine hands every attempt its own sink that republishes tokens as
//! `Token` events on the run's event log.

/// Callback for tokens as they arrive from a streaming generation
///
/// This trait is object-safe and can be used as `&dyn TokenSink`.
pub trait TokenSink: Send + Sync {
    /// Called once per token, in production order
    fn on_token(&self, token: &str);
}

/// Sink that discards every token
#[derive(Debug, Clone, Default)]
pub struct NoopSink;

impl TokenSink for NoopSink {
    fn on_token(&self, _token: &str) {}
}
