//! Generation capability consumed by `Generate` steps

pub mod client;
pub mod response;
pub mod streaming;
pub mod subprocess_client;

use async_trait::async_trait;
pub use client::GeneratorConfig;
pub use response::{Generation, GenerationError, GenerationRequest};
pub use streaming::{NoopSink, TokenSink};
pub use subprocess_client::CommandGenerator;

/// Trait for text generation - allows for different implementations
#[async_trait]
pub trait GenerationService: Send + Sync {
    /// Generate content for a rendered prompt
    async fn generate(&self, request: &GenerationRequest) -> Result<Generation, GenerationError>;

    /// Generate content, reporting tokens to `sink` as they are produced
    ///
    /// The default implementation waits for the whole generation and then
    /// replays its tokens.
    async fn generate_streaming(
        &self,
        request: &GenerationRequest,
        sink: Option<&dyn TokenSink>,
    ) -> Result<Generation, GenerationError> {
        let generation = self.generate(request).await?;
        if let Some(sink) = sink {
            for token in &generation.tokens {
                sink.on_token(token);
            }
        }
        Ok(generation)
    }
}
