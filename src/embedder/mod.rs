//! Multimodal encoder clients.

use thiserror::Error;

pub mod clip;

pub use clip::HttpClipEncoder;

/// Failures talking to the embedding service.
#[derive(Debug, Error)]
pub enum EncodeError {
    /// Request could not be sent or the connection dropped.
    #[error("embedding request failed: {0}")]
    Request(String),
    /// Service answered with a non-success status.
    #[error("embedding service returned {status}: {body}")]
    Status {
        /// HTTP status code.
        status: u16,
        /// Response body, possibly truncated.
        body: String,
    },
    /// Response body did not match the expected shape.
    #[error("failed to decode embedding response: {0}")]
    Decode(String),
}

/// Shared text/image encoder; both outputs must live in one vector space.
pub trait MultimodalEncoder {
    /// Embeds a post title.
    fn embed_text(&self, text: &str) -> Result<Vec<f32>, EncodeError>;

    /// Embeds raw image bytes.
    fn embed_image(&self, image: &[u8]) -> Result<Vec<f32>, EncodeError>;
}
