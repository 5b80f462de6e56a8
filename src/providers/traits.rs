use crate::prompt::GenerationRequest;
use async_trait::async_trait;

/// Decoded txt2img result.
#[derive(Debug, Clone)]
pub struct ImageOutput {
    /// PNG bytes of the first returned image
    pub image: Vec<u8>,
    /// Seed the server reports having used, when it says so
    pub seed: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatTurn {
    pub role: Role,
    /// Display name of whoever spoke; empty for the assistant
    pub speaker: String,
    pub text: String,
}

impl ChatTurn {
    pub fn user(speaker: &str, text: &str) -> Self {
        Self {
            role: Role::User,
            speaker: speaker.to_string(),
            text: text.to_string(),
        }
    }

    pub fn assistant(text: &str) -> Self {
        Self {
            role: Role::Assistant,
            speaker: String::new(),
            text: text.to_string(),
        }
    }
}

/// Everything the text model sees for one reply.
#[derive(Debug, Clone, Default)]
pub struct ChatContext {
    pub persona: String,
    pub profile: Option<String>,
    pub image_description: Option<String>,
    pub current_time: Option<String>,
    /// Oldest first; the last entry is the turn being answered.
    pub history: Vec<ChatTurn>,
}

#[async_trait]
pub trait ImageBackend: Send + Sync {
    async fn txt2img(&self, request: &GenerationRequest) -> anyhow::Result<ImageOutput>;
}

#[async_trait]
pub trait TextBackend: Send + Sync {
    async fn generate(&self, context: &ChatContext) -> anyhow::Result<String>;

    /// Short caption for an attached image.
    async fn describe_image(&self, image: &[u8]) -> anyhow::Result<String>;
}

#[async_trait]
pub trait SpeechBackend: Send + Sync {
    /// Returns WAV bytes.
    async fn synthesize(&self, text: &str) -> anyhow::Result<Vec<u8>>;
}
