//! Error taxonomy shared by every component.
//!
//! Transport and protocol failures are converted into one of these kinds at
//! the component boundary; nothing below the front end renders raw errors.

use crate::config::MessagesConfig;
use thiserror::Error;

/// Malformed command input.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("prompt is empty")]
    EmptyPrompt,
    #[error("--seed expects a non-negative integer, got '{0}'")]
    InvalidSeed(String),
    #[error("--seed is missing its value")]
    MissingSeed,
    #[error("unknown command alias '{0}'")]
    UnknownAlias(String),
}

#[derive(Debug, Error)]
pub enum BotError {
    #[error(transparent)]
    Parse(#[from] ParseError),

    /// A backend could not be brought to Ready.
    #[error("backend '{backend}' unavailable: {reason}")]
    BackendUnavailable { backend: String, reason: String },

    /// The single job slot (or the channel's turn gate) is occupied.
    #[error("busy: {0}")]
    Busy(String),

    /// The external call failed or returned malformed output.
    #[error("backend '{backend}' error: {detail}")]
    Backend { backend: String, detail: String },

    #[error("user '{0}' is not allowed to do that")]
    Authorization(String),

    /// Speech synthesis failed. Logged and swallowed by the chat path.
    #[error("speech synthesis failed: {0}")]
    Synthesis(String),

    #[error("no generation record '{0}'")]
    RecordNotFound(String),

    #[error("action not offered for this result: {0}")]
    ActionUnavailable(String),

    #[error("profile store error: {0}")]
    Profile(String),
}

impl BotError {
    pub fn backend_unavailable(backend: &str, reason: impl ToString) -> Self {
        Self::BackendUnavailable {
            backend: backend.to_string(),
            reason: reason.to_string(),
        }
    }

    /// Wraps an internal error; `{:#}` keeps the whole context chain for the log.
    pub fn backend(backend: &str, err: &anyhow::Error) -> Self {
        Self::Backend {
            backend: backend.to_string(),
            detail: format!("{err:#}"),
        }
    }

    /// Text shown to the person who triggered the failure.
    pub fn user_message(&self, messages: &MessagesConfig) -> String {
        match self {
            Self::Parse(ParseError::EmptyPrompt) => messages.no_prompt.clone(),
            Self::Parse(e) => format!("{} ({e})", messages.bad_arguments),
            Self::BackendUnavailable { .. } => messages.backend_unavailable.clone(),
            Self::Busy(_) => messages.busy.clone(),
            Self::Backend { .. } => messages.generation_error.clone(),
            Self::Authorization(_) => messages.not_allowed.clone(),
            Self::Synthesis(_) => messages.speech_error.clone(),
            Self::RecordNotFound(_) => messages.result_expired.clone(),
            Self::ActionUnavailable(_) => messages.action_unavailable.clone(),
            Self::Profile(_) => messages.profile_error.clone(),
        }
    }
}

pub type BotResult<T> = std::result::Result<T, BotError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_message_hides_backend_detail() {
        let messages = MessagesConfig::default();
        let err = BotError::Backend {
            backend: "image".into(),
            detail: "HTTP 500: Traceback (most recent call last)".into(),
        };
        let text = err.user_message(&messages);
        assert_eq!(text, messages.generation_error);
        assert!(!text.contains("Traceback"));
    }

    #[test]
    fn empty_prompt_uses_usage_hint() {
        let messages = MessagesConfig::default();
        let err = BotError::from(ParseError::EmptyPrompt);
        assert_eq!(err.user_message(&messages), messages.no_prompt);
    }

    #[test]
    fn invalid_seed_mentions_argument() {
        let messages = MessagesConfig::default();
        let err = BotError::from(ParseError::InvalidSeed("abc".into()));
        assert!(err.user_message(&messages).contains("abc"));
    }
}
