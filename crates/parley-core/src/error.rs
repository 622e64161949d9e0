use thiserror::Error;

use crate::safety::{ModerationAction, ModerationCategory};

/// Failures that end a turn. Degradable problems (retrieval, org policy,
/// presets, webhook fan-out) and per-tool failures never show up here.
#[derive(Debug, Error)]
pub enum TurnError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("invalid request: {0}")]
    Validation(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("content blocked by moderation policy ({category})")]
    Blocked {
        category: ModerationCategory,
        action: ModerationAction,
    },

    #[error("moderation check failed: {0:#}")]
    Moderation(anyhow::Error),

    #[error("model call failed: {0:#}")]
    Model(anyhow::Error),

    #[error("storage error: {0:#}")]
    Store(anyhow::Error),
}

impl TurnError {
    pub fn kind(&self) -> &'static str {
        match self {
            TurnError::Configuration(_) => "configuration",
            TurnError::Validation(_) => "validation",
            TurnError::NotFound(_) => "not_found",
            TurnError::Blocked { .. } => "blocked",
            TurnError::Moderation(_) => "moderation",
            TurnError::Model(_) => "model",
            TurnError::Store(_) => "store",
        }
    }
}
