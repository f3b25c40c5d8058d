use std::any::Any;

use repose_snapshot::StateError;

use crate::ScopeId;

/// Errors that abort a composition batch.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ComposeError {
    #[error(transparent)]
    State(#[from] StateError),

    /// A body panicked while `RecomposerConfig::catch_panics` was set.
    #[error("composition panicked: {0}")]
    Panicked(String),

    #[error("composition is disposed")]
    Disposed,

    #[error("composition already has a root scope")]
    AlreadyComposed,

    #[error("scope {0:?} has no body")]
    MissingBody(ScopeId),

    #[error("{0}")]
    Message(String),
}

impl ComposeError {
    pub fn msg(message: impl Into<String>) -> Self {
        ComposeError::Message(message.into())
    }
}

/// An effect callback that panicked. Other effects of the same drain still ran.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EffectFailure {
    /// Scope that registered the effect, when it is still known.
    pub scope: Option<ScopeId>,
    pub message: String,
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else {
        "Unknown panic".to_string()
    }
}
