//! Error taxonomy for the batching engine.
//!
//! Every per-event and per-batch failure is contained at its call site.
//! The variant tells the caller whether to drop, log, or keep serving.

use thiserror::Error;

/// Errors surfaced by the engine's collaborators.
#[derive(Error, Debug)]
pub enum EngineError {
    /// No routing entry for the event's source identity.
    #[error("no model routed for {group}/{subgroup}/{camera}")]
    Unrouted {
        group: String,
        subgroup: String,
        camera: String,
    },

    /// The frame sink failed to persist a frame.
    #[error("frame persistence failed: {0}")]
    Persistence(String),

    /// A configuration document changed but could not be parsed.
    #[error("config document {document} rejected: {reason}")]
    ConfigParse { document: String, reason: String },

    /// A finished batch could not be enqueued downstream.
    #[error("publish to model queue '{model}' failed: {reason}")]
    Publish { model: String, reason: String },

    /// An upstream message could not be decoded into a frame event.
    #[error("undecodable frame event: {0}")]
    Decode(String),

    /// The upstream transport went away.
    #[error("transport error: {0}")]
    Transport(String),
}

/// Coarse classification used by call sites to pick a handling policy.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    Unrouted,
    Persistence,
    ConfigParse,
    Publish,
    Decode,
    Transport,
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Unrouted { .. } => ErrorKind::Unrouted,
            Self::Persistence(_) => ErrorKind::Persistence,
            Self::ConfigParse { .. } => ErrorKind::ConfigParse,
            Self::Publish { .. } => ErrorKind::Publish,
            Self::Decode(_) => ErrorKind::Decode,
            Self::Transport(_) => ErrorKind::Transport,
        }
    }

    pub fn publish(model: &str, reason: impl std::fmt::Display) -> Self {
        Self::Publish {
            model: model.to_string(),
            reason: reason.to_string(),
        }
    }

    pub fn persistence(reason: impl std::fmt::Display) -> Self {
        Self::Persistence(reason.to_string())
    }
}

impl From<rusqlite::Error> for EngineError {
    fn from(err: rusqlite::Error) -> Self {
        EngineError::Persistence(err.to_string())
    }
}

impl From<std::io::Error> for EngineError {
    fn from(err: std::io::Error) -> Self {
        EngineError::Persistence(err.to_string())
    }
}
