//! Error types for the safety hub.

use std::path::PathBuf;
use thiserror::Error;

use crate::types::{SourceId, UserId};

/// Errors surfaced synchronously to callers of the hub.
///
/// Asynchronous conditions (refresh timeouts, listener delivery failures,
/// silent sources) are never reported through this type; they are folded
/// into the aggregate as unknown or error entries.
#[derive(Error, Debug)]
pub enum HubError {
    /// The source id is not declared by the registry.
    #[error("Unknown safety source: {0}")]
    UnknownSource(SourceId),

    /// The user id does not correspond to an existing profile.
    #[error("Unknown user: {0}")]
    UnknownUser(UserId),

    /// The hub is switched off by configuration.
    #[error("Safety hub is disabled")]
    Disabled,

    /// Two registry entries share the same source id.
    #[error("Duplicate safety source id in registry: {0}")]
    DuplicateSource(SourceId),

    /// The configuration could not be parsed.
    #[error("Invalid hub configuration in {path}: {message}")]
    Config { path: PathBuf, message: String },

    /// No tokio runtime was available and one could not be started.
    #[error("Failed to start refresh runtime: {0}")]
    Runtime(#[source] std::io::Error),

    /// The configuration file could not be read.
    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, HubError>;

/// A listener could not be reached.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("listener delivery failed: {0}")]
pub struct DeliveryError(pub String);

/// A refresh request could not be handed to the transport.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("refresh dispatch failed: {0}")]
pub struct DispatchError(pub String);
