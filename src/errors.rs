//! Error types
//!
//! Three layers, matching how far a failure reaches:
//! - [`SiteError`]: a token-level fault. It becomes an error value thrown to
//!   the nearest handler and never stops the engine.
//! - [`EngineError`]: fatal to the run (resource exhaustion, graph or
//!   internal invariant violations).
//! - [`ConfigError`]: loading configuration before a run starts.

use std::path::PathBuf;

use thiserror::Error;

use crate::graph::NodeId;
use crate::value::Value;

/// Problems found while loading or validating a compiled graph
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GraphError {
    #[error("malformed graph: {0}")]
    Json(String),
    #[error("root node {root} is outside a graph of {len} nodes")]
    RootOutOfRange { root: NodeId, len: usize },
    #[error("node {at} refers to missing node {target}")]
    DanglingNode { at: NodeId, target: NodeId },
    #[error("node {at} calls unknown site `{name}`")]
    UnknownSite { at: NodeId, name: String },
    #[error("handler installed at {at} takes {arity} arguments, expected 1")]
    HandlerArity { at: NodeId, arity: usize },
}

/// Conditions that end a whole run
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    #[error("live token limit of {limit} exceeded")]
    TokenLimitExceeded { limit: usize },
    #[error("call depth limit of {limit} exceeded")]
    CallDepthExceeded { limit: usize },
    #[error("invalid graph: {0}")]
    Graph(#[from] GraphError),
    #[error("internal invariant violated: {0}")]
    Invariant(String),
    #[error("engine has not been started")]
    NotStarted,
    #[error("engine was already started")]
    AlreadyStarted,
}

/// Token-level faults raised by calls
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SiteError {
    #[error("{callee} expects {expected} arguments, got {got}")]
    ArityMismatch {
        callee: String,
        expected: usize,
        got: usize,
    },
    #[error("value of type {0} is not callable")]
    NotCallable(&'static str),
    #[error("{site}: expected {expected}, got {got}")]
    TypeMismatch {
        site: String,
        expected: &'static str,
        got: &'static str,
    },
    #[error("site `{site}` requires capability {capability}, which is disabled")]
    CapabilityDenied { site: String, capability: String },
    #[error("{0}")]
    Custom(String),
}

impl SiteError {
    fn tag(&self) -> &'static str {
        match self {
            SiteError::ArityMismatch { .. } => "ArityMismatch",
            SiteError::NotCallable(_) => "NotCallable",
            SiteError::TypeMismatch { .. } => "TypeMismatch",
            SiteError::CapabilityDenied { .. } => "CapabilityDenied",
            SiteError::Custom(_) => "Error",
        }
    }

    /// The error value thrown into the program: a tagged value carrying the
    /// rendered message
    pub fn to_value(&self) -> Value {
        Value::tagged(self.tag(), [Value::str(self.to_string())])
    }
}

impl From<SiteError> for Value {
    fn from(err: SiteError) -> Self {
        err.to_value()
    }
}

/// Configuration loading errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("config parse error: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid value for {var}: {value:?}")]
    Env { var: &'static str, value: String },
    #[error("invalid config: {0}")]
    Invalid(String),
}
