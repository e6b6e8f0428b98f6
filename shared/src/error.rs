//! Domain errors raised by the pure lifecycle and query-gate logic

use thiserror::Error;

use crate::models::BlockStatus;

/// Errors from applying a block lifecycle operation
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LifecycleError {
    #[error("Invalid transition from {current} to {requested}; allowed: {}", format_statuses(.allowed))]
    InvalidTransition {
        current: BlockStatus,
        requested: BlockStatus,
        allowed: Vec<BlockStatus>,
    },

    #[error("{field}: {message}")]
    Validation { field: String, message: String },
}

impl LifecycleError {
    pub fn validation(field: &str, message: impl Into<String>) -> Self {
        LifecycleError::Validation {
            field: field.to_string(),
            message: message.into(),
        }
    }
}

/// A generated query rejected by the security and resource gate.
///
/// Carries the offending operator name and stage index, never the rejected
/// value itself.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{reason}")]
pub struct QueryValidationError {
    pub reason: String,
    pub operator: Option<String>,
    pub stage: Option<usize>,
}

impl QueryValidationError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            operator: None,
            stage: None,
        }
    }

    pub fn at_stage(mut self, stage: usize) -> Self {
        self.stage = Some(stage);
        self
    }

    pub fn with_operator(mut self, operator: impl Into<String>) -> Self {
        self.operator = Some(operator.into());
        self
    }
}

fn format_statuses(statuses: &[BlockStatus]) -> String {
    statuses
        .iter()
        .map(|s| s.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}
