use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SluiceError};

/// Lifecycle state of a context as it traverses a node.
///
/// Forward order: `NEW -> PENDING -> READY -> PROCESSING -> {ARCHIVED | TERMINATE | ERROR}`.
/// The only way back is the retry loop `ERROR -> RETRYABLE -> PROCESSING`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FlowNodeStatus {
    /// Freshly emitted, not yet handed to a node.
    New,
    /// Waiting on the edge in front of a node.
    Pending,
    /// Entered the node, not yet picked up.
    Ready,
    /// Being processed.
    Processing,
    /// Processed successfully.
    Archived,
    /// Stopped, either by a handler or because its session was terminated.
    Terminate,
    /// Processing failed.
    Error,
    /// Scheduled for another processing attempt.
    Retryable,
}

impl FlowNodeStatus {
    pub const ALL: [FlowNodeStatus; 8] = [
        FlowNodeStatus::New,
        FlowNodeStatus::Pending,
        FlowNodeStatus::Ready,
        FlowNodeStatus::Processing,
        FlowNodeStatus::Archived,
        FlowNodeStatus::Terminate,
        FlowNodeStatus::Error,
        FlowNodeStatus::Retryable,
    ];

    /// NEW, PENDING, READY or PROCESSING.
    pub fn is_running_status(&self) -> bool {
        matches!(
            self,
            FlowNodeStatus::New
                | FlowNodeStatus::Pending
                | FlowNodeStatus::Ready
                | FlowNodeStatus::Processing
        )
    }

    /// ARCHIVED, ERROR or TERMINATE.
    pub fn is_end_status(&self) -> bool {
        matches!(
            self,
            FlowNodeStatus::Archived | FlowNodeStatus::Error | FlowNodeStatus::Terminate
        )
    }

    /// Whether moving from `self` to `next` is a legal step.
    ///
    /// Running contexts may always be terminated (their session was stopped).
    pub fn can_transition_to(&self, next: FlowNodeStatus) -> bool {
        use FlowNodeStatus::*;
        match (self, next) {
            (New, Pending) | (Pending, Ready) | (Ready, Processing) => true,
            (Processing, Archived) | (Processing, Error) => true,
            (Error, Retryable) | (Retryable, Processing) => true,
            (from, Terminate) => from.is_running_status(),
            _ => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FlowNodeStatus::New => "NEW",
            FlowNodeStatus::Pending => "PENDING",
            FlowNodeStatus::Ready => "READY",
            FlowNodeStatus::Processing => "PROCESSING",
            FlowNodeStatus::Archived => "ARCHIVED",
            FlowNodeStatus::Terminate => "TERMINATE",
            FlowNodeStatus::Error => "ERROR",
            FlowNodeStatus::Retryable => "RETRYABLE",
        }
    }
}

impl fmt::Display for FlowNodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FlowNodeStatus {
    type Err = SluiceError;

    fn from_str(s: &str) -> Result<Self> {
        FlowNodeStatus::ALL
            .iter()
            .copied()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| SluiceError::InvalidArgument(format!("unknown FlowNodeStatus: {}", s)))
    }
}

/// Join semantics for sibling branches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParallelMode {
    /// Release only once every branch completed.
    All,
    /// Release as soon as one branch completed; siblings are completed with it.
    Either,
}

impl ParallelMode {
    pub fn code(&self) -> &'static str {
        match self {
            ParallelMode::All => "all",
            ParallelMode::Either => "either",
        }
    }

    pub fn parse_from(code: &str) -> Result<Self> {
        match code {
            "all" => Ok(ParallelMode::All),
            "either" => Ok(ParallelMode::Either),
            other => Err(SluiceError::InvalidArgument(format!(
                "unknown ParallelMode code: {}",
                other
            ))),
        }
    }
}

impl FromStr for ParallelMode {
    type Err = SluiceError;

    fn from_str(s: &str) -> Result<Self> {
        ParallelMode::parse_from(s)
    }
}

/// Which entry point a batch arrived through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessType {
    PreProcess,
    Process,
}
