//! Demand-driven dataflow runtime.
//!
//! - [`reactive`]: publishers, subscriptions, workers and adapters.
//! - [`flow`]: sessions, contexts, join windows, nodes, retry and the graph.
//! - [`core`]: errors, configuration, identifiers, status codes and events.

pub use sluice_core as core;
pub use sluice_flow as flow;
pub use sluice_reactive as reactive;

pub use sluice_core::{
    ensure_positive, EventBus, FlowEvent, FlowNodeStatus, ParallelMode, ProcessType, Result,
    RuntimeConfig, SluiceError,
};
pub use sluice_flow::{
    FlowContext, FlowGraph, FlowGraphBuilder, FlowSession, MatchWindow, ParallelJoin,
    ProcessingNode, Retryable, RetryErrorHandler, Window, WindowRegistry, WindowToken,
};
pub use sluice_reactive::{Counter, Publisher, Solo, Subscriber, Subscription, Worker};
