use std::sync::Arc;

use sluice_core::error::{Result, SluiceError};

use crate::context::FlowContext;
use crate::retry::Retryable;
use crate::session::FlowSession;

type Predicate<T> = Box<dyn Fn(&FlowContext<T>) -> bool + Send + Sync>;

/// Named inclusion predicate applied to a batch before or after node logic.
pub struct Filter<T> {
    name: String,
    predicate: Predicate<T>,
}

impl<T> Filter<T> {
    pub fn new(
        name: impl Into<String>,
        predicate: impl Fn(&FlowContext<T>) -> bool + Send + Sync + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            predicate: Box::new(predicate),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn test(&self, context: &FlowContext<T>) -> bool {
        (self.predicate)(context)
    }
}

/// Split `contexts` into those every filter accepts and the rest.
pub(crate) fn partition<T>(
    filters: &[Arc<Filter<T>>],
    contexts: Vec<FlowContext<T>>,
) -> (Vec<FlowContext<T>>, Vec<FlowContext<T>>) {
    if filters.is_empty() {
        return (contexts, Vec::new());
    }
    contexts
        .into_iter()
        .partition(|ctx| filters.iter().all(|f| f.test(ctx)))
}

/// What an error handler did with a failed batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorOutcome {
    /// The batch was resubmitted and is still in flight.
    Retried,
    /// The failure was absorbed; the contexts retire as `ERROR`.
    Handled,
    /// Pass it on to the next handler.
    Unhandled,
}

/// Per-node failure handler, consulted before the global ones.
pub trait ErrorHandler<I>: Send + Sync {
    fn handle(
        &self,
        error: &SluiceError,
        retryable: &Retryable<I>,
        contexts: &[FlowContext<I>],
    ) -> Result<ErrorOutcome>;
}

impl<I, F> ErrorHandler<I> for F
where
    F: Fn(&SluiceError, &Retryable<I>, &[FlowContext<I>]) -> Result<ErrorOutcome> + Send + Sync,
{
    fn handle(
        &self,
        error: &SluiceError,
        retryable: &Retryable<I>,
        contexts: &[FlowContext<I>],
    ) -> Result<ErrorOutcome> {
        self(error, retryable, contexts)
    }
}

/// Handler shared by every node of a graph.
pub trait GlobalErrorHandler<I>: Send + Sync {
    fn handle(&self, node: &str, error: &SluiceError, contexts: &[FlowContext<I>])
        -> Result<ErrorOutcome>;
}

impl<I, F> GlobalErrorHandler<I> for F
where
    F: Fn(&str, &SluiceError, &[FlowContext<I>]) -> Result<ErrorOutcome> + Send + Sync,
{
    fn handle(
        &self,
        node: &str,
        error: &SluiceError,
        contexts: &[FlowContext<I>],
    ) -> Result<ErrorOutcome> {
        self(node, error, contexts)
    }
}

/// Runs after a batch has been archived by a node.
pub type ContextCallback<I> = dyn Fn(&[FlowContext<I>]) + Send + Sync;

/// Runs when a session the node took part in completes.
pub type SessionCallback = dyn Fn(&Arc<FlowSession>) + Send + Sync;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partition_requires_every_filter() {
        let session = FlowSession::new();
        let contexts: Vec<_> = (1..=6)
            .map(|i| FlowContext::new(session.clone(), i, "n"))
            .collect();
        let filters = vec![
            Arc::new(Filter::new("even", |c: &FlowContext<i32>| c.data() % 2 == 0)),
            Arc::new(Filter::new("small", |c: &FlowContext<i32>| *c.data() < 5)),
        ];

        let (kept, rejected) = partition(&filters, contexts);
        assert_eq!(kept.iter().map(|c| *c.data()).collect::<Vec<_>>(), vec![2, 4]);
        assert_eq!(rejected.len(), 4);
        assert_eq!(filters[0].name(), "even");
    }

    #[test]
    fn test_no_filters_keeps_everything() {
        let contexts = vec![FlowContext::new(FlowSession::new(), 'x', "n")];
        let (kept, rejected) = partition::<char>(&[], contexts);
        assert_eq!(kept.len(), 1);
        assert!(rejected.is_empty());
    }
}
