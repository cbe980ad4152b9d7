use std::sync::{Arc, Weak};
use std::time::Duration;

use sluice_core::config::RetryConfig;
use sluice_core::error::{Result, SluiceError};
use sluice_core::event::{EventBus, FlowEvent};
use sluice_core::status::FlowNodeStatus;
use tracing::{info, warn};

use crate::context::FlowContext;
use crate::node::{ErrorHandler, ErrorOutcome, ProcessTarget};
use crate::repo::ContextRepository;

/// Resubmits failed batches to the node they failed in.
pub struct Retryable<I> {
    node: String,
    repo: Arc<dyn ContextRepository<I>>,
    target: Weak<dyn ProcessTarget<I>>,
    events: Arc<EventBus>,
}

impl<I: Send + Sync + 'static> Retryable<I> {
    pub fn new(
        node: impl Into<String>,
        repo: Arc<dyn ContextRepository<I>>,
        target: Weak<dyn ProcessTarget<I>>,
        events: Arc<EventBus>,
    ) -> Self {
        Self {
            node: node.into(),
            repo,
            target,
            events,
        }
    }

    pub fn node(&self) -> &str {
        &self.node
    }

    /// Checkpoint the batch: the full context state, then its status and
    /// position. Nothing changes status here.
    pub fn process(&self, contexts: &[FlowContext<I>]) -> Result<()> {
        let Some(first) = contexts.first() else {
            return Ok(());
        };
        self.repo.update(contexts)?;
        self.repo
            .update_status(contexts, first.status(), first.position())
    }

    /// Move a failed batch to `RETRYABLE`, checkpoint it, and dispatch it
    /// back to the node.
    ///
    /// The batch must be non-empty and every context must share one status,
    /// either `ERROR` or `RETRYABLE`.
    pub fn retry(&self, contexts: Vec<FlowContext<I>>) -> Result<()> {
        self.retry_after(contexts, Duration::ZERO)
    }

    /// Like [`Retryable::retry`], but the node sees the batch again only
    /// after `delay`. The checkpoint is written before the wait.
    pub fn retry_after(&self, mut contexts: Vec<FlowContext<I>>, delay: Duration) -> Result<()> {
        let status = contexts.first().ok_or(SluiceError::EmptyBatch)?.status();
        if let Some(odd) = contexts.iter().find(|c| c.status() != status) {
            return Err(SluiceError::HeterogeneousBatch {
                expected: status,
                found: odd.status(),
            });
        }
        match status {
            FlowNodeStatus::Error => {
                for ctx in &mut contexts {
                    ctx.set_status(FlowNodeStatus::Retryable)?;
                    ctx.bump_attempt();
                }
            }
            FlowNodeStatus::Retryable => {}
            other => {
                return Err(SluiceError::IllegalState(format!(
                    "cannot retry contexts in status {}",
                    other
                )))
            }
        }
        let target = self.target.upgrade().ok_or_else(|| {
            SluiceError::IllegalState(format!("retry target {} is gone", self.node))
        })?;

        self.process(&contexts)?;

        let attempt = contexts.iter().map(|c| c.attempt()).max().unwrap_or(0);
        info!(
            node = %self.node,
            count = contexts.len(),
            attempt,
            delay_ms = delay.as_millis() as u64,
            "Retrying batch"
        );
        self.events.publish(FlowEvent::RetryDispatched {
            node: self.node.clone(),
            count: contexts.len(),
            attempt,
        });
        target.resubmit(contexts, delay)
    }
}

/// Local error handler that retries with exponential backoff while the
/// batch is under its attempt budget, and declines afterwards.
pub struct RetryErrorHandler {
    config: RetryConfig,
}

impl RetryErrorHandler {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    pub fn backoff(&self, attempt: u32) -> Duration {
        calculate_backoff(attempt, &self.config)
    }
}

fn calculate_backoff(attempt: u32, config: &RetryConfig) -> Duration {
    let ms = config
        .initial_backoff_ms
        .saturating_mul(2u64.saturating_pow(attempt))
        .min(config.max_backoff_ms);
    // Add jitter: 0.8x to 1.2x
    let jitter = 0.8 + rand::random::<f64>() * 0.4;
    Duration::from_millis((ms as f64 * jitter) as u64)
}

impl<I: Clone + Send + Sync + 'static> ErrorHandler<I> for RetryErrorHandler {
    fn handle(
        &self,
        error: &SluiceError,
        retryable: &Retryable<I>,
        contexts: &[FlowContext<I>],
    ) -> Result<ErrorOutcome> {
        let attempt = contexts.iter().map(|c| c.attempt()).max().unwrap_or(0);
        if attempt >= self.config.max_attempts {
            warn!(
                node = %retryable.node(),
                attempt,
                max_attempts = self.config.max_attempts,
                "Retry budget exhausted"
            );
            return Ok(ErrorOutcome::Unhandled);
        }

        let backoff = self.backoff(attempt);
        warn!(
            node = %retryable.node(),
            error = %error,
            attempt = attempt + 1,
            backoff_ms = backoff.as_millis() as u64,
            "Batch failed, retrying"
        );
        retryable.retry_after(contexts.to_vec(), backoff)?;
        Ok(ErrorOutcome::Retried)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repo::MemoryContextRepository;
    use crate::session::FlowSession;
    use sluice_core::status::ProcessType;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Target {
        calls: Mutex<Vec<(ProcessType, Vec<FlowNodeStatus>, bool)>>,
    }

    impl ProcessTarget<i32> for Target {
        fn id(&self) -> &str {
            "target"
        }

        fn on_process(
            &self,
            process_type: ProcessType,
            contexts: Vec<FlowContext<i32>>,
            in_thread: bool,
        ) -> Result<()> {
            self.calls.lock().unwrap().push((
                process_type,
                contexts.iter().map(|c| c.status()).collect(),
                in_thread,
            ));
            Ok(())
        }
    }

    struct Fixture {
        repo: Arc<MemoryContextRepository<i32>>,
        target: Arc<Target>,
        retryable: Retryable<i32>,
        events: Arc<EventBus>,
    }

    fn fixture() -> Fixture {
        let repo = Arc::new(MemoryContextRepository::new());
        let target = Arc::new(Target::default());
        let events = Arc::new(EventBus::new(16));
        let weak: Weak<dyn ProcessTarget<i32>> = Arc::downgrade(&target) as Weak<dyn ProcessTarget<i32>>;
        let retryable = Retryable::new("double", repo.clone(), weak, events.clone());
        Fixture {
            repo,
            target,
            retryable,
            events,
        }
    }

    fn failed(session: &Arc<FlowSession>, value: i32) -> FlowContext<i32> {
        let mut ctx = FlowContext::new(session.clone(), value, "double");
        for next in [
            FlowNodeStatus::Pending,
            FlowNodeStatus::Ready,
            FlowNodeStatus::Processing,
            FlowNodeStatus::Error,
        ] {
            ctx.set_status(next).unwrap();
        }
        ctx
    }

    #[test]
    fn test_process_is_a_checkpoint() {
        let f = fixture();
        let session = FlowSession::new();
        let batch = vec![failed(&session, 1), failed(&session, 2)];
        f.retryable.process(&batch).unwrap();

        let stored = f.repo.find_by_status(FlowNodeStatus::Error).unwrap();
        assert_eq!(stored.len(), 2);
        assert!(stored.iter().all(|r| r.position == "double"));
        assert!(f.target.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_retry_resubmits_dispatched() {
        let f = fixture();
        let mut rx = f.events.subscribe();
        let session = FlowSession::new();
        f.retryable
            .retry(vec![failed(&session, 1), failed(&session, 2)])
            .unwrap();

        let calls = f.target.calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        let (process_type, statuses, in_thread) = &calls[0];
        assert_eq!(*process_type, ProcessType::Process);
        assert_eq!(statuses, &vec![FlowNodeStatus::Retryable; 2]);
        assert!(!in_thread);
        assert_eq!(f.repo.find_by_status(FlowNodeStatus::Retryable).unwrap().len(), 2);

        assert_eq!(
            rx.recv().await.unwrap(),
            FlowEvent::RetryDispatched {
                node: "double".into(),
                count: 2,
                attempt: 1
            }
        );
    }

    #[test]
    fn test_retry_checkpoints_bumped_attempt() {
        let f = fixture();
        let session = FlowSession::new();
        let ctx = failed(&session, 1);
        let id = ctx.id().clone();
        f.repo.save(std::slice::from_ref(&ctx)).unwrap();

        f.retryable.retry(vec![ctx]).unwrap();

        let stored = f.repo.get(&id).unwrap().unwrap();
        assert_eq!(stored.status, FlowNodeStatus::Retryable);
        assert_eq!(stored.attempt, 1);
    }

    #[test]
    fn test_retry_after_waits_before_resubmitting() {
        let f = fixture();
        let session = FlowSession::new();
        let started = std::time::Instant::now();
        f.retryable
            .retry_after(vec![failed(&session, 1)], Duration::from_millis(5))
            .unwrap();

        assert!(started.elapsed() >= Duration::from_millis(5));
        assert_eq!(f.target.calls.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_retry_rejects_empty_batch() {
        let f = fixture();
        assert!(matches!(f.retryable.retry(Vec::new()), Err(SluiceError::EmptyBatch)));
    }

    #[test]
    fn test_retry_rejects_mixed_batch() {
        let f = fixture();
        let session = FlowSession::new();
        let fresh = FlowContext::new(session.clone(), 3, "double");
        let result = f.retryable.retry(vec![failed(&session, 1), fresh]);

        assert!(matches!(
            result,
            Err(SluiceError::HeterogeneousBatch {
                expected: FlowNodeStatus::Error,
                found: FlowNodeStatus::New
            })
        ));
        assert!(f.repo.is_empty());
        assert!(f.target.calls.lock().unwrap().is_empty());
    }

    #[test]
    fn test_retry_rejects_non_failed_batch() {
        let f = fixture();
        let session = FlowSession::new();
        let result = f.retryable.retry(vec![FlowContext::new(session, 1, "double")]);
        assert!(matches!(result, Err(SluiceError::IllegalState(_))));
    }

    #[test]
    fn test_handler_declines_when_budget_spent() {
        let f = fixture();
        let handler = RetryErrorHandler::new(RetryConfig {
            max_attempts: 1,
            initial_backoff_ms: 1,
            max_backoff_ms: 2,
        });
        let session = FlowSession::new();
        let error = SluiceError::node("double", "boom");

        let first = vec![failed(&session, 1)];
        assert_eq!(
            handler.handle(&error, &f.retryable, &first).unwrap(),
            ErrorOutcome::Retried
        );

        let mut spent = failed(&session, 1);
        spent.bump_attempt();
        assert_eq!(
            handler.handle(&error, &f.retryable, &[spent]).unwrap(),
            ErrorOutcome::Unhandled
        );
        assert_eq!(f.target.calls.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_backoff_grows_and_caps() {
        let handler = RetryErrorHandler::new(RetryConfig {
            max_attempts: 10,
            initial_backoff_ms: 100,
            max_backoff_ms: 1_000,
        });
        let first = handler.backoff(0).as_millis();
        let capped = handler.backoff(8).as_millis();
        assert!((80..=120).contains(&first));
        assert!((800..=1_200).contains(&capped));
    }
}
