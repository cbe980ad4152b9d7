use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::Stream;
use sluice_core::error::{Result, SluiceError};
use tokio::sync::mpsc;
use tracing::warn;

use crate::stream::{Publisher, Subscription};
use crate::worker::{Worker, WorkerObserver};

enum Signal<T> {
    Item(T),
    Failed(SluiceError),
    Completed,
}

struct ChannelObserver<T> {
    tx: mpsc::UnboundedSender<Signal<T>>,
}

impl<T: Send> WorkerObserver<T> for ChannelObserver<T> {
    fn on_subscribed(&self, _subscription: &Arc<dyn Subscription>) -> Result<()> {
        Ok(())
    }

    fn on_consumed(&self, item: T, _sequence: u64) -> Result<()> {
        // A closed channel means the stream was dropped and the worker is
        // already cancelled.
        let _ = self.tx.send(Signal::Item(item));
        Ok(())
    }

    fn on_failed(&self, error: SluiceError) -> Result<()> {
        let _ = self.tx.send(Signal::Failed(error));
        Ok(())
    }

    fn on_completed(&self) -> Result<()> {
        let _ = self.tx.send(Signal::Completed);
        Ok(())
    }
}

/// A [`Publisher`] consumed as a `futures::Stream`.
///
/// At most `prefetch` items are outstanding at any time; demand is topped up
/// once three quarters of the prefetch window has been polled. Dropping the
/// stream cancels upstream.
pub struct WorkerStream<T> {
    rx: mpsc::UnboundedReceiver<Signal<T>>,
    worker: Arc<Worker<T>>,
    limit: usize,
    consumed: usize,
    done: bool,
}

/// Subscribe to `publisher` and expose its signals as a stream of `Result<T>`.
pub fn into_stream<T: Send + 'static>(
    publisher: Arc<dyn Publisher<T>>,
    prefetch: usize,
) -> WorkerStream<T> {
    let prefetch = prefetch.max(1);
    let (tx, rx) = mpsc::unbounded_channel();
    let worker = Worker::create(Arc::new(ChannelObserver { tx }), publisher, prefetch as u64);
    worker.run();
    WorkerStream {
        rx,
        worker,
        limit: (prefetch - prefetch / 4).max(1),
        consumed: 0,
        done: false,
    }
}

impl<T: Send + 'static> WorkerStream<T> {
    fn replenish(&mut self) {
        self.consumed += 1;
        if self.consumed < self.limit {
            return;
        }
        let count = i64::try_from(self.consumed).unwrap_or(i64::MAX);
        self.consumed = 0;
        if let Err(e) = self.worker.request(count) {
            warn!(error = %e, "Failed to replenish stream demand");
        }
    }
}

impl<T: Send + 'static> Stream for WorkerStream<T> {
    type Item = Result<T>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.done {
            return Poll::Ready(None);
        }
        match this.rx.poll_recv(cx) {
            Poll::Ready(Some(Signal::Item(item))) => {
                this.replenish();
                Poll::Ready(Some(Ok(item)))
            }
            Poll::Ready(Some(Signal::Failed(error))) => {
                this.done = true;
                Poll::Ready(Some(Err(error)))
            }
            Poll::Ready(Some(Signal::Completed)) | Poll::Ready(None) => {
                this.done = true;
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl<T> Drop for WorkerStream<T> {
    fn drop(&mut self) {
        if !self.done {
            self.worker.cancel();
        }
    }
}
