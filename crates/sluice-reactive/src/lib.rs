//! Reactive core: demand-driven, cancellable data flow between a producer
//! and a consumer.
//!
//! A consumer subscribes to a [`Publisher`], receives a [`Subscription`],
//! grants demand through it and is then pushed at most that many items,
//! followed by exactly one terminal signal. [`Worker`] turns any publisher
//! into an observer-driven consumption loop; [`Solo`] and [`WorkerStream`]
//! are the single-value and multi-value adapters built on it.

pub mod bridge;
pub mod counter;
pub mod observer;
pub mod once;
pub mod publisher;
pub mod solo;
pub mod stream;
pub mod subscription;
pub mod worker;

pub use bridge::{into_stream, WorkerStream};
pub use counter::{Counter, CounterObserver};
pub use observer::ObserverList;
pub use once::{OnceFlag, Terminal, TerminalSignal};
pub use publisher::{FailingPublisher, IterPublisher};
pub use solo::Solo;
pub use stream::{Publisher, Subscriber, Subscription};
pub use subscription::{CallbackSubscription, SubscriptionGuard};
pub use worker::{Worker, WorkerObserver};
