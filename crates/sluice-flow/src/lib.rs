pub mod context;
mod fanin;
pub mod graph;
pub mod node;
pub mod repo;
pub mod retry;
pub mod session;
pub mod window;

pub use context::{ContextRecord, FlowContext};
pub use graph::{FlowGraph, FlowGraphBuilder};
pub use node::{
    Block, Collector, Dispatcher, Emitter, EmitterListener, ErrorHandler, ErrorOutcome, Filter,
    FlowSubscriber, GlobalErrorHandler, InlineDispatcher, NodeProcessor, NodeServices,
    ProcessTarget, ProcessingNode, TokioDispatcher,
};
pub use repo::{
    open_repository, ContextRepository, MemoryContextRepository, SqliteContextRepository,
};
pub use retry::{RetryErrorHandler, Retryable};
pub use session::{FlowSession, SessionListener, SessionState};
pub use window::{
    MatchWindow, ParallelJoin, Window, WindowEvents, WindowListener, WindowRegistry, WindowToken,
};
