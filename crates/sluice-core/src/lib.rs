pub mod config;
pub mod error;
pub mod event;
pub mod status;
pub mod telemetry;
pub mod types;

pub use config::RuntimeConfig;
pub use error::{ensure_positive, Result, SluiceError};
pub use event::{EventBus, FlowEvent};
pub use status::{FlowNodeStatus, ParallelMode, ProcessType};
pub use types::*;
