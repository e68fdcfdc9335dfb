pub mod clock;
pub mod config;
pub mod errors;
pub mod events;
pub mod executor_registry;
pub mod logging;
pub mod models;
pub mod status_aggregator;
pub mod traits;

pub use clock::{Clock, SystemClock};
pub use config::{
    DispatcherConfig, EngineConfig, ObservabilityConfig, WorkerPoolConfig, WorkflowConfig,
};
pub use errors::{OrchestratorError, OrchestratorResult};
pub use events::{EngineEvent, EngineEventListener, EventBus};
pub use executor_registry::{DefaultExecutorRegistry, ExecutorInfo};
pub use logging::{init_logging, init_logging_from_config};
pub use models::*;
pub use status_aggregator::{EngineMetrics, MetricsAggregator};
pub use traits::{Executor, ExecutorRegistry};
