//! The Develop -> Review -> Merge pipeline scheduler core.
//!
//! Owns the dependency graph, the three bounded work queues, the serialized
//! merge coordinator, the typed event bus that wires them together, and the
//! completion reporter. Development/review agents, the planning agent, and
//! any human-facing log transport are external collaborators, specified
//! only by the traits in `kugutsu-agents` and [`coordinator::PipelineObserver`].

pub mod completion_reporter;
pub mod config;
pub mod coordinator;
pub mod dependency_graph;
pub mod development_queue;
pub mod event_bus;
pub mod merge_coordinator;
pub mod review_queue;
pub mod task_queue;
pub mod task_resolution;

pub use completion_reporter::CompletionReporter;
pub use config::{ConfigError, PipelineConfig};
pub use coordinator::{CoordinatorError, CoordinatorStats, NullObserver, PipelineCoordinator, PipelineObserver};
pub use dependency_graph::{DependencyGraphError, DependencyManager, StatusSummary, TaskDependencyStatus};
pub use development_queue::{DevelopmentItem, DevelopmentQueue};
pub use event_bus::{EventBus, Handler, Registration};
pub use merge_coordinator::{MergeCoordinator, MergeItem};
pub use review_queue::{ReviewItem, ReviewQueue};
pub use task_queue::{Outcome, Processor, QueueItem, TaskQueue, TaskQueueStats};
pub use task_resolution::{resolve_tasks, TaskResolutionError};
