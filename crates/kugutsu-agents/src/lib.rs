//! External-collaborator traits for the pipeline core: the planning agent
//! (task source), development agents, and review agents. The core treats
//! every implementer of these traits as an opaque callable: it never
//! inspects how a task gets planned or how an agent produces its result.

pub mod abort;
pub mod agent;
pub mod factory;
pub mod source;

pub use abort::AbortSignal;
pub use agent::{AgentError, DevelopmentAgent, EngineerHandle, ReviewAgent};
pub use factory::EngineerFactory;
pub use source::{FixtureTaskSource, RawTask, TaskSource, TaskSourceError, TaskSourceOutput};
