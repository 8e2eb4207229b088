//! Shared domain types for the Anvil orchestrator.
//!
//! Everything persisted to disk or exchanged between the engine and its
//! collaborators lives here: the execution map and its phase/epic/story
//! records, the progress-stage order, the structural event record, error
//! classification types and the agent executor seam.

pub mod agent;
pub mod error;
pub mod event;
pub mod execution;
pub mod ids;
pub mod stage;

pub use agent::{AgentExecutor, AgentRequest, AgentResponse, SandboxOptions, TokenUsage};
pub use error::{CommonError, DetailedError, ErrorCode, Severity};
pub use event::{
    EpicCreatedPayload, Event, EventType, PhaseCompletedPayload, StoryCreatedPayload,
    StoryProgressPayload, TeamCompositionPayload,
};
pub use execution::{
    EpicExecution, ExecutionMap, PhaseExecution, PhaseStatus, PhaseType, StoryExecution,
    TaskStatus, TeamMember, WorkStatus, phase_key,
};
pub use stage::ProgressStage;
