//! 执行：事件、轨迹、自我纠错与战术执行

pub mod completion;
pub mod correction;
pub mod events;
pub mod tactical;
pub mod trace;

pub use completion::{complete_traced, CompletionRetry};
pub use correction::{CorrectionPolicy, SelfCorrectionEngine};
pub use events::{event_channel, EventEnvelope, EventReceiver, EventSender, EventSink, RunEvent};
pub use tactical::{
    ExecutionReport, ExecutorSettings, PhaseOutcome, PhaseState, RunScope, SkipReason, TacticalExecutor,
};
pub use trace::{
    ActionMetadata, ExecutionTraceEntry, InvocationPurpose, PhaseEndStatus, ResultStatus, TraceEntry,
    TraceNode, TraceRecorder,
};
