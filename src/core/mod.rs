//! 核心层：错误与分类、会话监管（取消）、任务调度（并发上限）

pub mod error;
pub mod session_supervisor;
pub mod task_scheduler;

pub use error::{AgentError, ErrorClassification, ErrorKind, RecoveryAction};
pub use session_supervisor::SessionSupervisor;
pub use task_scheduler::{TaskKind, TaskScheduler};
