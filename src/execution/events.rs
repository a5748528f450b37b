//! 运行过程事件：供展示层流式消费
//!
//! 每个事件包在 EventEnvelope 中，携带会话 id、执行深度与 cursor（发出时的 trace 长度），
//! 实时跟随与回放使用同一游标。核心不关心有没有消费者：通道为空或已关闭时直接丢弃。

use serde::Serialize;
use tokio::sync::mpsc;

/// 单个运行事件
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunEvent {
    PhaseStart {
        phase_num: u32,
        total_phases: u32,
        goal: String,
    },
    PhaseEnd {
        phase_num: u32,
        total_phases: u32,
        status: String,
    },
    ToolInvoked {
        phase_num: u32,
        tool: String,
        attempt: u32,
        iteration: Option<usize>,
    },
    ToolCompleted {
        phase_num: u32,
        tool: String,
        ok: bool,
        /// 结果预览，避免过长
        preview: String,
    },
    /// 自我纠错动作（lookup_and_retry / retry_after / abort）
    Recovery {
        phase_num: u32,
        kind: String,
        action: String,
    },
    RoutingDecision {
        experts: Vec<String>,
        rationale: String,
    },
    ChildInvoked {
        child_session_id: String,
        profile_id: String,
        execution_order: u32,
    },
    ChildCompleted {
        child_session_id: String,
        profile_id: String,
        status: String,
    },
    SynthesisStart {
        children: usize,
    },
    RunComplete {
        status: String,
        fast_path: bool,
    },
}

/// 事件信封
#[derive(Debug, Clone, Serialize)]
pub struct EventEnvelope {
    pub session_id: String,
    pub execution_depth: u32,
    pub cursor: usize,
    pub event: RunEvent,
}

pub type EventSender = mpsc::UnboundedSender<EventEnvelope>;
pub type EventReceiver = mpsc::UnboundedReceiver<EventEnvelope>;

pub fn event_channel() -> (EventSender, EventReceiver) {
    mpsc::unbounded_channel()
}

/// 某个会话的事件出口；子会话共享同一通道，深度 + 1
#[derive(Debug, Clone)]
pub struct EventSink {
    session_id: String,
    depth: u32,
    tx: Option<EventSender>,
}

impl EventSink {
    pub fn new(session_id: impl Into<String>, tx: Option<EventSender>) -> Self {
        Self {
            session_id: session_id.into(),
            depth: 0,
            tx,
        }
    }

    pub fn disabled() -> Self {
        Self::new("", None)
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn depth(&self) -> u32 {
        self.depth
    }

    /// 子会话的事件出口
    pub fn nested(&self, child_session_id: impl Into<String>) -> Self {
        Self {
            session_id: child_session_id.into(),
            depth: self.depth + 1,
            tx: self.tx.clone(),
        }
    }

    pub fn emit(&self, cursor: usize, event: RunEvent) {
        tracing::debug!(session = %self.session_id, cursor, ?event, "run event");
        if let Some(tx) = &self.tx {
            let _ = tx.send(EventEnvelope {
                session_id: self.session_id.clone(),
                execution_depth: self.depth,
                cursor,
                event,
            });
        }
    }
}

/// 结果预览：最多 max_chars 个字符
pub fn preview(text: &str, max_chars: usize) -> String {
    if text.chars().count() > max_chars {
        format!("{}...", text.chars().take(max_chars).collect::<String>())
    } else {
        text.to_string()
    }
}
