//! 会话监管：运行级取消信号
//!
//! 每次运行持有一个 CancellationToken；子会话拿到的是父 token 的 child_token，
//! 因此取消只会自上而下传播（父 -> 子），子会话取消不会影响父会话。

use tokio_util::sync::CancellationToken;

/// 单个执行会话的生命周期管理
#[derive(Debug, Clone)]
pub struct SessionSupervisor {
    session_id: String,
    cancel_token: CancellationToken,
}

impl SessionSupervisor {
    /// 新建顶层会话（随机 session id）
    pub fn new() -> Self {
        Self::with_id(uuid::Uuid::new_v4().to_string())
    }

    pub fn with_id(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            cancel_token: CancellationToken::new(),
        }
    }

    /// 使用外部传入的取消令牌（调用方负责触发）
    pub fn with_token(session_id: impl Into<String>, cancel_token: CancellationToken) -> Self {
        Self {
            session_id: session_id.into(),
            cancel_token,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel_token.clone()
    }

    /// 触发取消（用户 Ctrl+C 或上层终止）
    pub fn cancel(&self) {
        self.cancel_token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }

    /// 为子会话创建监管者：父取消时子一并取消，反之不成立
    pub fn child(&self, child_session_id: impl Into<String>) -> SessionSupervisor {
        SessionSupervisor {
            session_id: child_session_id.into(),
            cancel_token: self.cancel_token.child_token(),
        }
    }
}

impl Default for SessionSupervisor {
    fn default() -> Self {
        Self::new()
    }
}
