//! 任务调度：循环迭代与子会话的并发上限
//!
//! 按任务类型（LoopIteration / ChildSession）分类，每类使用独立 Semaphore 限制并发。

use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// 任务类型
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum TaskKind {
    /// 循环阶段内的单次迭代
    LoopIteration,
    /// 协调者派生的子会话
    ChildSession,
}

/// 任务调度器：可在多次运行间共享（Arc），限制同一时刻的扇出数量
#[derive(Debug, Clone)]
pub struct TaskScheduler {
    loop_semaphore: Arc<Semaphore>,
    child_semaphore: Arc<Semaphore>,
}

impl TaskScheduler {
    pub fn new(max_loop_fan_out: usize, max_parallel_children: usize) -> Self {
        Self {
            loop_semaphore: Arc::new(Semaphore::new(max_loop_fan_out.max(1))),
            child_semaphore: Arc::new(Semaphore::new(max_parallel_children.max(1))),
        }
    }

    /// 获取执行许可；信号量从不关闭，None 仅在被关闭时出现
    pub async fn acquire(&self, kind: TaskKind) -> Option<OwnedSemaphorePermit> {
        let semaphore = match kind {
            TaskKind::LoopIteration => &self.loop_semaphore,
            TaskKind::ChildSession => &self.child_semaphore,
        };
        semaphore.clone().acquire_owned().await.ok()
    }

    pub fn available(&self, kind: TaskKind) -> usize {
        match kind {
            TaskKind::LoopIteration => self.loop_semaphore.available_permits(),
            TaskKind::ChildSession => self.child_semaphore.available_permits(),
        }
    }
}

impl Default for TaskScheduler {
    fn default() -> Self {
        Self::new(4, 2)
    }
}
