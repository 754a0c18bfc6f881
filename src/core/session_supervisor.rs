//! 会话监管：当前 turn 的取消令牌
//!
//! 每个 turn 开始时领取一个新的 CancellationToken；用户 Ctrl+C 时只取消当前 turn，不影响后台任务。

use tokio_util::sync::CancellationToken;

/// turn 级取消管理
#[derive(Debug, Default)]
pub struct SessionSupervisor {
    current: Option<CancellationToken>,
}

impl SessionSupervisor {
    pub fn new() -> Self {
        Self::default()
    }

    /// 为新 turn 创建令牌；上一个 turn 的令牌若仍存活会被取消
    pub fn begin_turn(&mut self) -> CancellationToken {
        if let Some(previous) = self.current.take() {
            previous.cancel();
        }
        let token = CancellationToken::new();
        self.current = Some(token.clone());
        token
    }

    /// 触发取消（用户 Ctrl+C）；返回是否有 turn 被取消
    pub fn cancel(&mut self) -> bool {
        match self.current.take() {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// turn 正常结束后释放令牌
    pub fn end_turn(&mut self) {
        self.current = None;
    }

    pub fn has_active_turn(&self) -> bool {
        self.current.is_some()
    }
}
