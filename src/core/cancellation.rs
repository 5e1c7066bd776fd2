//! 取消控制：每个后端调用 / 工具调度一个 CancellationToken
//!
//! Orchestrator 每步调用 `next_token()` 取得新令牌，旧的取消不会波及后续调用；
//! `InterruptHandle` 可跨任务克隆（如 Ctrl+C 监听），`interrupt()` 置位 interrupted 并取消当前令牌。
//! 每次 run 最多交出一次中断说明，由编排器写入日志。

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio_util::sync::CancellationToken;

/// 写入对话日志的中断说明
pub const INTERRUPTION_NOTE: &str = "[Request interrupted by user]";

#[derive(Debug, Default)]
struct Shared {
    interrupted: AtomicBool,
    run_active: AtomicBool,
    note_taken: AtomicBool,
    current: Mutex<CancellationToken>,
}

impl Shared {
    fn current(&self) -> MutexGuard<'_, CancellationToken> {
        self.current.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn interrupt(&self) -> bool {
        if !self.run_active.load(Ordering::SeqCst) {
            return false;
        }
        self.interrupted.store(true, Ordering::SeqCst);
        self.current().cancel();
        true
    }
}

/// 会话级取消控制器（由 Orchestrator 独占写入 run 生命周期）
#[derive(Debug, Default)]
pub struct CancellationController {
    shared: Arc<Shared>,
}

impl CancellationController {
    pub fn new() -> Self {
        Self::default()
    }

    /// 新一轮用户输入：清除 interrupted，标记 run 进行中
    pub fn begin_run(&self) {
        self.shared.interrupted.store(false, Ordering::SeqCst);
        self.shared.note_taken.store(false, Ordering::SeqCst);
        *self.shared.current() = CancellationToken::new();
        self.shared.run_active.store(true, Ordering::SeqCst);
    }

    pub fn end_run(&self) {
        self.shared.run_active.store(false, Ordering::SeqCst);
    }

    /// 为下一次后端调用或工具调度签发令牌；已中断时令牌生来即被取消
    pub fn next_token(&self) -> CancellationToken {
        let mut current = self.shared.current();
        let token = CancellationToken::new();
        if self.shared.interrupted.load(Ordering::SeqCst) {
            token.cancel();
        }
        *current = token.clone();
        token
    }

    pub fn is_interrupted(&self) -> bool {
        self.shared.interrupted.load(Ordering::SeqCst)
    }

    pub fn interrupt(&self) -> bool {
        self.shared.interrupt()
    }

    /// 已中断且本轮尚未记录说明时返回说明文本（每轮至多一次）
    pub fn take_interruption_note(&self) -> Option<&'static str> {
        if !self.is_interrupted() || self.shared.note_taken.swap(true, Ordering::SeqCst) {
            return None;
        }
        Some(INTERRUPTION_NOTE)
    }

    pub fn handle(&self) -> InterruptHandle {
        InterruptHandle {
            shared: Arc::clone(&self.shared),
        }
    }
}

/// 可跨任务持有的中断句柄
#[derive(Clone, Debug)]
pub struct InterruptHandle {
    shared: Arc<Shared>,
}

impl InterruptHandle {
    /// 中断当前 run；没有进行中的 run 时不做任何事并返回 false
    pub fn interrupt(&self) -> bool {
        let hit = self.shared.interrupt();
        if hit {
            tracing::info!("interrupt requested");
        }
        hit
    }

    pub fn is_running(&self) -> bool {
        self.shared.run_active.load(Ordering::SeqCst)
    }
}
