//! Mock 后端（用于测试与离线运行，无需 API）
//!
//! 按脚本依次返回回复 / 错误 / 永久挂起；脚本耗尽后回显最后一条 User 消息作为最终文本。
//! 记录每次收到的对话日志快照，便于断言「没有再发起后端调用」。

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;

use crate::llm::{Backend, BackendError, BackendReply, GenerationOptions};
use crate::memory::{Role, Turn};

/// 脚本中的一步
#[derive(Debug, Clone)]
pub enum MockStep {
    Reply(BackendReply),
    Fail(BackendError),
    /// 永不返回，直到调用方取消（丢弃 future）
    Hang,
}

/// Mock 后端：脚本化回复，回显兜底
#[derive(Debug, Default)]
pub struct MockBackend {
    steps: Mutex<VecDeque<MockStep>>,
    repeat: Option<MockStep>,
    init_error: Option<BackendError>,
    init_calls: AtomicUsize,
    requests: Mutex<Vec<Vec<Turn>>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

impl MockBackend {
    /// 无脚本：回显
    pub fn new() -> Self {
        Self::default()
    }

    pub fn scripted(steps: impl IntoIterator<Item = MockStep>) -> Self {
        Self {
            steps: Mutex::new(steps.into_iter().collect()),
            ..Self::default()
        }
    }

    /// 脚本耗尽后重复返回该步（而非回显）
    pub fn repeating(mut self, step: MockStep) -> Self {
        self.repeat = Some(step);
        self
    }

    /// initialize 总是失败
    pub fn failing_init(mut self, err: BackendError) -> Self {
        self.init_error = Some(err);
        self
    }

    pub fn request_count(&self) -> usize {
        lock(&self.requests).len()
    }

    /// 每次 send 收到的日志快照
    pub fn requests(&self) -> Vec<Vec<Turn>> {
        lock(&self.requests).clone()
    }

    pub fn init_count(&self) -> usize {
        self.init_calls.load(Ordering::SeqCst)
    }

    fn next_step(&self, turns: &[Turn]) -> MockStep {
        if let Some(step) = lock(&self.steps).pop_front() {
            return step;
        }
        if let Some(step) = &self.repeat {
            return step.clone();
        }
        let last_user = turns
            .iter()
            .rev()
            .find(|t| t.role == Role::User)
            .map(|t| t.content.as_str())
            .unwrap_or("(no input)");
        MockStep::Reply(BackendReply::text(format!("Echo from Mock: {last_user}")))
    }
}

#[async_trait]
impl Backend for MockBackend {
    fn name(&self) -> &str {
        "mock"
    }

    async fn initialize(&self) -> Result<(), BackendError> {
        self.init_calls.fetch_add(1, Ordering::SeqCst);
        match &self.init_error {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    async fn send(&self, turns: &[Turn], _options: &GenerationOptions) -> Result<BackendReply, BackendError> {
        lock(&self.requests).push(turns.to_vec());
        match self.next_step(turns) {
            MockStep::Reply(reply) => Ok(reply),
            MockStep::Fail(err) => Err(err),
            MockStep::Hang => std::future::pending().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_echoes_last_user_message() {
        let backend = MockBackend::new();
        let turns = vec![Turn::system("s"), Turn::user("hello")];
        let reply = backend.send(&turns, &GenerationOptions::default()).await.unwrap();
        assert_eq!(reply.text, "Echo from Mock: hello");
        assert_eq!(backend.request_count(), 1);
    }

    #[tokio::test]
    async fn test_mock_script_then_repeat() {
        let backend = MockBackend::scripted([MockStep::Fail(BackendError::Network("x".into()))])
            .repeating(MockStep::Reply(BackendReply::text("again")));
        let turns = vec![Turn::system("s")];
        assert!(backend.send(&turns, &GenerationOptions::default()).await.is_err());
        for _ in 0..3 {
            let reply = backend.send(&turns, &GenerationOptions::default()).await.unwrap();
            assert_eq!(reply.text, "again");
        }
    }

    #[tokio::test]
    async fn test_mock_failing_init() {
        let backend = MockBackend::new().failing_init(BackendError::Init("boom".into()));
        assert!(backend.initialize().await.is_err());
        assert_eq!(backend.init_count(), 1);
    }
}
