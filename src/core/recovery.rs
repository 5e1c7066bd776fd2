//! 错误恢复引擎
//!
//! 将 BackendError 映射为 RecoveryAction：认证失败直接 Abort；限流、网络、服务端错误等
//! 交给调用方决定是否重试，并给出指数退避时长（后端给出 retry_after 时以其为准）。

use std::time::Duration;

use crate::config::RetrySection;
use crate::core::RecoveryAction;
use crate::llm::BackendError;

/// 语义化错误恢复：错误 -> 动作
#[derive(Debug, Clone)]
pub struct RecoveryEngine {
    base_delay: Duration,
    max_delay: Duration,
}

impl Default for RecoveryEngine {
    fn default() -> Self {
        Self::new(&RetrySection::default())
    }
}

impl RecoveryEngine {
    pub fn new(retry: &RetrySection) -> Self {
        Self {
            base_delay: Duration::from_millis(retry.base_delay_ms),
            max_delay: Duration::from_millis(retry.max_delay_ms.max(retry.base_delay_ms)),
        }
    }

    /// attempt 为连续失败次数（从 1 开始）
    pub fn handle(&self, err: &BackendError, attempt: u32) -> RecoveryAction {
        if err.is_fatal() {
            return RecoveryAction::Abort;
        }
        let backoff = match err.retry_after() {
            Some(after) => after.min(self.max_delay),
            None => self.backoff(attempt),
        };
        RecoveryAction::AskRetry {
            message: err.to_string(),
            backoff,
        }
    }

    /// min(base * 2^(attempt-1), max)
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        self.base_delay
            .saturating_mul(1u32 << exp)
            .min(self.max_delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine() -> RecoveryEngine {
        RecoveryEngine::new(&RetrySection {
            base_delay_ms: 100,
            max_delay_ms: 1000,
        })
    }

    #[test]
    fn test_recovery_auth_is_abort() {
        let action = engine().handle(&BackendError::Authentication("bad key".into()), 1);
        assert_eq!(action, RecoveryAction::Abort);
    }

    #[test]
    fn test_recovery_network_asks_retry() {
        let action = engine().handle(&BackendError::Network("reset".into()), 1);
        match action {
            RecoveryAction::AskRetry { message, backoff } => {
                assert!(message.contains("reset"));
                assert_eq!(backoff, Duration::from_millis(100));
            }
            _ => panic!("Expected AskRetry"),
        }
    }

    #[test]
    fn test_recovery_backoff_grows_and_caps() {
        let e = engine();
        assert_eq!(e.backoff(1), Duration::from_millis(100));
        assert_eq!(e.backoff(2), Duration::from_millis(200));
        assert_eq!(e.backoff(3), Duration::from_millis(400));
        assert_eq!(e.backoff(10), Duration::from_millis(1000));
        assert_eq!(e.backoff(u32::MAX), Duration::from_millis(1000));
    }

    #[test]
    fn test_recovery_rate_limit_honors_retry_after() {
        let err = BackendError::RateLimited {
            retry_after_ms: Some(700),
        };
        match engine().handle(&err, 1) {
            RecoveryAction::AskRetry { backoff, .. } => {
                assert_eq!(backoff, Duration::from_millis(700))
            }
            _ => panic!("Expected AskRetry"),
        }
    }
}
