// 线性退避重试机制
//
// 控制 HTTP 重试的间隔：第 n 次重试前等待 n × 基础延迟。
// 首次重试不等待，之后按尝试次数线性增长。

use std::time::Duration;

/// 线性退避策略
///
/// # 示例
///
/// ```
/// use update_agent::backoff::LinearBackoff;
/// use std::time::Duration;
///
/// let mut backoff = LinearBackoff::new(Duration::from_secs(5));
///
/// // 第一次重试：不等待
/// assert_eq!(backoff.next_delay(), Duration::from_secs(0));
///
/// // 第二次重试：等待 5 秒
/// assert_eq!(backoff.next_delay(), Duration::from_secs(5));
///
/// // 第三次重试：等待 10 秒
/// assert_eq!(backoff.next_delay(), Duration::from_secs(10));
/// ```
#[derive(Debug, Clone)]
pub struct LinearBackoff {
    /// 基础延迟
    base_delay: Duration,
    /// 已经历的尝试次数
    attempt: u32,
}

impl LinearBackoff {
    pub fn new(base_delay: Duration) -> Self {
        Self {
            base_delay,
            attempt: 0,
        }
    }

    /// 获取下一次重试前应等待的时间，并推进内部计数
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.base_delay.saturating_mul(self.attempt);
        self.attempt = self.attempt.saturating_add(1);
        delay
    }

    /// 重置计数（成功后调用）
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// 当前尝试次数（不推进状态）
    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}
