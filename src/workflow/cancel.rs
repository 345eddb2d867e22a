//! 协作式取消令牌
//!
//! 取消只是一个请求：令牌置位后，流程在下一个检查点（每次远端调用前、
//! 每次退避/轮询睡眠后）主动退出，不做抢占。

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// 睡眠切片，保证长等待也能及时响应取消
const SLEEP_SLICE: Duration = Duration::from_millis(50);

/// 取消令牌
///
/// 可随意 clone，所有副本共享同一个标志位。
#[derive(Clone, Debug, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// 请求取消
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    /// 是否已请求取消
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// 可中断的等待
    ///
    /// 分片睡满 `duration`；期间令牌置位则立即返回 `true`（已取消）。
    pub async fn sleep_interruptible(&self, duration: Duration) -> bool {
        let mut remaining = duration;
        while !remaining.is_zero() {
            if self.is_cancelled() {
                return true;
            }
            let slice = remaining.min(SLEEP_SLICE);
            tokio::time::sleep(slice).await;
            remaining = remaining.saturating_sub(slice);
        }
        self.is_cancelled()
    }
}
