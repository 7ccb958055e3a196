// 进度事件节流器
//
// 控制进度事件的发布频率，避免事件风暴
// 使用原子 CAS 避免锁竞争，多个分片可共享同一节流器

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// 默认节流间隔（毫秒）
pub const DEFAULT_THROTTLE_INTERVAL_MS: u64 = 200;

/// 进度事件节流器
///
/// 典型用法：每次进度变化时调用 `should_emit()`，返回 true 时才发布事件
#[derive(Debug)]
pub struct ProgressThrottler {
    /// 计时起点
    start: Instant,
    /// 上次发布的时间戳（相对起点的纳秒数）
    last_emit_nanos: AtomicU64,
    /// 节流间隔（纳秒）
    interval_nanos: u64,
}

impl ProgressThrottler {
    /// 创建节流器
    pub fn new(interval: Duration) -> Self {
        Self {
            start: Instant::now(),
            last_emit_nanos: AtomicU64::new(0),
            interval_nanos: interval.as_nanos() as u64,
        }
    }

    /// 使用指定毫秒间隔创建
    pub fn with_millis(interval_ms: u64) -> Self {
        Self::new(Duration::from_millis(interval_ms))
    }

    /// 是否应该发布事件
    ///
    /// 距上次发布超过节流间隔时返回 true 并推进时间戳；
    /// CAS 失败说明被其他线程抢先，本次不发布
    pub fn should_emit(&self) -> bool {
        let now = self.now_nanos();
        let last = self.last_emit_nanos.load(Ordering::Relaxed);

        if now.saturating_sub(last) >= self.interval_nanos {
            self.last_emit_nanos
                .compare_exchange_weak(last, now, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
        } else {
            false
        }
    }

    /// 强制发布（完成或最后一次更新时使用），不检查间隔
    pub fn force_emit(&self) {
        self.last_emit_nanos
            .store(self.now_nanos(), Ordering::Relaxed);
    }

    /// 当前时间戳（纳秒）
    ///
    /// 偏移一个节流间隔，保证构造后的首次 should_emit 即可发布
    fn now_nanos(&self) -> u64 {
        self.start.elapsed().as_nanos() as u64 + self.interval_nanos
    }
}

impl Default for ProgressThrottler {
    fn default() -> Self {
        Self::with_millis(DEFAULT_THROTTLE_INTERVAL_MS)
    }
}
