use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::time::{Duration, Instant};

/// 基于 token bucket 的速度限制器
/// 同一用户的所有连接共享同一个实例，限制该用户的总带宽
pub struct SpeedLimiter {
    /// 速率限制(bytes/sec)，0 = 不限速
    rate: AtomicU64,
    /// (当前可用 token 数, 上次补充时间)
    bucket: Mutex<(f64, Instant)>,
}

impl SpeedLimiter {
    pub fn new(rate: u64) -> Arc<Self> {
        Arc::new(Self {
            rate: AtomicU64::new(rate),
            bucket: Mutex::new((rate as f64, Instant::now())),
        })
    }

    /// 以 Mbps 创建
    pub fn from_mbps(mbps: u64) -> Arc<Self> {
        Self::new(mbps_to_bytes(mbps))
    }

    /// 按流逝时间补充 token，最多积攒 1 秒的量
    fn refill(available: &mut f64, last: &mut Instant, rate: u64) {
        let now = Instant::now();
        let elapsed = now.duration_since(*last);
        *last = now;
        *available = (*available + rate as f64 * elapsed.as_secs_f64()).min(rate as f64);
    }

    /// 消费指定字节数的 token，如果不够则等待
    pub async fn consume(&self, bytes: usize) {
        let mut remaining = bytes as f64;

        loop {
            let rate = self.rate.load(Ordering::Relaxed);
            if rate == 0 {
                return; // 不限速
            }

            let wait = {
                let mut guard = self.bucket.lock().unwrap_or_else(|e| e.into_inner());
                let (available, last) = &mut *guard;
                Self::refill(available, last, rate);

                if *available >= remaining {
                    *available -= remaining;
                    return;
                }
                // 消费所有可用的 token
                remaining -= *available;
                *available = 0.0;

                // 单次最多等待 1 秒，期间速率可能被更新
                Duration::from_secs_f64((remaining / rate as f64).min(1.0))
            };

            tokio::time::sleep(wait).await;
        }
    }

    /// 动态更新速率
    pub fn update_rate(&self, new_rate: u64) {
        self.rate.store(new_rate, Ordering::Relaxed);
        let mut guard = self.bucket.lock().unwrap_or_else(|e| e.into_inner());
        guard.0 = guard.0.min(new_rate as f64);
    }

    /// 获取当前速率
    pub fn get_rate(&self) -> u64 {
        self.rate.load(Ordering::Relaxed)
    }
}

/// Mbps 转换为 bytes/sec
pub fn mbps_to_bytes(mbps: u64) -> u64 {
    mbps * 1_000_000 / 8
}
