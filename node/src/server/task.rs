//! 周期任务
//!
//! 每个任务对应一个独立的后台 tokio 任务，按固定间隔串行执行同一个动作。
//! 上一次执行未结束时不会开始下一次；错过的 tick 直接跳过。
//! 关闭后重新启动的任务会等待旧的执行结束后才开始。

use futures::future::BoxFuture;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

type Action = Arc<dyn Fn() -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

pub struct PeriodicTask {
    name: String,
    interval: Duration,
    action: Action,
    /// 跨重启共享，保证同一任务的动作不会并发执行
    run_lock: Arc<Mutex<()>>,
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl PeriodicTask {
    pub fn new<F, Fut>(name: impl Into<String>, interval: Duration, action: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let action: Action = Arc::new(move || Box::pin(action()));
        Self {
            name: name.into(),
            interval,
            action,
            run_lock: Arc::new(Mutex::new(())),
            cancel: CancellationToken::new(),
            handle: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.handle.is_some() && !self.cancel.is_cancelled()
    }

    /// 启动任务
    ///
    /// `delay` 为 true 时首次执行推迟一个间隔，否则立即执行一次。
    /// 已启动的任务重复调用无效果；关闭后可以重新启动。
    pub fn start(&mut self, delay: bool) {
        if self.is_running() {
            return;
        }

        self.cancel = CancellationToken::new();
        let cancel = self.cancel.clone();
        let action = self.action.clone();
        let run_lock = self.run_lock.clone();
        let name = self.name.clone();
        let period = self.interval;

        self.handle = Some(tokio::spawn(async move {
            let start = if delay {
                Instant::now() + period
            } else {
                Instant::now()
            };
            let mut ticker = tokio::time::interval_at(start, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                let _running = run_lock.lock().await;
                // close() 返回后不再开始新的执行
                if cancel.is_cancelled() {
                    break;
                }

                if let Err(e) = action().await {
                    error!("周期任务 {} 执行失败: {:#}", name, e);
                }
            }

            debug!("周期任务 {} 已停止", name);
        }));
    }

    /// 停止任务
    ///
    /// 不会中断正在进行的执行，但保证返回后不会再开始新的执行。
    /// 之后的 start 会等这次执行结束再运行动作。
    pub fn close(&mut self) {
        self.cancel.cancel();
        self.handle = None;
    }
}

impl Drop for PeriodicTask {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
