pub mod cert;
pub mod config;
pub mod controller;
pub mod core;
pub mod engine;
pub mod limiter;
pub mod listener;
pub mod node;
pub mod panel;
pub mod speed_limiter;
pub mod status;
pub mod task;
pub mod traffic;

use anyhow::{anyhow, Context, Result};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};
use tracing::{debug, error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use common::ServerConfigApi;

use self::config::{Config, LogConfig};
use self::core::{Core, ReloadSignal};
use self::node::Node;
use self::panel::ServerClient;
use self::task::PeriodicTask;

/// 配置文件变更检查间隔
const CONFIG_WATCH_INTERVAL: Duration = Duration::from_secs(10);

/// 运行中的 Core 与节点集合
struct Running {
    core: Arc<Core>,
    node: Node,
}

impl Running {
    async fn close(mut self) {
        if let Err(e) = self.node.close().await {
            error!("关闭节点失败: {:#}", e);
        }
        if let Err(e) = self.core.close() {
            error!("关闭 Core 失败: {:#}", e);
        }
    }
}

/// 初始化日志：RUST_LOG 优先，其次使用配置中的日志级别
///
/// 返回的 guard 需要在进程退出前一直持有，否则文件日志可能丢失。
fn init_logging(log: &LogConfig) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&log.level));

    // 按天轮转文件日志或控制台日志
    if let Some(dir) = &log.output {
        let file_appender = tracing_appender::rolling::daily(dir, "node.log");
        let (writer, guard) = tracing_appender::non_blocking(file_appender);
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer().with_writer(writer).with_ansi(false))
            .init();
        Some(guard)
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt::layer())
            .init();
        None
    }
}

/// 加载配置、拉取服务端配置并启动所有节点
async fn boot(config_path: &Path, reload: ReloadSignal) -> Result<Running> {
    let config = Arc::new(Config::from_file(config_path)?);
    let server_api = Arc::new(ServerClient::new(&config.api)?);

    let response = server_api
        .fetch_server_config()
        .await
        .context("拉取服务端配置失败")?
        .ok_or_else(|| anyhow!("面板未返回服务端配置"))?;
    let data = response
        .data
        .ok_or_else(|| anyhow!("服务端配置缺少 data 字段"))?;

    let core = Arc::new(Core::new(config.clone(), reload));
    let mut node = Node::from_panel(core.clone(), &config, &data)?;
    if let Err(e) = node.start().await {
        if let Err(close_err) = core.close() {
            error!("关闭 Core 失败: {:#}", close_err);
        }
        return Err(e);
    }

    core.start_monitor(server_api, Duration::from_secs(data.pull_interval_secs()));
    if node.is_empty() {
        warn!("面板未下发可运行的节点，等待服务端配置变更");
    }
    info!(
        "已启动 {} 个节点（共 {} 个，{} 个已禁用）",
        node.len(),
        node.total(),
        node.disabled()
    );
    Ok(Running { core, node })
}

fn modified_time(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}

/// 轮询配置文件修改时间，变化时发出重载信号
fn watch_config(path: PathBuf, reload: ReloadSignal) -> PeriodicTask {
    let last = Arc::new(Mutex::new(modified_time(&path)));
    PeriodicTask::new("config_watcher", CONFIG_WATCH_INTERVAL, move || {
        let path = path.clone();
        let reload = reload.clone();
        let last = last.clone();
        async move {
            let current = modified_time(&path);
            let changed = {
                let mut last = last.lock().unwrap_or_else(|e| e.into_inner());
                let changed = current.is_some() && current != *last;
                *last = current;
                changed
            };
            if changed {
                info!("配置文件 {} 已变更，准备重载", path.display());
                reload.raise();
            }
            Ok(())
        }
    })
}

/// 关闭当前实例并按最新配置重建
///
/// 重建失败时不恢复旧实例，保持停止状态等待人工处理。
async fn reload(
    running: Option<Running>,
    config_path: &Path,
    signal: ReloadSignal,
) -> Option<Running> {
    info!("开始重载");
    if let Some(running) = running {
        running.close().await;
    }

    match boot(config_path, signal).await {
        Ok(running) => {
            info!("重载完成");
            Some(running)
        }
        Err(e) => {
            error!("重载失败，节点已停止: {:#}", e);
            None
        }
    }
}

/// 节点服务入口
pub async fn run_server(config_path: PathBuf, watch: bool) -> Result<()> {
    let config = Config::from_file(&config_path)?;
    let _log_guard = init_logging(&config.log);

    info!("节点服务启动，配置文件: {}", config_path.display());
    info!("面板地址: {}，服务器 ID: {}", config.api_host(), config.api.server_id);

    let (signal, mut reload_rx) = ReloadSignal::channel();
    let mut running = Some(boot(&config_path, signal.clone()).await?);

    let mut watcher = watch.then(|| {
        let mut task = watch_config(config_path.clone(), signal.clone());
        task.start(true);
        task
    });

    #[cfg(unix)]
    let mut sigterm = {
        use tokio::signal::unix::{signal, SignalKind};
        signal(SignalKind::terminate()).context("注册 SIGTERM 处理失败")?
    };

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("收到 Ctrl+C 信号，正在关闭服务...");
                break;
            }
            _ = async {
                #[cfg(unix)]
                {
                    sigterm.recv().await;
                }
                #[cfg(not(unix))]
                {
                    std::future::pending::<()>().await;
                }
            } => {
                info!("收到 SIGTERM 信号，正在关闭服务...");
                break;
            }
            Some(()) = reload_rx.recv() => {
                running = reload(running.take(), &config_path, signal.clone()).await;
                if running.is_none() {
                    warn!("当前没有运行中的节点，修正配置后将再次尝试重载");
                }
            }
        }
    }

    if let Some(mut task) = watcher.take() {
        task.close();
    }
    if let Some(running) = running.take() {
        running.close().await;
    }
    debug!("节点服务已退出");
    Ok(())
}
