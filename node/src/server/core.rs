//! Core：引擎、流量计数、限制器与重载信号的持有者
//!
//! Controller 只能通过 Core 暴露的方法修改引擎中的监听器和用户，
//! 不直接持有引擎。

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::mpsc;
use tracing::{info, warn};

use common::protocol::server::{NodeInfo, ProtocolKind};
use common::protocol::user::{UserInfo, UserTraffic};
use common::ServerConfigApi;

use super::config::Config;
use super::engine::{LocalEngine, ProxyEngine};
use super::limiter::LimiterRegistry;
use super::listener::{build_listener, build_users};
use super::task::PeriodicTask;
use super::traffic::TrafficRegistry;

/// 节点标签: `[{api_host}]-{protocol}:{server_id}`
pub fn node_tag(api_host: &str, kind: ProtocolKind, server_id: i64) -> String {
    format!("[{}]-{}:{}", api_host, kind, server_id)
}

/// 用户标签: `{node_tag}|{uuid}`
pub fn user_tag(node_tag: &str, uuid: &str) -> String {
    format!("{}|{}", node_tag, uuid)
}

/// 单槽、非阻塞的重载信号
///
/// 最多只有一个待处理信号，已有信号时新的通知被直接丢弃。
#[derive(Clone)]
pub struct ReloadSignal {
    tx: mpsc::Sender<()>,
}

impl ReloadSignal {
    pub fn channel() -> (Self, mpsc::Receiver<()>) {
        let (tx, rx) = mpsc::channel(1);
        (Self { tx }, rx)
    }

    /// 发出重载信号，返回是否真正入队
    pub fn raise(&self) -> bool {
        self.tx.try_send(()).is_ok()
    }
}

pub struct Core {
    config: Arc<Config>,
    engine: Arc<dyn ProxyEngine>,
    traffic: TrafficRegistry,
    /// 用户标签 -> 用户 ID
    uid_map: RwLock<HashMap<String, i64>>,
    limiters: LimiterRegistry,
    reload: ReloadSignal,
    monitor: Mutex<Option<PeriodicTask>>,
}

impl Core {
    /// 使用进程内引擎创建 Core
    pub fn new(config: Arc<Config>, reload: ReloadSignal) -> Self {
        let traffic = TrafficRegistry::new();
        let engine = Arc::new(LocalEngine::new(traffic.clone()));
        Self::with_engine(config, engine, traffic, reload)
    }

    pub fn with_engine(
        config: Arc<Config>,
        engine: Arc<dyn ProxyEngine>,
        traffic: TrafficRegistry,
        reload: ReloadSignal,
    ) -> Self {
        Self {
            config,
            engine,
            traffic,
            uid_map: RwLock::new(HashMap::new()),
            limiters: LimiterRegistry::new(),
            reload,
            monitor: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn limiters(&self) -> &LimiterRegistry {
        &self.limiters
    }

    pub fn traffic(&self) -> &TrafficRegistry {
        &self.traffic
    }

    pub fn reload_signal(&self) -> ReloadSignal {
        self.reload.clone()
    }

    /// 注册节点监听器
    pub fn add_node(&self, tag: &str, info: &NodeInfo) -> Result<()> {
        let config = build_listener(info, tag, &self.config.cert.dir)
            .with_context(|| format!("构建监听器 {} 失败", tag))?;
        self.engine
            .add_listener(config)
            .with_context(|| format!("注册监听器 {} 失败", tag))?;
        Ok(())
    }

    /// 注销节点监听器，并清理该节点的流量计数与用户映射
    pub fn del_node(&self, tag: &str) -> Result<()> {
        self.engine
            .remove_listener(tag)
            .with_context(|| format!("注销监听器 {} 失败", tag))?;

        self.traffic.remove(tag);
        let prefix = user_tag(tag, "");
        self.uid_map
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|user, _| !user.starts_with(&prefix));
        Ok(())
    }

    /// 向节点添加用户，返回添加数量
    pub fn add_users(&self, tag: &str, info: &NodeInfo, users: &[UserInfo]) -> Result<usize> {
        let bindings = build_users(info, tag, users)
            .with_context(|| format!("构建节点 {} 的用户失败", tag))?;

        {
            let mut uid_map = self.uid_map.write().unwrap_or_else(|e| e.into_inner());
            for binding in &bindings {
                uid_map.insert(binding.user_tag.clone(), binding.uid);
            }
        }

        let added = self
            .engine
            .add_users(tag, &bindings)
            .with_context(|| format!("向节点 {} 添加用户失败", tag))?;
        Ok(added)
    }

    /// 从节点删除用户，未上报的残余流量随计数器一起丢弃
    pub fn del_users(&self, tag: &str, users: &[UserInfo]) -> Result<()> {
        let user_tags: Vec<String> = users.iter().map(|u| user_tag(tag, &u.uuid)).collect();
        self.engine
            .remove_users(tag, &user_tags)
            .with_context(|| format!("从节点 {} 删除用户失败", tag))?;

        let mut uid_map = self.uid_map.write().unwrap_or_else(|e| e.into_inner());
        let counter = self.traffic.existing(tag);
        for user in &user_tags {
            uid_map.remove(user);
            if let Some(counter) = &counter {
                counter.delete(user);
            }
        }
        Ok(())
    }

    /// 取出节点内超过阈值（KB）的用户流量并清零
    ///
    /// 计数器对应的用户已不在映射中时直接删除该计数器。
    pub fn user_traffic_slice(&self, tag: &str, threshold_kb: u64) -> Vec<UserTraffic> {
        let Some(counter) = self.traffic.existing(tag) else {
            return Vec::new();
        };

        let uid_map = self.uid_map.read().unwrap_or_else(|e| e.into_inner());
        let mut slice = Vec::new();
        for (user, upload, download) in counter.drain_over(threshold_kb.saturating_mul(1000)) {
            match uid_map.get(&user) {
                Some(&uid) => slice.push(UserTraffic {
                    uid,
                    upload,
                    download,
                }),
                None => counter.delete(&user),
            }
        }
        slice
    }

    /// 启动服务端配置变更监控，检测到变化时发出重载信号
    pub fn start_monitor(&self, api: Arc<dyn ServerConfigApi>, interval: Duration) {
        let reload = self.reload.clone();
        let mut task = PeriodicTask::new("server_config_monitor", interval, move || {
            let api = api.clone();
            let reload = reload.clone();
            async move {
                if api.fetch_server_config().await?.is_some() {
                    if reload.raise() {
                        info!("服务端配置已变更，准备重载");
                    } else {
                        info!("服务端配置已变更，已有待处理的重载");
                    }
                }
                Ok(())
            }
        });
        task.start(true);

        let mut monitor = self.monitor.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(mut old) = monitor.replace(task) {
            old.close();
        }
    }

    /// 停止配置监控并关闭引擎
    pub fn close(&self) -> Result<()> {
        if let Some(mut task) = self
            .monitor
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            task.close();
        }
        if self.limiters.len() > 0 {
            warn!("关闭 Core 时仍有 {} 个限制器未释放", self.limiters.len());
        }
        self.engine.close().context("关闭引擎失败")?;
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::server::engine::EngineError;
    use crate::server::listener::{ListenerConfig, UserBinding};
    use async_trait::async_trait;
    use common::protocol::server::{Protocol, ServerConfigResponse};
    use common::PanelError;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// 记录调用顺序的引擎
    #[derive(Default)]
    pub(crate) struct RecordingEngine {
        pub calls: Mutex<Vec<String>>,
        pub fail_add_listener: std::sync::atomic::AtomicBool,
    }

    impl RecordingEngine {
        pub fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        fn record(&self, call: String) {
            self.calls.lock().unwrap().push(call);
        }
    }

    impl ProxyEngine for RecordingEngine {
        fn add_listener(&self, config: ListenerConfig) -> Result<(), EngineError> {
            if self.fail_add_listener.load(Ordering::SeqCst) {
                return Err(EngineError::PortInUse {
                    port: config.port,
                    tag: "other".to_string(),
                });
            }
            self.record(format!("add_listener {}", config.tag));
            Ok(())
        }

        fn remove_listener(&self, tag: &str) -> Result<(), EngineError> {
            self.record(format!("remove_listener {}", tag));
            Ok(())
        }

        fn add_users(&self, tag: &str, users: &[UserBinding]) -> Result<usize, EngineError> {
            let uids: Vec<String> = users.iter().map(|u| u.uid.to_string()).collect();
            self.record(format!("add_users {} [{}]", tag, uids.join(",")));
            Ok(users.len())
        }

        fn remove_users(&self, tag: &str, user_tags: &[String]) -> Result<(), EngineError> {
            self.record(format!("remove_users {} [{}]", tag, user_tags.join(",")));
            Ok(())
        }

        fn close(&self) -> Result<(), EngineError> {
            self.record("close".to_string());
            Ok(())
        }
    }

    pub(crate) fn test_config(cert_dir: &std::path::Path) -> Arc<Config> {
        let mut config = Config::from_toml(
            "[api]\napi_host = \"http://panel.test\"\nserver_id = 1\nsecret_key = \"secret\"\n",
        )
        .unwrap();
        config.cert.dir = cert_dir.to_path_buf();
        Arc::new(config)
    }

    pub(crate) fn trojan_node() -> NodeInfo {
        NodeInfo {
            id: 1,
            kind: ProtocolKind::Trojan,
            push_interval: 60,
            pull_interval: 60,
            traffic_report_threshold: 0,
            protocol: Protocol {
                port: 8443,
                transport: "tcp".to_string(),
                ..Default::default()
            },
        }
    }

    fn user(id: i64, uuid: &str) -> UserInfo {
        UserInfo {
            id,
            uuid: uuid.to_string(),
            speed_limit: 0,
            device_limit: 0,
        }
    }

    #[test]
    fn test_tags() {
        let tag = node_tag("https://panel.example.com", ProtocolKind::Vless, 3);
        assert_eq!(tag, "[https://panel.example.com]-vless:3");
        assert_eq!(user_tag(&tag, "u1"), "[https://panel.example.com]-vless:3|u1");
    }

    #[tokio::test]
    async fn test_reload_signal_coalesces() {
        let (signal, mut rx) = ReloadSignal::channel();
        assert!(signal.raise());
        for _ in 0..100 {
            assert!(!signal.raise());
        }

        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());

        // 消费后可以再次入队，但仍只有一个
        let cloned = signal.clone();
        assert!(cloned.raise());
        assert!(!signal.raise());
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_traffic_slice_maps_uid_and_drops_orphans() {
        let dir = tempfile::tempdir().unwrap();
        let (signal, _rx) = ReloadSignal::channel();
        let core = Core::new(test_config(dir.path()), signal);
        let info = trojan_node();
        let tag = "node";

        core.add_node(tag, &info).unwrap();
        core.add_users(tag, &info, &[user(1, "a"), user(2, "b")]).unwrap();

        let counter = core.traffic().counter(tag);
        counter.add_upload(&user_tag(tag, "a"), 200_000);
        counter.add_download(&user_tag(tag, "b"), 50_000);
        counter.add_upload(&user_tag(tag, "orphan"), 500_000);

        let slice = core.user_traffic_slice(tag, 100);
        assert_eq!(
            slice,
            vec![UserTraffic {
                uid: 1,
                upload: 200_000,
                download: 0
            }]
        );
        // 没有用户映射的计数器被删除，低于阈值的保留
        assert_eq!(counter.count(), 2);

        assert!(core.user_traffic_slice("unknown", 0).is_empty());
    }

    #[test]
    fn test_traffic_slice_huge_threshold() {
        let dir = tempfile::tempdir().unwrap();
        let (signal, _rx) = ReloadSignal::channel();
        let core = Core::new(test_config(dir.path()), signal);
        let info = trojan_node();

        core.add_node("node", &info).unwrap();
        core.add_users("node", &info, &[user(1, "a")]).unwrap();
        let counter = core.traffic().counter("node");
        counter.add_upload(&user_tag("node", "a"), u64::MAX / 2);

        assert!(core.user_traffic_slice("node", u64::MAX).is_empty());
        assert_eq!(counter.count(), 1);
    }

    #[test]
    fn test_del_users_discards_residual_traffic() {
        let dir = tempfile::tempdir().unwrap();
        let (signal, _rx) = ReloadSignal::channel();
        let core = Core::new(test_config(dir.path()), signal);
        let info = trojan_node();

        core.add_node("node", &info).unwrap();
        core.add_users("node", &info, &[user(1, "a")]).unwrap();
        core.traffic().counter("node").add_upload(&user_tag("node", "a"), 999);

        core.del_users("node", &[user(1, "a")]).unwrap();
        assert!(core.user_traffic_slice("node", 0).is_empty());
        assert_eq!(core.traffic().counter("node").count(), 0);

        core.del_node("node").unwrap();
        core.close().unwrap();
        assert!(core.add_node("node", &info).is_err());
    }

    struct ChangingSource {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ServerConfigApi for ChangingSource {
        async fn fetch_server_config(&self) -> Result<Option<ServerConfigResponse>, PanelError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(Some(ServerConfigResponse {
                code: 200,
                msg: String::new(),
                data: None,
            }))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_monitor_raises_single_reload() {
        let dir = tempfile::tempdir().unwrap();
        let (signal, mut rx) = ReloadSignal::channel();
        let engine = Arc::new(RecordingEngine::default());
        let core = Core::with_engine(
            test_config(dir.path()),
            engine.clone(),
            TrafficRegistry::new(),
            signal,
        );
        let source = Arc::new(ChangingSource {
            calls: AtomicUsize::new(0),
        });

        core.start_monitor(source.clone(), Duration::from_secs(60));
        // 首次检查推迟一个间隔
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(source.calls.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_secs(200)).await;
        assert!(source.calls.load(Ordering::SeqCst) >= 3);
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());

        core.close().unwrap();
        assert_eq!(engine.calls(), vec!["close".to_string()]);
    }
}
