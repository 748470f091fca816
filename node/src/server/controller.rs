//! 节点控制器
//!
//! 每个协议节点一个 Controller，负责：
//! - 启动时拉取用户、注册限制器、准备证书、注册监听器与用户
//! - 按拉取间隔对账用户列表（先删除后新增）
//! - 按上报间隔上报流量、在线设备与主机状态
//! - 对 ACME 证书每日检查续期

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tracing::{debug, info, warn};

use common::protocol::server::NodeInfo;
use common::protocol::user::{OnlineUser, UserInfo};
use common::PanelApi;

use super::cert::CertManager;
use super::core::{node_tag, Core};
use super::limiter::LimitDefaults;
use super::status::HostMonitor;
use super::task::PeriodicTask;

/// 证书续期检查间隔
const CERT_RENEW_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

/// 对比新旧用户列表，返回 (删除, 新增)
///
/// 以 (uuid, 限速) 为键，限速变更表现为一删一增；结果保持输入顺序。
pub fn compare_user_list(old: &[UserInfo], new: &[UserInfo]) -> (Vec<UserInfo>, Vec<UserInfo>) {
    let old_keys: HashSet<(&str, u64)> = old.iter().map(UserInfo::reconcile_key).collect();
    let new_keys: HashSet<(&str, u64)> = new.iter().map(UserInfo::reconcile_key).collect();

    let deleted = old
        .iter()
        .filter(|u| !new_keys.contains(&u.reconcile_key()))
        .cloned()
        .collect();
    let added = new
        .iter()
        .filter(|u| !old_keys.contains(&u.reconcile_key()))
        .cloned()
        .collect();
    (deleted, added)
}

/// 后台任务共享的节点会话
struct Session {
    core: Arc<Core>,
    api: Arc<dyn PanelApi>,
    info: NodeInfo,
    tag: String,
    users: Mutex<Vec<UserInfo>>,
    host: Mutex<HostMonitor>,
}

impl Session {
    fn limiter_defaults(&self) -> LimitDefaults {
        let limit = &self.core.config().limit;
        LimitDefaults {
            speed_limit: limit.speed_limit,
            device_limit: limit.device_limit,
        }
    }

    async fn fetch_alive(&self) -> HashMap<i64, u32> {
        self.api.get_user_alive().await.unwrap_or_else(|e| {
            warn!("[{}] 获取在线设备数失败: {}", self.tag, e);
            HashMap::new()
        })
    }

    /// 对账一次用户列表
    async fn sync_users(&self) -> Result<()> {
        let alive = self.fetch_alive().await;
        let limiter = self.core.limiters().get(&self.tag);
        if let Some(limiter) = &limiter {
            limiter.set_alive(alive);
        }

        let new_users = match self.api.get_user_list().await {
            Ok(Some(users)) => users,
            Ok(None) => {
                debug!("[{}] 用户列表未变更", self.tag);
                return Ok(());
            }
            Err(e) if e.is_transient() => {
                warn!("[{}] 获取用户列表失败，下个周期重试: {}", self.tag, e);
                return Ok(());
            }
            Err(e) => {
                return Err(e).with_context(|| format!("[{}] 获取用户列表失败", self.tag));
            }
        };

        let (deleted, added) = {
            let users = self.users.lock().unwrap_or_else(|e| e.into_inner());
            compare_user_list(&users, &new_users)
        };

        if !deleted.is_empty() || !added.is_empty() {
            if let Err(e) = self.apply_user_diff(&deleted, &added) {
                // 保留旧列表并丢弃条件请求缓存，下次拉取完整列表重试
                self.api.invalidate_user_cache();
                return Err(e);
            }
            info!(
                "[{}] 删除 {} 个用户，新增 {} 个用户",
                self.tag,
                deleted.len(),
                added.len()
            );
        }

        *self.users.lock().unwrap_or_else(|e| e.into_inner()) = new_users;
        Ok(())
    }

    /// 先在引擎中删除再新增，两步都成功后一次性更新限制器
    fn apply_user_diff(&self, deleted: &[UserInfo], added: &[UserInfo]) -> Result<()> {
        if !deleted.is_empty() {
            self.core.del_users(&self.tag, deleted)?;
        }
        if !added.is_empty() {
            self.core.add_users(&self.tag, &self.info, added)?;
        }
        if let Some(limiter) = self.core.limiters().get(&self.tag) {
            limiter.update_users(added, deleted);
        }
        Ok(())
    }

    /// 上报流量、在线设备与主机状态，单项失败不影响其他上报
    async fn report(&self) -> Result<()> {
        let traffic = self
            .core
            .user_traffic_slice(&self.tag, self.info.traffic_report_threshold);
        if !traffic.is_empty() {
            match self.api.report_user_traffic(&traffic).await {
                Ok(()) => info!("[{}] 已上报 {} 个用户的流量", self.tag, traffic.len()),
                Err(e) => warn!("[{}] 上报用户流量失败: {}", self.tag, e),
            }
        }

        // 本周期上报流量为 0 的用户不计入在线
        let idle: HashSet<i64> = traffic
            .iter()
            .filter(|t| t.total() == 0)
            .map(|t| t.uid)
            .collect();
        let devices = self
            .core
            .limiters()
            .get(&self.tag)
            .map(|l| l.online_devices())
            .unwrap_or_default();
        if !devices.is_empty() {
            let online: Vec<OnlineUser> = devices
                .iter()
                .filter(|d| !idle.contains(&d.uid))
                .cloned()
                .collect();
            match self.api.report_online_users(&online).await {
                Ok(()) => info!(
                    "[{}] 在线设备 {} 个，已上报 {} 个",
                    self.tag,
                    devices.len(),
                    online.len()
                ),
                Err(e) => warn!("[{}] 上报在线设备失败: {}", self.tag, e),
            }
        }

        let status = self
            .host
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .collect();
        if let Err(e) = self.api.report_node_status(&status).await {
            warn!("[{}] 上报主机状态失败: {}", self.tag, e);
        }
        Ok(())
    }
}

pub struct Controller {
    session: Arc<Session>,
    cert: Option<Arc<CertManager>>,
    tasks: Vec<PeriodicTask>,
}

impl Controller {
    pub fn new(core: Arc<Core>, api: Arc<dyn PanelApi>, info: NodeInfo) -> Self {
        let tag = node_tag(api.api_host(), info.kind, info.id);
        Self {
            session: Arc::new(Session {
                core,
                api,
                info,
                tag,
                users: Mutex::new(Vec::new()),
                host: Mutex::new(HostMonitor::new()),
            }),
            cert: None,
            tasks: Vec::new(),
        }
    }

    pub fn tag(&self) -> &str {
        &self.session.tag
    }

    /// 启动节点，任一步骤失败时撤销已完成的注册并返回错误
    pub async fn start(&mut self) -> Result<()> {
        let s = self.session.clone();

        let users = s
            .api
            .get_user_list()
            .await
            .with_context(|| format!("[{}] 获取用户列表失败", s.tag))?
            .unwrap_or_default();
        if users.is_empty() {
            bail!("[{}] 面板未返回任何用户", s.tag);
        }
        let alive = s.fetch_alive().await;

        s.core
            .limiters()
            .add(&s.tag, &users, alive, s.limiter_defaults());

        if let Err(e) = self.register(&users).await {
            s.core.limiters().delete(&s.tag);
            return Err(e);
        }

        info!("[{}] 节点已启动: {} 个用户", s.tag, users.len());
        *s.users.lock().unwrap_or_else(|e| e.into_inner()) = users;
        self.start_tasks();
        Ok(())
    }

    async fn register(&mut self, users: &[UserInfo]) -> Result<()> {
        let s = &self.session;

        if s.info.requires_tls() {
            let cert = CertManager::new(&s.info, &s.core.config().cert)
                .with_context(|| format!("[{}] 证书配置无效", s.tag))?;
            cert.ensure()
                .await
                .with_context(|| format!("[{}] 获取证书失败", s.tag))?;
            self.cert = Some(Arc::new(cert));
        }

        s.core.add_node(&s.tag, &s.info)?;
        if let Err(e) = s.core.add_users(&s.tag, &s.info, users) {
            if let Err(rollback) = s.core.del_node(&s.tag) {
                warn!("[{}] 回滚监听器失败: {:#}", s.tag, rollback);
            }
            return Err(e);
        }
        Ok(())
    }

    fn start_tasks(&mut self) {
        let s = self.session.clone();

        let session = s.clone();
        let mut sync = PeriodicTask::new(
            format!("{} user_sync", s.tag),
            Duration::from_secs(s.info.pull_interval),
            move || {
                let session = session.clone();
                async move { session.sync_users().await }
            },
        );
        sync.start(true);
        self.tasks.push(sync);

        let session = s.clone();
        let mut report = PeriodicTask::new(
            format!("{} report", s.tag),
            Duration::from_secs(s.info.push_interval),
            move || {
                let session = session.clone();
                async move { session.report().await }
            },
        );
        report.start(true);
        self.tasks.push(report);

        if let Some(cert) = self.cert.clone().filter(|c| c.needs_renewal_task()) {
            let tag = s.tag.clone();
            let mut renew = PeriodicTask::new(
                format!("{} cert_renew", s.tag),
                CERT_RENEW_INTERVAL,
                move || {
                    let cert = cert.clone();
                    let tag = tag.clone();
                    async move {
                        cert.renew_if_due()
                            .await
                            .with_context(|| format!("[{}] 证书续期失败", tag))?;
                        Ok(())
                    }
                },
            );
            renew.start(true);
            self.tasks.push(renew);
            info!("[{}] 证书续期任务已启动", s.tag);
        }
    }

    /// 停止后台任务，释放限制器并注销监听器
    pub async fn close(&mut self) -> Result<()> {
        for task in &mut self.tasks {
            task.close();
        }
        self.tasks.clear();

        let s = &self.session;
        s.core.limiters().delete(&s.tag);
        s.core.del_node(&s.tag)?;
        info!("[{}] 节点已关闭", s.tag);
        Ok(())
    }

    #[cfg(test)]
    async fn sync_users(&self) -> Result<()> {
        self.session.sync_users().await
    }

    #[cfg(test)]
    async fn report(&self) -> Result<()> {
        self.session.report().await
    }
}
